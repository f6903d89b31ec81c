//! `pcm`: the identity decoder. Recovers the sample format from the header
//! blob [`crate::codec::pcm::PcmEncoder`] writes.

use bytes::Bytes;

use crate::chunk::SampleFormat;
use crate::codec::parse_pcm_header;
use crate::error::SnapResult;
use crate::wire::CodecHeaderBody;

use super::Decoder;

pub struct PcmDecoder {
    format: SampleFormat,
}

impl PcmDecoder {
    pub fn new() -> Self {
        Self { format: SampleFormat::default() }
    }
}

impl Default for PcmDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PcmDecoder {
    fn set_header(&mut self, header: &CodecHeaderBody) -> SnapResult<SampleFormat> {
        self.format = parse_pcm_header(&header.blob)?;
        Ok(self.format)
    }

    fn decode(&mut self, _payload: &mut Bytes) -> SnapResult<bool> {
        Ok(true)
    }

    fn name(&self) -> &'static str {
        "pcm"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Encoder, PcmEncoder};

    #[test]
    fn set_header_recovers_format_from_encoder_header() {
        let format = SampleFormat::new(44100, 24, 2);
        let mut enc = PcmEncoder::new();
        enc.init(format).unwrap();
        let header = enc.header();

        let mut dec = PcmDecoder::new();
        let recovered = dec.set_header(&header).unwrap();
        assert_eq!(recovered, format);
    }

    #[test]
    fn decode_is_identity() {
        let mut dec = PcmDecoder::new();
        let mut payload = Bytes::from_static(&[1, 2, 3, 4]);
        assert!(dec.decode(&mut payload).unwrap());
        assert_eq!(payload.as_ref(), &[1, 2, 3, 4]);
    }
}
