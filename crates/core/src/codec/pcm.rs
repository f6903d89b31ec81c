//! `pcm`: the identity codec. Header is the sample-format triple, big-endian,
//! prefixed with a magic string so a naive decoder can sanity-check it.

use bytes::{BufMut, BytesMut};

use crate::chunk::{Chunk, Millis, SampleFormat};
use crate::error::SnapResult;
use crate::wire::CodecHeaderBody;

use super::{Encoder, OnEncoded};

const MAGIC: &[u8; 4] = b"PCM\0";

pub struct PcmEncoder {
    format: SampleFormat,
}

impl PcmEncoder {
    pub fn new() -> Self {
        Self { format: SampleFormat::default() }
    }
}

impl Default for PcmEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for PcmEncoder {
    fn init(&mut self, format: SampleFormat) -> SnapResult<()> {
        self.format = format;
        Ok(())
    }

    fn header(&self) -> CodecHeaderBody {
        let mut blob = BytesMut::new();
        blob.put_slice(MAGIC);
        blob.put_u32(self.format.rate_hz);
        blob.put_u16(self.format.bits_per_sample);
        blob.put_u16(self.format.channels);
        CodecHeaderBody { codec_name: "pcm".into(), blob: blob.freeze() }
    }

    fn encode(&mut self, chunk: &Chunk, on_encoded: &mut OnEncoded<'_>) -> SnapResult<()> {
        on_encoded(chunk.payload.clone(), chunk.duration::<Millis>());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "pcm"
    }

    fn available_options(&self) -> &'static [&'static str] {
        &[]
    }

    fn default_options(&self) -> &'static str {
        ""
    }
}

/// Parses a `pcm` codec header blob, recovering the sample format.
pub fn parse_pcm_header(blob: &[u8]) -> SnapResult<SampleFormat> {
    use bytes::Buf;
    if blob.len() < 12 || &blob[..4] != MAGIC {
        return Err(crate::error::SnapError::Protocol("invalid pcm codec header".into()));
    }
    let mut cursor = &blob[4..];
    let rate = cursor.get_u32();
    let bits = cursor.get_u16();
    let channels = cursor.get_u16();
    Ok(SampleFormat::new(rate, bits, channels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TimeVal;
    use bytes::Bytes;

    #[test]
    fn header_round_trips_sample_format() {
        let format = SampleFormat::new(48000, 16, 2);
        let mut enc = PcmEncoder::new();
        enc.init(format).unwrap();
        let header = enc.header();
        assert_eq!(header.codec_name, "pcm");
        let recovered = parse_pcm_header(&header.blob).unwrap();
        assert_eq!(recovered, format);
    }

    #[test]
    fn encode_is_identity() {
        let format = SampleFormat::new(48000, 16, 2);
        let mut enc = PcmEncoder::new();
        enc.init(format).unwrap();
        let chunk = Chunk::new(format, TimeVal::ZERO, Bytes::from(vec![1, 2, 3, 4])).unwrap();
        let mut seen = None;
        enc.encode(&chunk, &mut |payload, _ms| seen = Some(payload)).unwrap();
        assert_eq!(seen.unwrap(), chunk.payload);
    }
}
