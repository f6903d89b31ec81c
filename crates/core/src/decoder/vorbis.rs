//! `vorbis`: actual Vorbis bitstream decoding lives in an external codec
//! library (out of scope here, mirroring [`crate::codec::VorbisEncoder`]);
//! this type forwards chunks unchanged so the client's resync/buffering
//! logic can be exercised end-to-end without linking a codec backend.

use bytes::Bytes;

use crate::chunk::SampleFormat;
use crate::error::SnapResult;
use crate::wire::CodecHeaderBody;

use super::Decoder;

pub struct VorbisDecoder {
    format: SampleFormat,
}

impl VorbisDecoder {
    pub fn new() -> Self {
        Self { format: SampleFormat::default() }
    }
}

impl Default for VorbisDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for VorbisDecoder {
    fn set_header(&mut self, _header: &CodecHeaderBody) -> SnapResult<SampleFormat> {
        Ok(self.format)
    }

    fn decode(&mut self, _payload: &mut Bytes) -> SnapResult<bool> {
        Ok(true)
    }

    fn name(&self) -> &'static str {
        "vorbis"
    }
}
