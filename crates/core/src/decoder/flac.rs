//! `flac`: actual FLAC bitstream decoding lives in an external codec library
//! (out of scope here, mirroring [`crate::codec::FlacEncoder`]); this type
//! forwards chunks unchanged so the client's resync/buffering logic can be
//! exercised end-to-end without linking a codec backend.

use bytes::Bytes;

use crate::chunk::SampleFormat;
use crate::error::SnapResult;
use crate::wire::CodecHeaderBody;

use super::Decoder;

pub struct FlacDecoder {
    format: SampleFormat,
}

impl FlacDecoder {
    pub fn new() -> Self {
        Self { format: SampleFormat::default() }
    }
}

impl Default for FlacDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FlacDecoder {
    fn set_header(&mut self, _header: &CodecHeaderBody) -> SnapResult<SampleFormat> {
        Ok(self.format)
    }

    fn decode(&mut self, _payload: &mut Bytes) -> SnapResult<bool> {
        Ok(true)
    }

    fn name(&self) -> &'static str {
        "flac"
    }
}
