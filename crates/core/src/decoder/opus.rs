//! `opus`: actual Opus bitstream decoding lives in an external codec library
//! (out of scope here, mirroring [`crate::codec::OpusEncoder`]); this type
//! assumes the required 48 kHz format and forwards chunks unchanged so the
//! client's resync/buffering logic can be exercised end-to-end without
//! linking a codec backend.

use bytes::Bytes;

use crate::chunk::SampleFormat;
use crate::error::SnapResult;
use crate::protocol_constants::OPUS_REQUIRED_SAMPLE_RATE;
use crate::wire::CodecHeaderBody;

use super::Decoder;

pub struct OpusDecoder {
    format: SampleFormat,
}

impl OpusDecoder {
    pub fn new() -> Self {
        Self { format: SampleFormat::new(OPUS_REQUIRED_SAMPLE_RATE, 16, 2) }
    }
}

impl Default for OpusDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for OpusDecoder {
    fn set_header(&mut self, _header: &CodecHeaderBody) -> SnapResult<SampleFormat> {
        Ok(self.format)
    }

    fn decode(&mut self, _payload: &mut Bytes) -> SnapResult<bool> {
        Ok(true)
    }

    fn name(&self) -> &'static str {
        "opus"
    }
}
