//! `null`: matching [`crate::codec::NullEncoder`] — this codec must never be
//! played stand-alone.

use bytes::Bytes;

use crate::chunk::SampleFormat;
use crate::error::{SnapError, SnapResult};
use crate::wire::CodecHeaderBody;

use super::Decoder;

pub struct NullDecoder;

impl NullDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for NullDecoder {
    fn set_header(&mut self, _header: &CodecHeaderBody) -> SnapResult<SampleFormat> {
        Err(SnapError::InvalidArgument("the null codec must not be played stand-alone".into()))
    }

    fn decode(&mut self, _payload: &mut Bytes) -> SnapResult<bool> {
        Err(SnapError::InvalidArgument("the null codec must not be played stand-alone".into()))
    }

    fn name(&self) -> &'static str {
        "null"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_header_refuses() {
        let mut dec = NullDecoder::new();
        let header = CodecHeaderBody { codec_name: "null".into(), blob: Bytes::new() };
        assert!(dec.set_header(&header).is_err());
    }
}
