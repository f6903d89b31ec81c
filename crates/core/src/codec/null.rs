//! `null`: a codec that means "this stream is never sent stand-alone". It
//! only ever appears as an input to a meta stream, which resamples/forwards
//! the active child's already-decoded PCM rather than this codec's output.

use crate::chunk::{Chunk, SampleFormat};
use crate::error::{SnapError, SnapResult};
use crate::wire::CodecHeaderBody;

use super::{Encoder, OnEncoded};

pub struct NullEncoder;

impl NullEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for NullEncoder {
    fn init(&mut self, _format: SampleFormat) -> SnapResult<()> {
        Ok(())
    }

    fn header(&self) -> CodecHeaderBody {
        CodecHeaderBody { codec_name: "null".into(), blob: bytes::Bytes::new() }
    }

    fn encode(&mut self, _chunk: &Chunk, _on_encoded: &mut OnEncoded<'_>) -> SnapResult<()> {
        Err(SnapError::InvalidArgument(
            "the null codec's stream must not be sent stand-alone".into(),
        ))
    }

    fn name(&self) -> &'static str {
        "null"
    }

    fn available_options(&self) -> &'static [&'static str] {
        &[]
    }

    fn default_options(&self) -> &'static str {
        ""
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TimeVal;
    use bytes::Bytes;

    #[test]
    fn encode_refuses_to_emit() {
        let format = SampleFormat::default();
        let mut enc = NullEncoder::new();
        let chunk = Chunk::new(format, TimeVal::ZERO, Bytes::from(vec![0u8; 4])).unwrap();
        assert!(enc.encode(&chunk, &mut |_, _| {}).is_err());
    }
}
