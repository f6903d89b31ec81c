//! `opus`: requires a 48 kHz source and a frame size from a fixed set. Actual
//! Opus bitstream compression lives in an external codec library (out of
//! scope here, per the encoder/decoder contract this crate defines); this
//! type enforces the format constraints and forwards chunks through that
//! contract so the timestamp discipline in [`crate::stream`] can be
//! exercised end-to-end without linking a codec backend.

use crate::chunk::{Chunk, Millis, SampleFormat};
use crate::error::{SnapError, SnapResult};
use crate::protocol_constants::{OPUS_FRAME_SIZES_MS_X10, OPUS_REQUIRED_SAMPLE_RATE};
use crate::wire::CodecHeaderBody;

use super::{Encoder, OnEncoded};

pub struct OpusEncoder {
    format: SampleFormat,
}

impl OpusEncoder {
    pub fn new() -> Self {
        Self { format: SampleFormat::default() }
    }

    fn validate_frame_ms(&self, ms: u64) -> SnapResult<()> {
        let ms_x10 = ms.saturating_mul(10);
        if OPUS_FRAME_SIZES_MS_X10.iter().any(|&v| v as u64 == ms_x10) {
            Ok(())
        } else {
            Err(SnapError::InvalidArgument(format!(
                "opus frame size must be one of 2.5/5/10/20/40/60ms, got {ms}ms"
            )))
        }
    }
}

impl Default for OpusEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for OpusEncoder {
    fn init(&mut self, format: SampleFormat) -> SnapResult<()> {
        if format.rate_hz != OPUS_REQUIRED_SAMPLE_RATE {
            return Err(SnapError::InvalidArgument(format!(
                "opus requires a {OPUS_REQUIRED_SAMPLE_RATE}Hz source, got {}Hz",
                format.rate_hz
            )));
        }
        self.format = format;
        Ok(())
    }

    fn header(&self) -> CodecHeaderBody {
        CodecHeaderBody { codec_name: "opus".into(), blob: bytes::Bytes::new() }
    }

    fn encode(&mut self, chunk: &Chunk, on_encoded: &mut OnEncoded<'_>) -> SnapResult<()> {
        self.validate_frame_ms(chunk.duration::<Millis>())?;
        on_encoded(chunk.payload.clone(), chunk.duration::<Millis>());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "opus"
    }

    fn available_options(&self) -> &'static [&'static str] {
        &["bitrate", "complexity"]
    }

    fn default_options(&self) -> &'static str {
        "bitrate=192000"
    }
}
