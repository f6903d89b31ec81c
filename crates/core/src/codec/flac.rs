//! `flac`: lossless compression. Actual FLAC bitstream encoding lives in an
//! external codec library (out of scope here); this type buffers raw chunks
//! into fixed-size encode frames the way a real FLAC encoder batches samples
//! into frames before emitting a compressed block, so the "may buffer across
//! calls" contract on [`Encoder::encode`] is exercised end to end without
//! linking a codec backend.

use bytes::{BufMut, Bytes, BytesMut};

use crate::chunk::{Chunk, Millis, SampleFormat};
use crate::error::SnapResult;
use crate::wire::CodecHeaderBody;

use super::{Encoder, OnEncoded};

/// Raw milliseconds accumulated per emitted block. A real FLAC encoder picks
/// this based on `--blocksize`; this crate fixes it at four source chunks'
/// worth so the buffering behavior is visible without exposing a new option.
const BLOCK_MULTIPLE: u32 = 4;

pub struct FlacEncoder {
    format: SampleFormat,
    buffer: BytesMut,
    buffered_ms: u64,
    block_ms: u64,
}

impl FlacEncoder {
    pub fn new() -> Self {
        Self { format: SampleFormat::default(), buffer: BytesMut::new(), buffered_ms: 0, block_ms: 0 }
    }

    fn flush(&mut self, on_encoded: &mut OnEncoded<'_>) {
        if self.buffer.is_empty() {
            return;
        }
        let payload = self.buffer.split().freeze();
        let duration_ms = self.buffered_ms;
        self.buffered_ms = 0;
        on_encoded(payload, duration_ms);
    }
}

impl Default for FlacEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for FlacEncoder {
    fn init(&mut self, format: SampleFormat) -> SnapResult<()> {
        self.format = format;
        self.buffer.clear();
        self.buffered_ms = 0;
        self.block_ms = 0;
        Ok(())
    }

    fn header(&self) -> CodecHeaderBody {
        CodecHeaderBody { codec_name: "flac".into(), blob: bytes::Bytes::new() }
    }

    fn encode(&mut self, chunk: &Chunk, on_encoded: &mut OnEncoded<'_>) -> SnapResult<()> {
        let chunk_ms = chunk.duration::<Millis>();
        if self.block_ms == 0 {
            self.block_ms = chunk_ms * BLOCK_MULTIPLE as u64;
        }
        self.buffer.put_slice(&chunk.payload);
        self.buffered_ms += chunk_ms;
        if self.buffered_ms >= self.block_ms {
            self.flush(on_encoded);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "flac"
    }

    fn available_options(&self) -> &'static [&'static str] {
        &["compression_level"]
    }

    fn default_options(&self) -> &'static str {
        "compression_level=5"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TimeVal;

    fn silent_chunk(format: SampleFormat, ms: u32) -> Chunk {
        Chunk::new(format, TimeVal::ZERO, Bytes::from(vec![0u8; format.bytes_for_duration(ms)])).unwrap()
    }

    #[test]
    fn buffers_across_calls_before_emitting() {
        let format = SampleFormat::new(48000, 16, 2);
        let mut enc = FlacEncoder::new();
        enc.init(format).unwrap();

        let mut emitted = Vec::new();
        let chunk = silent_chunk(format, 20);
        for _ in 0..3 {
            enc.encode(&chunk, &mut |payload, ms| emitted.push((payload.len(), ms))).unwrap();
        }
        assert!(emitted.is_empty(), "should not emit before the block is full");

        enc.encode(&chunk, &mut |payload, ms| emitted.push((payload.len(), ms))).unwrap();
        assert_eq!(emitted.len(), 1, "should emit exactly once per full block");
        let (len, ms) = emitted[0];
        assert_eq!(len, chunk.payload.len() * 4);
        assert_eq!(ms, 80);
    }

    #[test]
    fn reinit_clears_buffered_state() {
        let format = SampleFormat::new(48000, 16, 2);
        let mut enc = FlacEncoder::new();
        enc.init(format).unwrap();
        let chunk = silent_chunk(format, 20);
        enc.encode(&chunk, &mut |_, _| {}).unwrap();
        assert!(enc.buffered_ms > 0);
        enc.init(format).unwrap();
        assert_eq!(enc.buffered_ms, 0);
    }
}
