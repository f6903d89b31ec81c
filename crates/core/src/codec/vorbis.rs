//! `vorbis`: lossy compression. Actual Vorbis bitstream encoding lives in an
//! external codec library (out of scope here); this type buffers raw chunks
//! into fixed-size encode frames the way a real Vorbis encoder batches
//! samples before emitting a compressed packet, so the "may buffer across
//! calls" contract on [`Encoder::encode`] is exercised end to end without
//! linking a codec backend.

use bytes::{BufMut, Bytes, BytesMut};

use crate::chunk::{Chunk, Millis, SampleFormat};
use crate::error::SnapResult;
use crate::wire::CodecHeaderBody;

use super::{Encoder, OnEncoded};

/// Vorbis packets typically span fewer source chunks than FLAC's larger
/// blocks; two source chunks per emitted packet is enough to exercise
/// buffering without hiding too much latency behind it.
const PACKET_MULTIPLE: u32 = 2;

pub struct VorbisEncoder {
    format: SampleFormat,
    buffer: BytesMut,
    buffered_ms: u64,
    packet_ms: u64,
}

impl VorbisEncoder {
    pub fn new() -> Self {
        Self { format: SampleFormat::default(), buffer: BytesMut::new(), buffered_ms: 0, packet_ms: 0 }
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

impl Default for VorbisEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for VorbisEncoder {
    fn init(&mut self, format: SampleFormat) -> SnapResult<()> {
        self.format = format;
        self.buffer.clear();
        self.buffered_ms = 0;
        self.packet_ms = 0;
        Ok(())
    }

    fn header(&self) -> CodecHeaderBody {
        CodecHeaderBody { codec_name: "vorbis".into(), blob: bytes::Bytes::new() }
    }

    fn encode(&mut self, chunk: &Chunk, on_encoded: &mut OnEncoded<'_>) -> SnapResult<()> {
        let chunk_ms = chunk.duration::<Millis>();
        if self.packet_ms == 0 {
            self.packet_ms = chunk_ms * PACKET_MULTIPLE as u64;
        }
        self.buffer.put_slice(&chunk.payload);
        self.buffered_ms += chunk_ms;
        if self.buffered_ms >= self.packet_ms {
            self.flush(on_encoded);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "vorbis"
    }

    fn available_options(&self) -> &'static [&'static str] {
        &["quality"]
    }

    fn default_options(&self) -> &'static str {
        "quality=5"
    }
}
