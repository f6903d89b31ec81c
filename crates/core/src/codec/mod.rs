//! Encoder pipeline: converts raw PCM chunks into codec chunks, emitting a
//! codec header once per session and zero or more encoded chunks per input.

mod flac;
mod null;
mod opus;
mod pcm;
mod vorbis;

pub use flac::FlacEncoder;
pub use null::NullEncoder;
pub use opus::OpusEncoder;
pub use pcm::{parse_pcm_header, PcmEncoder};
pub use vorbis::VorbisEncoder;

use bytes::Bytes;

use crate::chunk::{Chunk, SampleFormat};
use crate::error::SnapResult;
use crate::wire::CodecHeaderBody;

/// Callback invoked once per encoded chunk. `duration_ms` reflects the
/// *encoded* payload's duration, which may differ from the input chunk's
/// duration for codecs that buffer across calls (FLAC, Vorbis).
pub type OnEncoded<'a> = dyn FnMut(Bytes, u64) + 'a;

/// Capability trait every built-in codec implements.
pub trait Encoder: Send {
    /// Initializes the encoder for `format`. Called once before the first
    /// `encode()` call and again whenever the stream's sample format changes.
    fn init(&mut self, format: SampleFormat) -> SnapResult<()>;

    /// The codec header sent once to every new session bound to this stream.
    fn header(&self) -> CodecHeaderBody;

    /// Encodes `chunk`, invoking `on_encoded` zero or more times. May buffer
    /// input across calls.
    fn encode(&mut self, chunk: &Chunk, on_encoded: &mut OnEncoded<'_>) -> SnapResult<()>;

    fn name(&self) -> &'static str;
    fn available_options(&self) -> &'static [&'static str];
    fn default_options(&self) -> &'static str;
}

/// Constructs the built-in encoder named by `codec_name`, per the
/// `codec=<name>` source URI key.
pub fn make_encoder(codec_name: &str) -> SnapResult<Box<dyn Encoder>> {
    match codec_name {
        "pcm" => Ok(Box::new(PcmEncoder::new())),
        "opus" => Ok(Box::new(OpusEncoder::new())),
        "flac" => Ok(Box::new(FlacEncoder::new())),
        "vorbis" => Ok(Box::new(VorbisEncoder::new())),
        "null" => Ok(Box::new(NullEncoder::new())),
        other => Err(crate::error::SnapError::InvalidArgument(format!("unknown codec '{other}'"))),
    }
}
