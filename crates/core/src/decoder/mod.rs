//! Decoder pipeline: the client-side mirror of [`crate::codec`]. Converts
//! codec chunks back into raw PCM for the renderer, per §6's
//! `Decoder` trait.

mod flac;
mod null;
mod opus;
mod pcm;
mod vorbis;

pub use flac::FlacDecoder;
pub use null::NullDecoder;
pub use opus::OpusDecoder;
pub use pcm::PcmDecoder;
pub use vorbis::VorbisDecoder;

use bytes::Bytes;

use crate::chunk::SampleFormat;
use crate::error::SnapResult;
use crate::wire::CodecHeaderBody;

/// Capability trait every built-in decoder implements.
pub trait Decoder: Send {
    /// Consumes the stream's `CodecHeader`, returning the sample format the
    /// renderer and resync logic should assume. May fail on a malformed or
    /// unsupported header.
    fn set_header(&mut self, header: &CodecHeaderBody) -> SnapResult<SampleFormat>;

    /// Decodes one chunk's payload in place. Returns `false` (not an error)
    /// on corrupt input, per §6 — the caller substitutes silence.
    fn decode(&mut self, payload: &mut Bytes) -> SnapResult<bool>;

    fn name(&self) -> &'static str;
}

/// Constructs the built-in decoder matching a `CodecHeader`'s `codec_name`.
pub fn make_decoder(codec_name: &str) -> SnapResult<Box<dyn Decoder>> {
    match codec_name {
        "pcm" => Ok(Box::new(PcmDecoder::new())),
        "opus" => Ok(Box::new(OpusDecoder::new())),
        "flac" => Ok(Box::new(FlacDecoder::new())),
        "vorbis" => Ok(Box::new(VorbisDecoder::new())),
        "null" => Ok(Box::new(NullDecoder::new())),
        other => Err(crate::error::SnapError::InvalidArgument(format!("unknown codec '{other}'"))),
    }
}
