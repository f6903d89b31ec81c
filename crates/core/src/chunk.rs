//! Owned PCM chunk buffers and the sample-format model that governs their
//! layout.

use std::collections::HashMap;
use std::sync::OnceLock;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::{SnapError, SnapResult};
use crate::time::TimeVal;

/// Immutable `(rate_hz, bits_per_sample, channels)` triple plus the derived
/// byte width, parsed from `"<rate>:<bits>:<channels>"`.
///
/// The byte count per sample is `ceil(bits/8)`, with the special rule that
/// 24-bit samples are packed into 4 bytes (the ALSA / wire-protocol
/// convention), not 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleFormat {
    pub rate_hz: u32,
    pub bits_per_sample: u16,
    pub channels: u16,
    bytes_per_sample: u16,
}

impl SampleFormat {
    pub fn new(rate_hz: u32, bits_per_sample: u16, channels: u16) -> Self {
        let bytes_per_sample = if bits_per_sample == 24 {
            4
        } else {
            bits_per_sample.div_ceil(8)
        };
        Self { rate_hz, bits_per_sample, channels, bytes_per_sample }
    }

    /// Parses `"<rate>:<bits>:<channels>"`. Any field may be `*`, which is
    /// represented by `None` in the returned tuple and resolved by the caller
    /// against a source's native format.
    pub fn parse(s: &str) -> SnapResult<(Option<u32>, Option<u16>, Option<u16>)> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(SnapError::InvalidArgument(format!(
                "sample format '{s}' must have 3 colon-separated fields"
            )));
        }
        let parse_field = |f: &str| -> SnapResult<Option<u32>> {
            if f == "*" {
                Ok(None)
            } else {
                f.parse::<u32>()
                    .map(Some)
                    .map_err(|_| SnapError::InvalidArgument(format!("invalid sample format field '{f}'")))
            }
        };
        let rate = parse_field(parts[0])?;
        let bits = parse_field(parts[1])?.map(|v| v as u16);
        let channels = parse_field(parts[2])?.map(|v| v as u16);
        Ok((rate, bits, channels))
    }

    #[inline]
    pub const fn bytes_per_sample(&self) -> usize {
        self.bytes_per_sample as usize
    }

    /// `channels * bytes_per_sample`: the size of one frame (one sample per
    /// channel), in bytes.
    #[inline]
    pub fn frame_size(&self) -> usize {
        self.channels as usize * self.bytes_per_sample()
    }

    /// Number of frames a buffer of `duration_ms` occupies at this rate.
    #[inline]
    pub fn frames_for_duration(&self, duration_ms: u32) -> usize {
        ((self.rate_hz as u64 * duration_ms as u64) / 1000) as usize
    }

    /// Byte length of a buffer spanning `duration_ms` at this format.
    #[inline]
    pub fn bytes_for_duration(&self, duration_ms: u32) -> usize {
        self.frames_for_duration(duration_ms) * self.frame_size()
    }

    /// Duration, in milliseconds, of `frames` frames at this rate.
    pub fn frames_to_ms(&self, frames: usize) -> u64 {
        (frames as u64 * 1000) / self.rate_hz.max(1) as u64
    }
}

impl Default for SampleFormat {
    fn default() -> Self {
        Self::new(48000, 16, 2)
    }
}

static SILENCE_CACHE: OnceLock<RwLock<HashMap<usize, Bytes>>> = OnceLock::new();

/// Returns a cached all-zero `Bytes` of `byte_len`, avoiding repeated
/// allocation for repeated silence substitution.
fn cached_silence(byte_len: usize) -> Bytes {
    let cache = SILENCE_CACHE.get_or_init(|| RwLock::new(HashMap::new()));
    if let Some(existing) = cache.read().get(&byte_len) {
        return existing.clone();
    }
    let mut write = cache.write();
    if let Some(existing) = write.get(&byte_len) {
        return existing.clone();
    }
    let silence = Bytes::from(vec![0u8; byte_len]);
    write.insert(byte_len, silence.clone());
    silence
}

/// A duration-bounded slice of PCM, the unit the reader and encoder pass
/// between each other.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub format: SampleFormat,
    pub timestamp: TimeVal,
    pub payload: Bytes,
}

impl Chunk {
    /// Builds a chunk holding `n` frames of silence at `format`, stamped with
    /// `timestamp`. Uses the shared silence cache.
    pub fn silence(format: SampleFormat, frames: usize, timestamp: TimeVal) -> Self {
        let len = frames * format.frame_size();
        Self { format, timestamp, payload: cached_silence(len) }
    }

    /// Builds a chunk from caller-supplied bytes; `payload.len()` must be a
    /// whole number of frames.
    pub fn new(format: SampleFormat, timestamp: TimeVal, payload: Bytes) -> SnapResult<Self> {
        let frame_size = format.frame_size();
        if frame_size == 0 || payload.len() % frame_size != 0 {
            return Err(SnapError::InvalidArgument(format!(
                "payload of {} bytes is not a whole number of {}-byte frames",
                payload.len(),
                frame_size
            )));
        }
        Ok(Self { format, timestamp, payload })
    }

    pub fn frames(&self) -> usize {
        let fs = self.format.frame_size();
        if fs == 0 { 0 } else { self.payload.len() / fs }
    }

    /// Duration of this chunk, in the unit `U` requests.
    pub fn duration<U: DurationUnit>(&self) -> u64 {
        U::from_ms(self.format.frames_to_ms(self.frames()))
    }

    /// The chunk's start time on the steady clock (alias for `timestamp`,
    /// kept distinct for call-site clarity next to `duration()`).
    pub fn start_time(&self) -> TimeVal {
        self.timestamp
    }

    /// `timestamp + duration`, the timestamp the next contiguous chunk must
    /// carry under invariant 3 (strictly monotonically increasing
    /// timestamps).
    pub fn end_time(&self) -> TimeVal {
        let ms = self.duration::<Millis>();
        self.timestamp
            + TimeVal::new((ms / 1000) as i32, ((ms % 1000) * 1000) as i32)
    }

    /// Silence test. With `threshold == 0`, byte-equality to an all-zero
    /// buffer; otherwise every sample (interpreted as a signed integer of
    /// `bits_per_sample` width) must have `|sample| <= threshold`.
    pub fn is_silent(&self, threshold: i64) -> bool {
        if threshold == 0 {
            return self.payload.iter().all(|&b| b == 0);
        }
        let bytes_per_sample = self.format.bytes_per_sample();
        if bytes_per_sample == 0 {
            return true;
        }
        self.payload.chunks_exact(bytes_per_sample).all(|sample_bytes| {
            signed_sample(sample_bytes, self.format.bits_per_sample).abs() <= threshold
        })
    }
}

fn signed_sample(bytes: &[u8], bits: u16) -> i64 {
    // Samples are little-endian, sign-extended from `bits` significant bits
    // regardless of container width (e.g. 24-in-32 packing).
    let mut raw: i64 = 0;
    for (i, &b) in bytes.iter().enumerate() {
        raw |= (b as i64) << (8 * i);
    }
    let shift = 64 - bits as u32;
    (raw << shift) >> shift
}

/// Unit tag for [`Chunk::duration`].
pub trait DurationUnit {
    fn from_ms(ms: u64) -> u64;
}

pub struct Millis;
impl DurationUnit for Millis {
    fn from_ms(ms: u64) -> u64 {
        ms
    }
}

pub struct Micros;
impl DurationUnit for Micros {
    fn from_ms(ms: u64) -> u64 {
        ms * 1000
    }
}
