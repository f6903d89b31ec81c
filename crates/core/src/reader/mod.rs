//! Source readers: the variants selected by a [`crate::uri::StreamUri`]
//! scheme, all sharing the wall-clock-paced read loop contract of §4.C.
//!
//! Modeled as a closed `ReaderKind` enum plus the thin capability surface
//! every variant exposes: `start`, `stop`, and a channel of [`ReaderEvent`]s.
//! The meta variant composes other readers' event streams rather than
//! holding back-pointers to them.

mod airplay;
mod cadence;
mod device;
mod file;
mod librespot;
mod meta;
mod pipe;
mod process;
mod tcp;
mod watchdog;

pub use cadence::{drive_pcm_reader, Cadence, ReaderParams};
pub use meta::{ChildStream, MetaReader};
pub use watchdog::Watchdog;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::chunk::Chunk;
use crate::error::SnapResult;
use crate::properties::{Properties, StreamState};
use crate::uri::{ReaderScheme, StreamUri};

/// Events a running reader emits on its channel. Listeners (a [`crate::stream::Stream`])
/// are notified of state transitions only, never every silent tick.
#[derive(Debug)]
pub enum ReaderEvent {
    Chunk(Chunk),
    Resync { lag_ms: i64 },
    StateChanged(StreamState),
    PropertiesChanged(Properties),
}

/// Handle to a running reader task. Dropping it does not stop the reader —
/// call [`ReaderHandle::stop`] explicitly, matching §3's "destroyed with its
/// stream" lifecycle (the owning `Stream` controls the moment).
pub struct ReaderHandle {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ReaderHandle {
    pub fn new(shutdown: CancellationToken, task: JoinHandle<()>) -> Self {
        Self { shutdown, task }
    }

    /// Signals the reader to stop and waits for its task to drain pending
    /// reads and exit (`stop()` in §3's lifecycle).
    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}

/// Default chunk-level silence/starvation tuning, resolved from a
/// [`StreamUri`]'s query keys with the defaults from §4.C.
pub fn reader_params_from_uri(uri: &StreamUri, format: crate::chunk::SampleFormat) -> SnapResult<ReaderParams> {
    use crate::protocol_constants::{DEFAULT_DRYOUT_MS, DEFAULT_IDLE_THRESHOLD_MS, MIN_CHUNK_MS};

    let chunk_ms = uri.chunk_ms()?.max(MIN_CHUNK_MS);
    let dryout_ms = uri.get_u32("dryout_ms")?.map(|v| v as u64).unwrap_or(DEFAULT_DRYOUT_MS);
    let idle_threshold_ms =
        uri.get_u32("idle_threshold")?.map(|v| v as u64).unwrap_or(DEFAULT_IDLE_THRESHOLD_MS);
    let silence_threshold_percent: f64 = uri.get_or("silence_threshold_percent", "0").parse().unwrap_or(0.0);
    let max_amplitude = (1i64 << (format.bits_per_sample.min(63) - 1)) - 1;
    let silence_threshold = (max_amplitude as f64 * (silence_threshold_percent / 100.0)) as i64;

    Ok(ReaderParams { format, chunk_ms, dryout_ms, idle_threshold_ms, silence_threshold })
}

/// Spawns the reader variant named by `uri.scheme`, returning a handle plus
/// the event channel the owning stream consumes.
///
/// The `meta` scheme is not constructed here: it composes sibling streams
/// and so is built by the stream manager, which holds the registry of
/// streams to draw children from (see [`MetaReader`]).
pub fn spawn_reader(
    stream_id: String,
    uri: &StreamUri,
    format: crate::chunk::SampleFormat,
) -> SnapResult<(ReaderHandle, mpsc::Receiver<ReaderEvent>)> {
    let params = reader_params_from_uri(uri, format)?;
    match uri.scheme {
        ReaderScheme::Pipe => pipe::spawn(stream_id, uri, params),
        ReaderScheme::File => file::spawn(stream_id, uri, params),
        ReaderScheme::Process => process::spawn(stream_id, uri, params),
        ReaderScheme::Tcp => tcp::spawn(stream_id, uri, params),
        ReaderScheme::Airplay => airplay::spawn(stream_id, uri, params),
        ReaderScheme::Librespot => librespot::spawn(stream_id, uri, params),
        ReaderScheme::Spotify => librespot::spawn(stream_id, uri, params),
        ReaderScheme::Alsa => device::spawn(stream_id, device::DeviceKind::Alsa, uri, params),
        ReaderScheme::Jack => device::spawn(stream_id, device::DeviceKind::Jack, uri, params),
        ReaderScheme::Pipewire => device::spawn(stream_id, device::DeviceKind::Pipewire, uri, params),
        ReaderScheme::Meta => Err(crate::error::SnapError::InvalidArgument(
            "meta readers are constructed by the stream manager, not spawn_reader".into(),
        )),
    }
}
