//! `alsa://`, `jack://`, `pipewire://` readers: device-backed capture.
//!
//! Audio device backends are explicitly out of scope (§1: "the
//! core consumes a *renderer* trait" — the same boundary applies symmetrically
//! to capture). [`DeviceCapture`] is the seam a platform crate implements;
//! this module only provides the shared cadence loop and a capture-less
//! fallback so the URI scheme is still a constructible, well-behaved variant
//! without pulling in ALSA/JACK/PipeWire bindings.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::chunk::Chunk;
use crate::error::SnapResult;
use crate::properties::StreamState;
use crate::uri::StreamUri;

use super::cadence::{Cadence, ReaderParams};
use super::{ReaderEvent, ReaderHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Alsa,
    Jack,
    Pipewire,
}

impl DeviceKind {
    fn label(self) -> &'static str {
        match self {
            DeviceKind::Alsa => "alsa",
            DeviceKind::Jack => "jack",
            DeviceKind::Pipewire => "pipewire",
        }
    }
}

/// External capture collaborator: produces one chunk's worth of frames per
/// call, or `Ok(0)` to signal "no data available right now" (silence fill,
/// same starvation policy as every other reader).
#[async_trait]
pub trait DeviceCapture: Send {
    async fn capture(&mut self, buf: &mut [u8]) -> SnapResult<usize>;
}

/// No platform backend wired up: always reports silence. A real deployment
/// replaces this with a crate-provided [`DeviceCapture`] for the requested
/// device string (`uri.get("device")`).
pub struct UnavailableCapture;

#[async_trait]
impl DeviceCapture for UnavailableCapture {
    async fn capture(&mut self, _buf: &mut [u8]) -> SnapResult<usize> {
        Ok(0)
    }
}

pub fn spawn(
    stream_id: String,
    kind: DeviceKind,
    uri: &StreamUri,
    params: ReaderParams,
) -> SnapResult<(ReaderHandle, mpsc::Receiver<ReaderEvent>)> {
    let device = uri.get_or("device", "default");
    log::warn!(
        "{} device capture for '{device}' is not implemented in this crate (out of scope per §1); \
         emitting silence until a DeviceCapture backend is wired up",
        kind.label()
    );
    Ok(spawn_with_capture(stream_id, Box::new(UnavailableCapture), params))
}

/// Drives the shared cadence loop over any [`DeviceCapture`] implementation.
/// Exposed so a platform crate can plug in a real backend without
/// reimplementing the timing discipline.
pub fn spawn_with_capture(
    stream_id: String,
    mut capture: Box<dyn DeviceCapture>,
    params: ReaderParams,
) -> (ReaderHandle, mpsc::Receiver<ReaderEvent>) {
    let (tx, rx) = mpsc::channel(64);
    let shutdown = CancellationToken::new();
    let shutdown_task = shutdown.clone();

    let task = tokio::spawn(async move {
        let clock = crate::time::SteadyClock::new();
        let mut cadence = Cadence::new(std::time::Duration::from_millis(params.chunk_ms as u64));
        let frame_bytes = params.format.bytes_for_duration(params.chunk_ms);
        let mut state = StreamState::Idle;
        let mut silent_run_ms: u64 = 0;

        loop {
            if shutdown_task.is_cancelled() {
                return;
            }
            let mut buf = vec![0u8; frame_bytes.max(1)];
            match capture.capture(&mut buf).await {
                Ok(_) => {}
                Err(err) => {
                    log::debug!("{} device capture for stream '{stream_id}' transient error: {err}", "device");
                }
            }

            let (timestamp, resync_lag) = cadence.advance(&clock).await;
            if let Some(lag_ms) = resync_lag {
                let _ = tx.send(ReaderEvent::Resync { lag_ms }).await;
            }

            let chunk = Chunk::new(params.format, timestamp, Bytes::from(buf)).expect("frame-aligned by construction");
            let is_silent = chunk.is_silent(params.silence_threshold);
            if is_silent {
                silent_run_ms += params.chunk_ms as u64;
            } else {
                silent_run_ms = 0;
            }

            if tx.send(ReaderEvent::Chunk(chunk)).await.is_err() {
                return;
            }

            let new_state = if !is_silent {
                StreamState::Playing
            } else if silent_run_ms >= params.idle_threshold_ms {
                StreamState::Idle
            } else {
                state
            };
            if new_state != state {
                state = new_state;
                let _ = tx.send(ReaderEvent::StateChanged(state)).await;
            }
        }
    });

    (ReaderHandle::new(shutdown, task), rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::SampleFormat;

    #[tokio::test(start_paused = true)]
    async fn unavailable_capture_emits_silent_chunks() {
        let params = ReaderParams {
            format: SampleFormat::new(48000, 16, 2),
            chunk_ms: 20,
            dryout_ms: 2000,
            idle_threshold_ms: 100,
            silence_threshold: 0,
        };
        let (handle, mut rx) = spawn_with_capture("s".into(), Box::new(UnavailableCapture), params);
        tokio::time::advance(std::time::Duration::from_millis(20)).await;
        let ev = rx.recv().await.unwrap();
        match ev {
            ReaderEvent::Chunk(chunk) => assert!(chunk.is_silent(0)),
            other => panic!("expected a chunk, got {other:?}"),
        }
        handle.stop().await;
    }
}
