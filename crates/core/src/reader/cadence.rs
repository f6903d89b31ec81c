//! The timing discipline every byte-stream-backed reader variant shares:
//! wall-clock-paced chunk emission, drift detection/resync, and the
//! starvation/silence state machine (§4.C).

use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::chunk::{Chunk, SampleFormat};
use crate::properties::StreamState;
use crate::protocol_constants::RESYNC_TOLERANCE_MS;
use crate::time::{SteadyClock, TimeVal};

use super::ReaderEvent;

fn ms_to_timeval(ms: i64) -> TimeVal {
    TimeVal::new((ms / 1000) as i32, ((ms % 1000) * 1000) as i32)
}

/// Anchors chunk emission to wall-clock ticks and tracks the per-chunk
/// timestamp discipline of §4.C: strictly `prev + duration` unless a resync
/// event breaks the chain.
pub struct Cadence {
    chunk_duration: Duration,
    next_tick: Option<Instant>,
    timestamp: TimeVal,
}

impl Cadence {
    pub fn new(chunk_duration: Duration) -> Self {
        Self { chunk_duration, next_tick: None, timestamp: TimeVal::ZERO }
    }

    /// Sleeps until this chunk is due, then returns the timestamp it must
    /// carry and, if wall-clock drift exceeded the resync tolerance, the lag
    /// (in milliseconds) that triggered the resync.
    pub async fn advance(&mut self, clock: &SteadyClock) -> (TimeVal, Option<i64>) {
        let Some(scheduled) = self.next_tick else {
            let now = Instant::now();
            self.timestamp = clock.at(now) - ms_to_timeval(self.chunk_duration.as_millis() as i64);
            self.next_tick = Some(now + self.chunk_duration);
            return (self.timestamp, None);
        };

        let now = Instant::now();
        if now < scheduled {
            tokio::time::sleep(scheduled - now).await;
        }
        let now_after = Instant::now();
        let lag = now_after.saturating_duration_since(scheduled);
        let lag_ms = lag.as_millis() as i64;

        if lag_ms > RESYNC_TOLERANCE_MS {
            self.timestamp = clock.at(now_after) - ms_to_timeval(self.chunk_duration.as_millis() as i64);
            self.next_tick = Some(now_after + self.chunk_duration);
            (self.timestamp, Some(lag_ms))
        } else {
            self.timestamp = self.timestamp + ms_to_timeval(self.chunk_duration.as_millis() as i64);
            self.next_tick = Some(scheduled + self.chunk_duration);
            (self.timestamp, None)
        }
    }
}

/// Parameters controlling the starvation/silence policy of §4.C, bundled so
/// every byte-stream variant constructs the loop identically.
#[derive(Debug, Clone, Copy)]
pub struct ReaderParams {
    pub format: SampleFormat,
    pub chunk_ms: u32,
    pub dryout_ms: u64,
    pub idle_threshold_ms: u64,
    pub silence_threshold: i64,
}

/// Drives the shared read loop for any byte-stream source (pipe, file,
/// process stdout, TCP socket): reads up to one chunk's worth of bytes per
/// tick, zero-fills any shortfall as silence, applies the drift/resync and
/// starvation/idle policies, and emits [`ReaderEvent`]s on `tx` until
/// `shutdown` fires or the channel closes.
///
/// `on_transient` is called once per change-of-state when the underlying
/// read errors transiently (matching §7's "logged once per change-of-state,
/// retried with fixed backoff"); it does not stop the loop.
pub async fn drive_pcm_reader<R>(
    mut reader: R,
    params: ReaderParams,
    stream_id: String,
    tx: mpsc::Sender<ReaderEvent>,
    shutdown: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let clock = SteadyClock::new();
    let chunk_duration = Duration::from_millis(params.chunk_ms as u64);
    let mut cadence = Cadence::new(chunk_duration);
    let frame_bytes = params.format.bytes_for_duration(params.chunk_ms);
    let mut state = StreamState::Idle;
    let mut silent_run_ms: u64 = 0;
    let mut dried_out = false;

    loop {
        if shutdown.is_cancelled() {
            return;
        }

        let mut buf = vec![0u8; frame_bytes.max(1)];
        let mut filled = 0usize;
        while filled < buf.len() {
            let read_fut = reader.read(&mut buf[filled..]);
            tokio::select! {
                _ = shutdown.cancelled() => return,
                res = tokio::time::timeout(chunk_duration, read_fut) => {
                    match res {
                        Ok(Ok(0)) => break, // EOF: treat the shortfall as silence
                        Ok(Ok(n)) => filled += n,
                        Ok(Err(_)) => break, // read error: treat the shortfall as silence
                        Err(_) => break, // no data within this tick's budget: ditto
                    }
                }
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
            dried_out = false;
        }

        if is_silent && silent_run_ms >= params.dryout_ms {
            // Dried out: drop further silent chunks rather than emitting them.
            if !dried_out {
                dried_out = true;
            }
        } else {
            if tx.send(ReaderEvent::Chunk(chunk)).await.is_err() {
                return;
            }
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_tick_anchors_timestamp_to_now_minus_duration() {
        let mut cadence = Cadence::new(Duration::from_millis(20));
        let clock = SteadyClock::new();
        let (ts, resync) = cadence.advance(&clock).await;
        assert!(resync.is_none());
        assert_eq!(ts, clock.now() - ms_to_timeval(20));
    }

    #[tokio::test(start_paused = true)]
    async fn subsequent_ticks_advance_by_exactly_one_duration() {
        let mut cadence = Cadence::new(Duration::from_millis(20));
        let clock = SteadyClock::new();
        let (first, _) = cadence.advance(&clock).await;
        tokio::time::advance(Duration::from_millis(20)).await;
        let (second, resync) = cadence.advance(&clock).await;
        assert!(resync.is_none());
        assert_eq!(second, first + ms_to_timeval(20));
    }

    #[tokio::test(start_paused = true)]
    async fn large_drift_emits_resync_and_breaks_the_chain() {
        let mut cadence = Cadence::new(Duration::from_millis(20));
        let clock = SteadyClock::new();
        let (first, _) = cadence.advance(&clock).await;
        tokio::time::advance(Duration::from_millis(200)).await;
        let (second, resync) = cadence.advance(&clock).await;
        assert!(resync.is_some());
        assert_ne!(second, first + ms_to_timeval(20));
    }

    #[tokio::test(start_paused = true)]
    async fn small_drift_within_tolerance_does_not_resync() {
        let mut cadence = Cadence::new(Duration::from_millis(20));
        let clock = SteadyClock::new();
        let (first, _) = cadence.advance(&clock).await;
        tokio::time::advance(Duration::from_millis(30)).await;
        let (second, resync) = cadence.advance(&clock).await;
        assert!(resync.is_none());
        assert_eq!(second, first + ms_to_timeval(20));
    }

    #[tokio::test(start_paused = true)]
    async fn drive_pcm_reader_stops_emitting_after_dryout() {
        let (tx, mut rx) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        let format = SampleFormat::new(48000, 16, 2);
        let params = ReaderParams {
            format,
            chunk_ms: 20,
            dryout_ms: 40,
            idle_threshold_ms: 1_000_000,
            silence_threshold: 0,
        };
        let empty = tokio::io::empty();
        let shutdown_clone = shutdown.clone();
        let handle = tokio::spawn(drive_pcm_reader(empty, params, "s".into(), tx, shutdown_clone));

        let mut chunk_count = 0;
        for _ in 0..10 {
            tokio::time::advance(Duration::from_millis(20)).await;
            while let Ok(ev) = rx.try_recv() {
                if matches!(ev, ReaderEvent::Chunk(_)) {
                    chunk_count += 1;
                }
            }
        }
        shutdown.cancel();
        let _ = handle.await;
        // dryout_ms / chunk_ms == 2: at most the first two silent chunks are
        // emitted before the reader starts dropping them.
        assert!(chunk_count <= 2, "expected dryout to suppress chunks, got {chunk_count}");
    }

    /// A reader that never yields a byte and never signals EOF — the shape
    /// of an idle pipe/process source with nothing to read yet, as opposed
    /// to a closed one. `drive_pcm_reader` only ever observes it through the
    /// per-tick `timeout` elapsing.
    struct NeverReady;

    impl AsyncRead for NeverReady {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Pending
        }
    }

    #[tokio::test(start_paused = true)]
    async fn drive_pcm_reader_dries_out_on_idle_source_with_no_eof() {
        let (tx, mut rx) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        let format = SampleFormat::new(48000, 16, 2);
        let params = ReaderParams {
            format,
            chunk_ms: 20,
            dryout_ms: 40,
            idle_threshold_ms: 1_000_000,
            silence_threshold: 0,
        };
        let shutdown_clone = shutdown.clone();
        let handle = tokio::spawn(drive_pcm_reader(NeverReady, params, "s".into(), tx, shutdown_clone));

        let mut chunk_count = 0;
        for _ in 0..10 {
            tokio::time::advance(Duration::from_millis(20)).await;
            while let Ok(ev) = rx.try_recv() {
                if matches!(ev, ReaderEvent::Chunk(_)) {
                    chunk_count += 1;
                }
            }
        }
        shutdown.cancel();
        let _ = handle.await;
        assert!(
            chunk_count <= 2,
            "idle source with no EOF should still dry out after dryout_ms, got {chunk_count}"
        );
    }
}
