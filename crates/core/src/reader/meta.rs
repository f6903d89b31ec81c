//! `meta` reader: composes an ordered list of child streams, forwarding the
//! currently-active one's chunks (resampled if its format differs from the
//! meta stream's own) and propagating its property changes.
//!
//! Unlike the other variants, a meta reader is not built by
//! [`super::spawn_reader`]: it needs live event channels tapped from sibling
//! streams, which only the stream manager (holding the stream registry) can
//! provide.

use bytes::{BufMut, BytesMut};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::chunk::{Chunk, SampleFormat};
use crate::properties::StreamState;

use super::{ReaderEvent, ReaderHandle};

/// One child stream tapped by a meta reader: its name (for the selection
/// rule's "first" ordering) and the raw event channel its own reader emits.
pub struct ChildStream {
    pub name: String,
    pub events: mpsc::Receiver<ReaderEvent>,
}

/// Composes `children` into one logical reader. `output_format` is the meta
/// stream's own sample format; a child whose format differs is resampled
/// on the fly.
pub struct MetaReader {
    children: Vec<ChildStream>,
    output_format: SampleFormat,
}

impl MetaReader {
    pub fn new(children: Vec<ChildStream>, output_format: SampleFormat) -> Self {
        Self { children, output_format }
    }

    pub fn spawn(self, stream_id: String) -> (ReaderHandle, mpsc::Receiver<ReaderEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        let shutdown_task = shutdown.clone();
        let output_format = self.output_format;
        let child_count = self.children.len();

        // Each child gets its own forwarding task tagging events with the
        // child's index, so the selection loop below only has to read from
        // one channel regardless of how many children there are.
        log::debug!("meta stream '{stream_id}' composing {child_count} child stream(s)");
        let (tagged_tx, mut tagged_rx) = mpsc::channel::<(usize, ReaderEvent)>(64 * child_count.max(1));
        for (idx, mut child) in self.children.into_iter().enumerate() {
            let tagged_tx = tagged_tx.clone();
            let name = child.name.clone();
            tokio::spawn(async move {
                while let Some(ev) = child.events.recv().await {
                    if tagged_tx.send((idx, ev)).await.is_err() {
                        return;
                    }
                }
                log::debug!("meta child '{name}' event channel closed");
            });
        }
        drop(tagged_tx);

        let task = tokio::spawn(async move {
            let mut states = vec![StreamState::Idle; child_count];
            let mut active: usize = 0;

            loop {
                let (idx, ev) = tokio::select! {
                    _ = shutdown_task.cancelled() => return,
                    received = tagged_rx.recv() => match received {
                        Some(v) => v,
                        None => return,
                    },
                };

                match ev {
                    ReaderEvent::Chunk(chunk) => {
                        update_active(&states, &mut active);
                        if idx == active {
                            let resampled = resample(&chunk, output_format);
                            if tx.send(ReaderEvent::Chunk(resampled)).await.is_err() {
                                return;
                            }
                        }
                    }
                    ReaderEvent::StateChanged(state) => {
                        states[idx] = state;
                        update_active(&states, &mut active);
                        if idx == active {
                            let _ = tx.send(ReaderEvent::StateChanged(state)).await;
                        }
                    }
                    ReaderEvent::PropertiesChanged(props) => {
                        if idx == active {
                            let _ = tx.send(ReaderEvent::PropertiesChanged(props)).await;
                        }
                    }
                    ReaderEvent::Resync { lag_ms } => {
                        if idx == active {
                            let _ = tx.send(ReaderEvent::Resync { lag_ms }).await;
                        }
                    }
                }
            }
        });

        (ReaderHandle::new(shutdown, task), rx)
    }
}

/// Selection rule: the first child in `Playing` state, else the first child.
fn update_active(states: &[StreamState], active: &mut usize) {
    if let Some(i) = states.iter().position(|s| *s == StreamState::Playing) {
        *active = i;
    } else {
        *active = 0;
    }
}

/// Best-effort sample-rate conversion (nearest-neighbour) so a meta stream
/// can compose children with different native rates. Bit depth and channel
/// count are assumed to already match the output format; a mismatch there
/// is a configuration error the stream manager should reject earlier.
fn resample(chunk: &Chunk, output_format: SampleFormat) -> Chunk {
    if chunk.format.rate_hz == output_format.rate_hz
        && chunk.format.bits_per_sample == output_format.bits_per_sample
        && chunk.format.channels == output_format.channels
    {
        return Chunk { format: output_format, timestamp: chunk.timestamp, payload: chunk.payload.clone() };
    }

    let frame_size = chunk.format.frame_size();
    let in_frames = chunk.frames();
    if frame_size == 0 || in_frames == 0 {
        return Chunk::silence(output_format, 0, chunk.timestamp);
    }
    let out_frames = ((in_frames as u64 * output_format.rate_hz as u64) / chunk.format.rate_hz.max(1) as u64) as usize;
    let mut out = BytesMut::with_capacity(out_frames * output_format.frame_size());
    for i in 0..out_frames {
        let src_frame = ((i as u64 * chunk.format.rate_hz as u64) / output_format.rate_hz.max(1) as u64) as usize;
        let src_frame = src_frame.min(in_frames.saturating_sub(1));
        let start = src_frame * frame_size;
        out.put_slice(&chunk.payload[start..start + frame_size.min(chunk.payload.len() - start)]);
    }
    Chunk { format: output_format, timestamp: chunk.timestamp, payload: out.freeze() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TimeVal;

    #[test]
    fn resample_identity_when_formats_match() {
        let fmt = SampleFormat::new(48000, 16, 2);
        let chunk = Chunk::silence(fmt, 960, TimeVal::ZERO);
        let out = resample(&chunk, fmt);
        assert_eq!(out.frames(), 960);
    }

    #[test]
    fn resample_scales_frame_count_by_rate_ratio() {
        let in_fmt = SampleFormat::new(44100, 16, 2);
        let out_fmt = SampleFormat::new(48000, 16, 2);
        let chunk = Chunk::silence(in_fmt, 441, TimeVal::ZERO);
        let out = resample(&chunk, out_fmt);
        assert_eq!(out.frames(), 480);
    }

    #[test]
    fn active_selection_prefers_first_playing_child() {
        let mut active = 0;
        update_active(&[StreamState::Idle, StreamState::Playing, StreamState::Idle], &mut active);
        assert_eq!(active, 1);
    }

    #[test]
    fn active_selection_falls_back_to_first_when_all_idle() {
        let mut active = 5;
        update_active(&[StreamState::Idle, StreamState::Idle], &mut active);
        assert_eq!(active, 0);
    }
}
