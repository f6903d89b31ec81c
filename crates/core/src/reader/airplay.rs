//! `airplay://` reader: wraps an external `shairport-sync` process and its
//! metadata pipe. Audio itself flows through the shared cadence loop like
//! any other process-backed reader; this module owns the *metadata*
//! subreader, which is specific to Airplay.
//!
//! Grounded in `original_source/server/streamreader/airplay_stream.cpp`'s
//! `parseMetadata`/element handlers: `shairport-sync` writes an XML-framed
//! `<item><type>…</type><code>…</code><length>…</length><data>…</data></item>`
//! stream to a named pipe. Items accumulate into a pending [`Metadata`]
//! record until either an `ssnc`/`mden` ("metadata end") or `ssnc`/`pcen`
//! ("picture end") boundary is seen, at which point a [`ReaderEvent::PropertiesChanged`]
//! is emitted — §9's "best-effort: emit on either end marker" reading.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::SnapResult;
use crate::properties::{Metadata, PlaybackStatus, Properties};
use crate::uri::StreamUri;

use super::cadence::ReaderParams;
use super::process;
use super::{ReaderEvent, ReaderHandle};

/// One `<item>` from the metadata pipe, accumulated field-by-field as its
/// child elements are seen.
#[derive(Debug, Default)]
struct PendingItem {
    item_type: String,
    code: String,
    data: Vec<u8>,
}

/// Tracks metadata accumulated across a run of items until a boundary marker
/// flushes it.
#[derive(Debug, Default)]
struct MetadataAccumulator {
    title: Option<String>,
    artist: Option<String>,
    album: Option<String>,
    art_data: Option<Vec<u8>>,
    dirty: bool,
}

impl MetadataAccumulator {
    fn apply(&mut self, item: &PendingItem) {
        if item.item_type == "core" && item.code == "asal" {
            self.album = Some(String::from_utf8_lossy(&item.data).into_owned());
            self.dirty = true;
        } else if item.item_type == "core" && item.code == "asar" {
            self.artist = Some(String::from_utf8_lossy(&item.data).into_owned());
            self.dirty = true;
        } else if item.item_type == "core" && item.code == "minm" {
            self.title = Some(String::from_utf8_lossy(&item.data).into_owned());
            self.dirty = true;
        } else if item.item_type == "ssnc" && item.code == "PICT" && !item.data.is_empty() {
            // Cover art arrives as raw image bytes, never base64-decoded by
            // this reader (§4.C).
            self.art_data = Some(item.data.clone());
            self.dirty = true;
        }
    }

    fn is_boundary(item: &PendingItem) -> bool {
        item.item_type == "ssnc" && (item.code == "mden" || item.code == "pcen")
    }

    fn to_properties(&self) -> Properties {
        let mut props = Properties { playback_status: PlaybackStatus::Playing, ..Properties::default() };
        props.metadata = Some(Metadata {
            title: self.title.clone(),
            artist: self.artist.clone().map(|a| vec![a]),
            album: self.album.clone(),
            art_data: self.art_data.clone(),
            ..Default::default()
        });
        props
    }
}

/// Very small line-oriented parser for shairport-sync's metadata pipe
/// format. Each `<item>...</item>` is assumed to arrive as a contiguous
/// run of lines (true in practice: shairport-sync flushes per item).
fn extract_tag<'a>(line: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    let start = line.find(&open)?;
    let after_open_tag = line[start..].find('>')? + start + 1;
    let end = line[after_open_tag..].find(&close)? + after_open_tag;
    Some(&line[after_open_tag..end])
}

fn decode_hex(s: &str) -> Vec<u8> {
    // shairport-sync encodes <data> as hex, not base64, in its default
    // pipe mode; this reader accepts either and otherwise treats the
    // payload as literal UTF-8 bytes.
    if s.len() % 2 == 0 && s.chars().all(|c| c.is_ascii_hexdigit()) && !s.is_empty() {
        let mut out = Vec::with_capacity(s.len() / 2);
        let bytes = s.as_bytes();
        for chunk in bytes.chunks(2) {
            if let Ok(pair) = std::str::from_utf8(chunk) {
                if let Ok(byte) = u8::from_str_radix(pair, 16) {
                    out.push(byte);
                    continue;
                }
            }
            return s.as_bytes().to_vec();
        }
        out
    } else {
        s.as_bytes().to_vec()
    }
}

async fn pump_metadata_pipe(
    path: String,
    stream_id: String,
    tx: mpsc::Sender<ReaderEvent>,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(err) => {
                log::debug!("airplay metadata pipe '{path}' not yet readable ({err})");
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(std::time::Duration::from_millis(
                        crate::protocol_constants::READER_RETRY_BACKOFF_MS,
                    )) => {}
                }
                continue;
            }
        };

        let mut lines = BufReader::new(file).lines();
        let mut accumulator = MetadataAccumulator::default();
        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => return,
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(l)) => l,
                Ok(None) => break,
                Err(_) => break,
            };
            if !line.contains("<item>") {
                continue;
            }
            let item_type = extract_tag(&line, "type").unwrap_or("").to_string();
            let code = extract_tag(&line, "code").unwrap_or("").to_string();
            let data = extract_tag(&line, "data").map(decode_hex).unwrap_or_default();
            let item = PendingItem { item_type, code, data };

            accumulator.apply(&item);
            if MetadataAccumulator::is_boundary(&item) && accumulator.dirty {
                let props = accumulator.to_properties();
                if tx.send(ReaderEvent::PropertiesChanged(props)).await.is_err() {
                    return;
                }
                log::debug!("airplay stream '{stream_id}' flushed metadata at boundary '{}'", item.code);
                accumulator.dirty = false;
            }
        }
    }
}

/// Spawns the underlying `shairport-sync` process (reusing the generic
/// `process://` reader for the audio path) plus a metadata-pipe pump task.
/// The metadata pipe path is the `meta` query key; absent, metadata support
/// is simply not started.
pub fn spawn(
    stream_id: String,
    uri: &StreamUri,
    params: ReaderParams,
) -> SnapResult<(ReaderHandle, mpsc::Receiver<ReaderEvent>)> {
    let (handle, rx) = process::spawn(stream_id.clone(), uri, params)?;

    if let Some(meta_path) = uri.get("meta") {
        // The metadata pipe carries XML framing, not raw PCM, so it gets its
        // own shutdown token and task rather than joining the cadence loop.
        let shutdown = CancellationToken::new();
        let meta_path = meta_path.to_string();
        let stream_id = stream_id.clone();
        // Tap the same event channel the audio path writes to, so the
        // stream sees metadata and chunks on one ordered queue.
        let (tap_tx, tap_rx) = mpsc::channel(32);
        let forwarding_shutdown = shutdown.clone();
        tokio::spawn(pump_metadata_pipe(meta_path, stream_id, tap_tx, forwarding_shutdown));
        return Ok((handle, merge_channels(rx, tap_rx)));
    }

    Ok((handle, rx))
}

/// Merges the audio-path event channel with the metadata-pipe tap into one
/// receiver, preserving per-source ordering (the ordering guarantees
/// are per-producer; a meta pump and an audio pump are independent
/// producers, same as two readers feeding a meta stream).
fn merge_channels(mut audio: mpsc::Receiver<ReaderEvent>, mut meta: mpsc::Receiver<ReaderEvent>) -> mpsc::Receiver<ReaderEvent> {
    let (tx, rx) = mpsc::channel(128);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                ev = audio.recv() => match ev {
                    Some(ev) => if tx.send(ev).await.is_err() { return },
                    None => return,
                },
                ev = meta.recv() => match ev {
                    Some(ev) => if tx.send(ev).await.is_err() { return },
                    None => {}
                },
            }
        }
    });
    rx
}
