//! `librespot://`/`spotify://` reader: spawns the `librespot` binary and
//! scrapes its stderr for the track-loaded line, same as the process reader
//! scrapes stderr for the watchdog feed.
//!
//! Grounded in `original_source/server/streamreader/librespot_stream.cpp`'s
//! `onStderrMsg`: each stderr line is `[<timestamp> <LEVEL> <source>] <msg>`;
//! a `<Title> (<ms> ms) loaded` message inside `<msg>` carries the track
//! title and duration and becomes a [`ReaderEvent::PropertiesChanged`].

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{SnapError, SnapResult};
use crate::properties::{Metadata, PlaybackStatus, Properties};
use crate::protocol_constants::DEFAULT_WATCHDOG_TIMEOUT_SECS;
use crate::uri::StreamUri;

use super::cadence::{drive_pcm_reader, ReaderParams};
use super::watchdog::Watchdog;
use super::{ReaderEvent, ReaderHandle};

/// Extracts `(title, duration_secs)` from a librespot stderr line carrying
/// the `<Title> (NNNN ms) loaded` marker, if present.
fn parse_track_loaded(line: &str) -> Option<(String, f64)> {
    let title_start = line.find('<')? + 1;
    let title_end = line[title_start..].find('>')? + title_start;
    let title = line[title_start..title_end].to_string();

    let ms_start = line[title_end..].find('(')? + title_end + 1;
    let ms_end = line[ms_start..].find("ms) loaded")? + ms_start;
    let ms_str = line[ms_start..ms_end].trim();
    let ms: f64 = ms_str.parse().ok()?;

    Some((title, ms / 1000.0))
}

async fn pump_stderr(
    stderr: tokio::process::ChildStderr,
    command: String,
    watchdog: std::sync::Arc<Watchdog>,
    tx: mpsc::Sender<ReaderEvent>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        watchdog.feed();
        log::debug!("[{command}] {line}");
        if let Some((title, duration)) = parse_track_loaded(&line) {
            let props = Properties {
                playback_status: PlaybackStatus::Playing,
                metadata: Some(Metadata { title: Some(title), duration: Some(duration), ..Default::default() }),
                ..Properties::default()
            };
            if tx.send(ReaderEvent::PropertiesChanged(props)).await.is_err() {
                return;
            }
        }
    }
}

/// Spawns `librespot` with a layout identical to the `process://` reader
/// (stdout is PCM, the watchdog resets on any stderr line), but scrapes
/// that same stderr for `<Title> (NNNN ms) loaded` markers and forwards
/// them as [`ReaderEvent::PropertiesChanged`].
pub fn spawn(
    stream_id: String,
    uri: &StreamUri,
    params: ReaderParams,
) -> SnapResult<(ReaderHandle, mpsc::Receiver<ReaderEvent>)> {
    if uri.path.is_empty() {
        return Err(SnapError::InvalidArgument("librespot source requires a command path".into()));
    }
    let command = uri.path.clone();
    let args: Vec<String> = uri
        .get("params")
        .map(|p| p.split_whitespace().map(String::from).collect())
        .unwrap_or_default();
    let wd_timeout = uri.get_u32("wd_timeout_s")?.map(|v| v as u64).unwrap_or(DEFAULT_WATCHDOG_TIMEOUT_SECS);

    let (tx, rx) = mpsc::channel(64);
    let shutdown = CancellationToken::new();
    let shutdown_task = shutdown.clone();

    let task = tokio::spawn(async move {
        loop {
            if shutdown_task.is_cancelled() {
                return;
            }
            let mut child = match Command::new(&command)
                .args(&args)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
            {
                Ok(c) => c,
                Err(err) => {
                    log::error!("failed to spawn librespot source '{command}': {err}");
                    return;
                }
            };

            let stdout = child.stdout.take().expect("stdout piped");
            let stderr = child.stderr.take().expect("stderr piped");
            let watchdog = std::sync::Arc::new(Watchdog::new(wd_timeout));

            let stderr_task = {
                let command = command.clone();
                let watchdog = watchdog.clone();
                let tx = tx.clone();
                tokio::spawn(pump_stderr(stderr, command, watchdog, tx))
            };

            let reader_fut = drive_pcm_reader(stdout, params, stream_id.clone(), tx.clone(), shutdown_task.clone());
            tokio::pin!(reader_fut);

            tokio::select! {
                _ = &mut reader_fut => {
                    let _ = child.wait().await;
                    stderr_task.abort();
                    return;
                }
                _ = watchdog.expired() => {
                    log::warn!("librespot source '{command}' watchdog expired, restarting");
                    #[cfg(unix)]
                    if let Some(pid) = child.id() {
                        unsafe { libc::kill(pid as i32, libc::SIGINT); }
                    }
                    let _ = child.wait().await;
                    stderr_task.abort();
                }
                _ = shutdown_task.cancelled() => {
                    let _ = child.kill().await;
                    stderr_task.abort();
                    return;
                }
            }
        }
    });

    Ok((ReaderHandle::new(shutdown, task), rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_track_loaded_line() {
        let line = "[2021-06-04T07:20:47Z INFO  librespot_playback::player] <Tunnel> (310573 ms) loaded";
        let (title, duration) = parse_track_loaded(line).unwrap();
        assert_eq!(title, "Tunnel");
        assert!((duration - 310.573).abs() < 1e-6);
    }

    #[test]
    fn non_matching_line_is_none() {
        let line = "[2021-05-09T07:25:48Z DEBUG librespot_playback::player] command=Load(SpotifyId";
        assert!(parse_track_loaded(line).is_none());
    }

    #[test]
    fn malformed_brackets_are_ignored() {
        assert!(parse_track_loaded("<unterminated").is_none());
        assert!(parse_track_loaded("<ok> no parens here").is_none());
    }
}
