//! `process://` reader: spawns an external command whose stdout is PCM,
//! refreshes a watchdog on every stderr line, and restarts the child with
//! `SIGINT` if the watchdog expires.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{SnapError, SnapResult};
use crate::protocol_constants::DEFAULT_WATCHDOG_TIMEOUT_SECS;
use crate::uri::StreamUri;

use super::cadence::{drive_pcm_reader, ReaderParams};
use super::watchdog::Watchdog;
use super::{ReaderEvent, ReaderHandle};

pub fn spawn(
    stream_id: String,
    uri: &StreamUri,
    params: ReaderParams,
) -> SnapResult<(ReaderHandle, mpsc::Receiver<ReaderEvent>)> {
    if uri.path.is_empty() {
        return Err(SnapError::InvalidArgument("process source requires a command path".into()));
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
                    log::error!("failed to spawn process source '{command}': {err}");
                    return;
                }
            };

            let stdout = child.stdout.take().expect("stdout piped");
            let stderr = child.stderr.take().expect("stderr piped");
            let watchdog = std::sync::Arc::new(Watchdog::new(wd_timeout));

            let mut stderr_lines = BufReader::new(stderr).lines();
            let stderr_task = {
                let command = command.clone();
                let watchdog = watchdog.clone();
                tokio::spawn(async move {
                    while let Ok(Some(line)) = stderr_lines.next_line().await {
                        watchdog.feed();
                        log::debug!("[{command}] {line}");
                    }
                })
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
                    log::warn!("process source '{command}' watchdog expired, restarting");
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
