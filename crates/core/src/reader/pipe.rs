//! `pipe://` reader: reads PCM from a named pipe (FIFO), retrying with a
//! fixed backoff while the pipe does not yet exist or has no writer.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::SnapResult;
use crate::protocol_constants::READER_RETRY_BACKOFF_MS;
use crate::uri::StreamUri;

use super::cadence::{drive_pcm_reader, ReaderParams};
use super::{ReaderEvent, ReaderHandle};

pub fn spawn(
    stream_id: String,
    uri: &StreamUri,
    params: ReaderParams,
) -> SnapResult<(ReaderHandle, mpsc::Receiver<ReaderEvent>)> {
    let path = uri.path.clone();
    let (tx, rx) = mpsc::channel(64);
    let shutdown = CancellationToken::new();
    let shutdown_task = shutdown.clone();

    let task = tokio::spawn(async move {
        let mut logged_wait = false;
        loop {
            if shutdown_task.is_cancelled() {
                return;
            }
            match tokio::fs::File::open(&path).await {
                Ok(file) => {
                    drive_pcm_reader(file, params, stream_id.clone(), tx.clone(), shutdown_task.clone()).await;
                    return;
                }
                Err(err) => {
                    if !logged_wait {
                        log::warn!("pipe '{path}' not readable yet ({err}), retrying");
                        logged_wait = true;
                    }
                    tokio::select! {
                        _ = shutdown_task.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_millis(READER_RETRY_BACKOFF_MS)) => {}
                    }
                }
            }
        }
    });

    Ok((ReaderHandle::new(shutdown, task), rx))
}
