//! `file://` reader: reads PCM from a regular file. Reaching EOF is treated
//! like any other starvation — silence, then (after `dryout_ms`) idle — the
//! file is never reopened or looped.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{SnapError, SnapResult};
use crate::uri::StreamUri;

use super::cadence::{drive_pcm_reader, ReaderParams};
use super::{ReaderEvent, ReaderHandle};

pub fn spawn(
    stream_id: String,
    uri: &StreamUri,
    params: ReaderParams,
) -> SnapResult<(ReaderHandle, mpsc::Receiver<ReaderEvent>)> {
    let path = uri.path.clone();
    if !std::path::Path::new(&path).exists() {
        return Err(SnapError::InvalidArgument(format!("file source '{path}' does not exist")));
    }

    let (tx, rx) = mpsc::channel(64);
    let shutdown = CancellationToken::new();
    let shutdown_task = shutdown.clone();

    let task = tokio::spawn(async move {
        match tokio::fs::File::open(&path).await {
            Ok(file) => drive_pcm_reader(file, params, stream_id, tx, shutdown_task).await,
            Err(err) => log::error!("failed to open file source '{path}': {err}"),
        }
    });

    Ok((ReaderHandle::new(shutdown, task), rx))
}
