//! `tcp://` reader: reads PCM from a TCP socket, either dialing out
//! (`mode=client`) or accepting one inbound connection (`mode=server`).

use tokio::net::{TcpListener, TcpStream};
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
    let mode = uri.get_or("mode", "client");
    let port = uri.get_u32("port")?.ok_or_else(|| SnapError::InvalidArgument("tcp source requires 'port'".into()))?;
    let host = if uri.path.is_empty() { "0.0.0.0".to_string() } else { uri.path.clone() };

    let (tx, rx) = mpsc::channel(64);
    let shutdown = CancellationToken::new();
    let shutdown_task = shutdown.clone();

    let task = tokio::spawn(async move {
        loop {
            if shutdown_task.is_cancelled() {
                return;
            }
            let stream = match connect(&mode, &host, port as u16).await {
                Ok(s) => s,
                Err(err) => {
                    log::warn!("tcp source {host}:{port} unavailable ({err}), retrying");
                    tokio::select! {
                        _ = shutdown_task.cancelled() => return,
                        _ = tokio::time::sleep(std::time::Duration::from_millis(
                            crate::protocol_constants::READER_RETRY_BACKOFF_MS,
                        )) => {}
                    }
                    continue;
                }
            };
            drive_pcm_reader(stream, params, stream_id.clone(), tx.clone(), shutdown_task.clone()).await;
            if shutdown_task.is_cancelled() {
                return;
            }
        }
    });

    Ok((ReaderHandle::new(shutdown, task), rx))
}

async fn connect(mode: &str, host: &str, port: u16) -> std::io::Result<TcpStream> {
    match mode {
        "server" => {
            let listener = TcpListener::bind((host, port)).await?;
            let (stream, _peer) = listener.accept().await?;
            Ok(stream)
        }
        _ => TcpStream::connect((host, port)).await,
    }
}
