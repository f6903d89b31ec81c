//! Component I: the client-side mirror of [`crate::session::Session`].
//! Resolves and connects to a server, then serves `send`/`send_request`/an
//! inbound message stream to the [`crate::client::controller::Controller`].
//! Request-id allocation and pending-request sweeping reuse
//! [`crate::pending::PendingRequests`] exactly as the server session does.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{SnapError, SnapResult};
use crate::pending::PendingRequests;
use crate::protocol_constants::HEADER_SIZE;
use crate::time::SteadyClock;
use crate::wire::{decode_message, encode_message, Header, Message};

/// One outstanding connection to a server. `Arc`-shared between the
/// controller's time-sync task and whatever issues `ClientInfo` updates.
pub struct ClientConnection {
    clock: SteadyClock,
    pending: Mutex<PendingRequests<(Header, Message)>>,
    write_tx: mpsc::UnboundedSender<bytes::Bytes>,
    shutdown: CancellationToken,
}

impl ClientConnection {
    /// Connects to `addr` and spawns the reader/writer tasks. Returns the
    /// connection handle plus the inbound message stream the controller
    /// drains for everything that isn't a correlated response (codec
    /// headers, server settings, audio chunks).
    pub async fn connect(addr: SocketAddr) -> SnapResult<(Arc<ClientConnection>, mpsc::UnboundedReceiver<Message>)> {
        let socket = TcpStream::connect(addr).await.map_err(|e| SnapError::Io(e.to_string()))?;
        socket.set_nodelay(true).map_err(|e| SnapError::Io(e.to_string()))?;
        Ok(Self::from_socket(socket))
    }

    fn from_socket(socket: TcpStream) -> (Arc<ClientConnection>, mpsc::UnboundedReceiver<Message>) {
        let (read_half, write_half) = socket.into_split();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let connection = Arc::new(ClientConnection {
            clock: SteadyClock::new(),
            pending: Mutex::new(PendingRequests::new()),
            write_tx,
            shutdown: shutdown.clone(),
        });

        tokio::spawn(writer_loop(write_rx, write_half, shutdown.clone()));
        tokio::spawn(reader_loop(connection.clone(), read_half, inbound_tx, shutdown));

        (connection, inbound_rx)
    }

    pub fn send(&self, msg: Message) -> SnapResult<()> {
        let mut buf = BytesMut::new();
        encode_message(&msg, 0, 0, &self.clock, &mut buf);
        self.write_tx.send(buf.freeze()).map_err(|_| SnapError::OperationAborted)
    }

    /// Issues a request and awaits the correlated reply, returning its
    /// header alongside the decoded body so the caller can read the
    /// server's own `sent`/`received` stamps (needed for the client
    /// controller's round-trip latency estimate).
    pub async fn send_request(&self, msg: Message, timeout: Duration) -> SnapResult<(Header, Message)> {
        let (id, fut) = {
            let mut pending = self.pending.lock();
            pending.register(timeout)
        };
        let mut buf = BytesMut::new();
        encode_message(&msg, id, 0, &self.clock, &mut buf);
        self.write_tx.send(buf.freeze()).map_err(|_| SnapError::OperationAborted)?;
        fut.await.into_result()
    }

    pub fn shutdown(&self) {
        self.pending.lock().abort_all();
        self.shutdown.cancel();
    }
}

async fn writer_loop(mut write_rx: mpsc::UnboundedReceiver<bytes::Bytes>, mut write_half: OwnedWriteHalf, shutdown: CancellationToken) {
    loop {
        let item = tokio::select! {
            _ = shutdown.cancelled() => break,
            item = write_rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        if write_half.write_all(&item).await.is_err() {
            break;
        }
    }
}

async fn reader_loop(
    connection: Arc<ClientConnection>,
    mut read_half: OwnedReadHalf,
    inbound_tx: mpsc::UnboundedSender<Message>,
    shutdown: CancellationToken,
) {
    let mut header_buf = [0u8; HEADER_SIZE];
    loop {
        let read_result = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = read_half.read_exact(&mut header_buf) => res,
        };
        if read_result.is_err() {
            break;
        }

        let mut header = match Header::decode(&header_buf) {
            Ok(h) => h,
            Err(_) => break,
        };
        header.received = connection.clock.now();

        let mut body = vec![0u8; header.payload_size as usize];
        if read_half.read_exact(&mut body).await.is_err() {
            break;
        }

        let message = match decode_message(&header, &body) {
            Ok(m) => m,
            Err(_) => break,
        };

        if header.refers_to != 0 {
            connection.pending.lock().complete(header.refers_to, (header, message));
            continue;
        }

        if inbound_tx.send(message).is_err() {
            break;
        }
    }

    connection.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::TimeBody;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn unsolicited_message_is_delivered_on_inbound_stream() {
        let (server_sock, client_sock) = connected_pair().await;
        let (_connection, mut inbound) = ClientConnection::from_socket(client_sock);

        let clock = SteadyClock::new();
        let mut buf = BytesMut::new();
        encode_message(&Message::ServerSettings(serde_json::json!({"bufferMs": 1000})), 0, 0, &clock, &mut buf);
        let mut server_sock = server_sock;
        server_sock.write_all(&buf).await.unwrap();

        let msg = inbound.recv().await.unwrap();
        assert!(matches!(msg, Message::ServerSettings(_)));
    }

    #[tokio::test]
    async fn send_request_resolves_with_header_and_body() {
        let (mut server_sock, client_sock) = connected_pair().await;
        let (connection, _inbound) = ClientConnection::from_socket(client_sock);

        let request_fut = connection.send_request(Message::Time(TimeBody::v1(crate::time::TimeVal::ZERO)), Duration::from_secs(1));

        let mut header_buf = [0u8; HEADER_SIZE];
        server_sock.read_exact(&mut header_buf).await.unwrap();
        let request_header = Header::decode(&header_buf).unwrap();
        let mut body = vec![0u8; request_header.payload_size as usize];
        server_sock.read_exact(&mut body).await.unwrap();

        let clock = SteadyClock::new();
        let mut reply_buf = BytesMut::new();
        encode_message(&Message::Time(TimeBody::v1(crate::time::TimeVal::new(0, 500))), 0, request_header.id, &clock, &mut reply_buf);
        server_sock.write_all(&reply_buf).await.unwrap();

        let (header, message) = request_fut.await.unwrap();
        assert!(matches!(message, Message::Time(_)));
        assert_eq!(header.refers_to, request_header.id);
    }
}
