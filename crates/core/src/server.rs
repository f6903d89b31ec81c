//! Component G: the fan-out server. Owns every accepted session and every
//! configured stream, and is the collision point between them — it is the
//! [`SessionReceiver`] every [`Session`] calls back into, and the only thing
//! that reads a [`Stream`]'s broadcast channel.
//!
//! Session bookkeeping follows the `DashMap` + `CancellationToken` shape of
//! `api/ws_connection.rs`'s `WsConnectionManager`, generalized from a
//! websocket-handle registry to one keyed by session id and carrying real
//! per-connection state instead of a placeholder.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use socket2::SockRef;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::persistence::{PersistentStore, ServerState};
use crate::protocol_constants::{DEFAULT_BUFFER_MS, SERVER_DIAGNOSTICS_INTERVAL_SECS, SESSION_SOCKET_TIMEOUT_SECS};
use crate::session::{send_via_zerocopy_or_queue, Session, SessionConfig, SessionReceiver};
use crate::stream::{Stream, StreamEvent};
use crate::time::SteadyClock;
use crate::wire::{encode_message, Message, WireChunkBody};

/// Options the server applies uniformly to every accepted session.
#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    pub zerocopy_enabled: bool,
    pub max_queue_chunks: usize,
    /// When `true`, chunks are fanned out to muted sessions too (§4.G:
    /// "unless the server is configured to forward to muted clients").
    /// Default `false` preserves the documented gating behavior.
    pub forward_to_muted_clients: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { zerocopy_enabled: false, max_queue_chunks: 0, forward_to_muted_clients: false }
    }
}

/// The fan-out server: TCP acceptor, session registry, stream registry.
pub struct Server {
    streams: DashMap<String, Arc<Stream>>,
    sessions: DashMap<String, Arc<Session>>,
    config: ServerConfig,
    clock: SteadyClock,
    shutdown: CancellationToken,
    /// Groups/clients configuration (§5: "guarded by a single mutex held
    /// only across short critical sections"); the in-memory mirror of
    /// `server.json`, updated on `Hello`/`ClientInfo`/disconnect.
    state: Mutex<ServerState>,
    store: Option<PersistentStore>,
}

impl Server {
    /// Constructs a server with no persisted groups/clients state and no
    /// on-disk store (nothing is ever loaded or saved).
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Self::with_state(config, ServerState::default(), None)
    }

    /// Constructs a server seeded from a previously loaded `ServerState`;
    /// `store`, when present, receives an atomic rewrite after every
    /// client/group change (§6: "rewritten atomically after any
    /// client/group change").
    pub fn with_state(config: ServerConfig, state: ServerState, store: Option<PersistentStore>) -> Arc<Self> {
        Arc::new(Self {
            streams: DashMap::new(),
            sessions: DashMap::new(),
            config,
            clock: SteadyClock::new(),
            shutdown: CancellationToken::new(),
            state: Mutex::new(state),
            store,
        })
    }

    /// Rewrites `server.json` if this server was constructed with a store.
    fn persist(&self, state: &ServerState) {
        if let Some(store) = &self.store {
            if let Err(err) = store.save(state) {
                log::warn!("failed to persist server.json: {err}");
            }
        }
    }

    /// Registers `stream` and spawns the task that fans its broadcast events
    /// out to every session bound to it.
    pub fn add_stream(self: &Arc<Self>, stream: Arc<Stream>) {
        let stream_id = stream.id.clone();
        let mut events = stream.subscribe();
        self.streams.insert(stream_id.clone(), stream);

        let this = Arc::clone(self);
        let shutdown = this.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => this.dispatch_stream_event(&stream_id, event),
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        });
    }

    /// The stream every newly connected client binds to by default: the
    /// first configured stream whose codec isn't `null` (§4.G).
    pub fn default_stream(&self) -> Option<Arc<Stream>> {
        self.streams.iter().find(|e| e.value().codec_name() != "null").map(|e| e.value().clone())
    }

    pub fn stream_by_id(&self, id: &str) -> Option<Arc<Stream>> {
        self.streams.get(id).map(|e| e.value().clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn sessions_for_stream(&self, stream_id: &str) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .filter(|e| e.value().bound_stream().as_deref() == Some(stream_id))
            .map(|e| e.value().clone())
            .collect()
    }

    /// Routes one stream event to every session currently bound to it.
    /// `pub(crate)` so tests can drive it without a live reader.
    pub(crate) fn dispatch_stream_event(&self, stream_id: &str, event: StreamEvent) {
        match event {
            StreamEvent::CodecHeader(header) => {
                for session in self.sessions_for_stream(stream_id) {
                    session.send(Message::CodecHeader(header.clone()));
                }
            }
            StreamEvent::Chunk { timestamp, payload } => {
                let mut buf = BytesMut::new();
                encode_message(&Message::WireChunk(WireChunkBody { timestamp, payload }), 0, 0, &self.clock, &mut buf);
                let encoded = buf.freeze();
                for session in self.sessions_for_stream(stream_id) {
                    if session.is_muted() && !self.config.forward_to_muted_clients {
                        continue;
                    }
                    send_via_zerocopy_or_queue(&session, encoded.clone());
                }
            }
            // Not wire traffic: these drive the control-plane view of a
            // stream (status reporting), which has no session-facing
            // message type of its own.
            StreamEvent::PropertiesChanged(_) | StreamEvent::StateChanged(_) => {}
        }
    }

    /// Accepts connections on `listener` until shut down.
    pub async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((socket, addr)) => self.handle_accept(socket, addr),
                Err(err) => log::warn!("accept failed: {err}"),
            }
        }
    }

    fn handle_accept(self: &Arc<Self>, socket: TcpStream, addr: SocketAddr) {
        if let Err(err) = configure_accepted_socket(&socket) {
            log::warn!("failed to configure session socket {addr}: {err}");
        }
        let session_config = SessionConfig {
            zerocopy_enabled: self.config.zerocopy_enabled,
            max_queue_chunks: self.config.max_queue_chunks,
        };
        let receiver: Arc<dyn SessionReceiver> = self.clone();
        let session = Session::spawn(socket, addr, session_config, receiver);
        log::info!("session {} connected from {addr}", session.id());
        self.sessions.insert(session.id().to_string(), session);
    }

    /// Logs per-session zero-copy and backpressure stats every
    /// `SERVER_DIAGNOSTICS_INTERVAL_SECS` until shut down.
    pub async fn run_diagnostics_timer(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(SERVER_DIAGNOSTICS_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.log_diagnostics(),
            }
        }
    }

    fn log_diagnostics(&self) {
        log::info!("{} active sessions, {} streams", self.sessions.len(), self.streams.len());
        for entry in self.sessions.iter() {
            if let Some(stats) = entry.value().zerocopy_stats() {
                log::info!(
                    "session {}: zerocopy {:.1}% ({}/{}), dropped_chunks={}",
                    entry.key(),
                    stats.zerocopy_percentage(),
                    stats.zerocopy_successful,
                    stats.zerocopy_attempts,
                    entry.value().dropped_chunk_count(),
                );
            }
        }
    }

    /// Tears down every session and stops accepting new ones.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for session in self.sessions.iter() {
            session.value().shutdown();
        }
    }
}

#[async_trait]
impl SessionReceiver for Server {
    async fn on_hello(&self, session: Arc<Session>, hello: Value) {
        let client_id = hello
            .get("ID")
            .and_then(Value::as_str)
            .or_else(|| hello.get("Mac").and_then(Value::as_str))
            .unwrap_or_default()
            .to_string();
        session.set_client_id(client_id.clone());

        let stream = self.default_stream();
        if let Some(stream) = &stream {
            session.bind_stream(Some(stream.id.clone()));
        }

        // Registers (or re-registers) the client in the groups/clients
        // configuration and recovers its persisted volume/mute so a
        // reconnecting client is restored to the state it left in, rather
        // than always starting unmuted at full volume.
        let (volume, latency, muted, snapshot) = {
            let mut state = self.state.lock();
            let group = state.get_or_create_group(&client_id);
            let group_muted = group.muted;
            let client = group.client_mut(&client_id).expect("get_or_create_group ensures this client exists");
            client.connected = true;
            (client.config.volume.percent, client.config.latency, group_muted || client.config.volume.muted, state.clone())
        };
        self.persist(&snapshot);
        session.set_muted(muted);

        session.send(Message::ServerSettings(json!({
            "bufferMs": DEFAULT_BUFFER_MS,
            "latency": latency,
            "volume": volume,
            "muted": muted,
        })));

        if let Some(header) = stream.and_then(|s| s.codec_header()) {
            session.send(Message::CodecHeader(header));
        }
    }

    /// Applies a `ClientInfo` update (§6: "JSON blob with updates to
    /// client-reported state") to the persisted client record and the
    /// session's live mute bit, so a client/group mute actually reaches the
    /// fan-out gate in [`Server::dispatch_stream_event`].
    async fn on_client_info(&self, session: &Session, info: Value) {
        let Some(client_id) = session.client_id() else {
            log::debug!("session {} sent ClientInfo before Hello; ignoring", session.id());
            return;
        };

        let (muted, snapshot) = {
            let mut state = self.state.lock();
            let group_muted = state.group_for_client(&client_id).map(|g| g.muted).unwrap_or(false);
            let group = state.get_or_create_group(&client_id);
            let client = group.client_mut(&client_id).expect("get_or_create_group ensures this client exists");

            if let Some(volume) = info.get("volume") {
                if let Some(percent) = volume.get("percent").and_then(Value::as_u64) {
                    client.config.volume.percent = percent as u16;
                }
                if let Some(m) = volume.get("muted").and_then(Value::as_bool) {
                    client.config.volume.muted = m;
                }
            }
            if let Some(name) = info.get("name").and_then(Value::as_str) {
                client.config.name = name.to_string();
            }
            if let Some(latency) = info.get("latency").and_then(Value::as_i64) {
                client.config.latency = latency as i32;
            }

            (group_muted || client.config.volume.muted, state.clone())
        };

        self.persist(&snapshot);
        session.set_muted(muted);
        log::debug!("session {} client info applied, muted={muted}", session.id());
    }

    fn on_disconnect(&self, session_id: &str) {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return;
        };
        if let Some(client_id) = session.client_id() {
            let snapshot = {
                let mut state = self.state.lock();
                if let Some(client) = state.group_for_client_mut(&client_id).and_then(|g| g.client_mut(&client_id)) {
                    client.connected = false;
                }
                state.clone()
            };
            self.persist(&snapshot);
        }
    }
}

fn configure_accepted_socket(socket: &TcpStream) -> std::io::Result<()> {
    socket.set_nodelay(true)?;
    let sock_ref = SockRef::from(socket);
    let timeout = Duration::from_secs(SESSION_SOCKET_TIMEOUT_SECS);
    sock_ref.set_read_timeout(Some(timeout))?;
    sock_ref.set_write_timeout(Some(timeout))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TimeVal;
    use crate::uri::StreamUri;
    use crate::wire::Header;
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn hello_with_no_streams_gets_server_settings_only() {
        let server = Server::new(ServerConfig::default());
        let (server_sock, mut client_sock) = connected_pair().await;
        server.handle_accept(server_sock, "127.0.0.1:1".parse().unwrap());

        let clock = SteadyClock::new();
        let mut buf = BytesMut::new();
        encode_message(&Message::Hello(json!({"HostName": "h"})), 5, 0, &clock, &mut buf);
        client_sock.write_all(&buf).await.unwrap();

        let mut header_buf = [0u8; crate::protocol_constants::HEADER_SIZE];
        client_sock.read_exact(&mut header_buf).await.unwrap();
        let header = Header::decode(&header_buf).unwrap();
        assert_eq!(header.msg_type, crate::wire::MessageType::ServerSettings);

        // No codec header follows, since no stream was registered.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.session_count(), 1);
    }

    #[test]
    fn default_stream_skips_null_codec() {
        let server = Server::new(ServerConfig::default());
        let uri = StreamUri::parse("pipe:///tmp/a?codec=null").unwrap();
        let null_stream = crate::stream::uncontrolled("null-stream".into(), uri).unwrap();
        server.add_stream(null_stream);

        let uri = StreamUri::parse("pipe:///tmp/b?codec=pcm").unwrap();
        let pcm_stream = crate::stream::uncontrolled("pcm-stream".into(), uri).unwrap();
        server.add_stream(pcm_stream);

        assert_eq!(server.default_stream().unwrap().id, "pcm-stream");
    }

    #[tokio::test]
    async fn chunk_event_is_fanned_out_to_bound_unmuted_sessions_only() {
        let server = Server::new(ServerConfig::default());
        let uri = StreamUri::parse("pipe:///tmp/a?codec=pcm").unwrap();
        let stream = crate::stream::uncontrolled("s1".into(), uri).unwrap();
        server.add_stream(stream);

        let (bound_server_sock, mut bound_client) = connected_pair().await;
        let bound = Session::spawn(
            bound_server_sock,
            "127.0.0.1:1".parse().unwrap(),
            SessionConfig::default(),
            Arc::new(NoopReceiver) as Arc<dyn SessionReceiver>,
        );
        bound.bind_stream(Some("s1".into()));
        server.sessions.insert(bound.id().to_string(), bound.clone());

        let (muted_server_sock, mut muted_client) = connected_pair().await;
        let muted = Session::spawn(
            muted_server_sock,
            "127.0.0.1:1".parse().unwrap(),
            SessionConfig::default(),
            Arc::new(NoopReceiver) as Arc<dyn SessionReceiver>,
        );
        muted.bind_stream(Some("s1".into()));
        muted.set_muted(true);
        server.sessions.insert(muted.id().to_string(), muted.clone());

        server.dispatch_stream_event(
            "s1",
            StreamEvent::Chunk { timestamp: TimeVal::new(0, 0), payload: Bytes::from_static(&[0u8; 16]) },
        );

        let mut header_buf = [0u8; crate::protocol_constants::HEADER_SIZE];
        bound_client.read_exact(&mut header_buf).await.unwrap();
        let header = Header::decode(&header_buf).unwrap();
        assert_eq!(header.msg_type, crate::wire::MessageType::WireChunk);

        tokio::select! {
            _ = muted_client.read_exact(&mut header_buf) => panic!("muted session should not receive the chunk"),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
    }

    #[tokio::test]
    async fn forward_to_muted_clients_override_bypasses_the_mute_gate() {
        let config = ServerConfig { forward_to_muted_clients: true, ..ServerConfig::default() };
        let server = Server::new(config);
        let uri = StreamUri::parse("pipe:///tmp/a?codec=pcm").unwrap();
        let stream = crate::stream::uncontrolled("s1".into(), uri).unwrap();
        server.add_stream(stream);

        let (muted_server_sock, mut muted_client) = connected_pair().await;
        let muted = Session::spawn(
            muted_server_sock,
            "127.0.0.1:1".parse().unwrap(),
            SessionConfig::default(),
            Arc::new(NoopReceiver) as Arc<dyn SessionReceiver>,
        );
        muted.bind_stream(Some("s1".into()));
        muted.set_muted(true);
        server.sessions.insert(muted.id().to_string(), muted.clone());

        server.dispatch_stream_event(
            "s1",
            StreamEvent::Chunk { timestamp: TimeVal::new(0, 0), payload: Bytes::from_static(&[0u8; 16]) },
        );

        let mut header_buf = [0u8; crate::protocol_constants::HEADER_SIZE];
        tokio::time::timeout(Duration::from_millis(200), muted_client.read_exact(&mut header_buf))
            .await
            .expect("muted session should still receive the chunk when the override is set")
            .unwrap();
        let header = Header::decode(&header_buf).unwrap();
        assert_eq!(header.msg_type, crate::wire::MessageType::WireChunk);
    }

    #[tokio::test]
    async fn client_info_mute_update_reaches_the_session_and_persists() {
        let server = Server::new(ServerConfig::default());
        let (server_sock, client_sock) = connected_pair().await;
        server.handle_accept(server_sock, "127.0.0.1:1".parse().unwrap());
        let session = server.sessions.iter().next().unwrap().value().clone();
        session.set_client_id("aa:bb:cc:dd:ee:ff".into());

        assert!(!session.is_muted());
        server.on_client_info(&session, json!({"volume": {"percent": 42, "muted": true}})).await;
        assert!(session.is_muted());

        let state = server.state.lock().clone();
        let client = state.group_for_client("aa:bb:cc:dd:ee:ff").unwrap().client("aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(client.config.volume.percent, 42);
        assert!(client.config.volume.muted);

        drop(client_sock);
    }

    #[tokio::test]
    async fn hello_restores_persisted_mute_for_a_reconnecting_client() {
        let mut state = crate::persistence::ServerState::default();
        state.get_or_create_group("aa:bb:cc:dd:ee:ff").client_mut("aa:bb:cc:dd:ee:ff").unwrap().config.volume.muted = true;
        let server = Server::with_state(ServerConfig::default(), state, None);

        let (server_sock, mut client_sock) = connected_pair().await;
        server.handle_accept(server_sock, "127.0.0.1:1".parse().unwrap());
        let session = server.sessions.iter().next().unwrap().value().clone();

        let clock = SteadyClock::new();
        let mut buf = BytesMut::new();
        encode_message(&Message::Hello(json!({"ID": "aa:bb:cc:dd:ee:ff"})), 5, 0, &clock, &mut buf);
        client_sock.write_all(&buf).await.unwrap();

        let mut header_buf = [0u8; crate::protocol_constants::HEADER_SIZE];
        client_sock.read_exact(&mut header_buf).await.unwrap();
        let header = Header::decode(&header_buf).unwrap();
        let mut body = vec![0u8; header.payload_size as usize];
        client_sock.read_exact(&mut body).await.unwrap();
        let settings = crate::wire::decode_message(&header, &body).unwrap();
        let Message::ServerSettings(settings) = settings else { panic!("expected ServerSettings") };
        assert_eq!(settings.get("muted").and_then(Value::as_bool), Some(true));

        assert!(session.is_muted());
    }

    struct NoopReceiver;

    #[async_trait]
    impl SessionReceiver for NoopReceiver {
        async fn on_hello(&self, _session: Arc<Session>, _hello: Value) {}
        async fn on_client_info(&self, _session: &Session, _info: Value) {}
        fn on_disconnect(&self, _session_id: &str) {}
    }
}
