//! End-to-end scenarios driven over a real loopback TCP socket against a
//! live [`Server`], exercising the same wire traffic a real client/server
//! pair would exchange. Complements the unit tests colocated with each
//! module: those check one component in isolation, these check the seams
//! between session, server, and stream.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use snapstream_core::control::NullStreamControl;
use snapstream_core::server::{Server, ServerConfig};
use snapstream_core::stream::Stream;
use snapstream_core::time::SteadyClock;
use snapstream_core::uri::StreamUri;
use snapstream_core::wire::{decode_message, encode_message, Header, Message, MessageType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn start_server() -> (Arc<Server>, std::net::SocketAddr) {
    let server = Server::new(ServerConfig::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(Arc::clone(&server).accept_loop(listener));
    (server, addr)
}

async fn read_one_message(sock: &mut TcpStream) -> (Header, Vec<u8>) {
    let mut header_buf = [0u8; snapstream_core::protocol_constants::HEADER_SIZE];
    sock.read_exact(&mut header_buf).await.unwrap();
    let header = Header::decode(&header_buf).unwrap();
    let mut body = vec![0u8; header.payload_size as usize];
    sock.read_exact(&mut body).await.unwrap();
    (header, body)
}

/// S1 — Round-trip Hello: a client's `Hello` gets a `ServerSettings` and a
/// `CodecHeader` back once a default stream is registered.
#[tokio::test]
async fn s1_hello_round_trip_yields_settings_and_codec_header() {
    let (server, addr) = start_server().await;
    let uri = StreamUri::parse("pipe:///tmp/does-not-exist?codec=pcm&sampleformat=48000:16:2").unwrap();
    let stream = Stream::new("default".into(), uri, Arc::new(NullStreamControl)).unwrap();
    server.add_stream(stream);
    // Let the per-stream fan-out subscriber task spin up before connecting.
    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let clock = SteadyClock::new();
    let mut buf = BytesMut::new();
    encode_message(
        &Message::Hello(serde_json::json!({
            "HostName": "test-host",
            "Mac": "aa:bb:cc:dd:ee:ff",
            "Instance": 1,
        })),
        7,
        0,
        &clock,
        &mut buf,
    );
    client.write_all(&buf).await.unwrap();

    let mut seen_settings = false;
    let mut seen_codec_header = false;
    for _ in 0..2 {
        let (header, _body) = read_one_message(&mut client).await;
        match header.msg_type {
            MessageType::ServerSettings => seen_settings = true,
            MessageType::CodecHeader => seen_codec_header = true,
            other => panic!("unexpected message type {other:?}"),
        }
    }
    assert!(seen_settings, "expected a ServerSettings reply");
    assert!(seen_codec_header, "expected a CodecHeader for the default stream");
    assert_eq!(server.session_count(), 1);
}

/// S4 — Protocol-violation teardown: an out-of-range `type` closes the
/// session within 100ms and removes it from the active set.
#[tokio::test]
async fn s4_unknown_message_type_closes_session() {
    let (server, addr) = start_server().await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(server.session_count(), 1);

    let mut bad = BytesMut::new();
    bad.extend_from_slice(&42u16.to_le_bytes()); // type: out of range (max is 7)
    bad.extend_from_slice(&0u16.to_le_bytes()); // id
    bad.extend_from_slice(&0u16.to_le_bytes()); // refers_to
    bad.extend_from_slice(&[0u8; 16]); // sent + received timevals
    bad.extend_from_slice(&0u32.to_le_bytes()); // payload_size
    client.write_all(&bad).await.unwrap();

    // The server should close its end; our read should see EOF.
    let mut probe = [0u8; 1];
    let closed = tokio::time::timeout(Duration::from_millis(200), client.read(&mut probe)).await;
    assert!(matches!(closed, Ok(Ok(0))), "expected the server to close the connection");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.session_count(), 0, "session should be removed from the active set");
}

/// S5 — Oversize payload: `payload_size` over the 1,000,000-byte cap closes
/// the connection before the body is read.
#[tokio::test]
async fn s5_oversize_payload_closes_before_reading_body() {
    let (server, addr) = start_server().await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut bad = BytesMut::new();
    bad.extend_from_slice(&(MessageType::ClientInfo as u16).to_le_bytes());
    bad.extend_from_slice(&0u16.to_le_bytes());
    bad.extend_from_slice(&0u16.to_le_bytes());
    bad.extend_from_slice(&[0u8; 16]);
    bad.extend_from_slice(&1_000_001u32.to_le_bytes()); // over the cap
    client.write_all(&bad).await.unwrap();
    // Deliberately don't send the (huge) body; the server must not block
    // waiting for it.

    let mut probe = [0u8; 1];
    let closed = tokio::time::timeout(Duration::from_millis(200), client.read(&mut probe)).await;
    assert!(matches!(closed, Ok(Ok(0))), "expected the server to close the connection without reading the body");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.session_count(), 0);
}

/// S2 — PCM round-trip: writing one chunk's worth of silence into a
/// `pipe://` source produces exactly one `WireChunk` with the expected
/// payload size and all-zero payload.
#[tokio::test]
async fn s2_pipe_pcm_round_trip_emits_one_silent_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let fifo_path = dir.path().join("audio.fifo");
    let fifo_str = fifo_path.to_str().unwrap().to_string();

    // SAFETY: mkfifo just creates a named pipe; failure is surfaced via the
    // assert below rather than causing the call itself to be unsafe.
    let rc = unsafe {
        let c_path = std::ffi::CString::new(fifo_str.clone()).unwrap();
        libc::mkfifo(c_path.as_ptr(), 0o600)
    };
    assert_eq!(rc, 0, "mkfifo failed: {}", std::io::Error::last_os_error());

    let (server, addr) = start_server().await;
    let uri = StreamUri::parse(&format!(
        "pipe://{fifo_str}?codec=pcm&sampleformat=48000:16:2&chunk_ms=20"
    ))
    .unwrap();
    let stream = Stream::new("s2".into(), uri, Arc::new(NullStreamControl)).unwrap();
    server.add_stream(Arc::clone(&stream));
    stream.start().await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Open the FIFO for writing and push one chunk (20ms @ 48kHz stereo
    // 16-bit = 48000 * 0.02 * 2 * 2 = 3840 bytes) of silence.
    let mut writer = tokio::fs::OpenOptions::new().write(true).open(&fifo_path).await.unwrap();
    writer.write_all(&[0u8; 3840]).await.unwrap();
    writer.flush().await.unwrap();

    // The session needs to be bound to the stream to receive fan-out; since
    // this test bypasses Hello, drive the bind directly through the server's
    // default-stream rule by sending a minimal Hello first.
    let clock = SteadyClock::new();
    let mut hello_buf = BytesMut::new();
    encode_message(&Message::Hello(serde_json::json!({"HostName": "h"})), 1, 0, &clock, &mut hello_buf);
    client.write_all(&hello_buf).await.unwrap();

    // Drain ServerSettings + CodecHeader, then wait for the WireChunk.
    let mut got_chunk = false;
    for _ in 0..4 {
        let (header, body) = tokio::time::timeout(Duration::from_secs(2), read_one_message(&mut client))
            .await
            .expect("timed out waiting for a message");
        if header.msg_type == MessageType::WireChunk {
            let decoded = decode_message(&header, &body).unwrap();
            if let Message::WireChunk(chunk) = decoded {
                assert_eq!(chunk.payload.len(), 3840);
                assert!(chunk.payload.iter().all(|b| *b == 0), "payload should be all-zero silence");
                got_chunk = true;
                break;
            }
        }
    }
    assert!(got_chunk, "expected a WireChunk with the 20ms silent payload");

    stream.stop().await;
}
