//! Component J: client controller. Owns the hello handshake, the periodic
//! time-sync loop, codec negotiation (reconstructing the decoder whenever a
//! new `CodecHeader` arrives — including a sample-format change mid-stream,
//! per `DESIGN.md`'s resolution of that open question), and delivery of
//! decoded chunks to the [`Renderer`] with a computed `play_at`.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::chunk::SampleFormat;
use crate::client::connection::ClientConnection;
use crate::client::renderer::Renderer;
use crate::decoder::{make_decoder, Decoder};
use crate::error::SnapResult;
use crate::protocol_constants::{
    CLIENT_REQUEST_TIMEOUT_MS, DEFAULT_BUFFER_MS, DEFAULT_TIME_SYNC_INTERVAL_MS, PROTOCOL_VERSION,
    RESYNC_TOLERANCE_MS,
};
use crate::time::{SteadyClock, TimeVal};
use crate::wire::{Message, TimeBody, WireChunkBody};

/// Identity fields sent in `Hello`.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub host_name: String,
    pub mac: String,
    pub instance: u32,
    pub client_name: String,
    pub os: String,
    pub arch: String,
}

fn ms_to_timeval(ms: i64) -> TimeVal {
    let sign = if ms < 0 { -1 } else { 1 };
    let abs_ms = ms.unsigned_abs() as i64;
    let tv = TimeVal::new((abs_ms / 1000) as i32, ((abs_ms % 1000) * 1000) as i32);
    if sign < 0 {
        TimeVal::ZERO - tv
    } else {
        tv
    }
}

struct DecoderState {
    decoder: Box<dyn Decoder>,
    format: SampleFormat,
}

/// A running client session: connection + time sync + decode/render loop.
pub struct Controller {
    connection: Arc<ClientConnection>,
    clock: SteadyClock,
    renderer: Arc<dyn Renderer>,
    latency_us: AtomicI64,
    buffer_ms: AtomicU32,
    user_latency_ms: i64,
    volume: AtomicU8,
    muted: AtomicBool,
    shutdown: CancellationToken,
}

impl Controller {
    /// Connects to `addr`, sends `Hello`, starts the renderer, and spawns
    /// the time-sync and message-dispatch loops.
    pub async fn connect(
        addr: std::net::SocketAddr,
        identity: ClientIdentity,
        renderer: Arc<dyn Renderer>,
        user_latency_ms: i64,
    ) -> SnapResult<Arc<Controller>> {
        let (connection, inbound) = ClientConnection::connect(addr).await?;

        connection.send(Message::Hello(json!({
            "HostName": identity.host_name,
            "Mac": identity.mac,
            "ID": identity.mac,
            "Instance": identity.instance,
            "Version": env!("CARGO_PKG_VERSION"),
            "ClientName": identity.client_name,
            "OS": identity.os,
            "Arch": identity.arch,
            "SnapStreamProtocolVersion": PROTOCOL_VERSION.0,
        })))?;

        renderer.start().await?;

        let controller = Arc::new(Controller {
            connection: connection.clone(),
            clock: SteadyClock::new(),
            renderer,
            latency_us: AtomicI64::new(0),
            buffer_ms: AtomicU32::new(DEFAULT_BUFFER_MS),
            user_latency_ms,
            volume: AtomicU8::new(100),
            muted: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(run_time_sync(connection, controller.clone()));
        tokio::spawn(run_message_loop(controller.clone(), inbound));

        Ok(controller)
    }

    /// Total offset applied to a chunk's own timestamp to get its
    /// `play_at`: measured network latency, the server's buffer target, and
    /// any user-configured extra latency (§4.J step 4).
    fn play_at_offset(&self) -> TimeVal {
        let latency_us = self.latency_us.load(Ordering::Relaxed);
        let buffer_ms = self.buffer_ms.load(Ordering::Relaxed) as i64;
        let total_ms = latency_us / 1000 + buffer_ms + self.user_latency_ms;
        ms_to_timeval(total_ms)
    }

    fn apply_server_settings(&self, settings: &Value) {
        if let Some(buffer_ms) = settings.get("bufferMs").and_then(Value::as_u64) {
            self.buffer_ms.store(buffer_ms as u32, Ordering::Relaxed);
        }
        if let Some(volume) = settings.get("volume").and_then(Value::as_u64) {
            self.volume.store(volume as u8, Ordering::Relaxed);
            let renderer = self.renderer.clone();
            tokio::spawn(async move { let _ = renderer.set_volume(volume as u8).await; });
        }
        if let Some(muted) = settings.get("muted").and_then(Value::as_bool) {
            self.muted.store(muted, Ordering::Relaxed);
            let renderer = self.renderer.clone();
            tokio::spawn(async move { let _ = renderer.set_mute(muted).await; });
        }
    }

    pub fn latency_micros(&self) -> i64 {
        self.latency_us.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.connection.shutdown();
    }
}

/// Periodic `Time` request computing
/// `latency = ((t1 - t0) + (t3 - t2)) / 2` (§4.J step 3), where
/// `t0`/`t3` are this client's own send/receive stamps and `t1`/`t2` are the
/// server's, recovered from the reply's header (`t1`) and the reply body's
/// server-side latency estimate added back onto `t0` (`t2`).
async fn run_time_sync(connection: Arc<ClientConnection>, controller: Arc<Controller>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(DEFAULT_TIME_SYNC_INTERVAL_MS));
    loop {
        tokio::select! {
            _ = controller.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let t0 = controller.clock.now();
        let request = Message::Time(TimeBody::v1(TimeVal::ZERO));
        let timeout = Duration::from_millis(CLIENT_REQUEST_TIMEOUT_MS);
        match connection.send_request(request, timeout).await {
            Ok((header, Message::Time(body))) => {
                let t1 = header.sent;
                let t3 = header.received;
                let t2 = body.latency + t0;
                let sum_us = (t1 - t0).as_micros() + (t3 - t2).as_micros();
                controller.latency_us.store(sum_us / 2, Ordering::Relaxed);
            }
            Ok(_) => log::warn!("time sync: unexpected reply type"),
            Err(err) => log::debug!("time sync request failed: {err}"),
        }
    }
}

async fn run_message_loop(controller: Arc<Controller>, mut inbound: mpsc::UnboundedReceiver<Message>) {
    let decoder_state: Mutex<Option<DecoderState>> = Mutex::new(None);
    loop {
        let message = tokio::select! {
            _ = controller.shutdown.cancelled() => break,
            message = inbound.recv() => match message {
                Some(m) => m,
                None => break,
            },
        };

        match message {
            Message::CodecHeader(header) => match make_decoder(&header.codec_name) {
                Ok(mut decoder) => match decoder.set_header(&header) {
                    Ok(format) => {
                        *decoder_state.lock() = Some(DecoderState { decoder, format });
                    }
                    Err(err) => log::warn!("controller: rejecting codec header: {err}"),
                },
                Err(err) => log::warn!("controller: {err}"),
            },
            Message::ServerSettings(settings) => controller.apply_server_settings(&settings),
            Message::WireChunk(chunk) => handle_chunk(&controller, &decoder_state, chunk).await,
            other => log::debug!("controller: ignoring unsolicited {:?}", other.message_type()),
        }
    }

    let _ = controller.renderer.stop().await;
}

async fn handle_chunk(controller: &Arc<Controller>, decoder_state: &Mutex<Option<DecoderState>>, mut chunk: WireChunkBody) {
    let play_at = chunk.timestamp + controller.play_at_offset();

    let now = controller.clock.now();
    if (now - play_at).as_millis().unsigned_abs() as i64 > RESYNC_TOLERANCE_MS.unsigned_abs() as i64 * 4 {
        log::debug!("controller: chunk skew exceeds resync tolerance, dropping");
        return;
    }

    let mut guard = decoder_state.lock();
    let (payload, format) = match guard.as_mut() {
        Some(state) => {
            let ok = state.decoder.decode(&mut chunk.payload).unwrap_or(false);
            if ok {
                (chunk.payload, state.format)
            } else {
                let frames = chunk.payload.len() / state.format.frame_size().max(1);
                (crate::chunk::Chunk::silence(state.format, frames, play_at).payload, state.format)
            }
        }
        None => return,
    };
    drop(guard);

    let _ = format;
    let _ = controller.renderer.write(payload, play_at).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ms_to_timeval_handles_negative_offsets() {
        let tv = ms_to_timeval(-1500);
        assert_eq!(tv, TimeVal::ZERO - TimeVal::new(1, 500_000));
    }

    #[test]
    fn ms_to_timeval_handles_positive_offsets() {
        assert_eq!(ms_to_timeval(1500), TimeVal::new(1, 500_000));
    }
}
