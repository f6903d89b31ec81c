//! Hooks the core uses to publish stream/client state changes.
//!
//! §1 keeps the JSON-RPC control plane and Web UI out of scope but
//! requires that "the core exposes hooks to publish stream/client state" (§1)
//! — this module is that seam. A concrete RPC/Web-UI layer subscribes by
//! implementing [`EventSink`]; the standalone binaries in this workspace use
//! [`LoggingEventSink`], which just logs transitions, since no RPC surface is
//! specified here.

use crate::properties::{Properties, StreamState};

/// A stream or client state transition worth publishing outward.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// A stream's reader-driven state changed (idle/playing/disabled).
    StreamStateChanged { stream_id: String, state: StreamState },
    /// A stream's properties changed (metadata, playback status, capabilities).
    StreamPropertiesChanged { stream_id: String, properties: Properties },
    /// A client connected or disconnected.
    ClientConnected { client_id: String, stream_id: String },
    ClientDisconnected { client_id: String },
    /// A reader observed wall-clock drift beyond tolerance and resynced.
    ReaderResync { stream_id: String, lag_ms: i64 },
}

/// Sink that receives [`CoreEvent`]s. Implementations must not block: this is
/// called from hot paths (the reader's cadence loop, a session's receive
/// loop).
pub trait EventSink: Send + Sync {
    fn publish(&self, event: CoreEvent);
}

/// Default sink: logs every event at `debug` and discards it. Used by the
/// reference binaries; a real control-plane crate would swap this for a
/// broadcast-channel-backed sink feeding its Web UI/RPC server.
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn publish(&self, event: CoreEvent) {
        log::debug!("event: {event:?}");
    }
}

/// Sink that discards everything. Useful in tests that don't care about the
/// event stream.
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn publish(&self, _event: CoreEvent) {}
}
