//! snapstream-core — shared library for the multi-room synchronized audio
//! broadcaster.
//!
//! A server ingests PCM from one or more sources, encodes each stream once,
//! and fans the encoded chunks out to any number of clients, which decode
//! and render them in lock-step using a steady-clock time sync with the
//! server. The crate is organized along the pipeline:
//!
//! - [`uri`] / [`reader`]: source URIs and the readers they select
//! - [`chunk`]: sample format and the PCM chunk type shared end to end
//! - [`codec`]: server-side encoder pipeline
//! - [`stream`]: one source's state machine — reader, encoder, subscribers
//! - [`wire`]: the framed, typed, request/response-correlated message codec
//! - [`pending`]: generic request/response correlation shared by both sides of the wire
//! - [`time`]: monotonic clock and the `TimeVal` wire type
//! - [`zerocopy`]: the opportunistic zero-copy send path
//! - [`session`]: one server-side client connection
//! - [`server`]: the fan-out server tying streams to sessions
//! - [`pool`]: the buffer pool used by the hot encode/send path
//! - [`control`]: the JSON-RPC stream control client
//! - [`decoder`]: client-side decoder pipeline, the mirror of [`codec`]
//! - [`client`]: client-side connection and playback controller
//! - [`properties`]: stream metadata/properties shared by control and the API surface
//! - [`persistence`]: the `server.json` groups/clients store
//! - [`events`]: a small sink trait for surfacing runtime events to a host application
//! - [`error`]: the crate's error type

#![warn(clippy::all)]

pub mod chunk;
pub mod client;
pub mod codec;
pub mod control;
pub mod decoder;
pub mod error;
pub mod events;
pub mod pending;
pub mod persistence;
pub mod pool;
pub mod properties;
pub mod protocol_constants;
pub mod reader;
pub mod server;
pub mod session;
pub mod stream;
pub mod time;
pub mod uri;
pub mod wire;
pub mod zerocopy;

pub use chunk::{Chunk, SampleFormat};
pub use client::{ClientConnection, ClientIdentity, Controller, NullRenderer, Renderer};
pub use codec::{make_encoder, Encoder};
pub use decoder::{make_decoder, Decoder};
pub use error::{ErrorCode, SnapError, SnapResult};
pub use pending::PendingRequests;
pub use persistence::{PersistentStore, ServerState};
pub use server::{Server, ServerConfig};
pub use session::{Session, SessionConfig, SessionReceiver};
pub use stream::{Stream, StreamEvent};
pub use time::{SteadyClock, TimeVal};
pub use uri::StreamUri;
