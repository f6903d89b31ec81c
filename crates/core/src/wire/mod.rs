//! Wire codec: framed, typed, request/response-correlated messages.
//!
//! Every message is `Header(26 B) || Body(payload_size B)`, all integers
//! little-endian. See [`header`] for the fixed header and [`message`] for the
//! per-type bodies.

mod header;
mod message;

pub use header::{Header, MessageType};
pub use message::{
    decode_message, encode_message, CodecHeaderBody, Message, TimeBody, TimeBodyV2, WireChunkBody,
};
