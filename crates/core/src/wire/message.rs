//! Per-type message bodies and the `encode_message` / `decode_message` entry
//! points that tie a [`Header`](super::header::Header) to its body.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::Value;

use crate::error::{SnapError, SnapResult};
use crate::time::{SteadyClock, TimeVal};

use super::header::{Header, MessageType};

/// Reads a length-prefixed (`u32` length, no terminator) string from `buf`.
fn read_string(buf: &mut &[u8]) -> SnapResult<String> {
    if buf.len() < 4 {
        return Err(SnapError::Protocol("truncated string length".into()));
    }
    let len = buf.get_u32_le() as usize;
    if buf.len() < len {
        return Err(SnapError::Protocol("truncated string body".into()));
    }
    let bytes = &buf[..len];
    buf.advance(len);
    String::from_utf8(bytes.to_vec())
        .map_err(|e| SnapError::Protocol(format!("invalid utf8 in string field: {e}")))
}

/// Writes a length-prefixed string: `u32 length` followed by raw bytes, no
/// nul terminator, no alignment padding.
fn write_string(out: &mut BytesMut, s: &str) {
    out.put_u32_le(s.len() as u32);
    out.put_slice(s.as_bytes());
}

fn read_bytes(buf: &mut &[u8]) -> SnapResult<Bytes> {
    if buf.len() < 4 {
        return Err(SnapError::Protocol("truncated blob length".into()));
    }
    let len = buf.get_u32_le() as usize;
    if buf.len() < len {
        return Err(SnapError::Protocol("truncated blob body".into()));
    }
    let bytes = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(bytes)
}

fn write_bytes(out: &mut BytesMut, b: &[u8]) {
    out.put_u32_le(b.len() as u32);
    out.put_slice(b);
}

/// The first typed message sent to every new session: `{codec_name, blob}`.
/// The blob is opaque to everything except the codec that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecHeaderBody {
    pub codec_name: String,
    pub blob: Bytes,
}

/// A raw or encoded chunk of audio with its timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireChunkBody {
    pub timestamp: TimeVal,
    pub payload: Bytes,
}

/// Time-sync body. `None` fields distinguish protocol version 1 (latency
/// only) from version 2 (latency plus source-quality metadata).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeBody {
    pub latency: TimeVal,
    pub v2: Option<TimeBodyV2>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeBodyV2 {
    pub version: u8,
    pub source: u8,
    pub quality: f32,
    pub error_ms: f32,
}

impl TimeBody {
    pub fn v1(latency: TimeVal) -> Self {
        Self { latency, v2: None }
    }

    pub fn v2(latency: TimeVal, source: u8, quality: f32, error_ms: f32) -> Self {
        Self {
            latency,
            v2: Some(TimeBodyV2 { version: 2, source, quality, error_ms }),
        }
    }
}

/// A fully typed wire message: header plus body.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    CodecHeader(CodecHeaderBody),
    WireChunk(WireChunkBody),
    /// `bufferMs, latency, volume, muted`, carried verbatim as JSON.
    ServerSettings(Value),
    Time(TimeBody),
    /// `HostName, Mac, ID, Instance, Version, ClientName, OS, Arch,
    /// SnapStreamProtocolVersion`, carried verbatim as JSON.
    Hello(Value),
    /// Client-reported state update, carried verbatim as JSON.
    ClientInfo(Value),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::CodecHeader(_) => MessageType::CodecHeader,
            Message::WireChunk(_) => MessageType::WireChunk,
            Message::ServerSettings(_) => MessageType::ServerSettings,
            Message::Time(_) => MessageType::Time,
            Message::Hello(_) => MessageType::Hello,
            Message::ClientInfo(_) => MessageType::ClientInfo,
        }
    }

    fn encode_body(&self, out: &mut BytesMut) {
        match self {
            Message::CodecHeader(body) => {
                write_string(out, &body.codec_name);
                write_bytes(out, &body.blob);
            }
            Message::WireChunk(body) => {
                out.put_i32_le(body.timestamp.sec);
                out.put_i32_le(body.timestamp.usec);
                write_bytes(out, &body.payload);
            }
            Message::ServerSettings(json) | Message::Hello(json) | Message::ClientInfo(json) => {
                write_string(out, &json.to_string());
            }
            Message::Time(body) => {
                out.put_i32_le(body.latency.sec);
                out.put_i32_le(body.latency.usec);
                if let Some(v2) = body.v2 {
                    out.put_u8(v2.version);
                    out.put_u8(v2.source);
                    out.put_f32_le(v2.quality);
                    out.put_f32_le(v2.error_ms);
                }
            }
        }
    }

    fn decode_body(msg_type: MessageType, mut buf: &[u8]) -> SnapResult<Message> {
        match msg_type {
            MessageType::Base => Err(SnapError::Protocol("Base message is never sent".into())),
            MessageType::CodecHeader => {
                let codec_name = read_string(&mut buf)?;
                let blob = read_bytes(&mut buf)?;
                Ok(Message::CodecHeader(CodecHeaderBody { codec_name, blob }))
            }
            MessageType::WireChunk => {
                if buf.len() < 8 {
                    return Err(SnapError::Protocol("truncated WireChunk timestamp".into()));
                }
                let sec = buf.get_i32_le();
                let usec = buf.get_i32_le();
                let payload = read_bytes(&mut buf)?;
                Ok(Message::WireChunk(WireChunkBody {
                    timestamp: TimeVal::new(sec, usec),
                    payload,
                }))
            }
            MessageType::ServerSettings => {
                let json = parse_json_field(&mut buf)?;
                Ok(Message::ServerSettings(json))
            }
            MessageType::Hello => {
                let json = parse_json_field(&mut buf)?;
                Ok(Message::Hello(json))
            }
            MessageType::ClientInfo => {
                let json = parse_json_field(&mut buf)?;
                Ok(Message::ClientInfo(json))
            }
            MessageType::Time => {
                if buf.len() < 8 {
                    return Err(SnapError::Protocol("truncated Time latency".into()));
                }
                let latency = TimeVal::new(buf.get_i32_le(), buf.get_i32_le());
                // Protocol v1 carries only latency; absence of further bytes
                // is how the receiver detects it, translated to a length
                // check here since we operate on an in-memory slice rather
                // than a stream.
                if buf.is_empty() {
                    return Ok(Message::Time(TimeBody::v1(latency)));
                }
                if buf.len() < 10 {
                    return Err(SnapError::Protocol("truncated Time v2 fields".into()));
                }
                let version = buf.get_u8();
                let source = buf.get_u8();
                let quality = buf.get_f32_le();
                let error_ms = buf.get_f32_le();
                Ok(Message::Time(TimeBody {
                    latency,
                    v2: Some(TimeBodyV2 { version, source, quality, error_ms }),
                }))
            }
        }
    }
}

fn parse_json_field(buf: &mut &[u8]) -> SnapResult<Value> {
    let s = read_string(buf)?;
    serde_json::from_str(&s).map_err(|e| SnapError::Protocol(format!("malformed JSON body: {e}")))
}

/// Encodes `msg` as `Header || Body`, stamping `sent` from `clock` at call
/// time. `id`/`refers_to` must already be set by the caller (session-level
/// request bookkeeping owns that).
pub fn encode_message(msg: &Message, id: u16, refers_to: u16, clock: &SteadyClock, out: &mut BytesMut) {
    let mut body = BytesMut::new();
    msg.encode_body(&mut body);
    let header = Header {
        msg_type: msg.message_type(),
        id,
        refers_to,
        sent: clock.now(),
        received: TimeVal::ZERO,
        payload_size: body.len() as u32,
    };
    header.encode(out);
    out.extend_from_slice(&body);
}

/// Decodes a message body given an already-parsed `header` and the raw body
/// bytes (exactly `header.payload_size` bytes). Stamps `received` is the
/// caller's responsibility (the session records it at read time).
pub fn decode_message(header: &Header, body: &[u8]) -> SnapResult<Message> {
    if body.len() != header.payload_size as usize {
        return Err(SnapError::Protocol(format!(
            "body length {} does not match header payload_size {}",
            body.len(),
            header.payload_size
        )));
    }
    Message::decode_body(header.msg_type, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(msg: Message) -> Message {
        let clock = SteadyClock::new();
        let mut buf = BytesMut::new();
        encode_message(&msg, 0, 0, &clock, &mut buf);
        let header = Header::decode(&buf).unwrap();
        let body = &buf[crate::protocol_constants::HEADER_SIZE..];
        decode_message(&header, body).unwrap()
    }

    #[test]
    fn wire_chunk_round_trips() {
        let msg = Message::WireChunk(WireChunkBody {
            timestamp: TimeVal::new(1, 2),
            payload: Bytes::from_static(&[0u8; 3840]),
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn codec_header_round_trips() {
        let msg = Message::CodecHeader(CodecHeaderBody {
            codec_name: "pcm".into(),
            blob: Bytes::from_static(b"48000:16:2"),
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn hello_json_round_trips() {
        let msg = Message::Hello(json!({
            "HostName": "h",
            "Mac": "aa:bb:cc:dd:ee:ff",
            "Instance": 1,
        }));
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn time_v1_detected_by_length() {
        let msg = Message::Time(TimeBody::v1(TimeVal::new(0, 500)));
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn time_v2_round_trips() {
        let msg = Message::Time(TimeBody::v2(TimeVal::new(0, 0), 1, 0.9, 2.5));
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn oversize_type_byte_is_rejected() {
        let err = Message::decode_body(MessageType::Base, &[]).unwrap_err();
        assert!(matches!(err, SnapError::Protocol(_)));
    }
}
