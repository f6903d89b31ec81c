//! The 26-byte fixed header that precedes every wire message.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{SnapError, SnapResult};
use crate::protocol_constants::{HEADER_SIZE, MAX_MESSAGE_TYPE, MAX_PAYLOAD_SIZE, NO_REQUEST_ID};
use crate::time::TimeVal;

/// Known wire message types. Note the deliberate gap at `6`: upstream reserved
/// it for stream tags and never shipped them, and this crate preserves the
/// gap so a byte-for-byte-compatible wire capture stays interpretable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    Base = 0,
    CodecHeader = 1,
    WireChunk = 2,
    ServerSettings = 3,
    Time = 4,
    Hello = 5,
    ClientInfo = 7,
}

impl MessageType {
    pub fn from_u16(v: u16) -> SnapResult<Self> {
        match v {
            0 => Ok(Self::Base),
            1 => Ok(Self::CodecHeader),
            2 => Ok(Self::WireChunk),
            3 => Ok(Self::ServerSettings),
            4 => Ok(Self::Time),
            5 => Ok(Self::Hello),
            7 => Ok(Self::ClientInfo),
            _ if v > MAX_MESSAGE_TYPE => {
                Err(SnapError::Protocol(format!("message type {v} exceeds known range")))
            }
            _ => Err(SnapError::Protocol(format!("unknown message type {v}"))),
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// The fixed header common to every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub msg_type: MessageType,
    /// Sender-assigned correlation id; `NO_REQUEST_ID` if this message expects
    /// no reply.
    pub id: u16,
    /// `0`, or the `id` of the request this message answers.
    pub refers_to: u16,
    /// Timestamp stamped at serialize time.
    pub sent: TimeVal,
    /// Timestamp stamped at deserialize time.
    pub received: TimeVal,
    /// Size of the body that follows, in bytes.
    pub payload_size: u32,
}

impl Header {
    pub fn new(msg_type: MessageType, payload_size: u32) -> Self {
        Self {
            msg_type,
            id: NO_REQUEST_ID,
            refers_to: 0,
            sent: TimeVal::ZERO,
            received: TimeVal::ZERO,
            payload_size,
        }
    }

    /// Writes the 26-byte header, little-endian, no padding.
    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u16_le(self.msg_type.as_u16());
        out.put_u16_le(self.id);
        out.put_u16_le(self.refers_to);
        out.put_i32_le(self.sent.sec);
        out.put_i32_le(self.sent.usec);
        out.put_i32_le(self.received.sec);
        out.put_i32_le(self.received.usec);
        out.put_u32_le(self.payload_size);
    }

    /// Parses a 26-byte header from `buf`, which must contain at least
    /// `HEADER_SIZE` bytes. Validates `payload_size` against the protocol
    /// ceiling but does not consume or validate the body.
    pub fn decode(buf: &[u8]) -> SnapResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(SnapError::Protocol(format!(
                "short header: need {HEADER_SIZE} bytes, got {}",
                buf.len()
            )));
        }
        let mut cursor = buf;
        let msg_type = MessageType::from_u16(cursor.get_u16_le())?;
        let id = cursor.get_u16_le();
        let refers_to = cursor.get_u16_le();
        let sent = TimeVal::new(cursor.get_i32_le(), cursor.get_i32_le());
        let received = TimeVal::new(cursor.get_i32_le(), cursor.get_i32_le());
        let payload_size = cursor.get_u32_le();
        if payload_size > MAX_PAYLOAD_SIZE {
            return Err(SnapError::InvalidArgument(format!(
                "payload_size {payload_size} exceeds {MAX_PAYLOAD_SIZE}"
            )));
        }
        Ok(Self {
            msg_type,
            id,
            refers_to,
            sent,
            received,
            payload_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn round_trips_through_encode_decode() {
        let header = Header {
            msg_type: MessageType::WireChunk,
            id: 42,
            refers_to: 7,
            sent: TimeVal::new(10, 20),
            received: TimeVal::new(11, 21),
            payload_size: 3840,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);
        let decoded = Header::decode(&buf).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn rejects_oversize_payload() {
        let header = Header::new(MessageType::WireChunk, MAX_PAYLOAD_SIZE + 1);
        let mut buf = BytesMut::new();
        buf.put_u16_le(header.msg_type.as_u16());
        buf.put_u16_le(header.id);
        buf.put_u16_le(header.refers_to);
        buf.put_i32_le(0);
        buf.put_i32_le(0);
        buf.put_i32_le(0);
        buf.put_i32_le(0);
        buf.put_u32_le(MAX_PAYLOAD_SIZE + 1);
        let err = Header::decode(&buf).unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
    }

    #[test]
    fn rejects_short_buffer() {
        let buf = [0u8; 10];
        let err = Header::decode(&buf).unwrap_err();
        assert_eq!(err.code(), "protocol_error");
    }

    #[test]
    fn rejects_unknown_type_above_range() {
        assert!(MessageType::from_u16(8).is_err());
        assert!(MessageType::from_u16(6).is_err());
    }

    #[test]
    fn gap_at_six_is_rejected_not_silently_accepted() {
        let err = MessageType::from_u16(6).unwrap_err();
        assert_eq!(err.code(), "protocol_error");
    }
}
