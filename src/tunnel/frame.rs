//! Frame encoding/decoding for the tunnel subprotocol
//!
//! Frame format (all integers big endian):
//! ```text
//! CONNECT_SUCCESS_SID   (0x0001): u32 sid_len ; sid_len bytes
//! RECONNECT_SUCCESS_ACK (0x0002): u64 cumulative_received
//! DATA                  (0x0004): u32 len ; len bytes payload
//! ACK                   (0x0007): u64 cumulative_received
//! ```
//!
//! Unknown tags decode fine and are skipped by [`Frame::parse`], so the
//! gateway can introduce new control frames without breaking this client.

use super::TunnelError;
use crate::protocol::{
    COUNTER_LEN, LEN_PREFIX_LEN, MAX_DATA_FRAME, TAG_ACK, TAG_CONNECT_SUCCESS_SID, TAG_DATA,
    TAG_LEN, TAG_RECONNECT_SUCCESS_ACK,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Known frame tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FrameType {
    /// Session established, carries the session id
    ConnectSuccessSid = TAG_CONNECT_SUCCESS_SID,
    /// Session resumed, carries the peer's received byte count
    ReconnectSuccessAck = TAG_RECONNECT_SUCCESS_ACK,
    /// Tunnel payload
    Data = TAG_DATA,
    /// Cumulative acknowledgement
    Ack = TAG_ACK,
}

impl FrameType {
    /// Map a wire tag to a known frame type
    pub fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            TAG_CONNECT_SUCCESS_SID => Some(FrameType::ConnectSuccessSid),
            TAG_RECONNECT_SUCCESS_ACK => Some(FrameType::ReconnectSuccessAck),
            TAG_DATA => Some(FrameType::Data),
            TAG_ACK => Some(FrameType::Ack),
            _ => None,
        }
    }

    /// Wire tag
    pub fn tag(self) -> u16 {
        self as u16
    }
}

/// A decoded subprotocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    ConnectSuccessSid(Bytes),
    ReconnectSuccessAck(u64),
    Data(Bytes),
    Ack(u64),
}

impl Frame {
    /// Frame type of this frame
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::ConnectSuccessSid(_) => FrameType::ConnectSuccessSid,
            Frame::ReconnectSuccessAck(_) => FrameType::ReconnectSuccessAck,
            Frame::Data(_) => FrameType::Data,
            Frame::Ack(_) => FrameType::Ack,
        }
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes, TunnelError> {
        match self {
            Frame::ConnectSuccessSid(sid) => Ok(encode_length_prefixed(TAG_CONNECT_SUCCESS_SID, sid)),
            Frame::ReconnectSuccessAck(count) => Ok(encode_counter(TAG_RECONNECT_SUCCESS_ACK, *count)),
            Frame::Data(payload) => encode_data(payload),
            Frame::Ack(count) => Ok(encode_ack(*count)),
        }
    }

    /// Parse a complete WebSocket message into a frame.
    ///
    /// Returns `Ok(None)` for frames with an unknown tag.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>, TunnelError> {
        let (tag, body) = decode(buf)?;
        let frame = match FrameType::from_tag(tag) {
            Some(FrameType::ConnectSuccessSid) => Frame::ConnectSuccessSid(parse_sid(body)?),
            Some(FrameType::ReconnectSuccessAck) => {
                Frame::ReconnectSuccessAck(parse_ack_count(body)?)
            }
            Some(FrameType::Data) => Frame::Data(parse_data_payload(body)?),
            Some(FrameType::Ack) => Frame::Ack(parse_ack_count(body)?),
            None => return Ok(None),
        };
        Ok(Some(frame))
    }
}

/// Wrap a payload in a DATA frame
pub fn encode_data(payload: &[u8]) -> Result<Bytes, TunnelError> {
    if payload.len() > MAX_DATA_FRAME {
        return Err(TunnelError::FrameTooLarge(payload.len(), MAX_DATA_FRAME));
    }
    Ok(encode_length_prefixed(TAG_DATA, payload))
}

/// Build an ACK frame for the given cumulative byte count
pub fn encode_ack(bytes_received: u64) -> Bytes {
    encode_counter(TAG_ACK, bytes_received)
}

fn encode_length_prefixed(tag: u16, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(TAG_LEN + LEN_PREFIX_LEN + body.len());
    buf.put_u16(tag);
    buf.put_u32(body.len() as u32);
    buf.extend_from_slice(body);
    buf.freeze()
}

fn encode_counter(tag: u16, count: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(TAG_LEN + COUNTER_LEN);
    buf.put_u16(tag);
    buf.put_u64(count);
    buf.freeze()
}

/// Split a message into its tag and the remaining body
pub fn decode(buf: &[u8]) -> Result<(u16, &[u8]), TunnelError> {
    if buf.len() < TAG_LEN {
        return Err(TunnelError::IncompleteFrame);
    }
    let mut cursor = buf;
    let tag = cursor.get_u16();
    Ok((tag, cursor))
}

/// Session id from a CONNECT_SUCCESS_SID body
pub fn parse_sid(body: &[u8]) -> Result<Bytes, TunnelError> {
    length_prefixed(body)
}

/// Counter from a RECONNECT_SUCCESS_ACK or ACK body
pub fn parse_ack_count(body: &[u8]) -> Result<u64, TunnelError> {
    if body.len() < COUNTER_LEN {
        return Err(TunnelError::IncompleteFrame);
    }
    let mut cursor = body;
    Ok(cursor.get_u64())
}

/// Payload from a DATA body
pub fn parse_data_payload(body: &[u8]) -> Result<Bytes, TunnelError> {
    length_prefixed(body)
}

fn length_prefixed(body: &[u8]) -> Result<Bytes, TunnelError> {
    if body.len() < LEN_PREFIX_LEN {
        return Err(TunnelError::IncompleteFrame);
    }
    let mut cursor = body;
    let len = cursor.get_u32() as usize;
    if cursor.len() < len {
        return Err(TunnelError::IncompleteFrame);
    }
    // Anything past the declared length is ignored
    Ok(Bytes::copy_from_slice(&cursor[..len]))
}
