use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    Mode, PeerId,
    error::{Error, ErrorKind, Result},
};

/// Outer message tag of the gateway protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum GateMessage {
    Handshake = 1,
    Received = 2,
    Subscribe = 3,
    AddForward = 7,
    RemoveForward = 22,
    Unicast = 33,
    Multicast = 36,
}

impl GateMessage {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(GateMessage::Handshake),
            2 => Some(GateMessage::Received),
            3 => Some(GateMessage::Subscribe),
            7 => Some(GateMessage::AddForward),
            22 => Some(GateMessage::RemoveForward),
            33 => Some(GateMessage::Unicast),
            36 => Some(GateMessage::Multicast),
            _ => None,
        }
    }
}

const U32_SIZE: usize = std::mem::size_of::<u32>();

fn finish(mut body: BytesMut) -> Bytes {
    let len = (body.len() - U32_SIZE) as u32;
    body[..U32_SIZE].copy_from_slice(&len.to_be_bytes());
    body.freeze()
}

fn begin(tag: GateMessage, capacity: usize) -> BytesMut {
    let mut body = BytesMut::with_capacity(U32_SIZE + 1 + capacity);
    body.put_u32(0); // length placeholder
    body.put_u8(tag as u8);
    body
}

/// `| len | Handshake | 16B peer |`: announces the logical peer id, sent on
/// every (re)connect.
pub(crate) fn encode_handshake(peer: PeerId) -> Bytes {
    let mut body = begin(GateMessage::Handshake, PeerId::LEN);
    body.put_slice(peer.as_bytes());
    finish(body)
}

/// `| len | Unicast | 16B dst | u32 service_id | u8 mode | inner |`
pub(crate) fn encode_unicast(dst: PeerId, service_id: u32, mode: Mode, inner: &[u8]) -> Bytes {
    let mut body = begin(GateMessage::Unicast, PeerId::LEN + 5 + inner.len());
    body.put_slice(dst.as_bytes());
    body.put_u32(service_id);
    body.put_u8(mode.as_u8());
    body.put_slice(inner);
    finish(body)
}

/// `| len | Multicast | u32 forward_id | u32 service_id | u8 mode | inner |`
pub(crate) fn encode_multicast(forward_id: u32, service_id: u32, mode: Mode, inner: &[u8]) -> Bytes {
    let mut body = begin(GateMessage::Multicast, 9 + inner.len());
    body.put_u32(forward_id);
    body.put_u32(service_id);
    body.put_u8(mode.as_u8());
    body.put_slice(inner);
    finish(body)
}

/// `| len | tag | u32 id | 16B peer |`: forward-group and subscription
/// control messages.
pub(crate) fn encode_control(tag: GateMessage, id: u32, peer: PeerId) -> Bytes {
    let mut body = begin(tag, 4 + PeerId::LEN);
    body.put_u32(id);
    body.put_slice(peer.as_bytes());
    finish(body)
}

/// Splits one length-prefixed gateway message off the read buffer, or
/// `None` when more bytes are needed.
pub(crate) fn split_frame(buffer: &mut BytesMut) -> Result<Option<Bytes>> {
    if buffer.len() < U32_SIZE {
        return Ok(None);
    }
    let len = u32::from_be_bytes(buffer[..U32_SIZE].try_into().unwrap()) as usize;
    if len == 0 || len >= super::MAX_MSG_SIZE {
        return Err(Error::new(
            ErrorKind::ParseFailed,
            format!("invalid gate frame length: {len}"),
        ));
    }
    if buffer.len() < U32_SIZE + len {
        return Ok(None);
    }
    buffer.advance(U32_SIZE);
    Ok(Some(buffer.split_to(len).freeze()))
}

/// Parses the body of a `Received` message into `(service_id, mode, inner)`.
pub(crate) fn parse_received(mut body: Bytes) -> Result<(u32, Mode, Bytes)> {
    if body.len() < 5 {
        return Err(Error::new(
            ErrorKind::ParseFailed,
            format!("received envelope too short: {}", body.len()),
        ));
    }
    let service_id = body.get_u32();
    let mode = Mode::from_u8(body.get_u8());
    Ok((service_id, mode, body))
}
