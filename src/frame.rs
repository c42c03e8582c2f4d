use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    PeerId,
    error::{Error, ErrorKind, Result},
};

/// Message mode distinguishing call semantics.
///
/// `Invoke` and `Sync` expect a reply-producing path, `Notify` does not,
/// `Return` carries a reply. `Sync` is the server-initiated variant of
/// `Invoke`; the dispatch path treats both identically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Mode {
    Invoke = 0,
    Return = 1,
    Notify = 2,
    Sync = 3,
}

impl Mode {
    /// Decodes a wire byte; unknown values fall back to `Invoke`.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Mode::Return,
            2 => Mode::Notify,
            3 => Mode::Sync,
            _ => Mode::Invoke,
        }
    }

    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn expects_reply(self) -> bool {
        matches!(self, Mode::Invoke | Mode::Sync)
    }
}

const U32_SIZE: usize = std::mem::size_of::<u32>();

/// Logical frame carried by Invoke/Notify/Sync traffic.
///
/// Layout (big-endian):
///
/// ```text
/// | i32 peer_len | peer bytes | u32 invoke_id | u32 method_id | args |
/// ```
///
/// `invoke_id` is zero for notifies, which never create pending entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFrame {
    pub src_peer: PeerId,
    pub invoke_id: u32,
    pub method_id: u32,
    pub args: Bytes,
}

impl CallFrame {
    pub fn encode(&self, out: &mut BytesMut) {
        let peer = self.src_peer.as_bytes();
        out.put_i32(peer.len() as i32);
        out.put_slice(peer);
        out.put_u32(self.invoke_id);
        out.put_u32(self.method_id);
        out.put_slice(&self.args);
    }

    pub fn parse(mut buf: Bytes) -> Result<Self> {
        if buf.len() < U32_SIZE {
            return Err(Error::new(
                ErrorKind::ParseFailed,
                format!("call frame too short: {}", buf.len()),
            ));
        }
        let peer_len = buf.get_i32();
        if peer_len < 0 || buf.len() < peer_len as usize + U32_SIZE * 2 {
            return Err(Error::new(
                ErrorKind::ParseFailed,
                format!("invalid peer length: {peer_len}"),
            ));
        }
        let src_peer = if peer_len == 0 {
            PeerId::nil()
        } else {
            let peer_bytes = buf.split_to(peer_len as usize);
            PeerId::from_slice(&peer_bytes).ok_or_else(|| {
                Error::new(
                    ErrorKind::ParseFailed,
                    format!("invalid peer length: {peer_len}"),
                )
            })?
        };
        let invoke_id = buf.get_u32();
        let method_id = buf.get_u32();
        Ok(Self {
            src_peer,
            invoke_id,
            method_id,
            args: buf,
        })
    }
}

/// Logical frame carried by Return traffic.
///
/// Layout (big-endian):
///
/// ```text
/// | u32 invoke_id | i32 status | value bytes (status > 0 only) |
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnFrame {
    pub invoke_id: u32,
    pub status: i32,
    pub value: Bytes,
}

impl ReturnFrame {
    pub const STATUS_OK: i32 = 1;
    pub const STATUS_FAILED: i32 = -1;

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status > 0
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u32(self.invoke_id);
        out.put_i32(self.status);
        if self.is_ok() {
            out.put_slice(&self.value);
        }
    }

    pub fn parse(mut buf: Bytes) -> Result<Self> {
        if buf.len() < U32_SIZE * 2 {
            return Err(Error::new(
                ErrorKind::ParseFailed,
                format!("return frame too short: {}", buf.len()),
            ));
        }
        let invoke_id = buf.get_u32();
        let status = buf.get_i32();
        Ok(Self {
            invoke_id,
            status,
            value: buf,
        })
    }
}

/// Outer envelope used by the broker bindings (pub/sub and queue).
///
/// Layout: `| u8 mode | u16 sid_len | sid bytes | inner frame |`. The only
/// job of an envelope is to let the adaptor extract `(service id, mode)` and
/// hand the inner logical frame to the right consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub mode: Mode,
    pub service_id: String,
}

impl Envelope {
    pub fn wrap(&self, inner: &[u8]) -> Result<Bytes> {
        let sid = self.service_id.as_bytes();
        let sid_len = u16::try_from(sid.len()).map_err(|_| {
            Error::new(
                ErrorKind::SerializeFailed,
                format!("service id too long: {}", sid.len()),
            )
        })?;
        let mut out = BytesMut::with_capacity(3 + sid.len() + inner.len());
        out.put_u8(self.mode.as_u8());
        out.put_u16(sid_len);
        out.put_slice(sid);
        out.put_slice(inner);
        Ok(out.freeze())
    }

    /// Splits an enveloped message into its header and inner frame.
    pub fn unwrap(mut buf: Bytes) -> Result<(Self, Bytes)> {
        if buf.len() < 3 {
            return Err(Error::new(
                ErrorKind::ParseFailed,
                format!("envelope too short: {}", buf.len()),
            ));
        }
        let mode = Mode::from_u8(buf.get_u8());
        let sid_len = buf.get_u16() as usize;
        if buf.len() < sid_len {
            return Err(Error::new(
                ErrorKind::ParseFailed,
                format!("invalid service id length: {sid_len}"),
            ));
        }
        let sid_bytes = buf.split_to(sid_len);
        let service_id = std::str::from_utf8(&sid_bytes)
            .map_err(|e| Error::new(ErrorKind::ParseFailed, e.to_string()))?
            .to_string();
        Ok((Self { mode, service_id }, buf))
    }
}
