//! Framed TCP gateway binding.
//!
//! Connection-oriented, poll-driven, best-effort: sends attempted while the
//! link is down are dropped (and logged), not queued. The adaptor owns the
//! reconnect loop; its logical peer id survives reconnects while each
//! connection attempt mints a fresh session id.

const MAX_MSG_SIZE: usize = 16 << 20;

mod codec;
pub(crate) use codec::GateMessage;

mod gate_adaptor;
pub use gate_adaptor::{ConnState, GateAdaptor, GateConfig};
