//! Per-connection state. See spec §3 (ConnectionState, TxnState) and §9's
//! design note to express the mode as a tagged variant rather than loose
//! optional fields.

use bytes::BytesMut;

/// Connection identity, stable for the lifetime of the TCP connection.
/// Doubles as the mio `Token` value for that socket (see `event_loop.rs`).
pub type ConnId = usize;

/// `MULTI`'s queue of not-yet-executed commands, each kept as its raw
/// decoded token vector so that validation happens at EXEC time, never at
/// enqueue time (spec §4.5's simplified policy).
#[derive(Default)]
pub struct TxnState {
    pub queue: Vec<Vec<Vec<u8>>>,
}

/// At most one of "queuing a transaction" and "blocked on XREAD" holds at
/// any instant (spec §3 invariant; MULTI never blocks).
pub enum ConnectionMode {
    Normal,
    Queuing(TxnState),
    Blocked,
}

pub struct Connection {
    pub id: ConnId,
    pub read_buf: BytesMut,
    pub write_buf: Vec<u8>,
    pub mode: ConnectionMode,
    /// Set once the connection should be dropped after its write buffer
    /// drains (protocol error, EOF already observed, etc).
    pub closing: bool,
}

impl Connection {
    pub fn new(id: ConnId) -> Self {
        Self {
            id,
            read_buf: BytesMut::with_capacity(4096),
            write_buf: Vec::new(),
            mode: ConnectionMode::Normal,
            closing: false,
        }
    }

    pub fn queue_reply(&mut self, bytes: &[u8]) {
        self.write_buf.extend_from_slice(bytes);
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self.mode, ConnectionMode::Blocked)
    }
}
