//! Error types for the RPC runtime.

use crate::buffer::MsgBuffer;

/// Error type for RPC operations.
///
/// Programmer misuse (wrong thread, event-loop reentry, endpoint destruction
/// from a handler) is not represented here: it aborts with a panic when
/// datapath checks are enabled.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error from the underlying transport or control-plane socket.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Session number does not refer to a live session.
    #[error("session {0} not found")]
    SessionNotFound(u16),
    /// Session exists but is not in the connected state.
    #[error("session {0} is not connected")]
    SessionNotConnected(u16),
    /// The slot for the next request number is still occupied.
    #[error("request slot busy on session {0}")]
    SlotBusy(u16),
    /// Per-session credits exhausted.
    #[error("no credits available")]
    NoCredits,
    /// Session table is full.
    #[error("out of sessions (max {0})")]
    OutOfSessions(usize),
    /// Remote URI did not resolve to a socket address.
    #[error("bad remote uri: {0}")]
    BadUri(String),
    /// Message exceeds the configured maximum.
    #[error("message too large: {size} bytes, max {max} bytes")]
    MsgTooLarge { size: usize, max: usize },
    /// Message-buffer budget exhausted.
    #[error("message buffer pool exhausted (max {0})")]
    BufPoolExhausted(usize),
    /// Packet-buffer pool exhausted.
    #[error("packet buffer pool exhausted")]
    PktPoolExhausted,
    /// Operation is illegal from inside a request handler or continuation.
    #[error("operation forbidden from a request handler or continuation")]
    ForbiddenContext,
    /// Fault injection called from a non-creator thread or disabled at
    /// compile time.
    #[error("fault injection forbidden")]
    FaultInjectionForbidden,
    /// Packet failed header validation.
    #[error("invalid packet: {0}")]
    InvalidPacket(&'static str),
    /// Invalid magic number in a packet header.
    #[error("invalid magic: expected {expected:#x}, got {got:#x}")]
    InvalidMagic { expected: u8, got: u8 },
    /// Buffer too small for the requested operation.
    #[error("buffer too small: required {required} bytes, available {available} bytes")]
    BufferTooSmall { required: usize, available: usize },
    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Endpoint id already registered with the Nexus.
    #[error("endpoint id {0} already registered")]
    EndpointIdInUse(u8),
    /// Handler table is frozen (an endpoint has already been created).
    #[error("handler registration after an endpoint was created")]
    HandlerTableFrozen,
}

/// Result type for RPC operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failed `enqueue_request`, carrying the request and response buffers back
/// to the caller.
#[derive(Debug)]
pub struct EnqueueError {
    /// What went wrong.
    pub error: Error,
    /// The request buffer, returned untouched.
    pub req: MsgBuffer,
    /// The response buffer, returned untouched.
    pub resp: MsgBuffer,
}

impl std::fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "enqueue_request failed: {}", self.error)
    }
}

impl std::error::Error for EnqueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
