//! Session and slot management.
//!
//! A session connects two endpoints; its slots track individual
//! request/response exchanges. Each slot is either empty or holds exactly one
//! outstanding exchange, client-side or server-side, and the slot for a
//! request number is fixed: `req_num % req_window`.

use std::cell::Cell;
use std::net::SocketAddr;

use crate::buffer::MsgBuffer;
use crate::config::RpcConfig;
use crate::error::{Error, Result};
use crate::sm::SmPacket;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connect handshake sent, waiting for the ACK.
    ConnectInProgress,
    /// Ready for exchanges.
    Connected,
    /// Disconnect handshake in flight.
    DisconnectInProgress,
    /// Peer reset in flight.
    ResetInProgress,
    /// Terminal failure; every enqueue is rejected.
    Error,
}

/// Which side of the session this endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Client,
    Server,
}

/// A handle to a session in the local table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u16);

impl SessionHandle {
    /// Local session number.
    #[inline]
    pub fn session_num(&self) -> u16 {
        self.0
    }
}

/// Sentinel for a not-yet-known peer session number.
pub const UNKNOWN_SESS_NUM: u16 = u16::MAX;

/// Client-side exchange state.
pub struct ClientSlot<U> {
    /// Request number of the exchange.
    pub req_num: u64,
    /// Request type.
    pub req_type: u8,
    /// Request payload, borrowed from the user for the exchange.
    pub req: MsgBuffer,
    /// Response buffer, written into during RX.
    pub resp: MsgBuffer,
    /// Continuation, taken exactly once at completion.
    pub cont: Option<U>,
    /// Opaque user tag passed through to the continuation.
    pub tag: u64,
    /// Response packets received so far.
    pub pkts_rcvd: u16,
    /// Response packets expected; 0 until the first response packet arrives.
    pub pkts_total: u16,
    /// Retransmissions consumed.
    pub retries: u32,
    /// Timestamp of the last (re)transmission, microseconds.
    pub tx_ts: u64,
}

/// Server-side exchange state.
pub struct ServerSlot {
    /// Request number of the exchange.
    pub req_num: u64,
    /// Request type.
    pub req_type: u8,
    /// Request reassembly buffer; taken when the handler is dispatched.
    pub req: Option<MsgBuffer>,
    /// Next expected request packet index (in-order reassembly).
    pub expected_pkt: u16,
    /// Total packets in the request.
    pub req_pkts_total: u16,
    /// Handler dispatched and not yet returned a response.
    pub in_handler: bool,
    /// Response produced; retained for retransmission until the next
    /// request claims the slot.
    pub finished: bool,
    /// Response payload.
    pub resp: Option<MsgBuffer>,
    /// Response packets whose send completion is still outstanding. The slot
    /// retires only when this drains to zero.
    pub resp_tx_outstanding: u16,
}

/// One concurrency unit of a session.
pub enum SSlot<U> {
    Empty,
    Client(ClientSlot<U>),
    Server(ServerSlot),
}

impl<U> SSlot<U> {
    /// Check if the slot holds no exchange.
    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, SSlot::Empty)
    }
}

/// In-flight session-management exchange. At most one per session.
#[derive(Debug, Clone)]
pub struct SmPending {
    /// The request packet, resent verbatim on timeout.
    pub pkt: SmPacket,
    /// Next retry deadline, microseconds.
    pub next_deadline_us: u64,
    /// Transmissions so far.
    pub tries: u32,
}

/// A session: one connected pair of endpoints.
pub struct Session<U> {
    /// Local session number.
    pub local_num: u16,
    /// Client or server side.
    pub role: SessionRole,
    /// Session state.
    pub state: SessionState,
    /// Peer process SM listener address.
    pub peer_uri: SocketAddr,
    /// Peer endpoint id.
    pub peer_rpc_id: u8,
    /// Peer's session number for this session.
    pub peer_sess_num: u16,
    /// Peer datapath address, learned during the connect handshake.
    pub peer_dp_addr: Option<SocketAddr>,
    /// Exchange slots; length equals the request window.
    pub sslots: Vec<SSlot<U>>,
    /// Request window size.
    pub req_window: usize,
    /// Available credits, bounded by the window size.
    credits: Cell<usize>,
    /// Next request number to stamp.
    next_req_num: Cell<u64>,
    /// Next SM sequence number for requests this side originates.
    sm_seq: Cell<u64>,
    /// Pending SM exchange, if any.
    pub sm_pending: Option<SmPending>,
    /// Highest peer SM sequence handled, with the ACK sent for it. Duplicate
    /// SM requests replay the ACK instead of re-running the transition.
    pub last_sm_ack: Option<(u64, SmPacket)>,
}

impl<U> Session<U> {
    /// Create a new session.
    pub fn new(
        local_num: u16,
        role: SessionRole,
        peer_uri: SocketAddr,
        peer_rpc_id: u8,
        config: &RpcConfig,
    ) -> Self {
        let req_window = config.req_window;
        let sslots = (0..req_window).map(|_| SSlot::Empty).collect();

        Self {
            local_num,
            role,
            state: SessionState::ConnectInProgress,
            peer_uri,
            peer_rpc_id,
            peer_sess_num: UNKNOWN_SESS_NUM,
            peer_dp_addr: None,
            sslots,
            req_window,
            credits: Cell::new(req_window),
            next_req_num: Cell::new(0),
            sm_seq: Cell::new(0),
            sm_pending: None,
            last_sm_ack: None,
        }
    }

    /// Session handle.
    #[inline]
    pub fn handle(&self) -> SessionHandle {
        SessionHandle(self.local_num)
    }

    /// Check if the session accepts new exchanges.
    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Check if this is the client side.
    #[inline]
    pub fn is_client(&self) -> bool {
        self.role == SessionRole::Client
    }

    /// Fixed slot index for a request number.
    #[inline]
    pub fn slot_idx(&self, req_num: u64) -> usize {
        (req_num % self.req_window as u64) as usize
    }

    /// Request number the next exchange would get, without consuming it.
    #[inline]
    pub fn peek_req_num(&self) -> u64 {
        self.next_req_num.get()
    }

    /// Stamp the next request number.
    pub fn next_req_num(&self) -> u64 {
        self.next_req_num.replace(self.next_req_num.get() + 1)
    }

    /// Stamp the next SM sequence number.
    pub fn next_sm_seq(&self) -> u64 {
        self.sm_seq.replace(self.sm_seq.get() + 1)
    }

    /// Consume a credit.
    pub fn consume_credit(&self) -> Result<()> {
        match self.credits.get() {
            0 => Err(Error::NoCredits),
            n => {
                self.credits.set(n - 1);
                Ok(())
            }
        }
    }

    /// Return a credit. Credits never exceed the window size.
    pub fn return_credit(&self) {
        let credits = self.credits.get();
        debug_assert!(credits < self.req_window, "credit overflow");
        self.credits.set((credits + 1).min(self.req_window));
    }

    /// Available credits.
    #[inline]
    pub fn available_credits(&self) -> usize {
        self.credits.get()
    }

    /// Number of empty slots.
    pub fn free_slots(&self) -> usize {
        self.sslots.iter().filter(|s| s.is_empty()).count()
    }

    /// Number of occupied slots.
    pub fn active_slots(&self) -> usize {
        self.req_window - self.free_slots()
    }
}

/// Sparse session table, indexed by local session number.
///
/// Freed numbers go on a stack and are handed out again; a stale handle to a
/// removed session can therefore alias a later one, which is why the
/// datapath always cross-checks request numbers, not just session numbers.
pub struct SessionTable<U> {
    entries: Vec<Option<Session<U>>>,
    /// Unused session numbers, popped LIFO. Seeded in reverse so low
    /// numbers are handed out first.
    free: Vec<u16>,
}

impl<U> SessionTable<U> {
    /// Create a table with the given capacity.
    pub fn new(max_sessions: usize) -> Self {
        Self {
            entries: (0..max_sessions).map(|_| None).collect(),
            free: (0..max_sessions as u16).rev().collect(),
        }
    }

    /// Create a session and install it in the table.
    pub fn create_session(
        &mut self,
        role: SessionRole,
        peer_uri: SocketAddr,
        peer_rpc_id: u8,
        config: &RpcConfig,
    ) -> Result<SessionHandle> {
        let Some(num) = self.free.pop() else {
            return Err(Error::OutOfSessions(self.entries.len()));
        };
        debug_assert!(self.entries[num as usize].is_none());

        let session = Session::new(num, role, peer_uri, peer_rpc_id, config);
        let handle = session.handle();
        self.entries[num as usize] = Some(session);
        Ok(handle)
    }

    /// Get a reference to a session.
    pub fn get(&self, handle: SessionHandle) -> Option<&Session<U>> {
        self.entries.get(handle.0 as usize)?.as_ref()
    }

    /// Get a mutable reference to a session.
    pub fn get_mut(&mut self, handle: SessionHandle) -> Option<&mut Session<U>> {
        self.entries.get_mut(handle.0 as usize)?.as_mut()
    }

    /// Remove a session, recycling its number.
    pub fn remove(&mut self, handle: SessionHandle) -> Option<Session<U>> {
        let session = self.entries.get_mut(handle.0 as usize)?.take()?;
        self.free.push(handle.0);
        Some(session)
    }

    /// Number of live sessions.
    pub fn active_count(&self) -> usize {
        self.entries.len() - self.free.len()
    }

    /// Iterate over live sessions.
    pub fn iter(&self) -> impl Iterator<Item = &Session<U>> {
        self.entries.iter().flatten()
    }

    /// Iterate mutably over live sessions.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session<U>> {
        self.entries.iter_mut().flatten()
    }
}
