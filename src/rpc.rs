//! The RPC endpoint.
//!
//! An [`Rpc`] is owned by exactly one thread. It drives a transport, owns a
//! session table and a packet-buffer pool, multiplexes request/response
//! exchanges onto per-session slots, and invokes user callbacks from its
//! event loop. All datapath operations must happen on the creator thread;
//! violations abort when datapath checks are enabled.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::bg::{BgPool, BgWork};
use crate::buffer::{MsgBuffer, PktBufPool};
use crate::config::RpcConfig;
use crate::error::{EnqueueError, Error, Result};
#[cfg(feature = "fault-injection")]
use crate::fault::FaultState;
use crate::nexus::{HandlerKind, Nexus};
use crate::packet::{PktHdr, PktType, PKT_HDR_SIZE};
use crate::session::{
    ClientSlot, SSlot, ServerSlot, Session, SessionHandle, SessionState, SessionRole,
    SessionTable, SmPending, UNKNOWN_SESS_NUM,
};
use crate::sm::{SmErrCode, SmPacket, SmPayload, SmPktType};
use crate::timing::{now_us, TimerEntry, TimingWheel};
use crate::transport::{Transport, TxPacket};

/// Client continuation: invoked on the endpoint thread when an exchange
/// completes. A zero-length response payload signals failure.
pub type Continuation<T> = Box<dyn FnOnce(&Rpc<T>, RespHandle, u64)>;

/// Session-management event kind, delivered to the endpoint's SM handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmEventKind {
    /// Session reached the connected state (either side).
    Connected,
    /// Connect handshake failed.
    ConnectFailed,
    /// Session torn down.
    Disconnected,
    /// A peer forced this server-side session through a reset.
    PeerReset,
    /// A reset this side initiated was acknowledged.
    ResetComplete,
}

/// Session-management event.
#[derive(Debug, Clone, Copy)]
pub struct SmEvent {
    pub kind: SmEventKind,
    pub session: SessionHandle,
    pub err: SmErrCode,
}

/// Handle to a fully reassembled request, passed to the request handler.
///
/// The handler may call [`enqueue_response`](ReqHandle::enqueue_response) at
/// most once; doing so twice aborts. A handler that returns without
/// responding aborts the exchange, and the client completes it with an empty
/// response.
pub struct ReqHandle {
    pub(crate) sess_num: u16,
    pub(crate) sslot_idx: usize,
    pub(crate) req_num: u64,
    pub(crate) req_type: u8,
    pub(crate) req: MsgBuffer,
    pub(crate) resp: MsgBuffer,
    pub(crate) resp_len: Option<usize>,
}

impl ReqHandle {
    /// Request type of the exchange.
    #[inline]
    pub fn req_type(&self) -> u8 {
        self.req_type
    }

    /// Reassembled request payload.
    #[inline]
    pub fn req_data(&self) -> &[u8] {
        self.req.payload()
    }

    /// Response buffer to fill before calling `enqueue_response`.
    #[inline]
    pub fn resp_buf(&mut self) -> &mut [u8] {
        self.resp.capacity_mut()
    }

    /// Submit the first `len` bytes of the response buffer.
    ///
    /// # Panics
    /// Panics when called twice on the same handle, or when `len` exceeds
    /// the response buffer.
    pub fn enqueue_response(&mut self, len: usize) {
        assert!(
            self.resp_len.is_none(),
            "urpc: enqueue_response called twice on one request handle"
        );
        assert!(len <= self.resp.capacity(), "urpc: response exceeds buffer");
        self.resp_len = Some(len);
    }

    /// Length submitted via `enqueue_response`, if any.
    #[inline]
    pub fn resp_len(&self) -> Option<usize> {
        self.resp_len
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(req: &[u8], resp_cap: usize) -> Self {
        let mut req_buf = MsgBuffer::new(req.len().max(1)).unwrap();
        req_buf.copy_from(req).unwrap();
        Self {
            sess_num: 0,
            sslot_idx: 0,
            req_num: 0,
            req_type: 0,
            req: req_buf,
            resp: MsgBuffer::new(resp_cap).unwrap(),
            resp_len: None,
        }
    }
}

/// Completed exchange handed to the continuation. Owns both user buffers;
/// [`Rpc::release_response`] (or [`into_buffers`](RespHandle::into_buffers))
/// moves them back to the user.
#[derive(Debug)]
pub struct RespHandle {
    req: MsgBuffer,
    resp: MsgBuffer,
}

impl RespHandle {
    /// Response payload. Empty when the endpoint could not complete the
    /// exchange.
    #[inline]
    pub fn resp_data(&self) -> &[u8] {
        self.resp.payload()
    }

    /// Check whether the exchange failed.
    #[inline]
    pub fn is_failure(&self) -> bool {
        self.resp.is_empty()
    }

    /// Move the request and response buffers back out.
    pub fn into_buffers(self) -> (MsgBuffer, MsgBuffer) {
        (self.req, self.resp)
    }
}

/// One packet staged for transmission.
struct TxItem {
    dst: SocketAddr,
    buf_idx: usize,
    len: usize,
    /// Response bookkeeping: (session, slot, req_num) to credit the send
    /// completion against.
    resp_of: Option<(u16, usize, u64)>,
}

/// In-order send bookkeeping; completions retire these FIFO.
struct SendRecord {
    buf_idx: usize,
    resp_of: Option<(u16, usize, u64)>,
}

/// The per-thread RPC endpoint.
pub struct Rpc<T: Transport> {
    id: u8,
    nexus: Arc<Nexus>,
    creator: ThreadId,
    config: RpcConfig,
    mtu: usize,
    local_dp_addr: SocketAddr,

    transport: RefCell<T>,
    pool: RefCell<PktBufPool>,
    sessions: RefCell<SessionTable<Continuation<T>>>,
    wheel: RefCell<TimingWheel>,

    sm_rx: mpsc::Receiver<SmPacket>,
    sm_tx: UdpSocket,
    sm_handler: RefCell<Box<dyn FnMut(SmEvent)>>,

    pending_tx: RefCell<Vec<TxItem>>,
    pending_resp_tx: RefCell<Vec<TxItem>>,
    send_records: RefCell<VecDeque<SendRecord>>,
    ready_conts: RefCell<Vec<(Continuation<T>, RespHandle, u64)>>,

    /// (peer SM uri, peer endpoint id, client session num) -> server session.
    /// Replays connect ACKs for duplicate handshakes.
    connect_dedupe: RefCell<HashMap<(SocketAddr, u8, u16), u16>>,
    resolved_uris: RefCell<HashMap<String, SocketAddr>>,

    bg_pool: Option<RefCell<BgPool>>,
    msg_bufs_outstanding: Cell<usize>,

    /// Set while a request handler or continuation runs on this thread.
    in_handler: Cell<bool>,
    /// Set while the event loop runs; reentry aborts.
    progressing: Cell<bool>,
    /// Whether the current iteration observed new request packets; gates
    /// response batching.
    saw_new_req: Cell<bool>,

    #[cfg(feature = "fault-injection")]
    pub(crate) faults: RefCell<FaultState>,
}

impl<T: Transport> Rpc<T> {
    /// Create an endpoint bound to a Nexus.
    ///
    /// Registers the endpoint id with the Nexus (freezing the handler table)
    /// and registers the packet pool with the transport.
    pub fn new<F>(
        nexus: &Arc<Nexus>,
        id: u8,
        mut transport: T,
        sm_handler: F,
        config: RpcConfig,
    ) -> Result<Self>
    where
        F: FnMut(SmEvent) + 'static,
    {
        config.validate()?;

        let mtu = transport.mtu();
        let local_dp_addr = transport.local_addr();

        let mut pool = PktBufPool::new(config.num_pkt_buffers, mtu)?;
        let (region, region_len) = pool.region();
        let key = transport.register(region, region_len)?;
        pool.set_lkey(key);

        let mut wheel = TimingWheel::default_for_rpc();
        wheel.init(now_us());

        let sm_tx = UdpSocket::bind("0.0.0.0:0")?;

        let bg_pool = if config.num_bg_threads > 0 {
            Some(RefCell::new(BgPool::new(config.num_bg_threads)?))
        } else {
            None
        };

        // Last fallible step, so a construction failure cannot leave a stale
        // inbox behind.
        let sm_rx = nexus.register_endpoint(id)?;

        let max_sessions = config.max_sessions;

        Ok(Self {
            id,
            nexus: nexus.clone(),
            creator: thread::current().id(),
            mtu,
            local_dp_addr,
            transport: RefCell::new(transport),
            pool: RefCell::new(pool),
            sessions: RefCell::new(SessionTable::new(max_sessions)),
            wheel: RefCell::new(wheel),
            sm_rx,
            sm_tx,
            sm_handler: RefCell::new(Box::new(sm_handler)),
            pending_tx: RefCell::new(Vec::new()),
            pending_resp_tx: RefCell::new(Vec::new()),
            send_records: RefCell::new(VecDeque::new()),
            ready_conts: RefCell::new(Vec::new()),
            connect_dedupe: RefCell::new(HashMap::new()),
            resolved_uris: RefCell::new(HashMap::new()),
            bg_pool,
            msg_bufs_outstanding: Cell::new(0),
            in_handler: Cell::new(false),
            progressing: Cell::new(false),
            saw_new_req: Cell::new(false),
            config,
            #[cfg(feature = "fault-injection")]
            faults: RefCell::new(FaultState::default()),
        })
    }

    /// Endpoint id.
    #[inline]
    pub fn id(&self) -> u8 {
        self.id
    }

    /// The Nexus this endpoint is bound to.
    #[inline]
    pub fn nexus(&self) -> &Arc<Nexus> {
        &self.nexus
    }

    /// Endpoint configuration.
    #[inline]
    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Transport MTU.
    #[inline]
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Datapath address of this endpoint.
    #[inline]
    pub fn local_dp_addr(&self) -> SocketAddr {
        self.local_dp_addr
    }

    /// Number of live sessions.
    pub fn active_sessions(&self) -> usize {
        self.sessions.borrow().active_count()
    }

    /// Check whether a session is connected.
    pub fn is_connected(&self, session: SessionHandle) -> bool {
        self.sessions
            .borrow()
            .get(session)
            .map(|s| s.is_connected())
            .unwrap_or(false)
    }

    /// Current state of a session, if it exists.
    pub fn session_state(&self, session: SessionHandle) -> Option<SessionState> {
        self.sessions.borrow().get(session).map(|s| s.state)
    }

    /// Number of exchanges the session can accept right now.
    pub fn window_free_slots(&self, session: SessionHandle) -> usize {
        self.sessions
            .borrow()
            .get(session)
            .map(|s| s.free_slots().min(s.available_credits()))
            .unwrap_or(0)
    }

    pub(crate) fn creator_thread(&self) -> ThreadId {
        self.creator
    }

    #[cfg(feature = "fault-injection")]
    pub(crate) fn faults(&self) -> &RefCell<FaultState> {
        &self.faults
    }

    pub(crate) fn sessions_ref(&self) -> &RefCell<SessionTable<Continuation<T>>> {
        &self.sessions
    }

    fn assert_creator(&self) {
        if (self.config.datapath_checks || cfg!(debug_assertions))
            && thread::current().id() != self.creator
        {
            panic!("urpc: datapath operation from a non-creator thread");
        }
    }

    // ------------------------------------------------------------------
    // Buffers
    // ------------------------------------------------------------------

    /// Allocate a message buffer with `size` bytes of payload capacity,
    /// registered with the transport.
    pub fn alloc_msg_buffer(&self, size: usize) -> Result<MsgBuffer> {
        self.assert_creator();
        if size > self.config.max_msg_size {
            return Err(Error::MsgTooLarge {
                size,
                max: self.config.max_msg_size,
            });
        }
        if self.msg_bufs_outstanding.get() >= self.config.max_msg_buffers {
            return Err(Error::BufPoolExhausted(self.config.max_msg_buffers));
        }
        let buf = self.alloc_internal_msgbuf(size)?;
        self.msg_bufs_outstanding
            .set(self.msg_bufs_outstanding.get() + 1);
        Ok(buf)
    }

    /// Return a message buffer obtained from [`alloc_msg_buffer`](Self::alloc_msg_buffer).
    pub fn free_msg_buffer(&self, buf: MsgBuffer) {
        self.assert_creator();
        self.msg_bufs_outstanding
            .set(self.msg_bufs_outstanding.get().saturating_sub(1));
        drop(buf);
    }

    /// Shrink (or re-grow, within the allocation) a buffer's payload.
    pub fn resize_msg_buffer(&self, buf: &mut MsgBuffer, new_size: usize) -> Result<()> {
        buf.resize(new_size)
    }

    /// Hand the buffers of a completed exchange back to the caller.
    pub fn release_response(&self, resp: RespHandle) -> (MsgBuffer, MsgBuffer) {
        resp.into_buffers()
    }

    fn alloc_internal_msgbuf(&self, size: usize) -> Result<MsgBuffer> {
        let mut buf = MsgBuffer::new(size.max(1))?;
        buf.set_len(size);
        let key = {
            let mut transport = self.transport.borrow_mut();
            transport.register(buf.hdr_ptr(), PKT_HDR_SIZE + buf.capacity())?
        };
        buf.set_lkey(key);
        Ok(buf)
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Create a client session to `remote_uri` (the peer process's Nexus
    /// address, `host:port`) and endpoint `remote_rpc_id`.
    ///
    /// The connect handshake proceeds asynchronously in the event loop; the
    /// SM handler observes the outcome.
    pub fn create_session(&self, remote_uri: &str, remote_rpc_id: u8) -> Result<SessionHandle> {
        self.assert_creator();
        let peer_uri = self.resolve_uri(remote_uri)?;
        let handle = self.sessions.borrow_mut().create_session(
            SessionRole::Client,
            peer_uri,
            remote_rpc_id,
            &self.config,
        )?;
        self.send_connect_req(handle);
        Ok(handle)
    }

    fn resolve_uri(&self, uri: &str) -> Result<SocketAddr> {
        #[cfg(feature = "fault-injection")]
        {
            let mut faults = self.faults.borrow_mut();
            if faults.resolve_server_rinfo {
                faults.resolve_server_rinfo = false;
                self.resolved_uris.borrow_mut().remove(uri);
                tracing::debug!(rpc_id = self.id, uri, "fault: forcing address re-resolution");
            }
        }
        if let Some(addr) = self.resolved_uris.borrow().get(uri) {
            return Ok(*addr);
        }
        let addr = uri
            .to_socket_addrs()
            .map_err(|_| Error::BadUri(uri.into()))?
            .next()
            .ok_or_else(|| Error::BadUri(uri.into()))?;
        self.resolved_uris.borrow_mut().insert(uri.into(), addr);
        Ok(addr)
    }

    fn send_connect_req(&self, handle: SessionHandle) {
        let (pkt, dst) = {
            let mut sessions = self.sessions.borrow_mut();
            let sess = sessions.get_mut(handle).expect("fresh session");
            let seq = sess.next_sm_seq();
            let pkt = SmPacket {
                kind: SmPktType::ConnectReq,
                sender_uri: self.nexus.sm_addr(),
                sender_rpc_id: self.id,
                dst_rpc_id: sess.peer_rpc_id,
                cli_sess_num: sess.local_num,
                svr_sess_num: UNKNOWN_SESS_NUM,
                seq,
                err: SmErrCode::NoError,
                payload: SmPayload::Connect {
                    dp_addr: self.local_dp_addr,
                    req_window: self.config.req_window as u8,
                },
            };
            sess.sm_pending = Some(SmPending {
                pkt: pkt.clone(),
                next_deadline_us: now_us() + self.config.sm_retry_interval_us,
                tries: 1,
            });
            (pkt, sess.peer_uri)
        };
        self.send_sm(&pkt, dst);
    }

    /// Initiate session teardown.
    ///
    /// In-flight exchanges complete with empty responses once the disconnect
    /// is acknowledged (or its retry budget expires). Illegal from a request
    /// handler or continuation.
    pub fn destroy_session(&self, session: SessionHandle) -> Result<()> {
        self.assert_creator();
        if self.in_handler.get() {
            return Err(Error::ForbiddenContext);
        }

        let action = {
            let mut sessions = self.sessions.borrow_mut();
            let sess = sessions
                .get_mut(session)
                .ok_or(Error::SessionNotFound(session.session_num()))?;
            debug_assert!(sess.is_client(), "destroy_session on a server session");
            match sess.state {
                SessionState::Connected => {
                    sess.state = SessionState::DisconnectInProgress;
                    let seq = sess.next_sm_seq();
                    let pkt = SmPacket {
                        kind: SmPktType::DisconnectReq,
                        sender_uri: self.nexus.sm_addr(),
                        sender_rpc_id: self.id,
                        dst_rpc_id: sess.peer_rpc_id,
                        cli_sess_num: sess.local_num,
                        svr_sess_num: sess.peer_sess_num,
                        seq,
                        err: SmErrCode::NoError,
                        payload: SmPayload::None,
                    };
                    sess.sm_pending = Some(SmPending {
                        pkt: pkt.clone(),
                        next_deadline_us: now_us() + self.config.sm_retry_interval_us,
                        tries: 1,
                    });
                    Some((pkt, sess.peer_uri))
                }
                SessionState::DisconnectInProgress | SessionState::ResetInProgress => None,
                SessionState::ConnectInProgress | SessionState::Error => {
                    self.abort_client_slots(sess);
                    sessions.remove(session);
                    None
                }
            }
        };

        if let Some((pkt, dst)) = action {
            self.send_sm(&pkt, dst);
        }
        Ok(())
    }

    /// Fail every in-flight client exchange on a session: continuations fire
    /// with empty responses and credits return.
    fn abort_client_slots(&self, sess: &mut Session<Continuation<T>>) {
        for idx in 0..sess.sslots.len() {
            if matches!(sess.sslots[idx], SSlot::Client(_)) {
                let SSlot::Client(mut c) = std::mem::replace(&mut sess.sslots[idx], SSlot::Empty)
                else {
                    unreachable!()
                };
                self.wheel.borrow_mut().cancel(sess.local_num, idx, c.req_num);
                sess.return_credit();
                c.resp.set_len(0);
                if let Some(cont) = c.cont.take() {
                    self.ready_conts.borrow_mut().push((
                        cont,
                        RespHandle {
                            req: c.req,
                            resp: c.resp,
                        },
                        c.tag,
                    ));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Client datapath
    // ------------------------------------------------------------------

    /// Submit a request on a connected client session.
    ///
    /// Both buffers move into the endpoint for the duration of the exchange
    /// and come back through the continuation (or inside the error on
    /// failure). Never blocks.
    pub fn enqueue_request<F>(
        &self,
        session: SessionHandle,
        req_type: u8,
        req: MsgBuffer,
        resp: MsgBuffer,
        cont: F,
        tag: u64,
    ) -> std::result::Result<(), EnqueueError>
    where
        F: FnOnce(&Rpc<T>, RespHandle, u64) + 'static,
    {
        self.assert_creator();

        if req.len() > self.config.max_msg_size {
            return Err(EnqueueError {
                error: Error::MsgTooLarge {
                    size: req.len(),
                    max: self.config.max_msg_size,
                },
                req,
                resp,
            });
        }

        let mut sessions = self.sessions.borrow_mut();
        let sess = match sessions.get_mut(session) {
            Some(s) => s,
            None => {
                return Err(EnqueueError {
                    error: Error::SessionNotFound(session.session_num()),
                    req,
                    resp,
                });
            }
        };
        if !sess.is_connected() {
            return Err(EnqueueError {
                error: Error::SessionNotConnected(session.session_num()),
                req,
                resp,
            });
        }

        let req_num = sess.peek_req_num();
        let idx = sess.slot_idx(req_num);
        if !sess.sslots[idx].is_empty() {
            return Err(EnqueueError {
                error: Error::SlotBusy(session.session_num()),
                req,
                resp,
            });
        }
        if sess.consume_credit().is_err() {
            return Err(EnqueueError {
                error: Error::NoCredits,
                req,
                resp,
            });
        }

        let dst = sess
            .peer_dp_addr
            .expect("connected session without peer datapath address");
        let peer_sess = sess.peer_sess_num;

        // Segment before committing the slot so a pool shortfall unwinds
        // cleanly.
        {
            let mut pool = self.pool.borrow_mut();
            let mut pending = self.pending_tx.borrow_mut();
            if let Err(error) = Self::push_msg_pkts(
                &mut pool,
                &mut pending,
                self.mtu,
                dst,
                peer_sess,
                req_type,
                PktType::Req,
                req_num,
                req.payload(),
                None,
            ) {
                sess.return_credit();
                return Err(EnqueueError { error, req, resp });
            }
        }

        sess.next_req_num();
        let now = now_us();
        sess.sslots[idx] = SSlot::Client(ClientSlot {
            req_num,
            req_type,
            req,
            resp,
            cont: Some(Box::new(cont)),
            tag,
            pkts_rcvd: 0,
            pkts_total: 0,
            retries: 0,
            tx_ts: now,
        });
        let local_num = sess.local_num;
        drop(sessions);

        self.wheel.borrow_mut().insert(TimerEntry {
            session_num: local_num,
            sslot_idx: idx,
            req_num,
            expires_at: now + self.config.rto_us,
            rx_mark: 0,
        });
        Ok(())
    }

    /// Segment `payload` into header-stamped pool buffers and stage them for
    /// transmission. All-or-nothing: a pool shortfall frees what was taken.
    #[allow(clippy::too_many_arguments)]
    fn push_msg_pkts(
        pool: &mut PktBufPool,
        pending: &mut Vec<TxItem>,
        mtu: usize,
        dst: SocketAddr,
        dest_sess: u16,
        req_type: u8,
        base_type: PktType,
        req_num: u64,
        payload: &[u8],
        resp_of: Option<(u16, usize, u64)>,
    ) -> Result<u16> {
        let data_per_pkt = mtu - PKT_HDR_SIZE;
        let total = PktHdr::calc_num_pkts(payload.len(), mtu);

        let mut staged: Vec<TxItem> = Vec::with_capacity(total as usize);
        for i in 0..total {
            let Some(buf_idx) = pool.alloc() else {
                for item in staged {
                    pool.free(item.buf_idx);
                }
                return Err(Error::PktPoolExhausted);
            };
            let off = i as usize * data_per_pkt;
            let end = payload.len().min(off + data_per_pkt);
            let chunk = &payload[off..end];
            let pkt_type = if total == 1 && base_type == PktType::Req {
                PktType::ReqForResp
            } else {
                base_type
            };
            let hdr = PktHdr {
                req_type,
                msg_size: payload.len() as u32,
                dest_session_num: dest_sess,
                pkt_type,
                pkt_num: i,
                req_num,
            };
            let slot = pool.slot_mut(buf_idx);
            slot[..PKT_HDR_SIZE].copy_from_slice(&hdr.to_wire());
            slot[PKT_HDR_SIZE..PKT_HDR_SIZE + chunk.len()].copy_from_slice(chunk);
            staged.push(TxItem {
                dst,
                buf_idx,
                len: PKT_HDR_SIZE + chunk.len(),
                resp_of,
            });
        }
        pending.append(&mut staged);
        Ok(total)
    }

    /// Stage a credit-return packet, which also aborts the addressed
    /// exchange on the client.
    fn queue_credit_return(&self, dst: SocketAddr, dest_sess: u16, req_num: u64) {
        let mut pool = self.pool.borrow_mut();
        let mut pending = self.pending_tx.borrow_mut();
        if Self::push_msg_pkts(
            &mut pool,
            &mut pending,
            self.mtu,
            dst,
            dest_sess,
            0,
            PktType::CreditReturn,
            req_num,
            &[],
            None,
        )
        .is_err()
        {
            tracing::warn!(rpc_id = self.id, "credit return dropped: pool exhausted");
        }
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    /// Run the event loop for `ms` milliseconds, measured on the cycle
    /// counter clock.
    pub fn run_event_loop(&self, ms: u64) {
        let start = minstant::Instant::now();
        let duration = Duration::from_millis(ms);
        while start.elapsed() < duration {
            self.run_event_loop_once();
        }
    }

    /// Run one event-loop iteration. Returns the number of events processed.
    pub fn run_event_loop_once(&self) -> usize {
        self.assert_creator();
        if self.in_handler.get() || self.progressing.get() {
            panic!("urpc: event loop reentered from a request handler or continuation");
        }
        self.progressing.set(true);
        self.saw_new_req.set(false);

        let mut events = 0;
        events += self.process_rx();
        events += self.process_tx_completions();
        self.process_sm_inbox();
        self.process_timeouts();
        self.process_bg_completions();
        self.flush_tx();
        events += self.run_continuations();

        self.progressing.set(false);
        events
    }

    fn process_rx(&self) -> usize {
        let mut rx = Vec::new();
        {
            let mut transport = self.transport.borrow_mut();
            let mut pool = self.pool.borrow_mut();
            transport.rx_burst(&mut pool, &mut rx);
        }
        if rx.is_empty() {
            return 0;
        }
        let events = rx.len();

        let mut ready_reqs: Vec<ReqHandle> = Vec::new();
        for pkt in rx {
            let parsed = {
                let pool = self.pool.borrow();
                let data = &pool.slot(pkt.buf_idx)[..pkt.len];
                PktHdr::from_wire(data)
                    .ok()
                    .map(|hdr| (hdr, data[PKT_HDR_SIZE..].to_vec()))
            };
            self.pool.borrow_mut().free(pkt.buf_idx);
            let Some((hdr, payload)) = parsed else {
                tracing::warn!(rpc_id = self.id, src = %pkt.src, "dropping malformed packet");
                continue;
            };

            match hdr.pkt_type {
                PktType::Req | PktType::ReqForResp => {
                    self.saw_new_req.set(true);
                    self.handle_request_pkt(&hdr, &payload, &mut ready_reqs);
                }
                PktType::Resp => self.handle_response_pkt(&hdr, &payload),
                PktType::CreditReturn => self.handle_credit_return(&hdr),
            }
        }

        for handle in ready_reqs {
            self.dispatch_request(handle);
        }
        events
    }

    fn handle_request_pkt(&self, hdr: &PktHdr, payload: &[u8], ready: &mut Vec<ReqHandle>) {
        let sess_num = hdr.dest_session_num;
        let req_num = hdr.req_num;
        let data_per_pkt = self.mtu - PKT_HDR_SIZE;

        let mut sessions = self.sessions.borrow_mut();
        let Some(sess) = sessions.get_mut(SessionHandle(sess_num)) else {
            tracing::debug!(rpc_id = self.id, sess_num, "request for unknown session");
            return;
        };
        if sess.is_client() || !sess.is_connected() {
            tracing::debug!(rpc_id = self.id, sess_num, "request on wrong-state session");
            return;
        }

        let idx = sess.slot_idx(req_num);
        let peer_dp = sess.peer_dp_addr;
        let peer_sess = sess.peer_sess_num;

        match &mut sess.sslots[idx] {
            SSlot::Server(s) => {
                if req_num < s.req_num {
                    return;
                }
                if req_num == s.req_num {
                    if s.finished {
                        // Client lost the response; send it again once the
                        // previous transmission drained.
                        if s.resp_tx_outstanding == 0 {
                            if let (Some(resp), Some(dst)) = (&s.resp, peer_dp) {
                                tracing::debug!(
                                    rpc_id = self.id,
                                    sess_num,
                                    req_num,
                                    "retransmitting response"
                                );
                                let mut pool = self.pool.borrow_mut();
                                let mut pending = self.pending_tx.borrow_mut();
                                if let Ok(n) = Self::push_msg_pkts(
                                    &mut pool,
                                    &mut pending,
                                    self.mtu,
                                    dst,
                                    peer_sess,
                                    s.req_type,
                                    PktType::Resp,
                                    req_num,
                                    resp.payload(),
                                    Some((sess_num, idx, req_num)),
                                ) {
                                    s.resp_tx_outstanding = n;
                                }
                            }
                        }
                        return;
                    }
                    if s.in_handler {
                        // Handler still running; let the client wait
                        return;
                    }
                    if hdr.pkt_num != s.expected_pkt {
                        return;
                    }
                    let offset = s.expected_pkt as usize * data_per_pkt;
                    if let Some(req) = &mut s.req {
                        let buf = req.capacity_mut();
                        let end = (offset + payload.len()).min(buf.len());
                        if offset < end {
                            buf[offset..end].copy_from_slice(&payload[..end - offset]);
                        }
                    }
                    s.expected_pkt += 1;
                    if s.expected_pkt == s.req_pkts_total {
                        self.complete_server_slot(sess_num, idx, s, ready);
                    }
                    return;
                }
                // Newer request wants the slot; only a retired slot yields
                if !s.finished || s.in_handler || s.resp_tx_outstanding > 0 {
                    tracing::debug!(rpc_id = self.id, sess_num, req_num, "window overrun");
                    return;
                }
            }
            SSlot::Client(_) => {
                tracing::warn!(rpc_id = self.id, sess_num, "request on a client slot");
                return;
            }
            SSlot::Empty => {}
        }

        // Fresh exchange starts with packet 0; anything else lost its head
        // and the client will retransmit.
        if hdr.pkt_num != 0 {
            return;
        }
        let msg_size = hdr.msg_size as usize;
        if msg_size > self.config.max_msg_size {
            tracing::warn!(rpc_id = self.id, sess_num, msg_size, "oversized request");
            return;
        }
        let total = PktHdr::calc_num_pkts(msg_size, self.mtu);
        let mut req = match self.alloc_internal_msgbuf(msg_size) {
            Ok(buf) => buf,
            Err(e) => {
                tracing::warn!(rpc_id = self.id, error = %e, "request buffer allocation failed");
                return;
            }
        };
        {
            let buf = req.capacity_mut();
            let end = payload.len().min(buf.len());
            buf[..end].copy_from_slice(&payload[..end]);
        }

        let mut slot = ServerSlot {
            req_num,
            req_type: hdr.req_type,
            req: Some(req),
            expected_pkt: 1,
            req_pkts_total: total,
            in_handler: false,
            finished: false,
            resp: None,
            resp_tx_outstanding: 0,
        };
        if total == 1 {
            self.complete_server_slot(sess_num, idx, &mut slot, ready);
        }
        sess.sslots[idx] = SSlot::Server(slot);
    }

    /// All request packets arrived: materialize the handle for dispatch.
    fn complete_server_slot(
        &self,
        sess_num: u16,
        idx: usize,
        s: &mut ServerSlot,
        ready: &mut Vec<ReqHandle>,
    ) {
        let resp = match self.alloc_internal_msgbuf(self.config.max_msg_size) {
            Ok(buf) => buf,
            Err(e) => {
                tracing::warn!(rpc_id = self.id, error = %e, "response buffer allocation failed");
                // Retire the exchange without a response; the client times out
                s.req = None;
                s.finished = true;
                return;
            }
        };
        let req = s.req.take().expect("reassembly buffer present");
        s.in_handler = true;
        ready.push(ReqHandle {
            sess_num,
            sslot_idx: idx,
            req_num: s.req_num,
            req_type: s.req_type,
            req,
            resp,
            resp_len: None,
        });
    }

    /// Resolve the handler for a ready request and run it, inline or on the
    /// background pool.
    fn dispatch_request(&self, mut handle: ReqHandle) {
        let Some(reg) = self.nexus.handler(handle.req_type) else {
            tracing::warn!(
                rpc_id = self.id,
                req_type = handle.req_type,
                "no handler registered; aborting exchange"
            );
            self.abort_server_exchange(handle.sess_num, handle.sslot_idx, handle.req_num);
            return;
        };

        match reg.kind {
            HandlerKind::Foreground => {
                self.in_handler.set(true);
                (reg.func)(&mut handle);
                self.in_handler.set(false);
                self.finish_server_response(handle);
            }
            HandlerKind::Background => {
                if let Some(bg) = &self.bg_pool {
                    match bg.borrow_mut().dispatch(BgWork {
                        handler: reg.func.clone(),
                        handle,
                    }) {
                        Ok(()) => {}
                        Err(work) => {
                            // Every worker queue is full; degrade to inline
                            let mut handle = work.handle;
                            self.in_handler.set(true);
                            (work.handler)(&mut handle);
                            self.in_handler.set(false);
                            self.finish_server_response(handle);
                        }
                    }
                } else {
                    self.in_handler.set(true);
                    (reg.func)(&mut handle);
                    self.in_handler.set(false);
                    self.finish_server_response(handle);
                }
            }
        }
    }

    /// No response will be produced for this exchange: retire the slot and
    /// tell the client to give up on it.
    fn abort_server_exchange(&self, sess_num: u16, sslot_idx: usize, req_num: u64) {
        let target = {
            let mut sessions = self.sessions.borrow_mut();
            let Some(sess) = sessions.get_mut(SessionHandle(sess_num)) else {
                return;
            };
            let peer = (sess.peer_dp_addr, sess.peer_sess_num);
            match &mut sess.sslots[sslot_idx] {
                SSlot::Server(s) if s.req_num == req_num => {
                    s.in_handler = false;
                    s.finished = true;
                    s.resp = None;
                    peer
                }
                _ => return,
            }
        };
        if let (Some(dst), dest_sess) = target {
            self.queue_credit_return(dst, dest_sess, req_num);
        }
    }

    /// A handler returned: stage the response, or abort the exchange if none
    /// was produced.
    fn finish_server_response(&self, handle: ReqHandle) {
        let ReqHandle {
            sess_num,
            sslot_idx,
            req_num,
            req_type,
            resp,
            resp_len,
            req: _,
        } = handle;

        let Some(len) = resp_len else {
            tracing::debug!(
                rpc_id = self.id,
                sess_num,
                req_num,
                "handler returned without a response; aborting exchange"
            );
            self.abort_server_exchange(sess_num, sslot_idx, req_num);
            return;
        };

        let mut sessions = self.sessions.borrow_mut();
        let Some(sess) = sessions.get_mut(SessionHandle(sess_num)) else {
            return; // session torn down while the handler ran
        };
        let peer_dp = sess.peer_dp_addr;
        let peer_sess = sess.peer_sess_num;
        let SSlot::Server(s) = &mut sess.sslots[sslot_idx] else {
            return; // slot reset while the handler ran
        };
        if s.req_num != req_num {
            return;
        }
        s.in_handler = false;

        let mut resp = resp;
        resp.set_len(len);
        let Some(dst) = peer_dp else { return };

        let mut pool = self.pool.borrow_mut();
        let mut pending = self.pending_resp_tx.borrow_mut();
        match Self::push_msg_pkts(
            &mut pool,
            &mut pending,
            self.mtu,
            dst,
            peer_sess,
            req_type,
            PktType::Resp,
            req_num,
            resp.payload(),
            Some((sess_num, sslot_idx, req_num)),
        ) {
            Ok(n) => {
                s.resp_tx_outstanding = n;
            }
            Err(e) => {
                // Keep the response; the client's retransmission retries the
                // send via the finished-slot path
                tracing::warn!(rpc_id = self.id, error = %e, "response send deferred");
            }
        }
        s.resp = Some(resp);
        s.finished = true;
    }

    fn handle_response_pkt(&self, hdr: &PktHdr, payload: &[u8]) {
        let sess_num = hdr.dest_session_num;
        let req_num = hdr.req_num;
        let data_per_pkt = self.mtu - PKT_HDR_SIZE;

        let mut ready = None;
        {
            let mut sessions = self.sessions.borrow_mut();
            let Some(sess) = sessions.get_mut(SessionHandle(sess_num)) else {
                return;
            };
            if !sess.is_client() {
                return;
            }
            let idx = sess.slot_idx(req_num);

            let outcome = match &mut sess.sslots[idx] {
                SSlot::Client(c) if c.req_num == req_num => {
                    let msg_size = hdr.msg_size as usize;
                    if c.pkts_total == 0 {
                        if msg_size > c.resp.capacity() {
                            tracing::warn!(
                                rpc_id = self.id,
                                sess_num,
                                req_num,
                                msg_size,
                                "response exceeds user buffer; failing exchange"
                            );
                            Some(0) // complete as failure
                        } else {
                            c.pkts_total = PktHdr::calc_num_pkts(msg_size, self.mtu);
                            None
                        }
                    } else {
                        None
                    }
                }
                _ => return, // stale or duplicate
            };

            let complete_len = match outcome {
                Some(fail_len) => Some(fail_len),
                None => {
                    let SSlot::Client(c) = &mut sess.sslots[idx] else {
                        unreachable!()
                    };
                    if hdr.pkt_num != c.pkts_rcvd {
                        return; // out of order or duplicate
                    }
                    let offset = c.pkts_rcvd as usize * data_per_pkt;
                    {
                        let buf = c.resp.capacity_mut();
                        let end = (offset + payload.len()).min(buf.len());
                        if offset < end {
                            buf[offset..end].copy_from_slice(&payload[..end - offset]);
                        }
                    }
                    c.pkts_rcvd += 1;
                    if c.pkts_rcvd == c.pkts_total {
                        Some(hdr.msg_size as usize)
                    } else {
                        None
                    }
                }
            };

            if let Some(final_len) = complete_len {
                self.wheel.borrow_mut().cancel(sess_num, idx, req_num);
                sess.return_credit();
                let slot = std::mem::replace(&mut sess.sslots[idx], SSlot::Empty);
                let SSlot::Client(mut c) = slot else {
                    unreachable!()
                };
                c.resp.set_len(final_len.min(c.resp.capacity()));
                if let Some(cont) = c.cont.take() {
                    ready = Some((
                        cont,
                        RespHandle {
                            req: c.req,
                            resp: c.resp,
                        },
                        c.tag,
                    ));
                }
            }
        }
        if let Some(r) = ready {
            self.ready_conts.borrow_mut().push(r);
        }
    }

    /// The peer gave up on an exchange without a response: complete it as a
    /// failure and recover the credit.
    fn handle_credit_return(&self, hdr: &PktHdr) {
        let sess_num = hdr.dest_session_num;
        let req_num = hdr.req_num;

        let mut ready = None;
        {
            let mut sessions = self.sessions.borrow_mut();
            let Some(sess) = sessions.get_mut(SessionHandle(sess_num)) else {
                return;
            };
            if !sess.is_client() {
                return;
            }
            let idx = sess.slot_idx(req_num);
            if !matches!(&sess.sslots[idx], SSlot::Client(c) if c.req_num == req_num) {
                return;
            }

            self.wheel.borrow_mut().cancel(sess_num, idx, req_num);
            sess.return_credit();
            let slot = std::mem::replace(&mut sess.sslots[idx], SSlot::Empty);
            let SSlot::Client(mut c) = slot else {
                unreachable!()
            };
            c.resp.set_len(0);
            if let Some(cont) = c.cont.take() {
                ready = Some((
                    cont,
                    RespHandle {
                        req: c.req,
                        resp: c.resp,
                    },
                    c.tag,
                ));
            }
        }
        if let Some(r) = ready {
            self.ready_conts.borrow_mut().push(r);
        }
    }

    fn process_tx_completions(&self) -> usize {
        let n = self.transport.borrow_mut().reclaim_tx_completions();
        let mut count = 0;
        for _ in 0..n {
            let rec = self.send_records.borrow_mut().pop_front();
            let Some(rec) = rec else { break };
            self.pool.borrow_mut().free(rec.buf_idx);
            if let Some((sess_num, idx, req_num)) = rec.resp_of {
                let mut sessions = self.sessions.borrow_mut();
                if let Some(sess) = sessions.get_mut(SessionHandle(sess_num)) {
                    if let SSlot::Server(s) = &mut sess.sslots[idx] {
                        if s.req_num == req_num && s.resp_tx_outstanding > 0 {
                            s.resp_tx_outstanding -= 1;
                        }
                    }
                }
            }
            count += 1;
        }
        count
    }

    fn process_bg_completions(&self) {
        let Some(bg) = &self.bg_pool else { return };
        let mut done = Vec::new();
        bg.borrow_mut().drain_completions(&mut done);
        for handle in done {
            self.finish_server_response(handle);
        }
    }

    fn flush_tx(&self) {
        // Release batched responses when the batch fills or the iteration
        // brought no new requests
        {
            let mut resp = self.pending_resp_tx.borrow_mut();
            if !resp.is_empty()
                && (resp.len() >= self.config.resp_batch_size || !self.saw_new_req.get())
            {
                self.pending_tx.borrow_mut().append(&mut resp);
            }
        }

        let mut items = std::mem::take(&mut *self.pending_tx.borrow_mut());
        if items.is_empty() {
            return;
        }

        #[cfg(feature = "fault-injection")]
        {
            let mut faults = self.faults.borrow_mut();
            if faults.drop_tx_countdown > 0 {
                let mut pool = self.pool.borrow_mut();
                let mut kept = Vec::with_capacity(items.len());
                for item in items {
                    if faults.drop_tx_countdown > 0 {
                        faults.drop_tx_countdown -= 1;
                        pool.free(item.buf_idx);
                        tracing::debug!(rpc_id = self.id, "fault: dropped outgoing packet");
                    } else {
                        kept.push(item);
                    }
                }
                items = kept;
            }
        }
        if items.is_empty() {
            return;
        }

        let sent = {
            let pool = self.pool.borrow();
            let lkey = pool.lkey();
            let pkts: Vec<TxPacket<'_>> = items
                .iter()
                .map(|item| TxPacket {
                    dst: item.dst,
                    data: &pool.slot(item.buf_idx)[..item.len],
                    lkey,
                })
                .collect();
            match self.transport.borrow_mut().tx_burst(&pkts) {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(rpc_id = self.id, error = %e, "tx_burst failed");
                    0
                }
            }
        };

        let mut records = self.send_records.borrow_mut();
        let mut pool = self.pool.borrow_mut();
        for (i, item) in items.into_iter().enumerate() {
            if i < sent {
                records.push_back(SendRecord {
                    buf_idx: item.buf_idx,
                    resp_of: item.resp_of,
                });
            } else {
                pool.free(item.buf_idx);
            }
        }
    }

    fn run_continuations(&self) -> usize {
        let ready = std::mem::take(&mut *self.ready_conts.borrow_mut());
        let n = ready.len();
        for (cont, resp, tag) in ready {
            self.in_handler.set(true);
            cont(self, resp, tag);
            self.in_handler.set(false);
        }
        n
    }

    // ------------------------------------------------------------------
    // Timeouts and retransmission
    // ------------------------------------------------------------------

    fn process_timeouts(&self) {
        let now = now_us();
        let expired = self.wheel.borrow_mut().advance(now);
        for entry in expired {
            self.handle_dp_timeout(entry, now);
        }
        self.process_sm_retries(now);
    }

    fn handle_dp_timeout(&self, entry: TimerEntry, now: u64) {
        let mut sessions = self.sessions.borrow_mut();
        let Some(sess) = sessions.get_mut(SessionHandle(entry.session_num)) else {
            return;
        };
        let SSlot::Client(c) = &mut sess.sslots[entry.sslot_idx] else {
            return;
        };
        if c.req_num != entry.req_num {
            return;
        }

        if c.pkts_rcvd > entry.rx_mark {
            // Forward progress since arming; push the deadline out without
            // spending a retry
            let mark = c.pkts_rcvd;
            self.wheel.borrow_mut().insert(TimerEntry {
                session_num: entry.session_num,
                sslot_idx: entry.sslot_idx,
                req_num: entry.req_num,
                expires_at: now + self.config.rto_us,
                rx_mark: mark,
            });
            return;
        }

        c.retries += 1;
        if c.retries > self.config.max_retries {
            tracing::warn!(
                rpc_id = self.id,
                session = entry.session_num,
                req_num = entry.req_num,
                "retry budget exhausted; failing session"
            );
            sess.state = SessionState::Error;
            self.abort_client_slots(sess);
            return;
        }

        tracing::debug!(
            rpc_id = self.id,
            session = entry.session_num,
            req_num = entry.req_num,
            retry = c.retries,
            "retransmitting request"
        );
        let dst = sess
            .peer_dp_addr
            .expect("connected session without peer datapath address");
        let peer_sess = sess.peer_sess_num;
        {
            let mut pool = self.pool.borrow_mut();
            let mut pending = self.pending_tx.borrow_mut();
            let _ = Self::push_msg_pkts(
                &mut pool,
                &mut pending,
                self.mtu,
                dst,
                peer_sess,
                c.req_type,
                PktType::Req,
                c.req_num,
                c.req.payload(),
                None,
            );
        }
        c.tx_ts = now;
        let mark = c.pkts_rcvd;
        self.wheel.borrow_mut().insert(TimerEntry {
            session_num: entry.session_num,
            sslot_idx: entry.sslot_idx,
            req_num: entry.req_num,
            expires_at: now + self.config.rto_us,
            rx_mark: mark,
        });
    }

    fn process_sm_retries(&self, now: u64) {
        let mut resend: Vec<(SmPacket, SocketAddr)> = Vec::new();
        let mut exhausted: Vec<(SessionHandle, SmPktType)> = Vec::new();
        {
            let mut sessions = self.sessions.borrow_mut();
            for sess in sessions.iter_mut() {
                let peer_uri = sess.peer_uri;
                let handle = sess.handle();
                let Some(p) = &mut sess.sm_pending else {
                    continue;
                };
                if p.next_deadline_us > now {
                    continue;
                }
                if p.tries >= self.config.sm_max_retries {
                    exhausted.push((handle, p.pkt.kind));
                } else {
                    p.tries += 1;
                    p.next_deadline_us = now + self.config.sm_retry_interval_us;
                    resend.push((p.pkt.clone(), peer_uri));
                }
            }
        }
        for (pkt, dst) in resend {
            tracing::debug!(rpc_id = self.id, kind = ?pkt.kind, "retrying sm request");
            self.send_sm(&pkt, dst);
        }
        for (handle, kind) in exhausted {
            self.sm_retry_exhausted(handle, kind);
        }
    }

    fn sm_retry_exhausted(&self, handle: SessionHandle, kind: SmPktType) {
        tracing::warn!(
            rpc_id = self.id,
            session = handle.session_num(),
            kind = ?kind,
            "sm retry budget exhausted"
        );
        let event = {
            let mut sessions = self.sessions.borrow_mut();
            let Some(sess) = sessions.get_mut(handle) else {
                return;
            };
            sess.sm_pending = None;
            match kind {
                SmPktType::ConnectReq => {
                    sess.state = SessionState::Error;
                    Some(SmEventKind::ConnectFailed)
                }
                SmPktType::DisconnectReq => {
                    // Peer unreachable: tear down locally
                    self.abort_client_slots(sess);
                    sessions.remove(handle);
                    Some(SmEventKind::Disconnected)
                }
                SmPktType::FaultResetPeerReq => {
                    sess.state = SessionState::Error;
                    None
                }
                _ => None,
            }
        };
        if let Some(kind) = event {
            self.emit_sm_event(SmEvent {
                kind,
                session: handle,
                err: SmErrCode::NoError,
            });
        }
    }

    // ------------------------------------------------------------------
    // Session management
    // ------------------------------------------------------------------

    pub(crate) fn send_sm(&self, pkt: &SmPacket, dst: SocketAddr) {
        match pkt.encode() {
            Ok(bytes) => {
                if let Err(e) = self.sm_tx.send_to(&bytes, dst) {
                    tracing::warn!(rpc_id = self.id, error = %e, "sm send failed");
                }
            }
            Err(e) => tracing::warn!(rpc_id = self.id, error = %e, "sm encode failed"),
        }
    }

    fn emit_sm_event(&self, event: SmEvent) {
        tracing::debug!(rpc_id = self.id, event = ?event.kind, session = event.session.session_num(), "sm event");
        (&mut *self.sm_handler.borrow_mut())(event);
    }

    /// Drain at most one SM message per iteration; the control plane is not
    /// urgent.
    fn process_sm_inbox(&self) {
        if let Ok(pkt) = self.sm_rx.try_recv() {
            self.handle_sm_packet(pkt);
        }
    }

    fn handle_sm_packet(&self, pkt: SmPacket) {
        tracing::trace!(rpc_id = self.id, kind = ?pkt.kind, "sm packet");
        match pkt.kind {
            SmPktType::ConnectReq => self.handle_sm_connect_req(pkt),
            SmPktType::ConnectResp => self.handle_sm_connect_resp(pkt),
            SmPktType::DisconnectReq => self.handle_sm_disconnect_req(pkt),
            SmPktType::DisconnectResp => self.handle_sm_disconnect_resp(pkt),
            SmPktType::FaultDropTxRemote => self.handle_sm_drop_tx_remote(pkt),
            SmPktType::FaultResetPeerReq => self.handle_sm_reset_peer_req(pkt),
            SmPktType::FaultResetPeerResp => self.handle_sm_reset_peer_resp(pkt),
        }
    }

    fn handle_sm_connect_req(&self, pkt: SmPacket) {
        let key = (pkt.sender_uri, pkt.sender_rpc_id, pkt.cli_sess_num);

        // Duplicate handshake: replay the cached ACK
        let replay = {
            let dedupe = self.connect_dedupe.borrow();
            dedupe.get(&key).copied()
        };
        if let Some(svr_num) = replay {
            let ack = {
                let sessions = self.sessions.borrow();
                sessions
                    .get(SessionHandle(svr_num))
                    .and_then(|s| s.last_sm_ack.as_ref())
                    .filter(|entry| entry.0 == pkt.seq)
                    .map(|entry| entry.1.clone())
            };
            if let Some(ack) = ack {
                self.send_sm(&ack, pkt.sender_uri);
            }
            return;
        }

        let SmPayload::Connect { dp_addr, .. } = pkt.payload else {
            tracing::warn!(rpc_id = self.id, "connect request without payload");
            return;
        };

        let created = self.sessions.borrow_mut().create_session(
            SessionRole::Server,
            pkt.sender_uri,
            pkt.sender_rpc_id,
            &self.config,
        );
        let handle = match created {
            Ok(handle) => handle,
            Err(_) => {
                let mut nak = pkt.ack(SmPktType::ConnectResp, self.nexus.sm_addr(), self.id);
                nak.err = SmErrCode::OutOfSessions;
                self.send_sm(&nak, pkt.sender_uri);
                return;
            }
        };

        let ack = {
            let mut sessions = self.sessions.borrow_mut();
            let sess = sessions.get_mut(handle).expect("fresh server session");
            sess.peer_sess_num = pkt.cli_sess_num;
            sess.peer_dp_addr = Some(dp_addr);
            sess.state = SessionState::Connected;

            let mut ack = pkt.ack(SmPktType::ConnectResp, self.nexus.sm_addr(), self.id);
            ack.svr_sess_num = handle.session_num();
            ack.payload = SmPayload::ConnectAck {
                dp_addr: self.local_dp_addr,
            };
            sess.last_sm_ack = Some((pkt.seq, ack.clone()));
            ack
        };
        self.connect_dedupe
            .borrow_mut()
            .insert(key, handle.session_num());
        self.send_sm(&ack, pkt.sender_uri);
        self.emit_sm_event(SmEvent {
            kind: SmEventKind::Connected,
            session: handle,
            err: SmErrCode::NoError,
        });
    }

    fn handle_sm_connect_resp(&self, pkt: SmPacket) {
        let handle = SessionHandle(pkt.cli_sess_num);
        let event = {
            let mut sessions = self.sessions.borrow_mut();
            let Some(sess) = sessions.get_mut(handle) else {
                return;
            };
            if !sess.is_client() || sess.state != SessionState::ConnectInProgress {
                return; // duplicate or stale ACK
            }
            match pkt.err {
                SmErrCode::NoError => {
                    let SmPayload::ConnectAck { dp_addr } = pkt.payload else {
                        tracing::warn!(rpc_id = self.id, "connect ack without payload");
                        return;
                    };
                    sess.peer_sess_num = pkt.svr_sess_num;
                    sess.peer_dp_addr = Some(dp_addr);
                    sess.state = SessionState::Connected;
                    sess.sm_pending = None;
                    Some(SmEventKind::Connected)
                }
                SmErrCode::InvalidRemoteRpcId
                    if self.config.retry_connect_on_invalid_remote_id =>
                {
                    let can_retry = sess
                        .sm_pending
                        .as_ref()
                        .map(|p| p.tries < self.config.sm_max_retries)
                        .unwrap_or(false);
                    if can_retry {
                        // Back off before the reconnect attempt
                        if let Some(p) = &mut sess.sm_pending {
                            p.next_deadline_us = now_us() + self.config.sm_retry_interval_us * 2;
                        }
                        tracing::debug!(
                            rpc_id = self.id,
                            session = handle.session_num(),
                            "connect refused (invalid remote id), backing off"
                        );
                        None
                    } else {
                        sess.state = SessionState::Error;
                        sess.sm_pending = None;
                        Some(SmEventKind::ConnectFailed)
                    }
                }
                _ => {
                    sess.state = SessionState::Error;
                    sess.sm_pending = None;
                    Some(SmEventKind::ConnectFailed)
                }
            }
        };
        if let Some(kind) = event {
            self.emit_sm_event(SmEvent {
                kind,
                session: handle,
                err: pkt.err,
            });
        }
    }

    fn handle_sm_disconnect_req(&self, pkt: SmPacket) {
        let handle = SessionHandle(pkt.svr_sess_num);
        let mut ack = pkt.ack(SmPktType::DisconnectResp, self.nexus.sm_addr(), self.id);

        // Unknown sessions ACK success: the peer may be retrying a
        // disconnect this side already handled.
        enum Verdict {
            AckOnly,
            Remove,
            Bogus,
        }
        let verdict = {
            let sessions = self.sessions.borrow();
            match sessions.get(handle) {
                None => Verdict::AckOnly,
                Some(sess) if !sess.is_client() => Verdict::Remove,
                Some(_) => Verdict::Bogus,
            }
        };

        let removed = match verdict {
            Verdict::AckOnly => false,
            Verdict::Bogus => {
                ack.err = SmErrCode::SessionNotFound;
                false
            }
            Verdict::Remove => {
                self.sessions.borrow_mut().remove(handle);
                self.connect_dedupe
                    .borrow_mut()
                    .retain(|_, v| *v != handle.session_num());
                true
            }
        };
        self.send_sm(&ack, pkt.sender_uri);
        if removed {
            self.emit_sm_event(SmEvent {
                kind: SmEventKind::Disconnected,
                session: handle,
                err: SmErrCode::NoError,
            });
        }
    }

    fn handle_sm_disconnect_resp(&self, pkt: SmPacket) {
        let handle = SessionHandle(pkt.cli_sess_num);
        let done = {
            let mut sessions = self.sessions.borrow_mut();
            let Some(sess) = sessions.get_mut(handle) else {
                return;
            };
            if sess.state != SessionState::DisconnectInProgress {
                return;
            }
            sess.sm_pending = None;
            self.abort_client_slots(sess);
            sessions.remove(handle);
            true
        };
        if done {
            self.emit_sm_event(SmEvent {
                kind: SmEventKind::Disconnected,
                session: handle,
                err: SmErrCode::NoError,
            });
        }
    }

    #[cfg(feature = "fault-injection")]
    fn handle_sm_drop_tx_remote(&self, pkt: SmPacket) {
        let SmPayload::Countdown(n) = pkt.payload else {
            return;
        };
        tracing::debug!(rpc_id = self.id, countdown = n, "peer requested drop-TX");
        self.faults.borrow_mut().drop_tx_countdown += n as u64;
    }

    #[cfg(not(feature = "fault-injection"))]
    fn handle_sm_drop_tx_remote(&self, _pkt: SmPacket) {
        tracing::debug!(rpc_id = self.id, "ignoring drop-TX request: fault injection disabled");
    }

    fn handle_sm_reset_peer_req(&self, pkt: SmPacket) {
        let handle = SessionHandle(pkt.svr_sess_num);
        let mut ack = pkt.ack(SmPktType::FaultResetPeerResp, self.nexus.sm_addr(), self.id);

        // Duplicate reset: replay the cached ACK
        let replay = {
            let sessions = self.sessions.borrow();
            sessions
                .get(handle)
                .and_then(|s| s.last_sm_ack.as_ref())
                .filter(|entry| entry.0 == pkt.seq && entry.1.kind == SmPktType::FaultResetPeerResp)
                .map(|entry| entry.1.clone())
        };
        if let Some(cached) = replay {
            self.send_sm(&cached, pkt.sender_uri);
            return;
        }

        let event = {
            let mut sessions = self.sessions.borrow_mut();
            match sessions.get_mut(handle) {
                None => {
                    ack.err = SmErrCode::SessionNotFound;
                    None
                }
                Some(sess) => {
                    // Discard all in-flight exchange state and come back up
                    sess.state = SessionState::ResetInProgress;
                    for slot in &mut sess.sslots {
                        *slot = SSlot::Empty;
                    }
                    sess.state = SessionState::Connected;
                    sess.last_sm_ack = Some((pkt.seq, ack.clone()));
                    Some(SmEventKind::PeerReset)
                }
            }
        };
        self.send_sm(&ack, pkt.sender_uri);
        if let Some(kind) = event {
            self.emit_sm_event(SmEvent {
                kind,
                session: handle,
                err: SmErrCode::NoError,
            });
        }
    }

    fn handle_sm_reset_peer_resp(&self, pkt: SmPacket) {
        let handle = SessionHandle(pkt.cli_sess_num);
        let done = {
            let mut sessions = self.sessions.borrow_mut();
            let Some(sess) = sessions.get_mut(handle) else {
                return;
            };
            if sess.state != SessionState::ResetInProgress {
                return;
            }
            sess.state = SessionState::Connected;
            sess.sm_pending = None;
            true
        };
        if done {
            self.emit_sm_event(SmEvent {
                kind: SmEventKind::ResetComplete,
                session: handle,
                err: SmErrCode::NoError,
            });
        }
    }

    /// Abort in-flight exchanges (the peer will discard them) and start the
    /// reset handshake.
    #[cfg(feature = "fault-injection")]
    pub(crate) fn start_peer_reset(&self, session: SessionHandle) -> Result<()> {
        let (pkt, dst) = {
            let mut sessions = self.sessions.borrow_mut();
            let sess = sessions
                .get_mut(session)
                .ok_or(Error::SessionNotFound(session.session_num()))?;
            if !sess.is_connected() || !sess.is_client() {
                return Err(Error::SessionNotConnected(session.session_num()));
            }
            self.abort_client_slots(sess);
            sess.state = SessionState::ResetInProgress;
            let seq = sess.next_sm_seq();
            let pkt = SmPacket {
                kind: SmPktType::FaultResetPeerReq,
                sender_uri: self.nexus.sm_addr(),
                sender_rpc_id: self.id,
                dst_rpc_id: sess.peer_rpc_id,
                cli_sess_num: sess.local_num,
                svr_sess_num: sess.peer_sess_num,
                seq,
                err: SmErrCode::NoError,
                payload: SmPayload::None,
            };
            sess.sm_pending = Some(SmPending {
                pkt: pkt.clone(),
                next_deadline_us: now_us() + self.config.sm_retry_interval_us,
                tries: 1,
            });
            (pkt, sess.peer_uri)
        };
        self.send_sm(&pkt, dst);
        Ok(())
    }
}

impl<T: Transport> Drop for Rpc<T> {
    fn drop(&mut self) {
        if self.in_handler.get() && !thread::panicking() {
            panic!("urpc: endpoint destroyed from inside a request handler or continuation");
        }
        // Best-effort disconnects; the endpoint is going away and will not
        // wait for ACKs
        let farewells: Vec<(SmPacket, SocketAddr)> = {
            let sessions = self.sessions.borrow();
            sessions
                .iter()
                .filter(|s| s.is_client() && s.is_connected())
                .map(|s| {
                    let pkt = SmPacket {
                        kind: SmPktType::DisconnectReq,
                        sender_uri: self.nexus.sm_addr(),
                        sender_rpc_id: self.id,
                        dst_rpc_id: s.peer_rpc_id,
                        cli_sess_num: s.local_num,
                        svr_sess_num: s.peer_sess_num,
                        seq: s.next_sm_seq(),
                        err: SmErrCode::NoError,
                        payload: SmPayload::None,
                    };
                    (pkt, s.peer_uri)
                })
                .collect()
        };
        for (pkt, dst) in farewells {
            self.send_sm(&pkt, dst);
        }
        self.nexus.deregister_endpoint(self.id);
    }
}
