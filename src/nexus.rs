//! Process-wide shared state: the Nexus.
//!
//! One Nexus per process. It owns the session-management listener socket and
//! the request-handler table, and binds endpoint ids to per-endpoint SM
//! inboxes. It is the only object shared across threads; endpoints talk to it
//! through their inbox channel and the frozen handler table.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::rpc::ReqHandle;
use crate::sm::{SmErrCode, SmPacket, SmPktType, SM_PKT_MAX_SIZE};

/// Number of request types addressable by a packet header.
pub const MAX_REQ_TYPES: usize = 256;

/// Request handler function. Runs on the datapath thread for foreground
/// registrations, on a pool worker for background ones.
pub type ReqHandlerFn = Arc<dyn Fn(&mut ReqHandle) + Send + Sync>;

/// Where a request handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Inline on the endpoint thread.
    Foreground,
    /// On a background pool worker.
    Background,
}

/// A registered request handler.
#[derive(Clone)]
pub struct HandlerReg {
    pub func: ReqHandlerFn,
    pub kind: HandlerKind,
}

type HandlerTable = Box<[Option<HandlerReg>]>;
type InboxMap = Arc<Mutex<HashMap<u8, mpsc::Sender<SmPacket>>>>;

/// Process-global endpoint and handler registry.
pub struct Nexus {
    sm_addr: SocketAddr,
    /// Staging handler table; mutated only during the registration phase.
    staging: Mutex<Vec<Option<HandlerReg>>>,
    /// Snapshot taken when the first endpoint registers. Lock-free reads
    /// from then on.
    frozen: OnceLock<HandlerTable>,
    inboxes: InboxMap,
    shutdown: Arc<AtomicBool>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Nexus {
    /// Bind the SM listener and spawn its thread.
    pub fn bind(addr: impl ToSocketAddrs) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(Duration::from_millis(50)))?;
        let sm_addr = socket.local_addr()?;

        let inboxes: InboxMap = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let listener = {
            let inboxes = inboxes.clone();
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name("urpc-sm-listener".into())
                .spawn(move || sm_listener_loop(socket, sm_addr, inboxes, shutdown))
                .map_err(Error::Io)?
        };

        Ok(Arc::new(Self {
            sm_addr,
            staging: Mutex::new(vec![None; MAX_REQ_TYPES]),
            frozen: OnceLock::new(),
            inboxes,
            shutdown,
            listener: Mutex::new(Some(listener)),
        }))
    }

    /// Address of the SM listener; this is the process URI peers connect to.
    #[inline]
    pub fn sm_addr(&self) -> SocketAddr {
        self.sm_addr
    }

    /// Register a request handler.
    ///
    /// Only legal during the registration phase, before any endpoint is
    /// created on this Nexus.
    pub fn register_req_handler<F>(&self, req_type: u8, kind: HandlerKind, f: F) -> Result<()>
    where
        F: Fn(&mut ReqHandle) + Send + Sync + 'static,
    {
        if self.frozen.get().is_some() {
            return Err(Error::HandlerTableFrozen);
        }
        let mut staging = self.staging.lock().unwrap();
        staging[req_type as usize] = Some(HandlerReg {
            func: Arc::new(f),
            kind,
        });
        Ok(())
    }

    /// Look up a handler in the frozen table.
    pub(crate) fn handler(&self, req_type: u8) -> Option<HandlerReg> {
        self.frozen
            .get()
            .and_then(|table| table[req_type as usize].clone())
    }

    /// Bind an endpoint id to a fresh SM inbox. Freezes the handler table on
    /// first use.
    pub(crate) fn register_endpoint(&self, rpc_id: u8) -> Result<mpsc::Receiver<SmPacket>> {
        self.frozen
            .get_or_init(|| self.staging.lock().unwrap().clone().into_boxed_slice());

        let mut inboxes = self.inboxes.lock().unwrap();
        if inboxes.contains_key(&rpc_id) {
            return Err(Error::EndpointIdInUse(rpc_id));
        }
        let (tx, rx) = mpsc::channel();
        inboxes.insert(rpc_id, tx);
        Ok(rx)
    }

    /// Drop an endpoint's SM inbox.
    pub(crate) fn deregister_endpoint(&self, rpc_id: u8) {
        self.inboxes.lock().unwrap().remove(&rpc_id);
    }
}

impl Drop for Nexus {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.listener.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// The SM listener: decode, route by destination endpoint id, and answer
/// requests for unknown endpoints with a negative ACK so clients can fail
/// fast (or back off and retry).
fn sm_listener_loop(
    socket: UdpSocket,
    sm_addr: SocketAddr,
    inboxes: InboxMap,
    shutdown: Arc<AtomicBool>,
) {
    let mut buf = [0u8; SM_PKT_MAX_SIZE];
    while !shutdown.load(Ordering::Acquire) {
        let (len, src) = match socket.recv_from(&mut buf) {
            Ok(x) => x,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                tracing::warn!(error = %e, "sm listener: recv failed");
                continue;
            }
        };

        let pkt = match SmPacket::decode(&buf[..len]) {
            Ok(pkt) => pkt,
            Err(e) => {
                tracing::warn!(src = %src, error = %e, "sm listener: malformed packet");
                continue;
            }
        };

        tracing::trace!(src = %src, kind = ?pkt.kind, dst = pkt.dst_rpc_id, "sm rx");

        let delivered = {
            let inboxes = inboxes.lock().unwrap();
            match inboxes.get(&pkt.dst_rpc_id) {
                Some(tx) => tx.send(pkt.clone()).is_ok(),
                None => false,
            }
        };

        if !delivered && pkt.kind.expects_resp() {
            let resp_kind = match pkt.kind {
                SmPktType::ConnectReq => SmPktType::ConnectResp,
                SmPktType::DisconnectReq => SmPktType::DisconnectResp,
                SmPktType::FaultResetPeerReq => SmPktType::FaultResetPeerResp,
                _ => unreachable!(),
            };
            let mut nak = pkt.ack(resp_kind, sm_addr, pkt.dst_rpc_id);
            nak.err = SmErrCode::InvalidRemoteRpcId;
            match nak.encode() {
                Ok(bytes) => {
                    if let Err(e) = socket.send_to(&bytes, pkt.sender_uri) {
                        tracing::warn!(error = %e, "sm listener: nak send failed");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "sm listener: nak encode failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sm::SmPayload;

    fn connect_req(dst_rpc_id: u8, sender_uri: SocketAddr) -> SmPacket {
        SmPacket {
            kind: SmPktType::ConnectReq,
            sender_uri,
            sender_rpc_id: 9,
            dst_rpc_id,
            cli_sess_num: 0,
            svr_sess_num: u16::MAX,
            seq: 0,
            err: SmErrCode::NoError,
            payload: SmPayload::Connect {
                dp_addr: "127.0.0.1:40000".parse().unwrap(),
                req_window: 8,
            },
        }
    }

    #[test]
    fn test_listener_routes_to_inbox() {
        let nexus = Nexus::bind("127.0.0.1:0").unwrap();
        let rx = nexus.register_endpoint(5).unwrap();

        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let pkt = connect_req(5, sock.local_addr().unwrap());
        sock.send_to(&pkt.encode().unwrap(), nexus.sm_addr()).unwrap();

        let got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got, pkt);
    }

    #[test]
    fn test_listener_naks_unknown_endpoint() {
        let nexus = Nexus::bind("127.0.0.1:0").unwrap();

        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        sock.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let pkt = connect_req(42, sock.local_addr().unwrap());
        sock.send_to(&pkt.encode().unwrap(), nexus.sm_addr()).unwrap();

        let mut buf = [0u8; SM_PKT_MAX_SIZE];
        let (len, _) = sock.recv_from(&mut buf).unwrap();
        let nak = SmPacket::decode(&buf[..len]).unwrap();
        assert_eq!(nak.kind, SmPktType::ConnectResp);
        assert_eq!(nak.err, SmErrCode::InvalidRemoteRpcId);
        assert_eq!(nak.seq, pkt.seq);
    }

    #[test]
    fn test_duplicate_endpoint_id_rejected() {
        let nexus = Nexus::bind("127.0.0.1:0").unwrap();
        let _rx = nexus.register_endpoint(1).unwrap();
        assert!(matches!(
            nexus.register_endpoint(1),
            Err(Error::EndpointIdInUse(1))
        ));
    }

    #[test]
    fn test_handler_table_freezes() {
        let nexus = Nexus::bind("127.0.0.1:0").unwrap();
        nexus
            .register_req_handler(7, HandlerKind::Foreground, |_req| {})
            .unwrap();

        let _rx = nexus.register_endpoint(1).unwrap();
        assert!(nexus.handler(7).is_some());
        assert!(nexus.handler(8).is_none());

        assert!(matches!(
            nexus.register_req_handler(8, HandlerKind::Foreground, |_req| {}),
            Err(Error::HandlerTableFrozen)
        ));
    }
}
