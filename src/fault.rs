//! Fault-injection hooks.
//!
//! Compiled in only with the `fault-injection` feature; without it every hook
//! returns [`Error::FaultInjectionForbidden`] and the endpoint carries no
//! fault state. All hooks are restricted to the endpoint's creator thread and
//! leave state untouched when called from anywhere else.

use crate::error::{Error, Result};
use crate::rpc::Rpc;
use crate::session::SessionHandle;
#[cfg(feature = "fault-injection")]
use crate::sm::{SmErrCode, SmPacket, SmPayload, SmPktType};
use crate::transport::Transport;

/// Mutable fault state of an endpoint.
#[cfg(feature = "fault-injection")]
#[derive(Debug, Default)]
pub(crate) struct FaultState {
    /// Outgoing datapath packets to silently discard before transmission.
    pub drop_tx_countdown: u64,
    /// Force address re-resolution on the next connect.
    pub resolve_server_rinfo: bool,
}

#[cfg(feature = "fault-injection")]
impl<T: Transport> Rpc<T> {
    fn fault_check(&self) -> Result<()> {
        if std::thread::current().id() != self.creator_thread() {
            return Err(Error::FaultInjectionForbidden);
        }
        Ok(())
    }

    /// Silently discard the next `countdown` outgoing datapath packets.
    pub fn fault_drop_tx_local(&self, countdown: u64) -> Result<()> {
        self.fault_check()?;
        let mut faults = self.faults().borrow_mut();
        faults.drop_tx_countdown += countdown;
        tracing::debug!(
            rpc_id = self.id(),
            countdown,
            "fault: dropping next outgoing packets"
        );
        Ok(())
    }

    /// Instruct the peer of a connected client session to drop its next
    /// `countdown` outgoing packets. Fire-and-forget.
    pub fn fault_drop_tx_remote(&self, session: SessionHandle, countdown: u64) -> Result<()> {
        self.fault_check()?;
        let (peer_uri, pkt) = {
            let sessions = self.sessions_ref();
            let sessions = sessions.borrow();
            let sess = sessions
                .get(session)
                .ok_or(Error::SessionNotFound(session.session_num()))?;
            if !sess.is_connected() || !sess.is_client() {
                return Err(Error::SessionNotConnected(session.session_num()));
            }
            let pkt = SmPacket {
                kind: SmPktType::FaultDropTxRemote,
                sender_uri: self.nexus().sm_addr(),
                sender_rpc_id: self.id(),
                dst_rpc_id: sess.peer_rpc_id,
                cli_sess_num: sess.local_num,
                svr_sess_num: sess.peer_sess_num,
                seq: sess.next_sm_seq(),
                err: SmErrCode::NoError,
                payload: SmPayload::Countdown(countdown as u32),
            };
            (sess.peer_uri, pkt)
        };
        tracing::debug!(
            rpc_id = self.id(),
            session = session.session_num(),
            countdown,
            "fault: sending drop-TX-remote"
        );
        self.send_sm(&pkt, peer_uri);
        Ok(())
    }

    /// Force the peer of a connected client session to discard its in-flight
    /// state for this session. The local session passes through
    /// reset-in-progress until the peer ACKs.
    pub fn fault_reset_remote_peer(&self, session: SessionHandle) -> Result<()> {
        self.fault_check()?;
        tracing::debug!(
            rpc_id = self.id(),
            session = session.session_num(),
            "fault: sending reset-remote-peer"
        );
        self.start_peer_reset(session)
    }

    /// Force an address-resolution step on the next connect.
    pub fn fault_resolve_server_rinfo(&self) -> Result<()> {
        self.fault_check()?;
        self.faults().borrow_mut().resolve_server_rinfo = true;
        Ok(())
    }
}

#[cfg(not(feature = "fault-injection"))]
impl<T: Transport> Rpc<T> {
    /// Fault injection is compiled out.
    pub fn fault_drop_tx_local(&self, _countdown: u64) -> Result<()> {
        Err(Error::FaultInjectionForbidden)
    }

    /// Fault injection is compiled out.
    pub fn fault_drop_tx_remote(&self, _session: SessionHandle, _countdown: u64) -> Result<()> {
        Err(Error::FaultInjectionForbidden)
    }

    /// Fault injection is compiled out.
    pub fn fault_reset_remote_peer(&self, _session: SessionHandle) -> Result<()> {
        Err(Error::FaultInjectionForbidden)
    }

    /// Fault injection is compiled out.
    pub fn fault_resolve_server_rinfo(&self) -> Result<()> {
        Err(Error::FaultInjectionForbidden)
    }
}
