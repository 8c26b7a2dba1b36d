//! Session-management (SM) control plane wire format.
//!
//! SM messages travel over a UDP side channel owned by the [`Nexus`], fully
//! separate from the datapath. Each message is a self-contained bincode-coded
//! struct; there is no fragmentation. Requests are retried until acknowledged
//! or the retry budget runs out, and duplicate requests are answered by
//! replaying the cached ACK.
//!
//! [`Nexus`]: crate::nexus::Nexus

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Upper bound on an encoded SM packet. Anything larger is malformed.
pub const SM_PKT_MAX_SIZE: usize = 512;

/// SM message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmPktType {
    /// Client asks the server to create the mirror session.
    ConnectReq,
    /// Server ACK (positive or negative) for a connect.
    ConnectResp,
    /// Either side tears the session down.
    DisconnectReq,
    /// ACK for a disconnect.
    DisconnectResp,
    /// Instruct the peer to drop its next N outgoing datapath packets.
    /// Fire-and-forget: no response type exists for it.
    FaultDropTxRemote,
    /// Force the peer to discard the session's in-flight state.
    FaultResetPeerReq,
    /// ACK for a peer reset.
    FaultResetPeerResp,
}

impl SmPktType {
    /// Check if this kind expects an ACK.
    pub fn expects_resp(&self) -> bool {
        matches!(
            self,
            SmPktType::ConnectReq | SmPktType::DisconnectReq | SmPktType::FaultResetPeerReq
        )
    }
}

/// SM error code carried in ACKs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmErrCode {
    NoError,
    /// No endpoint with the requested id exists at the destination.
    InvalidRemoteRpcId,
    /// Destination endpoint has no free session-table entry.
    OutOfSessions,
    /// Request referenced a session the destination does not know.
    SessionNotFound,
}

/// Type-specific SM payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmPayload {
    None,
    /// Connect request: the client's datapath address and window size.
    Connect {
        dp_addr: SocketAddr,
        req_window: u8,
    },
    /// Positive connect ACK: the server's datapath address.
    ConnectAck { dp_addr: SocketAddr },
    /// Drop-TX countdown.
    Countdown(u32),
}

/// A session-management packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmPacket {
    /// Message kind.
    pub kind: SmPktType,
    /// SM listener address of the sending process; ACKs go back here.
    pub sender_uri: SocketAddr,
    /// Sending endpoint id.
    pub sender_rpc_id: u8,
    /// Destination endpoint id; the Nexus listener routes on this.
    pub dst_rpc_id: u8,
    /// Client-side session number, when known.
    pub cli_sess_num: u16,
    /// Server-side session number, when known.
    pub svr_sess_num: u16,
    /// Per-session SM sequence number; duplicates carry the same value.
    pub seq: u64,
    /// Error code; meaningful in ACKs.
    pub err: SmErrCode,
    /// Type-specific payload.
    pub payload: SmPayload,
}

impl SmPacket {
    /// Encode for the wire.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|_| Error::InvalidPacket("sm packet failed to serialize"))
    }

    /// Decode from the wire.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > SM_PKT_MAX_SIZE {
            return Err(Error::InvalidPacket("sm packet oversized"));
        }
        bincode::deserialize(bytes).map_err(|_| Error::InvalidPacket("sm packet failed to parse"))
    }

    /// Build the ACK for this request, echoing identifiers and sequence.
    ///
    /// `sender_uri` and `sender_rpc_id` are the responder's; the caller fills
    /// response-specific fields afterwards.
    pub fn ack(&self, kind: SmPktType, sender_uri: SocketAddr, sender_rpc_id: u8) -> SmPacket {
        SmPacket {
            kind,
            sender_uri,
            sender_rpc_id,
            dst_rpc_id: self.sender_rpc_id,
            cli_sess_num: self.cli_sess_num,
            svr_sess_num: self.svr_sess_num,
            seq: self.seq,
            err: SmErrCode::NoError,
            payload: SmPayload::None,
        }
    }
}
