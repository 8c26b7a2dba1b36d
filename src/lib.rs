//! # urpc - user-space datagram RPC
//!
//! A per-thread RPC endpoint for low-latency datagram transports. Each
//! endpoint owns its sessions and buffers, drives a packet-level transport,
//! multiplexes concurrent request/response exchanges onto reliable
//! per-session streams, and invokes user callbacks from a single-threaded
//! event loop.
//!
//! ## Features
//!
//! - **Pluggable transport**: the endpoint is generic over a packet TX/RX
//!   interface; a non-blocking UDP shim ships with the crate
//! - **Sessions with a request window**: up to 8 concurrent exchanges per
//!   session, credit-based flow control, per-session FIFO submission
//! - **Out-of-band session management**: connect, disconnect and fault
//!   control messages travel on a side channel owned by the process-wide
//!   [`Nexus`], never on the datapath
//! - **Reliability**: in-order reassembly, timing-wheel retransmission
//!   timeouts, bounded retries
//! - **Background handlers**: long request handlers run on pool workers fed
//!   by wait-free SPSC queues
//! - **Fault injection**: drop-TX, drop-TX-remote, peer reset and forced
//!   re-resolution behind the `fault-injection` feature
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use urpc::{HandlerKind, Nexus, Rpc, RpcConfig, UdpTransport};
//!
//! // One Nexus per process; register handlers before creating endpoints.
//! let nexus = Nexus::bind("0.0.0.0:31850")?;
//! nexus.register_req_handler(1, HandlerKind::Foreground, |req| {
//!     let n = req.req_data().len();
//!     let echo = req.req_data().to_vec();
//!     req.resp_buf()[..n].copy_from_slice(&echo);
//!     req.enqueue_response(n);
//! })?;
//!
//! let transport = UdpTransport::new("0.0.0.0:0", 4096, 64)?;
//! let rpc = Rpc::new(&nexus, 0, transport, |_event| {}, RpcConfig::default())?;
//!
//! // Client side: connect, enqueue, pump.
//! let session = rpc.create_session("server-host:31850", 0)?;
//! let req = rpc.alloc_msg_buffer(64)?;
//! let resp = rpc.alloc_msg_buffer(64)?;
//! rpc.enqueue_request(session, 1, req, resp, |_rpc, resp, tag| {
//!     println!("tag {}: {} bytes", tag, resp.resp_data().len());
//! }, 7).map_err(|e| e.error)?;
//!
//! loop {
//!     rpc.run_event_loop_once();
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`config`]: endpoint configuration (`RpcConfig`)
//! - [`packet`]: datapath packet header (`PktHdr`)
//! - [`buffer`]: message buffers and the packet pool (`MsgBuffer`, `PktBufPool`)
//! - [`transport`]: transport adapter trait and the UDP shim
//! - [`session`]: sessions, slots and the session table
//! - [`sm`]: session-management wire format
//! - [`nexus`]: process-global registry and SM listener
//! - [`bg`]: background handler pool
//! - [`fault`]: fault-injection hooks
//! - [`timing`]: timing wheel for retransmission timeouts
//! - [`rpc`]: the endpoint (`Rpc`)

pub mod bg;
pub mod buffer;
pub mod config;
pub mod error;
pub mod fault;
pub mod nexus;
pub mod packet;
pub mod rpc;
pub mod session;
pub mod sm;
pub mod timing;
pub mod transport;

// Re-export main types
pub use buffer::{MsgBuffer, PktBufPool};
pub use config::RpcConfig;
pub use error::{EnqueueError, Error, Result};
pub use nexus::{HandlerKind, Nexus, ReqHandlerFn};
pub use packet::{PktHdr, PktType, PKT_HDR_SIZE};
pub use rpc::{Continuation, ReqHandle, RespHandle, Rpc, SmEvent, SmEventKind};
pub use session::{SessionHandle, SessionState};
pub use sm::{SmErrCode, SmPacket, SmPayload, SmPktType};
pub use transport::{MemKey, RxPacket, Transport, TxPacket, UdpTransport};
