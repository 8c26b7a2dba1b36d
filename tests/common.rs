//! Shared harness for integration tests.
//!
//! Each "process" is a Nexus bound to a loopback port plus one or more
//! endpoints on ephemeral UDP datapath sockets. Tests pump every endpoint
//! from the test thread until a predicate holds or a deadline passes.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use urpc::{Nexus, Rpc, RpcConfig, SessionHandle, UdpTransport};

/// Request type used by the echo handler.
pub const ECHO_REQ: u8 = 1;

pub fn loopback_transport() -> UdpTransport {
    UdpTransport::new("127.0.0.1:0", 4096, 64).expect("bind datapath socket")
}

pub fn bind_nexus() -> Arc<Nexus> {
    Nexus::bind("127.0.0.1:0").expect("bind nexus")
}

pub fn fast_config() -> RpcConfig {
    RpcConfig::default()
        .with_rto_us(3000)
        .with_max_retries(10)
        .with_sm_retry_interval_us(10_000)
}

/// Pump every endpoint until `done` returns true. Returns false on timeout.
pub fn pump_all(
    rpcs: &[&Rpc<UdpTransport>],
    timeout: Duration,
    mut done: impl FnMut() -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        for rpc in rpcs {
            rpc.run_event_loop_once();
        }
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_micros(200));
    }
    false
}

/// Connect a client session to `server_id` on the server's Nexus and pump
/// both sides until the handshake completes.
pub fn connect(
    client: &Rpc<UdpTransport>,
    server: &Rpc<UdpTransport>,
    server_nexus: &Nexus,
    server_id: u8,
) -> SessionHandle {
    let uri = server_nexus.sm_addr().to_string();
    let session = client
        .create_session(&uri, server_id)
        .expect("create_session");
    assert!(
        pump_all(&[client, server], Duration::from_secs(5), || client
            .is_connected(session)),
        "connect handshake timed out"
    );
    session
}
