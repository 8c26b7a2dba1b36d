//! End-to-end tests: two endpoints over loopback UDP.

mod common;

use std::cell::RefCell;
use std::net::UdpSocket;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{bind_nexus, connect, fast_config, loopback_transport, pump_all, ECHO_REQ};
use urpc::{
    Error, HandlerKind, Nexus, Rpc, RpcConfig, SessionState, SmErrCode, SmEvent, SmEventKind,
    SmPacket, SmPayload, SmPktType, UdpTransport,
};

type CompletionLog = Rc<RefCell<Vec<(u64, Vec<u8>)>>>;

fn register_echo(nexus: &Nexus) {
    nexus
        .register_req_handler(ECHO_REQ, HandlerKind::Foreground, |req| {
            let n = req.req_data().len();
            let echo = req.req_data().to_vec();
            req.resp_buf()[..n].copy_from_slice(&echo);
            req.enqueue_response(n);
        })
        .unwrap();
}

/// Enqueue a request whose continuation records (tag, response bytes).
fn send_logged(
    rpc: &Rpc<UdpTransport>,
    session: urpc::SessionHandle,
    req_type: u8,
    payload: &[u8],
    resp_cap: usize,
    log: &CompletionLog,
    tag: u64,
) {
    let mut req = rpc.alloc_msg_buffer(payload.len()).unwrap();
    req.copy_from(payload).unwrap();
    let resp = rpc.alloc_msg_buffer(resp_cap).unwrap();
    let log = log.clone();
    rpc.enqueue_request(
        session,
        req_type,
        req,
        resp,
        move |rpc, h, tag| {
            log.borrow_mut().push((tag, h.resp_data().to_vec()));
            let _ = rpc.release_response(h);
        },
        tag,
    )
    .map_err(|e| e.error)
    .unwrap();
}

// =============================================================================
// Echo and segmentation
// =============================================================================

#[test]
fn test_echo_roundtrip() {
    let client_nexus = bind_nexus();
    let server_nexus = bind_nexus();
    register_echo(&server_nexus);

    let client = Rpc::new(
        &client_nexus,
        0,
        loopback_transport(),
        |_: SmEvent| {},
        fast_config(),
    )
    .unwrap();
    let server = Rpc::new(
        &server_nexus,
        1,
        loopback_transport(),
        |_: SmEvent| {},
        fast_config(),
    )
    .unwrap();

    let session = connect(&client, &server, &server_nexus, 1);

    let log: CompletionLog = Rc::new(RefCell::new(Vec::new()));
    send_logged(&client, session, ECHO_REQ, &[0xAB; 64], 4096, &log, 7);

    assert!(pump_all(
        &[&client, &server],
        Duration::from_secs(5),
        || !log.borrow().is_empty()
    ));

    let log = log.borrow();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].0, 7);
    assert_eq!(log[0].1, vec![0xAB; 64]);
}

#[test]
fn test_large_request_single_handler_invocation() {
    const REQ_SIZE: usize = 64 * 1024;

    let client_nexus = bind_nexus();
    let server_nexus = bind_nexus();

    let invocations = Arc::new(AtomicUsize::new(0));
    let observed_len = Arc::new(AtomicUsize::new(0));
    {
        let invocations = invocations.clone();
        let observed_len = observed_len.clone();
        server_nexus
            .register_req_handler(2, HandlerKind::Foreground, move |req| {
                invocations.fetch_add(1, Ordering::SeqCst);
                observed_len.store(req.req_data().len(), Ordering::SeqCst);
                req.resp_buf()[..8].copy_from_slice(b"received");
                req.enqueue_response(8);
            })
            .unwrap();
    }

    let client = Rpc::new(
        &client_nexus,
        0,
        loopback_transport(),
        |_: SmEvent| {},
        fast_config(),
    )
    .unwrap();
    let server = Rpc::new(
        &server_nexus,
        1,
        loopback_transport(),
        |_: SmEvent| {},
        fast_config(),
    )
    .unwrap();

    let session = connect(&client, &server, &server_nexus, 1);

    let payload: Vec<u8> = (0..REQ_SIZE).map(|i| (i % 251) as u8).collect();
    let log: CompletionLog = Rc::new(RefCell::new(Vec::new()));
    send_logged(&client, session, 2, &payload, 4096, &log, 1);

    assert!(pump_all(
        &[&client, &server],
        Duration::from_secs(10),
        || !log.borrow().is_empty()
    ));

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(observed_len.load(Ordering::SeqCst), REQ_SIZE);
    assert_eq!(log.borrow()[0].1, b"received");
}

// =============================================================================
// Window and flow control
// =============================================================================

#[test]
fn test_window_bounds_outstanding_exchanges() {
    let client_nexus = bind_nexus();
    let server_nexus = bind_nexus();
    register_echo(&server_nexus);

    let config = fast_config().with_req_window(2);
    let client = Rpc::new(
        &client_nexus,
        0,
        loopback_transport(),
        |_: SmEvent| {},
        config.clone(),
    )
    .unwrap();
    let server = Rpc::new(
        &server_nexus,
        1,
        loopback_transport(),
        |_: SmEvent| {},
        config,
    )
    .unwrap();

    let session = connect(&client, &server, &server_nexus, 1);
    assert_eq!(client.window_free_slots(session), 2);

    let log: CompletionLog = Rc::new(RefCell::new(Vec::new()));
    send_logged(&client, session, ECHO_REQ, b"a", 4096, &log, 0);
    send_logged(&client, session, ECHO_REQ, b"b", 4096, &log, 1);
    assert_eq!(client.window_free_slots(session), 0);

    // The third submission must bounce and hand both buffers back
    let req = client.alloc_msg_buffer(1).unwrap();
    let resp = client.alloc_msg_buffer(16).unwrap();
    let err = client
        .enqueue_request(session, ECHO_REQ, req, resp, |_, _, _| {}, 2)
        .unwrap_err();
    assert!(matches!(
        err.error,
        Error::SlotBusy(_) | Error::NoCredits
    ));
    client.free_msg_buffer(err.req);
    client.free_msg_buffer(err.resp);

    assert!(pump_all(&[&client, &server], Duration::from_secs(5), || log
        .borrow()
        .len()
        == 2));
    assert_eq!(client.window_free_slots(session), 2);
}

#[test]
fn test_submission_order_is_fifo() {
    let client_nexus = bind_nexus();
    let server_nexus = bind_nexus();

    let arrival: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let arrival = arrival.clone();
        server_nexus
            .register_req_handler(3, HandlerKind::Foreground, move |req| {
                arrival.lock().unwrap().push(req.req_data()[0]);
                req.resp_buf()[0] = req.req_data()[0];
                req.enqueue_response(1);
            })
            .unwrap();
    }

    let client = Rpc::new(
        &client_nexus,
        0,
        loopback_transport(),
        |_: SmEvent| {},
        fast_config(),
    )
    .unwrap();
    let server = Rpc::new(
        &server_nexus,
        1,
        loopback_transport(),
        |_: SmEvent| {},
        fast_config(),
    )
    .unwrap();

    let session = connect(&client, &server, &server_nexus, 1);

    let log: CompletionLog = Rc::new(RefCell::new(Vec::new()));
    for i in 0..4u8 {
        send_logged(&client, session, 3, &[i], 16, &log, i as u64);
    }

    assert!(pump_all(&[&client, &server], Duration::from_secs(5), || log
        .borrow()
        .len()
        == 4));
    assert_eq!(*arrival.lock().unwrap(), vec![0, 1, 2, 3]);
}

// =============================================================================
// Background handlers
// =============================================================================

#[test]
fn test_background_handler_echo() {
    let client_nexus = bind_nexus();
    let server_nexus = bind_nexus();
    server_nexus
        .register_req_handler(ECHO_REQ, HandlerKind::Background, |req| {
            let n = req.req_data().len();
            let echo = req.req_data().to_vec();
            req.resp_buf()[..n].copy_from_slice(&echo);
            req.enqueue_response(n);
        })
        .unwrap();

    let client = Rpc::new(
        &client_nexus,
        0,
        loopback_transport(),
        |_: SmEvent| {},
        fast_config(),
    )
    .unwrap();
    let server = Rpc::new(
        &server_nexus,
        1,
        loopback_transport(),
        |_: SmEvent| {},
        fast_config().with_bg_threads(2),
    )
    .unwrap();

    let session = connect(&client, &server, &server_nexus, 1);

    let log: CompletionLog = Rc::new(RefCell::new(Vec::new()));
    send_logged(&client, session, ECHO_REQ, b"offloaded", 4096, &log, 3);

    assert!(pump_all(
        &[&client, &server],
        Duration::from_secs(5),
        || !log.borrow().is_empty()
    ));
    assert_eq!(log.borrow()[0].1, b"offloaded");
}

// =============================================================================
// Fault injection
// =============================================================================

#[cfg(feature = "fault-injection")]
#[test]
fn test_drop_tx_local_recovers_via_retransmission() {
    let client_nexus = bind_nexus();
    let server_nexus = bind_nexus();
    register_echo(&server_nexus);

    let client = Rpc::new(
        &client_nexus,
        0,
        loopback_transport(),
        |_: SmEvent| {},
        fast_config(),
    )
    .unwrap();
    let server = Rpc::new(
        &server_nexus,
        1,
        loopback_transport(),
        |_: SmEvent| {},
        fast_config(),
    )
    .unwrap();

    let session = connect(&client, &server, &server_nexus, 1);

    client.fault_drop_tx_local(3).unwrap();

    let log: CompletionLog = Rc::new(RefCell::new(Vec::new()));
    send_logged(&client, session, ECHO_REQ, b"persistent", 4096, &log, 9);

    // Initial send and the first two retransmissions are swallowed; the
    // third retransmission gets through
    assert!(pump_all(
        &[&client, &server],
        Duration::from_secs(10),
        || !log.borrow().is_empty()
    ));
    assert_eq!(log.borrow()[0].1, b"persistent");
    assert!(client.is_connected(session));
}

#[cfg(feature = "fault-injection")]
#[test]
fn test_peer_reset_roundtrip() {
    let client_nexus = bind_nexus();
    let server_nexus = bind_nexus();
    register_echo(&server_nexus);

    let server_events: Rc<RefCell<Vec<SmEventKind>>> = Rc::new(RefCell::new(Vec::new()));
    let client_events: Rc<RefCell<Vec<SmEventKind>>> = Rc::new(RefCell::new(Vec::new()));

    let client = {
        let events = client_events.clone();
        Rpc::new(
            &client_nexus,
            0,
            loopback_transport(),
            move |e: SmEvent| events.borrow_mut().push(e.kind),
            fast_config(),
        )
        .unwrap()
    };
    let server = {
        let events = server_events.clone();
        Rpc::new(
            &server_nexus,
            1,
            loopback_transport(),
            move |e: SmEvent| events.borrow_mut().push(e.kind),
            fast_config(),
        )
        .unwrap()
    };

    let session = connect(&client, &server, &server_nexus, 1);

    client.fault_reset_remote_peer(session).unwrap();
    assert_eq!(
        client.session_state(session),
        Some(SessionState::ResetInProgress)
    );

    assert!(pump_all(&[&client, &server], Duration::from_secs(5), || {
        client.session_state(session) == Some(SessionState::Connected)
    }));
    assert!(server_events.borrow().contains(&SmEventKind::PeerReset));
    assert!(client_events.borrow().contains(&SmEventKind::ResetComplete));

    // The reset session keeps working
    let log: CompletionLog = Rc::new(RefCell::new(Vec::new()));
    send_logged(&client, session, ECHO_REQ, b"after-reset", 4096, &log, 11);
    assert!(pump_all(
        &[&client, &server],
        Duration::from_secs(5),
        || !log.borrow().is_empty()
    ));
    assert_eq!(log.borrow()[0].1, b"after-reset");
}

#[cfg(feature = "fault-injection")]
#[test]
fn test_fault_injection_rejected_from_non_creator_thread() {
    let client_nexus = bind_nexus();
    let server_nexus = bind_nexus();
    register_echo(&server_nexus);

    // Huge RTO: if the off-thread call managed to install a drop countdown,
    // the echo below could not complete inside the pump window.
    let config = fast_config().with_rto_us(10_000_000);
    let client = Rpc::new(
        &client_nexus,
        0,
        loopback_transport(),
        |_: SmEvent| {},
        config.clone(),
    )
    .unwrap();
    let server = Rpc::new(
        &server_nexus,
        1,
        loopback_transport(),
        |_: SmEvent| {},
        config,
    )
    .unwrap();

    let session = connect(&client, &server, &server_nexus, 1);

    // The endpoint type is not Send, so a compliant caller cannot move even
    // a reference across threads; smuggle a raw pointer to exercise the
    // runtime gate the way a non-compliant caller would.
    struct Smuggled(*const Rpc<UdpTransport>);
    unsafe impl Send for Smuggled {}

    let smuggled = Smuggled(&client);
    let (drop_refused, reset_refused, resolve_refused) = std::thread::spawn(move || {
        let smuggled = smuggled;
        let rpc = unsafe { &*smuggled.0 };
        (
            matches!(rpc.fault_drop_tx_local(3), Err(Error::FaultInjectionForbidden)),
            matches!(
                rpc.fault_reset_remote_peer(session),
                Err(Error::FaultInjectionForbidden)
            ),
            matches!(
                rpc.fault_resolve_server_rinfo(),
                Err(Error::FaultInjectionForbidden)
            ),
        )
    })
    .join()
    .unwrap();
    assert!(drop_refused, "drop-TX must be refused off-thread");
    assert!(reset_refused, "peer reset must be refused off-thread");
    assert!(resolve_refused, "re-resolution must be refused off-thread");

    // No state was mutated: the session never left Connected and the
    // datapath drops nothing.
    assert_eq!(client.session_state(session), Some(SessionState::Connected));
    let log: CompletionLog = Rc::new(RefCell::new(Vec::new()));
    send_logged(&client, session, ECHO_REQ, b"still-clean", 4096, &log, 1);
    assert!(pump_all(
        &[&client, &server],
        Duration::from_secs(2),
        || !log.borrow().is_empty()
    ));
    assert_eq!(log.borrow()[0].1, b"still-clean");
}

#[cfg(feature = "fault-injection")]
#[test]
fn test_fault_ops_require_valid_session() {
    let nexus = bind_nexus();
    let rpc = Rpc::new(
        &nexus,
        0,
        loopback_transport(),
        |_: SmEvent| {},
        fast_config(),
    )
    .unwrap();

    assert!(matches!(
        rpc.fault_drop_tx_remote(urpc::SessionHandle(0), 1),
        Err(Error::SessionNotFound(0))
    ));
    rpc.fault_drop_tx_local(1).unwrap();
    rpc.fault_resolve_server_rinfo().unwrap();
}

// =============================================================================
// Leader redirect
// =============================================================================

#[test]
fn test_leader_redirect() {
    let client_nexus = bind_nexus();
    let server_nexus = bind_nexus();

    // One handler serves both server endpoints: the "follower" redirects,
    // the "leader" accepts.
    server_nexus
        .register_req_handler(4, HandlerKind::Foreground, |req| {
            if req.req_data() == b"put@follower" {
                req.resp_buf()[..10].copy_from_slice(b"redirect:2");
                req.enqueue_response(10);
            } else {
                req.resp_buf()[..2].copy_from_slice(b"ok");
                req.enqueue_response(2);
            }
        })
        .unwrap();

    let client = Rpc::new(
        &client_nexus,
        0,
        loopback_transport(),
        |_: SmEvent| {},
        fast_config(),
    )
    .unwrap();
    let follower = Rpc::new(
        &server_nexus,
        1,
        loopback_transport(),
        |_: SmEvent| {},
        fast_config(),
    )
    .unwrap();
    let leader = Rpc::new(
        &server_nexus,
        2,
        loopback_transport(),
        |_: SmEvent| {},
        fast_config(),
    )
    .unwrap();

    let session1 = connect(&client, &follower, &server_nexus, 1);

    // The continuation observes the redirect and retargets a new session
    let server_uri = server_nexus.sm_addr().to_string();
    let redirect_session: Rc<RefCell<Option<urpc::SessionHandle>>> = Rc::new(RefCell::new(None));
    {
        let mut req = client.alloc_msg_buffer(12).unwrap();
        req.copy_from(b"put@follower").unwrap();
        let resp = client.alloc_msg_buffer(64).unwrap();
        let redirect_session = redirect_session.clone();
        client
            .enqueue_request(
                session1,
                4,
                req,
                resp,
                move |rpc, h, _tag| {
                    assert_eq!(h.resp_data(), b"redirect:2");
                    let handle = rpc.create_session(&server_uri, 2).unwrap();
                    *redirect_session.borrow_mut() = Some(handle);
                    let _ = rpc.release_response(h);
                },
                0,
            )
            .map_err(|e| e.error)
            .unwrap();
    }

    assert!(pump_all(
        &[&client, &follower, &leader],
        Duration::from_secs(5),
        || match *redirect_session.borrow() {
            Some(s) => client.is_connected(s),
            None => false,
        }
    ));

    let session2 = (*redirect_session.borrow()).unwrap();
    let log: CompletionLog = Rc::new(RefCell::new(Vec::new()));
    send_logged(&client, session2, 4, b"put@leader", 64, &log, 1);
    assert!(pump_all(
        &[&client, &follower, &leader],
        Duration::from_secs(5),
        || !log.borrow().is_empty()
    ));
    assert_eq!(log.borrow()[0].1, b"ok");
}

// =============================================================================
// Teardown
// =============================================================================

#[test]
fn test_destroy_while_busy_fails_all_exchanges() {
    let client_nexus = bind_nexus();
    let server_nexus = bind_nexus();
    // req_type 99 has no handler: the server aborts those exchanges

    let config = fast_config().with_rto_us(1_000_000);
    let client = Rpc::new(
        &client_nexus,
        0,
        loopback_transport(),
        |_: SmEvent| {},
        config.clone(),
    )
    .unwrap();
    let server = Rpc::new(
        &server_nexus,
        1,
        loopback_transport(),
        |_: SmEvent| {},
        config,
    )
    .unwrap();

    let session = connect(&client, &server, &server_nexus, 1);

    let log: CompletionLog = Rc::new(RefCell::new(Vec::new()));
    for tag in 0..3u64 {
        send_logged(&client, session, 99, b"doomed", 64, &log, tag);
    }
    // Flush the requests without giving the server a turn
    client.run_event_loop_once();

    client.destroy_session(session).unwrap();
    assert_eq!(
        client.session_state(session),
        Some(SessionState::DisconnectInProgress)
    );

    assert!(pump_all(&[&client, &server], Duration::from_secs(5), || {
        log.borrow().len() == 3 && client.session_state(session).is_none()
    }));

    // Every exchange completed exactly once, with an empty response
    let log = log.borrow();
    assert_eq!(log.len(), 3);
    assert!(log.iter().all(|(_, resp)| resp.is_empty()));
    assert_eq!(server.active_sessions(), 0);
}

#[test]
fn test_connect_to_invalid_remote_id_fails() {
    let client_nexus = bind_nexus();
    let server_nexus = bind_nexus();

    let events: Rc<RefCell<Vec<(SmEventKind, SmErrCode)>>> = Rc::new(RefCell::new(Vec::new()));
    let client = {
        let events = events.clone();
        Rpc::new(
            &client_nexus,
            0,
            loopback_transport(),
            move |e: SmEvent| events.borrow_mut().push((e.kind, e.err)),
            fast_config(),
        )
        .unwrap()
    };

    // No endpoint 42 exists on the server Nexus; its listener NAKs
    let uri = server_nexus.sm_addr().to_string();
    let session = client.create_session(&uri, 42).unwrap();

    assert!(pump_all(&[&client], Duration::from_secs(5), || {
        client.session_state(session) == Some(SessionState::Error)
    }));
    assert!(events
        .borrow()
        .iter()
        .any(|(k, e)| *k == SmEventKind::ConnectFailed && *e == SmErrCode::InvalidRemoteRpcId));

    // Every subsequent submit bounces
    let req = client.alloc_msg_buffer(4).unwrap();
    let resp = client.alloc_msg_buffer(4).unwrap();
    let err = client
        .enqueue_request(session, ECHO_REQ, req, resp, |_, _, _| {}, 0)
        .unwrap_err();
    assert!(matches!(err.error, Error::SessionNotConnected(_)));
}

// =============================================================================
// SM idempotence
// =============================================================================

#[test]
fn test_duplicate_connect_req_replays_same_ack() {
    let server_nexus = bind_nexus();
    register_echo(&server_nexus);
    let server = Rpc::new(
        &server_nexus,
        1,
        loopback_transport(),
        |_: SmEvent| {},
        fast_config(),
    )
    .unwrap();

    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    sock.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
    let req = SmPacket {
        kind: SmPktType::ConnectReq,
        sender_uri: sock.local_addr().unwrap(),
        sender_rpc_id: 9,
        dst_rpc_id: 1,
        cli_sess_num: 0,
        svr_sess_num: u16::MAX,
        seq: 0,
        err: SmErrCode::NoError,
        payload: SmPayload::Connect {
            dp_addr: "127.0.0.1:40000".parse().unwrap(),
            req_window: 8,
        },
    };

    let mut acks = Vec::new();
    let mut buf = [0u8; 512];
    for _ in 0..2 {
        sock.send_to(&req.encode().unwrap(), server_nexus.sm_addr())
            .unwrap();
        for _ in 0..100 {
            server.run_event_loop_once();
            match sock.recv_from(&mut buf) {
                Ok((len, _)) => {
                    acks.push(SmPacket::decode(&buf[..len]).unwrap());
                    break;
                }
                Err(_) => continue,
            }
        }
    }

    assert_eq!(acks.len(), 2, "expected an ACK per transmission");
    assert_eq!(acks[0], acks[1], "duplicate request must replay the same ACK");
    assert_eq!(acks[0].err, SmErrCode::NoError);
    assert_eq!(server.active_sessions(), 1, "no duplicate session created");
}

// =============================================================================
// API restrictions
// =============================================================================

#[test]
#[should_panic(expected = "reentered")]
fn test_event_loop_reentry_from_continuation_aborts() {
    let client_nexus = bind_nexus();
    let server_nexus = bind_nexus();
    register_echo(&server_nexus);

    let client = Rc::new(
        Rpc::new(
            &client_nexus,
            0,
            loopback_transport(),
            |_: SmEvent| {},
            fast_config(),
        )
        .unwrap(),
    );
    let server = Rpc::new(
        &server_nexus,
        1,
        loopback_transport(),
        |_: SmEvent| {},
        fast_config(),
    )
    .unwrap();

    let session = connect(client.as_ref(), &server, &server_nexus, 1);

    let req = client.alloc_msg_buffer(4).unwrap();
    let resp = client.alloc_msg_buffer(16).unwrap();
    let client2 = client.clone();
    client
        .enqueue_request(
            session,
            ECHO_REQ,
            req,
            resp,
            move |_rpc, _h, _tag| {
                client2.run_event_loop_once();
            },
            0,
        )
        .map_err(|e| e.error)
        .unwrap();

    pump_all(&[client.as_ref(), &server], Duration::from_secs(5), || false);
}

#[test]
fn test_destroy_session_from_continuation_is_forbidden() {
    let client_nexus = bind_nexus();
    let server_nexus = bind_nexus();
    register_echo(&server_nexus);

    let client = Rpc::new(
        &client_nexus,
        0,
        loopback_transport(),
        |_: SmEvent| {},
        fast_config(),
    )
    .unwrap();
    let server = Rpc::new(
        &server_nexus,
        1,
        loopback_transport(),
        |_: SmEvent| {},
        fast_config(),
    )
    .unwrap();

    let session = connect(&client, &server, &server_nexus, 1);

    let result: Rc<RefCell<Option<urpc::Result<()>>>> = Rc::new(RefCell::new(None));
    let req = client.alloc_msg_buffer(4).unwrap();
    let resp = client.alloc_msg_buffer(16).unwrap();
    {
        let result = result.clone();
        client
            .enqueue_request(
                session,
                ECHO_REQ,
                req,
                resp,
                move |rpc, _h, _tag| {
                    *result.borrow_mut() = Some(rpc.destroy_session(session));
                },
                0,
            )
            .map_err(|e| e.error)
            .unwrap();
    }

    assert!(pump_all(&[&client, &server], Duration::from_secs(5), || {
        result.borrow().is_some()
    }));
    assert!(matches!(
        result.borrow().as_ref().unwrap(),
        Err(Error::ForbiddenContext)
    ));
    // The session is untouched
    assert!(client.is_connected(session));
}

#[test]
fn test_bad_uri_rejected() {
    let nexus = bind_nexus();
    let rpc = Rpc::new(
        &nexus,
        0,
        loopback_transport(),
        |_: SmEvent| {},
        fast_config(),
    )
    .unwrap();

    assert!(matches!(
        rpc.create_session("definitely not a uri", 1),
        Err(Error::BadUri(_))
    ));
}

#[test]
fn test_msg_buffer_budget() {
    let nexus = bind_nexus();
    let config = RpcConfig::default().with_req_window(8);
    let rpc = Rpc::new(
        &nexus,
        0,
        loopback_transport(),
        |_: SmEvent| {},
        config,
    )
    .unwrap();

    assert!(matches!(
        rpc.alloc_msg_buffer(usize::MAX),
        Err(Error::MsgTooLarge { .. })
    ));

    let max = rpc.config().max_msg_buffers;
    let mut held = Vec::new();
    for _ in 0..max {
        held.push(rpc.alloc_msg_buffer(16).unwrap());
    }
    assert!(matches!(
        rpc.alloc_msg_buffer(16),
        Err(Error::BufPoolExhausted(_))
    ));
    for buf in held {
        rpc.free_msg_buffer(buf);
    }
    assert!(rpc.alloc_msg_buffer(16).is_ok());
}
