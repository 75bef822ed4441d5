use rdma_flow::{
    access::Role,
    config::Timeouts,
    error::ErrorKind,
    sim::Op,
    verbs::{CmEventKind, ConnParam, DEFAULT_BACKLOG},
    BundleConfig, ConnectionEndpoint, FlowError, HandshakeState, Listener, MrAccess,
};
use std::{thread, time::Duration};

mod test_utilities;
use test_utilities::*;

#[test]
fn both_sides_reach_established() {
    let verbs = sim();
    let server_addr = get_unused_ipv4_addr();
    let client_addr = get_unused_ipv4_addr();
    let timeouts = Timeouts::default();
    let listener = Listener::bind(&verbs, server_addr, DEFAULT_BACKLOG).unwrap();
    assert_eq!(listener.local_addr(), server_addr);

    let mut client =
        ConnectionEndpoint::resolve(&verbs, client_addr, server_addr, &timeouts).unwrap();
    assert_eq!(client.state(), HandshakeState::RouteResolved);
    assert_eq!(client.local_addr(), client_addr);
    assert_eq!(client.remote_addr(), Some(server_addr));
    let _ = client
        .acquire(&BundleConfig::new(Role::Sender, TEST_BUFFER_SIZE))
        .unwrap();

    let server = thread::scope(|s| {
        let _ = s.spawn(|| client.connect(&ConnParam::default(), &timeouts).unwrap());
        let mut ep = listener.next_request(&timeouts).unwrap();
        assert_eq!(ep.state(), HandshakeState::ConnectRequested);
        let _ = ep
            .acquire(&BundleConfig::new(Role::Receiver, TEST_BUFFER_SIZE))
            .unwrap();
        ep.accept(&ConnParam::default(), &timeouts).unwrap();
        ep
    });
    assert_eq!(client.state(), HandshakeState::Established);
    assert_eq!(server.state(), HandshakeState::Established);
    assert_eq!(server.local_addr(), server_addr);
    assert_eq!(server.bundle().unwrap().mr().length(), TEST_BUFFER_SIZE);
    assert_eq!(server.bundle().unwrap().buffer().len(), TEST_BUFFER_SIZE);

    drop(client);
    drop(server);
    let disconnects = verbs
        .journal()
        .iter()
        .filter(|c| c.op == Op::Disconnect && c.ok)
        .count();
    assert_eq!(disconnects, 1);
    assert_eq!(verbs.live_handles(), 0);
    assert_events_acked(&verbs);
}

#[test]
fn every_event_is_acknowledged_once_retrieved() {
    let verbs = sim();
    let server_addr = get_unused_ipv4_addr();
    let timeouts = Timeouts::default();
    let listener = Listener::bind(&verbs, server_addr, DEFAULT_BACKLOG).unwrap();
    let mut client =
        ConnectionEndpoint::resolve(&verbs, get_unused_ipv4_addr(), server_addr, &timeouts)
            .unwrap();

    // resolution retrieved two events, and acknowledged each before moving on
    let ops: Vec<Op> = verbs
        .journal()
        .iter()
        .map(|c| c.op)
        .filter(|op| matches!(op, Op::GetCmEvent | Op::AckCmEvent))
        .collect();
    assert_eq!(
        ops,
        vec![
            Op::GetCmEvent,
            Op::AckCmEvent,
            Op::GetCmEvent,
            Op::AckCmEvent
        ]
    );

    let _ = client
        .acquire(&BundleConfig::new(Role::Sender, TEST_BUFFER_SIZE))
        .unwrap();
    thread::scope(|s| {
        let _ = s.spawn(|| client.connect(&ConnParam::default(), &timeouts).unwrap());
        let mut ep = listener.next_request(&timeouts).unwrap();
        let _ = ep
            .acquire(&BundleConfig::new(Role::Receiver, TEST_BUFFER_SIZE))
            .unwrap();
        ep.accept(&ConnParam::default(), &timeouts).unwrap();
    });
    drop(client);
    assert_events_acked(&verbs);
}

#[test]
fn connect_error_on_accept_fails_both_sides() {
    let verbs = sim();
    let server_addr = get_unused_ipv4_addr();
    let timeouts = Timeouts {
        establish: Some(Duration::from_secs(5)),
        ..Timeouts::default()
    };
    let listener = Listener::bind(&verbs, server_addr, DEFAULT_BACKLOG).unwrap();
    let mut client =
        ConnectionEndpoint::resolve(&verbs, get_unused_ipv4_addr(), server_addr, &timeouts)
            .unwrap();
    let _ = client
        .acquire(&BundleConfig::new(Role::Sender, TEST_BUFFER_SIZE))
        .unwrap();
    verbs.override_event(Op::Accept, CmEventKind::ConnectError, -22);

    thread::scope(|s| {
        let client = s.spawn(|| client.connect(&ConnParam::default(), &timeouts));
        let mut ep = listener.next_request(&timeouts).unwrap();
        let _ = ep
            .acquire(&BundleConfig::new(Role::Receiver, TEST_BUFFER_SIZE))
            .unwrap();
        let err = ep.accept(&ConnParam::default(), &timeouts).unwrap_err();
        assert!(matches!(
            err,
            FlowError::UnexpectedEvent {
                expected: CmEventKind::Established,
                observed: CmEventKind::ConnectError,
                status: -22,
            }
        ));
        assert_eq!(ep.state(), HandshakeState::Failed);
        drop(ep);

        // the server dropping its id disconnects the waiting client
        let err = client.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Handshake);
    });
    assert_eq!(client.state(), HandshakeState::Failed);
    drop(client);
    assert_eq!(verbs.live_handles(), 0);
}

#[test]
fn failed_listen_is_a_handshake_failure() {
    let verbs = sim();
    let addr = get_unused_ipv4_addr();
    verbs.fail_next(Op::Listen);
    let err = Listener::bind(&verbs, addr, DEFAULT_BACKLOG).unwrap_err();
    assert!(matches!(
        err,
        FlowError::Handshake {
            step: "rdma_listen",
            ..
        }
    ));
    assert_eq!(verbs.live_handles(), 0);

    // the address is free again
    let _listener = Listener::bind(&verbs, addr, DEFAULT_BACKLOG).unwrap();
}
