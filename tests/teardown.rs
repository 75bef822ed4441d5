use rdma_flow::{
    access::Role,
    config::Timeouts,
    error::ErrorKind,
    sim::Op,
    verbs::{CmEventKind, ConnParam, DEFAULT_BACKLOG},
    BundleConfig, ConnectionEndpoint, FlowError, HandshakeState, Listener,
};

mod test_utilities;
use test_utilities::*;

/// Acquisition steps of a resource bundle, in order
const ACQUIRE: [Op; 5] = [
    Op::AllocPd,
    Op::CreateCompChannel,
    Op::CreateCq,
    Op::CreateQp,
    Op::RegMr,
];

/// The release of what an acquisition step created
fn release_of(op: Op) -> Op {
    match op {
        Op::AllocPd => Op::DeallocPd,
        Op::CreateCompChannel => Op::DestroyCompChannel,
        Op::CreateCq => Op::DestroyCq,
        Op::CreateQp => Op::DestroyQp,
        Op::RegMr => Op::DeregMr,
        other => panic!("{other:?} acquires nothing"),
    }
}

#[test]
fn failed_step_releases_earlier_steps_in_reverse() {
    for (failing, step) in ACQUIRE.iter().enumerate() {
        let verbs = sim();
        let server = get_unused_ipv4_addr();
        let _listener = Listener::bind(&verbs, server, DEFAULT_BACKLOG).unwrap();
        let mut ep = ConnectionEndpoint::resolve(
            &verbs,
            get_unused_ipv4_addr(),
            server,
            &Timeouts::default(),
        )
        .unwrap();
        let live = verbs.live_handles();
        let from = verbs.journal().len();

        verbs.fail_next(*step);
        let err = ep
            .acquire(&BundleConfig::new(Role::Sender, TEST_BUFFER_SIZE))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Setup, "{step:?}: {err}");
        assert!(ep.bundle().is_none());

        let mut expected: Vec<Op> = ACQUIRE[..=failing].to_vec();
        expected.extend(ACQUIRE[..failing].iter().rev().map(|op| release_of(*op)));
        assert_eq!(ops_since(&verbs, from), expected, "failing {step:?}");
        assert_eq!(verbs.live_handles(), live, "leak after failing {step:?}");

        let failed: Vec<_> = verbs.journal()[from..]
            .iter()
            .filter(|c| !c.ok)
            .map(|c| c.op)
            .collect();
        assert_eq!(failed, vec![*step]);
    }
}

#[test]
fn dropping_an_endpoint_releases_bundle_then_ids() {
    let verbs = sim();
    let server = get_unused_ipv4_addr();
    let _listener = Listener::bind(&verbs, server, DEFAULT_BACKLOG).unwrap();
    let live = verbs.live_handles();

    let mut ep = ConnectionEndpoint::resolve(
        &verbs,
        get_unused_ipv4_addr(),
        server,
        &Timeouts::default(),
    )
    .unwrap();
    let _ = ep
        .acquire(&BundleConfig::new(Role::Sender, TEST_BUFFER_SIZE))
        .unwrap();
    let from = verbs.journal().len();
    drop(ep);

    assert_eq!(
        ops_since(&verbs, from),
        vec![
            Op::DeregMr,
            Op::DestroyQp,
            Op::DestroyCq,
            Op::DestroyCompChannel,
            Op::DeallocPd,
            Op::DestroyId,
            Op::DestroyEventChannel,
        ]
    );
    assert!(verbs.journal()[from..].iter().all(|c| c.ok));
    assert_eq!(verbs.live_handles(), live);
}

#[test]
fn rejected_connect_fails_the_handshake_and_leaks_nothing() {
    let verbs = sim();
    let timeouts = Timeouts::default();
    // nobody listens on the destination
    let mut ep = ConnectionEndpoint::resolve(
        &verbs,
        get_unused_ipv4_addr(),
        get_unused_ipv4_addr(),
        &timeouts,
    )
    .unwrap();
    let _ = ep
        .acquire(&BundleConfig::new(Role::Sender, TEST_BUFFER_SIZE))
        .unwrap();

    let err = ep.connect(&ConnParam::default(), &timeouts).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Handshake);
    match err {
        FlowError::UnexpectedEvent {
            expected,
            observed,
            status,
        } => {
            assert_eq!(expected, CmEventKind::Established);
            assert_eq!(observed, CmEventKind::Rejected);
            assert_eq!(status, 28);
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(ep.state(), HandshakeState::Failed);

    drop(ep);
    assert_eq!(verbs.live_handles(), 0);
    assert!(!verbs.journal().iter().any(|c| c.op == Op::Disconnect));
    assert_events_acked(&verbs);
}

#[test]
fn failed_route_resolution_releases_the_id() {
    let verbs = sim();
    verbs.override_event(Op::ResolveRoute, CmEventKind::RouteError, -110);

    let err = ConnectionEndpoint::resolve(
        &verbs,
        get_unused_ipv4_addr(),
        get_unused_ipv4_addr(),
        &Timeouts::default(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        FlowError::UnexpectedEvent {
            expected: CmEventKind::RouteResolved,
            observed: CmEventKind::RouteError,
            status: -110,
        }
    ));
    assert_eq!(verbs.live_handles(), 0);
    assert!(!verbs
        .journal()
        .iter()
        .any(|c| ACQUIRE.contains(&c.op) || c.op == Op::Connect));
    assert_events_acked(&verbs);
}

#[test]
fn failed_registration_on_the_server_side_leaks_nothing() {
    let verbs = sim();
    let addr = get_unused_ipv4_addr();
    let timeouts = Timeouts::default();
    let listener = Listener::bind(&verbs, addr, DEFAULT_BACKLOG).unwrap();

    let mut client =
        ConnectionEndpoint::resolve(&verbs, get_unused_ipv4_addr(), addr, &timeouts).unwrap();
    let _ = client
        .acquire(&BundleConfig::new(Role::Sender, TEST_BUFFER_SIZE))
        .unwrap();
    std::thread::scope(|s| {
        let _ = s.spawn(|| {
            let _ = client.connect(&ConnParam::default(), &timeouts);
        });
        let mut ep = listener.next_request(&timeouts).unwrap();
        assert_eq!(ep.state(), HandshakeState::ConnectRequested);
        verbs.fail_next(Op::RegMr);
        let err = ep
            .acquire(&BundleConfig::new(Role::Receiver, TEST_BUFFER_SIZE))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Setup);
        // dropping the server side without accepting ends the client's wait
        drop(ep);
    });

    assert_eq!(client.state(), HandshakeState::Failed);
    drop(client);
    assert_eq!(verbs.live_handles(), 0);
    assert_events_acked(&verbs);
}
