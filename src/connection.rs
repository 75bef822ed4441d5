use crate::{
    cm_id::CmId,
    config::Timeouts,
    error::FlowError,
    error_utilities::{log_release, log_ret},
    event_channel::EventChannel,
    handshake::{await_transition, HandshakeOp, HandshakeState},
    resource::{BundleConfig, ResourceBundle},
    verbs::{ConnParam, Verbs},
};
use std::{net::SocketAddrV4, sync::Arc};
use tracing::info;

/// One side of a reliable connection together with the resources it owns.
///
/// Field order is teardown order: the resource bundle goes first (after the
/// disconnect issued in `drop`), then the connection id, then the listener id
/// on the server side, and the event channel last.
#[derive(Debug)]
pub struct ConnectionEndpoint<V: Verbs> {
    /// Resources, present once acquired
    bundle: Option<ResourceBundle<V>>,
    /// The id carrying the connection
    id: CmId<V>,
    /// Listening id the connection was accepted on
    _listener: Option<CmId<V>>,
    /// Channel both ids report to
    channel: EventChannel<V>,
    /// The backend
    verbs: Arc<V>,
    /// Handshake progress
    state: HandshakeState,
    /// Address this side is bound to
    local: SocketAddrV4,
    /// Address of the peer, if known
    remote: Option<SocketAddrV4>,
}

impl<V: Verbs> ConnectionEndpoint<V> {
    /// Client side: resolve the address and the route to `dst`, binding the
    /// connection to `src`.
    pub fn resolve(
        verbs: &Arc<V>,
        src: SocketAddrV4,
        dst: SocketAddrV4,
        timeouts: &Timeouts,
    ) -> Result<Self, FlowError> {
        let channel =
            EventChannel::new(verbs).map_err(FlowError::setup("rdma_create_event_channel"))?;
        let id = CmId::create(&channel).map_err(FlowError::setup("rdma_create_id"))?;
        let mut ep = Self {
            bundle: None,
            id,
            _listener: None,
            channel,
            verbs: Arc::clone(verbs),
            state: HandshakeState::Init,
            local: src,
            remote: Some(dst),
        };
        let raw = ep.id.raw();
        ep.issue(HandshakeOp::ResolveAddr, |v| {
            v.resolve_addr(raw, src, dst, timeouts.resolve)
        })?;
        // the resolution itself is bounded by rdma_cm, which reports ADDR_ERROR
        let _ = await_transition(&ep.channel, &mut ep.state, None)?;
        ep.issue(HandshakeOp::ResolveRoute, |v| {
            v.resolve_route(raw, timeouts.resolve)
        })?;
        let _ = await_transition(&ep.channel, &mut ep.state, None)?;
        info!("route to {} resolved from {}", dst, src);
        Ok(ep)
    }

    /// Acquire the resource bundle for this connection
    pub fn acquire(&mut self, cfg: &BundleConfig) -> Result<&mut ResourceBundle<V>, FlowError> {
        if self.bundle.is_some() {
            return Err(FlowError::InvalidState(self.state.name()));
        }
        let bundle = ResourceBundle::acquire(&self.verbs, self.id.raw(), cfg)?;
        Ok(self.bundle.insert(bundle))
    }

    /// Client side: connect and wait for `ESTABLISHED`
    pub fn connect(&mut self, param: &ConnParam, timeouts: &Timeouts) -> Result<(), FlowError> {
        self.require_bundle()?;
        let raw = self.id.raw();
        self.issue(HandshakeOp::Connect, |v| v.connect(raw, param))?;
        let _ = await_transition(&self.channel, &mut self.state, timeouts.establish)?;
        info!("connected {} -> {:?}", self.local, self.remote);
        Ok(())
    }

    /// Server side: accept the pending request and wait for `ESTABLISHED`
    pub fn accept(&mut self, param: &ConnParam, timeouts: &Timeouts) -> Result<(), FlowError> {
        self.require_bundle()?;
        let raw = self.id.raw();
        self.issue(HandshakeOp::Accept, |v| v.accept(raw, param))?;
        let _ = await_transition(&self.channel, &mut self.state, timeouts.establish)?;
        info!("accepted connection on {}", self.local);
        Ok(())
    }

    /// Current handshake state
    #[inline]
    #[must_use]
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Address this side is bound to
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }

    /// Address of the peer, unknown on the server side
    #[inline]
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddrV4> {
        self.remote
    }

    /// The resource bundle, if acquired
    #[inline]
    #[must_use]
    pub fn bundle(&self) -> Option<&ResourceBundle<V>> {
        self.bundle.as_ref()
    }

    /// The resource bundle, if acquired
    #[inline]
    pub fn bundle_mut(&mut self) -> Option<&mut ResourceBundle<V>> {
        self.bundle.as_mut()
    }

    /// The resource bundle of an established connection
    pub(crate) fn established_bundle(&mut self) -> Result<&mut ResourceBundle<V>, FlowError> {
        if self.state != HandshakeState::Established {
            return Err(FlowError::InvalidState(self.state.name()));
        }
        let state = self.state.name();
        self.bundle.as_mut().ok_or(FlowError::InvalidState(state))
    }

    /// Connecting without a queue pair is refused
    fn require_bundle(&self) -> Result<(), FlowError> {
        if self.bundle.is_none() {
            return Err(FlowError::InvalidState(self.state.name()));
        }
        Ok(())
    }

    /// Advance the state for `op`, then perform it. A failing call fails the
    /// handshake.
    fn issue<F>(&mut self, op: HandshakeOp, call: F) -> Result<(), FlowError>
    where
        F: FnOnce(&V) -> std::io::Result<()>,
    {
        let next = self.state.issue(op)?;
        match log_ret(call(&self.verbs), op.name()) {
            Ok(()) => {
                self.state = next;
                Ok(())
            }
            Err(e) => {
                self.state = HandshakeState::Failed;
                Err(FlowError::handshake(op.name())(e))
            }
        }
    }
}

impl<V: Verbs> Drop for ConnectionEndpoint<V> {
    fn drop(&mut self) {
        if self.state == HandshakeState::Established {
            log_release(self.verbs.disconnect(self.id.raw()), "connection");
        }
    }
}

/// A bound, listening cm id waiting for one connect request
#[derive(Debug)]
pub struct Listener<V: Verbs> {
    /// The listening id
    id: CmId<V>,
    /// Channel the connect request arrives on
    channel: EventChannel<V>,
    /// The backend
    verbs: Arc<V>,
    /// Bound address
    addr: SocketAddrV4,
    /// Handshake progress of the listening id
    state: HandshakeState,
}

impl<V: Verbs> Listener<V> {
    /// Bind to `addr` and listen with the given backlog
    pub fn bind(verbs: &Arc<V>, addr: SocketAddrV4, backlog: i32) -> Result<Self, FlowError> {
        let channel =
            EventChannel::new(verbs).map_err(FlowError::setup("rdma_create_event_channel"))?;
        let id = CmId::create(&channel).map_err(FlowError::setup("rdma_create_id"))?;
        let state = HandshakeState::Init.issue(HandshakeOp::Listen)?;
        log_ret(verbs.bind_addr(id.raw(), addr), "rdma_bind_addr")
            .map_err(FlowError::handshake("rdma_bind_addr"))?;
        log_ret(verbs.listen(id.raw(), backlog), "rdma_listen")
            .map_err(FlowError::handshake("rdma_listen"))?;
        info!("listening on {}", addr);
        Ok(Self {
            id,
            channel,
            verbs: Arc::clone(verbs),
            addr,
            state,
        })
    }

    /// Bound address
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.addr
    }

    /// Wait for a connect request. The id it carries becomes the endpoint,
    /// the listening id stays owned by the endpoint until it is dropped.
    pub fn next_request(mut self, timeouts: &Timeouts) -> Result<ConnectionEndpoint<V>, FlowError> {
        let info = await_transition(&self.channel, &mut self.state, timeouts.establish)?;
        info!("connect request on {}", self.addr);
        Ok(ConnectionEndpoint {
            bundle: None,
            id: CmId::adopt(&self.verbs, info.id),
            _listener: Some(self.id),
            channel: self.channel,
            verbs: self.verbs,
            state: self.state,
            local: self.addr,
            remote: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{access::Role, sim::SimVerbs};
    use std::{net::Ipv4Addr, time::Duration};

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    #[test]
    fn connect_without_resources_is_refused() {
        let verbs = Arc::new(SimVerbs::new());
        let timeouts = Timeouts::default();
        let _listener = Listener::bind(&verbs, addr(31001), 1).unwrap();
        let mut ep = ConnectionEndpoint::resolve(&verbs, addr(31002), addr(31001), &timeouts)
            .unwrap();
        assert_eq!(ep.state(), HandshakeState::RouteResolved);
        assert!(ep.connect(&ConnParam::default(), &timeouts).is_err());
        // the refusal does not consume the state
        assert_eq!(ep.state(), HandshakeState::RouteResolved);
    }

    #[test]
    fn bounded_accept_times_out() {
        let verbs = Arc::new(SimVerbs::new());
        let timeouts = Timeouts {
            establish: Some(Duration::from_millis(20)),
            ..Timeouts::default()
        };
        let listener = Listener::bind(&verbs, addr(31003), 1).unwrap();
        let err = listener.next_request(&timeouts).unwrap_err();
        assert!(matches!(err, FlowError::Handshake { .. }));
    }

    #[test]
    fn acquire_twice_is_refused() {
        let verbs = Arc::new(SimVerbs::new());
        let timeouts = Timeouts::default();
        let _listener = Listener::bind(&verbs, addr(31005), 1).unwrap();
        let mut ep = ConnectionEndpoint::resolve(&verbs, addr(31006), addr(31005), &timeouts)
            .unwrap();
        let cfg = BundleConfig::new(Role::Sender, 64);
        assert!(ep.acquire(&cfg).is_ok());
        assert!(ep.acquire(&cfg).is_err());
    }
}
