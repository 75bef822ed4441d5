//! The rdma_cm handshake as an explicit state machine.
//!
//! Calls issued by the caller (`rdma_resolve_addr`, `rdma_connect`, ...) move the
//! state into a waiting state; exactly one CM event moves it out again. Each
//! waiting state accepts one event kind, anything else fails the handshake.

use crate::{
    error::FlowError,
    event_channel::EventChannel,
    verbs::{CmEventInfo, CmEventKind, Verbs},
};
use std::time::Duration;
use tracing::{debug, error};

/// Progress of one connection through the CM handshake
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    /// Id created, nothing issued
    Init,
    /// Waiting for `ADDR_RESOLVED`
    AddrResolving,
    /// Address resolved
    AddrResolved,
    /// Waiting for `ROUTE_RESOLVED`
    RouteResolving,
    /// Route resolved, ready to connect
    RouteResolved,
    /// Bound and listening, waiting for `CONNECT_REQUEST`
    Listening,
    /// A connect request arrived, ready to accept
    ConnectRequested,
    /// Connect issued, waiting for `ESTABLISHED`
    Connecting,
    /// Accept issued, waiting for `ESTABLISHED`
    Accepting,
    /// Connection established
    Established,
    /// Terminal failure state
    Failed,
}

/// Calls that drive the handshake forward
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HandshakeOp {
    /// `rdma_resolve_addr`
    ResolveAddr,
    /// `rdma_resolve_route`
    ResolveRoute,
    /// `rdma_bind_addr` + `rdma_listen`
    Listen,
    /// `rdma_connect`
    Connect,
    /// `rdma_accept`
    Accept,
}

impl HandshakeOp {
    /// Name of the underlying call
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ResolveAddr => "rdma_resolve_addr",
            Self::ResolveRoute => "rdma_resolve_route",
            Self::Listen => "rdma_listen",
            Self::Connect => "rdma_connect",
            Self::Accept => "rdma_accept",
        }
    }
}

impl HandshakeState {
    /// Name of the state
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::AddrResolving => "ADDR_RESOLVING",
            Self::AddrResolved => "ADDR_RESOLVED",
            Self::RouteResolving => "ROUTE_RESOLVING",
            Self::RouteResolved => "ROUTE_RESOLVED",
            Self::Listening => "LISTENING",
            Self::ConnectRequested => "CONNECT_REQUESTED",
            Self::Connecting => "CONNECTING",
            Self::Accepting => "ACCEPTING",
            Self::Established => "ESTABLISHED",
            Self::Failed => "FAILED",
        }
    }

    /// The single event kind this state waits for
    #[must_use]
    pub const fn awaited_event(self) -> Option<CmEventKind> {
        match self {
            Self::AddrResolving => Some(CmEventKind::AddrResolved),
            Self::RouteResolving => Some(CmEventKind::RouteResolved),
            Self::Listening => Some(CmEventKind::ConnectRequest),
            Self::Connecting | Self::Accepting => Some(CmEventKind::Established),
            Self::Init
            | Self::AddrResolved
            | Self::RouteResolved
            | Self::ConnectRequested
            | Self::Established
            | Self::Failed => None,
        }
    }

    /// State after issuing `op`
    pub fn issue(self, op: HandshakeOp) -> Result<Self, FlowError> {
        match (self, op) {
            (Self::Init, HandshakeOp::ResolveAddr) => Ok(Self::AddrResolving),
            (Self::AddrResolved, HandshakeOp::ResolveRoute) => Ok(Self::RouteResolving),
            (Self::Init, HandshakeOp::Listen) => Ok(Self::Listening),
            (Self::RouteResolved, HandshakeOp::Connect) => Ok(Self::Connecting),
            (Self::ConnectRequested, HandshakeOp::Accept) => Ok(Self::Accepting),
            (state, _) => Err(FlowError::InvalidState(state.name())),
        }
    }

    /// State after the event `kind` arrived
    pub fn on_event(self, kind: CmEventKind, status: i32) -> Result<Self, FlowError> {
        let expected = self
            .awaited_event()
            .ok_or(FlowError::InvalidState(self.name()))?;
        if kind != expected {
            return Err(FlowError::UnexpectedEvent {
                expected,
                observed: kind,
                status,
            });
        }
        Ok(match self {
            Self::AddrResolving => Self::AddrResolved,
            Self::RouteResolving => Self::RouteResolved,
            Self::Listening => Self::ConnectRequested,
            // only waiting states have an awaited event
            _ => Self::Established,
        })
    }
}

/// Wait for the event `state` awaits and apply it.
///
/// The event is acknowledged right after its fields are copied out, before
/// the transition is evaluated, so it is released on every path. Any failure
/// leaves `state` at `Failed`.
pub(crate) fn await_transition<V: Verbs>(
    channel: &EventChannel<V>,
    state: &mut HandshakeState,
    timeout: Option<Duration>,
) -> Result<CmEventInfo<V::CmId>, FlowError> {
    let from = *state;
    let ret = step(channel, from, timeout);
    match ret {
        Ok((next, info)) => {
            debug!("handshake {} -> {}", from.name(), next.name());
            *state = next;
            Ok(info)
        }
        Err(err) => {
            error!("handshake failed in state {}: {}", from.name(), err);
            *state = HandshakeState::Failed;
            Err(err)
        }
    }
}

/// One retrieve/ack/transition round
fn step<V: Verbs>(
    channel: &EventChannel<V>,
    state: HandshakeState,
    timeout: Option<Duration>,
) -> Result<(HandshakeState, CmEventInfo<V::CmId>), FlowError> {
    let expected = state
        .awaited_event()
        .ok_or(FlowError::InvalidState(state.name()))?;
    let event = channel
        .next_event(timeout)
        .map_err(FlowError::handshake(expected.name()))?;
    let info = event
        .ack()
        .map_err(FlowError::handshake("rdma_ack_cm_event"))?;
    let next = state.on_event(info.kind, info.status)?;
    Ok((next, info))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_path() {
        let mut state = HandshakeState::Init;
        state = state.issue(HandshakeOp::ResolveAddr).unwrap();
        assert_eq!(state.awaited_event(), Some(CmEventKind::AddrResolved));
        state = state.on_event(CmEventKind::AddrResolved, 0).unwrap();
        state = state.issue(HandshakeOp::ResolveRoute).unwrap();
        state = state.on_event(CmEventKind::RouteResolved, 0).unwrap();
        state = state.issue(HandshakeOp::Connect).unwrap();
        assert_eq!(state, HandshakeState::Connecting);
        state = state.on_event(CmEventKind::Established, 0).unwrap();
        assert_eq!(state, HandshakeState::Established);
        assert_eq!(state.awaited_event(), None);
    }

    #[test]
    fn server_path() {
        let mut state = HandshakeState::Init.issue(HandshakeOp::Listen).unwrap();
        state = state.on_event(CmEventKind::ConnectRequest, 0).unwrap();
        assert_eq!(state, HandshakeState::ConnectRequested);
        state = state.issue(HandshakeOp::Accept).unwrap();
        state = state.on_event(CmEventKind::Established, 0).unwrap();
        assert_eq!(state, HandshakeState::Established);
    }

    #[test]
    fn mismatched_event_carries_observed_code() {
        let err = HandshakeState::AddrResolving
            .on_event(CmEventKind::AddrError, -110)
            .unwrap_err();
        match err {
            FlowError::UnexpectedEvent {
                expected,
                observed,
                status,
            } => {
                assert_eq!(expected, CmEventKind::AddrResolved);
                assert_eq!(observed.code(), 1);
                assert_eq!(status, -110);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn calls_out_of_order_are_rejected() {
        assert!(HandshakeState::Init.issue(HandshakeOp::Connect).is_err());
        assert!(HandshakeState::AddrResolving
            .issue(HandshakeOp::ResolveRoute)
            .is_err());
        assert!(HandshakeState::Listening.issue(HandshakeOp::Accept).is_err());
        assert!(HandshakeState::Failed.issue(HandshakeOp::ResolveAddr).is_err());
        assert!(HandshakeState::Established
            .on_event(CmEventKind::Established, 0)
            .is_err());
    }
}
