use crate::{
    access::AccessFlag, completion_queue::WorkCompletion, work_request::WorkRequest,
};
use enumflags2::BitFlags;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::{
    fmt::{self, Debug},
    io,
    net::SocketAddrV4,
    ptr::NonNull,
    time::Duration,
};

/// Backlog used by the listener, one pending connection at a time
pub const DEFAULT_BACKLOG: i32 = 1;

/// Kinds of rdma_cm events, numbered as in `rdma_cma.h`
#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, FromPrimitive)]
#[repr(u32)]
pub enum CmEventKind {
    AddrResolved = 0,
    AddrError = 1,
    RouteResolved = 2,
    RouteError = 3,
    ConnectRequest = 4,
    ConnectResponse = 5,
    ConnectError = 6,
    Unreachable = 7,
    Rejected = 8,
    Established = 9,
    Disconnected = 10,
    DeviceRemoval = 11,
    MulticastJoin = 12,
    MulticastError = 13,
    AddrChange = 14,
    TimewaitExit = 15,
    /// A code this crate does not know about
    Unknown = 0xffff,
}

impl CmEventKind {
    /// Decode a raw `rdma_cm_event_type` value
    #[inline]
    #[must_use]
    pub fn from_code(code: u32) -> Self {
        Self::from_u32(code).unwrap_or(Self::Unknown)
    }

    /// The raw `rdma_cm_event_type` value
    #[inline]
    #[must_use]
    #[allow(clippy::as_conversions)]
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Name as spelled in `rdma_cma.h`
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::AddrResolved => "RDMA_CM_EVENT_ADDR_RESOLVED",
            Self::AddrError => "RDMA_CM_EVENT_ADDR_ERROR",
            Self::RouteResolved => "RDMA_CM_EVENT_ROUTE_RESOLVED",
            Self::RouteError => "RDMA_CM_EVENT_ROUTE_ERROR",
            Self::ConnectRequest => "RDMA_CM_EVENT_CONNECT_REQUEST",
            Self::ConnectResponse => "RDMA_CM_EVENT_CONNECT_RESPONSE",
            Self::ConnectError => "RDMA_CM_EVENT_CONNECT_ERROR",
            Self::Unreachable => "RDMA_CM_EVENT_UNREACHABLE",
            Self::Rejected => "RDMA_CM_EVENT_REJECTED",
            Self::Established => "RDMA_CM_EVENT_ESTABLISHED",
            Self::Disconnected => "RDMA_CM_EVENT_DISCONNECTED",
            Self::DeviceRemoval => "RDMA_CM_EVENT_DEVICE_REMOVAL",
            Self::MulticastJoin => "RDMA_CM_EVENT_MULTICAST_JOIN",
            Self::MulticastError => "RDMA_CM_EVENT_MULTICAST_ERROR",
            Self::AddrChange => "RDMA_CM_EVENT_ADDR_CHANGE",
            Self::TimewaitExit => "RDMA_CM_EVENT_TIMEWAIT_EXIT",
            Self::Unknown => "RDMA_CM_EVENT_UNKNOWN",
        }
    }
}

impl fmt::Display for CmEventKind {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

/// What the handshake needs to know about a retrieved CM event.
///
/// It is copied out of the raw event so the raw event can be acknowledged
/// right away.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CmEventInfo<I> {
    /// Event type
    pub kind: CmEventKind,
    /// The cm id the event refers to. For `ConnectRequest` this is the new
    /// id created for the incoming connection.
    pub id: I,
    /// Event status, 0 or a negative errno / reject reason
    pub status: i32,
}

/// Parameters of `rdma_connect` / `rdma_accept`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConnParam {
    /// Max outstanding RDMA read/atomic this side issues
    pub initiator_depth: u8,
    /// Max outstanding RDMA read/atomic this side accepts
    pub responder_resources: u8,
    /// Transport retry count
    pub retry_count: u8,
    /// Receiver-not-ready retry count, 7 means retry forever
    pub rnr_retry_count: u8,
}

impl Default for ConnParam {
    #[inline]
    fn default() -> Self {
        Self {
            initiator_depth: 1,
            responder_resources: 1,
            retry_count: 7,
            rnr_retry_count: 7,
        }
    }
}

/// Capacities of a reliable-connected queue pair
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QpCaps {
    /// Send queue depth
    pub max_send_wr: u32,
    /// Receive queue depth
    pub max_recv_wr: u32,
    /// Scatter/gather entries per send
    pub max_send_sge: u32,
    /// Scatter/gather entries per receive
    pub max_recv_sge: u32,
}

impl Default for QpCaps {
    #[inline]
    fn default() -> Self {
        Self {
            max_send_wr: 10,
            max_recv_wr: 10,
            max_send_sge: 1,
            max_recv_sge: 1,
        }
    }
}

/// The rdma_cm and ibverbs calls this crate makes.
///
/// Handles are plain copyable tokens; ownership and release order live in the
/// RAII wrappers built on top of this trait, never in the implementations.
/// Every `create`/`alloc`/`reg` call has a matching release call which must
/// only be invoked on a handle that was successfully acquired.
pub trait Verbs: Debug + Send + Sync + 'static {
    /// `rdma_event_channel`
    type EventChannel: Copy + Debug + Send;
    /// `rdma_cm_id`
    type CmId: Copy + Debug + Send + PartialEq;
    /// `rdma_cm_event`
    type CmEvent: Debug + Send;
    /// `ibv_pd`
    type Pd: Copy + Debug + Send;
    /// `ibv_comp_channel`
    type CompChannel: Copy + Debug + Send;
    /// `ibv_cq`
    type Cq: Copy + Debug + Send + PartialEq;
    /// `ibv_mr`
    type Mr: Copy + Debug + Send;

    /// `rdma_create_event_channel`
    fn create_event_channel(&self) -> io::Result<Self::EventChannel>;
    /// `rdma_destroy_event_channel`
    fn destroy_event_channel(&self, ec: Self::EventChannel) -> io::Result<()>;
    /// `rdma_create_id` in the TCP port space
    fn create_id(&self, ec: Self::EventChannel) -> io::Result<Self::CmId>;
    /// `rdma_destroy_id`
    fn destroy_id(&self, id: Self::CmId) -> io::Result<()>;

    /// `rdma_resolve_addr` bound to an explicit source address
    fn resolve_addr(
        &self,
        id: Self::CmId,
        src: SocketAddrV4,
        dst: SocketAddrV4,
        timeout: Duration,
    ) -> io::Result<()>;
    /// `rdma_resolve_route`
    fn resolve_route(&self, id: Self::CmId, timeout: Duration) -> io::Result<()>;
    /// `rdma_bind_addr`
    fn bind_addr(&self, id: Self::CmId, addr: SocketAddrV4) -> io::Result<()>;
    /// `rdma_listen`
    fn listen(&self, id: Self::CmId, backlog: i32) -> io::Result<()>;
    /// `rdma_connect`
    fn connect(&self, id: Self::CmId, param: &ConnParam) -> io::Result<()>;
    /// `rdma_accept`
    fn accept(&self, id: Self::CmId, param: &ConnParam) -> io::Result<()>;
    /// `rdma_disconnect`
    fn disconnect(&self, id: Self::CmId) -> io::Result<()>;

    /// `rdma_get_cm_event`. `None` blocks until an event arrives, `Some`
    /// fails with `ErrorKind::TimedOut` once the wait exceeds the bound.
    fn get_cm_event(
        &self,
        ec: Self::EventChannel,
        timeout: Option<Duration>,
    ) -> io::Result<(Self::CmEvent, CmEventInfo<Self::CmId>)>;
    /// `rdma_ack_cm_event`
    fn ack_cm_event(&self, event: Self::CmEvent) -> io::Result<()>;

    /// `ibv_alloc_pd` on the device backing `id`
    fn alloc_pd(&self, id: Self::CmId) -> io::Result<Self::Pd>;
    /// `ibv_dealloc_pd`
    fn dealloc_pd(&self, pd: Self::Pd) -> io::Result<()>;
    /// `ibv_create_comp_channel` on the device backing `id`
    fn create_comp_channel(&self, id: Self::CmId) -> io::Result<Self::CompChannel>;
    /// `ibv_destroy_comp_channel`
    fn destroy_comp_channel(&self, cc: Self::CompChannel) -> io::Result<()>;
    /// `ibv_create_cq` bound to the completion channel `cc`
    fn create_cq(&self, id: Self::CmId, cqe: i32, cc: Self::CompChannel) -> io::Result<Self::Cq>;
    /// `ibv_destroy_cq`
    fn destroy_cq(&self, cq: Self::Cq) -> io::Result<()>;
    /// `rdma_create_qp`: a RC queue pair using `cq` for sends and receives
    fn create_qp(&self, id: Self::CmId, pd: Self::Pd, cq: Self::Cq, caps: &QpCaps)
        -> io::Result<()>;
    /// `rdma_destroy_qp`
    fn destroy_qp(&self, id: Self::CmId) -> io::Result<()>;
    /// `ibv_reg_mr`
    fn reg_mr(
        &self,
        pd: Self::Pd,
        addr: NonNull<u8>,
        len: usize,
        access: BitFlags<AccessFlag>,
    ) -> io::Result<Self::Mr>;
    /// Local key of a registered memory region
    fn mr_lkey(&self, mr: Self::Mr) -> u32;
    /// `ibv_dereg_mr`
    fn dereg_mr(&self, mr: Self::Mr) -> io::Result<()>;

    /// `ibv_post_send` on the queue pair of `id`
    fn post_send(&self, id: Self::CmId, wr: &WorkRequest) -> io::Result<()>;
    /// `ibv_post_recv` on the queue pair of `id`
    fn post_recv(&self, id: Self::CmId, wr: &WorkRequest) -> io::Result<()>;
    /// `ibv_req_notify_cq`
    fn req_notify_cq(&self, cq: Self::Cq, solicited_only: bool) -> io::Result<()>;
    /// `ibv_poll_cq` for at most one entry. `Ok(0)` means nothing completed yet.
    fn poll_cq(&self, cq: Self::Cq, wc: &mut WorkCompletion) -> io::Result<usize>;
    /// `ibv_get_cq_event`, returns the cq that raised the notification
    fn get_cq_event(&self, cc: Self::CompChannel, timeout: Option<Duration>)
        -> io::Result<Self::Cq>;
    /// `ibv_ack_cq_events`
    fn ack_cq_events(&self, cq: Self::Cq, nevents: u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_codes_round_trip_through_names() {
        assert_eq!(CmEventKind::from_code(9), CmEventKind::Established);
        assert_eq!(CmEventKind::from_code(4), CmEventKind::ConnectRequest);
        assert_eq!(CmEventKind::from_code(1234), CmEventKind::Unknown);
        assert_eq!(CmEventKind::RouteResolved.code(), 2);
        assert_eq!(
            CmEventKind::Rejected.to_string(),
            "RDMA_CM_EVENT_REJECTED (8)"
        );
    }

    #[test]
    fn reference_connection_parameters() {
        let param = ConnParam::default();
        assert_eq!(param.initiator_depth, 1);
        assert_eq!(param.responder_resources, 1);
        assert_eq!(param.rnr_retry_count, 7);
        let caps = QpCaps::default();
        assert_eq!((caps.max_send_wr, caps.max_recv_wr), (10, 10));
        assert_eq!((caps.max_send_sge, caps.max_recv_sge), (1, 1));
    }
}
