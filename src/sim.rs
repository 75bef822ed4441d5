//! An in-process fabric implementing [`Verbs`].
//!
//! Connections between ids of the same `SimVerbs` behave like a reliable
//! connected transport with an infinite RNR retry: a send completes once the
//! peer has posted a receive, a receive that is too small fails with a local
//! length error on the receiver and a remote invalid request on the sender,
//! and a disconnect flushes everything outstanding on both sides.
//!
//! Release calls fail with `EBUSY` while something still references the
//! handle, the way the kernel refuses to free a protection domain that still
//! has a queue pair. Every call except `poll_cq` is appended to a journal,
//! and the next call of any operation can be made to fail.

use crate::{
    access::AccessFlag,
    completion_queue::{WcStatus, WorkCompletion},
    verbs::{CmEventInfo, CmEventKind, ConnParam, QpCaps, Verbs},
    work_request::{WorkRequest, WrOpcode},
};
use enumflags2::BitFlags;
use parking_lot::{Condvar, Mutex};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    io,
    net::SocketAddrV4,
    ptr::NonNull,
    time::{Duration, Instant},
};
use tracing::debug;

/// Reject reason reported when nobody listens on the destination
const REJECT_NO_LISTENER: i32 = 28;

/// Verb operations, as recorded in the journal
#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    CreateEventChannel,
    DestroyEventChannel,
    CreateId,
    DestroyId,
    ResolveAddr,
    ResolveRoute,
    BindAddr,
    Listen,
    Connect,
    Accept,
    Disconnect,
    GetCmEvent,
    AckCmEvent,
    AllocPd,
    DeallocPd,
    CreateCompChannel,
    DestroyCompChannel,
    CreateCq,
    DestroyCq,
    CreateQp,
    DestroyQp,
    RegMr,
    DeregMr,
    PostSend,
    PostRecv,
    ReqNotifyCq,
    PollCq,
    GetCqEvent,
    AckCqEvents,
}

/// One journal entry
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Call {
    /// The operation
    pub op: Op,
    /// Whether it succeeded
    pub ok: bool,
}

/// Event channel handle
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SimEventChannel(u64);
/// Cm id handle
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SimCmId(u64);
/// Retrieved cm event handle
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SimCmEvent(u64);
/// Protection domain handle
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SimPd(u64);
/// Completion channel handle
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SimCompChannel(u64);
/// Completion queue handle
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SimCq(u64);
/// Memory region handle
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SimMr(u64);

/// A CM event waiting in a channel
#[derive(Copy, Clone, Debug)]
struct QueuedEvent {
    /// Event type
    kind: CmEventKind,
    /// Id the event refers to
    id: u64,
    /// Event status
    status: i32,
}

/// A send waiting for the peer to post a receive
#[derive(Copy, Clone, Debug)]
struct HeldSend {
    /// Sending id
    from: u64,
    /// The send
    wr: WorkRequest,
}

/// Queue pair attached to an id
#[derive(Debug)]
struct QpState {
    /// Protection domain
    pd: u64,
    /// Completion queue for both directions
    cq: u64,
    /// Capacities
    caps: QpCaps,
    /// Posted receives, oldest first
    recv_queue: VecDeque<WorkRequest>,
    /// Sends from the peer that found no receive yet
    inbound: VecDeque<HeldSend>,
}

/// Connection progress of an id
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Link {
    /// Not connected
    Idle,
    /// Connect request delivered, not yet accepted
    Requested(u64),
    /// Both sides established
    Connected(u64),
    /// Torn down
    Disconnected,
}

/// A cm id
#[derive(Debug)]
struct IdState {
    /// Channel its events go to
    channel: u64,
    /// Bound or resolved source address
    local: Option<SocketAddrV4>,
    /// Resolved destination
    remote: Option<SocketAddrV4>,
    /// Route resolved
    routed: bool,
    /// Listening
    listening: bool,
    /// Connection progress
    link: Link,
    /// Attached queue pair
    qp: Option<QpState>,
}

/// A completion queue
#[derive(Debug)]
struct CqState {
    /// Channel notifications go to
    comp_channel: u64,
    /// Completions not yet polled
    entries: VecDeque<WorkCompletion>,
    /// Notification requested
    armed: bool,
}

/// A memory region
#[derive(Copy, Clone, Debug)]
struct MrState {
    /// Protection domain
    pd: u64,
    /// Start address
    addr: usize,
    /// Length in bytes
    len: usize,
    /// Local key
    lkey: u32,
}

/// The whole simulated fabric
#[derive(Debug, Default)]
struct Fabric {
    /// Handle counter
    next: u64,
    /// Pending events per event channel
    channels: HashMap<u64, VecDeque<QueuedEvent>>,
    /// Retrieved and not yet acknowledged events
    unacked: HashSet<u64>,
    /// Cm ids
    ids: HashMap<u64, IdState>,
    /// Bound addresses
    bound: HashMap<SocketAddrV4, u64>,
    /// Protection domains
    pds: HashSet<u64>,
    /// Notified cqs per completion channel
    comp_channels: HashMap<u64, VecDeque<u64>>,
    /// Completion queues
    cqs: HashMap<u64, CqState>,
    /// Memory regions
    mrs: HashMap<u64, MrState>,
    /// Every call
    journal: Vec<Call>,
    /// Operations whose next call fails
    faults: HashSet<Op>,
    /// Events to produce instead of the regular one
    overrides: HashMap<Op, (CmEventKind, i32)>,
}

/// An `io::Error` for `errno`
fn os_err(errno: i32) -> io::Error {
    io::Error::from_raw_os_error(errno)
}

impl Fabric {
    /// A fresh handle value
    fn alloc(&mut self) -> u64 {
        self.next = self.next.wrapping_add(1);
        self.next
    }

    /// The id, or `EINVAL`
    fn id_mut(&mut self, id: u64) -> io::Result<&mut IdState> {
        self.ids.get_mut(&id).ok_or_else(|| os_err(libc::EINVAL))
    }

    /// Queue an event on the channel of `id`
    fn push_event(&mut self, id: u64, kind: CmEventKind, status: i32) {
        let channel = match self.ids.get(&id) {
            Some(state) => state.channel,
            None => return,
        };
        if let Some(queue) = self.channels.get_mut(&channel) {
            debug!("sim: {} for id {}", kind, id);
            queue.push_back(QueuedEvent { kind, id, status });
        }
    }

    /// Queue the regular event of `op`, or its override
    fn push_result_event(&mut self, op: Op, id: u64, kind: CmEventKind) -> bool {
        match self.overrides.remove(&op) {
            Some((kind, status)) => {
                self.push_event(id, kind, status);
                false
            }
            None => {
                self.push_event(id, kind, 0);
                true
            }
        }
    }

    /// Add a completion to `cq` and notify its channel when armed
    fn complete(&mut self, cq: u64, wr_id: u64, status: WcStatus, byte_len: u32) {
        let Some(state) = self.cqs.get_mut(&cq) else {
            return;
        };
        state.entries.push_back(WorkCompletion {
            wr_id,
            status: status.code(),
            byte_len,
        });
        if state.armed {
            state.armed = false;
            let cc = state.comp_channel;
            if let Some(queue) = self.comp_channels.get_mut(&cc) {
                queue.push_back(cq);
            }
        }
    }

    /// Cq of the qp on `id`
    fn cq_of(&self, id: u64) -> Option<u64> {
        self.ids.get(&id).and_then(|s| s.qp.as_ref()).map(|qp| qp.cq)
    }

    /// The registered range `sge` refers to, if any
    fn registered(&self, addr: u64, len: u32, lkey: u32) -> Option<usize> {
        let addr = usize::try_from(addr).ok()?;
        let len = usize::try_from(len).ok()?;
        self.mrs
            .values()
            .find(|mr| {
                mr.lkey == lkey
                    && addr >= mr.addr
                    && addr.checked_add(len).map_or(false, |end| end <= mr.addr + mr.len)
            })
            .map(|_| addr)
    }

    /// Deliver `send` into `recv`, completing both sides
    fn deliver(&mut self, from: u64, send: WorkRequest, to: u64, recv: WorkRequest) {
        let send_cq = self.cq_of(from);
        let recv_cq = self.cq_of(to);
        let src = self.registered(send.sge.addr, send.sge.length, send.sge.lkey);
        let dst = self.registered(recv.sge.addr, recv.sge.length, recv.sge.lkey);
        let (send_status, recv_status, len) = match (src, dst) {
            (None, _) => (WcStatus::LocProtErr, None, 0),
            (_, None) => (WcStatus::RemOpErr, Some(WcStatus::LocProtErr), 0),
            _ if send.sge.length > recv.sge.length => {
                (WcStatus::RemInvReqErr, Some(WcStatus::LocLenErr), 0)
            }
            (Some(src), Some(dst)) => {
                let n = usize::try_from(send.sge.length).unwrap_or(0);
                // SAFETY: both ranges lie inside live registrations, and a
                // registration never outlives the buffer it covers
                unsafe {
                    std::ptr::copy(src as *const u8, dst as *mut u8, n);
                }
                (WcStatus::Success, Some(WcStatus::Success), send.sge.length)
            }
        };
        if let Some(cq) = send_cq {
            self.complete(cq, u64::from(send.wr_id), send_status, len);
        }
        if let (Some(cq), Some(status)) = (recv_cq, recv_status) {
            self.complete(cq, u64::from(recv.wr_id), status, len);
        }
    }

    /// Fail everything outstanding on the qp of `id`
    fn flush(&mut self, id: u64) {
        let Some(cq) = self.cq_of(id) else {
            return;
        };
        let (recvs, held) = match self.ids.get_mut(&id).and_then(|s| s.qp.as_mut()) {
            Some(qp) => (
                qp.recv_queue.drain(..).collect::<Vec<_>>(),
                qp.inbound.drain(..).collect::<Vec<_>>(),
            ),
            None => return,
        };
        for wr in recvs {
            self.complete(cq, u64::from(wr.wr_id), WcStatus::WrFlushErr, 0);
        }
        for held in held {
            if let Some(sender_cq) = self.cq_of(held.from) {
                self.complete(sender_cq, u64::from(held.wr.wr_id), WcStatus::WrFlushErr, 0);
            }
        }
    }

    /// Whether anything still refers to protection domain `pd`
    fn pd_in_use(&self, pd: u64) -> bool {
        self.mrs.values().any(|mr| mr.pd == pd)
            || self
                .ids
                .values()
                .filter_map(|s| s.qp.as_ref())
                .any(|qp| qp.pd == pd)
    }

    /// Number of live handles of every kind
    fn live(&self) -> usize {
        self.channels.len()
            + self.ids.len()
            + self.pds.len()
            + self.comp_channels.len()
            + self.cqs.len()
            + self.mrs.len()
            + self.ids.values().filter(|s| s.qp.is_some()).count()
    }
}

/// Simulated rdma_cm / ibverbs backend
#[derive(Debug, Default)]
pub struct SimVerbs {
    /// Fabric state
    fabric: Mutex<Fabric>,
    /// Signaled on every change
    changed: Condvar,
}

impl SimVerbs {
    /// An empty fabric
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `op` fail with `EIO` without side effects
    pub fn fail_next(&self, op: Op) {
        let _ = self.fabric.lock().faults.insert(op);
    }

    /// Make the next event `op` produces for its caller `kind` with `status`
    pub fn override_event(&self, op: Op, kind: CmEventKind, status: i32) {
        let _ = self.fabric.lock().overrides.insert(op, (kind, status));
    }

    /// Every call so far
    #[must_use]
    pub fn journal(&self) -> Vec<Call> {
        self.fabric.lock().journal.clone()
    }

    /// Retrieved events that were never acknowledged
    #[must_use]
    pub fn unacked_events(&self) -> usize {
        self.fabric.lock().unacked.len()
    }

    /// Handles not released yet
    #[must_use]
    pub fn live_handles(&self) -> usize {
        self.fabric.lock().live()
    }

    /// Block until some id listens on `addr`. Returns `false` on timeout.
    pub fn wait_for_listener(&self, addr: SocketAddrV4, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut fabric = self.fabric.lock();
        loop {
            let listening = fabric
                .bound
                .get(&addr)
                .and_then(|id| fabric.ids.get(id))
                .map_or(false, |s| s.listening);
            if listening {
                return true;
            }
            if self.changed.wait_until(&mut fabric, deadline).timed_out() {
                return false;
            }
        }
    }

    /// Run `body` as the call `op`: honor injected faults, journal the
    /// outcome and wake up waiters
    fn call<T>(&self, op: Op, body: impl FnOnce(&mut Fabric) -> io::Result<T>) -> io::Result<T> {
        let mut fabric = self.fabric.lock();
        let ret = if fabric.faults.remove(&op) {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!("injected failure of {op:?}"),
            ))
        } else {
            body(&mut fabric)
        };
        if op != Op::PollCq {
            fabric.journal.push(Call { op, ok: ret.is_ok() });
        }
        drop(fabric);
        let _ = self.changed.notify_all();
        ret
    }

    /// Like [`call`](Self::call) for operations that block until `ready`
    /// yields a value
    fn blocking_call<T>(
        &self,
        op: Op,
        timeout: Option<Duration>,
        mut ready: impl FnMut(&mut Fabric) -> io::Result<Option<T>>,
    ) -> io::Result<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut fabric = self.fabric.lock();
        let ret = if fabric.faults.remove(&op) {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!("injected failure of {op:?}"),
            ))
        } else {
            loop {
                match ready(&mut fabric) {
                    Ok(Some(value)) => break Ok(value),
                    Ok(None) => {}
                    Err(e) => break Err(e),
                }
                match deadline {
                    Some(deadline) => {
                        if self.changed.wait_until(&mut fabric, deadline).timed_out() {
                            break Err(io::Error::new(
                                io::ErrorKind::TimedOut,
                                format!("{op:?} timed out"),
                            ));
                        }
                    }
                    None => self.changed.wait(&mut fabric),
                }
            }
        };
        fabric.journal.push(Call { op, ok: ret.is_ok() });
        drop(fabric);
        let _ = self.changed.notify_all();
        ret
    }
}

impl Verbs for SimVerbs {
    type EventChannel = SimEventChannel;
    type CmId = SimCmId;
    type CmEvent = SimCmEvent;
    type Pd = SimPd;
    type CompChannel = SimCompChannel;
    type Cq = SimCq;
    type Mr = SimMr;

    fn create_event_channel(&self) -> io::Result<SimEventChannel> {
        self.call(Op::CreateEventChannel, |f| {
            let ec = f.alloc();
            let _ = f.channels.insert(ec, VecDeque::new());
            Ok(SimEventChannel(ec))
        })
    }

    fn destroy_event_channel(&self, ec: SimEventChannel) -> io::Result<()> {
        self.call(Op::DestroyEventChannel, |f| {
            if f.ids.values().any(|s| s.channel == ec.0) {
                return Err(os_err(libc::EBUSY));
            }
            f.channels
                .remove(&ec.0)
                .map(|_| ())
                .ok_or_else(|| os_err(libc::EINVAL))
        })
    }

    fn create_id(&self, ec: SimEventChannel) -> io::Result<SimCmId> {
        self.call(Op::CreateId, |f| {
            if !f.channels.contains_key(&ec.0) {
                return Err(os_err(libc::EINVAL));
            }
            let id = f.alloc();
            let _ = f.ids.insert(
                id,
                IdState {
                    channel: ec.0,
                    local: None,
                    remote: None,
                    routed: false,
                    listening: false,
                    link: Link::Idle,
                    qp: None,
                },
            );
            Ok(SimCmId(id))
        })
    }

    fn destroy_id(&self, id: SimCmId) -> io::Result<()> {
        self.call(Op::DestroyId, |f| {
            let state = f.ids.get(&id.0).ok_or_else(|| os_err(libc::EINVAL))?;
            if state.qp.is_some() {
                return Err(os_err(libc::EBUSY));
            }
            let link = state.link;
            f.bound.retain(|_, owner| *owner != id.0);
            if let Link::Requested(peer) | Link::Connected(peer) = link {
                if let Some(peer_state) = f.ids.get_mut(&peer) {
                    peer_state.link = Link::Disconnected;
                }
                f.flush(peer);
                f.push_event(peer, CmEventKind::Disconnected, 0);
            }
            let _ = f.ids.remove(&id.0);
            Ok(())
        })
    }

    fn resolve_addr(
        &self,
        id: SimCmId,
        src: SocketAddrV4,
        dst: SocketAddrV4,
        _timeout: Duration,
    ) -> io::Result<()> {
        self.call(Op::ResolveAddr, |f| {
            let state = f.id_mut(id.0)?;
            state.local = Some(src);
            state.remote = Some(dst);
            let _ = f.push_result_event(Op::ResolveAddr, id.0, CmEventKind::AddrResolved);
            Ok(())
        })
    }

    fn resolve_route(&self, id: SimCmId, _timeout: Duration) -> io::Result<()> {
        self.call(Op::ResolveRoute, |f| {
            let state = f.id_mut(id.0)?;
            if state.remote.is_none() {
                return Err(os_err(libc::EINVAL));
            }
            if f.push_result_event(Op::ResolveRoute, id.0, CmEventKind::RouteResolved) {
                f.id_mut(id.0)?.routed = true;
            }
            Ok(())
        })
    }

    fn bind_addr(&self, id: SimCmId, addr: SocketAddrV4) -> io::Result<()> {
        self.call(Op::BindAddr, |f| {
            if f.bound.contains_key(&addr) {
                return Err(os_err(libc::EADDRINUSE));
            }
            f.id_mut(id.0)?.local = Some(addr);
            let _ = f.bound.insert(addr, id.0);
            Ok(())
        })
    }

    fn listen(&self, id: SimCmId, _backlog: i32) -> io::Result<()> {
        self.call(Op::Listen, |f| {
            let state = f.id_mut(id.0)?;
            if state.local.is_none() {
                return Err(os_err(libc::EINVAL));
            }
            state.listening = true;
            Ok(())
        })
    }

    fn connect(&self, id: SimCmId, _param: &ConnParam) -> io::Result<()> {
        self.call(Op::Connect, |f| {
            let state = f.id_mut(id.0)?;
            let (Some(local), Some(dst), true) = (state.local, state.remote, state.routed) else {
                return Err(os_err(libc::EINVAL));
            };
            if let Some((kind, status)) = f.overrides.remove(&Op::Connect) {
                f.push_event(id.0, kind, status);
                return Ok(());
            }
            let listener = f
                .bound
                .get(&dst)
                .copied()
                .filter(|l| f.ids.get(l).map_or(false, |s| s.listening));
            let Some(listener) = listener else {
                f.push_event(id.0, CmEventKind::Rejected, REJECT_NO_LISTENER);
                return Ok(());
            };
            let channel = f.ids.get(&listener).map(|s| s.channel).unwrap_or_default();
            let server_id = f.alloc();
            let _ = f.ids.insert(
                server_id,
                IdState {
                    channel,
                    local: Some(dst),
                    remote: Some(local),
                    routed: true,
                    listening: false,
                    link: Link::Requested(id.0),
                    qp: None,
                },
            );
            f.id_mut(id.0)?.link = Link::Requested(server_id);
            f.push_event(server_id, CmEventKind::ConnectRequest, 0);
            Ok(())
        })
    }

    fn accept(&self, id: SimCmId, _param: &ConnParam) -> io::Result<()> {
        self.call(Op::Accept, |f| {
            let Link::Requested(peer) = f.id_mut(id.0)?.link else {
                return Err(os_err(libc::EINVAL));
            };
            if !f.ids.contains_key(&peer) {
                return Err(os_err(libc::ECONNRESET));
            }
            if let Some((kind, status)) = f.overrides.remove(&Op::Accept) {
                f.push_event(id.0, kind, status);
                return Ok(());
            }
            f.id_mut(id.0)?.link = Link::Connected(peer);
            f.id_mut(peer)?.link = Link::Connected(id.0);
            f.push_event(peer, CmEventKind::Established, 0);
            f.push_event(id.0, CmEventKind::Established, 0);
            Ok(())
        })
    }

    fn disconnect(&self, id: SimCmId) -> io::Result<()> {
        self.call(Op::Disconnect, |f| {
            let Link::Connected(peer) = f.id_mut(id.0)?.link else {
                return Err(os_err(libc::EINVAL));
            };
            f.id_mut(id.0)?.link = Link::Disconnected;
            if let Some(peer_state) = f.ids.get_mut(&peer) {
                peer_state.link = Link::Disconnected;
            }
            f.flush(id.0);
            f.flush(peer);
            f.push_event(id.0, CmEventKind::Disconnected, 0);
            f.push_event(peer, CmEventKind::Disconnected, 0);
            Ok(())
        })
    }

    fn get_cm_event(
        &self,
        ec: SimEventChannel,
        timeout: Option<Duration>,
    ) -> io::Result<(SimCmEvent, CmEventInfo<SimCmId>)> {
        self.blocking_call(Op::GetCmEvent, timeout, |f| {
            let queue = f
                .channels
                .get_mut(&ec.0)
                .ok_or_else(|| os_err(libc::EINVAL))?;
            let Some(event) = queue.pop_front() else {
                return Ok(None);
            };
            let handle = f.alloc();
            let _ = f.unacked.insert(handle);
            Ok(Some((
                SimCmEvent(handle),
                CmEventInfo {
                    kind: event.kind,
                    id: SimCmId(event.id),
                    status: event.status,
                },
            )))
        })
    }

    fn ack_cm_event(&self, event: SimCmEvent) -> io::Result<()> {
        self.call(Op::AckCmEvent, |f| {
            if f.unacked.remove(&event.0) {
                Ok(())
            } else {
                Err(os_err(libc::EINVAL))
            }
        })
    }

    fn alloc_pd(&self, id: SimCmId) -> io::Result<SimPd> {
        self.call(Op::AllocPd, |f| {
            let _ = f.id_mut(id.0)?;
            let pd = f.alloc();
            let _ = f.pds.insert(pd);
            Ok(SimPd(pd))
        })
    }

    fn dealloc_pd(&self, pd: SimPd) -> io::Result<()> {
        self.call(Op::DeallocPd, |f| {
            if f.pd_in_use(pd.0) {
                return Err(os_err(libc::EBUSY));
            }
            if f.pds.remove(&pd.0) {
                Ok(())
            } else {
                Err(os_err(libc::EINVAL))
            }
        })
    }

    fn create_comp_channel(&self, id: SimCmId) -> io::Result<SimCompChannel> {
        self.call(Op::CreateCompChannel, |f| {
            let _ = f.id_mut(id.0)?;
            let cc = f.alloc();
            let _ = f.comp_channels.insert(cc, VecDeque::new());
            Ok(SimCompChannel(cc))
        })
    }

    fn destroy_comp_channel(&self, cc: SimCompChannel) -> io::Result<()> {
        self.call(Op::DestroyCompChannel, |f| {
            if f.cqs.values().any(|cq| cq.comp_channel == cc.0) {
                return Err(os_err(libc::EBUSY));
            }
            f.comp_channels
                .remove(&cc.0)
                .map(|_| ())
                .ok_or_else(|| os_err(libc::EINVAL))
        })
    }

    fn create_cq(&self, id: SimCmId, cqe: i32, cc: SimCompChannel) -> io::Result<SimCq> {
        self.call(Op::CreateCq, |f| {
            let _ = f.id_mut(id.0)?;
            if cqe < 1 || !f.comp_channels.contains_key(&cc.0) {
                return Err(os_err(libc::EINVAL));
            }
            let cq = f.alloc();
            let _ = f.cqs.insert(
                cq,
                CqState {
                    comp_channel: cc.0,
                    entries: VecDeque::new(),
                    armed: false,
                },
            );
            Ok(SimCq(cq))
        })
    }

    fn destroy_cq(&self, cq: SimCq) -> io::Result<()> {
        self.call(Op::DestroyCq, |f| {
            let in_use = f
                .ids
                .values()
                .filter_map(|s| s.qp.as_ref())
                .any(|qp| qp.cq == cq.0);
            if in_use {
                return Err(os_err(libc::EBUSY));
            }
            f.cqs
                .remove(&cq.0)
                .map(|_| ())
                .ok_or_else(|| os_err(libc::EINVAL))
        })
    }

    fn create_qp(&self, id: SimCmId, pd: SimPd, cq: SimCq, caps: &QpCaps) -> io::Result<()> {
        self.call(Op::CreateQp, |f| {
            if !f.pds.contains(&pd.0) || !f.cqs.contains_key(&cq.0) {
                return Err(os_err(libc::EINVAL));
            }
            let state = f.id_mut(id.0)?;
            if state.qp.is_some() {
                return Err(os_err(libc::EEXIST));
            }
            state.qp = Some(QpState {
                pd: pd.0,
                cq: cq.0,
                caps: *caps,
                recv_queue: VecDeque::new(),
                inbound: VecDeque::new(),
            });
            Ok(())
        })
    }

    fn destroy_qp(&self, id: SimCmId) -> io::Result<()> {
        self.call(Op::DestroyQp, |f| {
            if f.id_mut(id.0)?.qp.is_none() {
                return Err(os_err(libc::EINVAL));
            }
            // sends of this qp held by the peer can never complete now
            for state in f.ids.values_mut() {
                if let Some(qp) = state.qp.as_mut() {
                    qp.inbound.retain(|held| held.from != id.0);
                }
            }
            f.id_mut(id.0)?.qp = None;
            Ok(())
        })
    }

    fn reg_mr(
        &self,
        pd: SimPd,
        addr: NonNull<u8>,
        len: usize,
        _access: BitFlags<AccessFlag>,
    ) -> io::Result<SimMr> {
        self.call(Op::RegMr, |f| {
            if !f.pds.contains(&pd.0) || len == 0 {
                return Err(os_err(libc::EINVAL));
            }
            let mr = f.alloc();
            let lkey = u32::try_from(mr & u64::from(u32::MAX)).unwrap_or_default();
            let _ = f.mrs.insert(
                mr,
                MrState {
                    pd: pd.0,
                    addr: addr.as_ptr() as usize,
                    len,
                    lkey,
                },
            );
            Ok(SimMr(mr))
        })
    }

    fn mr_lkey(&self, mr: SimMr) -> u32 {
        self.fabric.lock().mrs.get(&mr.0).map_or(0, |m| m.lkey)
    }

    fn dereg_mr(&self, mr: SimMr) -> io::Result<()> {
        self.call(Op::DeregMr, |f| {
            f.mrs
                .remove(&mr.0)
                .map(|_| ())
                .ok_or_else(|| os_err(libc::EINVAL))
        })
    }

    fn post_send(&self, id: SimCmId, wr: &WorkRequest) -> io::Result<()> {
        let wr = *wr;
        self.call(Op::PostSend, |f| {
            if wr.opcode != WrOpcode::Send {
                return Err(os_err(libc::EINVAL));
            }
            let state = f.id_mut(id.0)?;
            let Link::Connected(peer) = state.link else {
                return Err(os_err(libc::EINVAL));
            };
            if state.qp.is_none() {
                return Err(os_err(libc::EINVAL));
            }
            let peer_qp = f
                .ids
                .get_mut(&peer)
                .and_then(|s| s.qp.as_mut())
                .ok_or_else(|| os_err(libc::ENOTCONN))?;
            let recv = peer_qp.recv_queue.pop_front();
            if recv.is_none() {
                // receiver not ready, retried until a receive shows up
                peer_qp.inbound.push_back(HeldSend { from: id.0, wr });
            }
            if let Some(recv) = recv {
                f.deliver(id.0, wr, peer, recv);
            }
            Ok(())
        })
    }

    fn post_recv(&self, id: SimCmId, wr: &WorkRequest) -> io::Result<()> {
        let wr = *wr;
        self.call(Op::PostRecv, |f| {
            if wr.opcode != WrOpcode::Recv {
                return Err(os_err(libc::EINVAL));
            }
            let state = f.id_mut(id.0)?;
            let disconnected = state.link == Link::Disconnected;
            let qp = state.qp.as_mut().ok_or_else(|| os_err(libc::EINVAL))?;
            let max = usize::try_from(qp.caps.max_recv_wr).unwrap_or(usize::MAX);
            if qp.recv_queue.len() >= max {
                return Err(os_err(libc::ENOMEM));
            }
            let cq = qp.cq;
            let held = if disconnected {
                None
            } else {
                let held = qp.inbound.pop_front();
                if held.is_none() {
                    qp.recv_queue.push_back(wr);
                }
                held
            };
            if disconnected {
                f.complete(cq, u64::from(wr.wr_id), WcStatus::WrFlushErr, 0);
            } else if let Some(held) = held {
                f.deliver(held.from, held.wr, id.0, wr);
            }
            Ok(())
        })
    }

    fn req_notify_cq(&self, cq: SimCq, _solicited_only: bool) -> io::Result<()> {
        self.call(Op::ReqNotifyCq, |f| {
            let state = f.cqs.get_mut(&cq.0).ok_or_else(|| os_err(libc::EINVAL))?;
            state.armed = true;
            Ok(())
        })
    }

    fn poll_cq(&self, cq: SimCq, wc: &mut WorkCompletion) -> io::Result<usize> {
        self.call(Op::PollCq, |f| {
            let state = f.cqs.get_mut(&cq.0).ok_or_else(|| os_err(libc::EINVAL))?;
            match state.entries.pop_front() {
                Some(entry) => {
                    *wc = entry;
                    Ok(1)
                }
                None => Ok(0),
            }
        })
    }

    fn get_cq_event(&self, cc: SimCompChannel, timeout: Option<Duration>) -> io::Result<SimCq> {
        self.blocking_call(Op::GetCqEvent, timeout, |f| {
            let queue = f
                .comp_channels
                .get_mut(&cc.0)
                .ok_or_else(|| os_err(libc::EINVAL))?;
            Ok(queue.pop_front().map(SimCq))
        })
    }

    fn ack_cq_events(&self, _cq: SimCq, _nevents: u32) {
        let _ = self.call(Op::AckCqEvents, |_| Ok(()));
    }
}
