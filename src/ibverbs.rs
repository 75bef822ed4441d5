//! [`Verbs`] on top of librdmacm and libibverbs.

use crate::{
    access::{flags_into_ibv_access, AccessFlag},
    completion_queue::WorkCompletion,
    error_utilities::log_ret_last_os_err_with_note,
    verbs::{CmEventInfo, CmEventKind, ConnParam, QpCaps, Verbs},
    work_request::{Sge, WorkRequest},
};
use enumflags2::BitFlags;
use rdma_sys::{
    ibv_ack_cq_events, ibv_alloc_pd, ibv_comp_channel, ibv_cq, ibv_create_comp_channel,
    ibv_create_cq, ibv_dealloc_pd, ibv_dereg_mr, ibv_destroy_comp_channel, ibv_destroy_cq,
    ibv_get_cq_event, ibv_mr, ibv_pd, ibv_poll_cq, ibv_post_recv, ibv_post_send, ibv_qp_cap,
    ibv_qp_init_attr, ibv_qp_type, ibv_recv_wr, ibv_reg_mr, ibv_req_notify_cq, ibv_send_flags,
    ibv_send_wr, ibv_sge, ibv_srq, ibv_wc, ibv_wr_opcode, rdma_accept, rdma_ack_cm_event,
    rdma_bind_addr, rdma_cm_event, rdma_cm_id, rdma_conn_param, rdma_connect,
    rdma_create_event_channel, rdma_create_id, rdma_create_qp, rdma_destroy_event_channel,
    rdma_destroy_id, rdma_destroy_qp, rdma_disconnect, rdma_event_channel, rdma_get_cm_event,
    rdma_listen, rdma_port_space, rdma_resolve_addr, rdma_resolve_route,
};
use std::{
    fmt,
    io,
    net::SocketAddrV4,
    os::raw::{c_int, c_void},
    ptr::{self, NonNull},
    time::Duration,
};

/// A raw rdma_cm/ibverbs object pointer
pub struct Handle<T>(NonNull<T>);

// SAFETY: the objects are thread safe in the C libraries, ownership is tracked
// by the wrappers holding the handle
unsafe impl<T> Send for Handle<T> {}

impl<T> Handle<T> {
    /// Wrap a pointer returned by a create call, null means failure
    fn new(ptr: *mut T, note: &str) -> io::Result<Self> {
        NonNull::new(ptr)
            .map(Self)
            .ok_or_else(|| log_ret_last_os_err_with_note(note))
    }

    /// The raw pointer
    fn as_ptr(self) -> *mut T {
        self.0.as_ptr()
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.0)
    }
}

/// `rdma_*` calls return -1 and set errno
fn check_rdma(ret: c_int, note: &str) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(log_ret_last_os_err_with_note(note))
    }
}

/// `ibv_*` calls return the errno value
fn check_ibv(ret: c_int) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(ret))
    }
}

/// Milliseconds as expected by the resolution calls
fn timeout_ms(timeout: Duration) -> c_int {
    c_int::try_from(timeout.as_millis()).unwrap_or(c_int::MAX)
}

/// Wait until `fd` is readable or `timeout` elapses
fn wait_readable(fd: c_int, timeout: Duration) -> io::Result<()> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: one valid pollfd
    let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms(timeout)) };
    match ret {
        0 => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no event within {timeout:?}"),
        )),
        n if n < 0 => Err(log_ret_last_os_err_with_note("poll")),
        _ => Ok(()),
    }
}

/// IPv4 socket address in the C layout
#[allow(clippy::as_conversions)]
fn sockaddr_in(addr: SocketAddrV4) -> libc::sockaddr_in {
    // SAFETY: all-zero is a valid sockaddr_in
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = addr.port().to_be();
    sa.sin_addr = libc::in_addr {
        s_addr: u32::from_ne_bytes(addr.ip().octets()),
    };
    sa
}

/// One scatter/gather element in the C layout
fn ibv_sge_of(sge: Sge) -> ibv_sge {
    ibv_sge {
        addr: sge.addr,
        length: sge.length,
        lkey: sge.lkey,
    }
}

/// The queue pair rdma_cm stored in `id`
fn qp_of(id: Handle<rdma_cm_id>) -> io::Result<*mut rdma_sys::ibv_qp> {
    // SAFETY: `id` is a live cm id
    let qp = unsafe { (*id.as_ptr()).qp };
    if qp.is_null() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "cm id has no queue pair",
        ));
    }
    Ok(qp)
}

/// librdmacm / libibverbs
#[derive(Debug, Default, Clone, Copy)]
pub struct IbVerbs;

impl IbVerbs {
    /// The real backend
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Verbs for IbVerbs {
    type EventChannel = Handle<rdma_event_channel>;
    type CmId = Handle<rdma_cm_id>;
    type CmEvent = Handle<rdma_cm_event>;
    type Pd = Handle<ibv_pd>;
    type CompChannel = Handle<ibv_comp_channel>;
    type Cq = Handle<ibv_cq>;
    type Mr = Handle<ibv_mr>;

    fn create_event_channel(&self) -> io::Result<Self::EventChannel> {
        // SAFETY: ffi
        Handle::new(unsafe { rdma_create_event_channel() }, "rdma_create_event_channel")
    }

    fn destroy_event_channel(&self, ec: Self::EventChannel) -> io::Result<()> {
        // SAFETY: ffi, `ec` is not used afterwards
        unsafe { rdma_destroy_event_channel(ec.as_ptr()) };
        Ok(())
    }

    fn create_id(&self, ec: Self::EventChannel) -> io::Result<Self::CmId> {
        let mut id = ptr::null_mut::<rdma_cm_id>();
        // SAFETY: ffi
        let ret = unsafe {
            rdma_create_id(
                ec.as_ptr(),
                &mut id,
                ptr::null_mut::<c_void>(),
                rdma_port_space::RDMA_PS_TCP,
            )
        };
        check_rdma(ret, "rdma_create_id")?;
        Handle::new(id, "rdma_create_id")
    }

    fn destroy_id(&self, id: Self::CmId) -> io::Result<()> {
        // SAFETY: ffi
        check_rdma(unsafe { rdma_destroy_id(id.as_ptr()) }, "rdma_destroy_id")
    }

    fn resolve_addr(
        &self,
        id: Self::CmId,
        src: SocketAddrV4,
        dst: SocketAddrV4,
        timeout: Duration,
    ) -> io::Result<()> {
        let mut src = sockaddr_in(src);
        let mut dst = sockaddr_in(dst);
        // SAFETY: both addresses outlive the call, rdma_cm copies them
        let ret = unsafe {
            rdma_resolve_addr(
                id.as_ptr(),
                ptr::addr_of_mut!(src).cast(),
                ptr::addr_of_mut!(dst).cast(),
                timeout_ms(timeout),
            )
        };
        check_rdma(ret, "rdma_resolve_addr")
    }

    fn resolve_route(&self, id: Self::CmId, timeout: Duration) -> io::Result<()> {
        // SAFETY: ffi
        let ret = unsafe { rdma_resolve_route(id.as_ptr(), timeout_ms(timeout)) };
        check_rdma(ret, "rdma_resolve_route")
    }

    fn bind_addr(&self, id: Self::CmId, addr: SocketAddrV4) -> io::Result<()> {
        let mut addr = sockaddr_in(addr);
        // SAFETY: the address outlives the call
        let ret = unsafe { rdma_bind_addr(id.as_ptr(), ptr::addr_of_mut!(addr).cast()) };
        check_rdma(ret, "rdma_bind_addr")
    }

    fn listen(&self, id: Self::CmId, backlog: i32) -> io::Result<()> {
        // SAFETY: ffi
        check_rdma(unsafe { rdma_listen(id.as_ptr(), backlog) }, "rdma_listen")
    }

    fn connect(&self, id: Self::CmId, param: &ConnParam) -> io::Result<()> {
        let mut cm_params = conn_param(param);
        // SAFETY: ffi
        let ret = unsafe { rdma_connect(id.as_ptr(), &mut cm_params) };
        check_rdma(ret, "rdma_connect")
    }

    fn accept(&self, id: Self::CmId, param: &ConnParam) -> io::Result<()> {
        let mut cm_params = conn_param(param);
        // SAFETY: ffi
        let ret = unsafe { rdma_accept(id.as_ptr(), &mut cm_params) };
        check_rdma(ret, "rdma_accept")
    }

    fn disconnect(&self, id: Self::CmId) -> io::Result<()> {
        // SAFETY: ffi
        check_rdma(unsafe { rdma_disconnect(id.as_ptr()) }, "rdma_disconnect")
    }

    fn get_cm_event(
        &self,
        ec: Self::EventChannel,
        timeout: Option<Duration>,
    ) -> io::Result<(Self::CmEvent, CmEventInfo<Self::CmId>)> {
        if let Some(timeout) = timeout {
            // SAFETY: `ec` is a live channel
            wait_readable(unsafe { (*ec.as_ptr()).fd }, timeout)?;
        }
        let mut event = ptr::null_mut::<rdma_cm_event>();
        // SAFETY: ffi
        let ret = unsafe { rdma_get_cm_event(ec.as_ptr(), &mut event) };
        check_rdma(ret, "rdma_get_cm_event")?;
        let event = Handle::new(event, "rdma_get_cm_event")?;
        // SAFETY: a retrieved event stays valid until it is acked
        let (kind, id, status) = unsafe {
            let raw = &*event.as_ptr();
            (CmEventKind::from_code(raw.event), raw.id, raw.status)
        };
        match NonNull::new(id) {
            Some(id) => Ok((
                event,
                CmEventInfo {
                    kind,
                    id: Handle(id),
                    status,
                },
            )),
            None => {
                self.ack_cm_event(event)?;
                Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{kind} without cm id"),
                ))
            }
        }
    }

    fn ack_cm_event(&self, event: Self::CmEvent) -> io::Result<()> {
        // SAFETY: ffi, the event is not used afterwards
        check_rdma(unsafe { rdma_ack_cm_event(event.as_ptr()) }, "rdma_ack_cm_event")
    }

    fn alloc_pd(&self, id: Self::CmId) -> io::Result<Self::Pd> {
        // SAFETY: the device context is set once the address is resolved
        Handle::new(unsafe { ibv_alloc_pd((*id.as_ptr()).verbs) }, "ibv_alloc_pd")
    }

    fn dealloc_pd(&self, pd: Self::Pd) -> io::Result<()> {
        // SAFETY: ffi
        check_ibv(unsafe { ibv_dealloc_pd(pd.as_ptr()) })
    }

    fn create_comp_channel(&self, id: Self::CmId) -> io::Result<Self::CompChannel> {
        // SAFETY: see `alloc_pd`
        Handle::new(
            unsafe { ibv_create_comp_channel((*id.as_ptr()).verbs) },
            "ibv_create_comp_channel",
        )
    }

    fn destroy_comp_channel(&self, cc: Self::CompChannel) -> io::Result<()> {
        // SAFETY: ffi
        check_ibv(unsafe { ibv_destroy_comp_channel(cc.as_ptr()) })
    }

    fn create_cq(&self, id: Self::CmId, cqe: i32, cc: Self::CompChannel) -> io::Result<Self::Cq> {
        // SAFETY: see `alloc_pd`
        let cq = unsafe {
            ibv_create_cq(
                (*id.as_ptr()).verbs,
                cqe,
                ptr::null_mut::<c_void>(),
                cc.as_ptr(),
                0,
            )
        };
        Handle::new(cq, "ibv_create_cq")
    }

    fn destroy_cq(&self, cq: Self::Cq) -> io::Result<()> {
        // SAFETY: ffi
        check_ibv(unsafe { ibv_destroy_cq(cq.as_ptr()) })
    }

    fn create_qp(&self, id: Self::CmId, pd: Self::Pd, cq: Self::Cq, caps: &QpCaps) -> io::Result<()> {
        let mut qp_attr = ibv_qp_init_attr {
            qp_context: ptr::null_mut::<c_void>(),
            send_cq: cq.as_ptr(),
            recv_cq: cq.as_ptr(),
            srq: ptr::null_mut::<ibv_srq>(),
            cap: ibv_qp_cap {
                max_send_wr: caps.max_send_wr,
                max_recv_wr: caps.max_recv_wr,
                max_send_sge: caps.max_send_sge,
                max_recv_sge: caps.max_recv_sge,
                max_inline_data: 0,
            },
            qp_type: ibv_qp_type::IBV_QPT_RC,
            sq_sig_all: 0,
        };
        // SAFETY: ffi
        let ret = unsafe { rdma_create_qp(id.as_ptr(), pd.as_ptr(), &mut qp_attr) };
        check_rdma(ret, "rdma_create_qp")
    }

    fn destroy_qp(&self, id: Self::CmId) -> io::Result<()> {
        let _ = qp_of(id)?;
        // SAFETY: ffi
        unsafe { rdma_destroy_qp(id.as_ptr()) };
        Ok(())
    }

    #[allow(clippy::as_conversions, clippy::cast_possible_wrap)]
    fn reg_mr(
        &self,
        pd: Self::Pd,
        addr: NonNull<u8>,
        len: usize,
        access: BitFlags<AccessFlag>,
    ) -> io::Result<Self::Mr> {
        let access = flags_into_ibv_access(access).0 as c_int;
        // SAFETY: the caller keeps `addr..addr + len` alive until `dereg_mr`
        let mr = unsafe { ibv_reg_mr(pd.as_ptr(), addr.as_ptr().cast(), len, access) };
        Handle::new(mr, "ibv_reg_mr")
    }

    fn mr_lkey(&self, mr: Self::Mr) -> u32 {
        // SAFETY: `mr` is registered
        unsafe { (*mr.as_ptr()).lkey }
    }

    fn dereg_mr(&self, mr: Self::Mr) -> io::Result<()> {
        // SAFETY: ffi
        check_ibv(unsafe { ibv_dereg_mr(mr.as_ptr()) })
    }

    fn post_send(&self, id: Self::CmId, wr: &WorkRequest) -> io::Result<()> {
        let qp = qp_of(id)?;
        let mut sgl = ibv_sge_of(wr.sge);
        // SAFETY: all-zero is a valid ibv_send_wr
        let mut send_wr = unsafe { std::mem::zeroed::<ibv_send_wr>() };
        send_wr.wr_id = wr.wr_id.into();
        send_wr.sg_list = &mut sgl;
        send_wr.num_sge = 1;
        send_wr.opcode = ibv_wr_opcode::IBV_WR_SEND;
        send_wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        let mut bad_wr = ptr::null_mut::<ibv_send_wr>();
        // SAFETY: the sge and the wr outlive the call
        check_ibv(unsafe { ibv_post_send(qp, &mut send_wr, &mut bad_wr) })
    }

    fn post_recv(&self, id: Self::CmId, wr: &WorkRequest) -> io::Result<()> {
        let qp = qp_of(id)?;
        let mut sgl = ibv_sge_of(wr.sge);
        let mut recv_wr = ibv_recv_wr {
            wr_id: wr.wr_id.into(),
            next: ptr::null_mut(),
            sg_list: &mut sgl,
            num_sge: 1,
        };
        let mut bad_wr = ptr::null_mut::<ibv_recv_wr>();
        // SAFETY: the sge and the wr outlive the call
        check_ibv(unsafe { ibv_post_recv(qp, &mut recv_wr, &mut bad_wr) })
    }

    fn req_notify_cq(&self, cq: Self::Cq, solicited_only: bool) -> io::Result<()> {
        // SAFETY: ffi
        check_ibv(unsafe { ibv_req_notify_cq(cq.as_ptr(), c_int::from(solicited_only)) })
    }

    fn poll_cq(&self, cq: Self::Cq, wc: &mut WorkCompletion) -> io::Result<usize> {
        // SAFETY: all-zero is a valid ibv_wc
        let mut raw = unsafe { std::mem::zeroed::<ibv_wc>() };
        // SAFETY: room for exactly one entry
        let ret = unsafe { ibv_poll_cq(cq.as_ptr(), 1, &mut raw) };
        if ret < 0 {
            return Err(log_ret_last_os_err_with_note("ibv_poll_cq"));
        }
        if ret > 0 {
            *wc = WorkCompletion {
                wr_id: raw.wr_id,
                status: raw.status,
                byte_len: raw.byte_len,
            };
        }
        Ok(usize::try_from(ret).unwrap_or(0))
    }

    fn get_cq_event(&self, cc: Self::CompChannel, timeout: Option<Duration>) -> io::Result<Self::Cq> {
        if let Some(timeout) = timeout {
            // SAFETY: `cc` is a live channel
            wait_readable(unsafe { (*cc.as_ptr()).fd }, timeout)?;
        }
        let mut cq = ptr::null_mut::<ibv_cq>();
        let mut cq_context = ptr::null_mut::<c_void>();
        // SAFETY: ffi
        let ret = unsafe { ibv_get_cq_event(cc.as_ptr(), &mut cq, &mut cq_context) };
        check_rdma(ret, "ibv_get_cq_event")?;
        Handle::new(cq, "ibv_get_cq_event")
    }

    fn ack_cq_events(&self, cq: Self::Cq, nevents: u32) {
        // SAFETY: ffi
        unsafe { ibv_ack_cq_events(cq.as_ptr(), nevents) };
    }
}

/// `rdma_conn_param` without private data
fn conn_param(param: &ConnParam) -> rdma_conn_param {
    // SAFETY: all-zero is a valid rdma_conn_param
    let mut cm_params: rdma_conn_param = unsafe { std::mem::zeroed() };
    cm_params.initiator_depth = param.initiator_depth;
    cm_params.responder_resources = param.responder_resources;
    cm_params.retry_count = param.retry_count;
    cm_params.rnr_retry_count = param.rnr_retry_count;
    cm_params
}
