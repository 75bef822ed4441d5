use crate::{
    access::{mr_access, Role},
    completion_queue::{CompletionQueue, DEFAULT_CQ_SIZE},
    cq_event_channel::CompChannel,
    error::FlowError,
    memory_region::{MemoryRegion, MrAccess, MrBuffer},
    protection_domain::ProtectionDomain,
    queue_pair::QueuePair,
    verbs::{QpCaps, Verbs},
    work_request::Sge,
};
use std::{io, sync::Arc};
use tracing::info;

/// How to size the resources of one connection
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BundleConfig {
    /// Sending or receiving side
    pub role: Role,
    /// Bytes in the registered buffer
    pub buffer_size: usize,
    /// Completion queue entries
    pub cq_size: i32,
    /// Queue pair capacities
    pub caps: QpCaps,
}

impl BundleConfig {
    /// Reference sizing: 10 cq entries, 10 send/recv wr, 1 sge each
    #[must_use]
    pub fn new(role: Role, buffer_size: usize) -> Self {
        Self {
            role,
            buffer_size,
            cq_size: DEFAULT_CQ_SIZE,
            caps: QpCaps::default(),
        }
    }
}

/// The hardware resources of one connection.
///
/// Acquisition order is protection domain, completion channel, completion
/// queue, queue pair, buffer, memory region. Fields are declared in the
/// reverse order so dropping the bundle releases them in exactly the reverse
/// of acquisition.
#[derive(Debug)]
pub struct ResourceBundle<V: Verbs> {
    /// Registration of `buffer`
    mr: MemoryRegion<V>,
    /// Backing memory
    buffer: MrBuffer,
    /// RC queue pair stored in the cm id
    qp: QueuePair<V>,
    /// Completion queue for both directions
    cq: CompletionQueue<V>,
    /// Notification channel of `cq`
    comp_channel: CompChannel<V>,
    /// Protection domain of `qp` and `mr`
    _pd: ProtectionDomain<V>,
}

impl<V: Verbs> ResourceBundle<V> {
    /// Acquire all resources for the connection `id`.
    ///
    /// When a step fails, everything acquired before it is released in reverse
    /// order as the locals go out of scope, and no later step runs.
    pub(crate) fn acquire(
        verbs: &Arc<V>,
        id: V::CmId,
        cfg: &BundleConfig,
    ) -> Result<Self, FlowError> {
        if u32::try_from(cfg.buffer_size).is_err() {
            return Err(FlowError::setup("buffer sizing")(io::Error::new(
                io::ErrorKind::InvalidInput,
                "a single work request can not exceed u32::MAX bytes",
            )));
        }
        let pd = ProtectionDomain::create(verbs, id).map_err(FlowError::setup("ibv_alloc_pd"))?;
        let comp_channel =
            CompChannel::new(verbs, id).map_err(FlowError::setup("ibv_create_comp_channel"))?;
        let cq = CompletionQueue::create(verbs, id, cfg.cq_size, &comp_channel)
            .map_err(FlowError::setup("ibv_create_cq"))?;
        let qp = QueuePair::create(verbs, id, &pd, &cq, cfg.caps)
            .map_err(FlowError::setup("rdma_create_qp"))?;
        let buffer = MrBuffer::zeroed(cfg.buffer_size).map_err(FlowError::setup("malloc"))?;
        let mr = MemoryRegion::register(verbs, &pd, &buffer, mr_access(cfg.role))
            .map_err(FlowError::setup("ibv_reg_mr"))?;
        info!(
            "resources ready: {} byte buffer, qp caps {:?}, access {:?}",
            buffer.len(),
            qp.caps(),
            mr.access()
        );
        Ok(Self {
            mr,
            buffer,
            qp,
            cq,
            comp_channel,
            _pd: pd,
        })
    }

    /// The registered buffer
    #[inline]
    #[must_use]
    pub fn buffer(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    /// The registered buffer, for filling before a send
    #[inline]
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        self.buffer.as_mut_slice()
    }

    /// Scatter/gather element covering the whole registered buffer
    #[must_use]
    #[allow(clippy::as_conversions, clippy::cast_possible_truncation)]
    pub fn sge(&self) -> Sge {
        Sge {
            addr: self.mr.addr() as u64,
            // checked against u32::MAX in `acquire`
            length: self.mr.length() as u32,
            lkey: self.mr.lkey(),
        }
    }

    /// The memory region
    #[inline]
    pub fn mr(&self) -> &MemoryRegion<V> {
        &self.mr
    }

    /// The queue pair
    #[inline]
    pub(crate) fn qp(&self) -> &QueuePair<V> {
        &self.qp
    }

    /// The completion queue
    #[inline]
    pub(crate) fn cq(&self) -> &CompletionQueue<V> {
        &self.cq
    }

    /// The completion channel
    #[inline]
    pub(crate) fn comp_channel(&self) -> &CompChannel<V> {
        &self.comp_channel
    }
}
