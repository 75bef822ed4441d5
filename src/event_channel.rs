use crate::{
    error_utilities::{log_release, log_ret},
    verbs::{CmEventInfo, Verbs},
};
use std::{io, sync::Arc, time::Duration};
use tracing::debug;

/// rdma_cm event channel, the queue CM events of its ids are delivered to
#[derive(Debug)]
pub struct EventChannel<V: Verbs> {
    /// The backend that created the channel
    verbs: Arc<V>,
    /// The inner `rdma_event_channel` handle
    inner_ec: V::EventChannel,
}

impl<V: Verbs> EventChannel<V> {
    /// Create a new event channel
    pub fn new(verbs: &Arc<V>) -> io::Result<Self> {
        let inner_ec = log_ret(verbs.create_event_channel(), "rdma_create_event_channel")?;
        Ok(Self {
            verbs: Arc::clone(verbs),
            inner_ec,
        })
    }

    /// Get the inner `rdma_event_channel` handle
    pub(crate) fn raw(&self) -> V::EventChannel {
        self.inner_ec
    }

    /// The backend
    pub(crate) fn verbs(&self) -> &Arc<V> {
        &self.verbs
    }

    /// Block until the next event arrives, or until `timeout` elapses
    pub fn next_event(&self, timeout: Option<Duration>) -> io::Result<CmEvent<V>> {
        let (raw, info) = self.verbs.get_cm_event(self.inner_ec, timeout)?;
        debug!("got cm event {} status {}", info.kind, info.status);
        Ok(CmEvent {
            verbs: Arc::clone(&self.verbs),
            raw: Some(raw),
            info,
        })
    }
}

impl<V: Verbs> Drop for EventChannel<V> {
    fn drop(&mut self) {
        log_release(self.verbs.destroy_event_channel(self.inner_ec), "event channel");
    }
}

/// A retrieved CM event, acknowledged exactly once: explicitly through
/// [`CmEvent::ack`] or implicitly on drop.
#[derive(Debug)]
pub struct CmEvent<V: Verbs> {
    /// The backend that delivered the event
    verbs: Arc<V>,
    /// The raw event until it is acknowledged
    raw: Option<V::CmEvent>,
    /// Copy of the event fields
    info: CmEventInfo<V::CmId>,
}

impl<V: Verbs> CmEvent<V> {
    /// Fields of the event, still valid after the ack
    #[inline]
    pub fn info(&self) -> CmEventInfo<V::CmId> {
        self.info
    }

    /// Release the event back to rdma_cm
    pub fn ack(mut self) -> io::Result<CmEventInfo<V::CmId>> {
        if let Some(raw) = self.raw.take() {
            log_ret(self.verbs.ack_cm_event(raw), "rdma_ack_cm_event")?;
        }
        Ok(self.info)
    }
}

impl<V: Verbs> Drop for CmEvent<V> {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            log_release(self.verbs.ack_cm_event(raw), "cm event");
        }
    }
}
