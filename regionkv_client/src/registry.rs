use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use iox_time::TimeProvider;
use observability_deps::tracing::debug;

use crate::{
    batch::Batch,
    buffer::{BufferLimits, DestinationBuffer},
    location::Destination,
    metrics::FlushTrigger,
    operation::PendingOp,
};

/// The set of live destination buffers, created on first use and released
/// once idle.
#[derive(Debug)]
pub(crate) struct BufferRegistry {
    buffers: DashMap<Destination, Arc<DestinationBuffer>>,
    limits: BufferLimits,
    time_provider: Arc<dyn TimeProvider>,
}

impl BufferRegistry {
    pub(crate) fn new(limits: BufferLimits, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            buffers: DashMap::new(),
            limits,
            time_provider,
        }
    }

    /// Queue `op` for `destination`, returning a batch to dispatch if the
    /// append filled the buffer.
    pub(crate) fn append(&self, destination: &Destination, op: PendingOp) -> Option<Batch> {
        let buffer = self.get_or_create(destination);
        self.append_to(buffer, destination, op)
    }

    fn append_to(
        &self,
        mut buffer: Arc<DestinationBuffer>,
        destination: &Destination,
        mut op: PendingOp,
    ) -> Option<Batch> {
        loop {
            match buffer.append(op, self.time_provider.now()) {
                Ok(batch) => return batch,
                Err(returned) => {
                    // Lost a race with eviction; the retired buffer is no
                    // longer in the map, so the next lookup creates a fresh
                    // one.
                    op = returned;
                    buffer = self.get_or_create(destination);
                }
            }
        }
    }

    fn get_or_create(&self, destination: &Destination) -> Arc<DestinationBuffer> {
        if let Some(buffer) = self.buffers.get(destination) {
            return Arc::clone(buffer.value());
        }

        let buffer = self
            .buffers
            .entry(destination.clone())
            .or_insert_with(|| {
                debug!(%destination, "creating destination buffer");
                Arc::new(DestinationBuffer::new(
                    destination.clone(),
                    self.limits,
                    self.time_provider.now(),
                ))
            });
        Arc::clone(buffer.value())
    }

    /// Drain the buffer for `destination`, if it exists and holds operations.
    pub(crate) fn drain(&self, destination: &Destination, trigger: FlushTrigger) -> Option<Batch> {
        let buffer = self.buffers.get(destination).map(|b| Arc::clone(b.value()))?;
        buffer.drain(trigger)
    }

    /// Drain every buffer that holds operations.
    pub(crate) fn drain_all(&self, trigger: FlushTrigger) -> Vec<Batch> {
        // Snapshot first so no shard lock is held while draining.
        let buffers = self
            .buffers
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect::<Vec<_>>();

        buffers
            .into_iter()
            .filter_map(|b| b.drain(trigger))
            .collect()
    }

    /// Release buffers that are empty, quiescent and idle for at least
    /// `idle_timeout`. Returns the number released.
    pub(crate) fn evict_idle(&self, idle_timeout: Duration) -> usize {
        let now = self.time_provider.now();
        let keys = self
            .buffers
            .iter()
            .map(|e| e.key().clone())
            .collect::<Vec<_>>();

        let evicted = keys
            .into_iter()
            .filter(|k| {
                self.buffers
                    .remove_if(k, |_, buffer| buffer.try_retire(now, idle_timeout))
                    .is_some()
            })
            .count();

        if evicted > 0 {
            debug!(evicted, remaining = self.len(), "released idle destination buffers");
        }
        evicted
    }

    /// Operations queued across all buffers and not yet drained.
    pub(crate) fn buffered_operations(&self) -> usize {
        self.buffers.iter().map(|e| e.value().len()).sum()
    }

    pub(crate) fn len(&self) -> usize {
        self.buffers.len()
    }
}
