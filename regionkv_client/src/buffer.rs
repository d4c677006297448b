//! Per-destination queues of operations waiting to be flushed.

use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use iox_time::Time;
use parking_lot::Mutex;

use crate::{
    batch::{Batch, OrderGate, OrderTicket},
    location::Destination,
    metrics::FlushTrigger,
    operation::PendingOp,
};

/// Capacity of a single destination buffer. Reaching either limit flushes the
/// buffer immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLimits {
    pub max_operations: NonZeroUsize,
    pub max_bytes: NonZeroUsize,
}

impl BufferLimits {
    pub const DEFAULT_MAX_OPERATIONS: NonZeroUsize = NonZeroUsize::new(1024).unwrap();
    pub const DEFAULT_MAX_BYTES: NonZeroUsize = NonZeroUsize::new(1024 * 1024).unwrap();
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self {
            max_operations: Self::DEFAULT_MAX_OPERATIONS,
            max_bytes: Self::DEFAULT_MAX_BYTES,
        }
    }
}

#[derive(Debug)]
struct BufferState {
    ops: Vec<PendingOp>,
    bytes: usize,
    last_activity: Time,
    /// Sequence number handed to the next drained batch.
    next_seq: u64,
    /// Set once the buffer has been removed from the registry. Appends to a
    /// retired buffer are refused so they can be redirected to its
    /// replacement.
    retired: bool,
}

/// Ordered queue of operations for one [`Destination`].
///
/// All mutation happens under a single lock, so a drain takes exactly the
/// operations appended before it and an append racing a drain lands in the
/// (fresh, empty) queue left behind.
#[derive(Debug)]
pub(crate) struct DestinationBuffer {
    destination: Destination,
    limits: BufferLimits,
    gate: Arc<OrderGate>,
    state: Mutex<BufferState>,
}

impl DestinationBuffer {
    pub(crate) fn new(destination: Destination, limits: BufferLimits, now: Time) -> Self {
        Self {
            destination,
            limits,
            gate: Arc::new(OrderGate::new()),
            state: Mutex::new(BufferState {
                ops: vec![],
                bytes: 0,
                last_activity: now,
                next_seq: 0,
                retired: false,
            }),
        }
    }

    /// Queue `op`, returning the drained batch if this append filled the
    /// buffer.
    ///
    /// Hands `op` back if the buffer has been retired.
    pub(crate) fn append(&self, op: PendingOp, now: Time) -> Result<Option<Batch>, PendingOp> {
        let mut state = self.state.lock();
        if state.retired {
            return Err(op);
        }

        state.bytes += op.size();
        state.ops.push(op);
        state.last_activity = now;

        if state.ops.len() >= self.limits.max_operations.get()
            || state.bytes >= self.limits.max_bytes.get()
        {
            return Ok(Some(self.take(&mut state, FlushTrigger::Capacity)));
        }
        Ok(None)
    }

    /// Take every queued operation, or `None` if there are none.
    pub(crate) fn drain(&self, trigger: FlushTrigger) -> Option<Batch> {
        let mut state = self.state.lock();
        if state.ops.is_empty() {
            return None;
        }
        Some(self.take(&mut state, trigger))
    }

    fn take(&self, state: &mut BufferState, trigger: FlushTrigger) -> Batch {
        let ops = std::mem::take(&mut state.ops);
        state.bytes = 0;

        let seq = state.next_seq;
        state.next_seq += 1;

        Batch::new(
            self.destination.clone(),
            ops,
            trigger,
            Some(OrderTicket::new(Arc::clone(&self.gate), seq)),
        )
    }

    /// Mark the buffer retired if it is empty, has nothing in flight and has
    /// not seen an append for `idle_timeout`.
    pub(crate) fn try_retire(&self, now: Time, idle_timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if state.retired {
            return true;
        }
        if !state.ops.is_empty() || self.gate.finished() < state.next_seq {
            return false;
        }

        let idle = now
            .checked_duration_since(state.last_activity)
            .unwrap_or_default();
        if idle < idle_timeout {
            return false;
        }

        state.retired = true;
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().ops.len()
    }

    #[cfg(test)]
    pub(crate) fn bytes(&self) -> usize {
        self.state.lock().bytes
    }
}
