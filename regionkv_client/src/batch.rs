//! Batches drained from a destination buffer, and the gate that keeps them in
//! drain order on the wire.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::task::TaskTracker;

use crate::{location::Destination, metrics::FlushTrigger, operation::PendingOp};

/// An immutable snapshot of operations bound for one destination.
///
/// Once drained, the operations are owned by whoever dispatches the batch.
#[derive(Debug)]
pub(crate) struct Batch {
    destination: Destination,
    ops: Vec<PendingOp>,
    trigger: FlushTrigger,
    ticket: Option<OrderTicket>,
}

impl Batch {
    pub(crate) fn new(
        destination: Destination,
        ops: Vec<PendingOp>,
        trigger: FlushTrigger,
        ticket: Option<OrderTicket>,
    ) -> Self {
        Self {
            destination,
            ops,
            trigger,
            ticket,
        }
    }

    /// A batch of one for an operation that must not be buffered. It is not
    /// ordered against anything else bound for the same destination.
    pub(crate) fn unbuffered(destination: Destination, op: PendingOp) -> Self {
        Self::new(destination, vec![op], FlushTrigger::Unbuffered, None)
    }

    pub(crate) fn destination(&self) -> &Destination {
        &self.destination
    }

    #[cfg(test)]
    pub(crate) fn ops(&self) -> &[PendingOp] {
        &self.ops
    }

    pub(crate) fn len(&self) -> usize {
        self.ops.len()
    }

    pub(crate) fn trigger(&self) -> FlushTrigger {
        self.trigger
    }

    /// Make `flush` wait for every operation in this batch to settle.
    pub(crate) fn track(&mut self, flush: &TaskTracker) {
        for op in &mut self.ops {
            op.track(flush);
        }
    }

    pub(crate) fn into_parts(self) -> (Destination, Vec<PendingOp>, Option<OrderTicket>) {
        (self.destination, self.ops, self.ticket)
    }
}

/// Tracks how many of the batches drained from one buffer have finished
/// sending.
#[derive(Debug)]
pub(crate) struct OrderGate {
    finished: watch::Sender<u64>,
}

impl OrderGate {
    pub(crate) fn new() -> Self {
        let (finished, _) = watch::channel(0);
        Self { finished }
    }

    /// Number of leading batches that have finished.
    pub(crate) fn finished(&self) -> u64 {
        *self.finished.borrow()
    }
}

/// The position of a batch in its buffer's drain sequence.
///
/// Dropping the ticket marks the batch as finished and lets the next one go.
#[derive(Debug)]
pub(crate) struct OrderTicket {
    gate: Arc<OrderGate>,
    seq: u64,
}

impl OrderTicket {
    pub(crate) fn new(gate: Arc<OrderGate>, seq: u64) -> Self {
        Self { gate, seq }
    }

    /// Wait until every batch drained before this one has finished.
    pub(crate) async fn wait_turn(&self) {
        let mut rx = self.gate.finished.subscribe();
        // The sender lives in the gate we hold, so this cannot fail.
        let _ = rx.wait_for(|finished| *finished >= self.seq).await;
    }
}

impl Drop for OrderTicket {
    fn drop(&mut self) {
        let next = self.seq + 1;
        self.gate.finished.send_modify(|finished| {
            if *finished < next {
                *finished = next;
            }
        });
    }
}
