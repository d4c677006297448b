use std::time::Duration;

use metric::{DurationHistogram, Metric, Registry, U64Counter};

use crate::error::{Error, FailureKind};

/// What caused a batch to be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushTrigger {
    Interval,
    Capacity,
    Explicit,
    Unbuffered,
    /// Operations re-routed after their previous destination went stale.
    Requeue,
}

#[derive(Debug, Clone)]
pub(crate) struct BatchMetrics {
    submitted_buffered: U64Counter,
    submitted_unbuffered: U64Counter,

    batches_interval: U64Counter,
    batches_capacity: U64Counter,
    batches_explicit: U64Counter,
    batches_unbuffered: U64Counter,
    batches_requeue: U64Counter,

    batch_operations: U64Counter,

    retries_stale: U64Counter,
    retries_transient: U64Counter,

    settled_success: U64Counter,
    settled_exhausted: U64Counter,
    settled_rejected: U64Counter,

    dispatch_success: DurationHistogram,
    dispatch_error: DurationHistogram,
}

impl BatchMetrics {
    pub(crate) fn new(registry: &Registry) -> Self {
        let submitted: Metric<U64Counter> = registry.register_metric(
            "regionkv_client_operations_submitted",
            "number of operations submitted to the batching client",
        );
        let batches: Metric<U64Counter> = registry.register_metric(
            "regionkv_client_batches_dispatched",
            "number of consolidated requests sent, by what caused the flush",
        );
        let batch_operations: Metric<U64Counter> = registry.register_metric(
            "regionkv_client_batch_operations",
            "number of operations carried in consolidated requests, counting re-sends",
        );
        let retries: Metric<U64Counter> = registry.register_metric(
            "regionkv_client_retries",
            "number of operations retried, by failure kind",
        );
        let settled: Metric<U64Counter> = registry.register_metric(
            "regionkv_client_operations_settled",
            "number of operations that reached a final outcome",
        );
        let dispatch: Metric<DurationHistogram> = registry.register_metric(
            "regionkv_client_dispatch_duration",
            "time taken by a region server to answer a consolidated request",
        );

        Self {
            submitted_buffered: submitted.recorder(&[("bufferable", "true")]),
            submitted_unbuffered: submitted.recorder(&[("bufferable", "false")]),
            batches_interval: batches.recorder(&[("trigger", "interval")]),
            batches_capacity: batches.recorder(&[("trigger", "capacity")]),
            batches_explicit: batches.recorder(&[("trigger", "explicit")]),
            batches_unbuffered: batches.recorder(&[("trigger", "unbuffered")]),
            batches_requeue: batches.recorder(&[("trigger", "requeue")]),
            batch_operations: batch_operations.recorder(&[]),
            retries_stale: retries.recorder(&[("kind", "stale_location")]),
            retries_transient: retries.recorder(&[("kind", "transient")]),
            settled_success: settled.recorder(&[("result", "success")]),
            settled_exhausted: settled.recorder(&[("result", "retries_exhausted")]),
            settled_rejected: settled.recorder(&[("result", "rejected")]),
            dispatch_success: dispatch.recorder(&[("result", "success")]),
            dispatch_error: dispatch.recorder(&[("result", "error")]),
        }
    }

    pub(crate) fn record_submitted(&self, bufferable: bool) {
        if bufferable {
            self.submitted_buffered.inc(1);
        } else {
            self.submitted_unbuffered.inc(1);
        }
    }

    pub(crate) fn record_batch(&self, trigger: FlushTrigger) {
        match trigger {
            FlushTrigger::Interval => &self.batches_interval,
            FlushTrigger::Capacity => &self.batches_capacity,
            FlushTrigger::Explicit => &self.batches_explicit,
            FlushTrigger::Unbuffered => &self.batches_unbuffered,
            FlushTrigger::Requeue => &self.batches_requeue,
        }
        .inc(1);
    }

    pub(crate) fn record_send(&self, n_ops: usize, elapsed: Option<Duration>, success: bool) {
        self.batch_operations.inc(n_ops as u64);
        let Some(elapsed) = elapsed else {
            return;
        };
        if success {
            self.dispatch_success.record(elapsed);
        } else {
            self.dispatch_error.record(elapsed);
        }
    }

    pub(crate) fn record_retry(&self, kind: FailureKind) {
        match kind {
            FailureKind::StaleLocation => self.retries_stale.inc(1),
            FailureKind::TransientTransport => self.retries_transient.inc(1),
            FailureKind::NonRetryable => {}
        }
    }

    pub(crate) fn record_success(&self) {
        self.settled_success.inc(1);
    }

    pub(crate) fn record_failure(&self, error: &Error) {
        match error {
            Error::RetriesExhausted { .. } => self.settled_exhausted.inc(1),
            Error::Rejected(_) => self.settled_rejected.inc(1),
        }
    }
}
