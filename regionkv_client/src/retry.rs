//! Failure classification applied to individual operations.

use std::{num::NonZeroU32, sync::Arc, time::Duration};

use observability_deps::tracing::{error, warn};

use crate::{
    error::{Error, FailureCause, FailureKind, Rejection},
    location::{Destination, LocationResolver},
    metrics::BatchMetrics,
    operation::PendingOp,
};

/// Bounds on how long and how often an operation is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// An operation is sent at most this many times.
    pub max_attempts: NonZeroU32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Growth factor applied to the delay after every retried attempt.
    pub base: u32,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: NonZeroU32 = NonZeroU32::new(10).unwrap();

    /// Delay before the re-send that follows failed attempt number `attempt`
    /// (counting from 1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        self.base
            .checked_pow(exp)
            .and_then(|factor| self.initial_backoff.checked_mul(factor))
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
            base: 2,
        }
    }
}

/// What to do with one operation after a failed attempt.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Decision {
    /// Resolve the operation's location again and route it from scratch.
    Requeue,
    /// Wait, then send the operation to the same destination again.
    Resend(Duration),
    /// Settle the operation with this error.
    Fail(Error),
}

/// The follow-up work for the failed operations of one batch.
#[derive(Debug, Default)]
pub(crate) struct RetryPlan {
    /// Operations to route through the full submission path again, in their
    /// original order.
    pub(crate) requeue: Vec<PendingOp>,
    /// Operations to send again to the same destination after the delay.
    pub(crate) resend: Option<(Vec<PendingOp>, Duration)>,
}

#[derive(Debug)]
pub(crate) struct RetryController {
    resolver: Arc<dyn LocationResolver>,
    policy: RetryPolicy,
    metrics: BatchMetrics,
}

impl RetryController {
    pub(crate) fn new(
        resolver: Arc<dyn LocationResolver>,
        policy: RetryPolicy,
        metrics: BatchMetrics,
    ) -> Self {
        Self {
            resolver,
            policy,
            metrics,
        }
    }

    /// Classify `cause` for `op`, counting the attempt if it is retryable.
    pub(crate) fn decide(&self, op: &PendingOp, cause: &FailureCause) -> Decision {
        let kind = cause.kind();
        if kind == FailureKind::NonRetryable {
            return Decision::Fail(Rejection::NonRetryable(cause.clone()).into());
        }

        let attempts = op.op().record_attempt();
        if attempts >= self.policy.max_attempts.get() {
            return Decision::Fail(Error::RetriesExhausted {
                attempts,
                last_cause: cause.clone(),
            });
        }

        self.metrics.record_retry(kind);
        if kind == FailureKind::StaleLocation {
            Decision::Requeue
        } else {
            Decision::Resend(self.policy.backoff(attempts))
        }
    }

    /// Settle operations that cannot be retried and split the rest into
    /// re-routes and re-sends.
    ///
    /// If any failure shows `destination` is stale, its region is
    /// invalidated once for the whole batch.
    pub(crate) fn plan(
        &self,
        destination: &Destination,
        failures: Vec<(PendingOp, FailureCause)>,
    ) -> RetryPlan {
        let mut plan = RetryPlan::default();
        let mut invalidated = false;

        for (op, cause) in failures {
            match self.decide(&op, &cause) {
                Decision::Requeue => {
                    if !invalidated {
                        warn!(
                            %destination,
                            error=%cause,
                            "stale region location, re-routing operations"
                        );
                        self.resolver.invalidate(&destination.region);
                        invalidated = true;
                    }
                    plan.requeue.push(op);
                }
                Decision::Resend(delay) => {
                    let (ops, max_delay) = plan.resend.get_or_insert_with(|| {
                        warn!(
                            %destination,
                            error=%cause,
                            attempts = op.op().attempts(),
                            ?delay,
                            "transient failure, re-sending operations"
                        );
                        (vec![], delay)
                    });
                    *max_delay = (*max_delay).max(delay);
                    ops.push(op);
                }
                Decision::Fail(e) => self.fail(op, e),
            }
        }

        plan
    }

    /// Settle `op` with the terminal error `e`.
    pub(crate) fn fail(&self, op: PendingOp, e: Error) {
        error!(
            table = %String::from_utf8_lossy(op.op().rpc().table()),
            row = %String::from_utf8_lossy(op.op().rpc().row()),
            method = %op.op().rpc().method(),
            error = %e,
            "operation failed"
        );
        self.metrics.record_failure(&e);
        op.settle(Err(e));
    }
}
