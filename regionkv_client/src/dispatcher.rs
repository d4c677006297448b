use std::sync::Arc;

use iox_time::TimeProvider;
use observability_deps::tracing::debug;

use crate::{
    error::FailureCause,
    location::Destination,
    metrics::BatchMetrics,
    operation::PendingOp,
    transport::{MultiAction, RegionTransport, TransportError},
};

/// Sends one consolidated request per batch and settles the actions that
/// succeeded.
#[derive(Debug)]
pub(crate) struct BatchDispatcher {
    transport: Arc<dyn RegionTransport>,
    metrics: BatchMetrics,
    time_provider: Arc<dyn TimeProvider>,
}

impl BatchDispatcher {
    pub(crate) fn new(
        transport: Arc<dyn RegionTransport>,
        metrics: BatchMetrics,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            transport,
            metrics,
            time_provider,
        }
    }

    /// Send `ops` to `destination` as a single request.
    ///
    /// Every operation whose action succeeded is settled. The rest are
    /// returned with the reason they failed, in their original order; a
    /// failure of the request as a whole fails every operation.
    pub(crate) async fn send(
        &self,
        destination: &Destination,
        ops: Vec<PendingOp>,
    ) -> Vec<(PendingOp, FailureCause)> {
        let n_ops = ops.len();
        let request = MultiAction {
            region: destination.region.clone(),
            actions: ops.iter().map(|p| p.op().clone()).collect(),
        };

        let t = self.time_provider.now();
        let res = self.transport.send(&destination.server, request).await;
        let elapsed = self.time_provider.now().checked_duration_since(t);

        let outcomes = match res {
            Ok(resp) if resp.outcomes.len() == n_ops => resp.outcomes,
            Ok(resp) => {
                self.metrics.record_send(n_ops, elapsed, false);
                let cause = FailureCause::from(TransportError::MalformedResponse {
                    expected: n_ops,
                    actual: resp.outcomes.len(),
                });
                return fail_all(ops, cause);
            }
            Err(e) => {
                self.metrics.record_send(n_ops, elapsed, false);
                debug!(%destination, n_ops, error=%e, "consolidated request failed");
                return fail_all(ops, e.into());
            }
        };

        let mut failed = vec![];
        for (op, outcome) in ops.into_iter().zip(outcomes) {
            match outcome {
                Ok(v) => {
                    self.metrics.record_success();
                    op.settle(Ok(v));
                }
                Err(e) => failed.push((op, e.into())),
            }
        }

        self.metrics
            .record_send(n_ops, elapsed, failed.is_empty());
        debug!(
            %destination,
            n_ops,
            n_failed = failed.len(),
            "consolidated request complete"
        );

        failed
    }
}

fn fail_all(ops: Vec<PendingOp>, cause: FailureCause) -> Vec<(PendingOp, FailureCause)> {
    ops.into_iter().map(|op| (op, cause.clone())).collect()
}
