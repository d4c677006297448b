//! The batching client: accepts operations, groups them per destination and
//! drives each batch to completion.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures::{FutureExt, future::BoxFuture};
use iox_time::TimeProvider;
use metric::Registry;
use observability_deps::tracing::{debug, error, info, warn};
use regionkv_clap_blocks::batching::BatchingConfig;
use tokio::{sync::oneshot, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    batch::Batch,
    buffer::BufferLimits,
    dispatcher::BatchDispatcher,
    error::{Error, FailureCause, Rejection},
    location::{Destination, LocationResolver},
    metrics::{BatchMetrics, FlushTrigger},
    operation::{CompletionHandle, Operation, PendingOp},
    registry::BufferRegistry,
    retry::{Decision, RetryController, RetryPolicy},
    scheduler::{FlushScheduler, FlushTarget, run_flush_timer},
    transport::RegionTransport,
};

/// Runtime configuration of a [`BatchingClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    /// Period of the flush timer; zero disables it.
    pub flush_interval: Duration,
    pub limits: BufferLimits,
    /// How long an empty destination buffer is kept before it is released.
    pub buffer_idle_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(1),
            limits: BufferLimits::default(),
            buffer_idle_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&BatchingConfig> for ClientConfig {
    fn from(config: &BatchingConfig) -> Self {
        Self {
            flush_interval: config.flush_interval,
            limits: BufferLimits {
                max_operations: config.buffer_max_operations,
                max_bytes: config.buffer_max_bytes,
            },
            buffer_idle_timeout: config.buffer_idle_timeout,
            retry: RetryPolicy {
                max_attempts: config.max_attempts,
                initial_backoff: config.retry_initial_backoff,
                max_backoff: config.retry_max_backoff,
                ..Default::default()
            },
        }
    }
}

#[derive(Debug)]
pub struct BatchingClientArgs {
    pub resolver: Arc<dyn LocationResolver>,
    pub transport: Arc<dyn RegionTransport>,
    pub time_provider: Arc<dyn TimeProvider>,
    pub metric_registry: Arc<Registry>,
    pub config: ClientConfig,
}

/// Buffers operations per destination and sends each buffer as a single
/// consolidated request.
///
/// Buffers are flushed when the periodic timer fires, when a buffer reaches
/// its capacity, or on [`flush_all`](Self::flush_all). Operations that are
/// not bufferable are sent on their own as soon as they are routed.
///
/// # Ordering
///
/// Operations for the same row go on the wire in submission order while
/// they stay in one destination buffer. Two cases reorder them relative to
/// later operations on that row:
///
/// * an operation re-routed after a stale location is queued behind
///   whatever already sits in its new buffer;
/// * after a partial failure only the failed operations are re-sent, so an
///   operation rejected with a transient error is applied after later
///   operations of the same batch that succeeded.
///
/// Dropping the client stops the timer and sends whatever is still
/// buffered; call [`shutdown`](Self::shutdown) to also wait for every
/// operation to settle.
#[derive(Debug)]
pub struct BatchingClient {
    inner: Arc<ClientInner>,
}

impl BatchingClient {
    /// Create a client and start its flush timer.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(args: BatchingClientArgs) -> Self {
        let BatchingClientArgs {
            resolver,
            transport,
            time_provider,
            metric_registry,
            config,
        } = args;

        let metrics = BatchMetrics::new(&metric_registry);
        let inner = Arc::new(ClientInner {
            registry: BufferRegistry::new(config.limits, Arc::clone(&time_provider)),
            dispatcher: BatchDispatcher::new(transport, metrics.clone(), time_provider),
            retry: RetryController::new(Arc::clone(&resolver), config.retry, metrics.clone()),
            scheduler: FlushScheduler::new(config.flush_interval),
            resolver,
            metrics,
            idle_timeout: config.buffer_idle_timeout,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });

        inner.tasks.spawn(run_flush_timer(
            Arc::downgrade(&inner),
            inner.scheduler.subscribe(),
            inner.shutdown.clone(),
        ));

        Self { inner }
    }

    /// Accept `op` and return a handle that resolves to its outcome.
    ///
    /// This only waits for the operation's location to be resolved; the
    /// operation is then either queued in its destination's buffer or, if it
    /// is not bufferable, sent straight away. An operation can be submitted
    /// once.
    pub async fn submit(&self, op: Operation) -> CompletionHandle {
        let (tx, rx) = oneshot::channel();
        let handle = CompletionHandle::new(rx);

        // Held until the operation is queued or in flight so shutdown waits
        // for it.
        let _token = self.inner.tasks.token();

        if self.inner.shutdown.is_cancelled() {
            let e = Error::from(Rejection::ShuttingDown);
            self.inner.metrics.record_failure(&e);
            let _ = tx.send(Err(e));
            return handle;
        }

        if let Err(e) = op.mark_submitted() {
            self.inner.metrics.record_failure(&e);
            let _ = tx.send(Err(e));
            return handle;
        }

        self.inner.metrics.record_submitted(op.can_buffer());
        self.inner.route(PendingOp::new(op, tx)).await;
        handle
    }

    /// Change how often buffers are flushed, returning the previous
    /// interval. A zero interval disables the timer.
    pub fn set_flush_interval(&self, interval: Duration) -> Duration {
        self.inner.scheduler.set_interval(interval)
    }

    pub fn flush_interval(&self) -> Duration {
        self.inner.scheduler.interval()
    }

    /// Send everything currently buffered.
    ///
    /// The buffers are drained before this returns. The returned handle
    /// completes once every drained operation has settled, including those
    /// that had to be re-routed to a new destination.
    pub fn flush_all(&self) -> FlushHandle {
        let flush = TaskTracker::new();
        for mut batch in self.inner.registry.drain_all(FlushTrigger::Explicit) {
            batch.track(&flush);
            self.inner.dispatch(batch);
        }
        flush.close();

        FlushHandle(self.inner.tasks.spawn(async move { flush.wait().await }))
    }

    /// Number of operations queued and not yet sent.
    pub fn buffered_operations(&self) -> usize {
        self.inner.registry.buffered_operations()
    }

    /// Stop accepting operations, flush every buffer and wait for all
    /// outstanding operations to settle.
    ///
    /// Operations submitted after this is called are rejected with
    /// [`Rejection::ShuttingDown`].
    pub async fn shutdown(&self) {
        info!("shutting down batching client");
        self.inner.shutdown.cancel();
        self.inner.tasks.close();

        // Wait for in-flight submissions and batches, which may queue more.
        self.inner.tasks.wait().await;
        while self.inner.registry.buffered_operations() > 0 {
            self.flush_all().await;
        }
        self.inner.tasks.wait().await;

        info!("batching client shut down");
    }
}

impl Drop for BatchingClient {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
        if tokio::runtime::Handle::try_current().is_ok() {
            self.inner.drain_all(FlushTrigger::Explicit);
        }
    }
}

/// Completes once every operation drained by
/// [`BatchingClient::flush_all`] has settled.
#[derive(Debug)]
pub struct FlushHandle(JoinHandle<()>);

impl Future for FlushHandle {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(|res| {
            if let Err(e) = res {
                error!(error=%e, "flush task failed");
            }
        })
    }
}

#[derive(Debug)]
struct ClientInner {
    resolver: Arc<dyn LocationResolver>,
    registry: BufferRegistry,
    dispatcher: BatchDispatcher,
    retry: RetryController,
    scheduler: FlushScheduler,
    metrics: BatchMetrics,
    idle_timeout: Duration,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl ClientInner {
    /// Resolve the destination of `op`, retrying transient lookup failures.
    ///
    /// Settles `op` and returns `None` if it cannot be located.
    async fn locate(&self, op: PendingOp) -> Option<(Destination, PendingOp)> {
        loop {
            let rpc = op.op().rpc();
            let res = self.resolver.resolve(rpc.table(), rpc.row()).await;
            let cause = match res {
                Ok(location) => return Some((location.into(), op)),
                Err(e) => FailureCause::from(e),
            };

            match self.retry.decide(&op, &cause) {
                Decision::Resend(delay) => {
                    warn!(
                        error=%cause,
                        attempts = op.op().attempts(),
                        ?delay,
                        "location lookup failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Decision::Requeue => {}
                Decision::Fail(e) => {
                    self.retry.fail(op, e);
                    return None;
                }
            }
        }
    }

    /// Route a newly submitted operation: queue it, or send it on its own if
    /// it must not be buffered.
    async fn route(self: &Arc<Self>, op: PendingOp) {
        let Some((destination, op)) = self.locate(op).await else {
            return;
        };

        if !op.op().can_buffer() {
            self.dispatch(Batch::unbuffered(destination, op));
            return;
        }

        if let Some(batch) = self.registry.append(&destination, op) {
            self.dispatch(batch);
        }
    }

    /// Route operations whose destination went stale, then immediately flush
    /// the buffers they landed in.
    ///
    /// Any flush waiting on these operations keeps waiting whichever batch
    /// ends up carrying them.
    async fn reroute(self: &Arc<Self>, ops: Vec<PendingOp>) {
        let mut touched: Vec<Destination> = vec![];

        for op in ops {
            let Some((destination, op)) = self.locate(op).await else {
                continue;
            };

            if !op.op().can_buffer() {
                self.dispatch(Batch::unbuffered(destination, op));
                continue;
            }

            if !touched.contains(&destination) {
                touched.push(destination.clone());
            }
            if let Some(batch) = self.registry.append(&destination, op) {
                self.dispatch(batch);
            }
        }

        for destination in touched {
            if let Some(batch) = self.registry.drain(&destination, FlushTrigger::Requeue) {
                self.dispatch(batch);
            }
        }
    }

    fn drain_all(self: &Arc<Self>, trigger: FlushTrigger) {
        for batch in self.registry.drain_all(trigger) {
            self.dispatch(batch);
        }
    }

    fn dispatch(self: &Arc<Self>, batch: Batch) {
        debug!(
            destination = %batch.destination(),
            n_ops = batch.len(),
            trigger = ?batch.trigger(),
            "dispatching batch"
        );
        self.metrics.record_batch(batch.trigger());
        self.tasks.spawn(Arc::clone(self).run_batch(batch));
    }

    /// Send `batch`, re-sending after transient failures, and re-route
    /// operations whose destination turned out to be stale.
    ///
    /// Batches drained from the same buffer are sent one after another in
    /// drain order.
    fn run_batch(self: Arc<Self>, batch: Batch) -> BoxFuture<'static, ()> {
        async move {
            let (destination, mut ops, ticket) = batch.into_parts();
            if let Some(ticket) = &ticket {
                ticket.wait_turn().await;
            }

            let mut requeue = vec![];
            loop {
                let failed = self.dispatcher.send(&destination, ops).await;
                if failed.is_empty() {
                    break;
                }

                let plan = self.retry.plan(&destination, failed);
                requeue.extend(plan.requeue);
                let Some((resend, delay)) = plan.resend else {
                    break;
                };
                tokio::time::sleep(delay).await;
                ops = resend;
            }

            // Re-routed before releasing the ticket, so they are queued ahead
            // of later batches from the same buffer.
            if !requeue.is_empty() {
                debug!(%destination, n_ops = requeue.len(), "re-routing operations");
                self.reroute(requeue).await;
            }
            drop(ticket);
        }
        .boxed()
    }
}

impl FlushTarget for ClientInner {
    fn flush_tick(self: Arc<Self>) {
        self.drain_all(FlushTrigger::Interval);
        self.registry.evict_idle(self.idle_timeout);
    }
}
