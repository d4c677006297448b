//! Submitted units of work and their completion handles.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    task::{Context, Poll},
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio_util::task::{TaskTracker, task_tracker::TaskTrackerToken};

use crate::{
    error::{Error, Rejection, Result},
    rpc::BatchableRpc,
};

#[derive(Debug, Clone, Copy)]
struct Eligibility {
    bufferable: bool,
    submitted: bool,
}

#[derive(Debug)]
struct Inner {
    rpc: Box<dyn BatchableRpc>,
    eligibility: Mutex<Eligibility>,
    attempts: AtomicU32,
}

/// A single addressed mutation.
///
/// Cloning is cheap and every clone refers to the same operation, so a caller
/// can keep a handle to inspect [`attempts`](Self::attempts) after handing a
/// clone to [`BatchingClient::submit`](crate::BatchingClient::submit).
#[derive(Debug, Clone)]
pub struct Operation {
    inner: Arc<Inner>,
}

impl Operation {
    pub fn new(rpc: impl BatchableRpc) -> Self {
        Self {
            inner: Arc::new(Inner {
                rpc: Box::new(rpc),
                eligibility: Mutex::new(Eligibility {
                    bufferable: true,
                    submitted: false,
                }),
                attempts: AtomicU32::new(0),
            }),
        }
    }

    pub fn rpc(&self) -> &dyn BatchableRpc {
        self.inner.rpc.as_ref()
    }

    /// Sets whether this operation may be delayed in a client-side buffer and
    /// sent together with others. The default is `true`.
    ///
    /// Passing `false` makes the operation bypass buffering entirely and go
    /// straight to its region server on submission. Eligibility is decided
    /// once: after submission this returns [`Rejection::AlreadyBuffered`].
    pub fn set_bufferable(&self, bufferable: bool) -> Result<()> {
        let mut eligibility = self.inner.eligibility.lock();
        if eligibility.submitted {
            return Err(Rejection::AlreadyBuffered.into());
        }
        eligibility.bufferable = bufferable;
        Ok(())
    }

    /// Returns whether it is OK to buffer this operation on the client side.
    pub fn can_buffer(&self) -> bool {
        self.inner.eligibility.lock().bufferable
    }

    pub fn is_submitted(&self) -> bool {
        self.inner.eligibility.lock().submitted
    }

    /// Number of failed attempts that were retried or exhausted the retry
    /// budget.
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::Acquire)
    }

    /// Freeze the buffer eligibility; fails if this operation was submitted
    /// before.
    pub(crate) fn mark_submitted(&self) -> Result<()> {
        let mut eligibility = self.inner.eligibility.lock();
        if eligibility.submitted {
            return Err(Rejection::AlreadySubmitted.into());
        }
        eligibility.submitted = true;
        Ok(())
    }

    /// Count one more attempt, returning the new total.
    pub(crate) fn record_attempt(&self) -> u32 {
        self.inner.attempts.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// A submitted operation together with the sender half of its completion
/// handle.
///
/// Settling consumes the value, so an operation settles at most once; every
/// code path that drops a `PendingOp` without settling it is a bug.
///
/// Flushes waiting on this operation hold a token in `flushes`, released
/// after the handle is resolved.
#[derive(Debug)]
pub(crate) struct PendingOp {
    op: Operation,
    size: usize,
    tx: oneshot::Sender<Result<Bytes>>,
    flushes: Vec<TaskTrackerToken>,
}

impl PendingOp {
    pub(crate) fn new(op: Operation, tx: oneshot::Sender<Result<Bytes>>) -> Self {
        let size = op.rpc().payload_size();
        Self {
            op,
            size,
            tx,
            flushes: vec![],
        }
    }

    pub(crate) fn op(&self) -> &Operation {
        &self.op
    }

    /// Bytes this operation contributes to buffer accounting.
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Resolve the caller's [`CompletionHandle`]. Returns `false` if the
    /// caller already stopped waiting.
    pub(crate) fn settle(self, result: Result<Bytes>) -> bool {
        let Self { tx, flushes, .. } = self;
        let delivered = tx.send(result).is_ok();
        drop(flushes);
        delivered
    }

    /// Keep `flush` waiting until this operation settles, wherever it is
    /// routed in the meantime.
    pub(crate) fn track(&mut self, flush: &TaskTracker) {
        self.flushes.push(flush.token());
    }
}

/// Resolves to the outcome of a submitted [`Operation`].
///
/// Dropping the handle does not cancel the operation; it is still sent and
/// retried, its outcome is just not observed.
#[derive(Debug)]
pub struct CompletionHandle {
    rx: oneshot::Receiver<Result<Bytes>>,
}

impl CompletionHandle {
    pub(crate) fn new(rx: oneshot::Receiver<Result<Bytes>>) -> Self {
        Self { rx }
    }

    /// Returns the outcome if the operation has settled, without waiting.
    ///
    /// The outcome can only be taken once; afterwards the handle reports
    /// [`Rejection::Abandoned`].
    pub fn try_settled(&mut self) -> Option<Result<Bytes>> {
        match self.rx.try_recv() {
            Ok(v) => Some(v),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(Rejection::Abandoned.into())),
        }
    }
}

impl Future for CompletionHandle {
    type Output = Result<Bytes>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or_else(|_| Err(Error::Rejected(Rejection::Abandoned))))
    }
}
