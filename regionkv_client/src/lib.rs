//! Client-side batching of writes to a region-partitioned key-value store.
//!
//! Operations submitted to a [`BatchingClient`] are routed to the region
//! that currently serves their row, queued per destination and sent as one
//! consolidated request per destination. Each operation settles exactly once
//! through its [`CompletionHandle`].
//!
//! # Flushing
//!
//! A destination buffer is flushed when the periodic timer fires, when it
//! reaches its [`BufferLimits`], or when [`BatchingClient::flush_all`] is
//! called. Operations marked non-bufferable with
//! [`Operation::set_bufferable`] skip the buffers entirely.
//!
//! # Failures
//!
//! A failed action is classified by [`FailureCause::kind`]:
//!
//! * [`FailureKind::StaleLocation`]: the region is invalidated in the
//!   [`LocationResolver`] and the operation is routed again.
//! * [`FailureKind::TransientTransport`]: the operation is sent again to the
//!   same destination after a [`RetryPolicy`] backoff.
//! * [`FailureKind::NonRetryable`]: the operation fails immediately.
//!
//! An operation is sent at most [`RetryPolicy::max_attempts`] times.

mod batch;
mod buffer;
mod client;
mod dispatcher;
mod error;
mod location;
mod metrics;
mod operation;
mod registry;
mod retry;
mod rpc;
mod scheduler;
mod transport;

pub use buffer::BufferLimits;
pub use client::{BatchingClient, BatchingClientArgs, ClientConfig, FlushHandle};
pub use error::{Error, FailureCause, FailureKind, Rejection, Result};
pub use location::{
    Destination, LocationResolver, RegionId, RegionLocation, ResolveError, ServerAddr,
};
pub use operation::{CompletionHandle, Operation};
pub use retry::RetryPolicy;
pub use rpc::{
    AppendRequest, AtomicIncrementRequest, BatchableRpc, DeleteRequest, Method, PutRequest,
};
pub use transport::{MultiAction, MultiResponse, RegionTransport, ServerError, TransportError};
