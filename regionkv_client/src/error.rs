//! Error types surfaced through completion handles, and the classification
//! that drives retries.

use thiserror::Error;

use crate::{
    location::ResolveError,
    transport::{ServerError, TransportError},
};

/// How a failure is recovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The cached placement is out of date: invalidate, re-resolve and
    /// re-route.
    StaleLocation,
    /// The destination is valid but the request did not get through: back off
    /// and re-send to the same destination.
    TransientTransport,
    /// Retrying cannot help.
    NonRetryable,
}

/// The underlying reason an attempt failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FailureCause {
    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

impl FailureCause {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Server(ServerError::NotServingRegion | ServerError::RegionMoved) => {
                FailureKind::StaleLocation
            }
            Self::Server(ServerError::RegionTooBusy) => FailureKind::TransientTransport,
            Self::Server(ServerError::PermissionDenied(_) | ServerError::Failed(_)) => {
                FailureKind::NonRetryable
            }
            Self::Transport(TransportError::ServerUnreachable { .. }) => {
                FailureKind::StaleLocation
            }
            Self::Transport(TransportError::Connection { .. }) => FailureKind::TransientTransport,
            Self::Transport(
                TransportError::Rejected { .. } | TransportError::MalformedResponse { .. },
            ) => FailureKind::NonRetryable,
            Self::Resolve(ResolveError::Unavailable(_)) => FailureKind::TransientTransport,
            Self::Resolve(ResolveError::TableNotFound(_)) => FailureKind::NonRetryable,
        }
    }
}

/// Why an operation was refused without being retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("operation is already buffered, buffer eligibility is fixed at submission")]
    AlreadyBuffered,

    #[error("operation has already been submitted")]
    AlreadySubmitted,

    #[error("client is shutting down")]
    ShuttingDown,

    #[error("operation was dropped by the client before it settled")]
    Abandoned,

    #[error("non-retryable failure: {0}")]
    NonRetryable(#[source] FailureCause),
}

/// Terminal failure of an operation, as observed through its
/// [`CompletionHandle`](crate::CompletionHandle).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("retries exhausted after {attempts} attempts, last error: {last_cause}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last_cause: FailureCause,
    },

    #[error("operation rejected: {0}")]
    Rejected(#[from] Rejection),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
