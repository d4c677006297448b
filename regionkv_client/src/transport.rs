//! The wire boundary: one consolidated request per destination.

use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::{
    location::{RegionId, ServerAddr},
    operation::Operation,
};

/// A consolidated request carrying every action for a single region.
///
/// The batching core guarantees all `actions` resolved to `region` on the
/// server the request is sent to.
#[derive(Debug, Clone)]
pub struct MultiAction {
    pub region: RegionId,
    pub actions: Vec<Operation>,
}

impl MultiAction {
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Per-action outcomes of a [`MultiAction`], positionally matching its
/// `actions`.
#[derive(Debug, Clone, Default)]
pub struct MultiResponse {
    pub outcomes: Vec<Result<Bytes, ServerError>>,
}

impl MultiResponse {
    /// A response where each of the `n` actions succeeded with an empty
    /// result.
    pub fn all_ok(n: usize) -> Self {
        Self {
            outcomes: vec![Ok(Bytes::new()); n],
        }
    }
}

/// A failure reported by the region server for a single action.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServerError {
    #[error("region is not served by this server")]
    NotServingRegion,

    #[error("region has moved")]
    RegionMoved,

    #[error("region is too busy, try again later")]
    RegionTooBusy,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("action failed: {0}")]
    Failed(String),
}

/// A failure of the whole consolidated request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The connection broke or could not be established.
    #[error("connection to {server} failed: {reason}")]
    Connection { server: ServerAddr, reason: String },

    /// The server is gone, typically because it died and its regions are
    /// being reassigned.
    #[error("region server {server} is unreachable")]
    ServerUnreachable { server: ServerAddr },

    /// The server refused the request as a whole.
    #[error("region server {server} rejected the request: {reason}")]
    Rejected { server: ServerAddr, reason: String },

    /// The response did not carry one outcome per action.
    #[error("malformed multi-action response: expected {expected} outcomes, got {actual}")]
    MalformedResponse { expected: usize, actual: usize },
}

/// Sends consolidated requests to region servers.
///
/// Encoding the individual actions and managing connections is entirely up
/// to the implementation.
#[async_trait]
pub trait RegionTransport: Debug + Send + Sync {
    /// Send `request` to `server` and wait for its response.
    async fn send(
        &self,
        server: &ServerAddr,
        request: MultiAction,
    ) -> Result<MultiResponse, TransportError>;
}
