//! Region placement: where a row lives and how the batching core asks.

use std::{
    fmt::{Debug, Display},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Network address of a region server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerAddr(Arc<str>);

impl ServerAddr {
    pub fn new(addr: impl Into<Arc<str>>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ServerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a region as handed out by a [`LocationResolver`].
///
/// The `epoch` changes every time the region is reassigned, split or merged,
/// so two identities for the same region name compare unequal once the
/// placement has moved on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegionId {
    name: Bytes,
    epoch: u64,
}

impl RegionId {
    pub fn new(name: impl Into<Bytes>, epoch: u64) -> Self {
        Self {
            name: name.into(),
            epoch,
        }
    }

    pub fn name(&self) -> &Bytes {
        &self.name
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Display for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", String::from_utf8_lossy(&self.name), self.epoch)
    }
}

/// The answer to a location lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionLocation {
    pub region: RegionId,
    pub server: ServerAddr,
}

/// The batching key: every operation queued for a [`Destination`] is sent in
/// the same consolidated request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub region: RegionId,
    pub server: ServerAddr,
}

impl From<RegionLocation> for Destination {
    fn from(location: RegionLocation) -> Self {
        Self {
            region: location.region,
            server: location.server,
        }
    }
}

impl Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.server, self.region)
    }
}

/// Errors returned by a [`LocationResolver`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// The table does not exist; retrying will not help.
    #[error("table {0:?} not found")]
    TableNotFound(String),

    /// The location service could not answer right now.
    #[error("location lookup unavailable: {0}")]
    Unavailable(String),
}

/// Maps `(table, row)` to the region currently serving it.
///
/// Implementations are expected to cache; answers may be stale, which the
/// batching core detects from region server responses and corrects through
/// [`LocationResolver::invalidate`].
#[async_trait]
pub trait LocationResolver: Debug + Send + Sync {
    /// Return the region and server currently believed to own `row`.
    ///
    /// May perform a network lookup on a cache miss.
    async fn resolve(&self, table: &Bytes, row: &Bytes) -> Result<RegionLocation, ResolveError>;

    /// Drop any cached placement for `region` so the next
    /// [`resolve`](LocationResolver::resolve) goes back to the source.
    fn invalidate(&self, region: &RegionId);
}
