//! Mutation requests that may be coalesced into multi-action batches.

use std::fmt::{Debug, Display};

use bytes::Bytes;

/// The kind of mutation a [`BatchableRpc`] performs on the region server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Put,
    Delete,
    AtomicIncrement,
    Append,
}

impl Method {
    /// The method name as carried on the wire.
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Self::Put => b"put",
            Self::Delete => b"delete",
            Self::AtomicIncrement => b"atomicIncrement",
            Self::Append => b"append",
        }
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Put => write!(f, "put"),
            Self::Delete => write!(f, "delete"),
            Self::AtomicIncrement => write!(f, "atomic_increment"),
            Self::Append => write!(f, "append"),
        }
    }
}

/// The capability the batching core needs from a request: where it goes and
/// roughly how large it is.
///
/// The payload itself is opaque to the batching core; encoding it is the
/// responsibility of the [`RegionTransport`] implementation.
///
/// [`RegionTransport`]: crate::transport::RegionTransport
pub trait BatchableRpc: Debug + Send + Sync + 'static {
    /// The mutation kind.
    fn method(&self) -> Method;

    /// The table this request is addressed to.
    fn table(&self) -> &Bytes;

    /// The row key, used to resolve the owning region.
    fn row(&self) -> &Bytes;

    /// The column family, empty when the request spans the whole row.
    fn family(&self) -> &Bytes;

    /// Approximate number of bytes this request adds to a consolidated
    /// request, used for buffer capacity accounting.
    fn payload_size(&self) -> usize;
}

/// Store `value` in the cell at `table/row/family:qualifier`.
#[derive(Debug, Clone)]
pub struct PutRequest {
    table: Bytes,
    row: Bytes,
    family: Bytes,
    qualifier: Bytes,
    value: Bytes,
    timestamp: Option<u64>,
}

impl PutRequest {
    pub fn new(
        table: impl Into<Bytes>,
        row: impl Into<Bytes>,
        family: impl Into<Bytes>,
        qualifier: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Self {
        Self {
            table: table.into(),
            row: row.into(),
            family: family.into(),
            qualifier: qualifier.into(),
            value: value.into(),
            timestamp: None,
        }
    }

    /// Write the cell with an explicit timestamp instead of the server time.
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn qualifier(&self) -> &Bytes {
        &self.qualifier
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn timestamp(&self) -> Option<u64> {
        self.timestamp
    }
}

impl BatchableRpc for PutRequest {
    fn method(&self) -> Method {
        Method::Put
    }

    fn table(&self) -> &Bytes {
        &self.table
    }

    fn row(&self) -> &Bytes {
        &self.row
    }

    fn family(&self) -> &Bytes {
        &self.family
    }

    fn payload_size(&self) -> usize {
        self.row.len()
            + self.family.len()
            + self.qualifier.len()
            + self.value.len()
            + std::mem::size_of::<u64>()
    }
}

/// Delete cells from a row.
///
/// With no family the whole row is deleted; with a family but no qualifiers
/// the whole family is deleted.
#[derive(Debug, Clone)]
pub struct DeleteRequest {
    table: Bytes,
    row: Bytes,
    family: Bytes,
    qualifiers: Vec<Bytes>,
}

impl DeleteRequest {
    /// Delete the entire `row`.
    pub fn whole_row(table: impl Into<Bytes>, row: impl Into<Bytes>) -> Self {
        Self {
            table: table.into(),
            row: row.into(),
            family: Bytes::new(),
            qualifiers: vec![],
        }
    }

    /// Delete the given `qualifiers` of `family` in `row`.
    pub fn cells(
        table: impl Into<Bytes>,
        row: impl Into<Bytes>,
        family: impl Into<Bytes>,
        qualifiers: impl IntoIterator<Item = Bytes>,
    ) -> Self {
        Self {
            table: table.into(),
            row: row.into(),
            family: family.into(),
            qualifiers: qualifiers.into_iter().collect(),
        }
    }

    pub fn qualifiers(&self) -> &[Bytes] {
        &self.qualifiers
    }
}

impl BatchableRpc for DeleteRequest {
    fn method(&self) -> Method {
        Method::Delete
    }

    fn table(&self) -> &Bytes {
        &self.table
    }

    fn row(&self) -> &Bytes {
        &self.row
    }

    fn family(&self) -> &Bytes {
        &self.family
    }

    fn payload_size(&self) -> usize {
        self.row.len()
            + self.family.len()
            + self.qualifiers.iter().map(Bytes::len).sum::<usize>()
    }
}

/// Atomically add `amount` to the 64-bit counter stored in a cell.
#[derive(Debug, Clone)]
pub struct AtomicIncrementRequest {
    table: Bytes,
    row: Bytes,
    family: Bytes,
    qualifier: Bytes,
    amount: i64,
}

impl AtomicIncrementRequest {
    pub fn new(
        table: impl Into<Bytes>,
        row: impl Into<Bytes>,
        family: impl Into<Bytes>,
        qualifier: impl Into<Bytes>,
        amount: i64,
    ) -> Self {
        Self {
            table: table.into(),
            row: row.into(),
            family: family.into(),
            qualifier: qualifier.into(),
            amount,
        }
    }

    pub fn qualifier(&self) -> &Bytes {
        &self.qualifier
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }
}

impl BatchableRpc for AtomicIncrementRequest {
    fn method(&self) -> Method {
        Method::AtomicIncrement
    }

    fn table(&self) -> &Bytes {
        &self.table
    }

    fn row(&self) -> &Bytes {
        &self.row
    }

    fn family(&self) -> &Bytes {
        &self.family
    }

    fn payload_size(&self) -> usize {
        self.row.len() + self.family.len() + self.qualifier.len() + std::mem::size_of::<i64>()
    }
}

/// Append `value` to the current contents of a cell.
#[derive(Debug, Clone)]
pub struct AppendRequest {
    table: Bytes,
    row: Bytes,
    family: Bytes,
    qualifier: Bytes,
    value: Bytes,
}

impl AppendRequest {
    pub fn new(
        table: impl Into<Bytes>,
        row: impl Into<Bytes>,
        family: impl Into<Bytes>,
        qualifier: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Self {
        Self {
            table: table.into(),
            row: row.into(),
            family: family.into(),
            qualifier: qualifier.into(),
            value: value.into(),
        }
    }

    pub fn qualifier(&self) -> &Bytes {
        &self.qualifier
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }
}

impl BatchableRpc for AppendRequest {
    fn method(&self) -> Method {
        Method::Append
    }

    fn table(&self) -> &Bytes {
        &self.table
    }

    fn row(&self) -> &Bytes {
        &self.row
    }

    fn family(&self) -> &Bytes {
        &self.family
    }

    fn payload_size(&self) -> usize {
        self.row.len() + self.family.len() + self.qualifier.len() + self.value.len()
    }
}
