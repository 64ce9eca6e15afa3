//! Contract for the underlying full-text index engine.
//!
//! The ingest pipeline treats the engine as an opaque collaborator: it
//! applies atomic batches (data writes plus internal-key writes), exposes
//! an internal key-value space for opaque metadata, and answers searches.
//! [`memory::MemoryEngine`] is the reference implementation.

pub mod memory;

pub use memory::MemoryEngine;

use bytes::Bytes;

use crate::error::Result;
use crate::models::{SearchRequest, SearchResponse};

/// One operation inside an atomic batch.
#[derive(Clone, Debug)]
pub enum BatchOp {
    Index { key: String, value: Bytes },
    Delete { key: String },
    SetInternal { key: Bytes, value: Bytes },
}

/// An ordered set of mutations committed atomically by [`IndexEngine::apply_batch`].
///
/// Tracks the accumulated value bytes of its index ops so callers can
/// apply a size-based flush policy.
#[derive(Debug, Default)]
pub struct EngineBatch {
    ops: Vec<BatchOp>,
    value_bytes: usize,
}

impl EngineBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index(&mut self, key: impl Into<String>, value: Bytes) {
        self.value_bytes += value.len();
        self.ops.push(BatchOp::Index {
            key: key.into(),
            value,
        });
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.ops.push(BatchOp::Delete { key: key.into() });
    }

    pub fn set_internal(&mut self, key: Bytes, value: Bytes) {
        self.ops.push(BatchOp::SetInternal { key, value });
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Total bytes of index-op values buffered in this batch.
    pub fn value_bytes(&self) -> usize {
        self.value_bytes
    }
}

/// The underlying full-text index, shared by all partitions of a shard.
///
/// Implementations must accept concurrent `apply_batch` calls; per
/// partition they are serialized upstream.
pub trait IndexEngine: Send + Sync {
    /// Atomically commit the batch, including its set-internal ops.
    /// On error, no op of the batch may be visible.
    fn apply_batch(&self, batch: &EngineBatch) -> Result<()>;

    /// Read an internal key; `None` when the key was never written.
    fn get_internal(&self, key: &[u8]) -> Result<Option<Bytes>>;

    fn doc_count(&self) -> Result<u64>;

    fn search(&self, req: &SearchRequest) -> Result<SearchResponse>;

    fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_accounting() {
        let mut batch = EngineBatch::new();
        assert!(batch.is_empty());

        batch.index("k1", Bytes::from_static(b"hello"));
        batch.delete("k2");
        batch.set_internal(Bytes::from_static(b"0"), Bytes::from_static(b"meta"));

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.value_bytes(), 5);
        assert!(matches!(batch.ops()[1], BatchOp::Delete { .. }));
    }
}
