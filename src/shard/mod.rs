//! A shard is one local full-text index instance housing many partitions
//! of an ordered change stream.
//!
//! The shard owns the engine handle and the partition map behind a single
//! mutex; each partition's ingest state is serialized by its own mutex,
//! which is the one held across batch applies. The shard mutex is never
//! held across an apply.

pub mod ingest;
pub mod wait;

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{trace, warn};

pub use ingest::{IngestProgress, PartitionIngest};
pub use wait::{cancel_after_ms, cancel_pair, CancelRx, CancelTx};

use crate::config::IngestSettings;
use crate::engine::IndexEngine;
use crate::error::{NautexError, Result};
use crate::models::SearchQueryParams;
use wait::{wait_done, WaitRequest};

/// Invoked when the caller should rebuild this shard from empty, like on
/// rollback.
pub type RestartFn = Arc<dyn Fn() + Send + Sync>;

struct ShardInner {
    engine: Option<Arc<dyn IndexEngine>>,
    partitions: HashMap<String, Arc<PartitionIngest>>,
}

pub struct IndexShard {
    path: PathBuf,
    settings: IngestSettings,
    restart: RestartFn,
    inner: Mutex<ShardInner>,
}

impl IndexShard {
    pub fn new(
        path: impl Into<PathBuf>,
        engine: Arc<dyn IndexEngine>,
        settings: IngestSettings,
        restart: RestartFn,
    ) -> Self {
        Self {
            path: path.into(),
            settings,
            restart,
            inner: Mutex::new(ShardInner {
                engine: Some(engine),
                partitions: HashMap::new(),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn partition(&self, partition: &str) -> Result<(Arc<PartitionIngest>, Arc<dyn IndexEngine>)> {
        let mut inner = self.inner.lock();
        self.partition_locked(&mut inner, partition)
    }

    fn partition_locked(
        &self,
        inner: &mut ShardInner,
        partition: &str,
    ) -> Result<(Arc<PartitionIngest>, Arc<dyn IndexEngine>)> {
        let engine = inner
            .engine
            .clone()
            .ok_or(NautexError::AlreadyClosed)?;

        if !inner.partitions.contains_key(partition) {
            let ingest = PartitionIngest::spawn(partition, self.settings.clone())?;
            inner.partitions.insert(partition.to_string(), ingest);
        }

        let ingest = Arc::clone(&inner.partitions[partition]);
        Ok((ingest, engine))
    }

    pub fn on_update(&self, partition: &str, key: &[u8], seq: u64, value: &[u8]) -> Result<()> {
        trace!(partition, seq, "data update");
        let (ingest, engine) = self.partition(partition)?;
        ingest.on_update(engine.as_ref(), key, seq, value)
    }

    pub fn on_delete(&self, partition: &str, key: &[u8], seq: u64) -> Result<()> {
        trace!(partition, seq, "data delete");
        let (ingest, engine) = self.partition(partition)?;
        ingest.on_delete(engine.as_ref(), key, seq)
    }

    pub fn on_snapshot_start(&self, partition: &str, snap_start: u64, snap_end: u64) -> Result<()> {
        let (ingest, engine) = self.partition(partition)?;
        ingest.on_snapshot_start(engine.as_ref(), snap_start, snap_end)
    }

    pub fn set_opaque(&self, partition: &str, value: &[u8]) -> Result<()> {
        let (ingest, _) = self.partition(partition)?;
        ingest.set_opaque(value)
    }

    pub fn get_opaque(&self, partition: &str) -> Result<(Bytes, u64)> {
        let (ingest, engine) = self.partition(partition)?;
        ingest.get_opaque(engine.as_ref())
    }

    /// Block until the partition's applied seq reaches `seq`, or the
    /// cancel signal fires, or the shard closes.
    pub fn consistency_wait(
        &self,
        partition: &str,
        level: &str,
        seq: u64,
        cancel: Option<CancelRx>,
    ) -> Result<()> {
        let (req, done_rx) = WaitRequest::new(level, seq);

        {
            // Lookup-or-create and enqueue must both happen under the
            // shard mutex so a close cannot slip between them.
            let mut inner = self.inner.lock();
            let (ingest, _) = self.partition_locked(&mut inner, partition)?;
            ingest.enqueue_wait(req)?;
        }

        wait_done(done_rx, cancel)
    }

    /// A rollback of any partition is a rollback of all partitions: they
    /// share one engine, so the shard closes, erases its files, and asks
    /// the supervisor to rebuild from scratch.
    pub fn rollback(&self, partition: &str, rollback_seq: u64) -> Result<()> {
        warn!(partition, rollback_seq, "rollback: rebuilding shard from zero");

        let mut inner = self.inner.lock();
        self.close_locked(&mut inner)?;

        if let Err(err) = fs::remove_dir_all(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                return Err(err.into());
            }
        }

        (self.restart)();
        Ok(())
    }

    pub fn count(&self) -> Result<u64> {
        self.engine_handle()?.doc_count()
    }

    /// Decode a query request, honor its consistency vector for this
    /// shard's partitions, run the search, and encode the response.
    ///
    /// The request's `timeout` field is handled by the fan-out layer; the
    /// caller passes any armed cancel signal in.
    pub fn query(
        &self,
        index_name: &str,
        source_partitions: &[String],
        req: &[u8],
        res: &mut dyn Write,
        cancel: Option<CancelRx>,
    ) -> Result<()> {
        let params: SearchQueryParams = serde_json::from_slice(req)
            .map_err(|e| NautexError::InvalidRequest(format!("parsing query params: {e}")))?;

        if let Some(consistency) = &params.consistency {
            if !consistency.level.is_empty() {
                if let Some(vector) = consistency.vectors.get(index_name) {
                    for partition in source_partitions {
                        let seq = vector.get(partition).copied().unwrap_or(0);
                        if seq > 0 {
                            self.consistency_wait(
                                partition,
                                &consistency.level,
                                seq,
                                cancel.clone(),
                            )?;
                        }
                    }
                }
            }
        }

        params.query.validate()?;
        let response = self.engine_handle()?.search(&params.query)?;
        serde_json::to_writer(res, &response)?;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.close_locked(&mut inner)
    }

    fn close_locked(&self, inner: &mut ShardInner) -> Result<()> {
        let engine = inner
            .engine
            .take()
            .ok_or(NautexError::AlreadyClosed)?;

        for ingest in inner.partitions.values() {
            ingest.close_waits();
        }
        inner.partitions.clear();

        engine.close()
    }

    /// Borrow the engine for composite search; errors once closed.
    pub fn engine_handle(&self) -> Result<Arc<dyn IndexEngine>> {
        self.inner
            .lock()
            .engine
            .clone()
            .ok_or(NautexError::AlreadyClosed)
    }

    /// Progress of every partition touched so far.
    pub fn progress(&self) -> HashMap<String, IngestProgress> {
        let inner = self.inner.lock();
        inner
            .partitions
            .iter()
            .map(|(partition, ingest)| (partition.clone(), ingest.progress()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexMapping;
    use crate::engine::MemoryEngine;
    use tempfile::TempDir;

    fn new_shard(dir: &TempDir) -> IndexShard {
        let path = dir.path().join("shard0");
        let engine = MemoryEngine::new_index(&path, IndexMapping::default()).unwrap();
        IndexShard::new(path, Arc::new(engine), IngestSettings::default(), Arc::new(|| {}))
    }

    #[test]
    fn test_lazy_partition_creation() {
        let dir = TempDir::new().unwrap();
        let shard = new_shard(&dir);

        assert!(shard.progress().is_empty());
        shard.on_update("3", b"k", 1, b"v").unwrap();
        shard.on_update("3", b"k2", 2, b"v2").unwrap();
        shard.on_update("5", b"k3", 1, b"v3").unwrap();

        let progress = shard.progress();
        assert_eq!(progress.len(), 2);
        assert_eq!(progress["3"].seq_max, 2);
    }

    #[test]
    fn test_ops_after_close() {
        let dir = TempDir::new().unwrap();
        let shard = new_shard(&dir);
        shard.close().unwrap();

        assert!(matches!(shard.close(), Err(NautexError::AlreadyClosed)));
        assert!(matches!(
            shard.on_update("0", b"k", 1, b"v"),
            Err(NautexError::AlreadyClosed)
        ));
        assert!(matches!(shard.count(), Err(NautexError::AlreadyClosed)));
        assert!(matches!(
            shard.consistency_wait("0", "at_plus", 1, None),
            Err(NautexError::AlreadyClosed)
        ));
    }
}
