//! Adapter between the upstream change-stream client's callback surface
//! and the shard's per-partition operations.
//!
//! The upstream client keys every callback by vbucket id; the adapter
//! converts that to a partition id string through a pre-computed table
//! and routes to a destination shard. Errors from the stream are recorded
//! and never fatal here: reconnect and backoff live in the upstream
//! client.

use std::borrow::Cow;
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::error::{NautexError, Result};
use crate::metrics::ServiceMetrics;
use crate::shard::IndexShard;

/// Number of pre-computed partition id strings.
pub const MAX_VBUCKETS: usize = 1024;

/// Picks the destination shard for a (partition, key) pair.
pub type RouterFn =
    Arc<dyn Fn(&HashMap<String, Arc<IndexShard>>, &str, &[u8]) -> Option<Arc<IndexShard>> + Send + Sync>;

/// The basic router: destinations are keyed directly by partition id.
pub fn basic_router() -> RouterFn {
    Arc::new(|dests, partition, _key| dests.get(partition).cloned())
}

#[derive(Default)]
struct Counters {
    num_error: AtomicU64,
    num_update: AtomicU64,
    num_delete: AtomicU64,
    num_snapshot_start: AtomicU64,
    num_set_meta: AtomicU64,
    num_get_meta: AtomicU64,
    num_rollback: AtomicU64,
}

/// Snapshot of a feed's callback counters.
#[derive(Clone, Debug, Serialize)]
pub struct FeedStats {
    pub num_error: u64,
    pub num_update: u64,
    pub num_delete: u64,
    pub num_snapshot_start: u64,
    pub num_set_meta: u64,
    pub num_get_meta: u64,
    pub num_rollback: u64,
    pub last_err: Option<String>,
}

pub struct FeedAdapter {
    name: String,
    router: RouterFn,
    dests: HashMap<String, Arc<IndexShard>>,
    vbucket_ids: Vec<String>,
    counters: Counters,
    last_err: Mutex<Option<String>>,
    metrics: Option<Arc<ServiceMetrics>>,
}

impl FeedAdapter {
    pub fn new(
        name: impl Into<String>,
        dests: HashMap<String, Arc<IndexShard>>,
        router: RouterFn,
    ) -> Self {
        Self {
            name: name.into(),
            router,
            dests,
            vbucket_ids: (0..MAX_VBUCKETS).map(|i| i.to_string()).collect(),
            counters: Counters::default(),
            last_err: Mutex::new(None),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ServiceMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dests(&self) -> &HashMap<String, Arc<IndexShard>> {
        &self.dests
    }

    fn partition_id(&self, vbucket: u16) -> Cow<'_, str> {
        match self.vbucket_ids.get(vbucket as usize) {
            Some(id) => Cow::Borrowed(id.as_str()),
            None => Cow::Owned(vbucket.to_string()),
        }
    }

    fn route(&self, vbucket: u16, key: &[u8]) -> Result<(String, Arc<IndexShard>)> {
        let partition = self.partition_id(vbucket);
        match (self.router)(&self.dests, &partition, key) {
            Some(dest) => Ok((partition.into_owned(), dest)),
            None => Err(NautexError::RouteUnknown(partition.into_owned())),
        }
    }

    pub fn on_update(&self, vbucket: u16, key: &[u8], seq: u64, value: &[u8]) -> Result<()> {
        let (partition, dest) = self.route(vbucket, key)?;
        self.counters.num_update.fetch_add(1, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            m.ingest_updates.inc();
        }
        dest.on_update(&partition, key, seq, value)
    }

    pub fn on_delete(&self, vbucket: u16, key: &[u8], seq: u64) -> Result<()> {
        let (partition, dest) = self.route(vbucket, key)?;
        self.counters.num_delete.fetch_add(1, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            m.ingest_deletes.inc();
        }
        dest.on_delete(&partition, key, seq)
    }

    pub fn on_snapshot_start(&self, vbucket: u16, snap_start: u64, snap_end: u64) -> Result<()> {
        let (partition, dest) = self.route(vbucket, &[])?;
        self.counters
            .num_snapshot_start
            .fetch_add(1, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            m.ingest_snapshots.inc();
        }
        dest.on_snapshot_start(&partition, snap_start, snap_end)
    }

    pub fn set_metadata(&self, vbucket: u16, value: &[u8]) -> Result<()> {
        let (partition, dest) = self.route(vbucket, &[])?;
        self.counters.num_set_meta.fetch_add(1, Ordering::Relaxed);
        dest.set_opaque(&partition, value)
    }

    pub fn get_metadata(&self, vbucket: u16) -> Result<(Bytes, u64)> {
        let (partition, dest) = self.route(vbucket, &[])?;
        self.counters.num_get_meta.fetch_add(1, Ordering::Relaxed);
        dest.get_opaque(&partition)
    }

    pub fn rollback(&self, vbucket: u16, rollback_seq: u64) -> Result<()> {
        let (partition, dest) = self.route(vbucket, &[])?;
        self.counters.num_rollback.fetch_add(1, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            m.ingest_rollbacks.inc();
        }

        let cause = NautexError::RollbackRequested {
            partition: partition.clone(),
            seq: rollback_seq,
        };
        warn!(feed = %self.name, %cause, "upstream requested rollback");

        dest.rollback(&partition, rollback_seq)
    }

    /// Record a stream error and continue; the upstream client owns
    /// reconnect and backoff.
    pub fn on_error(&self, err: &NautexError) {
        self.counters.num_error.fetch_add(1, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            m.feed_errors.inc();
        }
        *self.last_err.lock() = Some(err.to_string());
        warn!(feed = %self.name, error = %err, "feed error");
    }

    pub fn stats_snapshot(&self) -> FeedStats {
        FeedStats {
            num_error: self.counters.num_error.load(Ordering::Relaxed),
            num_update: self.counters.num_update.load(Ordering::Relaxed),
            num_delete: self.counters.num_delete.load(Ordering::Relaxed),
            num_snapshot_start: self.counters.num_snapshot_start.load(Ordering::Relaxed),
            num_set_meta: self.counters.num_set_meta.load(Ordering::Relaxed),
            num_get_meta: self.counters.num_get_meta.load(Ordering::Relaxed),
            num_rollback: self.counters.num_rollback.load(Ordering::Relaxed),
            last_err: self.last_err.lock().clone(),
        }
    }

    /// Write the feed's counters as JSON.
    pub fn stats(&self, w: &mut dyn Write) -> Result<()> {
        serde_json::to_writer(w, &self.stats_snapshot())?;
        Ok(())
    }
}

/// Parse the destinations' partition ids back into vbucket ids, as the
/// upstream client wants them for stream setup.
pub fn partitions_to_vbucket_ids(dests: &HashMap<String, Arc<IndexShard>>) -> Result<Vec<u16>> {
    let mut vbucket_ids = Vec::with_capacity(dests.len());
    for partition in dests.keys() {
        let id = partition.parse::<u16>().map_err(|e| {
            NautexError::InvalidRequest(format!("partition is not a vbucket id: {partition}: {e}"))
        })?;
        vbucket_ids.push(id);
    }
    vbucket_ids.sort_unstable();
    Ok(vbucket_ids)
}
