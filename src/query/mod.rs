//! Query fan-out over local shards and remote peers.
//!
//! A query against a logical index builds a composite search target from
//! every covering shard, issues the consistency waits its vector demands
//! concurrently, and merges per-target responses into one ranked result.

pub mod remote;

pub use remote::{RemoteShardClient, RemoteTransport};

use std::io::Write;
use std::sync::Arc;
use std::thread;

use ordered_float::OrderedFloat;
use parking_lot::Mutex;

use crate::engine::IndexEngine;
use crate::error::{NautexError, Result};
use crate::models::{ConsistencyParams, SearchQueryParams, SearchRequest, SearchResponse};
use crate::registry::{ShardRegistry, INDEX_TYPE_FULLTEXT};
use crate::shard::wait::{cancel_after_ms, cancelled, CancelRx};

/// Anything a query can be fanned out to: a local engine or a remote peer.
pub trait SearchTarget: Send + Sync {
    fn search(&self, req: &SearchRequest) -> Result<SearchResponse>;
    fn doc_count(&self) -> Result<u64>;
}

struct LocalTarget(Arc<dyn IndexEngine>);

impl SearchTarget for LocalTarget {
    fn search(&self, req: &SearchRequest) -> Result<SearchResponse> {
        self.0.search(req)
    }

    fn doc_count(&self) -> Result<u64> {
        self.0.doc_count()
    }
}

/// A per-query composite over every target covering a logical index.
pub struct IndexComposite {
    targets: Vec<Box<dyn SearchTarget>>,
}

impl IndexComposite {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Search every target concurrently and merge by score.
    pub fn search(&self, req: &SearchRequest) -> Result<SearchResponse> {
        // Children search with widened paging; the global window is
        // re-applied after the merge.
        let mut child_req = req.clone();
        child_req.size = req.from + req.size;
        child_req.from = 0;

        let child_req = &child_req;
        let results: Vec<Result<SearchResponse>> = thread::scope(|scope| {
            let handles: Vec<_> = self
                .targets
                .iter()
                .map(|target| scope.spawn(move || target.search(child_req)))
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(result) => result,
                    Err(_) => Err(NautexError::Engine("search worker panicked".to_string())),
                })
                .collect()
        });

        let mut response = SearchResponse::default();
        let mut hits = Vec::new();
        for result in results {
            let child = result?;
            response.total_hits += child.total_hits;
            response.took_ms = response.took_ms.max(child.took_ms);
            hits.extend(child.hits);
        }

        hits.sort_by(|a, b| {
            OrderedFloat(b.score)
                .cmp(&OrderedFloat(a.score))
                .then_with(|| a.id.cmp(&b.id))
        });
        response.hits = hits.into_iter().skip(req.from).take(req.size).collect();

        Ok(response)
    }

    pub fn doc_count(&self) -> Result<u64> {
        let mut total = 0;
        for target in &self.targets {
            total += target.doc_count()?;
        }
        Ok(total)
    }
}

/// Build the composite covering (index name, UUID), honoring the query's
/// consistency vector across all local partitions before returning.
///
/// Waits run concurrently per shard; the first failure wins. Remote peers
/// enter the composite as opaque clients that carry the vector forward.
pub fn build_composite(
    registry: &ShardRegistry,
    index_name: &str,
    index_uuid: &str,
    consistency: Option<&ConsistencyParams>,
    cancel: Option<CancelRx>,
) -> Result<IndexComposite> {
    let (locals, remotes) = registry.covering(index_name, index_uuid);
    if locals.is_empty() && remotes.is_empty() {
        return Err(NautexError::InvalidRequest(format!(
            "no shards cover index: {index_name}, uuid: {index_uuid}"
        )));
    }

    let mut targets: Vec<Box<dyn SearchTarget>> = Vec::new();
    for entry in &locals {
        if entry.manifest.index_type != INDEX_TYPE_FULLTEXT {
            return Err(NautexError::InvalidRequest(format!(
                "shard {} has index type: {}",
                entry.name, entry.manifest.index_type
            )));
        }
        targets.push(Box::new(LocalTarget(entry.shard.engine_handle()?)));
    }

    if let Some(consistency) = consistency {
        if !consistency.level.is_empty() {
            if let Some(vector) = consistency.vectors.get(index_name) {
                let first_err: Mutex<Option<NautexError>> = Mutex::new(None);

                thread::scope(|scope| {
                    for entry in &locals {
                        let entry = Arc::clone(entry);
                        let cancel = cancel.clone();
                        let first_err = &first_err;
                        scope.spawn(move || {
                            for partition in &entry.manifest.source_partitions {
                                let seq = vector.get(partition).copied().unwrap_or(0);
                                if seq > 0 {
                                    if let Err(err) = entry.shard.consistency_wait(
                                        partition,
                                        &consistency.level,
                                        seq,
                                        cancel.clone(),
                                    ) {
                                        *first_err.lock() = Some(err);
                                    }
                                }
                            }
                        });
                    }
                });

                if let Some(err) = first_err.into_inner() {
                    return Err(err);
                }
            }
        }
    }

    if !remotes.is_empty() {
        let transport = registry.remote_transport().ok_or_else(|| {
            NautexError::InvalidRequest("no remote transport configured".to_string())
        })?;
        for plan in &remotes {
            targets.push(Box::new(RemoteShardClient::new(
                plan,
                consistency.cloned(),
                Arc::clone(&transport),
            )));
        }
    }

    if let Some(cancel_rx) = &cancel {
        if cancelled(cancel_rx) {
            return Err(NautexError::Cancelled);
        }
    }

    Ok(IndexComposite { targets })
}

/// Serve a query request against a logical index: decode, arm the
/// timeout, wait for consistency, search, encode to `res`.
pub fn query_index(
    registry: &ShardRegistry,
    index_name: &str,
    index_uuid: &str,
    req: &[u8],
    res: &mut dyn Write,
) -> Result<()> {
    let params: SearchQueryParams = serde_json::from_slice(req)
        .map_err(|e| NautexError::InvalidRequest(format!("parsing query params: {e}")))?;

    let cancel = params
        .timeout
        .filter(|timeout| *timeout > 0)
        .map(|timeout| cancel_after_ms(timeout as u64));

    let composite = build_composite(
        registry,
        index_name,
        index_uuid,
        params.consistency.as_ref(),
        cancel,
    )?;

    params.query.validate()?;
    let response = composite.search(&params.query)?;
    serde_json::to_writer(res, &response)?;
    Ok(())
}

/// Doc count across every target covering a logical index.
pub fn count_index(registry: &ShardRegistry, index_name: &str, index_uuid: &str) -> Result<u64> {
    build_composite(registry, index_name, index_uuid, None, None)?.doc_count()
}
