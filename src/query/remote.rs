//! Opaque client handle for a shard served by a peer node.
//!
//! The client forwards the query's consistency vector so the peer applies
//! the same read guarantee to its own partitions. The wire transport is
//! supplied by the cluster layer; this crate only defines the contract.

use std::sync::Arc;

use bytes::Bytes;

use super::SearchTarget;
use crate::error::Result;
use crate::models::{ConsistencyParams, SearchQueryParams, SearchRequest, SearchResponse};
use crate::registry::RemotePlan;

/// Transport used to reach peers.
pub trait RemoteTransport: Send + Sync {
    /// POST a query body to a peer URL, returning the raw response body.
    fn query(&self, url: &str, body: &[u8]) -> Result<Bytes>;

    /// Fetch a peer shard's doc count.
    fn count(&self, url: &str) -> Result<u64>;
}

pub struct RemoteShardClient {
    pub query_url: String,
    pub count_url: String,
    consistency: Option<ConsistencyParams>,
    transport: Arc<dyn RemoteTransport>,
}

impl RemoteShardClient {
    pub fn new(
        plan: &RemotePlan,
        consistency: Option<ConsistencyParams>,
        transport: Arc<dyn RemoteTransport>,
    ) -> Self {
        let base = format!("http://{}/api/shard/{}", plan.host_port, plan.name);
        Self {
            query_url: format!("{base}/query"),
            count_url: format!("{base}/count"),
            consistency,
            transport,
        }
    }
}

impl SearchTarget for RemoteShardClient {
    fn search(&self, req: &SearchRequest) -> Result<SearchResponse> {
        // The vector travels with the forwarded request; the peer's own
        // fan-out issues the waits for its partitions.
        let params = SearchQueryParams {
            query: req.clone(),
            consistency: self.consistency.clone(),
            timeout: None,
        };
        let body = serde_json::to_vec(&params)?;
        let raw = self.transport.query(&self.query_url, &body)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    fn doc_count(&self) -> Result<u64> {
        self.transport.count(&self.count_url)
    }
}
