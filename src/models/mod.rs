use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{NautexError, Result};

/// Consistency level accepted without waiting (stale reads are ok).
pub const LEVEL_ANY: &str = "";
/// Consistency level requiring the query to observe at least the given
/// seq per listed partition.
pub const LEVEL_AT_PLUS: &str = "at_plus";

/// A search query clause.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Query {
    /// Exact term lookup; the term is not analyzed.
    Term { term: String },
    /// Analyzed match query; all query terms must be present.
    Match { query: String },
    MatchAll {},
}

fn default_size() -> usize {
    10
}

/// Search request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: Query,
    #[serde(default = "default_size")]
    pub size: usize,
    #[serde(default)]
    pub from: usize,
}

impl SearchRequest {
    pub fn new(query: Query) -> Self {
        Self {
            query,
            size: default_size(),
            from: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match &self.query {
            Query::Term { term } if term.is_empty() => {
                Err(NautexError::InvalidRequest("empty term query".to_string()))
            }
            Query::Match { query } if query.is_empty() => {
                Err(NautexError::InvalidRequest("empty match query".to_string()))
            }
            _ => Ok(()),
        }
    }
}

/// A single hit in a search response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f64,
}

impl SearchHit {
    pub fn new(id: impl Into<String>, score: f64) -> Self {
        Self {
            id: id.into(),
            score,
        }
    }
}

/// Search response with timing information
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    pub total_hits: u64,
    pub took_ms: u64,
}

/// Consistency requirements attached to a query.
///
/// `vectors` maps index name to a per-partition target seq; a query with
/// level `at_plus` blocks until every listed partition has durably indexed
/// its target seq.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConsistencyParams {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub vectors: HashMap<String, HashMap<String, u64>>,
}

/// Wire form of a query request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchQueryParams {
    pub query: SearchRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consistency: Option<ConsistencyParams>,
    /// Milliseconds; a positive value schedules cancellation after the duration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
}
