//! Reference engine: an in-memory inverted index with a durable,
//! checksummed snapshot file.
//!
//! Every applied batch rewrites the snapshot (temp file + rename), so a
//! committed batch survives reopen. Batches are staged on copies of the
//! engine maps and swapped in only after the snapshot write succeeds; a
//! failed apply leaves no trace in memory or on disk.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use bytes::Bytes;
use crc32fast::Hasher;
use ordered_float::OrderedFloat;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::{BatchOp, EngineBatch, IndexEngine};
use crate::config::IndexMapping;
use crate::error::{NautexError, Result};
use crate::models::{Query, SearchHit, SearchRequest, SearchResponse};
use crate::tokenizer::Tokenizer;

/// Snapshot version for compatibility checking
pub const SNAPSHOT_VERSION: u32 = 1;

const SNAPSHOT_FILE: &str = "engine.snap";
const SNAPSHOT_TMP_FILE: &str = "engine.snap.tmp";

#[derive(Serialize, Deserialize)]
struct EngineSnapshot {
    version: u32,
    mapping: IndexMapping,
    docs: HashMap<String, Vec<u8>>,
    internal: HashMap<Vec<u8>, Vec<u8>>,
}

#[derive(Clone, Default)]
struct EngineState {
    docs: HashMap<String, Bytes>,
    internal: HashMap<Vec<u8>, Vec<u8>>,
    // term -> doc keys, rebuilt from docs on open
    terms: HashMap<String, HashSet<String>>,
    // doc key -> its terms, so deletes and replacements unindex cleanly
    doc_terms: HashMap<String, HashSet<String>>,
}

pub struct MemoryEngine {
    path: PathBuf,
    mapping: IndexMapping,
    tokenizer: Tokenizer,
    state: RwLock<EngineState>,
    closed: AtomicBool,
}

impl MemoryEngine {
    /// Create a new index at `path`. Fails if an index already exists there.
    pub fn new_index(path: impl Into<PathBuf>, mapping: IndexMapping) -> Result<Self> {
        let path = path.into();
        fs::create_dir_all(&path)?;
        if path.join(SNAPSHOT_FILE).exists() {
            return Err(NautexError::Engine(format!(
                "index already exists, path: {}",
                path.display()
            )));
        }

        let engine = Self {
            tokenizer: Tokenizer::new(&mapping.tokenizer),
            mapping,
            state: RwLock::new(EngineState::default()),
            closed: AtomicBool::new(false),
            path,
        };
        engine.persist(&engine.state.read())?;
        Ok(engine)
    }

    /// Open an existing index at `path`.
    pub fn open_index(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let raw = fs::read(path.join(SNAPSHOT_FILE))?;
        if raw.len() < 4 {
            return Err(NautexError::Engine(format!(
                "snapshot truncated, path: {}",
                path.display()
            )));
        }

        let (checksum_bytes, payload) = raw.split_at(4);
        let mut expected = [0u8; 4];
        expected.copy_from_slice(checksum_bytes);
        if checksum(payload) != u32::from_be_bytes(expected) {
            return Err(NautexError::Engine(format!(
                "snapshot checksum mismatch, path: {}",
                path.display()
            )));
        }

        let snapshot: EngineSnapshot = bincode::deserialize(payload)?;
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(NautexError::Engine(format!(
                "incompatible snapshot version: {}",
                snapshot.version
            )));
        }

        let tokenizer = Tokenizer::new(&snapshot.mapping.tokenizer);
        let mut state = EngineState {
            docs: snapshot
                .docs
                .into_iter()
                .map(|(k, v)| (k, Bytes::from(v)))
                .collect(),
            internal: snapshot.internal,
            ..Default::default()
        };

        let keys: Vec<String> = state.docs.keys().cloned().collect();
        for key in keys {
            let value = state.docs[&key].clone();
            index_doc(&mut state, &tokenizer, &key, &value);
        }

        Ok(Self {
            mapping: snapshot.mapping,
            tokenizer,
            state: RwLock::new(state),
            closed: AtomicBool::new(false),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mapping(&self) -> &IndexMapping {
        &self.mapping
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NautexError::AlreadyClosed);
        }
        Ok(())
    }

    fn persist(&self, state: &EngineState) -> Result<()> {
        let snapshot = EngineSnapshot {
            version: SNAPSHOT_VERSION,
            mapping: self.mapping.clone(),
            docs: state
                .docs
                .iter()
                .map(|(k, v)| (k.clone(), v.to_vec()))
                .collect(),
            internal: state.internal.clone(),
        };

        let payload = bincode::serialize(&snapshot)?;
        let mut raw = Vec::with_capacity(payload.len() + 4);
        raw.extend_from_slice(&checksum(&payload).to_be_bytes());
        raw.extend_from_slice(&payload);

        let tmp = self.path.join(SNAPSHOT_TMP_FILE);
        fs::write(&tmp, &raw)?;
        fs::rename(&tmp, self.path.join(SNAPSHOT_FILE))?;
        Ok(())
    }
}

fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

fn unindex_doc(state: &mut EngineState, key: &str) {
    if let Some(terms) = state.doc_terms.remove(key) {
        for term in terms {
            if let Some(keys) = state.terms.get_mut(&term) {
                keys.remove(key);
                if keys.is_empty() {
                    state.terms.remove(&term);
                }
            }
        }
    }
}

fn index_doc(state: &mut EngineState, tokenizer: &Tokenizer, key: &str, value: &[u8]) {
    let text = String::from_utf8_lossy(value);
    let terms = tokenizer.unique_terms(&text);
    for term in &terms {
        state
            .terms
            .entry(term.clone())
            .or_default()
            .insert(key.to_string());
    }
    state.doc_terms.insert(key.to_string(), terms);
}

impl IndexEngine for MemoryEngine {
    fn apply_batch(&self, batch: &EngineBatch) -> Result<()> {
        self.check_open()?;

        // Stage on a copy; commit memory state only after the snapshot
        // write succeeds, so a failed apply can be retried verbatim.
        let mut staged = self.state.read().clone();
        for op in batch.ops() {
            match op {
                BatchOp::Index { key, value } => {
                    unindex_doc(&mut staged, key);
                    index_doc(&mut staged, &self.tokenizer, key, value);
                    staged.docs.insert(key.clone(), value.clone());
                }
                BatchOp::Delete { key } => {
                    unindex_doc(&mut staged, key);
                    staged.docs.remove(key);
                }
                BatchOp::SetInternal { key, value } => {
                    staged.internal.insert(key.to_vec(), value.to_vec());
                }
            }
        }

        self.persist(&staged)?;
        *self.state.write() = staged;
        Ok(())
    }

    fn get_internal(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.check_open()?;
        Ok(self
            .state
            .read()
            .internal
            .get(key)
            .map(|v| Bytes::copy_from_slice(v)))
    }

    fn doc_count(&self) -> Result<u64> {
        self.check_open()?;
        Ok(self.state.read().docs.len() as u64)
    }

    fn search(&self, req: &SearchRequest) -> Result<SearchResponse> {
        self.check_open()?;
        let start = Instant::now();
        let state = self.state.read();

        let mut hits: Vec<SearchHit> = match &req.query {
            Query::MatchAll {} => state
                .docs
                .keys()
                .map(|k| SearchHit::new(k.clone(), 1.0))
                .collect(),
            Query::Term { term } => state
                .terms
                .get(term)
                .map(|keys| {
                    let df = keys.len() as f64;
                    keys.iter()
                        .map(|k| SearchHit::new(k.clone(), 1.0 / df))
                        .collect()
                })
                .unwrap_or_default(),
            Query::Match { query } => {
                let query_terms = self.tokenizer.tokenize(query);
                if query_terms.is_empty() {
                    Vec::new()
                } else {
                    // Conjunction over analyzed terms; score favors rarer terms.
                    let mut scores: HashMap<&String, (usize, f64)> = HashMap::new();
                    for term in &query_terms {
                        if let Some(keys) = state.terms.get(term) {
                            let df = keys.len() as f64;
                            for key in keys {
                                let entry = scores.entry(key).or_insert((0, 0.0));
                                entry.0 += 1;
                                entry.1 += 1.0 / df;
                            }
                        }
                    }
                    scores
                        .into_iter()
                        .filter(|(_, (matched, _))| *matched == query_terms.len())
                        .map(|(key, (_, score))| SearchHit::new(key.clone(), score))
                        .collect()
                }
            }
        };

        hits.sort_by(|a, b| {
            OrderedFloat(b.score)
                .cmp(&OrderedFloat(a.score))
                .then_with(|| a.id.cmp(&b.id))
        });

        let total_hits = hits.len() as u64;
        let hits = hits
            .into_iter()
            .skip(req.from)
            .take(req.size)
            .collect();

        Ok(SearchResponse {
            hits,
            total_hits,
            took_ms: start.elapsed().as_millis() as u64,
        })
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(NautexError::AlreadyClosed);
        }
        self.persist(&self.state.read())
    }
}
