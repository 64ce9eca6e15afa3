//! Registry of local shards and remote plan entries: the slice of cluster
//! management the query fan-out consumes.
//!
//! Index definitions, partition planning and janitor scheduling live
//! outside this crate; the registry only tracks what is running here,
//! where its files are, and which peers cover the rest of an index.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{IndexMapping, IngestSettings};
use crate::engine::MemoryEngine;
use crate::error::{NautexError, Result};
use crate::metrics::ServiceMetrics;
use crate::query::remote::RemoteTransport;
use crate::shard::IndexShard;

/// Index type served by the in-process engine.
pub const INDEX_TYPE_FULLTEXT: &str = "fulltext";

const SHARD_SUFFIX: &str = ".shard";
const SHARD_MANIFEST_FILE: &str = "manifest.json";

/// Everything needed to reopen or rebuild a shard, persisted next to its
/// engine files.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShardManifest {
    pub index_name: String,
    pub index_uuid: String,
    pub index_type: String,
    pub source_partitions: Vec<String>,
    pub mapping: IndexMapping,
}

/// A shard running in this process.
pub struct RegisteredShard {
    pub name: String,
    pub manifest: ShardManifest,
    pub shard: Arc<IndexShard>,
}

/// A shard covered by a peer node.
#[derive(Clone, Debug)]
pub struct RemotePlan {
    pub name: String,
    pub index_name: String,
    pub index_uuid: String,
    pub host_port: String,
}

/// Work the external supervisor (janitor) must pick up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// A rollback emptied the shard; rebuild it from zero.
    Rebuild { shard: String },
}

pub struct ShardRegistry {
    data_dir: PathBuf,
    settings: IngestSettings,
    shards: DashMap<String, Arc<RegisteredShard>>,
    remotes: RwLock<Vec<RemotePlan>>,
    remote_transport: RwLock<Option<Arc<dyn RemoteTransport>>>,
    supervisor_tx: Sender<SupervisorEvent>,
    metrics: RwLock<Option<Arc<ServiceMetrics>>>,
}

/// A fresh random identifier for index definitions.
pub fn new_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl ShardRegistry {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        settings: IngestSettings,
    ) -> (Self, Receiver<SupervisorEvent>) {
        let (supervisor_tx, supervisor_rx) = unbounded();
        (
            Self {
                data_dir: data_dir.into(),
                settings,
                shards: DashMap::new(),
                remotes: RwLock::new(Vec::new()),
                remote_transport: RwLock::new(None),
                supervisor_tx,
                metrics: RwLock::new(None),
            },
            supervisor_rx,
        )
    }

    pub fn set_metrics(&self, metrics: Arc<ServiceMetrics>) {
        *self.metrics.write() = Some(metrics);
    }

    pub fn set_remote_transport(&self, transport: Arc<dyn RemoteTransport>) {
        *self.remote_transport.write() = Some(transport);
    }

    pub fn remote_transport(&self) -> Option<Arc<dyn RemoteTransport>> {
        self.remote_transport.read().clone()
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn settings(&self) -> &IngestSettings {
        &self.settings
    }

    pub fn shard_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{name}{SHARD_SUFFIX}"))
    }

    pub fn parse_shard_path(&self, path: &Path) -> Option<String> {
        if path.parent() != Some(self.data_dir.as_path()) {
            return None;
        }
        path.file_name()?
            .to_str()?
            .strip_suffix(SHARD_SUFFIX)
            .map(|name| name.to_string())
    }

    fn restart_hook(&self, shard_name: &str) -> Arc<dyn Fn() + Send + Sync> {
        let tx = self.supervisor_tx.clone();
        let shard = shard_name.to_string();
        Arc::new(move || {
            let _ = tx.send(SupervisorEvent::Rebuild {
                shard: shard.clone(),
            });
        })
    }

    fn register(&self, entry: RegisteredShard) -> Result<Arc<RegisteredShard>> {
        let entry = Arc::new(entry);
        // The entry guard locks the map segment; release it before the
        // gauge update below walks the whole map.
        match self.shards.entry(entry.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(NautexError::InvalidRequest(format!(
                    "registered shard already exists, name: {}",
                    entry.name
                )))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&entry));
            }
        }

        if let Some(m) = self.metrics.read().as_ref() {
            m.shards_open.set(self.shards.len() as f64);
        }
        Ok(entry)
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<RegisteredShard>> {
        let removed = self.shards.remove(name).map(|(_, entry)| entry);
        if removed.is_some() {
            if let Some(m) = self.metrics.read().as_ref() {
                m.shards_open.set(self.shards.len() as f64);
            }
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<Arc<RegisteredShard>> {
        self.shards.get(name).map(|entry| Arc::clone(&entry))
    }

    pub fn add_remote(&self, plan: RemotePlan) {
        self.remotes.write().push(plan);
    }

    /// Create a brand-new shard on disk and register it.
    pub fn create_shard(&self, name: &str, manifest: ShardManifest) -> Result<Arc<RegisteredShard>> {
        let path = self.shard_path(name);
        let engine = MemoryEngine::new_index(&path, manifest.mapping.clone())?;
        fs::write(
            path.join(SHARD_MANIFEST_FILE),
            serde_json::to_vec(&manifest)?,
        )?;

        let shard = IndexShard::new(
            &path,
            Arc::new(engine),
            self.settings.clone(),
            self.restart_hook(name),
        );

        info!(shard = name, index = %manifest.index_name, "created shard");
        self.register(RegisteredShard {
            name: name.to_string(),
            manifest,
            shard: Arc::new(shard),
        })
    }

    /// Reopen a shard that already exists on disk.
    pub fn open_shard(&self, name: &str) -> Result<Arc<RegisteredShard>> {
        let path = self.shard_path(name);
        let manifest: ShardManifest =
            serde_json::from_slice(&fs::read(path.join(SHARD_MANIFEST_FILE))?)?;
        let engine = MemoryEngine::open_index(&path)?;

        let shard = IndexShard::new(
            &path,
            Arc::new(engine),
            self.settings.clone(),
            self.restart_hook(name),
        );

        self.register(RegisteredShard {
            name: name.to_string(),
            manifest,
            shard: Arc::new(shard),
        })
    }

    /// Walk the data dir and reopen every shard found there. Entries that
    /// do not match the naming pattern or fail to open are skipped.
    pub fn load_data_dir(&self) -> Result<usize> {
        info!(data_dir = %self.data_dir.display(), "loading data dir");
        let mut opened = 0;

        for dir_entry in fs::read_dir(&self.data_dir)? {
            let path = dir_entry?.path();
            let Some(name) = self.parse_shard_path(&path) else {
                continue;
            };

            match self.open_shard(&name) {
                Ok(_) => opened += 1,
                Err(err) => {
                    warn!(shard = %name, error = %err, "could not open shard");
                }
            }
        }

        info!(opened, "loading data dir done");
        Ok(opened)
    }

    /// Rebuild a rolled-back shard from zero, reusing its manifest. The
    /// supervisor calls this on [`SupervisorEvent::Rebuild`].
    pub fn rebuild_shard(&self, name: &str) -> Result<Arc<RegisteredShard>> {
        let old = self
            .unregister(name)
            .ok_or_else(|| NautexError::InvalidRequest(format!("unknown shard: {name}")))?;

        self.create_shard(name, old.manifest.clone())
    }

    /// The local shards and remote plans covering a logical index. An
    /// empty `index_uuid` matches any registered generation.
    pub fn covering(
        &self,
        index_name: &str,
        index_uuid: &str,
    ) -> (Vec<Arc<RegisteredShard>>, Vec<RemotePlan>) {
        let locals = self
            .shards
            .iter()
            .filter(|entry| {
                entry.manifest.index_name == index_name
                    && (index_uuid.is_empty() || entry.manifest.index_uuid == index_uuid)
            })
            .map(|entry| Arc::clone(&entry))
            .collect();

        let remotes = self
            .remotes
            .read()
            .iter()
            .filter(|plan| {
                plan.index_name == index_name
                    && (index_uuid.is_empty() || plan.index_uuid == index_uuid)
            })
            .cloned()
            .collect();

        (locals, remotes)
    }

    /// Close every registered shard, draining their pending waits.
    pub fn close_all(&self) {
        let names: Vec<String> = self.shards.iter().map(|e| e.name.clone()).collect();
        for name in names {
            if let Some(entry) = self.unregister(&name) {
                if let Err(err) = entry.shard.close() {
                    warn!(shard = %name, error = %err, "close failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manifest(index_name: &str, partitions: &[&str]) -> ShardManifest {
        ShardManifest {
            index_name: index_name.to_string(),
            index_uuid: new_uuid(),
            index_type: INDEX_TYPE_FULLTEXT.to_string(),
            source_partitions: partitions.iter().map(|p| p.to_string()).collect(),
            mapping: IndexMapping::default(),
        }
    }

    #[test]
    fn test_create_and_reopen() {
        let dir = TempDir::new().unwrap();
        let (registry, _rx) = ShardRegistry::new(dir.path(), IngestSettings::default());

        let entry = registry
            .create_shard("beer_0", manifest("beer", &["0", "1"]))
            .unwrap();
        entry.shard.on_update("0", b"k", 1, b"v").unwrap();
        assert!(registry
            .create_shard("beer_0", manifest("beer", &["0"]))
            .is_err());

        registry.unregister("beer_0").unwrap();
        entry.shard.close().unwrap();

        let (registry, _rx) = ShardRegistry::new(dir.path(), IngestSettings::default());
        assert_eq!(registry.load_data_dir().unwrap(), 1);
        let reopened = registry.get("beer_0").unwrap();
        assert_eq!(reopened.manifest.source_partitions, vec!["0", "1"]);
    }

    #[test]
    fn test_covering_filters_by_name_and_uuid() {
        let dir = TempDir::new().unwrap();
        let (registry, _rx) = ShardRegistry::new(dir.path(), IngestSettings::default());

        let beer = registry.create_shard("beer_0", manifest("beer", &["0"])).unwrap();
        registry.create_shard("wine_0", manifest("wine", &["0"])).unwrap();
        registry.add_remote(RemotePlan {
            name: "beer_1".to_string(),
            index_name: "beer".to_string(),
            index_uuid: beer.manifest.index_uuid.clone(),
            host_port: "10.0.0.2:8095".to_string(),
        });

        let (locals, remotes) = registry.covering("beer", "");
        assert_eq!(locals.len(), 1);
        assert_eq!(remotes.len(), 1);

        let (locals, _) = registry.covering("beer", &beer.manifest.index_uuid);
        assert_eq!(locals.len(), 1);

        let (locals, remotes) = registry.covering("beer", "some-other-uuid");
        assert!(locals.is_empty());
        assert!(remotes.is_empty());
    }

    #[test]
    fn test_rollback_requests_rebuild() {
        let dir = TempDir::new().unwrap();
        let (registry, supervisor_rx) = ShardRegistry::new(dir.path(), IngestSettings::default());

        let entry = registry.create_shard("beer_0", manifest("beer", &["0"])).unwrap();
        entry.shard.on_update("0", b"k", 1, b"v").unwrap();
        entry.shard.rollback("0", 0).unwrap();

        assert_eq!(
            supervisor_rx.try_recv().unwrap(),
            SupervisorEvent::Rebuild {
                shard: "beer_0".to_string()
            }
        );
        assert!(!registry.shard_path("beer_0").exists());

        let rebuilt = registry.rebuild_shard("beer_0").unwrap();
        assert_eq!(rebuilt.shard.count().unwrap(), 0);
        assert_eq!(rebuilt.manifest.index_name, "beer");
    }

    #[test]
    fn test_parse_shard_path() {
        let dir = TempDir::new().unwrap();
        let (registry, _rx) = ShardRegistry::new(dir.path(), IngestSettings::default());

        let path = registry.shard_path("beer_0");
        assert_eq!(registry.parse_shard_path(&path).unwrap(), "beer_0");
        assert!(registry
            .parse_shard_path(&dir.path().join("not-a-shard"))
            .is_none());
    }
}
