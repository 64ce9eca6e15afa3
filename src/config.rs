use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ingest batching settings for a shard's partitions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestSettings {
    /// Initial capacity of a partition's reusable value buffer.
    pub initial_buf_bytes: usize,
    /// Pending batch is applied once its buffered value bytes reach this.
    pub apply_buf_bytes: usize,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            initial_buf_bytes: 20_000,
            apply_buf_bytes: 200_000,
        }
    }
}

/// Tokenizer configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenizerConfig {
    pub lowercase: bool,
    pub remove_stopwords: bool,
    pub stem: bool,
    pub min_token_length: usize,
    pub max_token_length: usize,
    pub language: String,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            lowercase: true,
            remove_stopwords: true,
            stem: true,
            min_token_length: 2,
            max_token_length: 50,
            language: "english".to_string(),
        }
    }
}

/// Mapping applied when creating a new full-text index.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IndexMapping {
    pub tokenizer: TokenizerConfig,
}

impl IndexMapping {
    /// Parse mapping params from JSON; empty params yield the default mapping.
    pub fn from_params(params: &str) -> Result<Self, serde_json::Error> {
        if params.is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(params)
    }
}

/// Node configuration for a nautex instance
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub worker_threads: usize,
    pub ingest: IngestSettings,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8095".to_string(),
            data_dir: PathBuf::from("./data"),
            worker_threads: num_cpus::get(),
            ingest: IngestSettings::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(bind_addr: String, data_dir: PathBuf) -> Self {
        Self {
            bind_addr,
            data_dir,
            ..Default::default()
        }
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn with_ingest(mut self, ingest: IngestSettings) -> Self {
        self.ingest = ingest;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs() {
        let ingest = IngestSettings::default();
        assert_eq!(ingest.initial_buf_bytes, 20_000);
        assert_eq!(ingest.apply_buf_bytes, 200_000);

        let tokenizer = TokenizerConfig::default();
        assert!(tokenizer.lowercase);
        assert!(tokenizer.remove_stopwords);

        let node = NodeConfig::default();
        assert_eq!(node.bind_addr, "127.0.0.1:8095");
    }

    #[test]
    fn test_mapping_from_params() {
        let mapping = IndexMapping::from_params("").unwrap();
        assert!(mapping.tokenizer.stem);

        let mapping =
            IndexMapping::from_params(r#"{"tokenizer":{"lowercase":false,"remove_stopwords":false,"stem":false,"min_token_length":1,"max_token_length":10,"language":"english"}}"#)
                .unwrap();
        assert!(!mapping.tokenizer.lowercase);
        assert_eq!(mapping.tokenizer.max_token_length, 10);

        assert!(IndexMapping::from_params("{not json").is_err());
    }

    #[test]
    fn test_node_config_builder() {
        let config = NodeConfig::new("0.0.0.0:9090".to_string(), PathBuf::from("./d"))
            .with_worker_threads(4);
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.data_dir, PathBuf::from("./d"));
    }
}
