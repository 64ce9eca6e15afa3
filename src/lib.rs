pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod metrics;
pub mod models;
pub mod query;
pub mod registry;
pub mod shard;
pub mod tokenizer;

pub use config::{IngestSettings, NodeConfig, TokenizerConfig};
pub use engine::{EngineBatch, IndexEngine, MemoryEngine};
pub use error::{NautexError, Result};
pub use feed::FeedAdapter;
pub use metrics::ServiceMetrics;
pub use registry::ShardRegistry;
pub use shard::IndexShard;
pub use tokenizer::Tokenizer;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
