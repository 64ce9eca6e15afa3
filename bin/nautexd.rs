use anyhow::Result;
use clap::Parser;
use nautex::config::{IngestSettings, NodeConfig};
use nautex::registry::SupervisorEvent;
use nautex::{api, ServiceMetrics, ShardRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "nautexd")]
#[command(about = "Full-text indexing tier over partitioned change streams", long_about = None)]
struct Args {
    /// Bind address for the HTTP surface
    #[arg(long, env = "NAUTEX_BIND_ADDR", default_value = "127.0.0.1:8095")]
    bind_addr: String,

    /// Data directory holding shard indexes
    #[arg(long, env = "NAUTEX_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Pending batch is applied once its buffered value bytes reach this
    #[arg(long, env = "NAUTEX_APPLY_BUF_BYTES", default_value = "200000")]
    apply_buf_bytes: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    let config = NodeConfig::new(args.bind_addr, args.data_dir).with_ingest(IngestSettings {
        apply_buf_bytes: args.apply_buf_bytes,
        ..Default::default()
    });

    info!("Starting nautexd v{}", nautex::VERSION);
    info!("  Bind address: {}", config.bind_addr);
    info!("  Data directory: {:?}", config.data_dir);
    info!("  Worker threads: {}", config.worker_threads);
    info!("  Apply threshold: {} bytes", config.ingest.apply_buf_bytes);

    std::fs::create_dir_all(&config.data_dir)?;

    let metrics = Arc::new(ServiceMetrics::new()?);
    let (registry, supervisor_rx) = ShardRegistry::new(&config.data_dir, config.ingest.clone());
    let registry = Arc::new(registry);
    registry.set_metrics(Arc::clone(&metrics));

    let opened = registry.load_data_dir()?;
    info!(opened, "shards loaded");

    // Janitor: rebuild shards emptied by rollback.
    let janitor_registry = Arc::clone(&registry);
    std::thread::spawn(move || {
        for event in supervisor_rx.iter() {
            match event {
                SupervisorEvent::Rebuild { shard } => {
                    info!(shard = %shard, "rebuilding shard after rollback");
                    if let Err(err) = janitor_registry.rebuild_shard(&shard) {
                        warn!(shard = %shard, error = %err, "rebuild failed");
                    }
                }
            }
        }
    });

    let app = api::create_router(api::AppState { registry, metrics });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
