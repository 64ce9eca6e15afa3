use prometheus::{
    Counter, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

/// Prometheus metrics for the indexing tier
#[derive(Clone)]
pub struct ServiceMetrics {
    // Ingest counters
    pub ingest_updates: Counter,
    pub ingest_deletes: Counter,
    pub ingest_snapshots: Counter,
    pub ingest_rollbacks: Counter,
    pub feed_errors: Counter,

    // Query counters
    pub queries_total: Counter,
    pub query_errors: Counter,

    // Gauges
    pub shards_open: Gauge,

    // Histograms
    pub search_latency: HistogramVec,

    registry: Arc<Registry>,
}

impl ServiceMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let ingest_updates = Counter::with_opts(Opts::new(
            "nautex_ingest_updates_total",
            "Total data-update events ingested",
        ))?;
        registry.register(Box::new(ingest_updates.clone()))?;

        let ingest_deletes = Counter::with_opts(Opts::new(
            "nautex_ingest_deletes_total",
            "Total data-delete events ingested",
        ))?;
        registry.register(Box::new(ingest_deletes.clone()))?;

        let ingest_snapshots = Counter::with_opts(Opts::new(
            "nautex_ingest_snapshots_total",
            "Total snapshot-start events ingested",
        ))?;
        registry.register(Box::new(ingest_snapshots.clone()))?;

        let ingest_rollbacks = Counter::with_opts(Opts::new(
            "nautex_ingest_rollbacks_total",
            "Total rollback requests from upstream",
        ))?;
        registry.register(Box::new(ingest_rollbacks.clone()))?;

        let feed_errors = Counter::with_opts(Opts::new(
            "nautex_feed_errors_total",
            "Total errors reported by the upstream stream",
        ))?;
        registry.register(Box::new(feed_errors.clone()))?;

        let queries_total = Counter::with_opts(Opts::new(
            "nautex_queries_total",
            "Total search queries served",
        ))?;
        registry.register(Box::new(queries_total.clone()))?;

        let query_errors = Counter::with_opts(Opts::new(
            "nautex_query_errors_total",
            "Total search queries that failed",
        ))?;
        registry.register(Box::new(query_errors.clone()))?;

        let shards_open = Gauge::with_opts(Opts::new(
            "nautex_shards_open",
            "Currently registered local shards",
        ))?;
        registry.register(Box::new(shards_open.clone()))?;

        let search_latency = HistogramVec::new(
            HistogramOpts::new(
                "nautex_search_latency_seconds",
                "Latency of search queries by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(search_latency.clone()))?;

        Ok(Self {
            ingest_updates,
            ingest_deletes,
            ingest_snapshots,
            ingest_rollbacks,
            feed_errors,
            queries_total,
            query_errors,
            shards_open,
            search_latency,
            registry: Arc::new(registry),
        })
    }

    pub fn observe_search(&self, outcome: &str, elapsed: Duration) {
        self.search_latency
            .with_label_values(&[outcome])
            .observe(elapsed.as_secs_f64());
    }

    /// Render all registered metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render() {
        let metrics = ServiceMetrics::new().unwrap();
        metrics.queries_total.inc();
        metrics.observe_search("ok", Duration::from_millis(5));
        metrics.shards_open.set(2.0);

        let rendered = metrics.render().unwrap();
        assert!(rendered.contains("nautex_queries_total 1"));
        assert!(rendered.contains("nautex_shards_open 2"));
    }
}
