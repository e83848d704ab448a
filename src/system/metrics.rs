//! Metrics collection for the node store
//!
//! Each [`StoreMetrics`] owns its own Prometheus registry, so several
//! stores in one process (or test binary) never clash over metric names.

use crate::core::Result;
use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::time::Instant;

/// Node cache counters
#[derive(Debug)]
pub struct CacheMetrics {
    /// Lookups answered from the cache
    pub hits: IntCounter,
    /// Lookups that went to storage
    pub misses: IntCounter,
}

/// Storage traffic counters
#[derive(Debug)]
pub struct NodeMetrics {
    /// Nodes read from a backend
    pub loaded: IntCounter,
    /// Nodes inserted or updated in a backend
    pub written: IntCounter,
    /// Nodes deleted from a backend
    pub deleted: IntCounter,
    /// Subnode segment loads whose row count didn't match the segment
    pub inconsistent_segments: IntCounter,
}

/// Transaction counters
#[derive(Debug)]
pub struct TransactionMetrics {
    pub committed: IntCounter,
    pub aborted: IntCounter,
    /// Commit duration in seconds
    pub commit_duration: Histogram,
}

/// All metrics of one store
#[derive(Debug)]
pub struct StoreMetrics {
    registry: Registry,
    pub cache: CacheMetrics,
    pub nodes: NodeMetrics,
    pub transactions: TransactionMetrics,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl StoreMetrics {
    /// Create the metrics and register them with a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let cache = CacheMetrics {
            hits: counter(&registry, "hop_cache_hits_total", "Node cache hits")?,
            misses: counter(&registry, "hop_cache_misses_total", "Node cache misses")?,
        };

        let nodes = NodeMetrics {
            loaded: counter(&registry, "hop_nodes_loaded_total", "Nodes read from storage")?,
            written: counter(&registry, "hop_nodes_written_total", "Nodes written to storage")?,
            deleted: counter(&registry, "hop_nodes_deleted_total", "Nodes deleted from storage")?,
            inconsistent_segments: counter(
                &registry,
                "hop_inconsistent_segment_loads_total",
                "Segment loads returning an unexpected number of rows",
            )?,
        };

        let commit_duration = Histogram::with_opts(
            HistogramOpts::new("hop_commit_duration_seconds", "Duration of transaction commits")
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;
        registry.register(Box::new(commit_duration.clone()))?;
        let transactions = TransactionMetrics {
            committed: counter(&registry, "hop_transactions_committed_total", "Committed transactions")?,
            aborted: counter(&registry, "hop_transactions_aborted_total", "Aborted transactions")?,
            commit_duration,
        };

        Ok(Self {
            registry,
            cache,
            nodes,
            transactions,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// All metrics in the Prometheus text format
    pub fn collect(&self) -> String {
        let encoder = prometheus::TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

/// Timer recording into a histogram when finished
pub struct Timer {
    start: Instant,
    histogram: Histogram,
}

impl Timer {
    pub fn start(histogram: &Histogram) -> Self {
        Self {
            start: Instant::now(),
            histogram: histogram.clone(),
        }
    }

    /// Record the elapsed time and consume the timer
    pub fn finish(self) {
        self.histogram.observe(self.start.elapsed().as_secs_f64());
    }
}
