//! Metrics collection for TokenLoom
//!
//! Prometheus metrics for the scheduler hot path and the supervisor's
//! process lifecycle. Counters in the decode loop are plain atomics
//! underneath, cheap enough to update once per cycle.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics registry for TokenLoom
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub scheduler: SchedulerMetrics,
    pub supervisor: SupervisorMetrics,
}

/// Batch-scheduler metrics
#[derive(Debug, Clone)]
pub struct SchedulerMetrics {
    /// Sequences currently bound to a cache slot
    pub active_sequences: IntGauge,

    /// Entries per submitted batch
    pub batch_entries: Histogram,

    /// Wall time per decode call
    pub decode_duration: Histogram,

    /// Decode calls that failed
    pub decode_failures: IntCounter,

    /// Tokens sampled across all sequences
    pub tokens_generated_total: IntCounter,

    /// Context-window shifts performed
    pub cache_shifts_total: IntCounter,

    /// Prompt inputs skipped thanks to prefix reuse
    pub prefix_reused_total: IntCounter,
}

/// Supervisor metrics
#[derive(Debug, Clone)]
pub struct SupervisorMetrics {
    /// Runner processes launched
    pub runners_launched_total: IntCounter,

    /// Runner processes that exited unexpectedly
    pub runner_exits_total: IntCounter,

    /// Time from launch to ready
    pub load_duration: Histogram,

    /// Health probes answered "no slot available"
    pub no_slot_retries_total: IntCounter,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let active_sequences = IntGauge::new(
            "loom_active_sequences",
            "Sequences currently bound to a cache slot",
        )
        .unwrap();

        let batch_entries = Histogram::with_opts(
            HistogramOpts::new("loom_batch_entries", "Entries per submitted batch")
                .buckets(vec![1.0, 4.0, 16.0, 64.0, 256.0, 1024.0]),
        )
        .unwrap();

        let decode_duration = Histogram::with_opts(
            HistogramOpts::new("loom_decode_duration_seconds", "Wall time per decode call")
                .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .unwrap();

        let decode_failures =
            IntCounter::new("loom_decode_failures_total", "Decode calls that failed").unwrap();

        let tokens_generated_total = IntCounter::new(
            "loom_tokens_generated_total",
            "Tokens sampled across all sequences",
        )
        .unwrap();

        let cache_shifts_total = IntCounter::new(
            "loom_cache_shifts_total",
            "Context-window shifts performed",
        )
        .unwrap();

        let prefix_reused_total = IntCounter::new(
            "loom_prefix_reused_total",
            "Prompt inputs skipped thanks to prefix reuse",
        )
        .unwrap();

        let runners_launched_total =
            IntCounter::new("loom_runners_launched_total", "Runner processes launched").unwrap();

        let runner_exits_total = IntCounter::new(
            "loom_runner_exits_total",
            "Runner processes that exited unexpectedly",
        )
        .unwrap();

        let load_duration = Histogram::with_opts(
            HistogramOpts::new("loom_load_duration_seconds", "Time from launch to ready")
                .buckets(vec![0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        )
        .unwrap();

        let no_slot_retries_total = IntCounter::new(
            "loom_no_slot_retries_total",
            "Health probes answered no slot available",
        )
        .unwrap();

        for collector in [
            Box::new(active_sequences.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(batch_entries.clone()),
            Box::new(decode_duration.clone()),
            Box::new(decode_failures.clone()),
            Box::new(tokens_generated_total.clone()),
            Box::new(cache_shifts_total.clone()),
            Box::new(prefix_reused_total.clone()),
            Box::new(runners_launched_total.clone()),
            Box::new(runner_exits_total.clone()),
            Box::new(load_duration.clone()),
            Box::new(no_slot_retries_total.clone()),
        ] {
            registry.register(collector).unwrap();
        }

        Self {
            registry,
            scheduler: SchedulerMetrics {
                active_sequences,
                batch_entries,
                decode_duration,
                decode_failures,
                tokens_generated_total,
                cache_shifts_total,
                prefix_reused_total,
            },
            supervisor: SupervisorMetrics {
                runners_launched_total,
                runner_exits_total,
                load_duration,
                no_slot_retries_total,
            },
        }
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_renders() {
        let metrics = MetricsRegistry::new();
        metrics.scheduler.tokens_generated_total.inc_by(3);
        metrics.scheduler.active_sequences.set(2);

        let text = metrics.render();
        assert!(text.contains("loom_tokens_generated_total 3"));
        assert!(text.contains("loom_active_sequences 2"));
    }

    #[test]
    fn global_registry_is_shared() {
        METRICS.scheduler.cache_shifts_total.inc();
        assert!(METRICS.scheduler.cache_shifts_total.get() >= 1);
    }
}
