//! Hand-rolled Prometheus-text metrics registry, backed by a `dashmap` for
//! lock-free counter/gauge/histogram lookups. Observable gauges here are
//! pull-based: callers `set()` them from a periodic sampling loop rather than
//! pushing on every change.

use dashmap::DashMap;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to export metrics: {0}")]
    Export(String),
}

#[derive(Debug, Clone, Default)]
pub struct Counter {
    value: Arc<AtomicU64>,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, value: u64) {
        self.value.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Gauge {
    value: Arc<AtomicU64>,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: f64) {
        self.value.store(value as u64, Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        self.value.load(Ordering::Relaxed) as f64
    }
}

#[derive(Debug, Clone)]
pub struct Histogram {
    sum: Arc<AtomicU64>,
    count: Arc<AtomicU64>,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            sum: Arc::new(AtomicU64::new(0)),
            count: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl Histogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, value: f64) {
        self.sum.fetch_add(value as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64
    }
}

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: DashMap<String, Counter>,
    gauges: DashMap<String, Gauge>,
    histograms: DashMap<String, Histogram>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> Counter {
        self.counters.entry(name.to_string()).or_default().clone()
    }

    pub fn gauge(&self, name: &str) -> Gauge {
        self.gauges.entry(name.to_string()).or_default().clone()
    }

    pub fn histogram(&self, name: &str) -> Histogram {
        self.histograms.entry(name.to_string()).or_default().clone()
    }

    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();
        for entry in self.counters.iter() {
            out.push_str(&format!("# TYPE {} counter\n{} {}\n", entry.key(), entry.key(), entry.value().get()));
        }
        for entry in self.gauges.iter() {
            out.push_str(&format!("# TYPE {} gauge\n{} {}\n", entry.key(), entry.key(), entry.value().get()));
        }
        for entry in self.histograms.iter() {
            out.push_str(&format!(
                "# TYPE {} histogram\n{}_count {}\n{}_sum {}\n",
                entry.key(),
                entry.key(),
                entry.value().count(),
                entry.key(),
                entry.value().sum()
            ));
        }
        out
    }

    pub fn export_json(&self) -> serde_json::Value {
        let counters: serde_json::Map<_, _> = self
            .counters
            .iter()
            .map(|e| (e.key().clone(), json!(e.value().get())))
            .collect();
        let gauges: serde_json::Map<_, _> = self
            .gauges
            .iter()
            .map(|e| (e.key().clone(), json!(e.value().get())))
            .collect();
        let histograms: serde_json::Map<_, _> = self
            .histograms
            .iter()
            .map(|e| (e.key().clone(), json!({"count": e.value().count(), "sum": e.value().sum()})))
            .collect();
        json!({ "counters": counters, "gauges": gauges, "histograms": histograms })
    }
}

/// Pre-seeds exactly the counters, gauges, and histograms the Observability
/// Hub is required to expose.
pub struct OrderWorkerMetrics {
    pub registry: Arc<MetricsRegistry>,
    pub messages_received: Counter,
    pub messages_processed: Counter,
    pub messages_failed_transient: Counter,
    pub messages_failed_permanent: Counter,
    pub messages_dead_lettered: Counter,
    pub breaker_state: Gauge,
    pub db_pool_active: Gauge,
    pub db_pool_idle: Gauge,
    pub db_pool_queued: Gauge,
    pub worker_inflight: Gauge,
    pub task_duration: Histogram,
    pub db_call_duration: Histogram,
}

impl OrderWorkerMetrics {
    pub fn new() -> Self {
        let registry = Arc::new(MetricsRegistry::new());
        Self {
            messages_received: registry.counter("messages_received"),
            messages_processed: registry.counter("messages_processed"),
            messages_failed_transient: registry.counter("messages_failed_transient"),
            messages_failed_permanent: registry.counter("messages_failed_permanent"),
            messages_dead_lettered: registry.counter("messages_dead_lettered"),
            breaker_state: registry.gauge("breaker_state"),
            db_pool_active: registry.gauge("db_pool_active"),
            db_pool_idle: registry.gauge("db_pool_idle"),
            db_pool_queued: registry.gauge("db_pool_queued"),
            worker_inflight: registry.gauge("worker_inflight"),
            task_duration: registry.histogram("task_duration"),
            db_call_duration: registry.histogram("db_call_duration"),
            registry,
        }
    }
}

impl Default for OrderWorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_metrics_round_trip_through_the_registry() {
        let metrics = OrderWorkerMetrics::new();
        metrics.messages_received.inc();
        metrics.messages_received.inc();
        metrics.breaker_state.set(1.0);
        metrics.task_duration.observe(12.5);

        let text = metrics.registry.export_prometheus();
        assert!(text.contains("messages_received 2"));
        assert!(text.contains("breaker_state 1"));
        assert!(text.contains("task_duration_count 1"));
    }
}
