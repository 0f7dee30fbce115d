//! Observability side interface. The core calls into a `MetricsSink` for
//! named counters/gauges/histograms; it never owns a Prometheus exporter
//! itself — that's the consuming application's collaborator to wire up,
//! same as structured logging's presentation layer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub trait MetricsSink: Send + Sync {
    fn counter(&self, name: &str, labels: &[(&str, &str)], value: u64);
    fn gauge(&self, name: &str, labels: &[(&str, &str)], value: f64);
    fn histogram(&self, name: &str, labels: &[(&str, &str)], value_ms: f64);
}

/// Default sink: discards everything. Used when the caller doesn't
/// configure one.
#[derive(Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn counter(&self, _name: &str, _labels: &[(&str, &str)], _value: u64) {}
    fn gauge(&self, _name: &str, _labels: &[(&str, &str)], _value: f64) {}
    fn histogram(&self, _name: &str, _labels: &[(&str, &str)], _value_ms: f64) {}
}

/// Emits every signal as a tracing event at debug level — useful in
/// development or when metrics are scraped from logs rather than a
/// dedicated exporter.
#[derive(Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn counter(&self, name: &str, labels: &[(&str, &str)], value: u64) {
        tracing::debug!(metric = name, kind = "counter", ?labels, value, "metric");
    }
    fn gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        tracing::debug!(metric = name, kind = "gauge", ?labels, value, "metric");
    }
    fn histogram(&self, name: &str, labels: &[(&str, &str)], value_ms: f64) {
        tracing::debug!(metric = name, kind = "histogram", ?labels, value_ms, "metric");
    }
}

/// In-memory sink used by tests to assert on emitted signals.
#[derive(Default, Clone)]
pub struct CountingMetricsSink {
    pub counters: Arc<std::collections::Mutex<Vec<(String, u64)>>>,
    pub total: Arc<AtomicU64>,
}

impl MetricsSink for CountingMetricsSink {
    fn counter(&self, name: &str, _labels: &[(&str, &str)], value: u64) {
        self.total.fetch_add(value, Ordering::Relaxed);
        self.counters.lock().unwrap().push((name.to_string(), value));
    }
    fn gauge(&self, _name: &str, _labels: &[(&str, &str)], _value: f64) {}
    fn histogram(&self, _name: &str, _labels: &[(&str, &str)], _value_ms: f64) {}
}

impl CountingMetricsSink {
    pub fn count_of(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v)
            .sum()
    }
}
