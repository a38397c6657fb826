//! Run-scoped metric registry.
//!
//! One registry is constructed per run and shared by every virtual user.
//! Counters are lock-free; rates and trends take a short per-metric lock so
//! that a snapshot never observes half of an observation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hdrhistogram::Histogram;
use parking_lot::{Mutex, RwLock};

use crate::error::ConfigError;
use crate::models::metrics::{MetricKind, MetricSnapshot, MetricsSnapshot, TrendSnapshot};

pub const HTTP_REQS: &str = "http_reqs";
pub const HTTP_REQ_DURATION: &str = "http_req_duration";
pub const HTTP_REQ_FAILED: &str = "http_req_failed";
pub const HTTP_REQ_OUTCOME: &str = "http_req_outcome";
pub const CHECKS: &str = "checks";
pub const ITERATIONS: &str = "iterations";
pub const ITERATIONS_ABORTED: &str = "iterations_aborted";
pub const ITERATION_DURATION: &str = "iteration_duration";

const HISTOGRAM_SIGFIG: u8 = 3;

/// Builds a tagged series name, e.g. `http_req_duration{step:login}`.
pub fn tagged(metric: &str, tags: &[(&str, &str)]) -> String {
    let tags = tags
        .iter()
        .map(|(k, v)| format!("{k}:{v}"))
        .collect::<Vec<_>>()
        .join(",");
    format!("{metric}{{{tags}}}")
}

#[derive(Debug, Default)]
struct RateCell {
    passes: u64,
    total: u64,
}

#[derive(Debug)]
struct TrendCell {
    histogram: Histogram<u64>,
    sum_us: u128,
    min_us: u64,
    max_us: u64,
}

impl TrendCell {
    fn new() -> Self {
        Self {
            histogram: Histogram::new(HISTOGRAM_SIGFIG)
                .unwrap_or_else(|_| unreachable!("3 significant figures is a valid precision")),
            sum_us: 0,
            min_us: u64::MAX,
            max_us: 0,
        }
    }

    fn record(&mut self, value_us: u64) {
        self.histogram.saturating_record(value_us);
        self.sum_us += u128::from(value_us);
        self.min_us = self.min_us.min(value_us);
        self.max_us = self.max_us.max(value_us);
    }
}

#[derive(Debug)]
enum Metric {
    Counter(AtomicU64),
    Rate(Mutex<RateCell>),
    Trend(Mutex<TrendCell>),
}

impl Metric {
    fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Metric::Counter(AtomicU64::new(0)),
            MetricKind::Rate => Metric::Rate(Mutex::new(RateCell::default())),
            MetricKind::Trend => Metric::Trend(Mutex::new(TrendCell::new())),
        }
    }

    fn kind(&self) -> MetricKind {
        match self {
            Metric::Counter(_) => MetricKind::Counter,
            Metric::Rate(_) => MetricKind::Rate,
            Metric::Trend(_) => MetricKind::Trend,
        }
    }

    fn snapshot(&self) -> MetricSnapshot {
        match self {
            Metric::Counter(total) => MetricSnapshot::Counter {
                total: total.load(Ordering::Acquire),
            },
            Metric::Rate(cell) => {
                let cell = cell.lock();
                MetricSnapshot::Rate {
                    passes: cell.passes,
                    total: cell.total,
                }
            }
            Metric::Trend(cell) => {
                let cell = cell.lock();
                MetricSnapshot::Trend(TrendSnapshot {
                    histogram: cell.histogram.clone(),
                    count: cell.histogram.len(),
                    sum_us: cell.sum_us,
                    min_us: cell.min_us,
                    max_us: cell.max_us,
                })
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MetricRegistry {
    metrics: RwLock<HashMap<String, Arc<Metric>>>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a metric ahead of the run. Declaring the same name twice with
    /// the same kind is a no-op.
    pub fn declare(&self, name: &str, kind: MetricKind) -> Result<(), ConfigError> {
        let mut metrics = self.metrics.write();
        if let Some(existing) = metrics.get(name) {
            if existing.kind() != kind {
                return Err(ConfigError::MetricKindConflict {
                    name: name.to_string(),
                    existing: existing.kind(),
                    requested: kind,
                });
            }
            return Ok(());
        }
        metrics.insert(name.to_string(), Arc::new(Metric::new(kind)));
        Ok(())
    }

    pub fn kind_of(&self, name: &str) -> Option<MetricKind> {
        self.metrics.read().get(name).map(|m| m.kind())
    }

    pub fn add_counter(&self, name: &str, delta: u64) {
        if let Some(Metric::Counter(total)) = self.metric(name, MetricKind::Counter).as_deref() {
            total.fetch_add(delta, Ordering::AcqRel);
        }
    }

    pub fn add_rate(&self, name: &str, value: bool) {
        if let Some(Metric::Rate(cell)) = self.metric(name, MetricKind::Rate).as_deref() {
            let mut cell = cell.lock();
            cell.total += 1;
            if value {
                cell.passes += 1;
            }
        }
    }

    pub fn add_trend(&self, name: &str, value: Duration) {
        if let Some(Metric::Trend(cell)) = self.metric(name, MetricKind::Trend).as_deref() {
            let value_us = u64::try_from(value.as_micros()).unwrap_or(u64::MAX);
            cell.lock().record(value_us);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let metrics = self.metrics.read();
        MetricsSnapshot {
            metrics: metrics
                .iter()
                .map(|(name, metric)| (name.clone(), metric.snapshot()))
                .collect(),
        }
    }

    /// Looks a metric up, creating it on first write. A write with the wrong
    /// kind is dropped; plan compilation rules that out for built-in names.
    fn metric(&self, name: &str, kind: MetricKind) -> Option<Arc<Metric>> {
        let found = self.metrics.read().get(name).cloned();
        let metric = match found {
            Some(metric) => metric,
            None => self
                .metrics
                .write()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Metric::new(kind)))
                .clone(),
        };
        if metric.kind() != kind {
            tracing::warn!(
                metric = name,
                declared = %metric.kind(),
                written = %kind,
                "observation kind does not match metric kind"
            );
            return None;
        }
        Some(metric)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates_deltas() {
        let registry = MetricRegistry::new();
        registry.add_counter(HTTP_REQS, 2);
        registry.add_counter(HTTP_REQS, 3);
        assert_eq!(registry.snapshot().counter(HTTP_REQS), 5);
    }

    #[test]
    fn rate_is_exact_fraction() {
        let registry = MetricRegistry::new();
        for i in 0..7 {
            registry.add_rate("login_success", i < 3);
        }
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.rate("login_success"), Some(3.0 / 7.0));
    }

    #[test]
    fn empty_rate_reads_zero() {
        let registry = MetricRegistry::new();
        registry.declare("errors", MetricKind::Rate).unwrap();
        assert_eq!(registry.snapshot().rate("errors"), Some(0.0));
    }

    #[test]
    fn concurrent_rate_writers_lose_nothing() {
        let registry = Arc::new(MetricRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        registry.add_rate(CHECKS, (i + t) % 4 != 0);
                        registry.add_counter(HTTP_REQS, 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.counter(HTTP_REQS), 8000);
        match snapshot.get(CHECKS) {
            Some(MetricSnapshot::Rate { passes, total }) => {
                assert_eq!(*total, 8000);
                assert_eq!(*passes, 6000);
            }
            other => panic!("unexpected snapshot {other:?}"),
        }
    }

    #[test]
    fn trend_reports_exact_extremes_and_close_percentiles() {
        let registry = MetricRegistry::new();
        for ms in 1..=100u64 {
            registry.add_trend(HTTP_REQ_DURATION, Duration::from_millis(ms));
        }
        let snapshot = registry.snapshot();
        let Some(MetricSnapshot::Trend(trend)) = snapshot.get(HTTP_REQ_DURATION) else {
            panic!("trend missing");
        };
        assert_eq!(trend.count(), 100);
        assert_eq!(trend.min_ms(), 1.0);
        assert_eq!(trend.max_ms(), 100.0);
        assert!((trend.mean_ms() - 50.5).abs() < 1e-9);
        assert!((trend.percentile_ms(95.0) - 95.0).abs() <= 95.0 * 0.001);
        assert!((trend.percentile_ms(50.0) - 50.0).abs() <= 50.0 * 0.001);
    }

    #[test]
    fn conflicting_declaration_is_rejected() {
        let registry = MetricRegistry::new();
        registry.declare("errors", MetricKind::Rate).unwrap();
        registry.declare("errors", MetricKind::Rate).unwrap();
        let err = registry.declare("errors", MetricKind::Trend).unwrap_err();
        assert!(matches!(err, ConfigError::MetricKindConflict { .. }));
    }

    #[test]
    fn mismatched_write_is_ignored() {
        let registry = MetricRegistry::new();
        registry.declare("errors", MetricKind::Rate).unwrap();
        registry.add_counter("errors", 1);
        assert_eq!(registry.snapshot().rate("errors"), Some(0.0));
    }

    #[test]
    fn tagged_series_names() {
        assert_eq!(
            tagged(HTTP_REQ_DURATION, &[("step", "login")]),
            "http_req_duration{step:login}"
        );
        assert_eq!(
            tagged(HTTP_REQ_OUTCOME, &[("step", "login"), ("outcome", "timeout")]),
            "http_req_outcome{step:login,outcome:timeout}"
        );
    }
}
