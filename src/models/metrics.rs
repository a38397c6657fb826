use std::collections::BTreeMap;
use std::fmt;

use hdrhistogram::Histogram;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Rate,
    Trend,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MetricKind::Counter => "counter",
            MetricKind::Rate => "rate",
            MetricKind::Trend => "trend",
        })
    }
}

/// Frozen trend state. Latencies are recorded in microseconds and reported
/// in milliseconds.
#[derive(Debug, Clone)]
pub struct TrendSnapshot {
    pub histogram: Histogram<u64>,
    pub count: u64,
    pub sum_us: u128,
    pub min_us: u64,
    pub max_us: u64,
}

impl TrendSnapshot {
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min_ms(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.min_us as f64 / 1000.0
    }

    pub fn max_ms(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.max_us as f64 / 1000.0
    }

    pub fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum_us as f64 / self.count as f64 / 1000.0
    }

    /// Percentile in milliseconds, `p` in `[0, 100]`. Accurate to the
    /// histogram's three significant digits.
    pub fn percentile_ms(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let q = (p / 100.0).clamp(0.0, 1.0);
        self.histogram.value_at_quantile(q) as f64 / 1000.0
    }
}

#[derive(Debug, Clone)]
pub enum MetricSnapshot {
    Counter { total: u64 },
    Rate { passes: u64, total: u64 },
    Trend(TrendSnapshot),
}

impl MetricSnapshot {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricSnapshot::Counter { .. } => MetricKind::Counter,
            MetricSnapshot::Rate { .. } => MetricKind::Rate,
            MetricSnapshot::Trend(_) => MetricKind::Trend,
        }
    }

    /// Fraction of true observations; 0 when nothing was observed.
    pub fn rate(&self) -> Option<f64> {
        match self {
            MetricSnapshot::Rate { passes, total } => Some(if *total == 0 {
                0.0
            } else {
                *passes as f64 / *total as f64
            }),
            _ => None,
        }
    }

    pub fn count(&self) -> u64 {
        match self {
            MetricSnapshot::Counter { total } => *total,
            MetricSnapshot::Rate { total, .. } => *total,
            MetricSnapshot::Trend(trend) => trend.count(),
        }
    }

    pub fn summary(&self) -> MetricSummary {
        match self {
            MetricSnapshot::Counter { total } => MetricSummary::Counter { count: *total },
            MetricSnapshot::Rate { passes, total } => MetricSummary::Rate {
                rate: self.rate().unwrap_or(0.0),
                passes: *passes,
                fails: total - passes,
            },
            MetricSnapshot::Trend(t) => MetricSummary::Trend {
                count: t.count(),
                avg: t.mean_ms(),
                min: t.min_ms(),
                med: t.percentile_ms(50.0),
                max: t.max_ms(),
                p90: t.percentile_ms(90.0),
                p95: t.percentile_ms(95.0),
                p99: t.percentile_ms(99.0),
            },
        }
    }
}

/// Serializable aggregate of one metric, as printed and exported.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetricSummary {
    Counter {
        count: u64,
    },
    Rate {
        rate: f64,
        passes: u64,
        fails: u64,
    },
    Trend {
        count: u64,
        avg: f64,
        min: f64,
        med: f64,
        max: f64,
        p90: f64,
        p95: f64,
        p99: f64,
    },
}

/// Point-in-time view over every metric of a run.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub metrics: BTreeMap<String, MetricSnapshot>,
}

impl MetricsSnapshot {
    pub fn get(&self, name: &str) -> Option<&MetricSnapshot> {
        self.metrics.get(name)
    }

    pub fn counter(&self, name: &str) -> u64 {
        match self.metrics.get(name) {
            Some(MetricSnapshot::Counter { total }) => *total,
            _ => 0,
        }
    }

    pub fn rate(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).and_then(MetricSnapshot::rate)
    }

    pub fn summaries(&self) -> BTreeMap<String, MetricSummary> {
        self.metrics
            .iter()
            .map(|(name, metric)| (name.clone(), metric.summary()))
            .collect()
    }
}
