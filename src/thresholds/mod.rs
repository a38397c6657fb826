//! Pass/fail rules over aggregated metrics.
//!
//! Rules are parsed and checked against the declared metric set before the
//! run starts. Evaluation is a pure function of a snapshot, so evaluating the
//! same frozen snapshot twice always yields the same verdict.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::error::ConfigError;
use crate::metrics::MetricRegistry;
use crate::models::dsl_model::ThresholdExprs;
use crate::models::metrics::{MetricKind, MetricSnapshot, MetricsSnapshot};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregation {
    Avg,
    Min,
    Max,
    Med,
    Percentile(f64),
    Count,
    Rate,
}

impl Aggregation {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "avg" => Some(Aggregation::Avg),
            "min" => Some(Aggregation::Min),
            "max" => Some(Aggregation::Max),
            "med" => Some(Aggregation::Med),
            "count" => Some(Aggregation::Count),
            "rate" => Some(Aggregation::Rate),
            _ => {
                let p = raw.strip_prefix("p(")?.strip_suffix(')')?;
                let p: f64 = p.trim().parse().ok()?;
                (0.0..=100.0).contains(&p).then_some(Aggregation::Percentile(p))
            }
        }
    }

    fn supports(self, kind: MetricKind) -> bool {
        match kind {
            MetricKind::Counter => matches!(self, Aggregation::Count),
            MetricKind::Rate => matches!(self, Aggregation::Rate | Aggregation::Count),
            MetricKind::Trend => !matches!(self, Aggregation::Rate),
        }
    }

    fn observe(self, metric: &MetricSnapshot) -> f64 {
        match (self, metric) {
            (Aggregation::Count, m) => m.count() as f64,
            (Aggregation::Rate, m) => m.rate().unwrap_or(0.0),
            (Aggregation::Avg, MetricSnapshot::Trend(t)) => t.mean_ms(),
            (Aggregation::Min, MetricSnapshot::Trend(t)) => t.min_ms(),
            (Aggregation::Max, MetricSnapshot::Trend(t)) => t.max_ms(),
            (Aggregation::Med, MetricSnapshot::Trend(t)) => t.percentile_ms(50.0),
            (Aggregation::Percentile(p), MetricSnapshot::Trend(t)) => t.percentile_ms(p),
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    fn holds(self, observed: f64, bound: f64) -> bool {
        match self {
            Comparison::Lt => observed < bound,
            Comparison::Le => observed <= bound,
            Comparison::Gt => observed > bound,
            Comparison::Ge => observed >= bound,
            Comparison::Eq => observed == bound,
            Comparison::Ne => observed != bound,
        }
    }
}

/// One declared comparison, e.g. `p(95)<2000` on `http_req_duration`.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdRule {
    pub metric: String,
    pub expression: String,
    aggregation: Aggregation,
    comparison: Comparison,
    bound: f64,
}

impl ThresholdRule {
    pub fn parse(metric: &str, expression: &str, kind: MetricKind) -> Result<Self, ConfigError> {
        let invalid = |message: &str| ConfigError::Threshold {
            metric: metric.to_string(),
            expression: expression.to_string(),
            message: message.to_string(),
        };

        let compact: String = expression.chars().filter(|c| !c.is_whitespace()).collect();
        let Some(op_at) = compact.find(['<', '>', '=', '!']) else {
            return Err(invalid("missing comparison operator"));
        };
        let (lhs, rest) = compact.split_at(op_at);
        let (comparison, rhs) = if let Some(rhs) = rest.strip_prefix("<=") {
            (Comparison::Le, rhs)
        } else if let Some(rhs) = rest.strip_prefix(">=") {
            (Comparison::Ge, rhs)
        } else if let Some(rhs) = rest.strip_prefix("==") {
            (Comparison::Eq, rhs)
        } else if let Some(rhs) = rest.strip_prefix("!=") {
            (Comparison::Ne, rhs)
        } else if let Some(rhs) = rest.strip_prefix('<') {
            (Comparison::Lt, rhs)
        } else if let Some(rhs) = rest.strip_prefix('>') {
            (Comparison::Gt, rhs)
        } else {
            return Err(invalid("unknown comparison operator"));
        };

        let aggregation =
            Aggregation::parse(lhs).ok_or_else(|| invalid("unknown aggregation"))?;
        if !aggregation.supports(kind) {
            return Err(invalid(&format!("aggregation not available on a {kind} metric")));
        }
        let bound: f64 = rhs
            .parse()
            .map_err(|_| invalid("right-hand side is not a number"))?;
        if !bound.is_finite() {
            return Err(invalid("right-hand side is not finite"));
        }

        Ok(Self {
            metric: metric.to_string(),
            expression: expression.to_string(),
            aggregation,
            comparison,
            bound,
        })
    }

    /// The rule's aggregate over the snapshot; a metric with no observations
    /// (or absent from the snapshot) aggregates to 0.
    pub fn observe(&self, snapshot: &MetricsSnapshot) -> f64 {
        snapshot
            .get(&self.metric)
            .map(|m| self.aggregation.observe(m))
            .unwrap_or(0.0)
    }

    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> RuleResult {
        let observed = self.observe(snapshot);
        RuleResult {
            metric: self.metric.clone(),
            expression: self.expression.clone(),
            observed,
            passed: self.comparison.holds(observed, self.bound),
        }
    }
}

impl fmt::Display for ThresholdRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.metric, self.expression)
    }
}

/// Parses every declared threshold, rejecting unknown metrics.
pub fn compile(
    thresholds: &BTreeMap<String, ThresholdExprs>,
    registry: &MetricRegistry,
) -> Result<Vec<ThresholdRule>, ConfigError> {
    let mut rules = Vec::new();
    for (metric, exprs) in thresholds {
        let kind = registry
            .kind_of(metric)
            .ok_or_else(|| ConfigError::UnknownMetric(metric.clone()))?;
        for expr in exprs.iter() {
            rules.push(ThresholdRule::parse(metric, expr, kind)?);
        }
    }
    Ok(rules)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleResult {
    pub metric: String,
    pub expression: String,
    pub observed: f64,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub passed: bool,
    pub results: Vec<RuleResult>,
}

impl Verdict {
    pub fn failing(&self) -> impl Iterator<Item = &RuleResult> {
        self.results.iter().filter(|r| !r.passed)
    }
}

/// PASS iff every rule holds. No rules means PASS.
pub fn evaluate(rules: &[ThresholdRule], snapshot: &MetricsSnapshot) -> Verdict {
    let results: Vec<RuleResult> = rules.iter().map(|r| r.evaluate(snapshot)).collect();
    Verdict {
        passed: results.iter().all(|r| r.passed),
        results,
    }
}
