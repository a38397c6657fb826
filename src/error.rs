use thiserror::Error;

use crate::models::metrics::MetricKind;

/// Problems detected while loading or compiling a test plan.
///
/// Every variant is fatal before the run starts: no virtual user is ever
/// launched for a plan that produced one of these.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read plan: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse plan: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid base url `{url}`: {reason}")]
    BaseUrl { url: String, reason: String },

    #[error("stage plan is invalid: {0}")]
    Stages(String),

    #[error("scenario has no steps")]
    EmptyScenario,

    #[error("step `{step}`: {message}")]
    Step { step: String, message: String },

    #[error("template `{template}`: {message}")]
    Template { template: String, message: String },

    #[error("step `{step}` references undeclared binding `{binding}` with no fallback")]
    UndeclaredBinding { step: String, binding: String },

    #[error("metric `{name}` declared as {existing} and {requested}")]
    MetricKindConflict {
        name: String,
        existing: MetricKind,
        requested: MetricKind,
    },

    #[error("threshold references unknown metric `{0}`")]
    UnknownMetric(String),

    #[error("threshold `{expression}` on `{metric}`: {message}")]
    Threshold {
        metric: String,
        expression: String,
        message: String,
    },
}

impl ConfigError {
    pub fn step(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Step {
            step: step.into(),
            message: message.into(),
        }
    }

    pub fn template(template: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Template {
            template: template.into(),
            message: message.into(),
        }
    }
}

/// Transport-level failure of a single request. Non-2xx statuses are not
/// errors at this layer; checks decide what they mean.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("connection refused or host unreachable")]
    Connect,

    #[error("timeout")]
    Timeout,

    #[error("connection closed unexpectedly")]
    Closed,

    #[error("cancelled at hard deadline")]
    Cancelled,

    #[error("network error: {0}")]
    Other(String),
}

/// A virtual user could not be started on this tick.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("all {0} virtual user slots are in use")]
    SlotsExhausted(usize),
}
