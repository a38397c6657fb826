use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// A complete test plan document: ramp stages, thresholds and the scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestPlan {
    pub name: String,
    pub base_url: String,
    pub stages: Vec<StageConfig>,

    #[serde(default)]
    pub thresholds: BTreeMap<String, ThresholdExprs>,

    #[serde(default)]
    pub think_time: ThinkTime,

    #[serde(default = "default_timeout")]
    pub timeout: HumanDuration,

    #[serde(default = "default_graceful_stop")]
    pub graceful_stop: HumanDuration,

    #[serde(default)]
    pub max_vus: Option<u64>,

    #[serde(default = "default_tick")]
    pub tick: HumanDuration,

    #[serde(default)]
    pub threshold_check_interval: Option<HumanDuration>,

    #[serde(default)]
    pub vars: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub error_rate: Option<String>,

    pub scenario: ScenarioConfig,
}

fn default_timeout() -> HumanDuration {
    HumanDuration(Duration::from_millis(5000))
}

fn default_graceful_stop() -> HumanDuration {
    HumanDuration(Duration::from_secs(30))
}

fn default_tick() -> HumanDuration {
    HumanDuration(Duration::from_millis(100))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub duration: HumanDuration,
    pub target: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdExprs {
    One(String),
    Many(Vec<String>),
}

impl ThresholdExprs {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let exprs: &[String] = match self {
            ThresholdExprs::One(expr) => std::slice::from_ref(expr),
            ThresholdExprs::Many(exprs) => exprs,
        };
        exprs.iter().map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Templates rendered into the correlation store at the start of every
    /// iteration.
    #[serde(default)]
    pub bindings: BTreeMap<String, String>,

    pub steps: Vec<StepConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    pub name: String,
    pub method: HttpMethod,
    pub url: String,

    #[serde(default)]
    pub query_params: Option<BTreeMap<String, String>>,

    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,

    #[serde(default)]
    pub auth: Option<Auth>,

    #[serde(default)]
    pub body: Option<Body>,

    #[serde(default)]
    pub checks: Vec<CheckConfig>,

    #[serde(default)]
    pub extract: Vec<ExtractionRule>,

    #[serde(default = "default_repeat")]
    pub repeat: u32,

    #[serde(default)]
    pub think_time: Option<ThinkTime>,

    #[serde(default)]
    pub success_rate: Option<String>,

    #[serde(default)]
    pub duration_trend: Option<String>,

    #[serde(default)]
    pub error_policy: ErrorPolicy,
}

fn default_repeat() -> u32 {
    1
}

/// How a step feeds the plan-wide `error_rate` metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// One observation per request: true on failure, false on success.
    #[default]
    OnResult,
    /// A true observation when the step fails, nothing otherwise.
    OnFailure,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    GET,
    POST,
    PUT,
    DELETE,
    PATCH,
    HEAD,
    OPTIONS,
}

impl From<HttpMethod> for hyper::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::GET => hyper::Method::GET,
            HttpMethod::POST => hyper::Method::POST,
            HttpMethod::PUT => hyper::Method::PUT,
            HttpMethod::DELETE => hyper::Method::DELETE,
            HttpMethod::PATCH => hyper::Method::PATCH,
            HttpMethod::HEAD => hyper::Method::HEAD,
            HttpMethod::OPTIONS => hyper::Method::OPTIONS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "content")]
pub enum Body {
    Json(serde_json::Value),
    Xml(String),
    Text(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "credentials")]
pub enum Auth {
    None,
    Basic { username: String, password: String },
    Bearer { token: String },
    ApiKey { key_name: String, key_value: String, add_to: ApiKeyLocation },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyLocation {
    Header,
    Query,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckConfig {
    pub name: String,

    #[serde(default = "default_required")]
    pub required: bool,

    #[serde(flatten)]
    pub kind: CheckKind,
}

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckKind {
    Status { status: u16 },
    StatusRange { min: u16, max: u16 },
    FieldExists { path: String },
    FieldEquals { path: String, value: serde_json::Value },
    FieldNotEmpty { path: String },
    FieldContains { path: String, needle: String },
    IsArray {
        #[serde(default)]
        path: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRule {
    pub binding: String,
    pub source: ExtractionSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionSource {
    /// Point query into the parsed JSON body.
    Json(String),
    /// Text following a delimiter inside a string field (or the raw body).
    Pattern {
        #[serde(default)]
        field: Option<String>,
        delimiter: String,
    },
}

/// Delay between steps: fixed, or uniformly drawn from `[min, max]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThinkTime {
    Fixed(HumanDuration),
    Uniform { min: HumanDuration, max: HumanDuration },
}

impl Default for ThinkTime {
    fn default() -> Self {
        ThinkTime::Fixed(HumanDuration(Duration::ZERO))
    }
}

impl ThinkTime {
    pub fn sample(&self) -> Duration {
        match *self {
            ThinkTime::Fixed(d) => d.0,
            ThinkTime::Uniform { min, max } => {
                use rand::Rng;
                if max.0 <= min.0 {
                    return min.0;
                }
                rand::thread_rng().gen_range(min.0..=max.0)
            }
        }
    }
}

/// Duration accepted as a humantime string (`"1m"`, `"500ms"`) or as whole
/// seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct HumanDuration(pub Duration);

impl From<Duration> for HumanDuration {
    fn from(value: Duration) -> Self {
        Self(value)
    }
}

impl From<HumanDuration> for Duration {
    fn from(value: HumanDuration) -> Self {
        value.0
    }
}

impl Serialize for HumanDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(self.0).to_string())
    }
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct Visitor;

        impl<'de> serde::de::Visitor<'de> for Visitor {
            type Value = HumanDuration;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a duration string (e.g. \"30s\") or whole seconds")
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(HumanDuration(Duration::from_secs(v)))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                u64::try_from(v)
                    .map(|secs| HumanDuration(Duration::from_secs(secs)))
                    .map_err(|_| E::custom("duration must not be negative"))
            }

            fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Duration::try_from_secs_f64(v)
                    .map(HumanDuration)
                    .map_err(E::custom)
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                humantime::parse_duration(v.trim())
                    .map(HumanDuration)
                    .map_err(E::custom)
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_stage_durations_in_both_forms() {
        let stages: Vec<StageConfig> = serde_json::from_value(json!([
            { "duration": "1m", "target": 10 },
            { "duration": 30, "target": 20 },
            { "duration": "500ms", "target": 0 }
        ]))
        .unwrap();
        assert_eq!(stages[0].duration.0, Duration::from_secs(60));
        assert_eq!(stages[1].duration.0, Duration::from_secs(30));
        assert_eq!(stages[2].duration.0, Duration::from_millis(500));
    }

    #[test]
    fn negative_duration_is_rejected() {
        let parsed: Result<StageConfig, _> =
            serde_json::from_value(json!({ "duration": -5, "target": 1 }));
        assert!(parsed.is_err());
    }

    #[test]
    fn out_of_range_duration_is_rejected() {
        let parsed: Result<StageConfig, _> =
            serde_json::from_value(json!({ "duration": 1e30, "target": 1 }));
        assert!(parsed.is_err());
        let parsed: Result<StageConfig, _> =
            serde_json::from_value(json!({ "duration": 1.5, "target": 1 }));
        assert_eq!(parsed.unwrap().duration.0, Duration::from_millis(1500));
    }

    #[test]
    fn think_time_accepts_fixed_and_uniform() {
        let fixed: ThinkTime = serde_json::from_value(json!("1s")).unwrap();
        assert_eq!(fixed.sample(), Duration::from_secs(1));

        let uniform: ThinkTime =
            serde_json::from_value(json!({ "min": "100ms", "max": "200ms" })).unwrap();
        for _ in 0..20 {
            let d = uniform.sample();
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(200));
        }
    }

    #[test]
    fn step_defaults() {
        let step: StepConfig = serde_json::from_value(json!({
            "name": "orders",
            "method": "GET",
            "url": "/orders",
            "checks": [{ "name": "ok", "type": "status", "status": 200 }],
            "extract": [
                { "binding": "token", "source": { "json": "token" } },
                { "binding": "otp", "source": { "pattern": { "field": "message", "delimiter": "Code OTP:" } } }
            ]
        }))
        .unwrap();
        assert_eq!(step.repeat, 1);
        assert!(step.checks[0].required);
        assert!(matches!(step.checks[0].kind, CheckKind::Status { status: 200 }));
        assert!(matches!(step.extract[1].source, ExtractionSource::Pattern { .. }));
        assert_eq!(step.error_policy, ErrorPolicy::OnResult);

        let quiet: StepConfig = serde_json::from_value(json!({
            "name": "orders", "method": "GET", "url": "/orders", "error_policy": "on_failure"
        }))
        .unwrap();
        assert_eq!(quiet.error_policy, ErrorPolicy::OnFailure);
    }

    #[test]
    fn threshold_exprs_accept_one_or_many() {
        let one: ThresholdExprs = serde_json::from_value(json!("rate>0.85")).unwrap();
        let many: ThresholdExprs =
            serde_json::from_value(json!(["p(95)<2000", "p(99)<5000"])).unwrap();
        assert_eq!(one.iter().collect::<Vec<_>>(), vec!["rate>0.85"]);
        assert_eq!(many.iter().count(), 2);
    }
}
