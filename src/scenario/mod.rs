//! Compiles a [`TestPlan`] into the immutable, validated form the executor
//! interprets. All configuration errors surface here, before any virtual
//! user starts.

pub mod check;

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use url::Url;

use crate::client::{RenderedBody, RenderedRequest, StepSeries};
use crate::error::{ClientError, ConfigError};
use crate::executor::scheduler::{RampPlan, Stage};
use crate::metrics::{
    tagged, MetricRegistry, CHECKS, ITERATIONS, ITERATIONS_ABORTED, ITERATION_DURATION,
};
use crate::models::dsl_model::{
    ApiKeyLocation, Auth, Body, CheckKind, ErrorPolicy, ExtractionRule, StepConfig, TestPlan,
    ThinkTime,
};
use crate::models::metrics::MetricKind;
use crate::template::{JsonTemplate, RenderContext, Template};
use crate::thresholds::{self, ThresholdRule};

pub const BUILTIN_BINDINGS: [&str; 3] = ["__VU", "__ITER", "__REP"];

#[derive(Debug, Clone)]
pub struct CompiledPlan {
    pub name: String,
    pub base_url: Url,
    pub ramp: RampPlan,
    pub thresholds: Vec<ThresholdRule>,
    pub think_time: ThinkTime,
    pub timeout: Duration,
    pub graceful_stop: Duration,
    pub max_vus: usize,
    pub tick: Duration,
    pub threshold_check_interval: Option<Duration>,
    pub vars: BTreeMap<String, Value>,
    pub error_rate: Option<String>,
    pub scenario: CompiledScenario,
}

#[derive(Debug, Clone)]
pub struct CompiledScenario {
    pub bindings: Vec<(String, Template)>,
    pub steps: Vec<CompiledStep>,
}

#[derive(Debug, Clone)]
pub struct CompiledCheck {
    pub name: String,
    pub required: bool,
    pub kind: CheckKind,
    pub series: String,
}

#[derive(Debug, Clone)]
enum CompiledAuth {
    Basic { username: Template, password: Template },
    Bearer { token: Template },
    ApiKey { key_name: String, key_value: Template, add_to: ApiKeyLocation },
}

#[derive(Debug, Clone)]
enum CompiledBody {
    Json(JsonTemplate),
    Xml(Template),
    Text(Template),
}

#[derive(Debug, Clone)]
pub struct CompiledStep {
    pub name: String,
    pub method: hyper::Method,
    url: Template,
    query_params: Vec<(String, Template)>,
    headers: Vec<(String, Template)>,
    auth: Option<CompiledAuth>,
    body: Option<CompiledBody>,
    pub checks: Vec<CompiledCheck>,
    pub extract: Vec<ExtractionRule>,
    pub repeat: u32,
    pub think_time: Option<ThinkTime>,
    pub success_rate: Option<String>,
    pub duration_trend: Option<String>,
    pub error_policy: ErrorPolicy,
    pub series: StepSeries,
}

impl CompiledStep {
    fn compile(config: StepConfig) -> Result<Self, ConfigError> {
        if config.name.trim().is_empty() {
            return Err(ConfigError::step("<unnamed>", "step name must not be empty"));
        }
        if config.repeat == 0 {
            return Err(ConfigError::step(&config.name, "repeat must be at least 1"));
        }

        let templated = |pairs: Option<BTreeMap<String, String>>| {
            pairs
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| Ok((k, Template::compile(&v)?)))
                .collect::<Result<Vec<_>, ConfigError>>()
        };

        let auth = match config.auth {
            None | Some(Auth::None) => None,
            Some(Auth::Basic { username, password }) => Some(CompiledAuth::Basic {
                username: Template::compile(&username)?,
                password: Template::compile(&password)?,
            }),
            Some(Auth::Bearer { token }) => Some(CompiledAuth::Bearer {
                token: Template::compile(&token)?,
            }),
            Some(Auth::ApiKey {
                key_name,
                key_value,
                add_to,
            }) => Some(CompiledAuth::ApiKey {
                key_name,
                key_value: Template::compile(&key_value)?,
                add_to,
            }),
        };

        let body = match config.body {
            None => None,
            Some(Body::Json(value)) => Some(CompiledBody::Json(JsonTemplate::compile(&value)?)),
            Some(Body::Xml(text)) => Some(CompiledBody::Xml(Template::compile(&text)?)),
            Some(Body::Text(text)) => Some(CompiledBody::Text(Template::compile(&text)?)),
        };

        let checks = config
            .checks
            .into_iter()
            .map(|c| CompiledCheck {
                series: tagged(CHECKS, &[("check", c.name.as_str())]),
                name: c.name,
                required: c.required,
                kind: c.kind,
            })
            .collect();

        Ok(Self {
            series: StepSeries::new(&config.name),
            method: config.method.into(),
            url: Template::compile(&config.url)?,
            query_params: templated(config.query_params)?,
            headers: templated(config.headers)?,
            auth,
            body,
            checks,
            extract: config.extract,
            repeat: config.repeat,
            think_time: config.think_time,
            success_rate: config.success_rate,
            duration_trend: config.duration_trend,
            error_policy: config.error_policy,
            name: config.name,
        })
    }

    fn templates(&self) -> Vec<&Template> {
        let mut out = vec![&self.url];
        out.extend(self.query_params.iter().map(|(_, t)| t));
        out.extend(self.headers.iter().map(|(_, t)| t));
        match &self.auth {
            Some(CompiledAuth::Basic { username, password }) => out.extend([username, password]),
            Some(CompiledAuth::Bearer { token }) => out.push(token),
            Some(CompiledAuth::ApiKey { key_value, .. }) => out.push(key_value),
            None => {}
        }
        match &self.body {
            Some(CompiledBody::Json(json)) => out.extend(json.templates()),
            Some(CompiledBody::Xml(t)) | Some(CompiledBody::Text(t)) => out.push(t),
            None => {}
        }
        out
    }

    fn declare_metrics(&self, registry: &MetricRegistry) -> Result<(), ConfigError> {
        self.series.declare(registry)?;
        registry.declare(CHECKS, MetricKind::Rate)?;
        for check in &self.checks {
            registry.declare(&check.series, MetricKind::Rate)?;
        }
        if let Some(rate) = &self.success_rate {
            registry.declare(rate, MetricKind::Rate)?;
        }
        if let Some(trend) = &self.duration_trend {
            registry.declare(trend, MetricKind::Trend)?;
        }
        Ok(())
    }

    /// Renders the request for one repetition. Only a URL that cannot be
    /// parsed after rendering is an error; unset bindings render empty.
    pub fn render(
        &self,
        base_url: &Url,
        ctx: &RenderContext<'_>,
    ) -> Result<RenderedRequest, (String, ClientError)> {
        let raw_url = self.url.render(ctx);
        let mut url = base_url
            .join(&raw_url)
            .map_err(|e| (raw_url.clone(), ClientError::InvalidRequest(e.to_string())))?;

        let mut headers: Vec<(String, String)> = self
            .headers
            .iter()
            .map(|(k, t)| (k.clone(), t.render(ctx)))
            .collect();

        {
            let mut extra_query: Vec<(String, String)> = self
                .query_params
                .iter()
                .map(|(k, t)| (k.clone(), t.render(ctx)))
                .collect();

            match &self.auth {
                Some(CompiledAuth::Basic { username, password }) => {
                    let encoded =
                        BASE64.encode(format!("{}:{}", username.render(ctx), password.render(ctx)));
                    headers.push(("Authorization".into(), format!("Basic {}", encoded)));
                }
                Some(CompiledAuth::Bearer { token }) => {
                    headers.push(("Authorization".into(), format!("Bearer {}", token.render(ctx))));
                }
                Some(CompiledAuth::ApiKey {
                    key_name,
                    key_value,
                    add_to: ApiKeyLocation::Header,
                }) => headers.push((key_name.clone(), key_value.render(ctx))),
                Some(CompiledAuth::ApiKey {
                    key_name,
                    key_value,
                    add_to: ApiKeyLocation::Query,
                }) => extra_query.push((key_name.clone(), key_value.render(ctx))),
                None => {}
            }

            if !extra_query.is_empty() {
                let mut pairs = url.query_pairs_mut();
                for (key, value) in &extra_query {
                    pairs.append_pair(key, value);
                }
            }
        }

        let body = self.body.as_ref().map(|body| match body {
            CompiledBody::Json(json) => RenderedBody {
                content_type: "application/json",
                bytes: json.render(ctx).to_string().into_bytes(),
            },
            CompiledBody::Xml(t) => RenderedBody {
                content_type: "application/xml",
                bytes: t.render(ctx).into_bytes(),
            },
            CompiledBody::Text(t) => RenderedBody {
                content_type: "text/plain",
                bytes: t.render(ctx).into_bytes(),
            },
        });

        Ok(RenderedRequest {
            method: self.method.clone(),
            url: url.to_string(),
            headers,
            body,
        })
    }
}

/// Validates the plan, declares every metric it can write into `registry`,
/// and compiles templates and thresholds.
pub fn compile(plan: TestPlan, registry: &MetricRegistry) -> Result<CompiledPlan, ConfigError> {
    let base_url = Url::parse(&plan.base_url).map_err(|e| ConfigError::BaseUrl {
        url: plan.base_url.clone(),
        reason: e.to_string(),
    })?;
    if base_url.cannot_be_a_base() {
        return Err(ConfigError::BaseUrl {
            url: plan.base_url.clone(),
            reason: "cannot be used as a base".into(),
        });
    }

    let ramp = RampPlan::new(
        plan.stages
            .iter()
            .map(|s| Stage {
                duration: s.duration.into(),
                target: s.target,
            })
            .collect(),
    )?;

    if plan.scenario.steps.is_empty() {
        return Err(ConfigError::EmptyScenario);
    }

    let mut declared: HashSet<String> = BUILTIN_BINDINGS.iter().map(|s| s.to_string()).collect();
    declared.extend(plan.vars.keys().cloned());

    let mut bindings = Vec::with_capacity(plan.scenario.bindings.len());
    for (name, source) in &plan.scenario.bindings {
        let template = Template::compile(source)?;
        check_references("<bindings>", [&template], &declared)?;
        bindings.push((name.clone(), template));
    }
    declared.extend(plan.scenario.bindings.keys().cloned());

    let mut seen_steps = HashSet::new();
    let mut steps = Vec::with_capacity(plan.scenario.steps.len());
    for config in plan.scenario.steps {
        let step = CompiledStep::compile(config)?;
        if !seen_steps.insert(step.name.clone()) {
            return Err(ConfigError::step(&step.name, "duplicate step name"));
        }
        check_references(&step.name, step.templates(), &declared)?;
        declared.extend(step.extract.iter().map(|rule| rule.binding.clone()));
        step.declare_metrics(registry)?;
        steps.push(step);
    }

    registry.declare(ITERATIONS, MetricKind::Counter)?;
    registry.declare(ITERATIONS_ABORTED, MetricKind::Counter)?;
    registry.declare(ITERATION_DURATION, MetricKind::Trend)?;
    if let Some(rate) = &plan.error_rate {
        registry.declare(rate, MetricKind::Rate)?;
    }

    let thresholds = thresholds::compile(&plan.thresholds, registry)?;

    let max_vus = plan
        .max_vus
        .unwrap_or_else(|| ramp.peak_target())
        .max(1);
    let tick: Duration = plan.tick.into();
    if tick.is_zero() {
        return Err(ConfigError::Stages("tick must be greater than zero".into()));
    }

    Ok(CompiledPlan {
        name: plan.name,
        base_url,
        ramp,
        thresholds,
        think_time: plan.think_time,
        timeout: plan.timeout.into(),
        graceful_stop: plan.graceful_stop.into(),
        max_vus: usize::try_from(max_vus).unwrap_or(usize::MAX),
        tick,
        threshold_check_interval: plan
            .threshold_check_interval
            .map(Duration::from)
            .filter(|d| !d.is_zero()),
        vars: plan.vars,
        error_rate: plan.error_rate,
        scenario: CompiledScenario { bindings, steps },
    })
}

fn check_references<'a>(
    step: &str,
    templates: impl IntoIterator<Item = &'a Template>,
    declared: &HashSet<String>,
) -> Result<(), ConfigError> {
    for template in templates {
        for binding in template.bindings() {
            if !binding.has_fallback && !declared.contains(binding.name) {
                return Err(ConfigError::UndeclaredBinding {
                    step: step.to_string(),
                    binding: binding.name.to_string(),
                });
            }
        }
    }
    Ok(())
}
