pub mod scheduler;
pub mod summary;
pub mod vu;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::client::build_client;
use crate::error::ConfigError;
use crate::metrics::MetricRegistry;
use crate::models::dsl_model::TestPlan;
use crate::models::metrics::MetricSummary;
use crate::scenario::{self, CompiledPlan};
use crate::thresholds::{self, Verdict};
use crate::utils::hardware::{get_hardware_info, HostInfo};

use self::scheduler::{RampScheduler, RampSummary};
use self::vu::{RunContext, TaskLauncher};

/// Everything known about a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub name: String,
    pub target: String,
    pub timestamp: String,
    pub duration_secs: f64,
    pub host: HostInfo,
    pub ramp: RampSummary,
    pub metrics: BTreeMap<String, MetricSummary>,
    pub thresholds: Verdict,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.thresholds.passed
    }
}

/// Validates a plan and runs it to completion with a fresh registry.
pub async fn run_plan(plan: TestPlan, hard_stop: CancellationToken) -> Result<RunReport, ConfigError> {
    let registry = Arc::new(MetricRegistry::new());
    let compiled = scenario::compile(plan, &registry)?;
    Ok(run_load_test(compiled, registry, hard_stop).await)
}

/// Drives the ramp until every stage has elapsed and every virtual user has
/// drained, then freezes the metrics and evaluates thresholds. Cancelling
/// `hard_stop` ends the run early.
pub async fn run_load_test(
    plan: CompiledPlan,
    registry: Arc<MetricRegistry>,
    hard_stop: CancellationToken,
) -> RunReport {
    let host = get_hardware_info();
    tracing::info!(
        plan = %plan.name,
        target = %plan.base_url,
        stages = plan.ramp.stages().len(),
        duration = %humantime::format_duration(plan.ramp.total_duration()),
        max_vus = plan.max_vus,
        cpu_cores = host.cpu_cores,
        available_memory = host.available_memory,
        "starting load test"
    );

    let plan = Arc::new(plan);
    let started = Instant::now();
    let watcher = plan
        .threshold_check_interval
        .map(|every| spawn_threshold_watcher(Arc::clone(&plan), Arc::clone(&registry), every));

    let ctx = Arc::new(RunContext {
        plan: Arc::clone(&plan),
        registry: Arc::clone(&registry),
        client: build_client(),
        hard_stop: hard_stop.clone(),
    });
    let launcher = TaskLauncher::new(ctx, plan.max_vus);
    let ramp = RampScheduler::new(plan.ramp.clone(), launcher)
        .run(plan.tick, plan.graceful_stop, &hard_stop)
        .await;

    if let Some(watcher) = watcher {
        watcher.abort();
    }

    let snapshot = registry.snapshot();
    let verdict = thresholds::evaluate(&plan.thresholds, &snapshot);
    for failed in verdict.failing() {
        tracing::warn!(
            metric = %failed.metric,
            expression = %failed.expression,
            observed = failed.observed,
            "threshold failed"
        );
    }
    tracing::info!(
        passed = verdict.passed,
        rules = verdict.results.len(),
        elapsed = %humantime::format_duration(Duration::from_secs(started.elapsed().as_secs())),
        "load test finished"
    );

    RunReport {
        name: plan.name.clone(),
        target: plan.base_url.to_string(),
        timestamp: Local::now().format("%Y/%m/%d %H:%M:%S").to_string(),
        duration_secs: started.elapsed().as_secs_f64(),
        host,
        ramp,
        metrics: snapshot.summaries(),
        thresholds: verdict,
    }
}

fn spawn_threshold_watcher(
    plan: Arc<CompiledPlan>,
    registry: Arc<MetricRegistry>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let verdict = thresholds::evaluate(&plan.thresholds, &registry.snapshot());
            for failing in verdict.failing() {
                tracing::warn!(
                    metric = %failing.metric,
                    expression = %failing.expression,
                    observed = failing.observed,
                    "threshold currently failing"
                );
            }
        }
    })
}
