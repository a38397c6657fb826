//! Scenario runner: one virtual user's iteration loop.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::client::{self, HttpsClient, RequestOutcome};
use crate::correlation::{self, CorrelationStore};
use crate::error::{ClientError, LaunchError};
use crate::executor::scheduler::{VuHandle, VuLauncher};
use crate::metrics::{MetricRegistry, CHECKS, ITERATIONS, ITERATIONS_ABORTED, ITERATION_DURATION};
use crate::models::dsl_model::ErrorPolicy;
use crate::scenario::check::{self, ResponseView};
use crate::scenario::{CompiledPlan, CompiledStep};
use crate::template::RenderContext;

/// Everything a virtual user shares with the rest of the run.
pub struct RunContext {
    pub plan: Arc<CompiledPlan>,
    pub registry: Arc<MetricRegistry>,
    pub client: HttpsClient,
    pub hard_stop: CancellationToken,
}

/// One simulated client. Bindings survive across its iterations and are
/// dropped with it.
#[derive(Debug)]
pub struct VirtualUser {
    pub id: u64,
    pub iteration: u64,
    pub store: CorrelationStore,
}

impl VirtualUser {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            iteration: 0,
            store: CorrelationStore::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    Transport(ClientError),
    CheckFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    Completed,
    Aborted { step: String, reason: AbortReason },
    Cancelled,
}

/// Runs every step of the scenario once, in order. A required check failure
/// or a transport failure ends the iteration early.
pub async fn run_iteration(ctx: &RunContext, vu: &mut VirtualUser) -> IterationOutcome {
    let started = Instant::now();
    let plan = &ctx.plan;

    for (name, template) in &plan.scenario.bindings {
        let value = {
            let render_ctx = render_context(vu, plan, 1);
            template.render_value(&render_ctx)
        };
        vu.store.bind(name.as_str(), value);
    }

    let mut outcome = IterationOutcome::Completed;
    'steps: for step in &plan.scenario.steps {
        for repetition in 1..=step.repeat {
            if ctx.hard_stop.is_cancelled() {
                outcome = IterationOutcome::Cancelled;
                break 'steps;
            }
            if let Some(stopped) = run_step(ctx, vu, step, repetition).await {
                outcome = stopped;
                break 'steps;
            }
        }
    }

    let registry = &ctx.registry;
    registry.add_trend(ITERATION_DURATION, started.elapsed());
    match &outcome {
        IterationOutcome::Completed => registry.add_counter(ITERATIONS, 1),
        IterationOutcome::Aborted { step, reason } => {
            registry.add_counter(ITERATIONS_ABORTED, 1);
            match reason {
                AbortReason::Transport(e) => tracing::warn!(
                    vu = vu.id,
                    iteration = vu.iteration,
                    step = %step,
                    error = %e,
                    "iteration aborted on transport failure"
                ),
                AbortReason::CheckFailed(check) => tracing::debug!(
                    vu = vu.id,
                    iteration = vu.iteration,
                    step = %step,
                    check = %check,
                    "iteration aborted on failed check"
                ),
            }
        }
        IterationOutcome::Cancelled => registry.add_counter(ITERATIONS_ABORTED, 1),
    }
    vu.iteration += 1;
    outcome
}

fn render_context<'a>(vu: &'a VirtualUser, plan: &'a CompiledPlan, repetition: u32) -> RenderContext<'a> {
    RenderContext {
        vu: vu.id,
        iteration: vu.iteration,
        repetition,
        store: &vu.store,
        vars: &plan.vars,
    }
}

/// Executes one repetition of a step. Returns `Some` when the iteration must
/// stop here.
async fn run_step(
    ctx: &RunContext,
    vu: &mut VirtualUser,
    step: &CompiledStep,
    repetition: u32,
) -> Option<IterationOutcome> {
    let plan = &ctx.plan;
    let registry = &ctx.registry;

    let rendered = {
        let render_ctx = render_context(vu, plan, repetition);
        step.render(&plan.base_url, &render_ctx)
    };
    let exchange = match rendered {
        Ok(request) => {
            client::execute(
                &ctx.client,
                registry,
                &step.series,
                &request,
                plan.timeout,
                &ctx.hard_stop,
            )
            .await
        }
        Err((url, error)) => client::reject(registry, &step.series, &url, error),
    };

    if exchange.outcome == RequestOutcome::Cancelled {
        return Some(IterationOutcome::Cancelled);
    }
    if let Some(trend) = &step.duration_trend {
        registry.add_trend(trend, exchange.elapsed);
    }

    let response = ResponseView::from_exchange(&exchange);
    let mut step_success = exchange.result.is_ok();
    let mut failed_required = None;
    for c in &step.checks {
        let passed = check::evaluate(&c.kind, &response);
        registry.add_rate(CHECKS, passed);
        registry.add_rate(&c.series, passed);
        if !passed {
            step_success = false;
            if c.required && failed_required.is_none() {
                failed_required = Some(c.name.clone());
            }
        }
    }
    if let Some(rate) = &step.success_rate {
        registry.add_rate(rate, step_success);
    }
    if let Some(rate) = &plan.error_rate {
        match step.error_policy {
            ErrorPolicy::OnResult => registry.add_rate(rate, !step_success),
            ErrorPolicy::OnFailure if !step_success => registry.add_rate(rate, true),
            ErrorPolicy::OnFailure | ErrorPolicy::Off => {}
        }
    }

    if let Err(error) = exchange.result {
        return Some(IterationOutcome::Aborted {
            step: step.name.clone(),
            reason: AbortReason::Transport(error),
        });
    }
    if let Some(check) = failed_required {
        return Some(IterationOutcome::Aborted {
            step: step.name.clone(),
            reason: AbortReason::CheckFailed(check),
        });
    }

    for rule in &step.extract {
        let extracted = correlation::extract(rule, response.json.as_ref(), &response.text);
        if !extracted.is_bound() {
            tracing::debug!(
                vu = vu.id,
                step = %step.name,
                binding = %rule.binding,
                result = ?extracted,
                "extraction found nothing"
            );
        }
        vu.store.apply(&rule.binding, extracted);
    }

    let pause = step.think_time.unwrap_or(plan.think_time).sample();
    if !pause.is_zero() {
        tokio::select! {
            _ = ctx.hard_stop.cancelled() => return Some(IterationOutcome::Cancelled),
            _ = tokio::time::sleep(pause) => {}
        }
    }
    None
}

/// Iterates until `stop` is requested (checked between iterations) or the
/// run's hard stop fires.
pub async fn run_virtual_user(ctx: Arc<RunContext>, id: u64, stop: CancellationToken) {
    let mut vu = VirtualUser::new(id);
    tracing::debug!(vu = id, "virtual user started");

    while !stop.is_cancelled() {
        match run_iteration(&ctx, &mut vu).await {
            IterationOutcome::Completed => {}
            IterationOutcome::Aborted { .. } => {
                let pause = ctx.plan.think_time.sample();
                if !pause.is_zero() {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = ctx.hard_stop.cancelled() => break,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
            }
            IterationOutcome::Cancelled => break,
        }
        // Iterations that never touch the network must not starve the scheduler.
        tokio::task::yield_now().await;
    }

    tracing::debug!(vu = id, iterations = vu.iteration, "virtual user stopped");
}

/// Spawns virtual users as tokio tasks, each holding one of `max_vus` slots
/// until it exits.
pub struct TaskLauncher {
    ctx: Arc<RunContext>,
    slots: Arc<Semaphore>,
    max_vus: usize,
}

impl TaskLauncher {
    pub fn new(ctx: Arc<RunContext>, max_vus: usize) -> Self {
        Self {
            ctx,
            slots: Arc::new(Semaphore::new(max_vus)),
            max_vus,
        }
    }
}

impl VuLauncher for TaskLauncher {
    fn launch(&mut self, id: u64) -> Result<VuHandle, LaunchError> {
        let permit = Arc::clone(&self.slots)
            .try_acquire_owned()
            .map_err(|_| LaunchError::SlotsExhausted(self.max_vus))?;
        let stop = CancellationToken::new();
        let ctx = Arc::clone(&self.ctx);
        let vu_stop = stop.clone();
        let task = tokio::spawn(async move {
            run_virtual_user(ctx, id, vu_stop).await;
            drop(permit);
        });
        Ok(VuHandle::new(id, stop, task))
    }
}

