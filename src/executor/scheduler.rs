//! Ramp scheduler: grows and shrinks the virtual user population so that it
//! follows the staged target curve.

use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{ConfigError, LaunchError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    pub target: u64,
}

/// Piecewise-linear target concurrency over time, starting from zero.
#[derive(Debug, Clone)]
pub struct RampPlan {
    stages: Vec<Stage>,
    total: Duration,
}

impl RampPlan {
    pub fn new(stages: Vec<Stage>) -> Result<Self, ConfigError> {
        if stages.is_empty() {
            return Err(ConfigError::Stages("at least one stage is required".into()));
        }
        let total = stages
            .iter()
            .try_fold(Duration::ZERO, |acc, s| acc.checked_add(s.duration))
            .ok_or_else(|| ConfigError::Stages("total duration overflows".into()))?;
        if total.is_zero() {
            return Err(ConfigError::Stages("total stage duration must be positive".into()));
        }
        Ok(Self { stages, total })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn total_duration(&self) -> Duration {
        self.total
    }

    pub fn peak_target(&self) -> u64 {
        self.stages.iter().map(|s| s.target).max().unwrap_or(0)
    }

    /// Target concurrency at `elapsed`, interpolated linearly from the
    /// previous stage's target and rounded to the nearest user. Past the end
    /// of the plan the final target holds.
    pub fn target_at(&self, elapsed: Duration) -> u64 {
        let mut from = 0u64;
        let mut stage_start = Duration::ZERO;
        for stage in &self.stages {
            let stage_end = stage_start + stage.duration;
            if elapsed < stage_end {
                let progress = (elapsed - stage_start).as_secs_f64() / stage.duration.as_secs_f64();
                let value = from as f64 + (stage.target as f64 - from as f64) * progress;
                return value.round().max(0.0) as u64;
            }
            from = stage.target;
            stage_start = stage_end;
        }
        from
    }
}

/// Handle on one running virtual user.
#[derive(Debug)]
pub struct VuHandle {
    pub id: u64,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl VuHandle {
    pub fn new(id: u64, stop: CancellationToken, task: JoinHandle<()>) -> Self {
        Self { id, stop, task }
    }

    /// Asks the user to stop at its next iteration boundary.
    fn request_stop(&self) {
        self.stop.cancel();
    }

    fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Starts virtual user workers on behalf of the scheduler.
pub trait VuLauncher {
    fn launch(&mut self, id: u64) -> Result<VuHandle, LaunchError>;
}

/// What one scheduling tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub target: u64,
    pub active: usize,
    pub started: usize,
    pub stopped: usize,
    pub launch_failed: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RampSummary {
    pub vus_started: u64,
    pub peak_active: usize,
    pub launch_failures: u64,
    pub forced_cancel: bool,
}

pub struct RampScheduler<L> {
    plan: RampPlan,
    launcher: L,
    active: Vec<VuHandle>,
    draining: Vec<VuHandle>,
    next_id: u64,
    summary: RampSummary,
}

impl<L: VuLauncher> RampScheduler<L> {
    pub fn new(plan: RampPlan, launcher: L) -> Self {
        Self {
            plan,
            launcher,
            active: Vec::new(),
            draining: Vec::new(),
            next_id: 1,
            summary: RampSummary::default(),
        }
    }

    pub fn active(&self) -> usize {
        self.active.len()
    }

    pub fn draining(&self) -> usize {
        self.draining.len()
    }

    /// Converges the active population towards `target_at(elapsed)`. A
    /// failed launch is left for the next tick.
    pub fn reconcile(&mut self, elapsed: Duration) -> Tick {
        self.active.retain(|vu| !vu.is_finished());
        self.draining.retain(|vu| !vu.is_finished());

        let target = self.plan.target_at(elapsed);
        let wanted = usize::try_from(target).unwrap_or(usize::MAX);
        let mut tick = Tick {
            target,
            active: 0,
            started: 0,
            stopped: 0,
            launch_failed: false,
        };

        while self.active.len() < wanted {
            match self.launcher.launch(self.next_id) {
                Ok(vu) => {
                    self.next_id += 1;
                    self.active.push(vu);
                    tick.started += 1;
                    self.summary.vus_started += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, target, active = self.active.len(), "virtual user launch failed, retrying next tick");
                    tick.launch_failed = true;
                    self.summary.launch_failures += 1;
                    break;
                }
            }
        }

        while self.active.len() > wanted {
            if let Some(vu) = self.active.pop() {
                vu.request_stop();
                self.draining.push(vu);
                tick.stopped += 1;
            }
        }

        tick.active = self.active.len();
        self.summary.peak_active = self.summary.peak_active.max(tick.active);
        if tick.started > 0 || tick.stopped > 0 {
            tracing::debug!(
                target,
                active = tick.active,
                started = tick.started,
                stopped = tick.stopped,
                "scheduler tick"
            );
        }
        tick
    }

    /// Follows the plan until its total duration is exhausted (or `hard_stop`
    /// fires), then drains every user. Users still running `graceful_stop`
    /// after the drain request are force-cancelled through `hard_stop`.
    pub async fn run(
        mut self,
        tick_every: Duration,
        graceful_stop: Duration,
        hard_stop: &CancellationToken,
    ) -> RampSummary {
        let start = Instant::now();
        let total = self.plan.total_duration();
        let mut ticker = interval(tick_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = hard_stop.cancelled() => {
                    tracing::warn!("run cancelled before stages completed");
                    break;
                }
                _ = ticker.tick() => {
                    let elapsed = start.elapsed();
                    if elapsed >= total {
                        break;
                    }
                    self.reconcile(elapsed);
                }
            }
        }

        tracing::info!(
            active = self.active.len(),
            draining = self.draining.len(),
            "stages complete, draining virtual users"
        );
        for vu in self.active.drain(..) {
            vu.request_stop();
            self.draining.push(vu);
        }

        let deadline = Instant::now() + graceful_stop;
        let mut forced = hard_stop.is_cancelled();
        for vu in self.draining.drain(..) {
            let mut task = vu.task;
            if !forced {
                tokio::select! {
                    res = &mut task => {
                        log_join(vu.id, res);
                        continue;
                    }
                    _ = sleep_until(deadline) => {
                        tracing::warn!(
                            graceful_stop_ms = graceful_stop.as_millis() as u64,
                            "graceful stop expired, cancelling in-flight requests"
                        );
                        hard_stop.cancel();
                        forced = true;
                    }
                }
            }
            log_join(vu.id, task.await);
        }

        self.summary.forced_cancel = forced;
        self.summary
    }
}

fn log_join(id: u64, res: Result<(), tokio::task::JoinError>) {
    if let Err(e) = res {
        tracing::error!(vu = id, error = %e, "virtual user task failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn plan(stages: &[(u64, u64)]) -> RampPlan {
        RampPlan::new(
            stages
                .iter()
                .map(|&(d, target)| Stage {
                    duration: secs(d),
                    target,
                })
                .collect(),
        )
        .unwrap()
    }

    /// Workers that exit as soon as they are asked to stop.
    #[derive(Default)]
    struct ObedientLauncher {
        fail_first: usize,
        attempts: Arc<AtomicUsize>,
    }

    impl VuLauncher for ObedientLauncher {
        fn launch(&mut self, id: u64) -> Result<VuHandle, LaunchError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_first {
                return Err(LaunchError::SlotsExhausted(0));
            }
            let stop = CancellationToken::new();
            let token = stop.clone();
            let task = tokio::spawn(async move { token.cancelled().await });
            Ok(VuHandle::new(id, stop, task))
        }
    }

    /// Workers that ignore graceful stop and only end on the hard deadline.
    struct StubbornLauncher {
        hard_stop: CancellationToken,
    }

    impl VuLauncher for StubbornLauncher {
        fn launch(&mut self, id: u64) -> Result<VuHandle, LaunchError> {
            let hard = self.hard_stop.clone();
            let task = tokio::spawn(async move { hard.cancelled().await });
            Ok(VuHandle::new(id, CancellationToken::new(), task))
        }
    }

    #[test]
    fn target_interpolates_linearly_between_stages() {
        let p = plan(&[(10, 10), (10, 10), (10, 0)]);
        assert_eq!(p.target_at(secs(0)), 0);
        assert_eq!(p.target_at(secs(5)), 5);
        assert_eq!(p.target_at(Duration::from_millis(9_999)), 10);
        assert_eq!(p.target_at(secs(10)), 10);
        assert_eq!(p.target_at(secs(15)), 10);
        assert_eq!(p.target_at(secs(25)), 5);
        assert_eq!(p.target_at(secs(30)), 0);
        assert_eq!(p.target_at(secs(300)), 0);
        assert_eq!(p.total_duration(), secs(30));
        assert_eq!(p.peak_target(), 10);
    }

    #[test]
    fn zero_length_stage_jumps() {
        let p = plan(&[(0, 8), (10, 8)]);
        assert_eq!(p.target_at(secs(0)), 8);
        assert_eq!(p.target_at(secs(9)), 8);
    }

    #[test]
    fn invalid_stage_plans() {
        assert!(RampPlan::new(vec![]).is_err());
        assert!(RampPlan::new(vec![Stage {
            duration: Duration::ZERO,
            target: 3
        }])
        .is_err());
    }

    #[tokio::test]
    async fn active_users_track_interpolated_target() {
        let p = plan(&[(10, 20), (10, 20), (10, 5)]);
        let mut scheduler = RampScheduler::new(p.clone(), ObedientLauncher::default());

        for ms in (0..30_000u64).step_by(250) {
            let elapsed = Duration::from_millis(ms);
            let tick = scheduler.reconcile(elapsed);
            let secs_f = ms as f64 / 1000.0;
            let exact = if secs_f < 10.0 {
                2.0 * secs_f
            } else if secs_f < 20.0 {
                20.0
            } else {
                20.0 - 1.5 * (secs_f - 20.0)
            };
            assert!(
                (tick.active as f64 - exact).abs() <= 1.0,
                "at {ms}ms active={} exact={exact}",
                tick.active
            );
            assert_eq!(tick.active as u64, tick.target);
        }
    }

    #[tokio::test]
    async fn scaling_down_stops_most_recent_users() {
        let mut scheduler = RampScheduler::new(plan(&[(10, 4), (10, 0)]), ObedientLauncher::default());
        let up = scheduler.reconcile(secs(10));
        assert_eq!((up.started, up.active), (4, 4));
        let down = scheduler.reconcile(secs(15));
        assert_eq!((down.stopped, down.active), (2, 2));
        assert_eq!(scheduler.active[0].id, 1);
        assert_eq!(scheduler.active[1].id, 2);
        assert_eq!(scheduler.draining(), 2);
    }

    #[tokio::test]
    async fn failed_launch_is_retried_next_tick() {
        let launcher = ObedientLauncher {
            fail_first: 1,
            ..Default::default()
        };
        let mut scheduler = RampScheduler::new(plan(&[(1, 3), (10, 3)]), launcher);

        let first = scheduler.reconcile(secs(2));
        assert!(first.launch_failed);
        assert_eq!(first.active, 0);

        let second = scheduler.reconcile(secs(3));
        assert!(!second.launch_failed);
        assert_eq!(second.active, 3);
        assert_eq!(scheduler.summary.launch_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_drains_to_zero_when_stages_end() {
        let hard_stop = CancellationToken::new();
        let scheduler = RampScheduler::new(plan(&[(2, 4), (2, 4)]), ObedientLauncher::default());
        let summary = scheduler
            .run(Duration::from_millis(100), secs(5), &hard_stop)
            .await;

        assert_eq!(summary.peak_active, 4);
        assert!(summary.vus_started >= 4);
        assert!(!summary.forced_cancel);
        assert!(!hard_stop.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_stop_expiry_fires_hard_stop() {
        let hard_stop = CancellationToken::new();
        let launcher = StubbornLauncher {
            hard_stop: hard_stop.clone(),
        };
        let scheduler = RampScheduler::new(plan(&[(1, 2)]), launcher);
        let summary = scheduler
            .run(Duration::from_millis(100), secs(1), &hard_stop)
            .await;

        assert!(summary.forced_cancel);
        assert!(hard_stop.is_cancelled());
    }
}
