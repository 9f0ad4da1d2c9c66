//! Recurring-task scheduler: a coarse tick loop that fires due tasks onto
//! their own tokio tasks and never waits for them.
//!
//! Due times are fixed-rate. A task registered with interval `I` first
//! fires at `start + I`, and every firing advances its due time by exactly
//! `I`, however long the action takes:
//!
//! ```text
//!   tick ─┬─ now >= next_due? ──no──▶ next task
//!         │
//!        yes ──▶ previous still running and policy = Serial? ──yes──▶ skip
//!         │                                                           │
//!         └──────────────▶ spawn action ◀──no─────────────────────────┘
//!                           next_due += I
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::state::SharedState;

/// Shortest dispatch tick; `tokio::time::interval` rejects a zero period.
const MIN_TICK: Duration = Duration::from_millis(10);

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Produces one firing's future. Called from the tick loop, so it must be
/// cheap; the work belongs in the returned future.
pub type TaskAction = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// Wrap an async closure as a [`TaskAction`].
pub fn action<F, Fut>(f: F) -> TaskAction
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// What to do when a task comes due while its previous firing is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPolicy {
    /// Fire anyway; firings may run concurrently.
    AllowOverlap,
    /// Skip this firing. The due time still advances.
    Serial,
}

impl TaskPolicy {
    pub fn from_allow_overlap(allow: bool) -> Self {
        if allow {
            Self::AllowOverlap
        } else {
            Self::Serial
        }
    }
}

// ---------------------------------------------------------------------------
// Tasks and counters
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Counters {
    fired: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    running: AtomicUsize,
}

/// Per-task totals for one `run`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    pub fired: u64,
    pub skipped: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub tasks: BTreeMap<String, TaskStats>,
    /// False if the drain timeout expired with firings still in flight.
    pub drained: bool,
}

pub struct ScheduledTask {
    name: String,
    interval: Duration,
    policy: TaskPolicy,
    action: TaskAction,
    next_due: Option<Instant>,
    counters: Arc<Counters>,
}

impl ScheduledTask {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// Decrements the running count when a firing ends, however it ends.
struct RunningGuard(Arc<Counters>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    tick: Duration,
    drain_timeout: Option<Duration>,
    tasks: Vec<ScheduledTask>,
    shared: SharedState,
}

impl Scheduler {
    pub fn new(tick: Duration, shared: SharedState) -> Self {
        if tick < MIN_TICK {
            warn!(
                tick_ms = tick.as_millis() as u64,
                min_ms = MIN_TICK.as_millis() as u64,
                "scheduler tick too short, clamping"
            );
        }
        Self {
            tick: tick.max(MIN_TICK),
            drain_timeout: None,
            tasks: Vec::new(),
            shared,
        }
    }

    /// Bound how long `run` waits for in-flight firings after cancellation.
    pub fn with_drain_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        interval: Duration,
        policy: TaskPolicy,
        action: TaskAction,
    ) -> Result<()> {
        let name = name.into();
        if interval.is_zero() {
            bail!("task '{name}': interval must be positive");
        }
        if self.tasks.iter().any(|t| t.name == name) {
            bail!("task '{name}' is already registered");
        }
        info!(task = %name, interval_sec = interval.as_secs_f64(), ?policy, "task registered");
        self.tasks.push(ScheduledTask {
            name,
            interval,
            policy,
            action,
            next_due: None,
            counters: Arc::default(),
        });
        Ok(())
    }

    pub fn tasks(&self) -> &[ScheduledTask] {
        &self.tasks
    }

    /// Run until `cancel` fires, then drain in-flight firings.
    pub async fn run(mut self, cancel: CancellationToken) -> RunSummary {
        let start = Instant::now();
        for task in &mut self.tasks {
            task.next_due = Some(start + task.interval);
        }

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut inflight: JoinSet<()> = JoinSet::new();

        info!(
            tasks = self.tasks.len(),
            tick_ms = self.tick.as_millis() as u64,
            "scheduler started"
        );
        self.shared
            .write()
            .await
            .record_scheduler(format!("scheduler started ({} tasks)", self.tasks.len()));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(_) = inflight.join_next(), if !inflight.is_empty() => continue,
                _ = ticker.tick() => {}
            }

            let now = Instant::now();
            for task in &mut self.tasks {
                let Some(due) = task.next_due else { continue };
                if now < due {
                    continue;
                }
                Self::dispatch(task, &mut inflight, &self.shared).await;

                let mut next = due + task.interval;
                let mut missed = 0u32;
                while next <= now {
                    next += task.interval;
                    missed += 1;
                }
                if missed > 0 {
                    warn!(task = %task.name, missed, "scheduler fell behind, dropping missed firings");
                }
                task.next_due = Some(next);
            }
        }

        info!(in_flight = inflight.len(), "scheduler stopping");
        let drained = drain(&mut inflight, self.drain_timeout).await;
        if !drained {
            warn!(
                abandoned = inflight.len(),
                "drain timeout expired, abandoning in-flight firings"
            );
            inflight.detach_all();
        }
        self.shared
            .write()
            .await
            .record_scheduler("scheduler stopped".into());

        RunSummary {
            tasks: self
                .tasks
                .iter()
                .map(|t| {
                    (
                        t.name.clone(),
                        TaskStats {
                            fired: t.counters.fired.load(Ordering::SeqCst),
                            skipped: t.counters.skipped.load(Ordering::SeqCst),
                            failed: t.counters.failed.load(Ordering::SeqCst),
                        },
                    )
                })
                .collect(),
            drained,
        }
    }

    async fn dispatch(task: &ScheduledTask, inflight: &mut JoinSet<()>, shared: &SharedState) {
        let counters = Arc::clone(&task.counters);
        if task.policy == TaskPolicy::Serial && counters.running.load(Ordering::SeqCst) > 0 {
            counters.skipped.fetch_add(1, Ordering::SeqCst);
            warn!(task = %task.name, "previous run still in progress, skipping");
            shared
                .write()
                .await
                .record_scheduler(format!("{} skipped (still running)", task.name));
            return;
        }

        counters.fired.fetch_add(1, Ordering::SeqCst);
        counters.running.fetch_add(1, Ordering::SeqCst);
        debug!(task = %task.name, "task fired");

        let name = task.name.clone();
        let shared = Arc::clone(shared);
        let fut = (task.action)();
        inflight.spawn(async move {
            let _running = RunningGuard(Arc::clone(&counters));
            // The inner spawn turns a panic in the action into a JoinError.
            let failure = match tokio::spawn(fut).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{e:#}")),
                Err(e) if e.is_panic() => Some("panicked".to_string()),
                Err(e) => Some(e.to_string()),
            };
            if let Some(detail) = failure {
                counters.failed.fetch_add(1, Ordering::SeqCst);
                error!(task = %name, "scheduled task failed: {detail}");
                shared
                    .write()
                    .await
                    .record_error(format!("{name}: {detail}"));
            }
        });
    }
}

async fn drain(inflight: &mut JoinSet<()>, timeout: Option<Duration>) -> bool {
    let all = async {
        while inflight.join_next().await.is_some() {}
    };
    match timeout {
        Some(t) => tokio::time::timeout(t, all).await.is_ok(),
        None => {
            all.await;
            true
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state;
    use std::sync::Mutex;

    fn counting(counter: Arc<AtomicUsize>) -> TaskAction {
        action(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        })
    }

    /// Run `scheduler` for `secs` of (paused) time, then cancel.
    async fn run_for(scheduler: Scheduler, secs: f64) -> RunSummary {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(cancel.clone()));
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
        cancel.cancel();
        handle.await.unwrap()
    }

    async fn fail() -> Result<()> {
        bail!("sensor bus error")
    }

    async fn explode() -> Result<()> {
        panic!("boom")
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(Duration::from_secs(1), state::shared())
    }

    // -- Registration -----------------------------------------------------

    #[test]
    fn zero_interval_rejected() {
        let mut s = scheduler();
        let err = s
            .register("bad", Duration::ZERO, TaskPolicy::AllowOverlap, counting(Arc::default()))
            .unwrap_err();
        assert!(err.to_string().contains("interval must be positive"));
    }

    #[test]
    fn duplicate_name_rejected() {
        let mut s = scheduler();
        let a = counting(Arc::default());
        s.register("t", Duration::from_secs(1), TaskPolicy::AllowOverlap, a.clone())
            .unwrap();
        assert!(s
            .register("t", Duration::from_secs(2), TaskPolicy::AllowOverlap, a)
            .is_err());
        assert_eq!(s.tasks().len(), 1);
    }

    // -- Cadence ----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn ten_and_twenty_second_tasks_over_twenty_seconds() {
        let ten = Arc::new(AtomicUsize::new(0));
        let twenty = Arc::new(AtomicUsize::new(0));
        let mut s = scheduler();
        s.register("ten", Duration::from_secs(10), TaskPolicy::AllowOverlap, counting(ten.clone()))
            .unwrap();
        s.register("twenty", Duration::from_secs(20), TaskPolicy::AllowOverlap, counting(twenty.clone()))
            .unwrap();

        let summary = run_for(s, 20.5).await;

        assert_eq!(ten.load(Ordering::SeqCst), 2);
        assert_eq!(twenty.load(Ordering::SeqCst), 1);
        assert_eq!(summary.tasks["ten"].fired, 2);
        assert_eq!(summary.tasks["twenty"].fired, 1);
        assert!(summary.drained);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_tick_is_clamped() {
        let n = Arc::new(AtomicUsize::new(0));
        let mut s = Scheduler::new(Duration::ZERO, state::shared());
        assert_eq!(s.tick, MIN_TICK);
        s.register("fast", Duration::from_secs(1), TaskPolicy::AllowOverlap, counting(n.clone()))
            .unwrap();

        let summary = run_for(s, 2.5).await;

        assert_eq!(n.load(Ordering::SeqCst), 2);
        assert_eq!(summary.tasks["fast"].fired, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_fires_before_first_interval() {
        let n = Arc::new(AtomicUsize::new(0));
        let mut s = scheduler();
        s.register("t", Duration::from_secs(10), TaskPolicy::AllowOverlap, counting(n.clone()))
            .unwrap();
        run_for(s, 9.5).await;
        assert_eq!(n.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_rate_ignores_action_duration() {
        let starts = Arc::new(Mutex::new(Vec::new()));
        let origin = Instant::now();
        let rec = Arc::clone(&starts);
        let mut s = scheduler();
        s.register(
            "slow",
            Duration::from_secs(5),
            TaskPolicy::AllowOverlap,
            action(move || {
                let rec = Arc::clone(&rec);
                async move {
                    rec.lock().unwrap().push(origin.elapsed().as_secs());
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    anyhow::Ok(())
                }
            }),
        )
        .unwrap();

        run_for(s, 15.5).await;
        assert_eq!(*starts.lock().unwrap(), vec![5, 10, 15]);
    }

    // -- Overlap policy ---------------------------------------------------

    fn slow_task(running: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> TaskAction {
        action(move || {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2500)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_firings_run_concurrently_by_default() {
        let peak = Arc::new(AtomicUsize::new(0));
        let mut s = scheduler();
        s.register(
            "slow",
            Duration::from_secs(1),
            TaskPolicy::AllowOverlap,
            slow_task(Arc::default(), peak.clone()),
        )
        .unwrap();

        let summary = run_for(s, 5.5).await;
        assert_eq!(summary.tasks["slow"].fired, 5);
        assert_eq!(summary.tasks["slow"].skipped, 0);
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn serial_policy_skips_while_previous_runs() {
        let peak = Arc::new(AtomicUsize::new(0));
        let mut s = scheduler();
        s.register(
            "slow",
            Duration::from_secs(1),
            TaskPolicy::Serial,
            slow_task(Arc::default(), peak.clone()),
        )
        .unwrap();

        // Fires at 1 and 4; 2, 3 and 5 find the previous run in progress.
        let summary = run_for(s, 5.5).await;
        assert_eq!(summary.tasks["slow"].fired, 2);
        assert_eq!(summary.tasks["slow"].skipped, 3);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    // -- Failure isolation ------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn errors_and_panics_do_not_stop_the_loop() {
        let healthy = Arc::new(AtomicUsize::new(0));
        let shared = state::shared();
        let mut s = Scheduler::new(Duration::from_secs(1), shared.clone());
        s.register(
            "erroring",
            Duration::from_secs(1),
            TaskPolicy::AllowOverlap,
            action(fail),
        )
        .unwrap();
        s.register(
            "panicking",
            Duration::from_secs(1),
            TaskPolicy::AllowOverlap,
            action(explode),
        )
        .unwrap();
        s.register("healthy", Duration::from_secs(1), TaskPolicy::AllowOverlap, counting(healthy.clone()))
            .unwrap();

        let summary = run_for(s, 3.5).await;

        assert_eq!(summary.tasks["erroring"], TaskStats { fired: 3, skipped: 0, failed: 3 });
        assert_eq!(summary.tasks["panicking"], TaskStats { fired: 3, skipped: 0, failed: 3 });
        assert_eq!(healthy.load(Ordering::SeqCst), 3);

        let st = shared.read().await;
        let errors = st
            .events
            .iter()
            .filter(|e| e.kind == state::EventKind::Error)
            .count();
        assert_eq!(errors, 6);
    }

    // -- Shutdown ---------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_further_firings_and_waits_for_in_flight() {
        let finished = Arc::new(AtomicUsize::new(0));
        let done = Arc::clone(&finished);
        let mut s = scheduler();
        s.register(
            "long",
            Duration::from_secs(2),
            TaskPolicy::AllowOverlap,
            action(move || {
                let done = Arc::clone(&done);
                async move {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            }),
        )
        .unwrap();

        let origin = Instant::now();
        let summary = run_for(s, 2.5).await;
        assert_eq!(summary.tasks["long"].fired, 1);
        assert!(summary.drained);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(origin.elapsed() >= Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_timeout_bounds_shutdown() {
        let mut s = scheduler().with_drain_timeout(Some(Duration::from_secs(2)));
        s.register(
            "stuck",
            Duration::from_secs(1),
            TaskPolicy::AllowOverlap,
            action(|| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                anyhow::Ok(())
            }),
        )
        .unwrap();

        let origin = Instant::now();
        let summary = run_for(s, 1.5).await;
        assert!(!summary.drained);
        assert!(origin.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn already_cancelled_returns_without_firing() {
        let n = Arc::new(AtomicUsize::new(0));
        let mut s = scheduler();
        s.register("t", Duration::from_secs(1), TaskPolicy::AllowOverlap, counting(n.clone()))
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = s.run(cancel).await;
        assert_eq!(summary.tasks["t"].fired, 0);
        assert_eq!(n.load(Ordering::SeqCst), 0);
    }
}
