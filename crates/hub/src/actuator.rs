//! Timed relay sequences for the fan and the humidifier.
//!
//! Each actuator runs at most one job at a time. A job is a fixed, linear
//! program of relay writes and waits executed on its own task:
//!
//! ```text
//! Fan:         Fan ON ──[hold]──▶ Fan OFF
//!
//! Humidifier:  Main ON ──[2 s]──▶ Pulse ON ──[1 s]──▶ Pulse OFF ──[hold]──▶ Main OFF
//! ```
//!
//! Whatever way a job ends (completed, aborted, shutdown, relay error,
//! panic) its relays are driven OFF before the actuator accepts a new job.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::TriggerError;
use crate::hardware::{RelayChannel, RelayGuard, RelayPort};
use crate::state::SharedState;

/// Settling time between the humidifier main relay and the atomiser pulse.
pub const VALVE_PULSE_DELAY: Duration = Duration::from_secs(2);

/// How long the atomiser pulse relay stays closed.
pub const PULSE_WIDTH: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Actuators and their programs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Actuator {
    Fan,
    Humidifier,
}

impl Actuator {
    /// Relays this actuator owns while a job is running.
    pub fn channels(&self) -> &'static [RelayChannel] {
        match self {
            Self::Fan => &[RelayChannel::Fan],
            Self::Humidifier => &[RelayChannel::HumidifierPulse, RelayChannel::HumidifierMain],
        }
    }
}

impl fmt::Display for Actuator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fan => write!(f, "fan"),
            Self::Humidifier => write!(f, "humidifier"),
        }
    }
}

impl FromStr for Actuator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fan" => Ok(Self::Fan),
            "humidifier" => Ok(Self::Humidifier),
            _ => Err(format!("unknown actuator '{s}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    /// Fan relay closed, holding.
    On,
    /// Humidifier main relay closed, waiting to pulse.
    MainOn,
    /// Atomiser pulse relay closed.
    PulseOn,
    /// Pulse released, main relay holding.
    Holding,
    /// All relays released.
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Set(RelayChannel, bool),
    Wait(Duration),
}

/// The program for one job, as `(stage entered, step)` pairs.
pub fn steps(actuator: Actuator, hold: Duration) -> Vec<(Stage, Step)> {
    use RelayChannel::*;
    match actuator {
        Actuator::Fan => vec![
            (Stage::On, Step::Set(Fan, true)),
            (Stage::On, Step::Wait(hold)),
            (Stage::Off, Step::Set(Fan, false)),
        ],
        Actuator::Humidifier => vec![
            (Stage::MainOn, Step::Set(HumidifierMain, true)),
            (Stage::MainOn, Step::Wait(VALVE_PULSE_DELAY)),
            (Stage::PulseOn, Step::Set(HumidifierPulse, true)),
            (Stage::PulseOn, Step::Wait(PULSE_WIDTH)),
            (Stage::Holding, Step::Set(HumidifierPulse, false)),
            (Stage::Holding, Step::Wait(hold)),
            (Stage::Off, Step::Set(HumidifierMain, false)),
        ],
    }
}

/// Validate an operator-supplied duration: a whole number of seconds,
/// at least 1, at most `max`.
pub fn parse_duration(input: &str, max: Duration) -> Result<Duration, TriggerError> {
    let invalid = |reason: String| TriggerError::InvalidDuration {
        input: input.to_string(),
        reason,
    };
    let secs: u64 = input
        .trim()
        .parse()
        .map_err(|_| invalid("expected a positive whole number of seconds".into()))?;
    if secs == 0 {
        return Err(invalid("must be at least 1 second".into()));
    }
    if secs > max.as_secs() {
        return Err(invalid(format!("exceeds maximum of {} seconds", max.as_secs())));
    }
    Ok(Duration::from_secs(secs))
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Aborted,
    Failed(String),
}

struct ActiveJob {
    id: u64,
    hold: Duration,
    started_at: DateTime<Utc>,
    stage: Stage,
    cancel: CancellationToken,
}

/// Snapshot of a running job for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub actuator: Actuator,
    pub stage: Stage,
    pub hold_sec: u64,
    pub started_at: DateTime<Utc>,
}

type JobTable = Arc<Mutex<HashMap<Actuator, ActiveJob>>>;

fn lock(jobs: &JobTable) -> MutexGuard<'_, HashMap<Actuator, ActiveJob>> {
    // A panic while holding the lock cannot leave the map half-updated.
    jobs.lock().unwrap_or_else(|p| p.into_inner())
}

/// Frees the actuator's slot when dropped and wakes [`ActuatorController::wait_idle`].
struct SlotRelease {
    jobs: JobTable,
    idle: Arc<Notify>,
    actuator: Actuator,
    id: u64,
}

impl Drop for SlotRelease {
    fn drop(&mut self) {
        let mut jobs = lock(&self.jobs);
        if jobs.get(&self.actuator).map(|j| j.id) == Some(self.id) {
            jobs.remove(&self.actuator);
        }
        drop(jobs);
        self.idle.notify_waiters();
    }
}

/// Handle to a started job.
pub struct JobHandle {
    pub actuator: Actuator,
    pub hold: Duration,
    cancel: CancellationToken,
    handle: JoinHandle<JobOutcome>,
}

impl JobHandle {
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Wait for the job to end. Its relays are OFF by the time this returns.
    pub async fn wait(self) -> JobOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => JobOutcome::Failed(format!("job task ended abnormally: {e}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ActuatorController {
    relays: Arc<dyn RelayPort>,
    jobs: JobTable,
    idle: Arc<Notify>,
    next_id: Arc<AtomicU64>,
    shutdown: CancellationToken,
    shared: SharedState,
    max_duration: Duration,
}

impl ActuatorController {
    pub fn new(
        relays: Arc<dyn RelayPort>,
        shared: SharedState,
        max_duration: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            relays,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            idle: Arc::new(Notify::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            shutdown,
            shared,
            max_duration,
        }
    }

    /// Validate a raw operator duration, then start the job.
    pub fn trigger(&self, actuator: Actuator, raw_duration: &str) -> Result<JobHandle, TriggerError> {
        let hold = parse_duration(raw_duration, self.max_duration)?;
        self.start(actuator, hold)
    }

    /// Start `actuator`'s program with the given hold time.
    ///
    /// Rejected with [`TriggerError::Busy`] if the actuator already has a
    /// job; the running job is left untouched.
    pub fn start(&self, actuator: Actuator, hold: Duration) -> Result<JobHandle, TriggerError> {
        if self.shutdown.is_cancelled() {
            return Err(TriggerError::ShuttingDown);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        {
            let mut jobs = lock(&self.jobs);
            if jobs.contains_key(&actuator) {
                return Err(TriggerError::Busy(actuator));
            }
            jobs.insert(
                actuator,
                ActiveJob {
                    id,
                    hold,
                    started_at: Utc::now(),
                    stage: steps(actuator, hold)[0].0,
                    cancel: cancel.clone(),
                },
            );
        }

        // Owned by the task future so the slot is freed even if the task
        // is dropped before it first runs.
        let slot = SlotRelease {
            jobs: Arc::clone(&self.jobs),
            idle: Arc::clone(&self.idle),
            actuator,
            id,
        };
        let relays = Arc::clone(&self.relays);
        let jobs = Arc::clone(&self.jobs);
        let shared = Arc::clone(&self.shared);
        let token = cancel.clone();

        info!(%actuator, hold_sec = hold.as_secs(), "actuator job started");
        let handle = tokio::spawn(async move {
            let slot = slot;
            shared.write().await.record_actuator(format!(
                "{actuator} on for {}s",
                hold.as_secs()
            ));

            let outcome = run_job(relays, &jobs, actuator, id, hold, &token).await;
            drop(slot);

            let mut st = shared.write().await;
            match &outcome {
                JobOutcome::Completed => {
                    info!(%actuator, "actuator job completed");
                    st.record_actuator(format!("{actuator} off"));
                }
                JobOutcome::Aborted => {
                    warn!(%actuator, "actuator job aborted, relays released");
                    st.record_actuator(format!("{actuator} aborted"));
                }
                JobOutcome::Failed(e) => {
                    error!(%actuator, "actuator job failed, relays released: {e}");
                    st.record_error(format!("{actuator} failed: {e}"));
                }
            }
            outcome
        });

        Ok(JobHandle {
            actuator,
            hold,
            cancel,
            handle,
        })
    }

    /// Cancel the running job on `actuator`, if any.
    pub fn abort(&self, actuator: Actuator) -> bool {
        match lock(&self.jobs).get(&actuator) {
            Some(job) => {
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, actuator: Actuator) -> bool {
        lock(&self.jobs).contains_key(&actuator)
    }

    pub fn active(&self) -> Vec<JobStatus> {
        let jobs = lock(&self.jobs);
        let mut out: Vec<_> = jobs
            .iter()
            .map(|(actuator, j)| JobStatus {
                actuator: *actuator,
                stage: j.stage,
                hold_sec: j.hold.as_secs(),
                started_at: j.started_at,
            })
            .collect();
        out.sort_by_key(|j| j.actuator as u8);
        out
    }

    /// Wait until no job is running, up to `timeout`. Returns whether the
    /// controller went idle in time.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register before checking so a release in between is not missed.
            let released = self.idle.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            if lock(&self.jobs).is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return lock(&self.jobs).is_empty();
            }
        }
    }
}

async fn run_job(
    relays: Arc<dyn RelayPort>,
    jobs: &JobTable,
    actuator: Actuator,
    id: u64,
    hold: Duration,
    cancel: &CancellationToken,
) -> JobOutcome {
    let _release = RelayGuard::new(Arc::clone(&relays), actuator.channels());

    for (stage, step) in steps(actuator, hold) {
        if let Some(job) = lock(jobs).get_mut(&actuator).filter(|j| j.id == id) {
            job.stage = stage;
        }
        match step {
            Step::Set(channel, on) => {
                if cancel.is_cancelled() {
                    return JobOutcome::Aborted;
                }
                if let Err(e) = relays.set_channel(channel, on) {
                    return JobOutcome::Failed(e.to_string());
                }
            }
            Step::Wait(d) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return JobOutcome::Aborted,
                    _ = tokio::time::sleep(d) => {}
                }
            }
        }
    }
    JobOutcome::Completed
}

// ===========================================================================
// Tests
// ===========================================================================
