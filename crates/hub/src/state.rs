use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::actuator::JobStatus;
use crate::hardware::RelayChannel;
use crate::sensor::{Metric, SensorReading};
use crate::telemetry::{format_timestamp, format_value};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

pub fn shared() -> SharedState {
    Arc::new(RwLock::new(SystemState::new()))
}

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub last_sample_at: Option<DateTime<Utc>>,
    pub last_readings: Vec<ReadingView>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct ReadingView {
    pub date: String,
    pub metric: Metric,
    pub value: String,
}

#[derive(Clone, Serialize)]
pub struct RelayView {
    pub channel: RelayChannel,
    pub on: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct SystemEvent {
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Actuator,
    Scheduler,
    Alert,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub last_sample_at: Option<DateTime<Utc>>,
    pub readings: Vec<ReadingView>,
    pub relays: Vec<RelayView>,
    pub jobs: Vec<JobStatus>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            last_sample_at: None,
            last_readings: Vec::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record a fresh sensor sample.
    pub fn record_readings(&mut self, readings: &[SensorReading]) {
        self.last_sample_at = Some(Utc::now());
        self.last_readings = readings
            .iter()
            .map(|r| ReadingView {
                date: format_timestamp(&r.timestamp),
                metric: r.metric,
                value: format_value(r.value),
            })
            .collect();

        let detail = readings
            .iter()
            .map(|r| format!("{}={}", r.metric, format_value(r.value)))
            .collect::<Vec<_>>()
            .join(", ");
        self.push_event(EventKind::Reading, detail);
    }

    pub fn record_actuator(&mut self, detail: String) {
        self.push_event(EventKind::Actuator, detail);
    }

    pub fn record_scheduler(&mut self, detail: String) {
        self.push_event(EventKind::Scheduler, detail);
    }

    pub fn record_alert(&mut self, detail: String) {
        self.push_event(EventKind::Alert, detail);
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(
        &self,
        relays: Vec<(RelayChannel, bool)>,
        jobs: Vec<JobStatus>,
    ) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            last_sample_at: self.last_sample_at,
            readings: self.last_readings.clone(),
            relays: relays
                .into_iter()
                .map(|(channel, on)| RelayView { channel, on })
                .collect(),
            jobs,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: Utc::now(),
            kind,
            detail,
        });
    }
}
