//! Scheduled task bodies and their registration from config.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::actuator::{Actuator, ActuatorController, JobOutcome};
use crate::config::{HumiditySection, TaskEntry, TaskKind};
use crate::error::TriggerError;
use crate::scheduler::{action, Scheduler, TaskAction, TaskPolicy};
use crate::sensor::{Metric, SensorArray, SensorReading};
use crate::state::SharedState;
use crate::telemetry::{format_value, TelemetryLog};

/// Everything a scheduled task body may touch.
#[derive(Clone)]
pub struct TaskContext {
    pub sensors: Arc<SensorArray>,
    pub log: Arc<TelemetryLog>,
    pub actuators: ActuatorController,
    pub shared: SharedState,
    pub humidity: HumiditySection,
}

pub fn register_all(scheduler: &mut Scheduler, tasks: &[TaskEntry], ctx: &TaskContext) -> Result<()> {
    for t in tasks {
        let hold = Duration::from_secs(t.duration_sec.unwrap_or(0));
        scheduler.register(
            t.name.clone(),
            Duration::from_secs(t.interval_sec),
            TaskPolicy::from_allow_overlap(t.allow_overlap),
            build_action(t.kind, hold, ctx.clone()),
        )?;
    }
    Ok(())
}

pub fn build_action(kind: TaskKind, hold: Duration, ctx: TaskContext) -> TaskAction {
    let ctx = Arc::new(ctx);
    match kind.actuator() {
        Some(actuator) => action(move || run_actuator(Arc::clone(&ctx), actuator, hold)),
        None => action(move || run_sensor_task(Arc::clone(&ctx), kind)),
    }
}

async fn run_sensor_task(ctx: Arc<TaskContext>, kind: TaskKind) -> Result<()> {
    match kind {
        TaskKind::LogReadings => log_readings(&ctx).await,
        TaskKind::PrintReadings => print_readings(&ctx).await,
        TaskKind::CheckHumidity => check_humidity(&ctx).await,
        TaskKind::Fan | TaskKind::Humidifier => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Sensor tasks
// ---------------------------------------------------------------------------

/// Sample both sensors off the async runtime.
async fn sample(ctx: &TaskContext) -> Result<[SensorReading; 6]> {
    let sensors = Arc::clone(&ctx.sensors);
    let readings = tokio::task::spawn_blocking(move || sensors.read_all())
        .await
        .context("sensor read task failed")?
        .context("sensor read failed, skipping this tick")?;
    ctx.shared.write().await.record_readings(&readings);
    Ok(readings)
}

/// Sample and append one batch to the telemetry log.
pub async fn log_readings(ctx: &TaskContext) -> Result<()> {
    let readings = sample(ctx).await?;
    let log = Arc::clone(&ctx.log);
    tokio::task::spawn_blocking(move || log.append(&readings))
        .await
        .context("telemetry append task failed")?
        .context("telemetry append failed")?;
    debug!(rows = readings.len(), "readings logged");
    Ok(())
}

pub async fn print_readings(ctx: &TaskContext) -> Result<()> {
    let readings = sample(ctx).await?;
    info!("{}", summary(&readings));
    Ok(())
}

/// Warn when the primary humidity leaves the configured band.
pub async fn check_humidity(ctx: &TaskContext) -> Result<()> {
    let readings = sample(ctx).await?;
    let Some(humidity) = readings
        .iter()
        .find(|r| r.metric == Metric::Humid1)
        .map(|r| r.value)
    else {
        return Ok(());
    };

    let band = &ctx.humidity;
    let alert = if humidity > band.high {
        Some(format!(
            "humidity {}% above {}%",
            format_value(humidity),
            band.high
        ))
    } else if humidity < band.low {
        Some(format!(
            "humidity {}% below {}%",
            format_value(humidity),
            band.low
        ))
    } else {
        None
    };

    match alert {
        Some(detail) => {
            warn!(humidity, low = band.low, high = band.high, "{detail}");
            ctx.shared.write().await.record_alert(detail);
        }
        None => debug!(humidity, "humidity within band"),
    }
    Ok(())
}

/// One-line human readable view of a batch.
pub fn summary(readings: &[SensorReading]) -> String {
    let unit = |m: Metric| match m {
        Metric::Temp1 | Metric::Temp2 => "°C",
        Metric::Humid1 | Metric::Humid2 => "%",
        Metric::Press1 | Metric::Press2 => "hPa",
    };
    readings
        .iter()
        .map(|r| format!("{} {}{}", r.metric, format_value(r.value), unit(r.metric)))
        .collect::<Vec<_>>()
        .join(" | ")
}

// ---------------------------------------------------------------------------
// Actuator tasks
// ---------------------------------------------------------------------------

/// Run one actuator job to completion. A busy actuator skips this firing.
async fn run_actuator(ctx: Arc<TaskContext>, actuator: Actuator, hold: Duration) -> Result<()> {
    let job = match ctx.actuators.start(actuator, hold) {
        Ok(job) => job,
        Err(TriggerError::Busy(_)) => {
            warn!(%actuator, "actuator busy, skipping scheduled run");
            return Ok(());
        }
        Err(TriggerError::ShuttingDown) => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    match job.wait().await {
        JobOutcome::Failed(detail) => anyhow::bail!("{actuator} job failed: {detail}"),
        JobOutcome::Completed | JobOutcome::Aborted => Ok(()),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
