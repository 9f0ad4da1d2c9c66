mod actuator;
mod bme280;
mod config;
mod error;
mod hardware;
mod scheduler;
mod sensor;
mod state;
mod tasks;
mod telemetry;
mod web;

use anyhow::{Context, Result};
use std::{env, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use actuator::ActuatorController;
use hardware::{HardwareContext, RelayBank, RelayPort};
use scheduler::Scheduler;
use sensor::{SensorArray, SensorPort};
use tasks::TaskContext;
use telemetry::TelemetryLog;

/// How long shutdown waits for actuator jobs to release their relays.
const ACTUATOR_RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let mut cfg = config::load(&config_path)?;
    cfg.apply_env()?;
    cfg.validate()
        .with_context(|| format!("invalid config: {config_path}"))?;
    let tz = cfg.telemetry.tz()?;

    // ── Hardware ────────────────────────────────────────────────────
    let relays: Arc<dyn RelayPort> = Arc::new(
        RelayBank::new(&cfg.relays.wiring(), cfg.relays.active_low)
            .context("failed to initialise relay bank")?,
    );
    let sensors = open_sensors(&cfg.sensors)?;
    let hw = HardwareContext::new(relays, sensors);

    if cfg.relays.self_test {
        hw.relay_self_test(Duration::from_secs(cfg.relays.self_test_sec))
            .await
            .context("relay self-test failed")?;
    }

    // ── Shared state (ephemeral, for the status API) ────────────────
    let shared = state::shared();
    shared
        .write()
        .await
        .record_system("hub started".to_string());

    let shutdown = CancellationToken::new();
    let log = Arc::new(TelemetryLog::new(&cfg.telemetry.path));
    let actuators = ActuatorController::new(
        Arc::clone(&hw.relays),
        Arc::clone(&shared),
        cfg.relays.max_duration(),
        shutdown.clone(),
    );
    info!(path = %log.path().display(), timezone = %tz, "telemetry log ready");

    // ── Scheduler ───────────────────────────────────────────────────
    let ctx = TaskContext {
        sensors: Arc::new(SensorArray::new(
            Arc::clone(&hw.sensors),
            cfg.sensors.primary,
            cfg.sensors.secondary,
            tz,
        )),
        log: Arc::clone(&log),
        actuators: actuators.clone(),
        shared: Arc::clone(&shared),
        humidity: cfg.humidity.clone(),
    };
    let mut scheduler = Scheduler::new(cfg.scheduler.tick(), Arc::clone(&shared))
        .with_drain_timeout(cfg.scheduler.drain_timeout());
    tasks::register_all(&mut scheduler, &cfg.tasks, &ctx)?;
    let schedule = scheduler
        .tasks()
        .iter()
        .map(|t| format!("{} every {}s", t.name(), t.interval().as_secs()))
        .collect::<Vec<_>>()
        .join(", ");
    shared
        .write()
        .await
        .record_system(format!("schedule: {schedule}"));

    // ── Web server ──────────────────────────────────────────────────
    let app = web::AppState {
        shared: Arc::clone(&shared),
        actuators: actuators.clone(),
        relays: Arc::clone(&hw.relays),
        log,
    };
    let web_shutdown = shutdown.clone();
    let (bind, port) = (cfg.web.bind.clone(), cfg.web.port);
    let web = tokio::spawn(async move {
        if let Err(e) = web::serve(app, &bind, port, web_shutdown).await {
            error!("web server stopped: {e:#}");
        }
    });

    // ── Run until Ctrl-C ────────────────────────────────────────────
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(e) => error!("failed to listen for ctrl-c: {e}"),
        }
        signal_shutdown.cancel();
    });

    let summary = scheduler.run(shutdown.clone()).await;
    for (name, stats) in &summary.tasks {
        info!(
            task = %name,
            fired = stats.fired,
            skipped = stats.skipped,
            failed = stats.failed,
            "task totals"
        );
    }

    // ── Shutdown ────────────────────────────────────────────────────
    if !actuators.wait_idle(ACTUATOR_RELEASE_TIMEOUT).await {
        warn!("actuator jobs still running at shutdown");
    }
    hw.shutdown();
    if let Err(e) = web.await {
        error!("web task failed: {e}");
    }
    shared
        .write()
        .await
        .record_system("hub stopped".to_string());
    info!("hub stopped");
    Ok(())
}

#[cfg(feature = "bme280")]
fn open_sensors(cfg: &config::SensorSection) -> Result<Arc<dyn SensorPort>> {
    let bus = bme280::Bme280Bus::open(cfg.bus, &[cfg.primary, cfg.secondary])
        .context("failed to open BME280 sensors")?;
    Ok(Arc::new(bus))
}

#[cfg(not(feature = "bme280"))]
fn open_sensors(cfg: &config::SensorSection) -> Result<Arc<dyn SensorPort>> {
    warn!(
        bus = cfg.bus,
        "built without the bme280 feature, using simulated sensors"
    );
    Ok(Arc::new(sensor::SimulatedSensors::new(&[
        cfg.primary,
        cfg.secondary,
    ])))
}
