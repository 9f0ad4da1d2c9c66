//! TOML config file loading, environment overrides and validation.

use anyhow::{bail, Context, Result};
use chrono_tz::Tz;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::actuator::Actuator;
use crate::hardware::RelayChannel;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub telemetry: TelemetrySection,
    #[serde(default)]
    pub sensors: SensorSection,
    #[serde(default)]
    pub relays: RelaySection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub humidity: HumiditySection,
    #[serde(default)]
    pub web: WebSection,
    #[serde(default = "default_tasks")]
    pub tasks: Vec<TaskEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    pub path: String,
    pub timezone: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorSection {
    pub bus: u8,
    pub primary: u16,
    pub secondary: u16,
}

/// BCM pin numbers for each relay channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelaySection {
    pub fan: i64,
    pub humidifier_main: i64,
    pub humidifier_pulse: i64,
    pub spare: i64,
    pub active_low: bool,
    /// Upper bound for any hold duration, scheduled or manual.
    pub max_duration_sec: u64,
    pub self_test: bool,
    pub self_test_sec: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub tick_ms: u64,
    /// 0 waits for in-flight work without a bound.
    pub drain_timeout_sec: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HumiditySection {
    pub low: f64,
    pub high: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    LogReadings,
    PrintReadings,
    CheckHumidity,
    Fan,
    Humidifier,
}

impl TaskKind {
    pub fn actuator(&self) -> Option<Actuator> {
        match self {
            Self::Fan => Some(Actuator::Fan),
            Self::Humidifier => Some(Actuator::Humidifier),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskEntry {
    pub name: String,
    pub kind: TaskKind,
    pub interval_sec: u64,
    /// Hold time, required for actuator kinds.
    #[serde(default)]
    pub duration_sec: Option<u64>,
    #[serde(default = "default_true")]
    pub allow_overlap: bool,
}

// ---------------------------------------------------------------------------
// Defaults (the rig's stock wiring and cadence)
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_tasks() -> Vec<TaskEntry> {
    vec![
        TaskEntry {
            name: "print_readings".into(),
            kind: TaskKind::PrintReadings,
            interval_sec: 10,
            duration_sec: None,
            allow_overlap: true,
        },
        TaskEntry {
            name: "log_readings".into(),
            kind: TaskKind::LogReadings,
            interval_sec: 20,
            duration_sec: None,
            allow_overlap: true,
        },
    ]
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            path: "sensor_readings_bme280_long.csv".into(),
            timezone: "Europe/Berlin".into(),
        }
    }
}

impl Default for SensorSection {
    fn default() -> Self {
        Self {
            bus: 1,
            primary: 0x76,
            secondary: 0x77,
        }
    }
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            fan: 4,
            humidifier_main: 17,
            humidifier_pulse: 27,
            spare: 22,
            active_low: false,
            max_duration_sec: 3600,
            self_test: false,
            self_test_sec: 5,
        }
    }
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_ms: 500,
            drain_timeout_sec: 30,
        }
    }
}

impl Default for HumiditySection {
    fn default() -> Self {
        Self {
            low: 30.0,
            high: 50.0,
        }
    }
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 3000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            telemetry: TelemetrySection::default(),
            sensors: SensorSection::default(),
            relays: RelaySection::default(),
            scheduler: SchedulerSection::default(),
            humidity: HumiditySection::default(),
            web: WebSection::default(),
            tasks: default_tasks(),
        }
    }
}

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

impl TelemetrySection {
    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| anyhow::anyhow!("unknown timezone '{}': {e}", self.timezone))
    }
}

impl RelaySection {
    fn pins(&self) -> [(RelayChannel, i64); 4] {
        [
            (RelayChannel::Fan, self.fan),
            (RelayChannel::HumidifierMain, self.humidifier_main),
            (RelayChannel::HumidifierPulse, self.humidifier_pulse),
            (RelayChannel::Spare, self.spare),
        ]
    }

    /// Channel-to-pin wiring for the relay bank. Call after `validate`.
    pub fn wiring(&self) -> Vec<(RelayChannel, u8)> {
        self.pins()
            .into_iter()
            .filter_map(|(ch, pin)| u8::try_from(pin).ok().map(|p| (ch, p)))
            .collect()
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_sec)
    }
}

impl SchedulerSection {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        (self.drain_timeout_sec > 0).then(|| Duration::from_secs(self.drain_timeout_sec))
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// Non-reserved 7-bit I2C addresses.
const I2C_ADDRESSES: std::ops::RangeInclusive<u16> = 0x08..=0x77;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_telemetry(&mut errors);
        self.validate_sensors(&mut errors);
        self.validate_relays(&mut errors);
        self.validate_timing(&mut errors);
        self.validate_tasks(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_telemetry(&self, errors: &mut Vec<String>) {
        if self.telemetry.path.trim().is_empty() {
            errors.push("telemetry.path is empty".into());
        }
        if let Err(e) = self.telemetry.tz() {
            errors.push(format!("telemetry.timezone: {e}"));
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let s = &self.sensors;
        for (field, addr) in [("primary", s.primary), ("secondary", s.secondary)] {
            if !I2C_ADDRESSES.contains(&addr) {
                errors.push(format!(
                    "sensors.{field}: address 0x{addr:02x} outside 0x08-0x77"
                ));
            }
        }
        if s.primary == s.secondary {
            errors.push(format!(
                "sensors: primary and secondary share address 0x{:02x}",
                s.primary
            ));
        }
    }

    fn validate_relays(&self, errors: &mut Vec<String>) {
        let mut seen_pins: HashSet<i64> = HashSet::new();

        for (channel, pin) in self.relays.pins() {
            // ── GPIO pin whitelist ──────────────────────────────
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "relay '{channel}': gpio pin {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if !seen_pins.insert(pin) {
                errors.push(format!(
                    "relay '{channel}': gpio pin {pin} is already used by another relay"
                ));
            }
        }

        if self.relays.max_duration_sec == 0 {
            errors.push("relays.max_duration_sec must be positive".into());
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        if self.scheduler.tick_ms == 0 {
            errors.push("scheduler.tick_ms must be positive".into());
        }

        let h = &self.humidity;
        for (field, v) in [("low", h.low), ("high", h.high)] {
            if !(0.0..=100.0).contains(&v) {
                errors.push(format!("humidity.{field} {v} out of range [0, 100]"));
            }
        }
        if h.high <= h.low {
            errors.push(format!(
                "humidity.high ({}) must be greater than humidity.low ({})",
                h.high, h.low
            ));
        }
    }

    fn validate_tasks(&self, errors: &mut Vec<String>) {
        let mut seen_names: HashSet<&str> = HashSet::new();

        for (i, t) in self.tasks.iter().enumerate() {
            let ctx = || {
                if t.name.is_empty() {
                    format!("tasks[{i}]")
                } else {
                    format!("task '{}'", t.name)
                }
            };

            // ── Identity ────────────────────────────────────────
            if t.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if !seen_names.insert(&t.name) {
                errors.push(format!("{}: duplicate task name", ctx()));
            }

            if t.interval_sec == 0 {
                errors.push(format!("{}: interval_sec must be positive", ctx()));
            }

            // ── Actuator hold time ──────────────────────────────
            if t.kind.actuator().is_some() {
                match t.duration_sec {
                    None => errors.push(format!("{}: duration_sec is required", ctx())),
                    Some(0) => errors.push(format!("{}: duration_sec must be positive", ctx())),
                    Some(d) if d > self.relays.max_duration_sec => errors.push(format!(
                        "{}: duration_sec ({d}) exceeds relays.max_duration_sec ({})",
                        ctx(),
                        self.relays.max_duration_sec
                    )),
                    Some(_) => {}
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Environment overrides
    // -----------------------------------------------------------------------

    /// Apply `TELEMETRY_PATH`, `WEB_PORT`, `RELAY_ACTIVE_LOW` and
    /// `RELAY_SELF_TEST` from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(path) = var("TELEMETRY_PATH") {
            self.telemetry.path = path;
        }
        if let Some(port) = var("WEB_PORT") {
            self.web.port = port
                .parse()
                .with_context(|| format!("WEB_PORT must be a port number, got '{port}'"))?;
        }
        if let Some(v) = var("RELAY_ACTIVE_LOW") {
            self.relays.active_low = parse_flag("RELAY_ACTIVE_LOW", &v)?;
        }
        if let Some(v) = var("RELAY_SELF_TEST") {
            self.relays.self_test = parse_flag("RELAY_SELF_TEST", &v)?;
        }
        Ok(())
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("{key} must be a boolean, got '{other}'"),
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file. A missing file yields the stock
/// defaults. Validation is left to the caller so env overrides can be
/// applied first.
pub fn load(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        tracing::warn!(path, "config file not found, using built-in defaults");
        return Ok(Config::default());
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    tracing::info!(path, tasks = config.tasks.len(), "config loaded");
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid_config() -> Config {
        Config::default()
    }

    fn fan_task() -> TaskEntry {
        TaskEntry {
            name: "fan".into(),
            kind: TaskKind::Fan,
            interval_sec: 3600,
            duration_sec: Some(60),
            allow_overlap: false,
        }
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[telemetry]
path = "/var/lib/climate/log.csv"
timezone = "Europe/Vienna"

[sensors]
bus = 1
primary = 0x76
secondary = 0x77

[relays]
fan = 5
humidifier_main = 6
humidifier_pulse = 13
spare = 19
active_low = false
max_duration_sec = 600

[scheduler]
tick_ms = 250
drain_timeout_sec = 0

[humidity]
low = 35.0
high = 55.0

[[tasks]]
name = "log"
kind = "log_readings"
interval_sec = 60

[[tasks]]
name = "fan"
kind = "fan"
interval_sec = 1800
duration_sec = 120
allow_overlap = false
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.telemetry.tz().unwrap(), chrono_tz::Europe::Vienna);
        assert_eq!(config.relays.fan, 5);
        assert!(!config.relays.active_low);
        assert_eq!(config.scheduler.drain_timeout(), None);
        assert_eq!(config.web.port, 3000);
        assert_eq!(config.tasks.len(), 2);
        assert!(config.tasks[0].allow_overlap);
        assert_eq!(config.tasks[1].kind, TaskKind::Fan);
        assert_eq!(config.tasks[1].duration_sec, Some(120));
        assert!(!config.tasks[1].allow_overlap);
    }

    #[test]
    fn parse_empty_config_gives_stock_rig() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.sensors.primary, 0x76);
        assert_eq!(config.sensors.secondary, 0x77);
        assert_eq!(
            config.relays.wiring(),
            vec![
                (RelayChannel::Fan, 4),
                (RelayChannel::HumidifierMain, 17),
                (RelayChannel::HumidifierPulse, 27),
                (RelayChannel::Spare, 22),
            ]
        );
        let cadence: Vec<_> = config
            .tasks
            .iter()
            .map(|t| (t.kind, t.interval_sec))
            .collect();
        assert_eq!(
            cadence,
            vec![(TaskKind::PrintReadings, 10), (TaskKind::LogReadings, 20)]
        );
        assert_eq!(config.web.bind, "127.0.0.1");
        assert_eq!(config.telemetry.tz().unwrap(), chrono_tz::Europe::Berlin);
    }

    #[test]
    fn unknown_task_kind_fails_to_parse() {
        let toml_str = r#"
[[tasks]]
name = "x"
kind = "sprinkler"
interval_sec = 5
"#;
        assert!(toml::from_str::<Config>(toml_str).is_err());
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.tasks.len(), 2);
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[web]\nport = 8081\n").unwrap();
        let config = load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.web.port, 8081);
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[web\n").unwrap();
        let err = load(path.to_str().unwrap()).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse config"));
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn unknown_timezone_rejected() {
        let mut cfg = valid_config();
        cfg.telemetry.timezone = "Mars/Olympus".into();
        assert_validation_err(&cfg, "unknown timezone 'Mars/Olympus'");
    }

    #[test]
    fn gpio_pin_outside_header_rejected() {
        for pin in [0, 1, 28, -1] {
            let mut cfg = valid_config();
            cfg.relays.spare = pin;
            assert_validation_err(&cfg, "not a valid BCM GPIO pin");
        }
    }

    #[test]
    fn gpio_boundaries_accepted() {
        let mut cfg = valid_config();
        cfg.relays.fan = 2;
        cfg.relays.spare = 26;
        cfg.validate().unwrap();
    }

    #[test]
    fn duplicate_gpio_rejected() {
        let mut cfg = valid_config();
        cfg.relays.humidifier_pulse = cfg.relays.humidifier_main;
        assert_validation_err(&cfg, "already used by another relay");
    }

    #[test]
    fn shared_sensor_address_rejected() {
        let mut cfg = valid_config();
        cfg.sensors.secondary = 0x76;
        assert_validation_err(&cfg, "share address 0x76");
    }

    #[test]
    fn reserved_sensor_address_rejected() {
        let mut cfg = valid_config();
        cfg.sensors.primary = 0x78;
        assert_validation_err(&cfg, "outside 0x08-0x77");
    }

    #[test]
    fn zero_tick_rejected() {
        let mut cfg = valid_config();
        cfg.scheduler.tick_ms = 0;
        assert_validation_err(&cfg, "tick_ms must be positive");
    }

    #[test]
    fn inverted_humidity_band_rejected() {
        let mut cfg = valid_config();
        cfg.humidity.low = 60.0;
        assert_validation_err(&cfg, "must be greater than humidity.low");
    }

    #[test]
    fn zero_interval_rejected() {
        let mut cfg = valid_config();
        cfg.tasks[0].interval_sec = 0;
        assert_validation_err(&cfg, "task 'print_readings': interval_sec must be positive");
    }

    #[test]
    fn duplicate_task_name_rejected() {
        let mut cfg = valid_config();
        cfg.tasks[1].name = "print_readings".into();
        assert_validation_err(&cfg, "duplicate task name");
    }

    #[test]
    fn actuator_task_requires_duration() {
        let mut cfg = valid_config();
        cfg.tasks.push(TaskEntry {
            duration_sec: None,
            ..fan_task()
        });
        assert_validation_err(&cfg, "task 'fan': duration_sec is required");

        cfg.tasks[2].duration_sec = Some(0);
        assert_validation_err(&cfg, "duration_sec must be positive");

        cfg.tasks[2].duration_sec = Some(7200);
        assert_validation_err(&cfg, "exceeds relays.max_duration_sec");

        cfg.tasks[2].duration_sec = Some(60);
        cfg.validate().unwrap();
    }

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = valid_config();
        cfg.telemetry.timezone = "Nowhere".into();
        cfg.relays.fan = 99;
        cfg.scheduler.tick_ms = 0;
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("3 errors"), "{msg}");
        assert!(msg.contains("unknown timezone"), "{msg}");
        assert!(msg.contains("not a valid BCM GPIO pin"), "{msg}");
        assert!(msg.contains("tick_ms"), "{msg}");
    }

    // -- Environment overrides --------------------------------------------

    #[test]
    fn env_overrides_apply() {
        let mut cfg = valid_config();
        cfg.apply_overrides(env(&[
            ("TELEMETRY_PATH", "/tmp/x.csv"),
            ("WEB_PORT", "9000"),
            ("RELAY_ACTIVE_LOW", "true"),
            ("RELAY_SELF_TEST", "1"),
        ]))
        .unwrap();
        assert_eq!(cfg.telemetry.path, "/tmp/x.csv");
        assert_eq!(cfg.web.port, 9000);
        assert!(cfg.relays.active_low);
        assert!(cfg.relays.self_test);
    }

    #[test]
    fn env_absent_changes_nothing() {
        let mut cfg = valid_config();
        cfg.apply_overrides(env(&[])).unwrap();
        assert_eq!(cfg.web.port, 3000);
        assert!(!cfg.relays.active_low);
    }

    #[test]
    fn default_relays_switch_on_high() {
        let relays = Config::default().relays;
        assert!(!relays.active_low);
        assert_eq!(
            relays.wiring(),
            vec![
                (RelayChannel::Fan, 4),
                (RelayChannel::HumidifierMain, 17),
                (RelayChannel::HumidifierPulse, 27),
                (RelayChannel::Spare, 22),
            ]
        );
    }

    #[test]
    fn bad_env_values_rejected() {
        let mut cfg = valid_config();
        assert!(cfg.apply_overrides(env(&[("WEB_PORT", "http")])).is_err());
        assert!(cfg
            .apply_overrides(env(&[("RELAY_ACTIVE_LOW", "maybe")]))
            .is_err());
    }
}
