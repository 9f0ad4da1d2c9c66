//! Sensor sampling: the `SensorPort` boundary, the two-device array that
//! produces the six logged metrics, and a simulator for builds without the
//! `bme280` feature.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tracing::debug;

use crate::error::SensorReadError;

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// One device sample, as captured on the bus.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub captured_at: DateTime<Utc>,
    pub temperature_c: f64,
    pub humidity_pct: f64,
    pub pressure_hpa: f64,
}

/// Reads one combined temperature/humidity/pressure sample from the device
/// at `address`.
pub trait SensorPort: Send + Sync {
    fn read(&self, address: u16) -> Result<Sample, SensorReadError>;
}

// ---------------------------------------------------------------------------
// Readings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Metric {
    Temp1,
    Temp2,
    Humid1,
    Humid2,
    Press1,
    Press2,
}

impl Metric {
    /// Row order of one logged batch.
    pub const ALL: [Metric; 6] = [
        Metric::Temp1,
        Metric::Temp2,
        Metric::Humid1,
        Metric::Humid2,
        Metric::Press1,
        Metric::Press2,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Temp1 => "Temp1",
            Self::Temp2 => "Temp2",
            Self::Humid1 => "Humid1",
            Self::Humid2 => "Humid2",
            Self::Press1 => "Press1",
            Self::Press2 => "Press2",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Metric::ALL
            .into_iter()
            .find(|m| m.as_str() == s.trim())
            .ok_or_else(|| format!("unknown metric '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub timestamp: DateTime<Tz>,
    pub metric: Metric,
    pub value: f64,
}

// ---------------------------------------------------------------------------
// Two-sensor array
// ---------------------------------------------------------------------------

/// The primary and secondary devices on a shared bus.
pub struct SensorArray {
    port: Arc<dyn SensorPort>,
    primary: u16,
    secondary: u16,
    tz: Tz,
    bus: Mutex<()>,
}

impl SensorArray {
    pub fn new(port: Arc<dyn SensorPort>, primary: u16, secondary: u16, tz: Tz) -> Self {
        Self {
            port,
            primary,
            secondary,
            tz,
            bus: Mutex::new(()),
        }
    }

    /// Sample both devices and return the six metrics in log order.
    ///
    /// All six readings carry the primary device's capture time, matching
    /// the existing log files. A failure on either device fails the whole
    /// call so that no partial batch is ever logged.
    pub fn read_all(&self) -> Result<[SensorReading; 6], SensorReadError> {
        let (a, b) = {
            let _bus = self.bus.lock().map_err(|_| SensorReadError::Poisoned)?;
            let a = self.port.read(self.primary)?;
            let b = self.port.read(self.secondary)?;
            (a, b)
        };
        debug!(
            primary_at = %a.captured_at,
            secondary_at = %b.captured_at,
            "sensors sampled"
        );

        let ts = a.captured_at.with_timezone(&self.tz);
        let reading = |metric, value| SensorReading {
            timestamp: ts,
            metric,
            value,
        };
        Ok([
            reading(Metric::Temp1, a.temperature_c),
            reading(Metric::Temp2, b.temperature_c),
            reading(Metric::Humid1, a.humidity_pct),
            reading(Metric::Humid2, b.humidity_pct),
            reading(Metric::Press1, a.pressure_hpa),
            reading(Metric::Press2, b.pressure_hpa),
        ])
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1): sum of 12 uniforms minus 6.
fn approx_std_normal() -> f64 {
    (0..12).map(|_| fastrand::f64()).sum::<f64>() - 6.0
}

struct SimState {
    temperature_c: f64,
    humidity_pct: f64,
    pressure_hpa: f64,
}

/// Random-walk room climate, one independent walk per address.
pub struct SimulatedSensors {
    devices: Mutex<HashMap<u16, SimState>>,
}

const SIM_CENTER: (f64, f64, f64) = (21.0, 45.0, 1013.0);
const SIM_MEAN_REVERSION: f64 = 0.05;

impl SimulatedSensors {
    pub fn new(addresses: &[u16]) -> Self {
        let devices = addresses
            .iter()
            .map(|&addr| {
                (
                    addr,
                    SimState {
                        temperature_c: SIM_CENTER.0 + approx_std_normal() * 0.5,
                        humidity_pct: SIM_CENTER.1 + approx_std_normal() * 3.0,
                        pressure_hpa: SIM_CENTER.2 + approx_std_normal() * 2.0,
                    },
                )
            })
            .collect();
        Self {
            devices: Mutex::new(devices),
        }
    }
}

impl SensorPort for SimulatedSensors {
    fn read(&self, address: u16) -> Result<Sample, SensorReadError> {
        let mut devices = self.devices.lock().map_err(|_| SensorReadError::Poisoned)?;
        let s = devices
            .get_mut(&address)
            .ok_or(SensorReadError::UnknownAddress(address))?;

        s.temperature_c += SIM_MEAN_REVERSION * (SIM_CENTER.0 - s.temperature_c)
            + approx_std_normal() * 0.1;
        s.humidity_pct = (s.humidity_pct
            + SIM_MEAN_REVERSION * (SIM_CENTER.1 - s.humidity_pct)
            + approx_std_normal() * 0.8)
            .clamp(0.0, 100.0);
        s.pressure_hpa += SIM_MEAN_REVERSION * (SIM_CENTER.2 - s.pressure_hpa)
            + approx_std_normal() * 0.2;

        Ok(Sample {
            captured_at: Utc::now(),
            temperature_c: s.temperature_c,
            humidity_pct: s.humidity_pct,
            pressure_hpa: s.pressure_hpa,
        })
    }
}

// ===========================================================================
// Test doubles
// ===========================================================================


// ===========================================================================
// Tests
// ===========================================================================
