//! Relay bank and the process-wide hardware context. The `gpio` feature
//! gates the real rppal driver; without it, a mock bank logs state changes.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

use crate::error::RelayError;
use crate::sensor::SensorPort;

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

/// One digital output on the four-way relay board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelayChannel {
    Fan,
    HumidifierMain,
    HumidifierPulse,
    Spare,
}

impl RelayChannel {
    pub const ALL: [RelayChannel; 4] = [
        RelayChannel::Fan,
        RelayChannel::HumidifierMain,
        RelayChannel::HumidifierPulse,
        RelayChannel::Spare,
    ];
}

impl fmt::Display for RelayChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fan => write!(f, "fan"),
            Self::HumidifierMain => write!(f, "humidifier-main"),
            Self::HumidifierPulse => write!(f, "humidifier-pulse"),
            Self::Spare => write!(f, "spare"),
        }
    }
}

/// On/off output for a set of relay channels.
///
/// Implementations must be idempotent: writing the state a channel is
/// already in is harmless.
pub trait RelayPort: Send + Sync {
    fn set_channel(&self, channel: RelayChannel, on: bool) -> Result<(), RelayError>;

    /// Last state written to each wired channel.
    fn states(&self) -> Vec<(RelayChannel, bool)>;

    /// Best-effort: drive every channel OFF, logging failures.
    fn all_off(&self) {
        for channel in RelayChannel::ALL {
            if let Err(e) = self.set_channel(channel, false) {
                error!(%channel, "relay all_off failed: {e}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Real GPIO relay bank (requires rppal and Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct RelayBank {
    pins: Mutex<HashMap<RelayChannel, (OutputPin, bool)>>, // channel -> (pin, on)
    active_low: bool,                                       // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl RelayBank {
    pub fn new(wiring: &[(RelayChannel, u8)], active_low: bool) -> anyhow::Result<Self> {
        let gpio = Gpio::new()?;
        let mut pins = HashMap::new();

        for (channel, pin_num) in wiring {
            let mut pin = gpio.get(*pin_num)?.into_output();

            // Fail-safe: ensure "OFF" at startup
            if active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }

            info!(%channel, gpio = pin_num, "relay registered");
            pins.insert(*channel, (pin, false));
        }

        Ok(Self {
            pins: Mutex::new(pins),
            active_low,
        })
    }
}

#[cfg(feature = "gpio")]
impl RelayPort for RelayBank {
    fn set_channel(&self, channel: RelayChannel, on: bool) -> Result<(), RelayError> {
        let mut pins = self.pins.lock().map_err(|_| RelayError::Poisoned)?;
        let Some((pin, state)) = pins.get_mut(&channel) else {
            return Err(RelayError::NotWired { channel });
        };

        // active-low: LOW = ON, HIGH = OFF
        if on != self.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        if *state != on {
            info!(%channel, "relay set {}", if on { "ON" } else { "OFF" });
        }
        *state = on;
        Ok(())
    }

    fn states(&self) -> Vec<(RelayChannel, bool)> {
        match self.pins.lock() {
            Ok(pins) => sorted(pins.iter().map(|(c, (_, on))| (*c, *on))),
            Err(_) => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Mock relay bank (no hardware, logs state changes)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct RelayBank {
    pub(super) channels: Mutex<HashMap<RelayChannel, bool>>, // channel -> on/off
}

#[cfg(not(feature = "gpio"))]
impl RelayBank {
    pub fn new(wiring: &[(RelayChannel, u8)], _active_low: bool) -> anyhow::Result<Self> {
        let mut channels = HashMap::new();
        for (channel, pin_num) in wiring {
            info!(%channel, gpio = pin_num, "[mock-gpio] relay registered (not wired)");
            channels.insert(*channel, false);
        }
        info!("[mock-gpio] relay bank initialised (no hardware)");
        Ok(Self {
            channels: Mutex::new(channels),
        })
    }
}

#[cfg(not(feature = "gpio"))]
impl RelayPort for RelayBank {
    fn set_channel(&self, channel: RelayChannel, on: bool) -> Result<(), RelayError> {
        let mut channels = self.channels.lock().map_err(|_| RelayError::Poisoned)?;
        let Some(state) = channels.get_mut(&channel) else {
            return Err(RelayError::NotWired { channel });
        };
        if *state != on {
            info!(%channel, "[mock-gpio] relay set {}", if on { "ON" } else { "OFF" });
        }
        *state = on;
        Ok(())
    }

    fn states(&self) -> Vec<(RelayChannel, bool)> {
        match self.channels.lock() {
            Ok(channels) => sorted(channels.iter().map(|(c, on)| (*c, *on))),
            Err(_) => Vec::new(),
        }
    }
}

fn sorted(it: impl Iterator<Item = (RelayChannel, bool)>) -> Vec<(RelayChannel, bool)> {
    let mut v: Vec<_> = it.collect();
    v.sort_by_key(|(c, _)| RelayChannel::ALL.iter().position(|a| a == c));
    v
}

// ---------------------------------------------------------------------------
// Scoped release
// ---------------------------------------------------------------------------

/// Forces its channels OFF when dropped, whatever path the owner leaves by
/// (return, `?`, cancellation of the owning future, panic unwind).
pub struct RelayGuard {
    relays: Arc<dyn RelayPort>,
    channels: &'static [RelayChannel],
}

impl RelayGuard {
    pub fn new(relays: Arc<dyn RelayPort>, channels: &'static [RelayChannel]) -> Self {
        Self { relays, channels }
    }
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        for &channel in self.channels {
            if let Err(e) = self.relays.set_channel(channel, false) {
                error!(%channel, "failed to force relay OFF: {e}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Hardware context
// ---------------------------------------------------------------------------

/// The relay bank and sensor bus, created once at startup and handed to
/// everything that needs them.
#[derive(Clone)]
pub struct HardwareContext {
    pub relays: Arc<dyn RelayPort>,
    pub sensors: Arc<dyn SensorPort>,
}

impl HardwareContext {
    pub fn new(relays: Arc<dyn RelayPort>, sensors: Arc<dyn SensorPort>) -> Self {
        relays.all_off();
        Self { relays, sensors }
    }

    /// Click every relay on, hold, then release them all.
    pub async fn relay_self_test(&self, hold: Duration) -> Result<(), RelayError> {
        warn!(hold_sec = hold.as_secs(), "relay self-test: all relays ON");
        let _guard = RelayGuard::new(Arc::clone(&self.relays), &RelayChannel::ALL);
        for channel in RelayChannel::ALL {
            self.relays.set_channel(channel, true)?;
        }
        tokio::time::sleep(hold).await;
        info!("relay self-test complete");
        Ok(())
    }

    pub fn shutdown(&self) {
        info!("hardware shutdown: forcing all relays OFF");
        self.relays.all_off();
    }
}

// ===========================================================================
// Test doubles
// ===========================================================================


// ===========================================================================
// Tests
// ===========================================================================
