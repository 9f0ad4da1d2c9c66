//! BME280 temperature/humidity/pressure driver over I2C.
//!
//! Samples in forced mode with x1 oversampling on all three channels and
//! applies Bosch's floating-point compensation. The register decoding and
//! compensation are plain functions; the bus transport is gated behind the
//! `bme280` feature.

#![cfg_attr(not(feature = "bme280"), allow(dead_code))]

#[cfg(feature = "bme280")]
pub use transport::Bme280Bus;

// ── Register map ────────────────────────────────────────────────────────────

pub(crate) const REG_CHIP_ID: u8 = 0xD0;
pub(crate) const REG_CALIB_TP: u8 = 0x88;
pub(crate) const REG_CALIB_H: u8 = 0xE1;
pub(crate) const REG_CTRL_HUM: u8 = 0xF2;
pub(crate) const REG_STATUS: u8 = 0xF3;
pub(crate) const REG_CTRL_MEAS: u8 = 0xF4;
pub(crate) const REG_DATA: u8 = 0xF7;

pub(crate) const CHIP_ID: u8 = 0x60;

/// osrs_h = x1.
pub(crate) const CTRL_HUM_X1: u8 = 0b001;
/// osrs_t = x1, osrs_p = x1, mode = forced.
pub(crate) const CTRL_MEAS_FORCED_X1: u8 = (0b001 << 5) | (0b001 << 2) | 0b01;
/// Status bit 3: conversion running.
pub(crate) const STATUS_MEASURING: u8 = 1 << 3;

/// Length of the 0x88..=0xA1 calibration block.
pub(crate) const CALIB_TP_LEN: usize = 26;
/// Length of the 0xE1..=0xE7 calibration block.
pub(crate) const CALIB_H_LEN: usize = 7;

// ── Calibration ─────────────────────────────────────────────────────────────

/// Factory trim values burned into each device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calibration {
    pub t1: u16,
    pub t2: i16,
    pub t3: i16,
    pub p1: u16,
    pub p2: i16,
    pub p3: i16,
    pub p4: i16,
    pub p5: i16,
    pub p6: i16,
    pub p7: i16,
    pub p8: i16,
    pub p9: i16,
    pub h1: u8,
    pub h2: i16,
    pub h3: u8,
    pub h4: i16,
    pub h5: i16,
    pub h6: i8,
}

impl Calibration {
    /// Decode the two calibration blocks read from 0x88 and 0xE1.
    pub fn from_registers(tp: &[u8; CALIB_TP_LEN], h: &[u8; CALIB_H_LEN]) -> Self {
        let u16_at = |i: usize| u16::from_le_bytes([tp[i], tp[i + 1]]);
        let i16_at = |i: usize| i16::from_le_bytes([tp[i], tp[i + 1]]);

        Self {
            t1: u16_at(0),
            t2: i16_at(2),
            t3: i16_at(4),
            p1: u16_at(6),
            p2: i16_at(8),
            p3: i16_at(10),
            p4: i16_at(12),
            p5: i16_at(14),
            p6: i16_at(16),
            p7: i16_at(18),
            p8: i16_at(20),
            p9: i16_at(22),
            // tp[24] (0xA0) is unused
            h1: tp[25],
            h2: i16::from_le_bytes([h[0], h[1]]),
            h3: h[2],
            // H4 = E4[7:0] << 4 | E5[3:0], H5 = E6[7:0] << 4 | E5[7:4], both signed 12-bit
            h4: ((h[3] as i8 as i16) << 4) | (h[4] & 0x0F) as i16,
            h5: ((h[5] as i8 as i16) << 4) | (h[4] >> 4) as i16,
            h6: h[6] as i8,
        }
    }
}

// ── Raw data ────────────────────────────────────────────────────────────────

/// Uncompensated ADC values from the 0xF7..=0xFE burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawData {
    pub pressure: u32,
    pub temperature: u32,
    pub humidity: u16,
}

impl RawData {
    pub fn from_burst(b: &[u8; 8]) -> Self {
        let adc20 = |msb: u8, lsb: u8, xlsb: u8| {
            ((msb as u32) << 12) | ((lsb as u32) << 4) | ((xlsb as u32) >> 4)
        };
        Self {
            pressure: adc20(b[0], b[1], b[2]),
            temperature: adc20(b[3], b[4], b[5]),
            humidity: u16::from_be_bytes([b[6], b[7]]),
        }
    }
}

// ── Compensation ────────────────────────────────────────────────────────────

/// Compensated values: °C, hPa, %RH.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Compensated {
    pub temperature_c: f64,
    pub pressure_hpa: f64,
    pub humidity_pct: f64,
}

/// Returns `(t_fine, °C)`. `t_fine` feeds the pressure and humidity formulas.
pub fn compensate_temperature(cal: &Calibration, adc_t: u32) -> (f64, f64) {
    let adc_t = adc_t as f64;
    let t1 = cal.t1 as f64;
    let var1 = (adc_t / 16384.0 - t1 / 1024.0) * cal.t2 as f64;
    let d = adc_t / 131072.0 - t1 / 8192.0;
    let var2 = d * d * cal.t3 as f64;
    let t_fine = var1 + var2;
    (t_fine, t_fine / 5120.0)
}

/// Pressure in Pa.
pub fn compensate_pressure(cal: &Calibration, t_fine: f64, adc_p: u32) -> f64 {
    let mut var1 = t_fine / 2.0 - 64000.0;
    let mut var2 = var1 * var1 * cal.p6 as f64 / 32768.0;
    var2 += var1 * cal.p5 as f64 * 2.0;
    var2 = var2 / 4.0 + cal.p4 as f64 * 65536.0;
    var1 = (cal.p3 as f64 * var1 * var1 / 524288.0 + cal.p2 as f64 * var1) / 524288.0;
    var1 = (1.0 + var1 / 32768.0) * cal.p1 as f64;
    if var1 == 0.0 {
        return 0.0; // avoid division by zero on a blank calibration
    }
    let mut p = 1048576.0 - adc_p as f64;
    p = (p - var2 / 4096.0) * 6250.0 / var1;
    let var1 = cal.p9 as f64 * p * p / 2147483648.0;
    let var2 = p * cal.p8 as f64 / 32768.0;
    p + (var1 + var2 + cal.p7 as f64) / 16.0
}

/// Relative humidity in %, clamped to 0..=100.
pub fn compensate_humidity(cal: &Calibration, t_fine: f64, adc_h: u16) -> f64 {
    let var_h = t_fine - 76800.0;
    let var_h = (adc_h as f64 - (cal.h4 as f64 * 64.0 + cal.h5 as f64 / 16384.0 * var_h))
        * (cal.h2 as f64 / 65536.0
            * (1.0
                + cal.h6 as f64 / 67108864.0
                    * var_h
                    * (1.0 + cal.h3 as f64 / 67108864.0 * var_h)));
    let var_h = var_h * (1.0 - cal.h1 as f64 * var_h / 524288.0);
    var_h.clamp(0.0, 100.0)
}

pub fn compensate(cal: &Calibration, raw: &RawData) -> Compensated {
    let (t_fine, temperature_c) = compensate_temperature(cal, raw.temperature);
    Compensated {
        temperature_c,
        pressure_hpa: compensate_pressure(cal, t_fine, raw.pressure) / 100.0,
        humidity_pct: compensate_humidity(cal, t_fine, raw.humidity),
    }
}

// ── Transport ───────────────────────────────────────────────────────────────

#[cfg(feature = "bme280")]
mod transport {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::{thread, time::Duration};

    use chrono::Utc;
    use rppal::i2c::I2c;

    use super::*;
    use crate::error::SensorReadError;
    use crate::sensor::{Sample, SensorPort};

    /// A forced x1/x1/x1 conversion takes ~8 ms; wait a little longer.
    const CONVERSION_WAIT: Duration = Duration::from_millis(10);

    /// Several BME280s sharing one I2C bus.
    pub struct Bme280Bus {
        i2c: Mutex<I2c>,
        calibrations: HashMap<u16, Calibration>,
    }

    fn bus_err(address: u16) -> impl Fn(rppal::i2c::Error) -> SensorReadError {
        move |e| SensorReadError::Bus {
            address,
            detail: e.to_string(),
        }
    }

    impl Bme280Bus {
        /// Open I2C bus `bus`, check each device's chip id and load its
        /// calibration.
        pub fn open(bus: u8, addresses: &[u16]) -> anyhow::Result<Self> {
            let mut i2c = I2c::with_bus(bus)?;
            let mut calibrations = HashMap::new();

            for &address in addresses {
                i2c.set_slave_address(address).map_err(bus_err(address))?;

                let mut id = [0u8; 1];
                i2c.block_read(REG_CHIP_ID, &mut id).map_err(bus_err(address))?;
                if id[0] != CHIP_ID {
                    return Err(SensorReadError::ChipId {
                        address,
                        expected: CHIP_ID,
                        found: id[0],
                    }
                    .into());
                }

                let mut tp = [0u8; CALIB_TP_LEN];
                let mut h = [0u8; CALIB_H_LEN];
                i2c.block_read(REG_CALIB_TP, &mut tp).map_err(bus_err(address))?;
                i2c.block_read(REG_CALIB_H, &mut h).map_err(bus_err(address))?;
                calibrations.insert(address, Calibration::from_registers(&tp, &h));

                tracing::info!(
                    addr = format_args!("0x{address:02x}"),
                    bus,
                    "bme280 initialised"
                );
            }

            Ok(Self {
                i2c: Mutex::new(i2c),
                calibrations,
            })
        }
    }

    impl SensorPort for Bme280Bus {
        fn read(&self, address: u16) -> Result<Sample, SensorReadError> {
            let cal = self
                .calibrations
                .get(&address)
                .ok_or(SensorReadError::UnknownAddress(address))?;
            let mut i2c = self.i2c.lock().map_err(|_| SensorReadError::Poisoned)?;
            let err = bus_err(address);

            i2c.set_slave_address(address).map_err(&err)?;
            // ctrl_hum only takes effect after a ctrl_meas write.
            i2c.block_write(REG_CTRL_HUM, &[CTRL_HUM_X1]).map_err(&err)?;
            i2c.block_write(REG_CTRL_MEAS, &[CTRL_MEAS_FORCED_X1])
                .map_err(&err)?;

            thread::sleep(CONVERSION_WAIT);
            for _ in 0..5 {
                let mut status = [0u8; 1];
                i2c.block_read(REG_STATUS, &mut status).map_err(&err)?;
                if status[0] & STATUS_MEASURING == 0 {
                    break;
                }
                thread::sleep(Duration::from_millis(2));
            }

            let mut burst = [0u8; 8];
            i2c.block_read(REG_DATA, &mut burst).map_err(&err)?;
            let captured_at = Utc::now();
            let c = compensate(cal, &RawData::from_burst(&burst));

            Ok(Sample {
                captured_at,
                temperature_c: c.temperature_c,
                humidity_pct: c.humidity_pct,
                pressure_hpa: c.pressure_hpa,
            })
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
