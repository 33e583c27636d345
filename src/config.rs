//! Runtime configuration.
//!
//! Every field has a default, so an empty YAML document (or no file at all) yields a
//! working setup for a 50 A / 60 A LiFePO4 pack.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub battery: BatteryConfig,
    pub charge: ChargeConfig,
    pub poll: PollConfig,
    pub transport: TransportConfig,
    pub ble: BleConfig,
    /// What to do when one sub-frame of a multi-frame answer fails its checksum.
    pub sub_frame_policy: SubFramePolicy,
}

/// Pack limits used when the BMS does not report its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryConfig {
    /// Nominal capacity in Ah, overrides the value read from the BMS.
    pub capacity_ah: Option<f64>,
    pub max_charge_current: f64,
    pub max_discharge_current: f64,
    pub min_cell_voltage: f64,
    pub max_cell_voltage: f64,
    pub float_cell_voltage: f64,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            capacity_ah: None,
            max_charge_current: 50.0,
            max_discharge_current: 60.0,
            min_cell_voltage: 2.9,
            max_cell_voltage: 3.45,
            float_cell_voltage: 3.35,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    SocBanded,
    CellVoltage,
}

/// A current limit applied while the SoC sits in a band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandLimit {
    /// Absolute current in A.
    Amps(f64),
    /// Fraction of the pack's maximum current.
    OfMax(f64),
}

impl BandLimit {
    pub fn resolve(self, max: f64) -> f64 {
        match self {
            BandLimit::Amps(amps) => amps.min(max),
            BandLimit::OfMax(fraction) => max * fraction,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SocBand {
    pub soc: f64,
    pub limit: BandLimit,
}

/// Piecewise-linear control points, `x[i] -> y[i]`. `x` may be ascending or descending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPoints {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

impl ControlPoints {
    pub fn new(x: &[f64], y: &[f64]) -> Self {
        Self { x: x.to_vec(), y: y.to_vec() }
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.x.is_empty() || self.x.len() != self.y.len() {
            return Err(Error::Config(format!(
                "{name}: need the same non-zero number of x and y points ({} vs {})",
                self.x.len(),
                self.y.len()
            )));
        }
        let ascending = self.x.windows(2).all(|w| w[0] < w[1]);
        let descending = self.x.windows(2).all(|w| w[0] > w[1]);
        if !ascending && !descending {
            return Err(Error::Config(format!("{name}: x points must be strictly monotonic")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChargeConfig {
    pub policy: PolicyKind,
    /// Above this SoC charging is stopped entirely.
    pub full_soc: f64,
    /// Checked in order, first band with `soc > band.soc` wins.
    pub charge_bands: Vec<SocBand>,
    /// Checked in order, first band with `soc <= band.soc` wins.
    pub discharge_bands: Vec<SocBand>,
    /// How long the pack may sit at max voltage before dropping to float.
    pub max_voltage_time_secs: u64,
    /// SoC below which max voltage is allowed again.
    pub soc_reset_max_voltage: f64,
    /// Pack voltage within this many volts of the target counts as "at max voltage".
    pub max_voltage_tolerance: f64,
    pub cell_voltage_charge: ControlPoints,
    pub cell_voltage_discharge: ControlPoints,
    pub temperature_charge: ControlPoints,
    pub temperature_discharge: ControlPoints,
    /// Pack voltage penalty per cell, keyed by cell voltage. Cells at or below the
    /// first point contribute nothing.
    pub cell_penalty: ControlPoints,
}

impl Default for ChargeConfig {
    fn default() -> Self {
        Self {
            policy: PolicyKind::SocBanded,
            full_soc: 99.0,
            charge_bands: vec![
                SocBand { soc: 98.0, limit: BandLimit::Amps(5.0) },
                SocBand { soc: 95.0, limit: BandLimit::OfMax(0.25) },
                SocBand { soc: 91.0, limit: BandLimit::OfMax(0.5) },
            ],
            discharge_bands: vec![
                SocBand { soc: 10.0, limit: BandLimit::Amps(5.0) },
                SocBand { soc: 20.0, limit: BandLimit::OfMax(0.25) },
                SocBand { soc: 30.0, limit: BandLimit::OfMax(0.5) },
            ],
            max_voltage_time_secs: 900,
            soc_reset_max_voltage: 90.0,
            max_voltage_tolerance: 0.05,
            cell_voltage_charge: ControlPoints::new(&[3.55, 3.50, 3.45, 3.30], &[0.0, 2.0, 30.0, 60.0]),
            cell_voltage_discharge: ControlPoints::new(&[2.70, 2.80, 2.90, 3.10], &[0.0, 5.0, 30.0, 60.0]),
            temperature_charge: ControlPoints::new(
                &[0.0, 2.0, 5.0, 10.0, 15.0, 20.0, 35.0, 40.0, 55.0],
                &[0.0, 1.0, 6.0, 8.0, 15.0, 25.0, 60.0, 30.0, 0.0],
            ),
            temperature_discharge: ControlPoints::new(
                &[-20.0, -10.0, 0.0, 10.0, 45.0, 55.0, 60.0],
                &[0.0, 10.0, 30.0, 60.0, 60.0, 30.0, 0.0],
            ),
            cell_penalty: ControlPoints::new(&[3.45, 3.55, 3.60], &[0.01, 1.5, 2.0]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Mark the battery offline after this long without a successful poll.
    pub offline_after_secs: u64,
    /// Stop polling the battery after this long without a successful poll.
    pub give_up_after_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self { offline_after_secs: 10, give_up_after_secs: 60 }
    }
}

impl PollConfig {
    pub fn offline_after(&self) -> Duration {
        Duration::from_secs(self.offline_after_secs)
    }

    pub fn give_up_after(&self) -> Duration {
        Duration::from_secs(self.give_up_after_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub read_timeout_ms: u64,
    pub poll_slice_ms: u64,
    pub retry_delay_ms: u64,
    /// Largest frame a declared length may announce before it is treated as corrupt.
    pub max_frame_len: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self { read_timeout_ms: 500, poll_slice_ms: 10, retry_delay_ms: 100, max_frame_len: 1024 }
    }
}

impl TransportConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn poll_slice(&self) -> Duration {
        Duration::from_millis(self.poll_slice_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// Connection attempts per cycle before the notify worker pauses.
    pub reconnect_attempts: u32,
    pub reconnect_backoff_ms: u64,
    /// Pause after a cycle of failed attempts.
    pub cycle_pause_secs: u64,
    /// Decoded frames buffered between the notify worker and the poll loop.
    pub queue_depth: usize,
    /// No frame for this long means the link is dead even if it claims otherwise.
    pub stale_after_secs: u64,
    pub join_timeout_ms: u64,
    /// How long a probe waits for the first complete set of frames.
    pub probe_wait_secs: u64,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            reconnect_attempts: 3,
            reconnect_backoff_ms: 500,
            cycle_pause_secs: 10,
            queue_depth: 8,
            stale_after_secs: 30,
            join_timeout_ms: 2000,
            probe_wait_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubFramePolicy {
    /// A bad sub-frame fails the whole read.
    Strict,
    /// A bad sub-frame is logged and the cells it covers keep their previous values.
    #[default]
    KeepStale,
}

impl Config {
    /// Load and validate a YAML configuration file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let battery = &self.battery;
        if battery.max_charge_current <= 0.0 || battery.max_discharge_current <= 0.0 {
            return Err(Error::Config("max charge/discharge current must be positive".into()));
        }
        if !(battery.min_cell_voltage < battery.float_cell_voltage
            && battery.float_cell_voltage <= battery.max_cell_voltage)
        {
            return Err(Error::Config(
                "cell voltages must satisfy min < float <= max".into(),
            ));
        }

        let transport = &self.transport;
        if transport.read_timeout_ms == 0 || transport.read_timeout_ms > 500 {
            return Err(Error::Config("transport read timeout must be 1..=500 ms".into()));
        }
        if !(5..=20).contains(&transport.poll_slice_ms) {
            return Err(Error::Config("transport poll slice must be 5..=20 ms".into()));
        }

        let charge = &self.charge;
        charge.cell_voltage_charge.validate("cell_voltage_charge")?;
        charge.cell_voltage_discharge.validate("cell_voltage_discharge")?;
        charge.temperature_charge.validate("temperature_charge")?;
        charge.temperature_discharge.validate("temperature_discharge")?;
        charge.cell_penalty.validate("cell_penalty")?;

        if self.poll.give_up_after_secs < self.poll.offline_after_secs {
            return Err(Error::Config("give_up_after must not be shorter than offline_after".into()));
        }
        if self.ble.queue_depth == 0 || self.ble.reconnect_attempts == 0 {
            return Err(Error::Config("ble queue depth and reconnect attempts must be positive".into()));
        }
        Ok(())
    }
}
