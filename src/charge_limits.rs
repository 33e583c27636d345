//! Advisory charge/discharge limits (CCL, DCL, CVL) derived from the telemetry.
//!
//! Two policies are available. The SoC-banded policy steps the current down in fixed SoC
//! bands and holds the pack at max voltage only for a limited time before dropping to
//! float; that hysteresis is persisted so a restart does not trigger another full charge.
//! The cell-voltage policy interpolates the current from the extreme cell voltages and
//! temperatures and lowers the voltage target for every cell running high.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::battery_state::Battery;
use crate::config::{BatteryConfig, ChargeConfig, Config, ControlPoints, PolicyKind, SocBand};
use crate::error::{Error, Result};
use crate::settings::SettingsStore;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChargeLimits {
    /// CVL in V.
    pub control_voltage: f64,
    /// CCL in A.
    pub control_charge_current: f64,
    /// DCL in A.
    pub control_discharge_current: f64,
    pub allow_charge: bool,
    pub allow_discharge: bool,
}

/// Hysteresis state that has to survive restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeState {
    /// When the pack first sat at max voltage in the current stretch.
    pub max_voltage_start_time: Option<DateTime<Utc>>,
    pub allow_max_voltage: bool,
}

impl Default for ChargeState {
    fn default() -> Self {
        Self { max_voltage_start_time: None, allow_max_voltage: true }
    }
}

fn allow_key(id: &str) -> String {
    format!("{id}/allow_max_voltage")
}

fn start_key(id: &str) -> String {
    format!("{id}/max_voltage_start_time")
}

impl ChargeState {
    pub fn load(store: &dyn SettingsStore, id: &str) -> Result<Self> {
        let mut state = Self::default();
        if let Some(allow) = store.get(&allow_key(id)) {
            state.allow_max_voltage = allow
                .parse()
                .map_err(|_| Error::Settings(format!("{}: not a bool: {allow:?}", allow_key(id))))?;
        }
        if let Some(start) = store.get(&start_key(id)).filter(|s| !s.is_empty()) {
            let start = DateTime::parse_from_rfc3339(&start)
                .map_err(|e| Error::Settings(format!("{}: {e}", start_key(id))))?;
            state.max_voltage_start_time = Some(start.with_timezone(&Utc));
        }
        Ok(state)
    }

    pub fn save(&self, store: &mut dyn SettingsStore, id: &str) -> Result<()> {
        store.set(&allow_key(id), self.allow_max_voltage.to_string())?;
        let start = self.max_voltage_start_time.map(|t| t.to_rfc3339()).unwrap_or_default();
        store.set(&start_key(id), start)
    }
}

/// Piecewise-linear lookup, clamped to the end points. `x` may run either way.
pub fn interpolate(points: &ControlPoints, x: f64) -> f64 {
    let pairs: Vec<(f64, f64)> = points.x.iter().copied().zip(points.y.iter().copied()).collect();
    let (Some(&first), Some(&last)) = (pairs.first(), pairs.last()) else {
        return 0.0;
    };
    let ascending = first.0 <= last.0;
    let reached = |a: f64, b: f64| if ascending { a <= b } else { a >= b };

    if reached(x, first.0) {
        return first.1;
    }
    for window in pairs.windows(2) {
        let ((x0, y0), (x1, y1)) = (window[0], window[1]);
        if reached(x, x1) {
            return y0 + (x - x0) / (x1 - x0) * (y1 - y0);
        }
    }
    last.1
}

/// Voltage penalty for one cell. Nothing at or below the first control point.
fn cell_penalty(points: &ControlPoints, voltage: f64) -> f64 {
    match points.x.first() {
        Some(&trigger) if voltage > trigger => interpolate(points, voltage),
        _ => 0.0,
    }
}

fn band_current(bands: &[SocBand], max: f64, matches: impl Fn(&SocBand) -> bool) -> f64 {
    bands.iter().find(|band| matches(band)).map_or(max, |band| band.limit.resolve(max))
}

/// Per-battery limit engine.
#[derive(Debug, Clone)]
pub struct ChargeController {
    id: String,
    charge: ChargeConfig,
    limits: BatteryConfig,
    state: ChargeState,
}

impl ChargeController {
    pub fn new(config: &Config, id: impl Into<String>, state: ChargeState) -> Self {
        Self { id: id.into(), charge: config.charge.clone(), limits: config.battery.clone(), state }
    }

    /// Construct with the hysteresis state persisted for battery `id`.
    pub fn load(config: &Config, store: &dyn SettingsStore, id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let state = ChargeState::load(store, &id)?;
        debug!("{id}: loaded charge state {state:?}");
        Ok(Self::new(config, id, state))
    }

    pub fn save(&self, store: &mut dyn SettingsStore) -> Result<()> {
        self.state.save(store, &self.id)
    }

    pub fn state(&self) -> &ChargeState {
        &self.state
    }

    /// Limits for the current telemetry, `None` until the battery has been fully read.
    pub fn update(&mut self, battery: &Battery, now: DateTime<Utc>) -> Option<ChargeLimits> {
        if !battery.is_settled() {
            return None;
        }
        let cells = battery.cell_count? as f64;
        let max_voltage = battery.max_battery_voltage.unwrap_or(self.limits.max_cell_voltage * cells);
        let min_voltage = battery.min_battery_voltage.unwrap_or(self.limits.min_cell_voltage * cells);
        let max_charge = battery.max_battery_charge_current.unwrap_or(self.limits.max_charge_current);
        let max_discharge = battery.max_battery_discharge_current.unwrap_or(self.limits.max_discharge_current);

        let (control_voltage, charge, discharge) = match self.charge.policy {
            PolicyKind::SocBanded => {
                let soc = battery.soc?;
                let float_voltage = self.limits.float_cell_voltage * cells;
                let voltage = self.manage_charge_voltage(battery, soc, max_voltage, float_voltage, now);
                let (charge, discharge) = self.soc_banded_current(soc, max_charge, max_discharge);
                (voltage, charge, discharge)
            }
            PolicyKind::CellVoltage => {
                let voltage = self.cell_voltage_target(battery, max_voltage, min_voltage);
                let (charge, discharge) = self.cell_voltage_current(battery, max_charge, max_discharge)?;
                (voltage, charge, discharge)
            }
        };

        Some(ChargeLimits {
            control_voltage,
            control_charge_current: charge,
            control_discharge_current: discharge,
            allow_charge: charge > 0.0,
            allow_discharge: discharge > 0.0,
        })
    }

    fn soc_banded_current(&self, soc: f64, max_charge: f64, max_discharge: f64) -> (f64, f64) {
        let charge = if soc > self.charge.full_soc {
            0.0
        } else {
            band_current(&self.charge.charge_bands, max_charge, |band| soc > band.soc)
        };
        let discharge = band_current(&self.charge.discharge_bands, max_discharge, |band| soc <= band.soc);
        (charge, discharge)
    }

    /// Max voltage until the pack has sat there for the configured time, then float
    /// until the SoC falls below the reset level.
    fn manage_charge_voltage(
        &mut self,
        battery: &Battery,
        soc: f64,
        max_voltage: f64,
        float_voltage: f64,
        now: DateTime<Utc>,
    ) -> f64 {
        let hold = ChronoDuration::seconds(self.charge.max_voltage_time_secs as i64);
        let state = &mut self.state;

        if !state.allow_max_voltage {
            if soc < self.charge.soc_reset_max_voltage {
                info!("{}: SoC {soc}% below reset level, allowing max voltage again", self.id);
                state.allow_max_voltage = true;
            } else {
                return float_voltage;
            }
        }

        let at_max = battery.voltage.is_some_and(|v| v >= max_voltage - self.charge.max_voltage_tolerance);
        if !at_max {
            state.max_voltage_start_time = None;
            return max_voltage;
        }
        let start = *state.max_voltage_start_time.get_or_insert(now);
        if now - start >= hold {
            info!("{}: held max voltage since {start}, dropping to float", self.id);
            state.allow_max_voltage = false;
            state.max_voltage_start_time = None;
            return float_voltage;
        }
        max_voltage
    }

    fn cell_voltage_current(&self, battery: &Battery, max_charge: f64, max_discharge: f64) -> Option<(f64, f64)> {
        let highest = battery.max_cell_voltage()?;
        let lowest = battery.min_cell_voltage()?;
        let mut charge = interpolate(&self.charge.cell_voltage_charge, highest).min(max_charge);
        let mut discharge = interpolate(&self.charge.cell_voltage_discharge, lowest).min(max_discharge);

        // worst case over all sensors: check both ends of the reported range
        if let (Some(cold), Some(hot)) = (battery.min_temperature(), battery.max_temperature()) {
            for t in [cold, hot] {
                charge = charge.min(interpolate(&self.charge.temperature_charge, t));
                discharge = discharge.min(interpolate(&self.charge.temperature_discharge, t));
            }
        }
        Some((charge.max(0.0), discharge.max(0.0)))
    }

    fn cell_voltage_target(&self, battery: &Battery, max_voltage: f64, min_voltage: f64) -> f64 {
        let penalty: f64 = battery
            .cells
            .iter()
            .filter_map(|cell| cell.voltage)
            .map(|v| cell_penalty(&self.charge.cell_penalty, v))
            .sum();
        if penalty > 0.0 {
            debug!("{}: cell voltage penalty {penalty:.3} V", self.id);
        }
        (max_voltage - penalty).max(min_voltage)
    }
}
