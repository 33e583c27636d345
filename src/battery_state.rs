//! The normalized telemetry model every vendor decoder writes into.
//!
//! Every reading starts out unknown (`None`) and only becomes known once a decoder has
//! seen it on the wire. Derived accessors stay unknown until the driver has completed one
//! full refresh, so a half-populated battery is never published as if it were complete.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;

/// Number of current samples the rolling average used for time-to-SoC estimates spans.
pub const CURRENT_AVERAGE_WINDOW: usize = 300;

/// Temperatures outside this range are sensor faults; the BMS protects long before.
const TEMPERATURE_CLAMP: (f64, f64) = (-20.0, 100.0);

/// Three-level protection state, ordered so that `max` picks the worst.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Severity {
    #[default]
    Ok,
    Warning,
    Alarm,
}

impl Severity {
    pub fn alarm_if(flag: bool) -> Self {
        if flag {
            Severity::Alarm
        } else {
            Severity::Ok
        }
    }
}

/// Named protection conditions a BMS can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    VoltageHigh,
    VoltageLow,
    CellVoltageHigh,
    CellVoltageLow,
    SocLow,
    CurrentOver,
    CurrentUnder,
    CellImbalance,
    InternalFailure,
    TempHighCharge,
    TempLowCharge,
    TempHighDischarge,
    TempLowDischarge,
}

/// Protection flags, written only by the owning decoder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Protection {
    pub voltage_high: Severity,
    pub voltage_low: Severity,
    pub voltage_cell_high: Severity,
    pub voltage_cell_low: Severity,
    pub soc_low: Severity,
    pub current_over: Severity,
    pub current_under: Severity,
    pub cell_imbalance: Severity,
    pub internal_failure: Severity,
    pub temp_high_charge: Severity,
    pub temp_low_charge: Severity,
    pub temp_high_discharge: Severity,
    pub temp_low_discharge: Severity,
}

impl Protection {
    fn slot_mut(&mut self, condition: Condition) -> &mut Severity {
        match condition {
            Condition::VoltageHigh => &mut self.voltage_high,
            Condition::VoltageLow => &mut self.voltage_low,
            Condition::CellVoltageHigh => &mut self.voltage_cell_high,
            Condition::CellVoltageLow => &mut self.voltage_cell_low,
            Condition::SocLow => &mut self.soc_low,
            Condition::CurrentOver => &mut self.current_over,
            Condition::CurrentUnder => &mut self.current_under,
            Condition::CellImbalance => &mut self.cell_imbalance,
            Condition::InternalFailure => &mut self.internal_failure,
            Condition::TempHighCharge => &mut self.temp_high_charge,
            Condition::TempLowCharge => &mut self.temp_low_charge,
            Condition::TempHighDischarge => &mut self.temp_high_discharge,
            Condition::TempLowDischarge => &mut self.temp_low_discharge,
        }
    }

    pub fn get(&self, condition: Condition) -> Severity {
        match condition {
            Condition::VoltageHigh => self.voltage_high,
            Condition::VoltageLow => self.voltage_low,
            Condition::CellVoltageHigh => self.voltage_cell_high,
            Condition::CellVoltageLow => self.voltage_cell_low,
            Condition::SocLow => self.soc_low,
            Condition::CurrentOver => self.current_over,
            Condition::CurrentUnder => self.current_under,
            Condition::CellImbalance => self.cell_imbalance,
            Condition::InternalFailure => self.internal_failure,
            Condition::TempHighCharge => self.temp_high_charge,
            Condition::TempLowCharge => self.temp_low_charge,
            Condition::TempHighDischarge => self.temp_high_discharge,
            Condition::TempLowDischarge => self.temp_low_discharge,
        }
    }

    pub fn set(&mut self, condition: Condition, severity: Severity) {
        *self.slot_mut(condition) = severity;
    }

    pub fn worst(&self) -> Severity {
        [
            self.voltage_high,
            self.voltage_low,
            self.voltage_cell_high,
            self.voltage_cell_low,
            self.soc_low,
            self.current_over,
            self.current_under,
            self.cell_imbalance,
            self.internal_failure,
            self.temp_high_charge,
            self.temp_low_charge,
            self.temp_high_discharge,
            self.temp_low_discharge,
        ]
        .into_iter()
        .max()
        .unwrap_or_default()
    }
}

/// Which end of the integer bit index 0 refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOrder {
    Lsb0,
    Msb0,
}

/// One row of a vendor bit table: the bits that raise `condition` to alarm or warning.
#[derive(Debug)]
pub struct AlarmBits {
    pub condition: Condition,
    pub alarm: &'static [u8],
    pub warning: &'static [u8],
}

/// A fixed per-vendor map from bit positions in a 8–32 bit status word to conditions.
#[derive(Debug)]
pub struct BitTable {
    pub width: u8,
    pub order: BitOrder,
    pub rows: &'static [AlarmBits],
}

impl BitTable {
    fn bit(&self, value: u32, index: u8) -> bool {
        let shift = match self.order {
            BitOrder::Lsb0 => index,
            BitOrder::Msb0 => self.width - 1 - index,
        };
        (value >> shift) & 1 != 0
    }

    /// Recompute every condition named in the table from `value`. Rows sharing a
    /// condition combine to the worst severity.
    pub fn decode(&self, value: u32, protection: &mut Protection) {
        for row in self.rows {
            protection.set(row.condition, Severity::Ok);
        }
        for row in self.rows {
            let severity = if row.alarm.iter().any(|&b| self.bit(value, b)) {
                Severity::Alarm
            } else if row.warning.iter().any(|&b| self.bit(value, b)) {
                Severity::Warning
            } else {
                Severity::Ok
            };
            let slot = protection.slot_mut(row.condition);
            *slot = (*slot).max(severity);
        }
    }
}

/// Unpack `count` flags from a byte string, bit 0 of each byte first for `Lsb0`.
pub fn unpack_flags(bytes: &[u8], count: usize, order: BitOrder) -> Vec<bool> {
    (0..count)
        .map(|i| {
            let byte = bytes.get(i / 8).copied().unwrap_or(0);
            let bit = match order {
                BitOrder::Lsb0 => i % 8,
                BitOrder::Msb0 => 7 - i % 8,
            };
            (byte >> bit) & 1 != 0
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Cell {
    /// Volts, unknown until read.
    pub voltage: Option<f64>,
    pub balance: Option<bool>,
    pub temperature: Option<f64>,
}

/// The reported state of one battery.
#[derive(Debug, Clone, Serialize)]
pub struct Battery {
    /// Transport address the battery was discovered on.
    pub address: String,
    pub bms_type: String,
    pub hardware_version: Option<String>,
    pub unique_id: Option<String>,
    pub production: Option<String>,

    pub cell_count: Option<usize>,
    pub cells: Vec<Cell>,
    /// Ah
    pub capacity: Option<f64>,
    /// Ah
    pub capacity_remain: Option<f64>,
    /// V
    pub voltage: Option<f64>,
    /// A, positive while charging.
    pub current: Option<f64>,
    /// %
    pub soc: Option<f64>,
    pub cycles: Option<u32>,

    pub temp_sensors: Option<usize>,
    /// °C, clamped to the plausible range on ingest.
    pub temperatures: [Option<f64>; 4],
    pub temp_mos: Option<f64>,

    pub charge_fet: Option<bool>,
    pub discharge_fet: Option<bool>,
    pub balance_fet: Option<bool>,
    /// Pack-level balancing indicator for BMSs that do not report it per cell.
    pub balancing: Option<bool>,

    /// Summary fields for BMSs that report min/max without a per-cell array.
    pub cell_min_voltage: Option<f64>,
    pub cell_max_voltage: Option<f64>,
    pub cell_min_no: Option<usize>,
    pub cell_max_no: Option<usize>,

    pub max_battery_charge_current: Option<f64>,
    pub max_battery_discharge_current: Option<f64>,
    pub max_battery_voltage: Option<f64>,
    pub min_battery_voltage: Option<f64>,

    pub protection: Protection,
    pub online: bool,
    pub poll_interval: Duration,

    #[serde(skip)]
    settled: bool,
    #[serde(skip)]
    current_samples: VecDeque<f64>,
}

impl Battery {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            bms_type: "Generic".into(),
            hardware_version: None,
            unique_id: None,
            production: None,
            cell_count: None,
            cells: Vec::new(),
            capacity: None,
            capacity_remain: None,
            voltage: None,
            current: None,
            soc: None,
            cycles: None,
            temp_sensors: None,
            temperatures: [None; 4],
            temp_mos: None,
            charge_fet: None,
            discharge_fet: None,
            balance_fet: None,
            balancing: None,
            cell_min_voltage: None,
            cell_max_voltage: None,
            cell_min_no: None,
            cell_max_no: None,
            max_battery_charge_current: None,
            max_battery_discharge_current: None,
            max_battery_voltage: None,
            min_battery_voltage: None,
            protection: Protection::default(),
            online: true,
            poll_interval: Duration::from_millis(1000),
            settled: false,
            current_samples: VecDeque::with_capacity(CURRENT_AVERAGE_WINDOW),
        }
    }

    /// Identity used to namespace persisted settings.
    pub fn settings_id(&self) -> String {
        self.unique_id.clone().unwrap_or_else(|| self.address.clone())
    }

    /// Set the cell count, re-provisioning the cell array only when it changes.
    pub fn set_cell_count(&mut self, count: usize) {
        if self.cell_count != Some(count) || self.cells.len() != count {
            self.cells = vec![Cell::default(); count];
        }
        self.cell_count = Some(count);
    }

    pub fn cell_mut(&mut self, index: usize) -> Option<&mut Cell> {
        self.cells.get_mut(index)
    }

    pub fn set_temperature(&mut self, sensor: usize, celsius: f64) {
        if let Some(slot) = self.temperatures.get_mut(sensor) {
            *slot = Some(celsius.clamp(TEMPERATURE_CLAMP.0, TEMPERATURE_CLAMP.1));
        }
    }

    pub fn set_temp_mos(&mut self, celsius: f64) {
        self.temp_mos = Some(celsius.clamp(TEMPERATURE_CLAMP.0, TEMPERATURE_CLAMP.1));
    }

    /// Called by drivers once a complete refresh has populated the model.
    pub fn mark_settled(&mut self) {
        self.settled = true;
    }

    pub fn is_settled(&self) -> bool {
        self.settled
    }

    /// Add the current reading to the rolling window.
    pub fn record_current_sample(&mut self) {
        if let Some(current) = self.current {
            if self.current_samples.len() == CURRENT_AVERAGE_WINDOW {
                self.current_samples.pop_front();
            }
            self.current_samples.push_back(current);
        }
    }

    pub fn current_average(&self) -> Option<f64> {
        if self.current_samples.is_empty() {
            return None;
        }
        Some(self.current_samples.iter().sum::<f64>() / self.current_samples.len() as f64)
    }

    fn settled_cells(&self) -> Option<&[Cell]> {
        self.settled.then_some(&self.cells[..])
    }

    fn known_voltages(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.cells.iter().enumerate().filter_map(|(i, c)| c.voltage.map(|v| (i, v)))
    }

    pub fn min_cell_voltage(&self) -> Option<f64> {
        let cells = self.settled_cells()?;
        if cells.is_empty() {
            return self.cell_min_voltage;
        }
        self.known_voltages().map(|(_, v)| v).reduce(f64::min)
    }

    pub fn max_cell_voltage(&self) -> Option<f64> {
        let cells = self.settled_cells()?;
        if cells.is_empty() {
            return self.cell_max_voltage;
        }
        self.known_voltages().map(|(_, v)| v).reduce(f64::max)
    }

    /// Index of the lowest cell.
    pub fn min_cell(&self) -> Option<usize> {
        let cells = self.settled_cells()?;
        if cells.is_empty() {
            return self.cell_min_no;
        }
        self.known_voltages()
            .reduce(|a, b| if b.1 < a.1 { b } else { a })
            .map(|(i, _)| i)
    }

    /// Index of the highest cell.
    pub fn max_cell(&self) -> Option<usize> {
        let cells = self.settled_cells()?;
        if cells.is_empty() {
            return self.cell_max_no;
        }
        self.known_voltages()
            .reduce(|a, b| if b.1 > a.1 { b } else { a })
            .map(|(i, _)| i)
    }

    pub fn min_cell_desc(&self) -> Option<String> {
        self.min_cell().map(cell_desc)
    }

    pub fn max_cell_desc(&self) -> Option<String> {
        self.max_cell().map(cell_desc)
    }

    pub fn cell_voltage(&self, index: usize) -> Option<f64> {
        self.settled_cells()?.get(index)?.voltage
    }

    pub fn cell_balancing(&self, index: usize) -> Option<bool> {
        self.settled_cells()?.get(index)?.balance
    }

    /// True when any cell (or the pack) reports balancing.
    pub fn balancing_active(&self) -> Option<bool> {
        let cells = self.settled_cells()?;
        let per_cell = cells.iter().filter_map(|c| c.balance).reduce(|a, b| a || b);
        per_cell.or(self.balancing)
    }

    fn known_temperatures(&self) -> impl Iterator<Item = f64> + '_ {
        self.temperatures.iter().flatten().copied()
    }

    /// Mean over all reporting temperature sensors.
    pub fn temperature(&self) -> Option<f64> {
        if !self.settled {
            return None;
        }
        let (sum, n) = self.known_temperatures().fold((0.0, 0usize), |(s, n), t| (s + t, n + 1));
        (n > 0).then(|| sum / n as f64)
    }

    pub fn min_temperature(&self) -> Option<f64> {
        if !self.settled {
            return None;
        }
        self.known_temperatures().reduce(f64::min)
    }

    pub fn max_temperature(&self) -> Option<f64> {
        if !self.settled {
            return None;
        }
        self.known_temperatures().reduce(f64::max)
    }

    /// Remaining capacity in Ah, reported or derived from SoC.
    pub fn remaining_capacity(&self) -> Option<f64> {
        if !self.settled {
            return None;
        }
        self.capacity_remain
            .or_else(|| Some(self.capacity? * self.soc? / 100.0))
    }

    /// Pack mid-point voltage and the imbalance between the two halves in percent.
    ///
    /// Only available with at least 4 cells and every cell voltage known.
    pub fn midpoint(&self) -> Option<(f64, f64)> {
        let cells = self.settled_cells()?;
        let count = self.cell_count?;
        if count < 4 || cells.len() != count {
            return None;
        }
        let voltages: Vec<f64> = cells.iter().map(|c| c.voltage).collect::<Option<_>>()?;
        let half = count / 2;
        let first: f64 = voltages[..half].iter().sum();
        let second: f64 = voltages[half..half * 2].iter().sum();
        if second == 0.0 {
            return None;
        }
        // odd cell counts split the last cell between both halves
        let extra = if count % 2 == 1 { voltages[count - 1] / 2.0 } else { 0.0 };
        let midpoint = (first + second) / 2.0 + extra;
        Some((midpoint, (1.0 - first / second).abs() * 100.0))
    }

    /// Estimated time until `target_soc` is reached at the average current, if the
    /// battery is moving towards it.
    pub fn time_to_soc(&self, target_soc: f64) -> Option<Duration> {
        if !self.settled {
            return None;
        }
        let soc = self.soc?;
        let capacity = self.capacity?;
        let current = self.current_average()?;
        if capacity <= 0.0 || current == 0.0 {
            return None;
        }
        let percent_per_sec = current.abs() / (capacity / 100.0) / 3600.0;
        let remaining = if current > 0.0 && soc < target_soc {
            target_soc - soc
        } else if current < 0.0 && soc > target_soc {
            soc - target_soc
        } else {
            return None;
        };
        Some(Duration::from_secs_f64(remaining / percent_per_sec))
    }

    /// Whether the last known cell voltages are all inside `[min, max]`.
    pub fn cells_look_safe(&self, min: f64, max: f64) -> bool {
        let mut known = self.known_voltages().peekable();
        known.peek().is_some() && known.all(|(_, v)| (min..=max).contains(&v))
    }
}

pub fn cell_desc(index: usize) -> String {
    format!("C{}", index + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settled_battery(voltages: &[f64]) -> Battery {
        let mut battery = Battery::new("test");
        battery.set_cell_count(voltages.len());
        for (cell, v) in battery.cells.iter_mut().zip(voltages) {
            cell.voltage = Some(*v);
        }
        battery.mark_settled();
        battery
    }

    #[test]
    fn accessors_unknown_until_settled() {
        let mut battery = Battery::new("test");
        battery.set_cell_count(4);
        battery.cells[0].voltage = Some(3.3);
        battery.soc = Some(50.0);
        battery.capacity = Some(100.0);
        assert_eq!(battery.min_cell_voltage(), None);
        assert_eq!(battery.remaining_capacity(), None);
        assert_eq!(battery.midpoint(), None);

        battery.mark_settled();
        assert_eq!(battery.min_cell_voltage(), Some(3.3));
        assert_eq!(battery.remaining_capacity(), Some(50.0));
    }

    #[test]
    fn min_max_cells() {
        let battery = settled_battery(&[3.30, 3.35, 3.28, 3.40]);
        assert_eq!(battery.min_cell_voltage(), Some(3.28));
        assert_eq!(battery.max_cell_voltage(), Some(3.40));
        assert_eq!(battery.min_cell(), Some(2));
        assert_eq!(battery.max_cell_desc().as_deref(), Some("C4"));
    }

    #[test]
    fn min_max_fall_back_to_summary_fields() {
        let mut battery = Battery::new("test");
        battery.cell_min_voltage = Some(3.1);
        battery.cell_max_no = Some(7);
        battery.mark_settled();
        assert_eq!(battery.min_cell_voltage(), Some(3.1));
        assert_eq!(battery.max_cell(), Some(7));
    }

    #[test]
    fn cell_array_kept_when_count_unchanged() {
        let mut battery = settled_battery(&[3.3; 4]);
        battery.set_cell_count(4);
        assert_eq!(battery.cells[0].voltage, Some(3.3));
        battery.set_cell_count(8);
        assert_eq!(battery.cells.len(), 8);
        assert_eq!(battery.cells[0].voltage, None);
    }

    #[test]
    fn remaining_capacity_prefers_reported_value() {
        let mut battery = settled_battery(&[]);
        battery.capacity = Some(200.0);
        battery.soc = Some(25.0);
        assert_eq!(battery.remaining_capacity(), Some(50.0));
        battery.capacity_remain = Some(48.5);
        assert_eq!(battery.remaining_capacity(), Some(48.5));
    }

    #[test]
    fn midpoint_even_and_odd() {
        let battery = settled_battery(&[3.3, 3.3, 3.3, 3.3]);
        let (mid, deviation) = battery.midpoint().unwrap();
        assert!((mid - 6.6).abs() < 1e-9);
        assert!(deviation.abs() < 1e-9);

        let battery = settled_battery(&[3.0, 3.0, 3.3, 3.3, 3.2]);
        let (mid, deviation) = battery.midpoint().unwrap();
        assert!((mid - (6.3 + 1.6)).abs() < 1e-9);
        assert!((deviation - (1.0 - 6.0 / 6.6f64).abs() * 100.0).abs() < 1e-9);

        assert_eq!(settled_battery(&[3.3, 3.3, 3.3]).midpoint(), None);
        let mut partial = settled_battery(&[3.3; 4]);
        partial.cells[1].voltage = None;
        assert_eq!(partial.midpoint(), None);
    }

    #[test]
    fn temperatures_are_clamped_and_averaged() {
        let mut battery = settled_battery(&[]);
        battery.set_temperature(0, 20.0);
        battery.set_temperature(1, 150.0);
        assert_eq!(battery.temperatures[1], Some(100.0));
        assert_eq!(battery.temperature(), Some(60.0));
        assert_eq!(battery.min_temperature(), Some(20.0));
    }

    #[test]
    fn time_to_soc_uses_rolling_average() {
        let mut battery = settled_battery(&[]);
        battery.capacity = Some(100.0);
        battery.soc = Some(50.0);
        for current in [8.0, 12.0] {
            battery.current = Some(current);
            battery.record_current_sample();
        }
        // 10 A into 100 Ah is 10 %/h, 50 % to go
        let eta = battery.time_to_soc(100.0).unwrap();
        assert!((eta.as_secs_f64() - 5.0 * 3600.0).abs() < 0.01);
        assert_eq!(battery.time_to_soc(20.0), None);
    }

    #[test]
    fn current_window_is_bounded() {
        let mut battery = Battery::new("test");
        battery.current = Some(1.0);
        for _ in 0..CURRENT_AVERAGE_WINDOW {
            battery.record_current_sample();
        }
        battery.current = Some(301.0);
        battery.record_current_sample();
        assert_eq!(battery.current_average(), Some((299.0 + 301.0) / 300.0));
    }

    #[test]
    fn paired_bits_decode_three_levels() {
        static TABLE: BitTable = BitTable {
            width: 8,
            order: BitOrder::Lsb0,
            rows: &[AlarmBits { condition: Condition::VoltageLow, alarm: &[3], warning: &[2] }],
        };
        let mut protection = Protection::default();
        for (value, expected) in
            [(0b1000, Severity::Alarm), (0b1100, Severity::Alarm), (0b0100, Severity::Warning), (0b0011, Severity::Ok)]
        {
            TABLE.decode(value, &mut protection);
            assert_eq!(protection.voltage_low, expected, "{value:#06b}");
        }
    }

    #[test]
    fn bit_table_merges_shared_conditions() {
        static TABLE: BitTable = BitTable {
            width: 16,
            order: BitOrder::Lsb0,
            rows: &[
                AlarmBits { condition: Condition::CurrentOver, alarm: &[6], warning: &[] },
                AlarmBits { condition: Condition::CurrentOver, alarm: &[13], warning: &[] },
                AlarmBits { condition: Condition::SocLow, alarm: &[1], warning: &[0] },
            ],
        };
        let mut protection = Protection::default();
        TABLE.decode(1 << 13 | 1, &mut protection);
        assert_eq!(protection.current_over, Severity::Alarm);
        assert_eq!(protection.soc_low, Severity::Warning);

        TABLE.decode(0, &mut protection);
        assert_eq!(protection.current_over, Severity::Ok);
        assert_eq!(protection.worst(), Severity::Ok);
    }

    #[test]
    fn msb_first_table() {
        static TABLE: BitTable = BitTable {
            width: 8,
            order: BitOrder::Msb0,
            rows: &[AlarmBits { condition: Condition::VoltageHigh, alarm: &[0], warning: &[1] }],
        };
        let mut protection = Protection::default();
        TABLE.decode(0x80, &mut protection);
        assert_eq!(protection.get(Condition::VoltageHigh), Severity::Alarm);
        TABLE.decode(0x40, &mut protection);
        assert_eq!(protection.voltage_high, Severity::Warning);
    }

    #[test]
    fn unpack_flags_lsb_first() {
        let flags = unpack_flags(&[0b0000_0101, 0b1000_0000], 16, BitOrder::Lsb0);
        assert!(flags[0] && !flags[1] && flags[2] && flags[15]);
        assert_eq!(flags.iter().filter(|f| **f).count(), 3);
    }
}
