//! Daly Smart BMS over UART/RS485.
//!
//! Every request and every answer is a 13 byte frame:
//!
//! Offset | Size | Meaning
//! 0      | 1    | Start flag 0xA5
//! 1      | 1    | Address: 0x40 (UART) or 0x80 (RS485) on requests, 0x01 on answers
//! 2      | 1    | Command
//! 3      | 1    | Data length, always 8
//! 4      | 8    | Data
//! 12     | 1    | Low byte of the sum of bytes 0..12
//!
//! Cell voltages come back as `ceil(cells / 3)` such frames back to back, each carrying a
//! 1-based frame number and three cell voltages.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{check_range, sum8, transact, Payload, Protocol};
use crate::battery_state::{unpack_flags, AlarmBits, Battery, BitOrder, BitTable, Condition};
use crate::bms::Bms;
use crate::config::{BatteryConfig, Config, SubFramePolicy};
use crate::error::{Error, Result, ValidationError};
use crate::transport::{FrameReader, FrameSpec, LengthWidth, SharedTransport};

pub const ADDRESS_UART: u8 = 0x40;
pub const ADDRESS_RS485: u8 = 0x80;

pub const CMD_RATED_PARAMS: u8 = 0x50;
pub const CMD_BATTERY_DETAILS: u8 = 0x53;
pub const CMD_SOC: u8 = 0x90;
pub const CMD_CELL_RANGE: u8 = 0x91;
pub const CMD_TEMPERATURE_RANGE: u8 = 0x92;
pub const CMD_FET: u8 = 0x93;
pub const CMD_STATUS: u8 = 0x94;
pub const CMD_CELL_VOLTAGES: u8 = 0x95;
pub const CMD_CELL_BALANCE: u8 = 0x97;
pub const CMD_ALARM: u8 = 0x98;

const START: u8 = 0xa5;
const REPLY_ADDRESS: u8 = 0x01;
const DATA_LEN: u8 = 8;
const FRAME_LEN: usize = 13;
const CELLS_PER_FRAME: usize = 3;
const CURRENT_ZERO: f64 = 30000.0;
const TEMPERATURE_ZERO: f64 = 40.0;
const POLL_INTERVAL: Duration = Duration::from_millis(1000);

pub const FRAME: FrameSpec = FrameSpec::length_prefixed(3, LengthWidth::One, 1);

static VOLTAGE_ALARMS: BitTable = BitTable {
    width: 8,
    order: BitOrder::Lsb0,
    rows: &[
        AlarmBits { condition: Condition::VoltageHigh, alarm: &[4, 5], warning: &[0, 1, 2, 3] },
        AlarmBits { condition: Condition::VoltageLow, alarm: &[7], warning: &[6] },
    ],
};

static TEMPERATURE_ALARMS: BitTable = BitTable {
    width: 8,
    order: BitOrder::Lsb0,
    rows: &[
        AlarmBits { condition: Condition::TempHighCharge, alarm: &[1], warning: &[0] },
        AlarmBits { condition: Condition::TempLowCharge, alarm: &[3], warning: &[2] },
        AlarmBits { condition: Condition::TempHighDischarge, alarm: &[5], warning: &[4] },
        AlarmBits { condition: Condition::TempLowDischarge, alarm: &[7], warning: &[6] },
    ],
};

// charge and discharge over-current share one condition
static CURRENT_SOC_ALARMS: BitTable = BitTable {
    width: 8,
    order: BitOrder::Lsb0,
    rows: &[
        AlarmBits { condition: Condition::CurrentOver, alarm: &[1, 3], warning: &[0, 2] },
        AlarmBits { condition: Condition::SocLow, alarm: &[7], warning: &[6] },
    ],
};

/// Build a 13 byte frame. Used for requests and by simulators for answers.
pub fn encode_frame(address: u8, command: u8, data: [u8; 8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_LEN);
    frame.extend_from_slice(&[START, address, command, DATA_LEN]);
    frame.extend_from_slice(&data);
    frame.push(sum8(&frame));
    frame
}

/// One cell-voltage sub-frame as the BMS sends it.
pub fn encode_cell_frame(frame_number: u8, millivolts: [u16; 3]) -> Vec<u8> {
    let mut data = [0u8; 8];
    data[0] = frame_number;
    for (k, mv) in millivolts.iter().enumerate() {
        data[1 + 2 * k..3 + 2 * k].copy_from_slice(&mv.to_be_bytes());
    }
    encode_frame(REPLY_ADDRESS, CMD_CELL_VOLTAGES, data)
}

/// Size of the concatenated cell-voltage answer for `cells` cells.
pub fn cell_voltages_len(cells: usize) -> usize {
    cells.div_ceil(CELLS_PER_FRAME) * FRAME_LEN
}

#[derive(Debug, Clone)]
pub struct Daly {
    address: u8,
    limits: BatteryConfig,
    sub_frame_policy: SubFramePolicy,
}

impl Daly {
    pub fn new(address: u8, limits: BatteryConfig, sub_frame_policy: SubFramePolicy) -> Self {
        Self { address, limits, sub_frame_policy }
    }

    /// Some firmwares answer from 0x01, others echo the request address.
    fn answers_from(&self, address: u8) -> bool {
        address == REPLY_ADDRESS || address == self.address
    }

    fn decode_soc(&self, p: Payload, battery: &mut Battery) -> Result<()> {
        let voltage = p.u16_be(0)? as f64 / 10.0;
        let current = (p.u16_be(4)? as f64 - CURRENT_ZERO) / -10.0;
        let soc = p.u16_be(6)? as f64 / 10.0;

        let window = -2.1 * self.limits.max_discharge_current..=1.3 * self.limits.max_charge_current;
        let current = check_range("current", current, window)?;
        let soc = check_range("soc", soc, 0.0..=100.0)?;

        battery.voltage = Some(voltage);
        battery.current = Some(current);
        battery.soc = Some(soc);
        Ok(())
    }

    fn decode_status(&self, p: Payload, battery: &mut Battery) -> Result<()> {
        let cells = p.u8(0)? as usize;
        let sensors = p.u8(1)? as usize;
        let cycles = p.u16_be(5)?;
        check_range("cell count", cells as f64, 1.0..=48.0)?;

        battery.set_cell_count(cells);
        battery.temp_sensors = Some(sensors);
        battery.cycles = Some(cycles as u32);
        battery.max_battery_voltage = Some(self.limits.max_cell_voltage * cells as f64);
        battery.min_battery_voltage = Some(self.limits.min_cell_voltage * cells as f64);
        battery.hardware_version = Some(format!("DalyBMS {cells} cells"));
        Ok(())
    }

    fn decode_cell_range(&self, p: Payload, battery: &mut Battery) -> Result<()> {
        let max = p.u16_be(0)?;
        let max_no = p.u8(2)?;
        let min = p.u16_be(3)?;
        let min_no = p.u8(5)?;
        // cell numbers are 1-based on the wire
        battery.cell_max_voltage = Some(max as f64 / 1000.0);
        battery.cell_max_no = Some(max_no.saturating_sub(1) as usize);
        battery.cell_min_voltage = Some(min as f64 / 1000.0);
        battery.cell_min_no = Some(min_no.saturating_sub(1) as usize);
        Ok(())
    }

    fn decode_temperature_range(&self, p: Payload, battery: &mut Battery) -> Result<()> {
        let max = p.u8(0)? as f64 - TEMPERATURE_ZERO;
        let min = p.u8(2)? as f64 - TEMPERATURE_ZERO;
        battery.set_temperature(0, min);
        battery.set_temperature(1, max);
        Ok(())
    }

    fn decode_fet(&self, p: Payload, battery: &mut Battery) -> Result<()> {
        battery.charge_fet = Some(p.u8(1)? != 0);
        battery.discharge_fet = Some(p.u8(2)? != 0);
        battery.capacity_remain = Some(p.u32_be(4)? as f64 / 1000.0);
        Ok(())
    }

    fn decode_balance(&self, p: Payload, battery: &mut Battery) -> Result<()> {
        let flags = unpack_flags(p.slice(0, 8)?, battery.cells.len(), BitOrder::Lsb0);
        for (cell, balancing) in battery.cells.iter_mut().zip(flags) {
            cell.balance = Some(balancing);
        }
        Ok(())
    }

    fn decode_alarms(&self, p: Payload, battery: &mut Battery) -> Result<()> {
        let (voltage, temperature, current_soc) = (p.u8(0)?, p.u8(1)?, p.u8(2)?);
        VOLTAGE_ALARMS.decode(voltage as u32, &mut battery.protection);
        TEMPERATURE_ALARMS.decode(temperature as u32, &mut battery.protection);
        CURRENT_SOC_ALARMS.decode(current_soc as u32, &mut battery.protection);
        Ok(())
    }

    fn decode_rated_params(&self, p: Payload, battery: &mut Battery) -> Result<()> {
        battery.capacity = Some(p.u32_be(0)? as f64 / 1000.0);
        Ok(())
    }

    fn decode_battery_details(&self, p: Payload, battery: &mut Battery) -> Result<()> {
        let (year, month, day) = (p.u8(2)? as u32 + 2000, p.u8(3)?, p.u8(4)?);
        battery.production = Some(format!("{year}{month:02}{day:02}"));
        Ok(())
    }

    /// Place each sub-frame's cells at `(frame_number - 1) * 3 + k`, whatever order the
    /// sub-frames arrived in. Bytes that do not start a sub-frame are skipped one at a time.
    fn decode_cell_voltages(&self, data: &[u8], battery: &mut Battery) -> Result<()> {
        let Some(count) = battery.cell_count else {
            debug!("cell voltages received before the cell count is known");
            return Ok(());
        };
        let lowest_plausible = self.limits.min_cell_voltage / 2.0;
        let mut updates: Vec<Option<Option<f64>>> = vec![None; count];
        let mut skipped = 0;

        let mut idx = 0;
        while idx + FRAME_LEN <= data.len() {
            let sub = &data[idx..idx + FRAME_LEN];
            let is_header = sub[0] == START
                && self.answers_from(sub[1])
                && sub[2] == CMD_CELL_VOLTAGES
                && sub[3] == DATA_LEN;
            if !is_header {
                idx += 1;
                skipped += 1;
                continue;
            }
            idx += FRAME_LEN;

            let calculated = sum8(&sub[..12]);
            if calculated != sub[12] {
                let err = ValidationError::Checksum { calculated: calculated as u32, received: sub[12] as u32 };
                match self.sub_frame_policy {
                    SubFramePolicy::Strict => return Err(err.into()),
                    SubFramePolicy::KeepStale => {
                        warn!("cell voltage frame {} dropped: {err}", sub[4]);
                        continue;
                    }
                }
            }

            let frame_number = sub[4] as usize;
            if frame_number == 0 {
                continue;
            }
            for k in 0..CELLS_PER_FRAME {
                let cell = (frame_number - 1) * CELLS_PER_FRAME + k;
                if cell >= count {
                    break;
                }
                let volts = u16::from_be_bytes([sub[5 + 2 * k], sub[6 + 2 * k]]) as f64 / 1000.0;
                updates[cell] = Some((volts >= lowest_plausible).then_some(volts));
            }
        }
        if skipped > 0 {
            debug!("skipped {skipped} bytes while resynchronizing cell voltage frames");
        }

        for (cell, update) in battery.cells.iter_mut().zip(updates) {
            if let Some(voltage) = update {
                cell.voltage = voltage;
            }
        }
        Ok(())
    }
}

impl Protocol for Daly {
    fn build_request(&self, command: u8) -> Vec<u8> {
        encode_frame(self.address, command, [0; 8])
    }

    fn validate_and_strip(&self, command: u8, frame: &[u8]) -> std::result::Result<Vec<u8>, ValidationError> {
        let start = frame.iter().position(|b| *b == START).ok_or(ValidationError::Marker)?;
        let frame = &frame[start..];
        if command == CMD_CELL_VOLTAGES {
            // sub-frames are checked one by one while decoding
            return Ok(frame.to_vec());
        }
        if frame.len() < FRAME_LEN {
            return Err(ValidationError::Length { expected: FRAME_LEN, actual: frame.len() });
        }
        if frame[3] != DATA_LEN {
            return Err(ValidationError::Length { expected: DATA_LEN as usize, actual: frame[3] as usize });
        }
        let calculated = sum8(&frame[..12]);
        if calculated != frame[12] {
            return Err(ValidationError::Checksum { calculated: calculated as u32, received: frame[12] as u32 });
        }
        if !self.answers_from(frame[1]) {
            return Err(ValidationError::Address { expected: REPLY_ADDRESS, actual: frame[1] });
        }
        if frame[2] != command {
            return Err(ValidationError::Command { expected: command, actual: frame[2] });
        }
        Ok(frame[4..12].to_vec())
    }

    fn decode_payload(&self, command: u8, payload: &[u8], battery: &mut Battery) -> Result<()> {
        let p = Payload::new(payload);
        match command {
            CMD_SOC => self.decode_soc(p, battery),
            CMD_STATUS => self.decode_status(p, battery),
            CMD_CELL_RANGE => self.decode_cell_range(p, battery),
            CMD_TEMPERATURE_RANGE => self.decode_temperature_range(p, battery),
            CMD_FET => self.decode_fet(p, battery),
            CMD_CELL_VOLTAGES => self.decode_cell_voltages(payload, battery),
            CMD_CELL_BALANCE => self.decode_balance(p, battery),
            CMD_ALARM => self.decode_alarms(p, battery),
            CMD_RATED_PARAMS => self.decode_rated_params(p, battery),
            CMD_BATTERY_DETAILS => self.decode_battery_details(p, battery),
            other => Err(ValidationError::Command { expected: CMD_SOC, actual: other }.into()),
        }
    }
}

/// Polls a Daly BMS, spreading the slow reads over two polls.
pub struct DalyBms {
    reader: FrameReader,
    codec: Daly,
    capacity_override: Option<f64>,
    poll_step: u8,
}

impl DalyBms {
    pub fn new(transport: SharedTransport, address: u8, config: &Config) -> Self {
        Self {
            reader: FrameReader::new(transport, &config.transport),
            codec: Daly::new(address, config.battery.clone(), config.sub_frame_policy),
            capacity_override: config.battery.capacity_ah,
            poll_step: 0,
        }
    }

    async fn read(&self, command: u8, spec: FrameSpec, battery: &mut Battery) -> Result<()> {
        // Daly occasionally ignores a request, so a timeout is retried once right away
        let payload = transact(&self.reader, &self.codec, command, spec, true).await?;
        self.codec.decode_payload(command, &payload, battery)
    }

    /// SoC and current, with a second attempt when the current looks implausible.
    async fn read_soc(&self, battery: &mut Battery) -> Result<()> {
        match self.read(CMD_SOC, FRAME, battery).await {
            Err(err @ Error::DecodeRange { .. }) => {
                warn!("discarding SoC reading: {err}, trying once more");
                self.read(CMD_SOC, FRAME, battery).await
            }
            other => other,
        }
    }

    async fn read_cell_voltages(&self, battery: &mut Battery) -> Result<()> {
        let Some(cells) = battery.cell_count else {
            return Ok(());
        };
        let spec = FrameSpec::Fixed(cell_voltages_len(cells));
        self.read(CMD_CELL_VOLTAGES, spec, battery).await
    }
}

#[async_trait]
impl Bms for DalyBms {
    fn kind(&self) -> &'static str {
        "Daly"
    }

    fn poll_interval(&self) -> Duration {
        POLL_INTERVAL
    }

    async fn test_connection(&mut self, battery: &mut Battery) -> Result<()> {
        self.reader.open().await?;
        if let Err(err) = self.read(CMD_BATTERY_DETAILS, FRAME, battery).await {
            debug!("no production date: {err}");
        }
        self.read(CMD_STATUS, FRAME, battery).await?;
        self.read_soc(battery).await?;
        battery.bms_type = self.kind().into();
        battery.poll_interval = POLL_INTERVAL;
        info!("found {}", battery.hardware_version.as_deref().unwrap_or("Daly BMS"));
        Ok(())
    }

    async fn get_settings(&mut self, battery: &mut Battery) -> Result<()> {
        if let Err(err) = self.read(CMD_RATED_PARAMS, FRAME, battery).await {
            warn!("could not read rated capacity: {err}");
        }
        if let Some(capacity) = self.capacity_override {
            battery.capacity = Some(capacity);
        }
        battery.unique_id = Some(format!(
            "{}_{}",
            battery.production.as_deref().unwrap_or("unknown"),
            battery.capacity.unwrap_or_default()
        ));
        battery.max_battery_charge_current = Some(self.codec.limits.max_charge_current);
        battery.max_battery_discharge_current = Some(self.codec.limits.max_discharge_current);
        Ok(())
    }

    async fn refresh(&mut self, battery: &mut Battery) -> Result<()> {
        self.read_soc(battery).await?;
        self.read(CMD_FET, FRAME, battery).await?;
        self.read(CMD_CELL_RANGE, FRAME, battery).await?;

        if self.poll_step == 0 {
            self.read(CMD_ALARM, FRAME, battery).await?;
            self.read(CMD_TEMPERATURE_RANGE, FRAME, battery).await?;
            self.poll_step = 1;
        } else {
            self.read_cell_voltages(battery).await?;
            self.read(CMD_CELL_BALANCE, FRAME, battery).await?;
            self.poll_step = 0;
            battery.mark_settled();
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.reader.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battery_state::Severity;
    use crate::transport::memory::MemoryTransport;
    use crate::transport::shared;

    fn codec(policy: SubFramePolicy) -> Daly {
        Daly::new(ADDRESS_UART, BatteryConfig::default(), policy)
    }

    fn battery_with_cells(count: usize) -> Battery {
        let mut battery = Battery::new("/dev/ttyUSB0");
        battery.set_cell_count(count);
        battery
    }

    fn reply(command: u8, data: [u8; 8]) -> Vec<u8> {
        encode_frame(REPLY_ADDRESS, command, data)
    }

    const ALL_COMMANDS: [u8; 9] = [
        CMD_RATED_PARAMS,
        CMD_BATTERY_DETAILS,
        CMD_SOC,
        CMD_CELL_RANGE,
        CMD_TEMPERATURE_RANGE,
        CMD_FET,
        CMD_STATUS,
        CMD_CELL_BALANCE,
        CMD_ALARM,
    ];

    #[test]
    fn request_layout() {
        let request = codec(SubFramePolicy::KeepStale).build_request(CMD_SOC);
        assert_eq!(hex::encode(request), "a540900800000000000000007d");
    }

    #[test]
    fn requests_validate() {
        let daly = codec(SubFramePolicy::KeepStale);
        for command in ALL_COMMANDS {
            let request = daly.build_request(command);
            assert_eq!(daly.validate_and_strip(command, &request).unwrap(), vec![0; 8]);
        }
    }

    #[test]
    fn any_flipped_byte_is_rejected() {
        let daly = codec(SubFramePolicy::KeepStale);
        let frame = hex::decode("a5019008021c0000753002eef1").unwrap();
        assert!(daly.validate_and_strip(CMD_SOC, &frame).is_ok());
        for i in 0..12 {
            let mut corrupted = frame.clone();
            corrupted[i] ^= 0x10;
            assert!(daly.validate_and_strip(CMD_SOC, &corrupted).is_err(), "byte {i}");
        }
    }

    #[test]
    fn resynchronizes_on_start_flag() {
        let daly = codec(SubFramePolicy::KeepStale);
        let mut frame = vec![0x00, 0x13];
        frame.extend(reply(CMD_SOC, [0x02, 0x1c, 0, 0, 0x75, 0x30, 0x02, 0xee]));
        assert_eq!(daly.validate_and_strip(CMD_SOC, &frame).unwrap()[0], 0x02);
    }

    #[test]
    fn wrong_echo_and_address() {
        let daly = codec(SubFramePolicy::KeepStale);
        let frame = reply(CMD_FET, [0; 8]);
        assert_eq!(
            daly.validate_and_strip(CMD_SOC, &frame),
            Err(ValidationError::Command { expected: CMD_SOC, actual: CMD_FET })
        );
        let frame = encode_frame(0x80, CMD_SOC, [0; 8]);
        assert!(matches!(daly.validate_and_strip(CMD_SOC, &frame), Err(ValidationError::Address { .. })));
    }

    #[test]
    fn decodes_soc() {
        let daly = codec(SubFramePolicy::KeepStale);
        let frame = hex::decode("a5019008021c0000753002eef1").unwrap();
        let payload = daly.validate_and_strip(CMD_SOC, &frame).unwrap();
        let mut battery = Battery::new("test");
        daly.decode_payload(CMD_SOC, &payload, &mut battery).unwrap();
        assert_eq!(battery.voltage, Some(54.0));
        assert_eq!(battery.current, Some(0.0));
        assert_eq!(battery.soc, Some(75.0));

        // 29900 raw is 10 A
        daly.decode_payload(CMD_SOC, &[0x02, 0x1c, 0, 0, 0x74, 0xcc, 0x02, 0xee], &mut battery).unwrap();
        assert_eq!(battery.current, Some(10.0));
    }

    #[test]
    fn implausible_current_is_rejected_without_side_effects() {
        let daly = codec(SubFramePolicy::KeepStale);
        let mut battery = Battery::new("test");
        // raw 0 would be 3000 A
        let err = daly.decode_payload(CMD_SOC, &[0x02, 0x1c, 0, 0, 0, 0, 0x02, 0xee], &mut battery).unwrap_err();
        assert!(matches!(err, Error::DecodeRange { field: "current", .. }));
        assert_eq!(battery.voltage, None);
    }

    #[test]
    fn decode_is_idempotent() {
        let daly = codec(SubFramePolicy::KeepStale);
        let payload = [0x10, 0x02, 0x01, 0x00, 0x00, 0x00, 0x2a, 0x00];
        let mut battery = Battery::new("test");
        daly.decode_payload(CMD_STATUS, &payload, &mut battery).unwrap();
        let first = serde_json::to_value(&battery).unwrap();
        daly.decode_payload(CMD_STATUS, &payload, &mut battery).unwrap();
        assert_eq!(serde_json::to_value(&battery).unwrap(), first);
        assert_eq!(battery.cell_count, Some(16));
        assert_eq!(battery.cycles, Some(42));
        assert_eq!(battery.max_battery_voltage, Some(3.45 * 16.0));
    }

    #[test]
    fn reassembles_cells_in_any_order() {
        let daly = codec(SubFramePolicy::KeepStale);
        let mut data = Vec::new();
        data.extend(encode_cell_frame(3, [3307, 3308, 0]));
        data.extend(encode_cell_frame(1, [3301, 3302, 3303]));
        data.extend(encode_cell_frame(2, [3304, 3305, 3306]));
        assert_eq!(data.len(), cell_voltages_len(8));

        let mut battery = battery_with_cells(8);
        let payload = daly.validate_and_strip(CMD_CELL_VOLTAGES, &data).unwrap();
        daly.decode_payload(CMD_CELL_VOLTAGES, &payload, &mut battery).unwrap();

        assert_eq!(battery.cells.len(), 8);
        let voltages: Vec<f64> = battery.cells.iter().map(|c| c.voltage.unwrap()).collect();
        assert_eq!(voltages, vec![3.301, 3.302, 3.303, 3.304, 3.305, 3.306, 3.307, 3.308]);
    }

    #[test]
    fn sub_frames_echoing_request_address() {
        let daly = codec(SubFramePolicy::KeepStale);
        let mut data = Vec::new();
        for (frame_number, mv) in [(1u8, [3301u16, 3302, 3303]), (2, [3304, 3305, 0])] {
            let mut sub = encode_cell_frame(frame_number, mv);
            sub[1] = ADDRESS_UART;
            sub[12] = sum8(&sub[..12]);
            data.extend(sub);
        }
        let mut battery = battery_with_cells(5);
        daly.decode_payload(CMD_CELL_VOLTAGES, &data, &mut battery).unwrap();
        assert_eq!(battery.cells[0].voltage, Some(3.301));
        assert_eq!(battery.cells[4].voltage, Some(3.305));

        let mut foreign = encode_cell_frame(1, [3300, 3300, 3300]);
        foreign[1] = ADDRESS_RS485;
        foreign[12] = sum8(&foreign[..12]);
        let mut battery = battery_with_cells(3);
        daly.decode_payload(CMD_CELL_VOLTAGES, &foreign, &mut battery).unwrap();
        assert_eq!(battery.cells[0].voltage, None);
    }

    #[test]
    fn skips_garbage_between_sub_frames() {
        let daly = codec(SubFramePolicy::KeepStale);
        let mut data = encode_cell_frame(1, [3300, 3300, 3300]);
        data.extend([0xa5, 0x77, 0x00]);
        data.extend(encode_cell_frame(2, [1000, 3300, 3300]));
        let mut battery = battery_with_cells(6);
        daly.decode_payload(CMD_CELL_VOLTAGES, &data, &mut battery).unwrap();
        // 1.0 V is below half the minimum cell voltage
        assert_eq!(battery.cells[3].voltage, None);
        assert_eq!(battery.cells[5].voltage, Some(3.3));
    }

    #[test]
    fn bad_sub_frame_keeps_stale_values() {
        let daly = codec(SubFramePolicy::KeepStale);
        let mut battery = battery_with_cells(6);
        for cell in battery.cells.iter_mut() {
            cell.voltage = Some(3.2);
        }
        let mut data = encode_cell_frame(1, [3300, 3300, 3300]);
        let mut bad = encode_cell_frame(2, [3400, 3400, 3400]);
        bad[12] ^= 0xff;
        data.extend(bad);

        daly.decode_payload(CMD_CELL_VOLTAGES, &data, &mut battery).unwrap();
        assert_eq!(battery.cells[0].voltage, Some(3.3));
        assert_eq!(battery.cells[4].voltage, Some(3.2));
    }

    #[test]
    fn bad_sub_frame_fails_strict_read_untouched() {
        let daly = codec(SubFramePolicy::Strict);
        let mut battery = battery_with_cells(6);
        let mut data = encode_cell_frame(1, [3300, 3300, 3300]);
        let mut bad = encode_cell_frame(2, [3400, 3400, 3400]);
        bad[12] ^= 0xff;
        data.extend(bad);

        let err = daly.decode_payload(CMD_CELL_VOLTAGES, &data, &mut battery).unwrap_err();
        assert!(matches!(err, Error::FrameValidation(ValidationError::Checksum { .. })));
        assert_eq!(battery.cells[0].voltage, None);
    }

    #[test]
    fn balance_bits_are_lsb_first() {
        let daly = codec(SubFramePolicy::KeepStale);
        let mut battery = battery_with_cells(10);
        daly.decode_payload(CMD_CELL_BALANCE, &[0b0000_0010, 0b0000_0001, 0, 0, 0, 0, 0, 0], &mut battery)
            .unwrap();
        let balancing: Vec<usize> =
            battery.cells.iter().enumerate().filter(|(_, c)| c.balance == Some(true)).map(|(i, _)| i).collect();
        assert_eq!(balancing, vec![1, 8]);
    }

    #[test]
    fn alarm_bits() {
        let daly = codec(SubFramePolicy::KeepStale);
        let mut battery = Battery::new("test");
        daly.decode_payload(CMD_ALARM, &[0b0100_0001, 0b0000_0010, 0b1000_0100, 0, 0, 0, 0, 0], &mut battery)
            .unwrap();
        let protection = &battery.protection;
        assert_eq!(protection.voltage_high, Severity::Warning);
        assert_eq!(protection.voltage_low, Severity::Warning);
        assert_eq!(protection.temp_high_charge, Severity::Alarm);
        assert_eq!(protection.current_over, Severity::Warning);
        assert_eq!(protection.soc_low, Severity::Alarm);
        assert_eq!(protection.temp_low_discharge, Severity::Ok);
    }

    #[test]
    fn temperatures_and_details() {
        let daly = codec(SubFramePolicy::KeepStale);
        let mut battery = Battery::new("test");
        daly.decode_payload(CMD_TEMPERATURE_RANGE, &[65, 1, 58, 2, 0, 0, 0, 0], &mut battery).unwrap();
        assert_eq!(battery.temperatures[0], Some(18.0));
        assert_eq!(battery.temperatures[1], Some(25.0));

        daly.decode_payload(CMD_BATTERY_DETAILS, &[0, 0, 22, 3, 9, 0, 0, 0], &mut battery).unwrap();
        assert_eq!(battery.production.as_deref(), Some("20220309"));

        daly.decode_payload(CMD_FET, &[2, 1, 0, 7, 0x00, 0x01, 0x86, 0xa0], &mut battery).unwrap();
        assert_eq!(battery.charge_fet, Some(true));
        assert_eq!(battery.discharge_fet, Some(false));
        assert_eq!(battery.capacity_remain, Some(100.0));
    }

    fn simulator(cells: Vec<u16>) -> impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static {
        move |request| {
            let frames = match request[2] {
                CMD_STATUS => vec![reply(CMD_STATUS, [cells.len() as u8, 2, 1, 0, 0, 0, 10, 0])],
                CMD_SOC => vec![reply(CMD_SOC, [0x02, 0x14, 0, 0, 0x75, 0x30, 0x03, 0x20])],
                CMD_CELL_VOLTAGES => cells
                    .chunks(3)
                    .enumerate()
                    .map(|(i, chunk)| {
                        let mut mv = [0u16; 3];
                        mv[..chunk.len()].copy_from_slice(chunk);
                        encode_cell_frame(i as u8 + 1, mv)
                    })
                    .collect(),
                command => vec![reply(command, [0; 8])],
            };
            // deliver in awkward pieces
            frames.concat().chunks(5).map(<[u8]>::to_vec).collect()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn implausible_current_is_read_again() {
        let mut answers = 0;
        let mut transport = MemoryTransport::with_responder("daly", move |request| {
            if request[2] != CMD_SOC {
                return vec![];
            }
            answers += 1;
            // raw 0 would be 3000 A, 29900 is 10 A
            let current = if answers == 1 { [0x00, 0x00] } else { [0x74, 0xcc] };
            vec![reply(CMD_SOC, [0x02, 0x1c, 0, 0, current[0], current[1], 0x02, 0xee])]
        });
        transport.set_open(true);
        let handle = transport.handle();
        let mut bms = DalyBms::new(shared(transport), ADDRESS_UART, &Config::default());
        let mut battery = Battery::new("memory:daly");

        bms.read_soc(&mut battery).await.unwrap();
        assert_eq!(battery.current, Some(10.0));
        assert_eq!(battery.soc, Some(75.0));
        assert_eq!(handle.written().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_rotates_and_settles() {
        let mut transport = MemoryTransport::with_responder("daly", simulator(vec![3300, 3310, 3320, 3330]));
        transport.set_open(true);
        let handle = transport.handle();
        let config = Config::default();
        let mut bms = DalyBms::new(shared(transport), ADDRESS_UART, &config);
        let mut battery = Battery::new("memory:daly");

        bms.test_connection(&mut battery).await.unwrap();
        assert_eq!(battery.cell_count, Some(4));
        assert_eq!(battery.soc, Some(80.0));

        bms.refresh(&mut battery).await.unwrap();
        assert!(!battery.is_settled());
        bms.refresh(&mut battery).await.unwrap();
        assert!(battery.is_settled());
        assert_eq!(battery.max_cell_voltage(), Some(3.33));

        let commands: Vec<u8> = handle.written().iter().map(|request| request[2]).collect();
        assert!(commands.contains(&CMD_ALARM));
        assert!(commands.contains(&CMD_CELL_VOLTAGES));
    }
}
