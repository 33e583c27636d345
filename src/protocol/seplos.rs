//! Seplos BMS over RS485, a hex-ASCII framed protocol.
//!
//! ```text
//! ~ VER ADR CID1 CID2 LENGTH INFO CHKSUM \r
//! ```
//!
//! Everything between `~` and `\r` is ASCII hex. `LENGTH` packs the number of INFO
//! characters into its low 12 bits and a checksum of that number into the top nibble.
//! `CHKSUM` is the two's complement of the byte sum of everything after `~`. On answers
//! CID2 carries the return code, 0x00 meaning success.

use std::time::Duration;

use async_trait::async_trait;

use super::{check_range, sum16_complement, transact, Payload, Protocol};
use crate::battery_state::{AlarmBits, Battery, BitOrder, BitTable, Condition};
use crate::bms::Bms;
use crate::config::{BatteryConfig, Config};
use crate::error::{Result, ValidationError};
use crate::transport::{FrameReader, FrameSpec, SharedTransport};

pub const DEFAULT_ADDRESS: u8 = 0x00;

pub const CMD_STATUS: u8 = 0x42;
pub const CMD_ALARM: u8 = 0x44;

const VERSION: u8 = 0x20;
const CID1_BATTERY: u8 = 0x46;
const RTN_OK: u8 = 0x00;
const SOI: u8 = b'~';
const EOI: u8 = b'\r';
/// VER ADR CID1 CID2 LENGTH, as hex characters.
const HEADER_CHARS: usize = 12;
const MIN_FRAME: usize = 18;
/// The pack queried inside a multi-pack group.
const PACK: u8 = 0x01;
const KELVIN_OFFSET: f64 = 2731.0;
const POLL_INTERVAL: Duration = Duration::from_millis(5000);

const AMBIENT_SLOT: usize = 2;

pub const FRAME: FrameSpec = FrameSpec::Terminated(EOI);

static CELL_VOLTAGE_ALARMS: BitTable = BitTable {
    width: 8,
    order: BitOrder::Lsb0,
    rows: &[
        AlarmBits { condition: Condition::CellVoltageHigh, alarm: &[1], warning: &[0] },
        AlarmBits { condition: Condition::CellVoltageLow, alarm: &[3], warning: &[2] },
        AlarmBits { condition: Condition::VoltageHigh, alarm: &[5], warning: &[4] },
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

static CURRENT_ALARMS: BitTable = BitTable {
    width: 8,
    order: BitOrder::Lsb0,
    rows: &[
        AlarmBits { condition: Condition::CurrentOver, alarm: &[1], warning: &[0] },
        AlarmBits { condition: Condition::CurrentUnder, alarm: &[3], warning: &[2] },
    ],
};

static SOC_ALARMS: BitTable = BitTable {
    width: 8,
    order: BitOrder::Lsb0,
    rows: &[AlarmBits { condition: Condition::SocLow, alarm: &[3], warning: &[2] }],
};

/// `LENGTH` field for `info_chars` hex characters of INFO.
pub fn length_field(info_chars: usize) -> u16 {
    let len = (info_chars & 0x0fff) as u16;
    if len == 0 {
        return 0;
    }
    let nibbles = (len & 0xf) + (len >> 4 & 0xf) + (len >> 8 & 0xf);
    let check = ((nibbles % 16) ^ 0xf) + 1;
    (check & 0xf) << 12 | len
}

/// Encode a complete frame. `cid2` is the command on requests and the return code on
/// answers.
pub fn encode_frame(address: u8, cid2: u8, info: &[u8]) -> Vec<u8> {
    let info = hex::encode_upper(info);
    let body = format!(
        "{VERSION:02X}{address:02X}{CID1_BATTERY:02X}{cid2:02X}{:04X}{info}",
        length_field(info.len())
    );
    let checksum = sum16_complement(body.as_bytes());
    let mut frame = Vec::with_capacity(body.len() + 6);
    frame.push(SOI);
    frame.extend_from_slice(body.as_bytes());
    frame.extend_from_slice(format!("{checksum:04X}").as_bytes());
    frame.push(EOI);
    frame
}

fn hex_u16(chars: &[u8]) -> std::result::Result<u16, ValidationError> {
    let text = std::str::from_utf8(chars).map_err(|_| ValidationError::Hex)?;
    u16::from_str_radix(text, 16).map_err(|_| ValidationError::Hex)
}

fn kelvin_to_celsius(raw: u16) -> f64 {
    (raw as f64 - KELVIN_OFFSET) / 10.0
}

#[derive(Debug, Clone)]
pub struct Seplos {
    address: u8,
}

impl Seplos {
    pub fn new(address: u8) -> Self {
        Self { address }
    }

    /// Status layout: flag, group, cell count, cell voltages, sensor count, temperatures,
    /// then current, voltage, remaining capacity, custom byte, capacity, SoC, rated
    /// capacity and cycles.
    fn decode_status(&self, p: Payload, battery: &mut Battery) -> Result<()> {
        let cells = p.u8(2)? as usize;
        check_range("cell count", cells as f64, 1.0..=32.0)?;
        let voltages = (0..cells)
            .map(|i| Ok(p.u16_be(3 + 2 * i)? as f64 / 1000.0))
            .collect::<std::result::Result<Vec<_>, ValidationError>>()?;

        let sensors_at = 3 + 2 * cells;
        let sensors = p.u8(sensors_at)? as usize;
        let temperatures = (0..sensors)
            .map(|i| Ok(kelvin_to_celsius(p.u16_be(sensors_at + 1 + 2 * i)?)))
            .collect::<std::result::Result<Vec<_>, ValidationError>>()?;

        let base = sensors_at + 1 + 2 * sensors;
        let current = p.i16_be(base)? as f64 / 100.0;
        let voltage = p.u16_be(base + 2)? as f64 / 100.0;
        let remain = p.u16_be(base + 4)? as f64 / 100.0;
        let capacity = p.u16_be(base + 7)? as f64 / 100.0;
        let soc = check_range("soc", p.u16_be(base + 9)? as f64 / 10.0, 0.0..=100.0)?;
        let cycles = p.u16_be(base + 13)?;

        battery.set_cell_count(cells);
        for (cell, voltage) in battery.cells.iter_mut().zip(voltages) {
            cell.voltage = Some(voltage);
        }
        // the last two sensors are ambient and power stage, the rest sit on cells
        let cell_sensors = sensors.saturating_sub(2);
        let on_cells = &temperatures[..cell_sensors];
        for (i, celsius) in on_cells.iter().enumerate() {
            if let Some(cell) = battery.cell_mut(i) {
                cell.temperature = Some(*celsius);
            }
        }
        // pack slots: coldest cell, hottest cell, ambient
        if let Some(coldest) = on_cells.iter().copied().reduce(f64::min) {
            battery.set_temperature(0, coldest);
        }
        if let Some(hottest) = on_cells.iter().copied().reduce(f64::max) {
            battery.set_temperature(1, hottest);
        }
        if sensors >= 2 {
            battery.set_temperature(AMBIENT_SLOT, temperatures[sensors - 2]);
            battery.set_temp_mos(temperatures[sensors - 1]);
        }
        battery.temp_sensors = Some(cell_sensors);

        battery.current = Some(current);
        battery.voltage = Some(voltage);
        battery.capacity_remain = Some(remain);
        battery.capacity = Some(capacity);
        battery.soc = Some(soc);
        battery.cycles = Some(cycles as u32);
        battery.hardware_version = Some(format!("Seplos BMS {cells} cells"));
        Ok(())
    }

    fn decode_alarms(&self, p: Payload, battery: &mut Battery) -> Result<()> {
        let voltage = p.u8(30)?;
        let temperature = p.u8(31)?;
        let current = p.u8(33)?;
        let soc = p.u8(34)?;
        let switches = p.u8(35)?;

        let protection = &mut battery.protection;
        CELL_VOLTAGE_ALARMS.decode(voltage as u32, protection);
        TEMPERATURE_ALARMS.decode(temperature as u32, protection);
        CURRENT_ALARMS.decode(current as u32, protection);
        SOC_ALARMS.decode(soc as u32, protection);
        battery.discharge_fet = Some(switches & 0b01 != 0);
        battery.charge_fet = Some(switches & 0b10 != 0);
        Ok(())
    }
}

impl Protocol for Seplos {
    fn build_request(&self, command: u8) -> Vec<u8> {
        encode_frame(self.address, command, &[PACK])
    }

    fn validate_and_strip(&self, command: u8, frame: &[u8]) -> std::result::Result<Vec<u8>, ValidationError> {
        if frame.len() < MIN_FRAME {
            return Err(ValidationError::Length { expected: MIN_FRAME, actual: frame.len() });
        }
        if frame[0] != SOI || frame[frame.len() - 1] != EOI {
            return Err(ValidationError::Marker);
        }
        let body = &frame[1..frame.len() - 5];
        let received = hex_u16(&frame[frame.len() - 5..frame.len() - 1])?;
        let calculated = sum16_complement(body);
        if calculated != received {
            return Err(ValidationError::Checksum { calculated: calculated as u32, received: received as u32 });
        }

        let header = hex::decode(&body[..HEADER_CHARS]).map_err(|_| ValidationError::Hex)?;
        let (address, cid1, cid2) = (header[1], header[2], header[3]);
        let length = u16::from_be_bytes([header[4], header[5]]);
        if address != self.address {
            return Err(ValidationError::Address { expected: self.address, actual: address });
        }
        if cid1 != CID1_BATTERY {
            return Err(ValidationError::Command { expected: CID1_BATTERY, actual: cid1 });
        }
        if cid2 != RTN_OK && cid2 != command {
            return Err(ValidationError::ResponseCode(cid2));
        }

        let info = &body[HEADER_CHARS..];
        if (length & 0x0fff) as usize != info.len() {
            return Err(ValidationError::Length { expected: (length & 0x0fff) as usize, actual: info.len() });
        }
        if length != length_field(info.len()) {
            return Err(ValidationError::LengthChecksum(length));
        }
        hex::decode(info).map_err(|_| ValidationError::Hex)
    }

    fn decode_payload(&self, command: u8, payload: &[u8], battery: &mut Battery) -> Result<()> {
        let p = Payload::new(payload);
        match command {
            CMD_STATUS => self.decode_status(p, battery),
            CMD_ALARM => self.decode_alarms(p, battery),
            other => Err(ValidationError::Command { expected: CMD_STATUS, actual: other }.into()),
        }
    }
}

pub struct SeplosBms {
    reader: FrameReader,
    codec: Seplos,
    limits: BatteryConfig,
}

impl SeplosBms {
    pub fn new(transport: SharedTransport, address: u8, config: &Config) -> Self {
        Self {
            reader: FrameReader::new(transport, &config.transport),
            codec: Seplos::new(address),
            limits: config.battery.clone(),
        }
    }

    async fn read(&self, command: u8, battery: &mut Battery) -> Result<()> {
        let payload = transact(&self.reader, &self.codec, command, FRAME, false).await?;
        self.codec.decode_payload(command, &payload, battery)
    }
}

#[async_trait]
impl Bms for SeplosBms {
    fn kind(&self) -> &'static str {
        "Seplos"
    }

    fn poll_interval(&self) -> Duration {
        POLL_INTERVAL
    }

    async fn test_connection(&mut self, battery: &mut Battery) -> Result<()> {
        self.reader.open().await?;
        self.read(CMD_STATUS, battery).await?;
        battery.bms_type = self.kind().into();
        battery.poll_interval = POLL_INTERVAL;
        Ok(())
    }

    async fn get_settings(&mut self, battery: &mut Battery) -> Result<()> {
        // the BMS does not report its current limits
        battery.max_battery_charge_current = Some(self.limits.max_charge_current);
        battery.max_battery_discharge_current = Some(self.limits.max_discharge_current);
        if let Some(cells) = battery.cell_count {
            battery.max_battery_voltage = Some(self.limits.max_cell_voltage * cells as f64);
            battery.min_battery_voltage = Some(self.limits.min_cell_voltage * cells as f64);
        }
        if let Some(capacity) = self.limits.capacity_ah {
            battery.capacity = Some(capacity);
        }
        Ok(())
    }

    async fn refresh(&mut self, battery: &mut Battery) -> Result<()> {
        self.read(CMD_STATUS, battery).await?;
        if let Some(capacity) = self.limits.capacity_ah {
            battery.capacity = Some(capacity);
        }
        self.read(CMD_ALARM, battery).await?;
        battery.mark_settled();
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

    /// Status INFO for a 4 cell pack with 6 sensors.
    fn status_info() -> Vec<u8> {
        let mut info = vec![0x00, 0x01, 4];
        for mv in [3301u16, 3302, 3303, 3304] {
            info.extend(mv.to_be_bytes());
        }
        info.push(6);
        // 25.0, 26.0, 24.0 and 25.5 °C cells, 20.0 °C ambient, 35.0 °C power stage
        for raw in [2981u16, 2991, 2971, 2986, 2931, 3081] {
            info.extend(raw.to_be_bytes());
        }
        info.extend((-1234i16).to_be_bytes());
        info.extend(5320u16.to_be_bytes());
        info.extend(15000u16.to_be_bytes());
        info.push(0x0a);
        info.extend(28000u16.to_be_bytes());
        info.extend(536u16.to_be_bytes());
        info.extend(28000u16.to_be_bytes());
        info.extend(77u16.to_be_bytes());
        info
    }

    #[test]
    fn length_checksum_nibble() {
        assert_eq!(length_field(0), 0x0000);
        assert_eq!(length_field(2), 0xe002);
        // 0x012: 1 + 2 = 3, !3 & 0xf = 0xc, + 1
        assert_eq!(length_field(0x12), 0xd012);
    }

    #[test]
    fn request_layout() {
        let request = Seplos::new(0).build_request(CMD_STATUS);
        assert_eq!(request, b"~20004642E00201FD36\r");
    }

    #[test]
    fn requests_validate() {
        let seplos = Seplos::new(DEFAULT_ADDRESS);
        for command in [CMD_STATUS, CMD_ALARM] {
            let request = seplos.build_request(command);
            assert_eq!(seplos.validate_and_strip(command, &request).unwrap(), vec![PACK]);
        }
    }

    #[test]
    fn any_flipped_character_is_rejected() {
        let seplos = Seplos::new(DEFAULT_ADDRESS);
        let frame = encode_frame(DEFAULT_ADDRESS, RTN_OK, &status_info());
        assert!(seplos.validate_and_strip(CMD_STATUS, &frame).is_ok());
        for i in 0..frame.len() - 5 {
            let mut corrupted = frame.clone();
            corrupted[i] ^= 0x01;
            assert!(seplos.validate_and_strip(CMD_STATUS, &corrupted).is_err(), "char {i}");
        }
        let mut corrupted = frame.clone();
        *corrupted.last_mut().unwrap() = b'\n';
        assert_eq!(seplos.validate_and_strip(CMD_STATUS, &corrupted), Err(ValidationError::Marker));
    }

    #[test]
    fn length_nibble_is_checked_independently() {
        let seplos = Seplos::new(DEFAULT_ADDRESS);
        // valid frame checksum, wrong length nibble
        let body = b"20004600F0020A";
        let checksum = sum16_complement(body);
        let mut frame = vec![SOI];
        frame.extend_from_slice(body);
        frame.extend_from_slice(format!("{checksum:04X}").as_bytes());
        frame.push(EOI);
        assert_eq!(seplos.validate_and_strip(CMD_STATUS, &frame), Err(ValidationError::LengthChecksum(0xf002)));
    }

    #[test]
    fn error_return_code_and_address() {
        let seplos = Seplos::new(DEFAULT_ADDRESS);
        let frame = encode_frame(DEFAULT_ADDRESS, 0x04, &[]);
        assert_eq!(seplos.validate_and_strip(CMD_STATUS, &frame), Err(ValidationError::ResponseCode(0x04)));
        let frame = encode_frame(0x01, RTN_OK, &[0x00]);
        assert!(matches!(seplos.validate_and_strip(CMD_STATUS, &frame), Err(ValidationError::Address { .. })));
    }

    #[test]
    fn decodes_status() {
        let seplos = Seplos::new(DEFAULT_ADDRESS);
        let frame = encode_frame(DEFAULT_ADDRESS, RTN_OK, &status_info());
        let payload = seplos.validate_and_strip(CMD_STATUS, &frame).unwrap();
        let mut battery = Battery::new("test");
        seplos.decode_payload(CMD_STATUS, &payload, &mut battery).unwrap();

        assert_eq!(battery.cell_count, Some(4));
        assert_eq!(battery.cells[3].voltage, Some(3.304));
        assert_eq!(battery.cells[0].temperature, Some(25.0));
        assert_eq!(battery.cells[1].temperature, Some(26.0));
        assert_eq!(battery.cells[3].temperature, Some(25.5));
        assert_eq!(battery.temperatures, [Some(24.0), Some(26.0), Some(20.0), None]);
        assert_eq!(battery.temp_mos, Some(35.0));
        assert_eq!(battery.current, Some(-12.34));
        assert_eq!(battery.voltage, Some(53.2));
        assert_eq!(battery.capacity_remain, Some(150.0));
        assert_eq!(battery.capacity, Some(280.0));
        assert_eq!(battery.soc, Some(53.6));
        assert_eq!(battery.cycles, Some(77));

        let first = serde_json::to_value(&battery).unwrap();
        seplos.decode_payload(CMD_STATUS, &payload, &mut battery).unwrap();
        assert_eq!(serde_json::to_value(&battery).unwrap(), first);
    }

    #[test]
    fn truncated_status_is_a_decode_error() {
        let seplos = Seplos::new(DEFAULT_ADDRESS);
        let info = status_info();
        let mut battery = Battery::new("test");
        assert!(seplos.decode_payload(CMD_STATUS, &info[..20], &mut battery).is_err());
        assert_eq!(battery.cell_count, None);
    }

    #[test]
    fn decodes_alarms() {
        let seplos = Seplos::new(DEFAULT_ADDRESS);
        let mut info = vec![0u8; 49];
        info[30] = 0b0000_0110; // cell high alarm + cell low warning
        info[31] = 0b0100_0000; // low discharge temperature warning
        info[33] = 0b0000_0100; // under current warning
        info[34] = 0b0000_1000;
        info[35] = 0b10;
        let mut battery = Battery::new("test");
        seplos.decode_payload(CMD_ALARM, &info, &mut battery).unwrap();
        let protection = &battery.protection;
        assert_eq!(protection.voltage_cell_high, Severity::Alarm);
        assert_eq!(protection.voltage_cell_low, Severity::Warning);
        assert_eq!(protection.voltage_high, Severity::Ok);
        assert_eq!(protection.temp_low_discharge, Severity::Warning);
        assert_eq!(protection.current_under, Severity::Warning);
        assert_eq!(protection.soc_low, Severity::Alarm);
        assert_eq!(battery.charge_fet, Some(true));
        assert_eq!(battery.discharge_fet, Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_over_memory_bus() {
        let mut transport = MemoryTransport::with_responder("seplos", |request| {
            let answer = match &request[7..9] {
                b"42" => encode_frame(DEFAULT_ADDRESS, RTN_OK, &status_info()),
                _ => encode_frame(DEFAULT_ADDRESS, RTN_OK, &[0u8; 49]),
            };
            answer.chunks(16).map(<[u8]>::to_vec).collect()
        });
        transport.set_open(true);
        let config = Config::default();
        let mut bms = SeplosBms::new(shared(transport), DEFAULT_ADDRESS, &config);
        let mut battery = Battery::new("memory:seplos");
        bms.test_connection(&mut battery).await.unwrap();
        bms.get_settings(&mut battery).await.unwrap();
        bms.refresh(&mut battery).await.unwrap();
        assert!(battery.is_settled());
        assert_eq!(battery.poll_interval, Duration::from_secs(5));
        assert_eq!(battery.max_battery_voltage, Some(3.45 * 4.0));
        assert_eq!(battery.min_cell_voltage(), Some(3.301));
    }
}
