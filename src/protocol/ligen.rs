//! LiGen LiFePO4 BMS over Bluetooth Low Energy.
//!
//! Tested with a 400ah 24v battery manufactured by <https://www.li-gen.net/> and sold around the year 2022.
//!
//! The BMS has a BLE interface. On top of that the NordicUART protocol is used for serial communication.
//! On top of that sits a MODBUS-like request-response protocol which has been partially
//! reverse engineered. Two register blocks are read:
//!
//! - `0xD026`, 25 registers: state of charge (%), residual capacity (Ah/100), cycles
//! - `0xD000`, 38 registers: cell voltages (mV, 61001 when the cell is absent), battery voltage (V/100)
//!
//! The response format is:
//!
//! Start Byte | End Byte     | Meaning
//! 0          | 1            | A constant header with value [0x01, 0x03]
//! 2          | 2            | The length in bytes of the payload
//! 3          | x            | The payload, big endian registers
//! x+1        | x+2          | A MODBUS CRC over the bytes 0-x

use std::time::Duration;

use async_trait::async_trait;

use super::{check_range, crc16_modbus, transact, Payload, Protocol};
use crate::battery_state::Battery;
use crate::bms::Bms;
use crate::config::{BatteryConfig, Config};
use crate::error::{Result, ValidationError};
use crate::transport::{FrameReader, FrameSpec, LengthWidth, SharedTransport};

/// Low byte of the register block address; doubles as the command id.
pub const CMD_SOC: u8 = 0x26;
pub const CMD_VOLTAGES: u8 = 0x00;

const HEADER: [u8; 2] = [0x01, 0x03];
const REGISTER_PAGE: u8 = 0xd0;
const REQUEST_LEN: usize = 8;
const SOC_REGISTERS: u8 = 0x19;
const VOLTAGE_REGISTERS: u8 = 0x26;
const MAX_CELLS: usize = 32;
const CELL_VOLTAGE_NA_VALUE: u16 = 61001;
const POLL_INTERVAL: Duration = Duration::from_secs(5);

pub const FRAME: FrameSpec = FrameSpec::length_prefixed(2, LengthWidth::One, 2);

#[derive(Debug, Clone, Default)]
pub struct Ligen;

impl Ligen {
    fn decode_soc(&self, p: Payload, battery: &mut Battery) -> Result<()> {
        let soc = check_range("soc", p.u16_be(2 * 14)? as f64, 0.0..=100.0)?;
        let residual_cah = p.u16_be(2 * 16)?;
        let cycles = p.u16_be(2 * 19)?;

        battery.soc = Some(soc);
        battery.capacity_remain = Some(residual_cah as f64 / 100.0);
        battery.cycles = Some(cycles as u32);
        Ok(())
    }

    fn decode_voltages(&self, p: Payload, battery: &mut Battery) -> Result<()> {
        let cell_voltage_mv = (0..MAX_CELLS)
            .map(|i| p.u16_be(2 * i))
            .collect::<std::result::Result<Vec<_>, ValidationError>>()?;
        let battery_voltage_cv = p.u16_be(2 * 37)?;

        // unpopulated slots past the last cell are dropped, a gap keeps its position
        let count = cell_voltage_mv.iter().rposition(|&mv| mv != CELL_VOLTAGE_NA_VALUE).map_or(0, |last| last + 1);
        battery.set_cell_count(count);
        for (cell, &mv) in battery.cells.iter_mut().zip(&cell_voltage_mv) {
            cell.voltage = (mv != CELL_VOLTAGE_NA_VALUE).then(|| mv as f64 / 1000.0);
        }
        battery.voltage = Some(battery_voltage_cv as f64 / 100.0);
        Ok(())
    }
}

impl Protocol for Ligen {
    fn build_request(&self, command: u8) -> Vec<u8> {
        let registers = match command {
            CMD_SOC => SOC_REGISTERS,
            CMD_VOLTAGES => VOLTAGE_REGISTERS,
            _ => 1,
        };
        let mut frame = vec![HEADER[0], HEADER[1], REGISTER_PAGE, command, 0x00, registers];
        let crc = crc16_modbus(&frame);
        frame.extend_from_slice(&crc);
        frame
    }

    fn validate_and_strip(&self, command: u8, frame: &[u8]) -> std::result::Result<Vec<u8>, ValidationError> {
        if frame.len() < 3 {
            return Err(ValidationError::Length { expected: 3, actual: frame.len() });
        }
        if frame[..2] != HEADER {
            return Err(ValidationError::Marker);
        }

        let is_request = frame.len() == REQUEST_LEN && frame[2] == REGISTER_PAGE;
        let expected_len = if is_request { REQUEST_LEN } else { frame[2] as usize + 5 };
        if frame.len() != expected_len {
            return Err(ValidationError::Length { expected: expected_len, actual: frame.len() });
        }

        let (body, crc) = frame.split_at(expected_len - 2);
        let calculated = crc16_modbus(body);
        if crc != calculated {
            return Err(ValidationError::Checksum {
                calculated: u16::from_le_bytes(calculated) as u32,
                received: u16::from_le_bytes([crc[0], crc[1]]) as u32,
            });
        }

        if is_request {
            if frame[3] != command {
                return Err(ValidationError::Command { expected: command, actual: frame[3] });
            }
            return Ok(frame[4..6].to_vec());
        }
        Ok(body[3..].to_vec())
    }

    fn decode_payload(&self, command: u8, payload: &[u8], battery: &mut Battery) -> Result<()> {
        let p = Payload::new(payload);
        match command {
            CMD_SOC => self.decode_soc(p, battery),
            CMD_VOLTAGES => self.decode_voltages(p, battery),
            other => Err(ValidationError::Command { expected: CMD_SOC, actual: other }.into()),
        }
    }
}

pub struct LigenBms {
    reader: FrameReader,
    codec: Ligen,
    limits: BatteryConfig,
}

impl LigenBms {
    pub fn new(transport: SharedTransport, config: &Config) -> Self {
        Self { reader: FrameReader::new(transport, &config.transport), codec: Ligen, limits: config.battery.clone() }
    }

    async fn read(&self, command: u8, battery: &mut Battery) -> Result<()> {
        // notifications get lost now and then, one retry is cheap compared to a missed poll
        let payload = transact(&self.reader, &self.codec, command, FRAME, true).await?;
        self.codec.decode_payload(command, &payload, battery)
    }
}

#[async_trait]
impl Bms for LigenBms {
    fn kind(&self) -> &'static str {
        "LiGen"
    }

    fn poll_interval(&self) -> Duration {
        POLL_INTERVAL
    }

    async fn test_connection(&mut self, battery: &mut Battery) -> Result<()> {
        self.reader.open().await?;
        self.read(CMD_SOC, battery).await?;
        self.read(CMD_VOLTAGES, battery).await?;
        battery.bms_type = self.kind().into();
        battery.poll_interval = POLL_INTERVAL;
        Ok(())
    }

    async fn get_settings(&mut self, battery: &mut Battery) -> Result<()> {
        battery.max_battery_charge_current = Some(self.limits.max_charge_current);
        battery.max_battery_discharge_current = Some(self.limits.max_discharge_current);
        if let Some(cells) = battery.cell_count {
            battery.max_battery_voltage = Some(self.limits.max_cell_voltage * cells as f64);
            battery.min_battery_voltage = Some(self.limits.min_cell_voltage * cells as f64);
            battery.hardware_version = Some(format!("LiGen {cells} cells"));
        }
        battery.capacity = self.limits.capacity_ah;
        Ok(())
    }

    async fn refresh(&mut self, battery: &mut Battery) -> Result<()> {
        self.read(CMD_SOC, battery).await?;
        self.read(CMD_VOLTAGES, battery).await?;
        battery.mark_settled();
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.reader.close().await
    }
}
