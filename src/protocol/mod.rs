//! Vendor wire protocols.
//!
//! Each vendor module owns an immutable codec implementing [`Protocol`] (frame builder,
//! validator and field mapper) plus the driver that sequences the requests a poll needs.
//! The codec is picked once when the battery is probed and never switched afterwards.

use std::ops::RangeInclusive;

use crc16::{State, MODBUS};

use crate::battery_state::Battery;
use crate::error::{Error, Result, ValidationError};
use crate::transport::{FrameReader, FrameSpec};

pub mod daly;
pub mod jkbms_ble;
pub mod ligen;
pub mod seplos;

/// The capability set every vendor codec provides.
pub trait Protocol: Send + Sync {
    /// Serialize a request for `command`, checksum included.
    fn build_request(&self, command: u8) -> Vec<u8>;

    /// Check markers, length, address/echo and checksum of a raw frame and return the
    /// payload the decoder works on.
    fn validate_and_strip(&self, command: u8, frame: &[u8]) -> std::result::Result<Vec<u8>, ValidationError>;

    /// Map payload fields onto `battery`. A failed decode leaves the fields it
    /// would have written untouched.
    fn decode_payload(&self, command: u8, payload: &[u8], battery: &mut Battery) -> Result<()>;
}

/// One full request/response round trip, validated.
pub async fn transact<P: Protocol>(
    reader: &FrameReader,
    protocol: &P,
    command: u8,
    spec: FrameSpec,
    retry_on_timeout: bool,
) -> Result<Vec<u8>> {
    let request = protocol.build_request(command);
    let frame = reader.exchange(&request, spec, retry_on_timeout).await?;
    Ok(protocol.validate_and_strip(command, &frame)?)
}

/// Low byte of the running byte sum.
pub fn sum8(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Ones-complement-plus-one of the byte sum, modulo 65536.
pub fn sum16_complement(bytes: &[u8]) -> u16 {
    let sum = bytes.iter().fold(0u16, |acc, b| acc.wrapping_add(*b as u16));
    (!sum).wrapping_add(1)
}

/// CRC-16/MODBUS (poly 0xA001, reflected), in wire order (low byte first).
pub fn crc16_modbus(bytes: &[u8]) -> [u8; 2] {
    State::<MODBUS>::calculate(bytes).to_le_bytes()
}

/// Reject a physically implausible value instead of publishing it.
pub fn check_range(field: &'static str, value: f64, range: RangeInclusive<f64>) -> Result<f64> {
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(Error::DecodeRange { field, value })
    }
}

/// Bounds-checked view of a payload. Every accessor fails with
/// [`ValidationError::Length`] instead of panicking on a short frame.
#[derive(Debug, Clone, Copy)]
pub struct Payload<'a> {
    bytes: &'a [u8],
}

impl<'a> Payload<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn slice(&self, offset: usize, len: usize) -> std::result::Result<&'a [u8], ValidationError> {
        let end = offset.saturating_add(len);
        self.bytes
            .get(offset..end)
            .ok_or(ValidationError::Length { expected: end, actual: self.bytes.len() })
    }

    fn array<const N: usize>(&self, offset: usize) -> std::result::Result<[u8; N], ValidationError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.slice(offset, N)?);
        Ok(out)
    }

    pub fn u8(&self, offset: usize) -> std::result::Result<u8, ValidationError> {
        Ok(self.array::<1>(offset)?[0])
    }

    pub fn u16_be(&self, offset: usize) -> std::result::Result<u16, ValidationError> {
        Ok(u16::from_be_bytes(self.array(offset)?))
    }

    pub fn i16_be(&self, offset: usize) -> std::result::Result<i16, ValidationError> {
        Ok(i16::from_be_bytes(self.array(offset)?))
    }

    pub fn u32_be(&self, offset: usize) -> std::result::Result<u32, ValidationError> {
        Ok(u32::from_be_bytes(self.array(offset)?))
    }

    pub fn u16_le(&self, offset: usize) -> std::result::Result<u16, ValidationError> {
        Ok(u16::from_le_bytes(self.array(offset)?))
    }

    pub fn i16_le(&self, offset: usize) -> std::result::Result<i16, ValidationError> {
        Ok(i16::from_le_bytes(self.array(offset)?))
    }

    pub fn u32_le(&self, offset: usize) -> std::result::Result<u32, ValidationError> {
        Ok(u32::from_le_bytes(self.array(offset)?))
    }

    pub fn i32_le(&self, offset: usize) -> std::result::Result<i32, ValidationError> {
        Ok(i32::from_le_bytes(self.array(offset)?))
    }

    /// Fixed-width text field, cut at the first NUL.
    pub fn text(&self, offset: usize, len: usize) -> std::result::Result<String, ValidationError> {
        let raw = self.slice(offset, len)?;
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).trim().to_owned())
    }
}
