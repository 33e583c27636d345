use std::time::Duration;

/// Why a received frame was rejected before any field was decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing or unexpected start marker")]
    Marker,
    #[error("unexpected frame length: expected {expected}, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("checksum mismatch: calculated {calculated:#06x}, received {received:#06x}")]
    Checksum { calculated: u32, received: u32 },
    #[error("length checksum mismatch in length field {0:#06x}")]
    LengthChecksum(u16),
    #[error("address mismatch: expected {expected:#04x}, got {actual:#04x}")]
    Address { expected: u8, actual: u8 },
    #[error("command echo mismatch: expected {expected:#04x}, got {actual:#04x}")]
    Command { expected: u8, actual: u8 },
    #[error("payload is not valid hex ASCII")]
    Hex,
    #[error("device answered with error code {0:#04x}")]
    ResponseCode(u8),
}

/// Every failure the acquisition core can report.
///
/// All variants except [`Error::GaveUp`] and [`Error::Config`] are recoverable: they are
/// logged, counted and retried on the next poll of the affected battery only.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no complete response within {0:?}")]
    TransportTimeout(Duration),
    #[error("invalid frame: {0}")]
    FrameValidation(#[from] ValidationError),
    #[error("{field} out of plausible range: {value}")]
    DecodeRange { field: &'static str, value: f64 },
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("no supported BMS found on {0}")]
    NotFound(String),
    #[error("giving up after {0:?} without a successful poll")]
    GaveUp(Duration),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("settings store error: {0}")]
    Settings(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[cfg(feature = "ble")]
    #[error("bluetooth error: {0}")]
    Ble(#[from] bluest::Error),
}

impl Error {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::GaveUp(_) | Error::Config(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::TransportTimeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
