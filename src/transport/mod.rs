//! Byte transports and the framed request/response reader shared by the serial-style
//! protocols.
//!
//! A [`Transport`] only moves bytes. [`FrameReader`] writes a request, then polls the
//! transport until the response length it predicts from the frame header has arrived, or
//! the bounded read timeout fires. It never interprets checksums; that is the vendor
//! protocol's job.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::TransportConfig;
use crate::error::{Error, Result, ValidationError};

#[cfg(feature = "ble")]
pub mod ble;
pub mod memory;
pub mod serial;

/// A connection to one physical bus or link.
#[async_trait]
pub trait Transport: Send {
    async fn open(&mut self) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
    async fn write(&mut self, data: &[u8]) -> Result<()>;
    /// Return whatever bytes have arrived so far, possibly none. Never blocks for long.
    async fn read_available(&mut self) -> Result<Vec<u8>>;
    /// Discard stale input and pending output.
    async fn flush(&mut self) -> Result<()>;
    fn is_open(&self) -> bool;
    fn name(&self) -> String;
}

/// A transport shared explicitly between the decoders on one bus. Holding the lock
/// serializes round-trips on multi-drop lines.
pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

pub fn shared(transport: impl Transport + 'static) -> SharedTransport {
    Arc::new(Mutex::new(Box::new(transport)))
}

/// Width of a big-endian length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthWidth {
    One,
    Two,
    Four,
}

impl LengthWidth {
    pub fn bytes(self) -> usize {
        match self {
            LengthWidth::One => 1,
            LengthWidth::Two => 2,
            LengthWidth::Four => 4,
        }
    }

    fn read(self, bytes: &[u8]) -> usize {
        bytes.iter().take(self.bytes()).fold(0usize, |acc, b| acc << 8 | *b as usize)
    }
}

/// How the reader decides a response is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSpec {
    /// Total size is `length_position + width + declared + trailer_length`.
    LengthPrefixed {
        length_position: usize,
        length_width: LengthWidth,
        trailer_length: usize,
    },
    /// Constant-size response, e.g. a known number of concatenated sub-frames.
    Fixed(usize),
    /// Response ends with this byte (inclusive).
    Terminated(u8),
}

impl FrameSpec {
    pub const fn length_prefixed(
        length_position: usize,
        length_width: LengthWidth,
        trailer_length: usize,
    ) -> Self {
        FrameSpec::LengthPrefixed { length_position, length_width, trailer_length }
    }

    /// The total response size once enough header bytes are in, `None` before that.
    pub fn expected_len(&self, buffer: &[u8], max_len: usize) -> Result<Option<usize>> {
        let expected = match *self {
            FrameSpec::LengthPrefixed { length_position, length_width, trailer_length } => {
                let header = length_position + length_width.bytes();
                if buffer.len() < header {
                    return Ok(None);
                }
                let declared = length_width.read(&buffer[length_position..header]);
                header + declared + trailer_length
            }
            FrameSpec::Fixed(len) => len,
            FrameSpec::Terminated(terminator) => {
                match buffer.iter().position(|b| *b == terminator) {
                    Some(pos) => pos + 1,
                    None if buffer.len() > max_len => buffer.len(),
                    None => return Ok(None),
                }
            }
        };
        if expected > max_len {
            return Err(ValidationError::Length { expected: max_len, actual: expected }.into());
        }
        Ok(Some(expected))
    }
}

/// Request/response reader over a [`SharedTransport`].
#[derive(Clone)]
pub struct FrameReader {
    transport: SharedTransport,
    timeout: Duration,
    poll_slice: Duration,
    retry_delay: Duration,
    max_frame_len: usize,
}

impl FrameReader {
    pub fn new(transport: SharedTransport, config: &TransportConfig) -> Self {
        Self {
            transport,
            timeout: config.read_timeout(),
            poll_slice: config.poll_slice(),
            retry_delay: config.retry_delay(),
            max_frame_len: config.max_frame_len,
        }
    }

    pub async fn open(&self) -> Result<()> {
        let mut transport = self.transport.lock().await;
        if !transport.is_open() {
            transport.open().await?;
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.transport.lock().await.close().await
    }

    /// Write `command` and read one response framed according to `spec`.
    ///
    /// Fails with [`Error::TransportTimeout`] when the response is not complete within the
    /// read timeout, however many partial reads arrived in the meantime.
    pub async fn read_frame(&self, command: &[u8], spec: FrameSpec) -> Result<Vec<u8>> {
        let mut transport = self.transport.lock().await;
        let name = transport.name();

        transport.flush().await?;
        debug!("{name}: TX {}", hex::encode(command));
        transport.write(command).await?;

        let deadline = Instant::now() + self.timeout;
        let mut buffer = Vec::new();
        loop {
            let chunk = transport.read_available().await?;
            buffer.extend_from_slice(&chunk);

            if let Some(expected) = spec.expected_len(&buffer, self.max_frame_len)? {
                if buffer.len() >= expected {
                    buffer.truncate(expected);
                    debug!("{name}: RX {}", hex::encode(&buffer));
                    return Ok(buffer);
                }
            }

            if Instant::now() >= deadline {
                debug!("{name}: timeout with {} bytes: {}", buffer.len(), hex::encode(&buffer));
                return Err(Error::TransportTimeout(self.timeout));
            }
            tokio::time::sleep(self.poll_slice).await;
        }
    }

    /// [`read_frame`](Self::read_frame), retried once after a short delay on timeout when
    /// `retry_on_timeout` is set. Vendors that occasionally miss a request use this.
    pub async fn exchange(
        &self,
        command: &[u8],
        spec: FrameSpec,
        retry_on_timeout: bool,
    ) -> Result<Vec<u8>> {
        match self.read_frame(command, spec).await {
            Err(err) if err.is_timeout() && retry_on_timeout => {
                debug!("no answer, retrying in {:?}", self.retry_delay);
                tokio::time::sleep(self.retry_delay).await;
                self.read_frame(command, spec).await
            }
            other => other,
        }
    }
}
