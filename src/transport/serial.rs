use std::io::{Read, Write};
use std::time::Duration;

use async_trait::async_trait;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::debug;

use super::Transport;
use crate::error::{Error, Result};

/// Blocking-call guard for the OS port. Reads only ever ask for bytes already buffered.
const PORT_TIMEOUT: Duration = Duration::from_millis(50);

/// 8N1 serial line, e.g. an RS485 or TTL adaptor.
pub struct SerialTransport {
    path: String,
    baud_rate: u32,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self { path: path.into(), baud_rate, port: None }
    }

    /// Run a blocking port call on the blocking pool so a slow adaptor cannot stall the
    /// other batteries. The port is lost if the caller is cancelled mid-call; the next
    /// poll then reopens it.
    async fn with_port<T, F>(&mut self, op: F) -> Result<T>
    where
        F: FnOnce(&mut Box<dyn SerialPort>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut port = self
            .port
            .take()
            .ok_or_else(|| Error::ConnectionLost(format!("{} is not open", self.path)))?;
        let (port, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut port);
            (port, result)
        })
        .await
        .map_err(|err| Error::ConnectionLost(format!("{}: port call failed: {err}", self.path)))?;
        self.port = Some(port);
        result
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> Result<()> {
        let port = serialport::new(&self.path, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(PORT_TIMEOUT)
            .open()?;
        debug!("opened {} at {} baud", self.path, self.baud_rate);
        self.port = Some(port);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.port = None;
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let data = data.to_vec();
        self.with_port(move |port| {
            port.write_all(&data)?;
            port.flush()?;
            Ok(())
        })
        .await
    }

    async fn read_available(&mut self) -> Result<Vec<u8>> {
        self.with_port(|port| {
            let pending = port.bytes_to_read()? as usize;
            if pending == 0 {
                return Ok(Vec::new());
            }
            let mut buffer = vec![0u8; pending];
            let read = port.read(&mut buffer)?;
            buffer.truncate(read);
            Ok(buffer)
        })
        .await
    }

    async fn flush(&mut self) -> Result<()> {
        self.with_port(|port| Ok(port.clear(ClearBuffer::All)?)).await
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn name(&self) -> String {
        self.path.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn port_calls_need_an_open_port() {
        let mut transport = SerialTransport::new("/dev/ttyBMS-missing", 9600);
        assert!(transport.open().await.is_err());
        assert!(!transport.is_open());
        assert!(matches!(transport.write(&[0xa5]).await, Err(Error::ConnectionLost(_))));
        assert!(matches!(transport.read_available().await, Err(Error::ConnectionLost(_))));
        assert!(matches!(transport.flush().await, Err(Error::ConnectionLost(_))));
    }
}
