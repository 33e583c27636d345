//! Scripted in-memory transport for simulation and tests.
//!
//! Incoming bytes are queued as chunks and handed out one chunk per
//! [`read_available`](Transport::read_available) call, so partial reads happen naturally.
//! A responder closure may answer each written request with any number of chunks.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::Transport;
use crate::error::{Error, Result};

pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

#[derive(Default)]
struct Link {
    incoming: VecDeque<Vec<u8>>,
    written: Vec<Vec<u8>>,
    dropped: bool,
    refuse_opens: u32,
    opens: u32,
}

/// Test-side view of a [`MemoryTransport`] that stays usable after the transport has
/// been moved into a driver or worker.
#[derive(Clone, Default)]
pub struct MemoryHandle(Arc<Mutex<Link>>);

impl MemoryHandle {
    fn link(&self) -> MutexGuard<'_, Link> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue bytes as if the device had sent them unsolicited.
    pub fn push(&self, chunk: Vec<u8>) {
        self.link().incoming.push_back(chunk);
    }

    /// Every request written so far.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.link().written.clone()
    }

    /// Simulate the device going away; reads fail until the next successful open.
    pub fn drop_link(&self) {
        self.link().dropped = true;
    }

    /// Make the next `count` open attempts fail.
    pub fn refuse_opens(&self, count: u32) {
        self.link().refuse_opens = count;
    }

    pub fn opens(&self) -> u32 {
        self.link().opens
    }
}

pub struct MemoryTransport {
    name: String,
    open: bool,
    handle: MemoryHandle,
    responder: Option<Responder>,
}

impl MemoryTransport {
    /// A transport that never answers on its own.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), open: false, handle: MemoryHandle::default(), responder: None }
    }

    pub fn with_responder(
        name: impl Into<String>,
        responder: impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    ) -> Self {
        Self { responder: Some(Box::new(responder)), ..Self::new(name) }
    }

    pub fn handle(&self) -> MemoryHandle {
        self.handle.clone()
    }

    pub fn set_open(&mut self, open: bool) {
        self.open = open;
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&mut self) -> Result<()> {
        let mut link = self.handle.link();
        if link.refuse_opens > 0 {
            link.refuse_opens -= 1;
            return Err(Error::ConnectionLost(format!("{}: connection refused", self.name)));
        }
        link.dropped = false;
        link.opens += 1;
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if !self.open {
            return Err(Error::ConnectionLost(format!("{} is not open", self.name)));
        }
        let answer = self.responder.as_mut().map(|respond| respond(data)).unwrap_or_default();
        let mut link = self.handle.link();
        link.written.push(data.to_vec());
        link.incoming.extend(answer);
        Ok(())
    }

    async fn read_available(&mut self) -> Result<Vec<u8>> {
        let mut link = self.handle.link();
        if !self.open || link.dropped {
            return Err(Error::ConnectionLost(format!("{} is not connected", self.name)));
        }
        Ok(link.incoming.pop_front().unwrap_or_default())
    }

    async fn flush(&mut self) -> Result<()> {
        self.handle.link().incoming.clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn name(&self) -> String {
        format!("memory:{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn answers_in_chunks() {
        let mut transport = MemoryTransport::with_responder("bus", |request| {
            vec![request[..1].to_vec(), request[1..].to_vec()]
        });
        transport.open().await.unwrap();
        transport.write(&[1, 2, 3]).await.unwrap();
        assert_eq!(transport.read_available().await.unwrap(), vec![1]);
        assert_eq!(transport.read_available().await.unwrap(), vec![2, 3]);
        assert!(transport.read_available().await.unwrap().is_empty());
        assert_eq!(transport.handle().written(), vec![vec![1, 2, 3]]);
    }

    #[tokio::test]
    async fn dropped_link_fails_reads_until_reopened() {
        let mut transport = MemoryTransport::new("ble");
        let handle = transport.handle();
        handle.refuse_opens(1);
        assert!(transport.open().await.is_err());
        transport.open().await.unwrap();

        handle.drop_link();
        assert!(matches!(transport.read_available().await, Err(Error::ConnectionLost(_))));
        transport.open().await.unwrap();
        assert!(transport.read_available().await.is_ok());
        assert_eq!(handle.opens(), 2);
    }
}
