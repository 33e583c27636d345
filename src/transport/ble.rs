//! Bluetooth Low Energy backend.
//!
//! Many BMSs expose a serial-like link over BLE: one characteristic to write requests to,
//! one that delivers answers as notifications of up to ~20 bytes each. Notifications are
//! forwarded by a background task into a channel that [`read_available`] drains, which
//! turns the link into an ordinary byte [`Transport`].
//!
//! [`read_available`]: Transport::read_available

use std::time::Duration;

use async_trait::async_trait;
use bluest::{Adapter, AdvertisingDevice, Characteristic, Device, Uuid};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::Transport;
use crate::error::{Error, Result};

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);
const NOTIFICATION_BUFFER: usize = 64;

/// The GATT layout a vendor uses for its serial link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BleProfile {
    pub service: Uuid,
    pub write: Uuid,
    pub notify: Uuid,
    /// Whether the device advertises `service`, so scanning can filter on it.
    pub advertises_service: bool,
}

impl BleProfile {
    /// Nordic UART service, used by the li-gen BMS.
    pub const NORDIC_UART: BleProfile = BleProfile {
        service: Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e),
        write: Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e),
        notify: Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e),
        advertises_service: true,
    };

    /// HM-10 style module used by JK BMS: one characteristic for both directions.
    pub const JK: BleProfile = BleProfile {
        service: Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb),
        write: Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb),
        notify: Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb),
        advertises_service: false,
    };
}

struct Link {
    adapter: Adapter,
    device: Device,
    write: Characteristic,
    notifications: mpsc::Receiver<Vec<u8>>,
    forwarder: JoinHandle<()>,
}

pub struct BleTransport {
    device_name: String,
    profile: BleProfile,
    link: Option<Link>,
}

impl BleTransport {
    pub fn new(device_name: impl Into<String>, profile: BleProfile) -> Self {
        Self { device_name: device_name.into(), profile, link: None }
    }

    fn link(&mut self) -> Result<&mut Link> {
        let name = &self.device_name;
        self.link.as_mut().ok_or_else(|| Error::ConnectionLost(format!("{name} is not connected")))
    }

    async fn discover_device(&self, adapter: &Adapter) -> Result<AdvertisingDevice> {
        let filter = if self.profile.advertises_service { vec![self.profile.service] } else { vec![] };
        let mut adapter_events = adapter.scan(&filter).await?;
        while let Some(device) = adapter_events.next().await {
            let device_name = device.device.name_async().await?;
            if device_name == self.device_name {
                return Ok(device);
            }
        }
        Err(Error::NotFound(self.device_name.clone()))
    }

    async fn connect(&self) -> Result<Link> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| Error::ConnectionLost("default bluetooth adapter not found".into()))?;
        adapter.wait_available().await?;

        let device = timeout(DISCOVERY_TIMEOUT, self.discover_device(&adapter))
            .await
            .map_err(|_| Error::NotFound(self.device_name.clone()))??
            .device;

        adapter.connect_device(&device).await?;

        let missing = |what: &str| {
            Error::ConnectionLost(format!("{} does not expose the {what}", self.device_name))
        };
        let service = device
            .discover_services_with_uuid(self.profile.service)
            .await?
            .first()
            .cloned()
            .ok_or_else(|| missing("serial service"))?;
        let write = service
            .discover_characteristics_with_uuid(self.profile.write)
            .await?
            .first()
            .cloned()
            .ok_or_else(|| missing("write characteristic"))?;
        let notify = service
            .discover_characteristics_with_uuid(self.profile.notify)
            .await?
            .first()
            .cloned()
            .ok_or_else(|| missing("notify characteristic"))?;

        let (tx, notifications) = mpsc::channel(NOTIFICATION_BUFFER);
        let forwarder = tokio::spawn(forward_notifications(notify, tx));

        Ok(Link { adapter, device, write, notifications, forwarder })
    }
}

async fn forward_notifications(notify: Characteristic, tx: mpsc::Sender<Vec<u8>>) {
    let mut stream = match notify.notify().await {
        Ok(stream) => stream,
        Err(err) => {
            warn!("could not subscribe to notifications: {err}");
            return;
        }
    };
    while let Some(notification) = stream.next().await {
        match notification {
            Ok(data) => {
                debug!("RX notification: {}", hex::encode(&data));
                if tx.send(data).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                warn!("notification error: {err}");
                return;
            }
        }
    }
    debug!("end of notification stream");
}

#[async_trait]
impl Transport for BleTransport {
    async fn open(&mut self) -> Result<()> {
        if self.link.is_some() {
            self.close().await?;
        }
        let link = self.connect().await?;
        info!("connected to {}", self.device_name);
        self.link = Some(link);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(link) = self.link.take() {
            link.forwarder.abort();
            link.adapter.disconnect_device(&link.device).await?;
        }
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.link()?.write.write(data).await?;
        Ok(())
    }

    /// Everything notified since the last call. A finished forwarder with nothing left
    /// to deliver means the link is gone.
    async fn read_available(&mut self) -> Result<Vec<u8>> {
        let name = self.device_name.clone();
        let link = self.link()?;
        let mut received = Vec::new();
        loop {
            match link.notifications.try_recv() {
                Ok(chunk) => received.extend_from_slice(&chunk),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) if received.is_empty() => {
                    return Err(Error::ConnectionLost(format!("{name}: notification stream ended")));
                }
                Err(TryRecvError::Disconnected) => break,
            }
        }
        Ok(received)
    }

    async fn flush(&mut self) -> Result<()> {
        let link = self.link()?;
        while link.notifications.try_recv().is_ok() {}
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.link.is_some()
    }

    fn name(&self) -> String {
        format!("ble:{}", self.device_name)
    }
}
