//! Per-vendor drivers and discovery.
//!
//! A [`Bms`] driver sequences the requests of one vendor protocol against one transport.
//! [`probe`] tries every candidate vendor a transport descriptor allows and hands back the
//! first driver whose connection test succeeds, together with its freshly read battery.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::battery_state::Battery;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocol::daly::{self, DalyBms};
use crate::protocol::jkbms_ble::JkBleBms;
use crate::protocol::ligen::LigenBms;
use crate::protocol::seplos::{self, SeplosBms};
use crate::transport::{SharedTransport, Transport};

const PROBE_ROUNDS: usize = 3;
const PROBE_PAUSE: Duration = Duration::from_millis(500);

/// A driver for one vendor's BMS.
#[async_trait]
pub trait Bms: Send {
    fn kind(&self) -> &'static str;

    fn poll_interval(&self) -> Duration;

    /// Check that this vendor's BMS answers and fill in what identifies it.
    async fn test_connection(&mut self, battery: &mut Battery) -> Result<()>;

    /// Read the static parameters (capacity, limits, identity) once after discovery.
    async fn get_settings(&mut self, battery: &mut Battery) -> Result<()>;

    /// One poll: read everything that changes and write it into `battery`.
    async fn refresh(&mut self, battery: &mut Battery) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// One vendor/address/baud combination worth trying on a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Candidate {
    Daly { address: u8 },
    Seplos { address: u8 },
    JkBle,
    Ligen,
}

impl Candidate {
    pub fn baud_rate(&self) -> u32 {
        match self {
            Candidate::Daly { .. } => 9600,
            Candidate::Seplos { .. } => 19200,
            Candidate::JkBle | Candidate::Ligen => 0,
        }
    }
}

/// Where to look for a battery, e.g. `serial:/dev/ttyUSB0` or `jk-ble:JK_B2A8S20P`.
/// A bare path is taken as a serial port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportDescriptor {
    Serial { path: String },
    JkBle { name: String },
    LigenBle { name: String },
}

impl FromStr for TransportDescriptor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (scheme, target) = s.split_once(':').unwrap_or(("serial", s));
        if target.is_empty() {
            return Err(Error::Config(format!("missing target in transport descriptor {s:?}")));
        }
        let target = target.to_owned();
        match scheme {
            "serial" => Ok(TransportDescriptor::Serial { path: target }),
            "jk-ble" => Ok(TransportDescriptor::JkBle { name: target }),
            "ligen-ble" => Ok(TransportDescriptor::LigenBle { name: target }),
            other => Err(Error::Config(format!("unknown transport {other:?} in {s:?}"))),
        }
    }
}

impl fmt::Display for TransportDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportDescriptor::Serial { path } => write!(f, "serial:{path}"),
            TransportDescriptor::JkBle { name } => write!(f, "jk-ble:{name}"),
            TransportDescriptor::LigenBle { name } => write!(f, "ligen-ble:{name}"),
        }
    }
}

impl TransportDescriptor {
    pub fn candidates(&self) -> Vec<Candidate> {
        match self {
            TransportDescriptor::Serial { .. } => vec![
                Candidate::Daly { address: daly::ADDRESS_UART },
                Candidate::Daly { address: daly::ADDRESS_RS485 },
                Candidate::Seplos { address: seplos::DEFAULT_ADDRESS },
            ],
            TransportDescriptor::JkBle { .. } => vec![Candidate::JkBle],
            TransportDescriptor::LigenBle { .. } => vec![Candidate::Ligen],
        }
    }

    /// A fresh, unopened transport for `candidate`.
    pub fn connect(&self, candidate: &Candidate) -> Result<Box<dyn Transport>> {
        match self {
            TransportDescriptor::Serial { path } => Ok(Box::new(
                crate::transport::serial::SerialTransport::new(path.clone(), candidate.baud_rate()),
            )),
            #[cfg(feature = "ble")]
            TransportDescriptor::JkBle { name } => {
                use crate::transport::ble::{BleProfile, BleTransport};
                Ok(Box::new(BleTransport::new(name.clone(), BleProfile::JK)))
            }
            #[cfg(feature = "ble")]
            TransportDescriptor::LigenBle { name } => {
                use crate::transport::ble::{BleProfile, BleTransport};
                Ok(Box::new(BleTransport::new(name.clone(), BleProfile::NORDIC_UART)))
            }
            #[cfg(not(feature = "ble"))]
            _ => Err(Error::Config(format!("{self}: built without bluetooth support"))),
        }
    }
}

fn share(transport: Box<dyn Transport>) -> SharedTransport {
    Arc::new(Mutex::new(transport))
}

/// Wrap `transport` in the driver for `candidate`.
pub fn build_driver(candidate: Candidate, transport: Box<dyn Transport>, config: &Config) -> Box<dyn Bms> {
    match candidate {
        Candidate::Daly { address } => Box::new(DalyBms::new(share(transport), address, config)),
        Candidate::Seplos { address } => Box::new(SeplosBms::new(share(transport), address, config)),
        Candidate::JkBle => Box::new(JkBleBms::new(transport, config)),
        Candidate::Ligen => Box::new(LigenBms::new(share(transport), config)),
    }
}

/// A discovered battery and the driver that talks to it.
pub struct Probed {
    pub bms: Box<dyn Bms>,
    pub battery: Battery,
}

impl fmt::Debug for Probed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Probed").field("bms", &self.bms.kind()).field("battery", &self.battery.address).finish()
    }
}

/// Find the BMS behind `descriptor`.
pub async fn probe(descriptor: &TransportDescriptor, config: &Config) -> Result<Probed> {
    probe_with(&descriptor.to_string(), &descriptor.candidates(), config, |candidate| {
        descriptor.connect(candidate)
    })
    .await
}

/// Try each candidate in turn, up to three rounds with a short pause in between.
pub async fn probe_with<F>(
    address: &str,
    candidates: &[Candidate],
    config: &Config,
    mut connect: F,
) -> Result<Probed>
where
    F: FnMut(&Candidate) -> Result<Box<dyn Transport>> + Send,
{
    for round in 1..=PROBE_ROUNDS {
        for candidate in candidates {
            debug!("testing {candidate:?} on {address}");
            let transport = match connect(candidate) {
                Ok(transport) => transport,
                Err(err) => {
                    warn!("cannot open {address} for {candidate:?}: {err}");
                    continue;
                }
            };
            let mut bms = build_driver(*candidate, transport, config);
            let mut battery = Battery::new(address);

            let found = match bms.test_connection(&mut battery).await {
                Ok(()) => bms.get_settings(&mut battery).await,
                Err(err) => Err(err),
            };
            match found {
                Ok(()) => {
                    info!("connection established to {} on {address}", bms.kind());
                    return Ok(Probed { bms, battery });
                }
                Err(err) => {
                    debug!("{candidate:?} did not answer on {address}: {err}");
                    if let Err(err) = bms.close().await {
                        debug!("closing {address}: {err}");
                    }
                }
            }
        }
        if round < PROBE_ROUNDS {
            tokio::time::sleep(PROBE_PAUSE).await;
        }
    }
    Err(Error::NotFound(address.to_owned()))
}
