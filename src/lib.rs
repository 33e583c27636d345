//! Read status data from LiFePO4 Battery Management Systems over serial lines and Bluetooth Low Energy,
//! and derive advisory charge/discharge limits from it.
//!
//! Supported BMSs:
//!
//! - Daly, UART and RS485 (`serial:/dev/ttyUSB0`)
//! - Seplos, RS485 (`serial:/dev/ttyUSB0`)
//! - JK BMS, BLE (`jk-ble:<device name>`)
//! - LiGen, BLE with Nordic UART (`ligen-ble:<device name>`)
//!
//! Each vendor speaks its own framed request/response protocol. The frames are read by a
//! shared [`FrameReader`](transport::FrameReader), checked and decoded by the vendor's
//! [`Protocol`](protocol::Protocol) codec into one normalized [`Battery`], and fed to a
//! [`ChargeController`] that computes CCL/DCL/CVL.
//!
//! Currently the following data can be accessed:
//!
//! - State of charge (%), remaining capacity (Ah), cycles
//! - Cell voltages (V), balancing state, pack voltage and current
//! - Temperatures, FET states, protection warnings and alarms
//!
//! # Example
//!
//! ```no_run
//! # use std::time::Duration;
//! # use bmsread::{probe, Config, TransportDescriptor};
//! #
//! # #[tokio::main]
//! # pub async fn main() -> bmsread::Result<()> {
//!     let config = Config::default();
//!     let descriptor: TransportDescriptor = "serial:/dev/ttyUSB0".parse()?;
//!     let mut found = probe(&descriptor, &config).await?;
//!     loop {
//!         found.bms.refresh(&mut found.battery).await?;
//!         println!("{:?} % at {:?} V", found.battery.soc, found.battery.voltage);
//!         tokio::time::sleep(Duration::from_secs(5)).await;
//!     }
//! # }
//! ```

pub mod battery_state;
pub mod bms;
pub mod charge_limits;
pub mod config;
pub mod error;
pub mod poller;
pub mod protocol;
pub mod settings;
pub mod transport;

pub use battery_state::{Battery, Protection, Severity};
pub use bms::{probe, Bms, Probed, TransportDescriptor};
pub use charge_limits::{ChargeController, ChargeLimits};
pub use config::Config;
pub use error::{Error, Result};
pub use poller::{LogSink, Poller, PublishSink};
