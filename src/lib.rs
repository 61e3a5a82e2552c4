//! Awaitable BLE central operations on top of a callback-driven radio stack.
//!
//! Radio stacks report the outcome of a connect, read or write through a
//! callback that arrives some time later. This library correlates those
//! callbacks with the call that caused them, so that every operation can be
//! awaited, and turns everything else the radio reports into a stream of
//! [`BleEvent`]s.
//!
//! ## Usage
//!
//! Here is an example on how to find a device with a battery service and read
//! its battery level:
//!
//! ```rust,no_run
//! use bleasy_bridge::common::{characteristics::BATTERY_LEVEL, services::BATTERY};
//! use bleasy_bridge::{
//!     BleEvent, CharacteristicId, ConnectOptions, Error, RadioStack, ScanOptions, Session, SessionConfig,
//! };
//! use futures::StreamExt;
//!
//! // Any `RadioStack` works here, e.g. `platform::BtleplugRadio` or `fake::FakeRadio`.
//! async fn read_battery_level(radio: impl RadioStack) -> Result<Vec<u8>, Error> {
//!     let session = Session::new(radio, SessionConfig::default());
//!     let mut events = session.event_stream();
//!
//!     // Scan for devices advertising the battery service
//!     let options = ScanOptions::default()
//!         .filter_by_services([BATTERY])
//!         .stop_after_first_match();
//!     session.start_scan(options).await?;
//!
//!     // Take the first discovered device
//!     let peripheral = loop {
//!         match events.next().await {
//!             Some(BleEvent::DiscoveredPeripheral(peripheral)) => break peripheral,
//!             Some(_) => continue,
//!             None => return Err(Error::SessionClosed),
//!         }
//!     };
//!
//!     session.connect(&peripheral.id, ConnectOptions::default()).await?;
//!
//!     // Read the battery level
//!     let battery_level = session
//!         .read(&peripheral.id, CharacteristicId::new(BATTERY, BATTERY_LEVEL))
//!         .await?;
//!
//!     session.disconnect(&peripheral.id).await?;
//!     Ok(battery_level)
//! }
//! ```

#![warn(clippy::all, future_incompatible, nonstandard_style, rust_2018_idioms)]

pub use characteristic::{CharacteristicId, CharacteristicInfo, CharacteristicProperties, WriteType};
pub use common::{ConnectionState, PeripheralId, RadioState};
pub use error::{Error, Result};
pub use event::{BleEvent, DisconnectReason, StopScanReason};
pub use peripheral::{AdvertisementData, Peripheral};
pub use pending::{OperationKey, OperationKind};
pub use radio::{ConnectOptions, RadioEvent, RadioEventSink, RadioStack, RestoredPeripheral};
pub use scanner::ScanOptions;
pub use service::ServiceInfo;
pub use session::{Diagnostics, Session, SessionConfig};

mod controller;
mod error;
mod event;
mod gatt;
mod latch;
mod notify_buffer;
mod pending;
mod registry;
mod session;
mod write_queue;

mod characteristic;
mod peripheral;
mod radio;
mod scanner;
mod service;

pub mod common;
#[cfg(feature = "fake")]
pub mod fake;
#[cfg(feature = "btleplug")]
pub mod platform;
