//! Read telemetry from solar and battery equipment over Bluetooth Low Energy
//!
//! Two device families are supported:
//!
//! - JBD battery management systems, which speak a small framed
//!   request-response protocol (`DD A5 <opcode> .. 77`).
//! - Renogy Rover solar charge controllers behind a BT-1/BT-2 module, which
//!   tunnel Modbus RTU "read holding registers" requests over BLE.
//!
//! A fetch scans for one peripheral, connects, sends each request of a
//! [`CommandPlan`] in order, reassembles the notification fragments of every
//! response, disconnects and returns a normalized [`TelemetrySnapshot`].
//! Fetches sharing a radio are serialized.
//!
//! # Example
//!
//! ```no_run
//! # #[tokio::main]
//! # pub async fn main() -> anyhow::Result<()> {
//! use std::sync::Arc;
//! use blemetry::{AdapterKind, BluestRadio, DeviceTarget, Fetcher, SessionConfig};
//!
//! let radio = BluestRadio::new().await?;
//! let fetcher = Fetcher::new(Arc::new(radio), SessionConfig::default());
//! let snapshot = fetcher
//!     .fetch(DeviceTarget::new("A4:C1:38:0B:79:22"), AdapterKind::Jbd)
//!     .await?;
//! println!("{}", snapshot.into_value());
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod ble;
pub mod codec;
pub mod command;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod sequencer;
pub mod server;
pub mod session;
pub mod telemetry;

pub use adapter::{AdapterKind, DeviceAdapter};
pub use ble::{BluestRadio, DeviceAddress, DeviceTarget};
pub use command::{CommandPlan, CommandSpec};
pub use config::{Config, SessionConfig};
pub use error::{Error, Result};
pub use fetcher::Fetcher;
pub use telemetry::TelemetrySnapshot;
