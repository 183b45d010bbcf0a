#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Jebao
//!
//! A Rust library for discovering and controlling Jebao MDP-20000 pumps on the
//! local network.
//!
//! The pump's Wi-Fi module answers UDP discovery broadcasts and accepts a single
//! TCP control connection. After a passcode login the client reads the pump's
//! status and writes attribute changes (power, operating mode, speed, feed
//! override) as small binary data frames.
//!
//! ## Protocol Overview
//!
//! - **Discovery**: UDP broadcast on port 12414, one reply datagram per pump
//! - **Control**: TCP port 12416, length-prefixed packets with a `00 00 00 03` header
//! - **Login**: passcode request followed by a login with the returned passcode
//! - **Keepalive**: heartbeat frames while the connection is idle
//! - **Data**: attribute writes acknowledged by sequence number, status replies and pushes
//!
//! See [`protocol`] for the packet layout.
//!
//! ## Quick Start
//!
//! ```no_run
//! use jebao::{discover_devices, MDP20000Device};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let devices = discover_devices(Duration::from_secs(3)).await?;
//!     let Some(info) = devices.iter().find(|d| d.is_mdp20000()) else {
//!         return Ok(());
//!     };
//!
//!     let pump = MDP20000Device::new(info.ip_address);
//!     pump.connect().await?;
//!     pump.ensure_manual_mode().await?;
//!     pump.turn_on().await?;
//!     pump.set_speed(50).await?;
//!
//!     pump.update().await?;
//!     println!("{} @ {}%", pump.state().await.name(), pump.speed().await);
//!
//!     pump.disconnect().await?;
//!     Ok(())
//! }
//! ```

/// Demonstration routines exercising the device API
pub mod demo;
/// Main device control interface
pub mod device;
/// LAN discovery of pumps
pub mod discovery;
/// Error types and handling
pub mod error;
/// Protocol packet structures and parsing
pub mod protocol;
/// Byte-stream transport to the pump
pub mod transport;
/// Type definitions and data structures
pub mod types;

#[cfg(test)]
mod testing;

// Re-export the main types for convenient usage
pub use device::MDP20000Device;
pub use discovery::{discover_devices, discover_devices_with};
pub use error::{JebaoError, Result};
pub use types::{
    ConnectionParams, DeviceInfo, DeviceStatus, PumpMode, PumpState, TimeoutConfig,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// UDP port the pump's Wi-Fi module listens on for discovery broadcasts
pub const DISCOVERY_PORT: u16 = 12414;

/// TCP port of the pump's local control server
pub const CONTROL_PORT: u16 = 12416;

/// Product key reported by MDP-20000 pumps in their discovery reply
///
/// Other Jebao products (dosing pumps, wave makers) share the same Wi-Fi module
/// and answer discovery too; the product key tells them apart.
pub const MDP20000_PRODUCT_KEY: &str = "a9b1e3f2c5d04a7e8f6b2c1d3e4f5a6b";

/// Human readable model name for MDP-20000 pumps
pub const MDP20000_MODEL: &str = "MDP-20000";
