//! Host-side driver for ARK USB/BLE-to-I2C bridges, with optional Python bindings.
//!
//! An ARK bridge sits on a serial port, either wired directly or reached
//! through a BLE dongle on that port, and exposes I2C buses, digital IO pins
//! and (on recent firmware) a NeoPixel to the host.
//!
//! # Layers
//!
//! 1. [`codec`] and [`command`] build the opcode frames the bridge firmware
//!    understands.
//! 2. [`chunker`] splits transfers that exceed what one frame may carry.
//! 3. A [`Transport`] moves frames to the bridge: [`DirectSerial`] as raw
//!    bytes, [`BleRelay`] as GATT attribute writes tunnelled through the
//!    dongle's packet protocol ([`ble`]).
//! 4. A [`DeviceSession`] runs I2C/GPIO operations on one bridge, and the
//!    [`Enumerator`] finds bridges and the devices behind them.
//!
//! # Example
//! ```ignore
//! ark_bridge::init_rust_logging();
//! let mut scan = Enumerator::new(BridgeConfig::from_env()).enumerate(&[], 8..120);
//! let target = scan.addresses().next().cloned().expect("no device");
//! let session = scan.session_mut(&target).expect("session");
//! session.write(&target, 0x08, &[0xF0])?;
//! let data = session.read(&target, Some(0x08), 1)?;
//! ```

pub mod ble;
pub mod chunker;
pub mod codec;
pub mod command;

mod config;
mod discovery;
mod enumerator;
mod errors;
mod link;
mod logging;
mod session;
mod transport;

#[cfg(feature = "python")]
mod python;

pub use config::{BridgeConfig, DEFAULT_BAUD};
pub use discovery::{BleDiscovery, DiscoveryState, Peripheral};
pub use enumerator::{
    handshake, parse_handshake, query_bus_count, Enumerator, PortFailure, ScanResult,
    ScannedDevice, HANDSHAKE_REPLY_LEN,
};
pub use errors::*;
pub use link::{lock, read_within, share, Link, SerialPortLink, SharedLink};
pub use logging::init_rust_logging;
pub use session::{DeviceAddress, DeviceIdentity, DeviceSession, NEOPIXEL_MIN_FIRMWARE, WRITE_ACK};
pub use transport::{BleContext, BleRelay, DirectSerial, Transport, TransportKind};
