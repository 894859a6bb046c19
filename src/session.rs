//! One bound ARK bridge and the I2C/GPIO operations it exposes.
//!
//! A [`DeviceSession`] is created by the [`Enumerator`](crate::Enumerator)
//! after a successful handshake. Callers address individual I2C targets on it
//! through [`DeviceAddress`] handles, which are minted by the session itself
//! and refuse to work against any other session.

use std::fmt;
use std::sync::Arc;

use log::{debug, info};

use crate::chunker;
use crate::command::{Frame, Rgb, MAX_I2C_ADDRESS};
use crate::config::BridgeConfig;
use crate::errors::{BridgeError, Result};
use crate::transport::{BleContext, Transport, TransportKind};

// ============================================================================
// Constants
// ============================================================================

/// Trailing reply byte of an acknowledged I2C write
pub const WRITE_ACK: u8 = 0x05;

/// First firmware version (date coded, YYMMDD) that drives a NeoPixel
pub const NEOPIXEL_MIN_FIRMWARE: u32 = 181025;

// ============================================================================
// Identity
// ============================================================================

/// What the handshake learned about a bridge. Fixed for the session's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub port: String,
    pub kind: TransportKind,
    /// Date-coded firmware version, e.g. `181025`.
    pub firmware_version: u32,
    /// Number of I2C buses, at least 1.
    pub bus_count: u8,
}

impl DeviceIdentity {
    pub fn is_ble(&self) -> bool {
        matches!(self.kind, TransportKind::BleRelay(_))
    }

    pub fn ble_context(&self) -> Option<BleContext> {
        match self.kind {
            TransportKind::BleRelay(ctx) => Some(ctx),
            TransportKind::DirectSerial => None,
        }
    }

    /// NeoPixel output needs a wired bridge running recent firmware.
    pub fn supports_neopixel(&self) -> bool {
        !self.is_ble() && self.firmware_version >= NEOPIXEL_MIN_FIRMWARE
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.port)?;
        if let Some(ctx) = self.ble_context() {
            write!(f, " [BLE {}]", ctx.connection)?;
        }
        write!(f, ", FW v.{}", self.firmware_version)
    }
}

/// An I2C target on one bus of one bridge.
#[derive(Debug, Clone)]
pub struct DeviceAddress {
    device: Arc<DeviceIdentity>,
    bus: u8,
    address: u8,
}

impl DeviceAddress {
    pub fn device(&self) -> &DeviceIdentity {
        &self.device
    }

    pub fn bus(&self) -> u8 {
        self.bus
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Whether this handle was minted by the bridge identified by `device`.
    pub fn belongs_to(&self, device: &Arc<DeviceIdentity>) -> bool {
        Arc::ptr_eq(&self.device, device)
    }
}

impl PartialEq for DeviceAddress {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.device, &other.device)
            && self.bus == other.bus
            && self.address == other.address
    }
}

impl Eq for DeviceAddress {}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bus {} @ I2C address 0x{:02X}", self.bus, self.address)
    }
}

// ============================================================================
// Session
// ============================================================================

/// Driver for one ARK bridge.
///
/// All operations block until the bridge answered or the configured budget
/// ran out. Nothing is retried: a frame that reached the wire is never sent
/// twice.
///
/// # Example (Rust)
/// ```ignore
/// let mut scan = Enumerator::new(BridgeConfig::from_env()).enumerate(&[], 8..120);
/// let target = scan.addresses().next().cloned().expect("no device");
/// let session = scan.session_mut(&target).unwrap();
///
/// session.write(&target, 0x08, &[0xF0])?;
/// let data = session.read(&target, Some(0x08), 1)?;
/// ```
pub struct DeviceSession {
    identity: Arc<DeviceIdentity>,
    transport: Box<dyn Transport>,
    config: BridgeConfig,
    closed: bool,
}

impl DeviceSession {
    pub fn new(identity: DeviceIdentity, transport: Box<dyn Transport>, config: BridgeConfig) -> Self {
        Self {
            identity: Arc::new(identity),
            transport,
            config,
            closed: false,
        }
    }

    pub fn identity(&self) -> &Arc<DeviceIdentity> {
        &self.identity
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    // ------------------------------------------------------------------------
    // Addressing
    // ------------------------------------------------------------------------

    /// Mint a handle for `address` on `bus`.
    ///
    /// # Errors
    /// `BusOutOfRange` if the bridge has no such bus, `AddressOutOfRange` for
    /// addresses above 0x7F.
    pub fn address(&self, bus: u8, address: u8) -> Result<DeviceAddress> {
        if bus >= self.identity.bus_count {
            return Err(BridgeError::BusOutOfRange {
                bus,
                bus_count: self.identity.bus_count,
            });
        }
        if address > MAX_I2C_ADDRESS {
            return Err(BridgeError::AddressOutOfRange(address));
        }
        Ok(DeviceAddress {
            device: Arc::clone(&self.identity),
            bus,
            address,
        })
    }

    /// Check for a device at (`bus`, `address`) with a one-byte dummy write.
    ///
    /// Returns the handle if the write was acknowledged, `None` if it was
    /// refused or went unanswered.
    pub fn probe(&mut self, bus: u8, address: u8) -> Result<Option<DeviceAddress>> {
        let target = self.address(bus, address)?;
        let register = self.config.probe_register;
        match self.write(&target, register, &[0x00]) {
            Ok(_) => {
                info!("Device found on bus {} @ I2C address 0x{:02X}", bus, address);
                Ok(Some(target))
            }
            Err(BridgeError::NAck { .. }) | Err(BridgeError::Timeout { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------------
    // I2C
    // ------------------------------------------------------------------------

    /// Read `length` bytes from `target`.
    ///
    /// With a register the device pointer is set first; with `None` the read
    /// continues from wherever the device pointer stands. Transfers larger
    /// than the transport allows are split into several frames.
    ///
    /// # Errors
    /// `IncompleteRead` carrying the number of bytes that did arrive if any
    /// piece comes back short.
    pub fn read(&mut self, target: &DeviceAddress, register: Option<u8>, length: usize) -> Result<Vec<u8>> {
        self.ensure_usable(target)?;
        let mut data = Vec::with_capacity(length);
        if length == 0 {
            return Ok(data);
        }

        let limits = self.identity.kind.limits();
        for request in chunker::chunk_read(register, length, limits.read) {
            let mut frame = self.select(target)?;
            if let Some(register) = request.register {
                frame = frame.set_pointer(register);
            }
            let frame = frame.read(request.length, request.last);
            self.transport.send(frame.as_bytes())?;

            let expected = request.length as usize;
            match self.transport.receive(expected, self.config.read_budget(expected)) {
                Ok(piece) => data.extend(piece),
                Err(BridgeError::Timeout { received, .. }) => {
                    debug!("Received {}, expected {}", data.len() + received, length);
                    return Err(BridgeError::IncompleteRead {
                        requested: length,
                        received: data.len() + received,
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(data)
    }

    /// Write `payload` to `target` starting at `register`.
    ///
    /// The whole payload travels as one frame of chunked writes and is
    /// acknowledged once at the end. Returns the payload length.
    ///
    /// # Errors
    /// - `NAck` with the full payload length if the bridge reports failure
    /// - `Timeout` if no acknowledgement arrives within the budget
    pub fn write(&mut self, target: &DeviceAddress, register: u8, payload: &[u8]) -> Result<usize> {
        self.ensure_usable(target)?;
        let limits = self.identity.kind.limits();
        let mut frame = self.select(target)?;
        for chunk in chunker::chunk_write(register, payload, limits.write) {
            frame = frame.write(chunk.register, chunk.bytes, chunk.last)?;
        }
        self.transport.send(frame.as_bytes())?;

        let reply = self.transport.receive(1, self.config.ack_budget(frame.len()))?;
        match reply.last() {
            Some(&WRITE_ACK) => Ok(payload.len()),
            other => Err(BridgeError::NAck {
                attempted: payload.len(),
                response: other.copied(),
            }),
        }
    }

    /// Set the clock of `target`'s bus, in units of 10 kHz (1-100).
    pub fn i2c_clock(&mut self, target: &DeviceAddress, clock: u8) -> Result<()> {
        self.ensure_usable(target)?;
        let frame = Frame::new()
            .select_bus_if_multi(target.bus, self.identity.bus_count)
            .clock(clock)?;
        self.transport.send(frame.as_bytes())
    }

    /// Switch the pull-up resistors of `target`'s bus.
    pub fn pullup(&mut self, target: &DeviceAddress, enabled: bool) -> Result<()> {
        self.ensure_usable(target)?;
        let frame = Frame::new()
            .select_bus_if_multi(target.bus, self.identity.bus_count)
            .pullup(enabled);
        self.transport.send(frame.as_bytes())
    }

    // ------------------------------------------------------------------------
    // GPIO and NeoPixel
    // ------------------------------------------------------------------------

    /// Configure `pin` (2-13) as input (0), output (1) or input with pull-up (2).
    pub fn dio_mode(&mut self, pin: u8, mode: u8) -> Result<()> {
        self.ensure_open()?;
        let frame = Frame::new().dio_pin(pin)?.dio_mode(mode)?;
        self.transport.send(frame.as_bytes())
    }

    /// Sample the level of `pin`.
    pub fn dio_read(&mut self, pin: u8) -> Result<u8> {
        self.ensure_open()?;
        let frame = Frame::new().dio_pin(pin)?.dio_read();
        self.transport.send(frame.as_bytes())?;
        let reply = self.transport.receive(1, self.config.ack_budget(frame.len()))?;
        reply
            .last()
            .copied()
            .ok_or_else(|| BridgeError::Protocol("empty digital IO reply".into()))
    }

    pub fn dio_write(&mut self, pin: u8, level: u8) -> Result<()> {
        self.ensure_open()?;
        let frame = Frame::new().dio_pin(pin)?.dio_write(level)?;
        self.transport.send(frame.as_bytes())
    }

    /// Set the on-board NeoPixel colour.
    ///
    /// # Errors
    /// `UnsupportedOnTransport` over BLE or on firmware older than
    /// [`NEOPIXEL_MIN_FIRMWARE`].
    pub fn neopixel_color(&mut self, color: Rgb) -> Result<()> {
        self.ensure_open()?;
        if !self.identity.supports_neopixel() {
            let reason = if self.identity.is_ble() {
                "not available over BLE".to_string()
            } else {
                format!(
                    "firmware v.{} predates v.{}",
                    self.identity.firmware_version, NEOPIXEL_MIN_FIRMWARE
                )
            };
            return Err(BridgeError::UnsupportedOnTransport {
                operation: "neopixel_color",
                reason,
            });
        }
        let frame = Frame::new().neopixel(color);
        self.transport.send(frame.as_bytes())
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Release the bridge.
    ///
    /// The session is unusable afterwards even if the BLE disconnect could
    /// not be confirmed. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        debug!("closing {}", self.identity);
        self.transport.close()
    }

    // ------------------------------------------------------------------------
    // Internal Helpers
    // ------------------------------------------------------------------------

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(BridgeError::Closed);
        }
        Ok(())
    }

    fn ensure_usable(&self, target: &DeviceAddress) -> Result<()> {
        self.ensure_open()?;
        if !target.belongs_to(&self.identity) {
            return Err(BridgeError::Protocol(format!(
                "{} belongs to {}, not {}",
                target,
                target.device(),
                self.identity
            )));
        }
        Ok(())
    }

    /// Bus and address selection every I2C frame starts with.
    fn select(&self, target: &DeviceAddress) -> Result<Frame> {
        Frame::new()
            .select_bus_if_multi(target.bus, self.identity.bus_count)
            .select_address(target.address)
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("identity", &self.identity)
            .field("closed", &self.closed)
            .finish()
    }
}
