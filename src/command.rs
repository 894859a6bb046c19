//! Command frames understood by the bridge firmware.
//!
//! A frame is a flat run of opcode bytes, each followed by its fixed-size
//! arguments. There are no delimiters: both ends know the argument width of
//! every opcode, so several commands can be concatenated into one write.
//!
//! ```text
//! 42 bb  41 aa  4C ll  57 rr dd dd ..   (bus, address, length, write)
//! ```

use crate::codec;
use crate::errors::{BridgeError, Result};

// Bridge protocol opcodes
pub const OP_BUS: u8 = 0x42;
pub const OP_ADDRESS: u8 = 0x41;
pub const OP_LENGTH: u8 = 0x4C;
pub const OP_WRITE: u8 = 0x57;
pub const OP_WRITE_RESTART: u8 = 0x77;
pub const OP_READ: u8 = 0x52;
pub const OP_READ_RESTART: u8 = 0x72;
pub const OP_CLOCK: u8 = 0x43;
pub const OP_PULLUP_ON: u8 = 0x50;
pub const OP_PULLUP_OFF: u8 = 0x70;
pub const OP_DIO_PIN: u8 = 0x44;
pub const OP_DIO_MODE: u8 = 0x4D;
pub const OP_DIO_READ: u8 = 0x3C;
pub const OP_DIO_WRITE: u8 = 0x3E;
pub const OP_NEOPIXEL: u8 = 0x58;
pub const OP_BUS_COUNT: u8 = 0x62;
/// Literal probe; the bridge answers `zz` plus a six digit version.
pub const HANDSHAKE: [u8; 2] = [0x5A, 0x5A];

pub const MAX_I2C_ADDRESS: u8 = 0x7F;
pub const MAX_CLOCK: u8 = 100;
pub const DIO_PINS: std::ops::RangeInclusive<u8> = 2..=13;
pub const MAX_DIO_MODE: u8 = 2;
/// Largest payload one write can carry: the length field also counts the register.
pub const MAX_WRITE_PAYLOAD: usize = u8::MAX as usize - 1;

/// One physical transaction's worth of command bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame(Vec<u8>);

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_hex(&self) -> String {
        codec::bytes_to_hex(&self.0)
    }

    fn push(mut self, bytes: &[u8]) -> Self {
        self.0.extend_from_slice(bytes);
        self
    }

    /// Select the active I2C bus.
    pub fn select_bus(self, bus: u8) -> Self {
        self.push(&[OP_BUS, bus])
    }

    /// Select the bus only on multi-bus bridges; single-bus firmware does not
    /// know the bus opcode.
    pub fn select_bus_if_multi(self, bus: u8, bus_count: u8) -> Self {
        if bus_count > 1 {
            self.select_bus(bus)
        } else {
            self
        }
    }

    pub fn select_address(self, addr: u8) -> Result<Self> {
        if addr > MAX_I2C_ADDRESS {
            return Err(BridgeError::AddressOutOfRange(addr));
        }
        Ok(self.push(&[OP_ADDRESS, addr]))
    }

    /// Transfer length for the next read or write. A zero length is omitted.
    pub fn length(self, length: u8) -> Self {
        if length > 0 {
            self.push(&[OP_LENGTH, length])
        } else {
            self
        }
    }

    /// Length-prefixed write of `register` followed by `payload`.
    ///
    /// The length field counts the register byte. `last` selects the terminal
    /// opcode (stop condition and ACK byte) over the repeated-start one.
    ///
    /// # Errors
    /// `PayloadTooLarge` if `payload` exceeds [`MAX_WRITE_PAYLOAD`].
    pub fn write(self, register: u8, payload: &[u8], last: bool) -> Result<Self> {
        if payload.len() > MAX_WRITE_PAYLOAD {
            return Err(BridgeError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_WRITE_PAYLOAD,
            });
        }
        let op = if last { OP_WRITE } else { OP_WRITE_RESTART };
        Ok(self
            .length(payload.len() as u8 + 1)
            .push(&[op, register])
            .push(payload))
    }

    /// Point the device's register pointer at `register` without stopping.
    pub fn set_pointer(self, register: u8) -> Self {
        self.length(1).push(&[OP_WRITE_RESTART, register])
    }

    /// Length-prefixed read of `length` bytes.
    pub fn read(self, length: u8, last: bool) -> Self {
        let op = if last { OP_READ } else { OP_READ_RESTART };
        self.length(length).push(&[op])
    }

    pub fn clock(self, clock: u8) -> Result<Self> {
        if clock == 0 || clock > MAX_CLOCK {
            return Err(BridgeError::ClockOutOfRange(clock));
        }
        Ok(self.push(&[OP_CLOCK, clock]))
    }

    pub fn pullup(self, enabled: bool) -> Self {
        self.push(&[if enabled { OP_PULLUP_ON } else { OP_PULLUP_OFF }])
    }

    pub fn dio_pin(self, pin: u8) -> Result<Self> {
        if !DIO_PINS.contains(&pin) {
            return Err(BridgeError::PinOutOfRange(pin));
        }
        Ok(self.push(&[OP_DIO_PIN, pin]))
    }

    pub fn dio_mode(self, mode: u8) -> Result<Self> {
        if mode > MAX_DIO_MODE {
            return Err(BridgeError::ModeOutOfRange(mode));
        }
        Ok(self.push(&[OP_DIO_MODE, mode]))
    }

    pub fn dio_read(self) -> Self {
        self.push(&[OP_DIO_READ])
    }

    pub fn dio_write(self, level: u8) -> Result<Self> {
        if level > 1 {
            return Err(BridgeError::LevelOutOfRange(level));
        }
        Ok(self.push(&[OP_DIO_WRITE, level]))
    }

    pub fn neopixel(self, color: Rgb) -> Self {
        self.push(&[OP_NEOPIXEL, color.r, color.g, color.b])
    }

    pub fn handshake(self) -> Self {
        self.push(&HANDSHAKE)
    }

    pub fn bus_count_query(self) -> Self {
        self.push(&[OP_BUS_COUNT])
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// NeoPixel color with each channel already range-checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

impl TryFrom<(i64, i64, i64)> for Rgb {
    type Error = BridgeError;

    fn try_from((r, g, b): (i64, i64, i64)) -> Result<Self> {
        let channel = |v: i64| u8::try_from(v).map_err(|_| BridgeError::ColorOutOfRange(v));
        Ok(Self::new(channel(r)?, channel(g)?, channel(b)?))
    }
}
