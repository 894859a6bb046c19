use std::ops::Range;
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

/// Default serial baud rate for ARK bridges
pub const DEFAULT_BAUD: u32 = 115200;

/// Timing and scan parameters shared by every session opened through one
/// [`Enumerator`](crate::Enumerator).
///
/// All waits in the driver are bounded polling loops; the budgets here are
/// their deadlines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub baud: u32,
    /// Per-read timeout handed to the serial port itself.
    pub port_timeout_ms: u64,
    /// Sleep between polls of the input buffer.
    pub poll_interval_us: u64,
    /// Budget for one handshake reply.
    pub handshake_timeout_ms: u64,
    pub handshake_attempts: u32,
    /// Base budget for a write acknowledgement.
    pub ack_timeout_ms: u64,
    /// Base budget for a read reply.
    pub read_timeout_ms: u64,
    /// Added to ack/read budgets for every byte moved.
    pub per_byte_timeout_us: u64,
    /// Budget for any single BLE response or event.
    pub ble_response_timeout_ms: u64,
    /// How long the BLE dongle scans for advertising bridges.
    pub ble_scan_ms: u64,
    pub ble_connect_timeout_ms: u64,
    /// First I2C address probed during enumeration.
    pub scan_start: u8,
    /// One past the last I2C address probed during enumeration.
    pub scan_end: u8,
    /// Register written by the presence probe.
    pub probe_register: u8,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            baud: DEFAULT_BAUD,
            port_timeout_ms: 1000,
            poll_interval_us: 200,
            handshake_timeout_ms: 100,
            handshake_attempts: 5,
            ack_timeout_ms: 10,
            read_timeout_ms: 10,
            per_byte_timeout_us: 500,
            ble_response_timeout_ms: 1000,
            ble_scan_ms: 500,
            ble_connect_timeout_ms: 3000,
            scan_start: 8,
            scan_end: 120,
            probe_register: 0xDD,
        }
    }
}

impl BridgeConfig {
    /// Defaults overlaid with any `ARK_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` yields for each `ARK_*` key.
    ///
    /// Byte-sized fields also accept `0x`-prefixed hex (`ARK_SCAN_END=0x78`).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let lookup: &dyn Fn(&str) -> Option<String> = &lookup;
        overlay(lookup, "ARK_BAUD", &mut config.baud);
        overlay(lookup, "ARK_PORT_TIMEOUT_MS", &mut config.port_timeout_ms);
        overlay(lookup, "ARK_POLL_INTERVAL_US", &mut config.poll_interval_us);
        overlay(lookup, "ARK_HANDSHAKE_TIMEOUT_MS", &mut config.handshake_timeout_ms);
        overlay(lookup, "ARK_HANDSHAKE_ATTEMPTS", &mut config.handshake_attempts);
        overlay(lookup, "ARK_ACK_TIMEOUT_MS", &mut config.ack_timeout_ms);
        overlay(lookup, "ARK_READ_TIMEOUT_MS", &mut config.read_timeout_ms);
        overlay(lookup, "ARK_PER_BYTE_TIMEOUT_US", &mut config.per_byte_timeout_us);
        overlay(lookup, "ARK_BLE_TIMEOUT_MS", &mut config.ble_response_timeout_ms);
        overlay(lookup, "ARK_BLE_SCAN_MS", &mut config.ble_scan_ms);
        overlay(lookup, "ARK_BLE_CONNECT_TIMEOUT_MS", &mut config.ble_connect_timeout_ms);
        overlay_byte(lookup, "ARK_SCAN_START", &mut config.scan_start);
        overlay_byte(lookup, "ARK_SCAN_END", &mut config.scan_end);
        overlay_byte(lookup, "ARK_PROBE_REGISTER", &mut config.probe_register);
        config
    }

    pub fn port_timeout(&self) -> Duration {
        Duration::from_millis(self.port_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn ble_response_timeout(&self) -> Duration {
        Duration::from_millis(self.ble_response_timeout_ms)
    }

    pub fn ble_scan(&self) -> Duration {
        Duration::from_millis(self.ble_scan_ms)
    }

    pub fn ble_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.ble_connect_timeout_ms)
    }

    /// Deadline for an acknowledgement after sending `bytes` of frame.
    pub fn ack_budget(&self, bytes: usize) -> Duration {
        Duration::from_millis(self.ack_timeout_ms) + self.per_byte(bytes)
    }

    /// Deadline for `length` bytes of read data.
    pub fn read_budget(&self, length: usize) -> Duration {
        Duration::from_millis(self.read_timeout_ms) + self.per_byte(length)
    }

    pub fn scan_range(&self) -> Range<u8> {
        self.scan_start..self.scan_end
    }

    fn per_byte(&self, bytes: usize) -> Duration {
        Duration::from_micros(self.per_byte_timeout_us.saturating_mul(bytes as u64))
    }
}

fn overlay<T: std::str::FromStr>(lookup: &dyn Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *slot = value,
            Err(_) => warn!("ignoring unparsable {}={:?}", key, raw),
        }
    }
}

fn overlay_byte(lookup: &dyn Fn(&str) -> Option<String>, key: &str, slot: &mut u8) {
    if let Some(raw) = lookup(key) {
        let trimmed = raw.trim();
        let parsed = match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
            Some(hex) => u8::from_str_radix(hex, 16),
            None => trimmed.parse(),
        };
        match parsed {
            Ok(value) => *slot = value,
            Err(_) => warn!("ignoring unparsable {}={:?}", key, raw),
        }
    }
}
