use std::io;
use thiserror::Error;

/// Operation completed.
pub const STATUS_OK: u8 = 0;
/// Operation failed; see the accompanying error.
pub const STATUS_ERROR: u8 = 1;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("ble error: {0}")]
    Ble(#[from] BleError),
    #[error("malformed hex string: {0}")]
    MalformedHex(String),
    #[error("I2C address 0x{0:02X} out of range (max 0x7F)")]
    AddressOutOfRange(u8),
    #[error("I2C bus {bus} out of range (device has {bus_count})")]
    BusOutOfRange { bus: u8, bus_count: u8 },
    #[error("I2C clock {0} out of range (1-100)")]
    ClockOutOfRange(u8),
    #[error("digital IO pin {0} out of range (2-13)")]
    PinOutOfRange(u8),
    #[error("digital IO mode {0} out of range (0-2)")]
    ModeOutOfRange(u8),
    #[error("digital IO level {0} out of range (0-1)")]
    LevelOutOfRange(u8),
    #[error("color channel {0} out of range (0-255)")]
    ColorOutOfRange(i64),
    #[error("write payload of {len} bytes does not fit one frame (max {max})")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("{operation} unsupported: {reason}")]
    UnsupportedOnTransport {
        operation: &'static str,
        reason: String,
    },
    #[error("timed out waiting for {waiting_for} ({received} bytes received)")]
    Timeout { waiting_for: String, received: usize },
    #[error("incomplete read: received {received} of {requested} bytes")]
    IncompleteRead { requested: usize, received: usize },
    #[error("write of {attempted} bytes not acknowledged (response {response:02X?})")]
    NAck {
        attempted: usize,
        response: Option<u8>,
    },
    #[error("session closed")]
    Closed,
    #[error("disconnect failed: {0}")]
    DisconnectFailed(String),
    #[error("port {port} unavailable: {reason}")]
    PortUnavailable { port: String, reason: String },
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl BridgeError {
    /// Number of bytes the failed operation moved or attempted, if it reports one.
    pub fn count(&self) -> Option<usize> {
        match self {
            BridgeError::NAck { attempted, .. } => Some(*attempted),
            BridgeError::IncompleteRead { received, .. } => Some(*received),
            BridgeError::Timeout { received, .. } => Some(*received),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum BleError {
    #[error("malformed packet: {0}")]
    Malformed(String),
    #[error("procedure failed with result 0x{result:04X}")]
    ProcedureFailed { result: u16 },
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
