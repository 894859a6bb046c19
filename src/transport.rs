//! Transport variants carrying command frames to a bridge.
//!
//! A bridge is either wired to the serial port directly, or reached through
//! a BLE dongle on that port which relays GATT writes/reads to it. Sessions
//! only see the [`Transport`] trait and never care which one they hold.

use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::ble;
use crate::chunker::PayloadLimits;
use crate::codec;
use crate::config::BridgeConfig;
use crate::errors::{BleError, BridgeError, Result};
use crate::link::{self, SharedLink};

/// GATT coordinates of a bridge behind a BLE dongle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BleContext {
    pub connection: u8,
    /// Handle commands are written to.
    pub tx_handle: u16,
    /// Handle replies are read from.
    pub rx_handle: u16,
}

/// Which transport variant a bridge sits behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    DirectSerial,
    BleRelay(BleContext),
}

impl TransportKind {
    pub fn limits(&self) -> PayloadLimits {
        match self {
            TransportKind::DirectSerial => PayloadLimits::SERIAL,
            TransportKind::BleRelay(_) => PayloadLimits::BLE,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::DirectSerial => write!(f, "serial"),
            TransportKind::BleRelay(ctx) => write!(f, "BLE {}", ctx.connection),
        }
    }
}

/// Send/receive capability shared by both transport variants.
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Name of the underlying port.
    fn port(&self) -> String;

    /// Deliver one frame. Returns once the bridge can accept the next one.
    fn send(&mut self, frame: &[u8]) -> Result<()>;

    /// Collect the bridge's reply and return its trailing `expected` bytes.
    ///
    /// Fails with [`BridgeError::Timeout`] carrying the number of bytes that
    /// did arrive if fewer than `expected` show up within `budget`.
    fn receive(&mut self, expected: usize, budget: Duration) -> Result<Vec<u8>>;

    /// Release the bridge and this transport's hold on the port, even when
    /// the release itself fails. The port closes once no transport holds it.
    fn close(&mut self) -> Result<()>;
}

/// The link of a transport that has not been closed yet.
fn held(link: &Option<SharedLink>) -> Result<&SharedLink> {
    link.as_ref().ok_or(BridgeError::Closed)
}

fn tail(mut data: Vec<u8>, expected: usize) -> Vec<u8> {
    let start = data.len().saturating_sub(expected);
    data.drain(..start);
    data
}

// ============================================================================
// Direct serial
// ============================================================================

/// Frames go to the port as-is and replies are raw bytes.
pub struct DirectSerial {
    link: Option<SharedLink>,
    port: String,
    poll: Duration,
}

impl DirectSerial {
    pub fn new(link: SharedLink, config: &BridgeConfig) -> Self {
        let port = link::lock(&link).name().to_string();
        Self {
            link: Some(link),
            port,
            poll: config.poll_interval(),
        }
    }
}

impl Transport for DirectSerial {
    fn kind(&self) -> TransportKind {
        TransportKind::DirectSerial
    }

    fn port(&self) -> String {
        self.port.clone()
    }

    fn send(&mut self, frame: &[u8]) -> Result<()> {
        let mut link = link::lock(held(&self.link)?);
        // Stale bytes from an earlier timed-out exchange would be read as this reply.
        link.clear()?;
        debug!("writing {}", codec::spaced(frame));
        link.write_all(frame)?;
        link.flush()
    }

    fn receive(&mut self, expected: usize, budget: Duration) -> Result<Vec<u8>> {
        let mut link = link::lock(held(&self.link)?);
        let deadline = Instant::now() + budget;
        let data = link::read_within(&mut **link, expected, deadline, self.poll)?;
        debug!("read back {}", codec::spaced(&data));
        if data.len() < expected {
            return Err(BridgeError::Timeout {
                waiting_for: format!("{expected} byte reply"),
                received: data.len(),
            });
        }
        Ok(data)
    }

    fn close(&mut self) -> Result<()> {
        match self.link.take() {
            Some(shared) => {
                debug!("releasing {}", self.port);
                let mut link = link::lock(&shared);
                link.flush()
            }
            None => Ok(()),
        }
    }
}

// ============================================================================
// BLE relay
// ============================================================================

/// Frames are tunnelled through a BLE dongle as GATT attribute writes, and
/// replies fetched with a long read of the bridge's reply characteristic.
pub struct BleRelay {
    link: Option<SharedLink>,
    port: String,
    context: BleContext,
    poll: Duration,
    timeout: Duration,
}

impl BleRelay {
    pub fn new(link: SharedLink, context: BleContext, config: &BridgeConfig) -> Self {
        let port = link::lock(&link).name().to_string();
        Self {
            link: Some(link),
            port,
            context,
            poll: config.poll_interval(),
            timeout: config.ble_response_timeout(),
        }
    }

    pub fn context(&self) -> BleContext {
        self.context
    }

    /// Wait for the dongle to report the attribute write as completed.
    fn confirm_write(&self, link: &mut dyn link::Link) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let connection = self.context.connection;
        let packet = ble::wait_for(link, deadline, self.poll, |p| {
            p.id == ble::EVT_ATTCLIENT_PROCEDURE_COMPLETED
                && p.payload.first() == Some(&connection)
        })?
        .ok_or_else(|| BridgeError::Timeout {
            waiting_for: "attribute write confirmation".into(),
            received: 0,
        })?;
        let done = ble::ProcedureCompleted::decode(&packet.payload)?;
        if !done.succeeded() {
            return Err(BleError::ProcedureFailed {
                result: done.result,
            }
            .into());
        }
        Ok(())
    }
}

impl Transport for BleRelay {
    fn kind(&self) -> TransportKind {
        TransportKind::BleRelay(self.context)
    }

    fn port(&self) -> String {
        self.port.clone()
    }

    fn send(&mut self, frame: &[u8]) -> Result<()> {
        let mut guard = link::lock(held(&self.link)?);
        let link: &mut dyn link::Link = &mut **guard;
        debug!(
            "writing {} via BLE connection {}",
            codec::spaced(frame),
            self.context.connection
        );
        // One attribute write at a time: the next goes out only after the
        // dongle confirms the previous one.
        for piece in frame.chunks(ble::MAX_ATTRIBUTE_WRITE) {
            let packet =
                ble::attclient_attribute_write(self.context.connection, self.context.tx_handle, piece);
            ble::send(link, &packet)?;
            self.confirm_write(link)?;
        }
        Ok(())
    }

    fn receive(&mut self, expected: usize, budget: Duration) -> Result<Vec<u8>> {
        let mut guard = link::lock(held(&self.link)?);
        let link: &mut dyn link::Link = &mut **guard;
        let connection = self.context.connection;
        ble::send(
            link,
            &ble::attclient_read_long(connection, self.context.rx_handle),
        )?;

        let deadline = Instant::now() + budget.max(self.timeout);
        let mut value = Vec::new();
        loop {
            let packet = ble::wait_for(link, deadline, self.poll, |p| {
                (p.id == ble::EVT_ATTCLIENT_ATTRIBUTE_VALUE
                    || p.id == ble::EVT_ATTCLIENT_PROCEDURE_COMPLETED)
                    && p.payload.first() == Some(&connection)
            })?;
            match packet {
                Some(p) if p.id == ble::EVT_ATTCLIENT_ATTRIBUTE_VALUE => {
                    trace!("attribute value {}", codec::spaced(&p.payload));
                    value.extend_from_slice(ble::attribute_value(&p.payload)?);
                }
                Some(_) => break,
                None => {
                    return Err(BridgeError::Timeout {
                        waiting_for: "BLE read completion".into(),
                        received: value.len(),
                    })
                }
            }
        }

        debug!("read back {}", codec::spaced(&value));
        if value.len() < expected {
            return Err(BridgeError::Timeout {
                waiting_for: format!("{expected} byte reply"),
                received: value.len(),
            });
        }
        Ok(tail(value, expected))
    }

    fn close(&mut self) -> Result<()> {
        // Dropped on every return path below, including a failed disconnect.
        let Some(shared) = self.link.take() else {
            return Ok(());
        };
        let mut guard = link::lock(&shared);
        let link: &mut dyn link::Link = &mut **guard;
        let connection = self.context.connection;
        debug!("disconnecting BLE connection {}", connection);
        ble::send(link, &ble::connection_disconnect(connection))?;

        let deadline = Instant::now() + self.timeout;
        let packet = ble::wait_for(link, deadline, self.poll, |p| {
            (p.id == ble::RSP_CONNECTION_DISCONNECT || p.id == ble::EVT_CONNECTION_DISCONNECTED)
                && p.payload.first() == Some(&connection)
        })?
        .ok_or_else(|| BridgeError::DisconnectFailed(format!("connection {connection}: no reply")))?;

        if packet.id == ble::RSP_CONNECTION_DISCONNECT {
            let result = packet
                .payload
                .get(1..3)
                .map(|r| u16::from_le_bytes([r[0], r[1]]))
                .unwrap_or(u16::MAX);
            if result != 0 {
                return Err(BridgeError::DisconnectFailed(format!(
                    "connection {connection}: result 0x{result:04X}"
                )));
            }
        }
        Ok(())
    }
}
