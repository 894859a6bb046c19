//! Packet layer of the serial-attached BLE dongle.
//!
//! When a bridge is reached over BLE, the host talks to a BLE dongle on the
//! serial port and the dongle relays GATT operations to the bridge. Every
//! command, response and event on that serial port is one packet:
//!
//! ```text
//! byte 0: message type (bit 7) | technology (bits 6..3) | length[10:8]
//! byte 1: length[7:0]
//! byte 2: class
//! byte 3: command
//! then `length` payload bytes (multi-byte integers little-endian)
//! ```
//!
//! UUIDs are kept big-endian (as printed) in this module and reversed on the
//! wire.

use std::time::{Duration, Instant};

use log::trace;

use crate::codec;
use crate::errors::{BleError, BridgeError, Result};
use crate::link::{self, Link};

pub const HEADER_LEN: usize = 4;
/// Largest value carried by one attribute write.
pub const MAX_ATTRIBUTE_WRITE: usize = 20;
/// Bytes preceding the value in an attribute value event.
pub const ATTRIBUTE_VALUE_ENVELOPE: usize = 5;

const MAX_PAYLOAD: usize = 0x7FF;

/// Identity of a packet: the tuple responses and events are matched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketId {
    pub message_type: u8,
    pub technology: u8,
    pub class: u8,
    pub command: u8,
}

impl PacketId {
    pub const fn new(message_type: u8, technology: u8, class: u8, command: u8) -> Self {
        Self {
            message_type,
            technology,
            class,
            command,
        }
    }

    const fn command(class: u8, command: u8) -> Self {
        Self::new(0, 0, class, command)
    }

    const fn event(class: u8, command: u8) -> Self {
        Self::new(1, 0, class, command)
    }
}

// Responses share their command's identity.
pub const RSP_SYSTEM_GET_INFO: PacketId = PacketId::command(0, 8);
pub const RSP_CONNECTION_DISCONNECT: PacketId = PacketId::command(3, 0);
pub const RSP_GAP_SET_MODE: PacketId = PacketId::command(6, 1);
pub const RSP_GAP_DISCOVER: PacketId = PacketId::command(6, 2);
pub const RSP_GAP_CONNECT_DIRECT: PacketId = PacketId::command(6, 3);
pub const RSP_GAP_END_PROCEDURE: PacketId = PacketId::command(6, 4);
pub const RSP_GAP_SET_SCAN_PARAMETERS: PacketId = PacketId::command(6, 7);
pub const RSP_ATTCLIENT_READ_BY_GROUP_TYPE: PacketId = PacketId::command(4, 1);
pub const RSP_ATTCLIENT_FIND_INFORMATION: PacketId = PacketId::command(4, 3);
pub const RSP_ATTCLIENT_ATTRIBUTE_WRITE: PacketId = PacketId::command(4, 5);
pub const RSP_ATTCLIENT_READ_LONG: PacketId = PacketId::command(4, 8);

pub const EVT_CONNECTION_STATUS: PacketId = PacketId::event(3, 0);
pub const EVT_CONNECTION_DISCONNECTED: PacketId = PacketId::event(3, 4);
pub const EVT_ATTCLIENT_PROCEDURE_COMPLETED: PacketId = PacketId::event(4, 1);
pub const EVT_ATTCLIENT_GROUP_FOUND: PacketId = PacketId::event(4, 2);
pub const EVT_ATTCLIENT_FIND_INFORMATION_FOUND: PacketId = PacketId::event(4, 4);
pub const EVT_ATTCLIENT_ATTRIBUTE_VALUE: PacketId = PacketId::event(4, 5);
pub const EVT_GAP_SCAN_RESPONSE: PacketId = PacketId::event(6, 0);

/// Primary service declaration.
pub const UUID_PRIMARY_SERVICE: [u8; 2] = [0x28, 0x00];
/// Nordic UART service advertised by BLE bridges.
pub const UUID_UART_SERVICE: [u8; 16] = [
    0x6e, 0x40, 0x00, 0x01, 0xb5, 0xa3, 0xf3, 0x93, 0xe0, 0xa9, 0xe5, 0x0e, 0x24, 0xdc, 0xca, 0x9e,
];
/// Characteristic the host writes commands to.
pub const UUID_UART_TX: [u8; 16] = [
    0x6e, 0x40, 0x00, 0x02, 0xb5, 0xa3, 0xf3, 0x93, 0xe0, 0xa9, 0xe5, 0x0e, 0x24, 0xdc, 0xca, 0x9e,
];
/// Characteristic the host reads replies from.
pub const UUID_UART_RX: [u8; 16] = [
    0x6e, 0x40, 0x00, 0x03, 0xb5, 0xa3, 0xf3, 0x93, 0xe0, 0xa9, 0xe5, 0x0e, 0x24, 0xdc, 0xca, 0x9e,
];

/// Connection status flag bits that mean "connected and completed".
const CONNECTED_FLAGS: u8 = 0x05;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlePacket {
    pub id: PacketId,
    pub payload: Vec<u8>,
}

impl BlePacket {
    pub fn new(id: PacketId, payload: Vec<u8>) -> Self {
        Self { id, payload }
    }

    pub fn encode(&self) -> Vec<u8> {
        let len = self.payload.len();
        debug_assert!(len <= MAX_PAYLOAD);
        let mut out = Vec::with_capacity(HEADER_LEN + len);
        out.push(
            (self.id.message_type & 0x01) << 7
                | (self.id.technology & 0x0F) << 3
                | ((len >> 8) as u8 & 0x07),
        );
        out.push(len as u8);
        out.push(self.id.class);
        out.push(self.id.command);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode one complete packet.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header: [u8; HEADER_LEN] = bytes
            .get(..HEADER_LEN)
            .and_then(|h| h.try_into().ok())
            .ok_or_else(|| malformed(format!("short header: {}", codec::spaced(bytes))))?;
        let (id, len) = parse_header(&header);
        let payload = &bytes[HEADER_LEN..];
        if payload.len() != len {
            return Err(malformed(format!(
                "payload length {} does not match header length {}",
                payload.len(),
                len
            )));
        }
        Ok(Self::new(id, payload.to_vec()))
    }
}

/// Split a header into the packet identity and payload length.
pub fn parse_header(h: &[u8; HEADER_LEN]) -> (PacketId, usize) {
    let id = PacketId::new(h[0] >> 7, (h[0] & 0x78) >> 3, h[2], h[3]);
    let len = (((h[0] & 0x07) as usize) << 8) + h[1] as usize;
    (id, len)
}

fn malformed(msg: String) -> BridgeError {
    BridgeError::Ble(BleError::Malformed(msg))
}

fn u16_at(p: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([p[at], p[at + 1]])
}

fn require(p: &[u8], len: usize, what: &str) -> Result<()> {
    if p.len() < len {
        return Err(malformed(format!(
            "{what} payload too short ({} < {len})",
            p.len()
        )));
    }
    Ok(())
}

/// Wire order of a big-endian UUID.
fn wire_uuid(uuid: &[u8]) -> Vec<u8> {
    uuid.iter().rev().copied().collect()
}

// ============================================================================
// Commands
// ============================================================================

pub fn system_get_info() -> BlePacket {
    BlePacket::new(RSP_SYSTEM_GET_INFO, vec![])
}

pub fn connection_disconnect(connection: u8) -> BlePacket {
    BlePacket::new(RSP_CONNECTION_DISCONNECT, vec![connection])
}

pub fn gap_set_mode(discover: u8, connect: u8) -> BlePacket {
    BlePacket::new(RSP_GAP_SET_MODE, vec![discover, connect])
}

pub fn gap_end_procedure() -> BlePacket {
    BlePacket::new(RSP_GAP_END_PROCEDURE, vec![])
}

pub fn gap_set_scan_parameters(interval: u16, window: u16, active: u8) -> BlePacket {
    let mut p = Vec::with_capacity(5);
    p.extend_from_slice(&interval.to_le_bytes());
    p.extend_from_slice(&window.to_le_bytes());
    p.push(active);
    BlePacket::new(RSP_GAP_SET_SCAN_PARAMETERS, p)
}

pub fn gap_discover(mode: u8) -> BlePacket {
    BlePacket::new(RSP_GAP_DISCOVER, vec![mode])
}

pub fn gap_connect_direct(
    address: [u8; 6],
    address_type: u8,
    interval_min: u16,
    interval_max: u16,
    timeout: u16,
    latency: u16,
) -> BlePacket {
    let mut p = Vec::with_capacity(15);
    p.extend_from_slice(&address);
    p.push(address_type);
    for v in [interval_min, interval_max, timeout, latency] {
        p.extend_from_slice(&v.to_le_bytes());
    }
    BlePacket::new(RSP_GAP_CONNECT_DIRECT, p)
}

pub fn attclient_read_by_group_type(connection: u8, start: u16, end: u16, uuid: &[u8]) -> BlePacket {
    let mut p = vec![connection];
    p.extend_from_slice(&start.to_le_bytes());
    p.extend_from_slice(&end.to_le_bytes());
    p.push(uuid.len() as u8);
    p.extend(wire_uuid(uuid));
    BlePacket::new(RSP_ATTCLIENT_READ_BY_GROUP_TYPE, p)
}

pub fn attclient_find_information(connection: u8, start: u16, end: u16) -> BlePacket {
    let mut p = vec![connection];
    p.extend_from_slice(&start.to_le_bytes());
    p.extend_from_slice(&end.to_le_bytes());
    BlePacket::new(RSP_ATTCLIENT_FIND_INFORMATION, p)
}

pub fn attclient_attribute_write(connection: u8, handle: u16, data: &[u8]) -> BlePacket {
    let mut p = vec![connection];
    p.extend_from_slice(&handle.to_le_bytes());
    p.push(data.len() as u8);
    p.extend_from_slice(data);
    BlePacket::new(RSP_ATTCLIENT_ATTRIBUTE_WRITE, p)
}

pub fn attclient_read_long(connection: u8, handle: u16) -> BlePacket {
    let mut p = vec![connection];
    p.extend_from_slice(&handle.to_le_bytes());
    BlePacket::new(RSP_ATTCLIENT_READ_LONG, p)
}

// ============================================================================
// Events
// ============================================================================

/// Advertisement seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResponse {
    pub rssi: i8,
    pub sender: [u8; 6],
    pub address_type: u8,
    pub data: Vec<u8>,
}

impl ScanResponse {
    pub fn decode(p: &[u8]) -> Result<Self> {
        require(p, 11, "scan response")?;
        let mut sender = [0u8; 6];
        sender.copy_from_slice(&p[2..8]);
        Ok(Self {
            rssi: p[0] as i8,
            sender,
            address_type: p[8],
            data: p[11..].to_vec(),
        })
    }

    /// Service UUIDs listed in the advertising data, big-endian.
    pub fn services(&self) -> Vec<Vec<u8>> {
        let mut services = Vec::new();
        let mut rest = self.data.as_slice();
        while let Some((&len, tail)) = rest.split_first() {
            let len = len as usize;
            if len == 0 || tail.len() < len {
                break;
            }
            let (field, next) = tail.split_at(len);
            rest = next;

            let width = match field[0] {
                0x02 | 0x03 => 2,
                0x04 | 0x05 => 4,
                0x06 | 0x07 => 16,
                _ => continue,
            };
            services.extend(field[1..].chunks_exact(width).map(wire_uuid));
        }
        services
    }

    pub fn advertises(&self, uuid: &[u8]) -> bool {
        self.services().iter().any(|s| s == uuid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub connection: u8,
    pub flags: u8,
}

impl ConnectionStatus {
    pub fn decode(p: &[u8]) -> Result<Self> {
        require(p, 2, "connection status")?;
        Ok(Self {
            connection: p[0],
            flags: p[1],
        })
    }

    pub fn is_connected(&self) -> bool {
        self.flags & CONNECTED_FLAGS == CONNECTED_FLAGS
    }
}

/// Service group reported by a read-by-group-type procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupFound {
    pub connection: u8,
    pub start: u16,
    pub end: u16,
    pub uuid: Vec<u8>,
}

impl GroupFound {
    pub fn decode(p: &[u8]) -> Result<Self> {
        require(p, 6, "group found")?;
        Ok(Self {
            connection: p[0],
            start: u16_at(p, 1),
            end: u16_at(p, 3),
            uuid: wire_uuid(&p[6..]),
        })
    }
}

/// Attribute handle reported by a find-information procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InformationFound {
    pub connection: u8,
    pub handle: u16,
    pub uuid: Vec<u8>,
}

impl InformationFound {
    pub fn decode(p: &[u8]) -> Result<Self> {
        require(p, 4, "information found")?;
        Ok(Self {
            connection: p[0],
            handle: u16_at(p, 1),
            uuid: wire_uuid(&p[4..]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcedureCompleted {
    pub connection: u8,
    pub result: u16,
}

impl ProcedureCompleted {
    pub fn decode(p: &[u8]) -> Result<Self> {
        require(p, 3, "procedure completed")?;
        Ok(Self {
            connection: p[0],
            result: u16_at(p, 1),
        })
    }

    pub fn succeeded(&self) -> bool {
        self.result == 0
    }
}

/// Strip the envelope from an attribute value event, leaving the value.
pub fn attribute_value(p: &[u8]) -> Result<&[u8]> {
    require(p, ATTRIBUTE_VALUE_ENVELOPE, "attribute value")?;
    Ok(&p[ATTRIBUTE_VALUE_ENVELOPE..])
}

// ============================================================================
// Link helpers
// ============================================================================

/// Write one packet to the dongle.
pub fn send(link: &mut dyn Link, packet: &BlePacket) -> Result<()> {
    let bytes = packet.encode();
    trace!("ble tx {}", codec::spaced(&bytes));
    link.write_all(&bytes)?;
    link.flush()
}

/// Read the next packet, or `None` if no header arrives before `deadline`.
pub fn read_packet(
    link: &mut dyn Link,
    deadline: Instant,
    poll: Duration,
) -> Result<Option<BlePacket>> {
    if !link::wait_available(link, HEADER_LEN, deadline, poll)? {
        return Ok(None);
    }
    let header = link::read_within(link, HEADER_LEN, deadline, poll)?;
    let header: [u8; HEADER_LEN] = header
        .try_into()
        .map_err(|h: Vec<u8>| malformed(format!("short header: {}", codec::spaced(&h))))?;
    let (id, len) = parse_header(&header);
    let payload = link::read_within(link, len, deadline, poll)?;
    if payload.len() < len {
        return Err(BridgeError::Timeout {
            waiting_for: format!("{len} byte BLE payload"),
            received: payload.len(),
        });
    }
    trace!("ble rx {:?} {}", id, codec::spaced(&payload));
    Ok(Some(BlePacket::new(id, payload)))
}

/// Read packets until one satisfies `accept`, ignoring the rest.
///
/// Events from other procedures interleave freely with the ones awaited, so
/// anything else is dropped. Returns `None` on deadline.
pub fn wait_for<F>(
    link: &mut dyn Link,
    deadline: Instant,
    poll: Duration,
    mut accept: F,
) -> Result<Option<BlePacket>>
where
    F: FnMut(&BlePacket) -> bool,
{
    while let Some(packet) = read_packet(link, deadline, poll)? {
        if accept(&packet) {
            return Ok(Some(packet));
        }
        trace!("ble ignoring {:?}", packet.id);
    }
    Ok(None)
}

/// Scan response payload advertising the UART service, for tests.
#[cfg(test)]
pub(crate) fn uart_advertisement(sender: [u8; 6]) -> Vec<u8> {
    let mut p = vec![0xC4, 0x00];
    p.extend_from_slice(&sender);
    p.extend_from_slice(&[0x01, 0xFF]);
    let mut ad = vec![0x02, 0x01, 0x06, 17, 0x07];
    ad.extend(wire_uuid(&UUID_UART_SERVICE));
    p.push(ad.len() as u8);
    p.extend(ad);
    p
}

/// Wire order of a big-endian UUID, for tests building events.
#[cfg(test)]
pub(crate) fn to_wire(uuid: &[u8]) -> Vec<u8> {
    wire_uuid(uuid)
}
