//! Simulated ARK bridge speaking the serial opcode protocol, and a simulated
//! BLE dongle relaying GATT traffic to such bridges.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use ark_bridge::ble::{self, BlePacket, PacketId};
use ark_bridge::{share, BridgeConfig, Link, Result, SharedLink, WRITE_ACK};

/// Reply byte for a write nobody acknowledged.
pub const WRITE_NACK: u8 = 0x02;

pub fn fast_config() -> BridgeConfig {
    BridgeConfig {
        poll_interval_us: 50,
        handshake_timeout_ms: 20,
        handshake_attempts: 2,
        ble_response_timeout_ms: 5,
        ble_connect_timeout_ms: 5,
        ble_scan_ms: 1,
        ..BridgeConfig::default()
    }
}

#[derive(Debug, Clone)]
pub struct Target {
    pub memory: Vec<u8>,
    pub pointer: u8,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            memory: vec![0; 256],
            pointer: 0,
        }
    }
}

#[derive(Debug)]
pub struct BridgeState {
    pub handshake: Vec<u8>,
    /// `None` for firmware that ignores the bus count query.
    pub bus_count: Option<u8>,
    pub targets: HashMap<(u8, u8), Target>,
    /// Refuse every write, even to present targets.
    pub refuse_writes: bool,
    /// Cap on the bytes returned for any read.
    pub short_reads: Option<usize>,
    /// Fail every write on the link itself.
    pub broken: bool,
    /// Fail the link write of any frame selecting this address.
    pub glitch_address: Option<u8>,

    pub frames: Vec<Vec<u8>>,
    pub clock: Option<u8>,
    pub pullup: Option<bool>,
    pub pin_modes: HashMap<u8, u8>,
    pub pin_levels: HashMap<u8, u8>,
    pub color: Option<[u8; 3]>,

    rx: VecDeque<u8>,
    bus: u8,
    address: u8,
    length: u8,
    pin: u8,
    write_ok: bool,
}

impl Default for BridgeState {
    fn default() -> Self {
        Self {
            handshake: b"zz181025".to_vec(),
            bus_count: Some(1),
            targets: HashMap::new(),
            refuse_writes: false,
            short_reads: None,
            broken: false,
            glitch_address: None,
            frames: Vec::new(),
            clock: None,
            pullup: None,
            pin_modes: HashMap::new(),
            pin_levels: HashMap::new(),
            color: None,
            rx: VecDeque::new(),
            bus: 0,
            address: 0,
            length: 0,
            pin: 0,
            write_ok: true,
        }
    }
}

impl BridgeState {
    fn target(&mut self) -> Option<&mut Target> {
        self.targets.get_mut(&(self.bus, self.address))
    }

    /// Interpret one frame; unknown bytes are skipped like the firmware does.
    fn execute(&mut self, frame: &[u8]) {
        let mut bytes = frame.iter().copied();
        while let Some(op) = bytes.next() {
            match op {
                0x5A => {
                    if bytes.next() == Some(0x5A) {
                        let reply = self.handshake.clone();
                        self.rx.extend(reply);
                    }
                }
                0x62 => {
                    if let Some(count) = self.bus_count {
                        self.rx.push_back(count);
                    }
                }
                0x42 => self.bus = bytes.next().unwrap_or(0),
                0x41 => self.address = bytes.next().unwrap_or(0),
                0x4C => self.length = bytes.next().unwrap_or(0),
                0x57 | 0x77 => {
                    let register = bytes.next().unwrap_or(0);
                    let data: Vec<u8> = bytes
                        .by_ref()
                        .take(self.length.saturating_sub(1) as usize)
                        .collect();
                    let accepted = !self.refuse_writes
                        && match self.target() {
                            Some(target) => {
                                let mut at = register;
                                for b in data {
                                    target.memory[at as usize] = b;
                                    at = at.wrapping_add(1);
                                }
                                target.pointer = at;
                                true
                            }
                            None => false,
                        };
                    if !accepted {
                        self.write_ok = false;
                    }
                    if op == 0x57 {
                        let reply = if self.write_ok { WRITE_ACK } else { WRITE_NACK };
                        self.rx.push_back(reply);
                        self.write_ok = true;
                    }
                }
                0x52 | 0x72 => {
                    let length = self.length as usize;
                    let cap = self.short_reads.unwrap_or(usize::MAX);
                    self.write_ok = true;
                    if let Some(target) = self.target() {
                        let start = target.pointer;
                        let data: Vec<u8> = (0..length)
                            .map(|i| target.memory[start.wrapping_add(i as u8) as usize])
                            .collect();
                        target.pointer = start.wrapping_add(length as u8);
                        self.rx.extend(data.into_iter().take(cap));
                    }
                }
                0x43 => self.clock = bytes.next(),
                0x50 => self.pullup = Some(true),
                0x70 => self.pullup = Some(false),
                0x44 => self.pin = bytes.next().unwrap_or(0),
                0x4D => {
                    let mode = bytes.next().unwrap_or(0);
                    self.pin_modes.insert(self.pin, mode);
                }
                0x3C => {
                    let level = self.pin_levels.get(&self.pin).copied().unwrap_or(0);
                    self.rx.push_back(level);
                }
                0x3E => {
                    let level = bytes.next().unwrap_or(0);
                    self.pin_levels.insert(self.pin, level);
                }
                0x58 => {
                    let rgb: Vec<u8> = bytes.by_ref().take(3).collect();
                    if let &[r, g, b] = rgb.as_slice() {
                        self.color = Some([r, g, b]);
                    }
                }
                _ => {}
            }
        }
    }
}

/// Cloneable handle on a simulated bridge; clones share state.
#[derive(Clone, Default)]
pub struct SimulatedBridge {
    state: Arc<Mutex<BridgeState>>,
}

impl SimulatedBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device that acknowledges at (`bus`, `address`).
    pub fn with_target(self, bus: u8, address: u8) -> Self {
        self.state().targets.insert((bus, address), Target::default());
        self
    }

    pub fn with_bus_count(self, count: Option<u8>) -> Self {
        self.state().bus_count = count;
        self
    }

    pub fn with_firmware(self, version: &str) -> Self {
        self.state().handshake = format!("zz{version}").into_bytes();
        self
    }

    pub fn state(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap()
    }

    pub fn memory(&self, bus: u8, address: u8) -> Vec<u8> {
        self.state().targets[&(bus, address)].memory.clone()
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.state().frames.clone()
    }

    pub fn shared(&self) -> SharedLink {
        share(Box::new(self.clone()))
    }

    /// Hand one complete frame to the bridge firmware.
    fn deliver(&self, frame: &[u8]) -> Result<()> {
        let mut state = self.state();
        let glitch = state
            .glitch_address
            .is_some_and(|a| frame.windows(2).any(|w| w == [0x41, a]));
        if state.broken || glitch {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged").into());
        }
        state.frames.push(frame.to_vec());
        state.execute(frame);
        Ok(())
    }

    /// Everything the bridge has answered so far.
    fn take_reply(&self) -> Vec<u8> {
        self.state().rx.drain(..).collect()
    }
}

impl Link for SimulatedBridge {
    fn name(&self) -> &str {
        "sim"
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.deliver(bytes)
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state();
        let n = buf.len().min(state.rx.len());
        for (slot, b) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = b;
        }
        Ok(n)
    }

    fn bytes_available(&mut self) -> Result<usize> {
        Ok(self.state().rx.len())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.state().rx.clear();
        Ok(())
    }
}

/// Addresses found by a scan as (bus, address) pairs.
pub fn found(scan: &ark_bridge::ScanResult) -> HashSet<(u8, u8)> {
    scan.addresses().map(|a| (a.bus(), a.address())).collect()
}

// ============================================================================
// BLE dongle
// ============================================================================

pub const TX_HANDLE: u16 = 0x000E;
pub const RX_HANDLE: u16 = 0x0011;
const SERVICE_START: u16 = 0x000C;
const SERVICE_END: u16 = 0x001F;
/// Bytes of attribute value carried by one value event.
const VALUE_EVENT_LEN: usize = 22;

/// A bridge reachable through the dongle.
pub struct Peer {
    pub address: [u8; 6],
    pub bridge: SimulatedBridge,
    /// Result reported for attribute writes; nonzero fails the procedure.
    pub write_result: u16,
    pending: Vec<u8>,
}

#[derive(Default)]
pub struct DongleState {
    pub peers: Vec<Peer>,
    /// Host commands, in order.
    pub commands: Vec<BlePacket>,
    rx: VecDeque<u8>,
}

impl DongleState {
    fn emit(&mut self, id: PacketId, payload: Vec<u8>) {
        self.rx.extend(BlePacket::new(id, payload).encode());
    }

    fn completed(&mut self, connection: u8, result: u16, handle: u16) {
        let mut p = vec![connection];
        p.extend_from_slice(&result.to_le_bytes());
        p.extend_from_slice(&handle.to_le_bytes());
        self.emit(ble::EVT_ATTCLIENT_PROCEDURE_COMPLETED, p);
    }

    /// Connections are numbered from 1 in peer order.
    fn peer(&mut self, connection: u8) -> Option<&mut Peer> {
        self.peers.get_mut((connection as usize).checked_sub(1)?)
    }

    fn flush_pending(&mut self, connection: u8) -> Result<()> {
        if let Some(peer) = self.peer(connection) {
            let frame = std::mem::take(&mut peer.pending);
            if !frame.is_empty() {
                peer.bridge.deliver(&frame)?;
            }
        }
        Ok(())
    }

    fn handle(&mut self, packet: BlePacket) -> Result<()> {
        let id = packet.id;
        let p = packet.payload.clone();
        self.commands.push(packet);

        if id == ble::RSP_SYSTEM_GET_INFO {
            self.emit(id, vec![1, 0, 1, 0, 0, 0, 0, 0, 1, 1, 2, 1]);
        } else if id == ble::RSP_CONNECTION_DISCONNECT {
            self.emit(id, vec![p[0], 0, 0]);
        } else if id == ble::RSP_GAP_SET_MODE
            || id == ble::RSP_GAP_END_PROCEDURE
            || id == ble::RSP_GAP_SET_SCAN_PARAMETERS
        {
            self.emit(id, vec![0, 0]);
        } else if id == ble::RSP_GAP_DISCOVER {
            self.emit(id, vec![0, 0]);
            let senders: Vec<[u8; 6]> = self.peers.iter().map(|peer| peer.address).collect();
            for sender in senders {
                self.emit(ble::EVT_GAP_SCAN_RESPONSE, advertisement(sender));
            }
        } else if id == ble::RSP_GAP_CONNECT_DIRECT {
            let index = self.peers.iter().position(|peer| p[..6] == peer.address);
            if let Some(index) = index {
                let connection = index as u8 + 1;
                self.emit(id, vec![0, 0, connection]);
                let mut status = vec![connection, 0x05];
                status.extend_from_slice(&p[..7]);
                self.emit(ble::EVT_CONNECTION_STATUS, status);
            }
        } else if id == ble::RSP_ATTCLIENT_READ_BY_GROUP_TYPE {
            let connection = p[0];
            self.emit(id, vec![connection, 0, 0]);
            let mut group = vec![connection];
            group.extend_from_slice(&SERVICE_START.to_le_bytes());
            group.extend_from_slice(&SERVICE_END.to_le_bytes());
            group.push(16);
            group.extend(wire(&ble::UUID_UART_SERVICE));
            self.emit(ble::EVT_ATTCLIENT_GROUP_FOUND, group);
            self.completed(connection, 0, SERVICE_START);
        } else if id == ble::RSP_ATTCLIENT_FIND_INFORMATION {
            let connection = p[0];
            self.emit(id, vec![connection, 0, 0]);
            for (handle, uuid) in [(TX_HANDLE, ble::UUID_UART_TX), (RX_HANDLE, ble::UUID_UART_RX)] {
                let mut info = vec![connection];
                info.extend_from_slice(&handle.to_le_bytes());
                info.push(16);
                info.extend(wire(&uuid));
                self.emit(ble::EVT_ATTCLIENT_FIND_INFORMATION_FOUND, info);
            }
            self.completed(connection, 0, SERVICE_END);
        } else if id == ble::RSP_ATTCLIENT_ATTRIBUTE_WRITE {
            let connection = p[0];
            let handle = u16::from_le_bytes([p[1], p[2]]);
            let data = &p[4..];
            self.emit(id, vec![connection, 0, 0]);
            let result = self.peer(connection).map_or(0x0186, |peer| peer.write_result);
            if result == 0 {
                if let Some(peer) = self.peer(connection) {
                    peer.pending.extend_from_slice(data);
                }
                // A short piece ends a frame; a full one may be followed by more.
                if data.len() < ble::MAX_ATTRIBUTE_WRITE {
                    self.flush_pending(connection)?;
                }
            }
            self.completed(connection, result, handle);
        } else if id == ble::RSP_ATTCLIENT_READ_LONG {
            let connection = p[0];
            self.flush_pending(connection)?;
            let reply = self
                .peer(connection)
                .map(|peer| peer.bridge.take_reply())
                .unwrap_or_default();
            self.emit(id, vec![connection, 0, 0]);
            for piece in reply.chunks(VALUE_EVENT_LEN) {
                let mut value = vec![connection, p[1], p[2], 0x00, piece.len() as u8];
                value.extend_from_slice(piece);
                self.emit(ble::EVT_ATTCLIENT_ATTRIBUTE_VALUE, value);
            }
            self.completed(connection, 0, RX_HANDLE);
        }
        Ok(())
    }
}

/// Cloneable handle on a simulated dongle; clones share state.
#[derive(Clone, Default)]
pub struct SimulatedDongle {
    state: Arc<Mutex<DongleState>>,
}

impl SimulatedDongle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `bridge` reachable; it gets the next connection number.
    pub fn with_bridge(self, bridge: SimulatedBridge) -> Self {
        {
            let mut state = self.state();
            let n = state.peers.len() as u8;
            state.peers.push(Peer {
                address: [0xA0 + n, 0x11, 0x22, 0x33, 0x44, 0x55],
                bridge,
                write_result: 0,
                pending: Vec::new(),
            });
        }
        self
    }

    pub fn state(&self) -> MutexGuard<'_, DongleState> {
        self.state.lock().unwrap()
    }

    /// Values of every attribute write sent so far.
    pub fn attribute_writes(&self) -> Vec<Vec<u8>> {
        self.state()
            .commands
            .iter()
            .filter(|c| c.id == ble::RSP_ATTCLIENT_ATTRIBUTE_WRITE)
            .map(|c| c.payload[4..].to_vec())
            .collect()
    }

    pub fn shared(&self) -> SharedLink {
        share(Box::new(self.clone()))
    }
}

impl Link for SimulatedDongle {
    fn name(&self) -> &str {
        "dongle"
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let packet = BlePacket::decode(bytes)?;
        self.state().handle(packet)
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state();
        let n = buf.len().min(state.rx.len());
        for (slot, b) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = b;
        }
        Ok(n)
    }

    fn bytes_available(&mut self) -> Result<usize> {
        Ok(self.state().rx.len())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.state().rx.clear();
        Ok(())
    }
}

fn wire(uuid: &[u8]) -> Vec<u8> {
    uuid.iter().rev().copied().collect()
}

/// Scan response advertising the UART service from `sender`.
fn advertisement(sender: [u8; 6]) -> Vec<u8> {
    let mut p = vec![0xC4, 0x00];
    p.extend_from_slice(&sender);
    p.extend_from_slice(&[0x01, 0xFF]);
    let mut ad = vec![0x02, 0x01, 0x06, 17, 0x07];
    ad.extend(wire(&ble::UUID_UART_SERVICE));
    p.push(ad.len() as u8);
    p.extend(ad);
    p
}
