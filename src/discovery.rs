//! Discovery of bridges behind a serial-attached BLE dongle.
//!
//! Runs once per port during enumeration. The dongle is reset to a quiet
//! state, scans for peripherals advertising the UART service, connects to
//! each one and resolves the GATT handles the relay transport needs:
//!
//! ```text
//! Idle -> GetInfo -> Disconnect -> StopAdvertising -> StopScanning
//!      -> SetScanParams -> Scanning -> StopScan -> HandleScanResponses
//!      -> Connect -> ResolveServiceHandles -> ResolveCharacteristicHandles
//!      -> Ready
//! ```
//!
//! Every transition waits for its own response or event; anything else the
//! dongle emits meanwhile is skipped. A port that does not answer the first
//! query is not a dongle and ends in `NotBle`.

use std::thread;
use std::time::Instant;

use log::{debug, info, warn};

use crate::ble::{self, BlePacket, PacketId};
use crate::config::BridgeConfig;
use crate::errors::Result;
use crate::link::{self, Link};
use crate::transport::BleContext;

// Connection and scan parameters, in dongle units.
const CONN_INTERVAL_MIN: u16 = 8;
const CONN_INTERVAL_MAX: u16 = 76;
const CONN_TIMEOUT: u16 = 100;
const CONN_LATENCY: u16 = 0;
const SCAN_INTERVAL: u16 = 200;
const SCAN_WINDOW: u16 = 200;
const SCAN_ACTIVE: u8 = 1;
const DISCOVER_GENERIC: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Idle,
    GetInfo,
    Disconnect,
    StopAdvertising,
    StopScanning,
    SetScanParams,
    Scanning,
    StopScan,
    HandleScanResponses,
    Connect,
    ResolveServiceHandles,
    ResolveCharacteristicHandles,
    Ready,
    NotBle,
}

/// A BLE device advertising the UART service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peripheral {
    pub address: [u8; 6],
    pub address_type: u8,
}

#[derive(Debug, Default)]
struct PendingConnection {
    connection: u8,
    service: Option<(u16, u16)>,
    tx_handle: Option<u16>,
    rx_handle: Option<u16>,
}

pub struct BleDiscovery<'a> {
    link: &'a mut dyn Link,
    config: &'a BridgeConfig,
    state: DiscoveryState,
    peripherals: Vec<Peripheral>,
    connections: Vec<PendingConnection>,
}

impl<'a> BleDiscovery<'a> {
    pub fn new(link: &'a mut dyn Link, config: &'a BridgeConfig) -> Self {
        Self {
            link,
            config,
            state: DiscoveryState::Idle,
            peripherals: Vec::new(),
            connections: Vec::new(),
        }
    }

    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    pub fn peripherals(&self) -> &[Peripheral] {
        &self.peripherals
    }

    /// Drive the machine to completion.
    ///
    /// Returns the relay contexts of every connected bridge, or `None` if the
    /// port has no BLE dongle behind it.
    pub fn run(mut self) -> Result<Option<Vec<BleContext>>> {
        loop {
            match self.state {
                DiscoveryState::Ready => {
                    let contexts = self
                        .connections
                        .iter()
                        .filter_map(|c| {
                            Some(BleContext {
                                connection: c.connection,
                                tx_handle: c.tx_handle?,
                                rx_handle: c.rx_handle?,
                            })
                        })
                        .collect();
                    return Ok(Some(contexts));
                }
                DiscoveryState::NotBle => return Ok(None),
                _ => self.state = self.step()?,
            }
        }
    }

    /// Perform the current state's action and return the next state.
    pub fn step(&mut self) -> Result<DiscoveryState> {
        use DiscoveryState::*;

        let next = match self.state {
            Idle => GetInfo,
            GetInfo => {
                debug!("BLE get info");
                if self.probe_dongle() {
                    Disconnect
                } else {
                    NotBle
                }
            }
            Disconnect => {
                debug!("BLE disconnect");
                self.command(&ble::connection_disconnect(0), ble::RSP_CONNECTION_DISCONNECT, StopAdvertising)?
            }
            StopAdvertising => {
                debug!("BLE stop advertising");
                self.command(&ble::gap_set_mode(0, 0), ble::RSP_GAP_SET_MODE, StopScanning)?
            }
            StopScanning => {
                debug!("BLE stop scanning");
                self.command(&ble::gap_end_procedure(), ble::RSP_GAP_END_PROCEDURE, SetScanParams)?
            }
            SetScanParams => {
                debug!("BLE set scan parameters");
                let packet = ble::gap_set_scan_parameters(SCAN_INTERVAL, SCAN_WINDOW, SCAN_ACTIVE);
                self.command(&packet, ble::RSP_GAP_SET_SCAN_PARAMETERS, Scanning)?
            }
            Scanning => {
                debug!("BLE scanning for {:?}", self.config.ble_scan());
                ble::send(self.link, &ble::gap_discover(DISCOVER_GENERIC))?;
                thread::sleep(self.config.ble_scan());
                StopScan
            }
            StopScan => {
                ble::send(self.link, &ble::gap_end_procedure())?;
                HandleScanResponses
            }
            HandleScanResponses => {
                self.collect_scan_responses()?;
                Connect
            }
            Connect => {
                self.connect_peripherals()?;
                ResolveServiceHandles
            }
            ResolveServiceHandles => {
                self.resolve_services()?;
                ResolveCharacteristicHandles
            }
            ResolveCharacteristicHandles => {
                self.resolve_characteristics()?;
                Ready
            }
            Ready => Ready,
            NotBle => NotBle,
        };
        Ok(next)
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.config.ble_response_timeout()
    }

    /// The first reply decides whether a dongle is present at all.
    fn probe_dongle(&mut self) -> bool {
        if let Err(e) = ble::send(self.link, &ble::system_get_info()) {
            debug!("BLE get info not sent: {}", e);
            return false;
        }
        let deadline = self.deadline();
        match ble::read_packet(self.link, deadline, self.config.poll_interval()) {
            Ok(Some(p)) if p.id == ble::RSP_SYSTEM_GET_INFO => true,
            Ok(Some(p)) => {
                debug!("BLE unknown response {:?}", p.id);
                false
            }
            Ok(None) => {
                debug!("BLE no response");
                false
            }
            Err(e) => {
                debug!("BLE probe failed: {}", e);
                false
            }
        }
    }

    /// Send `packet`, wait for the `expect` response, then move to `next`.
    fn command(
        &mut self,
        packet: &BlePacket,
        expect: PacketId,
        next: DiscoveryState,
    ) -> Result<DiscoveryState> {
        ble::send(self.link, packet)?;
        let deadline = self.deadline();
        let poll = self.config.poll_interval();
        match ble::wait_for(self.link, deadline, poll, |p| p.id == expect)? {
            Some(_) => Ok(next),
            None => {
                warn!("BLE dongle did not answer {:?}", expect);
                Ok(DiscoveryState::NotBle)
            }
        }
    }

    fn collect_scan_responses(&mut self) -> Result<()> {
        let poll = self.config.poll_interval();
        // Give the end-procedure response time to land behind the scan results.
        let deadline = Instant::now() + poll * 10;
        while let Some(packet) = ble::read_packet(self.link, deadline, poll)? {
            if packet.id != ble::EVT_GAP_SCAN_RESPONSE {
                continue;
            }
            let scan = match ble::ScanResponse::decode(&packet.payload) {
                Ok(scan) => scan,
                Err(e) => {
                    debug!("skipping scan response: {}", e);
                    continue;
                }
            };
            if !scan.advertises(&ble::UUID_UART_SERVICE) {
                continue;
            }
            let peripheral = Peripheral {
                address: scan.sender,
                address_type: scan.address_type,
            };
            if !self.peripherals.contains(&peripheral) {
                info!("BLE UART service found at {:02X?}", peripheral.address);
                self.peripherals.push(peripheral);
            }
        }
        Ok(())
    }

    fn connect_peripherals(&mut self) -> Result<()> {
        let poll = self.config.poll_interval();
        for peripheral in self.peripherals.clone() {
            debug!("BLE connect {:02X?}", peripheral.address);
            let packet = ble::gap_connect_direct(
                peripheral.address,
                peripheral.address_type,
                CONN_INTERVAL_MIN,
                CONN_INTERVAL_MAX,
                CONN_TIMEOUT,
                CONN_LATENCY,
            );
            ble::send(self.link, &packet)?;

            let deadline = Instant::now() + self.config.ble_connect_timeout();
            let status = ble::wait_for(self.link, deadline, poll, |p| {
                p.id == ble::EVT_CONNECTION_STATUS
                    && ble::ConnectionStatus::decode(&p.payload)
                        .map(|s| s.is_connected())
                        .unwrap_or(false)
            })?;
            match status {
                Some(p) => {
                    let status = ble::ConnectionStatus::decode(&p.payload)?;
                    self.connections.push(PendingConnection {
                        connection: status.connection,
                        ..Default::default()
                    });
                }
                None => warn!("BLE connect to {:02X?} timed out", peripheral.address),
            }
        }
        Ok(())
    }

    fn resolve_services(&mut self) -> Result<()> {
        let poll = self.config.poll_interval();
        for i in 0..self.connections.len() {
            let connection = self.connections[i].connection;
            debug!("BLE get handle range on connection {}", connection);
            let packet =
                ble::attclient_read_by_group_type(connection, 0x0001, 0xFFFF, &ble::UUID_PRIMARY_SERVICE);
            ble::send(self.link, &packet)?;

            let deadline = self.deadline();
            while let Some(p) = ble::wait_for(self.link, deadline, poll, |p| {
                is_procedure_event(p, connection, ble::EVT_ATTCLIENT_GROUP_FOUND)
            })? {
                if p.id == ble::EVT_ATTCLIENT_PROCEDURE_COMPLETED {
                    break;
                }
                let group = ble::GroupFound::decode(&p.payload)?;
                if group.uuid == ble::UUID_UART_SERVICE {
                    self.connections[i].service = Some((group.start, group.end));
                }
            }
        }
        Ok(())
    }

    fn resolve_characteristics(&mut self) -> Result<()> {
        let poll = self.config.poll_interval();
        for i in 0..self.connections.len() {
            let connection = self.connections[i].connection;
            let Some((start, end)) = self.connections[i].service else {
                warn!("BLE connection {} has no UART service", connection);
                continue;
            };
            debug!("BLE get attribute handles on connection {}", connection);
            ble::send(self.link, &ble::attclient_find_information(connection, start, end))?;

            let deadline = self.deadline();
            while let Some(p) = ble::wait_for(self.link, deadline, poll, |p| {
                is_procedure_event(p, connection, ble::EVT_ATTCLIENT_FIND_INFORMATION_FOUND)
            })? {
                if p.id == ble::EVT_ATTCLIENT_PROCEDURE_COMPLETED {
                    break;
                }
                let info = ble::InformationFound::decode(&p.payload)?;
                if info.uuid == ble::UUID_UART_TX {
                    self.connections[i].tx_handle = Some(info.handle);
                } else if info.uuid == ble::UUID_UART_RX {
                    self.connections[i].rx_handle = Some(info.handle);
                }
            }
        }
        Ok(())
    }
}

fn is_procedure_event(p: &BlePacket, connection: u8, found: PacketId) -> bool {
    (p.id == found || p.id == ble::EVT_ATTCLIENT_PROCEDURE_COMPLETED)
        && p.payload.first() == Some(&connection)
}

/// Run discovery on `link` with the lock held throughout.
pub fn discover(link: &link::SharedLink, config: &BridgeConfig) -> Result<Option<Vec<BleContext>>> {
    let mut guard = link::lock(link);
    BleDiscovery::new(&mut **guard, config).run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::{to_wire, uart_advertisement};
    use crate::link::testing::ScriptedLink;

    fn fast_config() -> BridgeConfig {
        BridgeConfig {
            poll_interval_us: 50,
            ble_response_timeout_ms: 20,
            ble_connect_timeout_ms: 20,
            ble_scan_ms: 1,
            ..BridgeConfig::default()
        }
    }

    fn rsp(id: PacketId, payload: &[u8]) -> Vec<u8> {
        BlePacket::new(id, payload.to_vec()).encode()
    }

    fn completed(connection: u8) -> Vec<u8> {
        rsp(ble::EVT_ATTCLIENT_PROCEDURE_COMPLETED, &[connection, 0, 0, 0, 0])
    }

    /// Script a dongle with one UART bridge at connection 2.
    fn script_dongle(link: &ScriptedLink) {
        link.reply(rsp(ble::RSP_SYSTEM_GET_INFO, &[1, 0, 1, 0, 0, 0, 0, 0, 1, 1, 2, 1]));
        link.reply(rsp(ble::RSP_CONNECTION_DISCONNECT, &[0, 0x86, 0x01]));
        link.reply(rsp(ble::RSP_GAP_SET_MODE, &[0, 0]));
        link.reply(rsp(ble::RSP_GAP_END_PROCEDURE, &[0x81, 0x01]));
        link.reply(rsp(ble::RSP_GAP_SET_SCAN_PARAMETERS, &[0, 0]));

        // Discover: the response plus two advertisements from the same bridge
        // and one from an unrelated device.
        let mut scan = rsp(ble::RSP_GAP_DISCOVER, &[0, 0]);
        let sender = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];
        scan.extend(rsp(ble::EVT_GAP_SCAN_RESPONSE, &uart_advertisement(sender)));
        scan.extend(rsp(ble::EVT_GAP_SCAN_RESPONSE, &uart_advertisement(sender)));
        scan.extend(rsp(ble::EVT_GAP_SCAN_RESPONSE, &[0xC0, 0, 9, 9, 9, 9, 9, 9, 0, 0xFF, 0]));
        link.reply(scan);
        link.reply(rsp(ble::RSP_GAP_END_PROCEDURE, &[0, 0]));

        let mut connect = rsp(ble::RSP_GAP_CONNECT_DIRECT, &[0, 0, 2]);
        connect.extend(rsp(ble::EVT_CONNECTION_STATUS, &[2, 0x05, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 1]));
        link.reply(connect);

        let mut groups = rsp(ble::RSP_ATTCLIENT_READ_BY_GROUP_TYPE, &[2, 0, 0]);
        groups.extend(rsp(ble::EVT_ATTCLIENT_GROUP_FOUND, &[2, 0x01, 0x00, 0x0B, 0x00, 2, 0x00, 0x18]));
        let mut uart = vec![2, 0x0C, 0x00, 0x1F, 0x00, 16];
        uart.extend(to_wire(&ble::UUID_UART_SERVICE));
        groups.extend(rsp(ble::EVT_ATTCLIENT_GROUP_FOUND, &uart));
        groups.extend(completed(2));
        link.reply(groups);

        let mut infos = rsp(ble::RSP_ATTCLIENT_FIND_INFORMATION, &[2, 0, 0]);
        let mut tx = vec![2, 0x0E, 0x00, 16];
        tx.extend(to_wire(&ble::UUID_UART_TX));
        let mut rx = vec![2, 0x11, 0x00, 16];
        rx.extend(to_wire(&ble::UUID_UART_RX));
        infos.extend(rsp(ble::EVT_ATTCLIENT_FIND_INFORMATION_FOUND, &[2, 0x0D, 0x00, 2, 0x03, 0x28]));
        infos.extend(rsp(ble::EVT_ATTCLIENT_FIND_INFORMATION_FOUND, &tx));
        infos.extend(rsp(ble::EVT_ATTCLIENT_FIND_INFORMATION_FOUND, &rx));
        infos.extend(completed(2));
        link.reply(infos);
    }

    #[test]
    fn resolves_uart_bridge_handles() {
        let script = ScriptedLink::new();
        script_dongle(&script);
        let config = fast_config();

        let contexts = discover(&script.shared(), &config).unwrap().unwrap();
        assert_eq!(
            contexts,
            vec![BleContext {
                connection: 2,
                tx_handle: 0x000E,
                rx_handle: 0x0011,
            }]
        );

        let written = script.written();
        let ids: Vec<PacketId> = written
            .iter()
            .map(|w| BlePacket::decode(w).unwrap().id)
            .collect();
        assert_eq!(
            ids,
            vec![
                ble::RSP_SYSTEM_GET_INFO,
                ble::RSP_CONNECTION_DISCONNECT,
                ble::RSP_GAP_SET_MODE,
                ble::RSP_GAP_END_PROCEDURE,
                ble::RSP_GAP_SET_SCAN_PARAMETERS,
                ble::RSP_GAP_DISCOVER,
                ble::RSP_GAP_END_PROCEDURE,
                ble::RSP_GAP_CONNECT_DIRECT,
                ble::RSP_ATTCLIENT_READ_BY_GROUP_TYPE,
                ble::RSP_ATTCLIENT_FIND_INFORMATION,
            ]
        );
        // Only one connect despite the repeated advertisement.
        let connect = BlePacket::decode(&written[7]).unwrap();
        assert_eq!(&connect.payload[..7], &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x01]);
        let find = BlePacket::decode(&written[9]).unwrap();
        assert_eq!(find.payload, vec![2, 0x0C, 0x00, 0x1F, 0x00]);
    }

    #[test]
    fn silent_port_is_not_ble() {
        let script = ScriptedLink::new();
        let config = fast_config();
        assert_eq!(discover(&script.shared(), &config).unwrap(), None);
        assert_eq!(script.written().len(), 1);
    }

    #[test]
    fn unknown_first_reply_is_not_ble() {
        let script = ScriptedLink::new();
        script.reply(rsp(ble::RSP_GAP_SET_MODE, &[0, 0]));
        let config = fast_config();
        assert_eq!(discover(&script.shared(), &config).unwrap(), None);
    }

    #[test]
    fn dongle_without_bridges_is_ready_and_empty() {
        let script = ScriptedLink::new();
        script.reply(rsp(ble::RSP_SYSTEM_GET_INFO, &[0; 12]));
        script.reply(rsp(ble::RSP_CONNECTION_DISCONNECT, &[0, 0, 0]));
        script.reply(rsp(ble::RSP_GAP_SET_MODE, &[0, 0]));
        script.reply(rsp(ble::RSP_GAP_END_PROCEDURE, &[0, 0]));
        script.reply(rsp(ble::RSP_GAP_SET_SCAN_PARAMETERS, &[0, 0]));
        script.reply(rsp(ble::RSP_GAP_DISCOVER, &[0, 0]));
        let config = fast_config();

        let shared = script.shared();
        let mut guard = link::lock(&shared);
        let mut discovery = BleDiscovery::new(&mut **guard, &config);
        while !matches!(
            discovery.state(),
            DiscoveryState::Ready | DiscoveryState::NotBle
        ) {
            let next = discovery.step().unwrap();
            discovery.state = next;
        }
        assert_eq!(discovery.state(), DiscoveryState::Ready);
        assert!(discovery.peripherals().is_empty());
    }

    #[test]
    fn interleaved_events_do_not_break_gating() {
        let script = ScriptedLink::new();
        script.reply(rsp(ble::RSP_SYSTEM_GET_INFO, &[0; 12]));
        let mut noisy = rsp(ble::EVT_CONNECTION_DISCONNECTED, &[0, 0x13, 0x02]);
        noisy.extend(rsp(ble::RSP_CONNECTION_DISCONNECT, &[0, 0, 0]));
        script.reply(noisy);
        let config = fast_config();

        let shared = script.shared();
        let mut guard = link::lock(&shared);
        let mut discovery = BleDiscovery::new(&mut **guard, &config);
        for expected in [
            DiscoveryState::GetInfo,
            DiscoveryState::Disconnect,
            DiscoveryState::StopAdvertising,
        ] {
            let next = discovery.step().unwrap();
            discovery.state = next;
            assert_eq!(discovery.state(), expected);
        }
    }
}
