//! Finding bridges on serial ports and the I2C devices behind them.
//!
//! Every candidate port is opened in turn and checked for a BLE dongle
//! relaying one or more bridges, then for a bridge wired directly to the port.
//! Each bridge found is handshaken, asked for its bus count and scanned for
//! I2C devices. Problems with one port are logged and recorded, never
//! allowed to stop the scan of the others.

use log::{debug, info, warn};

use crate::command::{Frame, MAX_I2C_ADDRESS};
use crate::config::BridgeConfig;
use crate::discovery;
use crate::errors::{BridgeError, Result};
use crate::link::{self, SerialPortLink, SharedLink};
use crate::session::{DeviceAddress, DeviceIdentity, DeviceSession};
use crate::transport::{BleRelay, DirectSerial, Transport};

/// Length of the handshake reply: `zz` followed by six version digits
pub const HANDSHAKE_REPLY_LEN: usize = 8;

// ============================================================================
// Results
// ============================================================================

/// A bridge that passed the handshake and the devices found on it.
#[derive(Debug)]
pub struct ScannedDevice {
    session: DeviceSession,
    addresses: Vec<DeviceAddress>,
}

impl ScannedDevice {
    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut DeviceSession {
        &mut self.session
    }

    pub fn addresses(&self) -> &[DeviceAddress] {
        &self.addresses
    }

    pub fn into_parts(self) -> (DeviceSession, Vec<DeviceAddress>) {
        (self.session, self.addresses)
    }
}

/// A port that could not be probed or scanned to the end.
#[derive(Debug)]
pub struct PortFailure {
    pub port: String,
    pub error: BridgeError,
}

#[derive(Debug, Default)]
pub struct ScanResult {
    pub devices: Vec<ScannedDevice>,
    pub failures: Vec<PortFailure>,
}

impl ScanResult {
    /// Every device found, in port, bus, address order.
    pub fn addresses(&self) -> impl Iterator<Item = &DeviceAddress> {
        self.devices.iter().flat_map(|d| d.addresses.iter())
    }

    /// Number of devices found.
    pub fn len(&self) -> usize {
        self.devices.iter().map(|d| d.addresses.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The session that minted `address`.
    pub fn session_mut(&mut self, address: &DeviceAddress) -> Option<&mut DeviceSession> {
        self.devices
            .iter_mut()
            .map(|d| &mut d.session)
            .find(|s| address.belongs_to(s.identity()))
    }

    fn merge(&mut self, other: ScanResult) {
        self.devices.extend(other.devices);
        self.failures.extend(other.failures);
    }

    fn fail(&mut self, port: &str, error: BridgeError) {
        warn!("{}: {}", port, error);
        self.failures.push(PortFailure {
            port: port.to_string(),
            error,
        });
    }
}

// ============================================================================
// Enumerator
// ============================================================================

/// Scans serial ports for ARK bridges.
///
/// # Example (Rust)
/// ```ignore
/// let enumerator = Enumerator::new(BridgeConfig::from_env());
/// let scan = enumerator.enumerate(&[], enumerator.config().scan_range());
/// for address in scan.addresses() {
///     println!("{} on {}", address, address.device());
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct Enumerator {
    config: BridgeConfig,
}

impl Enumerator {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Probe `ports` (every port the OS reports if empty) and scan
    /// `addresses` on every bus of every bridge found.
    pub fn enumerate<I>(&self, ports: &[String], addresses: I) -> ScanResult
    where
        I: IntoIterator<Item = u8>,
    {
        let mut result = ScanResult::default();
        let addresses: Vec<u8> = addresses.into_iter().collect();

        let ports: Vec<String> = if ports.is_empty() {
            match serialport::available_ports() {
                Ok(found) => found.into_iter().map(|p| p.port_name).collect(),
                Err(e) => {
                    result.fail("<port list>", e.into());
                    Vec::new()
                }
            }
        } else {
            ports.to_vec()
        };

        for port in &ports {
            debug!("Checking port {}", port);
            match SerialPortLink::open(port, &self.config) {
                Ok(opened) => {
                    let shared = link::share(Box::new(opened));
                    result.merge(self.probe_link(shared, addresses.iter().copied()));
                }
                Err(e) => result.fail(port, e),
            }
        }

        if result.is_empty() {
            warn!("Device enumeration failed, please check connection and/or device(s)");
        }
        result
    }

    /// Run the BLE-then-direct probe and the address scan on an open link.
    pub fn probe_link<I>(&self, link: SharedLink, addresses: I) -> ScanResult
    where
        I: IntoIterator<Item = u8>,
    {
        let mut result = ScanResult::default();
        let addresses: Vec<u8> = addresses
            .into_iter()
            .filter(|a| *a <= MAX_I2C_ADDRESS)
            .collect();
        let port = link::lock(&link).name().to_string();

        for mut session in self.connect(&link, &port, &mut result) {
            info!("Bridge found at {}", session.identity());
            let found = self.scan_addresses(&mut session, &addresses, &port, &mut result);
            result.devices.push(ScannedDevice {
                session,
                addresses: found,
            });
        }
        result
    }

    /// Bind every bridge reachable through `link`. A bridge that fails to
    /// identify is recorded and does not hide its siblings on the same dongle.
    fn connect(
        &self,
        link: &SharedLink,
        port: &str,
        result: &mut ScanResult,
    ) -> Vec<DeviceSession> {
        let mut sessions = Vec::new();

        match discovery::discover(link, &self.config) {
            Ok(Some(contexts)) => {
                for ctx in contexts {
                    let relay = BleRelay::new(link.clone(), ctx, &self.config);
                    match self.identify(Box::new(relay)) {
                        Ok(Some(session)) => sessions.push(session),
                        Ok(None) => {}
                        Err(e) => result.fail(port, e),
                    }
                }
            }
            Ok(None) => {}
            Err(e) => debug!("BLE discovery failed: {}", e),
        }

        if sessions.is_empty() {
            if let Err(e) = link::lock(link).clear() {
                result.fail(port, e);
                return sessions;
            }
            let direct = DirectSerial::new(link.clone(), &self.config);
            match self.identify(Box::new(direct)) {
                Ok(Some(session)) => sessions.push(session),
                Ok(None) => {}
                Err(e) => result.fail(port, e),
            }
        }
        sessions
    }

    /// Handshake on `transport` and wrap it in a session if a bridge answers.
    /// The transport is released unless it ends up in a session.
    fn identify(&self, mut transport: Box<dyn Transport>) -> Result<Option<DeviceSession>> {
        let identified = match handshake(transport.as_mut(), &self.config) {
            Ok(Some(version)) => query_bus_count(transport.as_mut(), &self.config)
                .map(|bus_count| Some((version, bus_count))),
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };
        match identified {
            Ok(Some((firmware_version, bus_count))) => {
                let identity = DeviceIdentity {
                    port: transport.port(),
                    kind: transport.kind(),
                    firmware_version,
                    bus_count,
                };
                Ok(Some(DeviceSession::new(identity, transport, self.config.clone())))
            }
            Ok(None) => {
                release(transport.as_mut());
                Ok(None)
            }
            Err(e) => {
                release(transport.as_mut());
                Err(e)
            }
        }
    }

    /// Probe every address on every bus. A probe that fails outright is
    /// recorded against `port` and the scan moves on.
    fn scan_addresses(
        &self,
        session: &mut DeviceSession,
        addresses: &[u8],
        port: &str,
        result: &mut ScanResult,
    ) -> Vec<DeviceAddress> {
        let mut found = Vec::new();
        for bus in 0..session.identity().bus_count {
            for &address in addresses {
                match session.probe(bus, address) {
                    Ok(Some(target)) => found.push(target),
                    Ok(None) => {}
                    Err(e) => {
                        debug!("probing bus {} address 0x{:02X}: {}", bus, address, e);
                        result.fail(port, e);
                    }
                }
            }
        }
        found
    }
}

fn release(transport: &mut dyn Transport) {
    if let Err(e) = transport.close() {
        debug!("releasing {} failed: {}", transport.kind(), e);
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// Send the handshake probe until a full reply arrives or attempts run out.
///
/// Returns the firmware version, or `None` if nothing that looks like a
/// bridge answered.
pub fn handshake(transport: &mut dyn Transport, config: &BridgeConfig) -> Result<Option<u32>> {
    let probe = Frame::new().handshake();
    for attempt in 1..=config.handshake_attempts {
        transport.send(probe.as_bytes())?;
        match transport.receive(HANDSHAKE_REPLY_LEN, config.handshake_timeout()) {
            Ok(reply) => return Ok(parse_handshake(&reply)),
            Err(BridgeError::Timeout { received, .. }) => {
                debug!("handshake attempt {}: {} bytes", attempt, received);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

/// Firmware version from a `zzNNNNNN` handshake reply.
pub fn parse_handshake(reply: &[u8]) -> Option<u32> {
    let start = reply.len().checked_sub(HANDSHAKE_REPLY_LEN)?;
    let (magic, digits) = reply[start..].split_at(2);
    if magic != b"zz" || !digits.iter().all(u8::is_ascii_digit) {
        debug!("not a bridge handshake: {:02X?}", reply);
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Ask the bridge how many I2C buses it drives. Firmware that predates the
/// query stays silent and is taken to have one.
pub fn query_bus_count(transport: &mut dyn Transport, config: &BridgeConfig) -> Result<u8> {
    transport.send(Frame::new().bus_count_query().as_bytes())?;
    match transport.receive(1, config.handshake_timeout()) {
        Ok(reply) => Ok(reply.last().copied().unwrap_or(1).max(1)),
        Err(BridgeError::Timeout { .. }) => Ok(1),
        Err(e) => Err(e),
    }
}
