//! Byte-level access to the physical serial connection.
//!
//! Everything above this module speaks in frames and deadlines; everything
//! below is the `serialport` crate. Keeping the seam as a trait lets the
//! transports run against simulated bridges in tests.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use log::debug;
use serialport::{ClearBuffer, SerialPort};

use crate::config::BridgeConfig;
use crate::errors::{BridgeError, Result};

/// Minimal serial capability the protocol layer needs.
pub trait Link: Send {
    /// Port name used in logs and reports.
    fn name(&self) -> &str;
    fn write_all(&mut self, bytes: &[u8]) -> Result<()>;
    /// Read whatever is buffered, up to `buf.len()`, without waiting for more.
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn bytes_available(&mut self) -> Result<usize>;
    /// Block until queued output has left the host.
    fn flush(&mut self) -> Result<()>;
    /// Drop anything pending in both directions.
    fn clear(&mut self) -> Result<()>;
}

/// A link shared by every session relayed through the same port.
pub type SharedLink = Arc<Mutex<Box<dyn Link>>>;

pub fn share(link: Box<dyn Link>) -> SharedLink {
    Arc::new(Mutex::new(link))
}

/// Lock a shared link. A panic in another holder does not invalidate the port.
pub fn lock(link: &SharedLink) -> MutexGuard<'_, Box<dyn Link>> {
    link.lock().unwrap_or_else(PoisonError::into_inner)
}

/// [`Link`] over an OS serial port.
pub struct SerialPortLink {
    name: String,
    port: Box<dyn SerialPort>,
}

impl SerialPortLink {
    /// Open `path` with the configured baud rate and timeout, and clear both buffers.
    pub fn open(path: &str, config: &BridgeConfig) -> Result<Self> {
        let port = serialport::new(path, config.baud)
            .timeout(config.port_timeout())
            .open()
            .map_err(|e| BridgeError::PortUnavailable {
                port: path.to_string(),
                reason: e.to_string(),
            })?;
        port.clear(ClearBuffer::All)?;
        debug!("opened {} at {} baud", path, config.baud);
        Ok(Self {
            name: path.to_string(),
            port,
        })
    }
}

impl Link for SerialPortLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.port.write_all(bytes)?;
        Ok(())
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        let pending = self.port.bytes_to_read()? as usize;
        if pending == 0 || buf.is_empty() {
            return Ok(0);
        }
        let n = pending.min(buf.len());
        match self.port.read(&mut buf[..n]) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn bytes_available(&mut self) -> Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn flush(&mut self) -> Result<()> {
        self.port.flush()?;
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.port.clear(ClearBuffer::All)?;
        Ok(())
    }
}

/// Poll `link` until `expected` bytes arrived or `deadline` passes.
///
/// Returns whatever arrived; a short result means the deadline was hit.
pub fn read_within(
    link: &mut dyn Link,
    expected: usize,
    deadline: Instant,
    poll: Duration,
) -> Result<Vec<u8>> {
    let mut data = vec![0u8; expected];
    let mut filled = 0;
    while filled < expected {
        let n = link.read_available(&mut data[filled..])?;
        filled += n;
        if filled == expected {
            break;
        }
        if Instant::now() >= deadline {
            break;
        }
        if n == 0 {
            thread::sleep(poll);
        }
    }
    data.truncate(filled);
    Ok(data)
}

/// Poll until at least `count` bytes are buffered. Returns `false` on deadline.
pub fn wait_available(
    link: &mut dyn Link,
    count: usize,
    deadline: Instant,
    poll: Duration,
) -> Result<bool> {
    loop {
        if link.bytes_available()? >= count {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        thread::sleep(poll);
    }
}
