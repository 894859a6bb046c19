//! Python bindings (`ark_bridge` extension module).
//!
//! Device methods report outcomes the way the bridge scripts always have:
//! a status code first, then the byte count, then any data read. Errors that
//! carry a count report it; everything else reports zero.

use std::cell::RefCell;
use std::rc::Rc;

use log::debug;
use pyo3::prelude::*;

use crate::command::Rgb;
use crate::config::{BridgeConfig, DEFAULT_BAUD};
use crate::enumerator::Enumerator;
use crate::errors::{BridgeError, Result, STATUS_ERROR, STATUS_OK};
use crate::logging;
use crate::session::{DeviceAddress, DeviceSession};

fn status(result: Result<()>) -> u8 {
    match result {
        Ok(()) => STATUS_OK,
        Err(e) => {
            debug!("{}", e);
            STATUS_ERROR
        }
    }
}

fn failed(e: &BridgeError) -> (u8, usize) {
    debug!("{}", e);
    (STATUS_ERROR, e.count().unwrap_or(0))
}

/// An I2C device behind an ARK bridge, as found by `enumerate()`.
///
/// Devices on the same bridge share one connection; closing any of them
/// closes the bridge for all.
///
/// Example:
///     >>> devs = enumerate(addrs=range(0x44, 0x48))
///     >>> status, count = devs[0].write(8, [0xF0])
///     >>> status, count, data = devs[0].read(8, 1)
#[pyclass(name = "Device", unsendable)]
struct PyDevice {
    session: Rc<RefCell<DeviceSession>>,
    address: DeviceAddress,
}

#[pymethods]
impl PyDevice {
    #[getter]
    fn port(&self) -> String {
        self.address.device().port.clone()
    }

    #[getter]
    fn bus(&self) -> u8 {
        self.address.bus()
    }

    #[getter]
    fn address(&self) -> u8 {
        self.address.address()
    }

    #[getter]
    fn firmware_version(&self) -> u32 {
        self.address.device().firmware_version
    }

    #[getter]
    fn bus_count(&self) -> u8 {
        self.address.device().bus_count
    }

    #[getter]
    fn is_ble(&self) -> bool {
        self.address.device().is_ble()
    }

    /// Read `length` bytes starting at register `reg`.
    ///
    /// Args:
    ///     reg: Register to start from, or None to continue from the device pointer
    ///     length: Number of bytes to read
    ///
    /// Returns:
    ///     (status, count, data)
    #[pyo3(signature = (reg, length))]
    fn read(&self, reg: Option<u8>, length: usize) -> (u8, usize, Vec<u8>) {
        match self.session.borrow_mut().read(&self.address, reg, length) {
            Ok(data) => (STATUS_OK, data.len(), data),
            Err(e) => {
                let (status, count) = failed(&e);
                (status, count, Vec::new())
            }
        }
    }

    /// Write `data` starting at register `reg`.
    ///
    /// Returns:
    ///     (status, count), count being the number of bytes attempted
    fn write(&self, reg: u8, data: Vec<u8>) -> (u8, usize) {
        match self.session.borrow_mut().write(&self.address, reg, &data) {
            Ok(count) => (STATUS_OK, count),
            Err(e) => failed(&e),
        }
    }

    /// Set this device's bus clock in units of 10 kHz (1-100).
    fn i2c_clock(&self, clock: u8) -> u8 {
        status(self.session.borrow_mut().i2c_clock(&self.address, clock))
    }

    fn pullup(&self, enabled: bool) -> u8 {
        status(self.session.borrow_mut().pullup(&self.address, enabled))
    }

    fn dio_mode(&self, pin: u8, mode: u8) -> u8 {
        status(self.session.borrow_mut().dio_mode(pin, mode))
    }

    /// Returns:
    ///     (status, level)
    fn dio_read(&self, pin: u8) -> (u8, u8) {
        match self.session.borrow_mut().dio_read(pin) {
            Ok(level) => (STATUS_OK, level),
            Err(e) => (failed(&e).0, 0),
        }
    }

    fn dio_write(&self, pin: u8, level: u8) -> u8 {
        status(self.session.borrow_mut().dio_write(pin, level))
    }

    /// Set the NeoPixel colour. Unsupported over BLE and on firmware before 181025.
    fn neopixel_color(&self, r: i64, g: i64, b: i64) -> u8 {
        let result = Rgb::try_from((r, g, b))
            .and_then(|color| self.session.borrow_mut().neopixel_color(color));
        status(result)
    }

    fn close(&self) -> u8 {
        status(self.session.borrow_mut().close())
    }

    fn __repr__(&self) -> String {
        format!("Device({}, {})", self.address.device(), self.address)
    }
}

/// Enumerate ARK bridges and the I2C devices behind them.
///
/// Args:
///     ports: Serial ports to probe (default: every port the OS reports)
///     baud: Serial baud rate
///     addrs: I2C addresses to probe (default: 8 to 119)
///
/// Returns:
///     A list of Device, possibly empty
#[pyfunction]
#[pyo3(signature = (ports=None, baud=DEFAULT_BAUD, addrs=None))]
fn enumerate(ports: Option<Vec<String>>, baud: u32, addrs: Option<Vec<u8>>) -> Vec<PyDevice> {
    let config = BridgeConfig {
        baud,
        ..BridgeConfig::from_env()
    };
    let addrs = addrs.unwrap_or_else(|| config.scan_range().collect());
    let scan = Enumerator::new(config).enumerate(&ports.unwrap_or_default(), addrs);

    let mut devices = Vec::new();
    for scanned in scan.devices {
        let (session, addresses) = scanned.into_parts();
        let session = Rc::new(RefCell::new(session));
        devices.extend(addresses.into_iter().map(|address| PyDevice {
            session: Rc::clone(&session),
            address,
        }));
    }
    devices
}

/// Set the minimum level of Rust log records forwarded to Python's `logging`.
///
/// Args:
///     level: "trace", "debug", "info", "warn", "error" or "off"; None re-reads ARK_LOG
#[pyfunction]
#[pyo3(signature = (level=None))]
fn set_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
    logging::set_python_log_level(py, level)
}

/// The Python module definition
#[pymodule]
fn ark_bridge(m: &Bound<'_, PyModule>) -> PyResult<()> {
    logging::init_python_logging(m.py())?;

    m.add_class::<PyDevice>()?;
    m.add_function(wrap_pyfunction!(enumerate, m)?)?;
    m.add_function(wrap_pyfunction!(set_log_level, m)?)?;

    m.add("STATUS_OK", STATUS_OK)?;
    m.add("STATUS_ERROR", STATUS_ERROR)?;
    m.add("DEFAULT_BAUD", DEFAULT_BAUD)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    #[test]
    fn module_is_named_after_the_library() {
        // The interpreter looks for `PyInit_<library name>`.
        assert_eq!(env!("CARGO_CRATE_NAME"), "ark_bridge");
    }
}
