use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

static RUST_LOG_ONCE: Once = Once::new();

/// Level from `ARK_LOG`, falling back to `RUST_LOG`, then `info`.
fn env_level() -> LevelFilter {
    std::env::var("ARK_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

/// Initialize logging for Rust binaries (stderr formatter) based on `ARK_LOG`/`RUST_LOG`.
pub fn init_rust_logging() {
    let level = env_level();
    RUST_LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level.as_str().to_ascii_lowercase());
        env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .init();
    });
}

#[cfg(feature = "python")]
pub use self::python::{init_python_logging, set_python_log_level};

#[cfg(feature = "python")]
mod python {
    //! Forwarding of `log` records into Python's `logging` module.
    //!
    //! Targets map onto dotted logger names (`ark_bridge::session` becomes
    //! `ark_bridge.session`) so Python-side handlers and levels apply as usual.

    use std::collections::HashMap;
    use std::sync::{Mutex, MutexGuard, PoisonError};

    use log::{Level, LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;
    use pyo3::types::PyModule;

    use super::env_level;

    static PY_LOGGER: OnceCell<&'static PyLogger> = OnceCell::new();

    struct PyLogger {
        top_filter: Mutex<LevelFilter>,
        logging_mod: Py<PyModule>,
        loggers: Mutex<HashMap<String, Py<PyAny>>>,
    }

    fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
        m.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn python_level(level: Level) -> u32 {
        match level {
            Level::Error => 40,
            Level::Warn => 30,
            Level::Info => 20,
            Level::Debug => 10,
            Level::Trace => 5,
        }
    }

    impl PyLogger {
        fn new(py: Python<'_>, top_filter: LevelFilter) -> PyResult<Self> {
            Ok(Self {
                top_filter: Mutex::new(top_filter),
                logging_mod: py.import("logging")?.unbind(),
                loggers: Mutex::new(HashMap::new()),
            })
        }

        fn logger<'py>(&self, py: Python<'py>, name: &str) -> PyResult<Bound<'py, PyAny>> {
            let mut loggers = guard(&self.loggers);
            if let Some(logger) = loggers.get(name) {
                return Ok(logger.bind(py).clone());
            }
            let logger = self
                .logging_mod
                .bind(py)
                .call_method1("getLogger", (name,))?;
            loggers.insert(name.to_string(), logger.clone().unbind());
            Ok(logger)
        }

        fn forward(&self, py: Python<'_>, record: &Record) -> PyResult<()> {
            let name = record.target().replace("::", ".");
            let logger = self.logger(py, &name)?;
            let level = python_level(record.level());
            if !logger.call_method1("isEnabledFor", (level,))?.is_truthy()? {
                return Ok(());
            }
            logger.call_method1("log", (level, record.args().to_string()))?;
            Ok(())
        }
    }

    impl Log for PyLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level().to_level_filter() <= *guard(&self.top_filter)
        }

        fn log(&self, record: &Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            Python::attach(|py| {
                if let Err(e) = self.forward(py, record) {
                    e.restore(py);
                }
            });
        }

        fn flush(&self) {}
    }

    fn install(py: Python<'_>, level: LevelFilter) -> PyResult<&'static PyLogger> {
        PY_LOGGER
            .get_or_try_init(|| {
                let logger: &'static PyLogger = Box::leak(Box::new(PyLogger::new(py, level)?));
                if log::set_logger(logger).is_err() {
                    log::warn!("a logger is already installed; Python logging bridge inactive");
                }
                Ok(logger)
            })
            .copied()
    }

    /// Route Rust logs into Python's `logging`. Safe to call more than once.
    pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
        let level = env_level();
        install(py, level)?;
        log::set_max_level(level);
        Ok(())
    }

    /// Change the minimum level forwarded to Python. `None` re-reads the environment.
    pub fn set_python_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        let level = match level {
            Some(raw) => raw.parse::<LevelFilter>().map_err(|_| {
                pyo3::exceptions::PyValueError::new_err(format!("unknown log level {raw:?}"))
            })?,
            None => env_level(),
        };
        let logger = install(py, level)?;
        *guard(&logger.top_filter) = level;
        guard(&logger.loggers).clear();
        log::set_max_level(level);
        Ok(())
    }
}
