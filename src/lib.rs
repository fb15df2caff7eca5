//! Temperature sensor calibration
//!
//! Drives a Modbus RTU furnace through a series of setpoints, waits for
//! thermal stability, samples the sensors under test against a SCPI reference
//! thermometer and produces statistics, GUM uncertainty budgets and IEC
//! tolerance classes for every channel.

pub mod config;
pub mod transport;
pub mod modbus;
pub mod devices;
pub mod calibration;
pub mod output;
pub mod utils;
pub mod cli;

// Re-export commonly used types
pub use calibration::{CalibrationEngine, CalibrationSession, EngineEvent, EngineState, SessionHandle};
pub use config::Config;
pub use devices::{Furnace, FurnaceSimulator, ModbusFurnace, ScpiThermometer, Thermometer, ThermometerSimulator};
pub use output::{CsvFormatter, DataFormatter, DataSender, JsonFormatter};
pub use utils::error::{CalibrationError, ErrorKind};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
