pub mod traits;
pub mod thermometer;
pub mod furnace;
pub mod simulators;
pub mod scanner;

pub use traits::{DeviceStatus, Furnace, TemperatureSource, Thermometer};
pub use thermometer::ScpiThermometer;
pub use furnace::ModbusFurnace;
pub use simulators::{FurnaceSimulator, ThermometerSimulator};
