use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::calibration::model::Channel;
use crate::utils::error::CalibrationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceStatus {
    Idle,
    Heating,
    Stable,
    Fault,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceStatus::Idle => "idle",
            DeviceStatus::Heating => "heating",
            DeviceStatus::Stable => "stable",
            DeviceStatus::Fault => "fault",
        };
        f.write_str(name)
    }
}

/// Anything the engine can poll for a temperature. For a furnace this is the
/// process value; for a thermometer it is the reference channel.
#[async_trait]
pub trait TemperatureSource: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<(), CalibrationError>;

    /// Releases the port. Never fails; problems are logged.
    async fn disconnect(&self);

    async fn read_temperature(&self) -> Result<f64, CalibrationError>;

    async fn read_status(&self) -> Result<DeviceStatus, CalibrationError>;
}

/// Multi-channel precision thermometer with a scanner.
#[async_trait]
pub trait Thermometer: TemperatureSource {
    async fn read_channel(&self, channel: &Channel) -> Result<f64, CalibrationError>;

    /// Raw sensor quantity: resistance in Ω for RTDs, EMF in mV for
    /// thermocouples.
    async fn read_raw(&self, channel: &Channel) -> Result<f64, CalibrationError>;

    /// Instrument self-test; `false` means the instrument reported a failure.
    async fn self_test(&self) -> Result<bool, CalibrationError>;
}

#[async_trait]
pub trait Furnace: TemperatureSource {
    async fn set_setpoint(&self, temperature_c: f64) -> Result<(), CalibrationError>;

    async fn read_setpoint(&self) -> Result<f64, CalibrationError>;

    /// Stops heating immediately.
    async fn emergency_stop(&self) -> Result<(), CalibrationError>;
}
