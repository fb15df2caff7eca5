use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;

use super::traits::{DeviceStatus, Furnace, TemperatureSource};
use crate::config::{FurnaceConfig, FurnaceRegisters};
use crate::modbus::client::{ModbusClientTrait, RtuClient};
use crate::modbus::protocol::{f32_to_registers, registers_to_f32};
use crate::transport::SerialConnector;
use crate::utils::error::{CalibrationError, ProtocolError};

/// Value written to the control register to stop heating.
pub const CONTROL_STOP: u16 = 0;

/// Furnace temperature controller speaking Modbus RTU.
pub struct ModbusFurnace {
    name: String,
    client: Arc<dyn ModbusClientTrait>,
    slave_id: u8,
    registers: FurnaceRegisters,
    min_temperature_c: f64,
    max_temperature_c: f64,
}

impl ModbusFurnace {
    pub fn new(config: &FurnaceConfig, connector: Arc<dyn SerialConnector>) -> Self {
        let client = RtuClient::new(
            "furnace",
            connector,
            config.serial.baud_rate,
            config.serial.timeout(),
            config.retry,
        );
        Self::with_client(config, Arc::new(client))
    }

    pub fn with_client(config: &FurnaceConfig, client: Arc<dyn ModbusClientTrait>) -> Self {
        Self {
            name: "furnace".to_string(),
            client,
            slave_id: config.slave_id,
            registers: config.registers,
            min_temperature_c: config.min_temperature_c,
            max_temperature_c: config.max_temperature_c,
        }
    }

    async fn read_float(&self, register: u16) -> Result<f64, CalibrationError> {
        let registers = self.client.read_holding_registers(self.slave_id, register, 2).await?;
        let value = registers_to_f32(&registers).ok_or_else(|| {
            ProtocolError::UnexpectedResponse(format!("{} registers at 0x{:04x}", registers.len(), register))
        })?;
        if !value.is_finite() {
            return Err(ProtocolError::UnexpectedResponse(format!("non-finite value at 0x{:04x}", register)).into());
        }
        Ok(value as f64)
    }
}

pub fn status_from_register(value: u16) -> DeviceStatus {
    match value {
        0 => DeviceStatus::Idle,
        1 => DeviceStatus::Heating,
        2 => DeviceStatus::Stable,
        _ => DeviceStatus::Fault,
    }
}

#[async_trait]
impl TemperatureSource for ModbusFurnace {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), CalibrationError> {
        self.client.connect().await
    }

    async fn disconnect(&self) {
        self.client.disconnect().await
    }

    async fn read_temperature(&self) -> Result<f64, CalibrationError> {
        self.read_float(self.registers.process_value).await
    }

    async fn read_status(&self) -> Result<DeviceStatus, CalibrationError> {
        let registers = self
            .client
            .read_holding_registers(self.slave_id, self.registers.status, 1)
            .await?;
        let raw = registers
            .first()
            .copied()
            .ok_or_else(|| ProtocolError::UnexpectedResponse("empty status reply".to_string()))?;
        let status = status_from_register(raw);
        if status == DeviceStatus::Fault {
            warn!("⚠️ Furnace status register reports fault code {}", raw);
        }
        Ok(status)
    }
}

#[async_trait]
impl Furnace for ModbusFurnace {
    async fn set_setpoint(&self, temperature_c: f64) -> Result<(), CalibrationError> {
        if !temperature_c.is_finite()
            || temperature_c < self.min_temperature_c
            || temperature_c > self.max_temperature_c
        {
            return Err(CalibrationError::Configuration(format!(
                "setpoint {} °C outside furnace range {}..{} °C",
                temperature_c, self.min_temperature_c, self.max_temperature_c
            )));
        }

        let registers = f32_to_registers(temperature_c as f32);
        self.client
            .write_multiple_registers(self.slave_id, self.registers.setpoint, &registers)
            .await?;
        info!("🔥 Furnace setpoint set to {:.2} °C", temperature_c);
        Ok(())
    }

    async fn read_setpoint(&self) -> Result<f64, CalibrationError> {
        self.read_float(self.registers.setpoint).await
    }

    async fn emergency_stop(&self) -> Result<(), CalibrationError> {
        warn!("🛑 Emergency stop: disabling furnace heating");
        self.client
            .write_single_register(self.slave_id, self.registers.control, CONTROL_STOP)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::protocol::{RtuFrame, READ_HOLDING_REGISTERS, WRITE_MULTIPLE_REGISTERS};
    use crate::transport::MockTransport;
    use crate::utils::retry::RetryPolicy;

    /// Minimal controller: answers PV/status reads and acknowledges writes.
    fn controller(pv: f32, status: u16) -> MockTransport {
        MockTransport::with_responder("furnace", move |req| {
            let frame = RtuFrame::decode(req).unwrap();
            match frame.function {
                READ_HOLDING_REGISTERS => {
                    let register = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
                    let mut payload = Vec::new();
                    if register == 0x8000 {
                        payload.push(2);
                        payload.extend_from_slice(&status.to_be_bytes());
                    } else {
                        let [high, low] = f32_to_registers(pv);
                        payload.push(4);
                        payload.extend_from_slice(&high.to_be_bytes());
                        payload.extend_from_slice(&low.to_be_bytes());
                    }
                    RtuFrame::new(frame.address, READ_HOLDING_REGISTERS, payload).encode()
                }
                WRITE_MULTIPLE_REGISTERS => {
                    RtuFrame::new(frame.address, WRITE_MULTIPLE_REGISTERS, frame.payload[..4].to_vec()).encode()
                }
                // Write single register replies with an echo.
                _ => req.to_vec(),
            }
        })
    }

    fn furnace_on(mock: &MockTransport) -> ModbusFurnace {
        let mut config = FurnaceConfig::default();
        config.retry = RetryPolicy { max_retries: 1, backoff_ms: 10 };
        ModbusFurnace::new(&config, Arc::new(mock.clone()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_setpoint_frame_on_the_wire() {
        let mock = controller(25.0, 0);
        let furnace = furnace_on(&mock);
        furnace.connect().await.unwrap();

        furnace.set_setpoint(100.0).await.unwrap();

        // 100.0f32 = 0x42C80000, written as two registers at 0x8004.
        let written = &mock.writes()[0];
        assert_eq!(&written[..11], &[0x01, 0x10, 0x80, 0x04, 0x00, 0x02, 0x04, 0x42, 0xC8, 0x00, 0x00]);
        assert_eq!(written.len(), 13);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_process_value_and_status() {
        let mock = controller(99.75, 1);
        let furnace = furnace_on(&mock);
        furnace.connect().await.unwrap();

        assert_eq!(furnace.read_temperature().await.unwrap(), 99.75);
        assert_eq!(furnace.read_status().await.unwrap(), DeviceStatus::Heating);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_setpoint_never_reaches_the_bus() {
        let mock = controller(25.0, 0);
        let furnace = furnace_on(&mock);
        furnace.connect().await.unwrap();

        let err = furnace.set_setpoint(1500.0).await.unwrap_err();
        assert!(matches!(err, CalibrationError::Configuration(_)));
        assert!(mock.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_stop_writes_control_register() {
        let mock = controller(25.0, 0);
        let furnace = furnace_on(&mock);
        furnace.connect().await.unwrap();

        furnace.emergency_stop().await.unwrap();

        let written = &mock.writes()[0];
        assert_eq!(&written[..6], &[0x01, 0x06, 0x80, 0x10, 0x00, 0x00]);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(status_from_register(0), DeviceStatus::Idle);
        assert_eq!(status_from_register(2), DeviceStatus::Stable);
        assert_eq!(status_from_register(7), DeviceStatus::Fault);
    }
}
