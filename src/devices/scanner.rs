use log::{debug, info};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use super::thermometer::COMMAND_TERMINATOR;
use crate::config::{FurnaceRegisters, ParityConfig};
use crate::modbus::client::{ModbusClientTrait, RtuClient};
use crate::transport::{SerialConnector, SerialSettings};
use crate::utils::error::{CalibrationError, TransportError};
use crate::utils::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DetectedDevice {
    Thermometer { identity: String },
    Furnace { slave_id: u8 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortProbe {
    pub port: String,
    pub device: Option<DetectedDevice>,
}

pub fn available_ports() -> Result<Vec<String>, CalibrationError> {
    let ports = serialport::available_ports().map_err(|e| TransportError::Io {
        port: "*".to_string(),
        reason: e.to_string(),
    })?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

/// Sends `*IDN?` and returns the identity line, if anything answers.
pub fn probe_thermometer(connector: &dyn SerialConnector, timeout: Duration) -> Option<String> {
    let mut transport = connector.open().ok()?;
    let reply = transport
        .clear_input()
        .and_then(|_| transport.write(format!("*IDN?{}", COMMAND_TERMINATOR).as_bytes()))
        .and_then(|_| transport.read_until(b'\n', 256, timeout));
    transport.close();

    let line = reply.ok()?;
    let identity = String::from_utf8(line).ok()?.trim().to_string();
    let printable = !identity.is_empty() && identity.chars().all(|c| !c.is_control());
    printable.then_some(identity)
}

/// Reads the status register of `slave_id` once, without retries.
pub async fn probe_furnace(
    connector: Arc<dyn SerialConnector>,
    baud_rate: u32,
    timeout: Duration,
    slave_id: u8,
    registers: &FurnaceRegisters,
) -> bool {
    let client = RtuClient::new(
        "probe",
        connector,
        baud_rate,
        timeout,
        RetryPolicy { max_retries: 0, backoff_ms: 0 },
    );
    if client.connect().await.is_err() {
        return false;
    }
    let found = client
        .read_holding_registers(slave_id, registers.status, 1)
        .await
        .is_ok();
    client.disconnect().await;
    found
}

/// Probes every serial port found on the host, thermometer first.
pub async fn scan_ports(baud_rate: u32, timeout: Duration, slave_id: u8) -> Result<Vec<PortProbe>, CalibrationError> {
    let ports = available_ports()?;
    info!("🔍 Scanning {} serial ports", ports.len());
    let registers = FurnaceRegisters::default();

    let mut results = Vec::with_capacity(ports.len());
    for port in ports {
        let settings = SerialSettings {
            port: port.clone(),
            baud_rate,
            parity: ParityConfig::None,
            timeout_ms: timeout.as_millis() as u64,
        };
        let connector: Arc<dyn SerialConnector> = Arc::new(settings);

        let device = if let Some(identity) = probe_thermometer(connector.as_ref(), timeout) {
            Some(DetectedDevice::Thermometer { identity })
        } else if probe_furnace(connector, baud_rate, timeout, slave_id, &registers).await {
            Some(DetectedDevice::Furnace { slave_id })
        } else {
            None
        };
        debug!("{} -> {:?}", port, device);
        results.push(PortProbe { port, device });
    }
    Ok(results)
}
