use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;

use super::traits::{DeviceStatus, TemperatureSource, Thermometer};
use crate::calibration::model::{Channel, ChannelId, SensorType};
use crate::config::ThermometerConfig;
use crate::transport::{SerialConnector, SerialTransport};
use crate::utils::error::{CalibrationError, ProtocolError, TransportError};
use crate::utils::retry::RetryPolicy;

pub const COMMAND_TERMINATOR: &str = "\r\n";
const MAX_REPLY_LEN: usize = 256;

/// Plausible range for a converted reading.
pub const MIN_READING_C: f64 = -200.0;
pub const MAX_READING_C: f64 = 2000.0;

struct ScpiLink {
    transport: Option<Box<dyn SerialTransport>>,
    selected: Option<(ChannelId, SensorType)>,
}

/// SCPI reference thermometer (Cropico-style scanner bridge) on a serial line.
pub struct ScpiThermometer {
    name: String,
    connector: Arc<dyn SerialConnector>,
    link: Mutex<ScpiLink>,
    reference: Channel,
    identity_hint: Option<String>,
    trigger_settle: Duration,
    timeout: Duration,
    retry: RetryPolicy,
}

impl ScpiThermometer {
    pub fn new(config: &ThermometerConfig, reference: Channel, connector: Arc<dyn SerialConnector>) -> Self {
        Self {
            name: "thermometer".to_string(),
            connector,
            link: Mutex::new(ScpiLink {
                transport: None,
                selected: None,
            }),
            reference,
            identity_hint: config.identity_hint.clone(),
            trigger_settle: Duration::from_millis(config.trigger_settle_ms),
            timeout: config.serial.timeout(),
            retry: config.retry,
        }
    }

    fn send(link: &mut ScpiLink, command: &str) -> Result<(), CalibrationError> {
        let transport = link.transport.as_mut().ok_or(TransportError::NotConnected)?;
        debug!("📤 SCPI TX {}", command);
        transport.write(format!("{}{}", command, COMMAND_TERMINATOR).as_bytes())?;
        Ok(())
    }

    fn query(link: &mut ScpiLink, command: &str, timeout: Duration) -> Result<String, CalibrationError> {
        let transport = link.transport.as_mut().ok_or(TransportError::NotConnected)?;
        transport.clear_input()?;
        debug!("📤 SCPI TX {}", command);
        transport.write(format!("{}{}", command, COMMAND_TERMINATOR).as_bytes())?;

        let line = transport.read_until(b'\n', MAX_REPLY_LEN, timeout)?;
        let reply = String::from_utf8_lossy(&line).trim().to_string();
        debug!("📥 SCPI RX {}", reply);
        if reply.is_empty() {
            return Err(ProtocolError::Unparsable(reply).into());
        }
        Ok(reply)
    }

    fn select(link: &mut ScpiLink, channel: &Channel) -> Result<(), CalibrationError> {
        let wanted = (channel.id.clone(), channel.sensor);
        if link.selected.as_ref() == Some(&wanted) {
            return Ok(());
        }

        let (scanner, input) = channel.id.scanner_input();
        Self::send(link, &format!("CONF:CHAN {},{}", scanner, input))?;
        Self::send(link, &sensor_configuration(channel.sensor))?;
        link.selected = Some(wanted);
        Ok(())
    }

    async fn read_channel_once(&self, channel: &Channel) -> Result<f64, CalibrationError> {
        let mut link = self.link.lock().await;
        let result = self.trigger_and_read(&mut link, channel).await;
        if result.is_err() {
            // Unknown scanner state after a failed exchange; reselect next time.
            link.selected = None;
        }
        result
    }

    async fn trigger_and_read(&self, link: &mut ScpiLink, channel: &Channel) -> Result<f64, CalibrationError> {
        Self::select(link, channel)?;
        Self::send(link, "TRIG:MODE IMM")?;
        sleep(self.trigger_settle).await;
        let reply = Self::query(link, "READ?", self.timeout)?;
        parse_temperature(&self.name, &reply)
    }

    async fn query_once(&self, command: &str) -> Result<String, CalibrationError> {
        let mut link = self.link.lock().await;
        Self::query(&mut link, command, self.timeout)
    }

    async fn query_with_retry(&self, command: &str) -> Result<String, CalibrationError> {
        self.retry
            .run(&self.name, command, || self.query_once(command))
            .await
    }

    async fn read_raw_once(&self, channel: &Channel) -> Result<f64, CalibrationError> {
        let mut link = self.link.lock().await;
        Self::select(&mut link, channel)?;
        let reply = match Self::query(&mut link, raw_query(channel.sensor), self.timeout) {
            Ok(reply) => reply,
            Err(e) => {
                link.selected = None;
                return Err(e);
            }
        };
        reply
            .parse::<f64>()
            .map_err(|_| ProtocolError::Unparsable(reply.clone()).into())
    }
}

pub fn sensor_configuration(sensor: SensorType) -> String {
    match sensor {
        SensorType::Pt100 => "CONF:TEMP:RTD PT100,4W,100,0.00385".to_string(),
        SensorType::ThermocoupleK => "CONF:TEMP:TC K,INT".to_string(),
        SensorType::ThermocoupleS => "CONF:TEMP:TC S,INT".to_string(),
    }
}

/// Resistance for RTDs, EMF for thermocouples.
pub fn raw_query(sensor: SensorType) -> &'static str {
    if sensor.is_thermocouple() {
        "MEAS:VOLT?"
    } else {
        "MEAS:RES?"
    }
}

/// Parses a `READ?` reply. Overflow means an open or over-range sensor.
pub fn parse_temperature(device: &str, reply: &str) -> Result<f64, CalibrationError> {
    let upper = reply.trim().to_uppercase();
    if upper.starts_with("OVF") || upper.starts_with("OVERFLOW") {
        return Err(CalibrationError::device_fault(device, "reading overflow (sensor open or over range)"));
    }

    let value: f64 = upper
        .parse()
        .map_err(|_| ProtocolError::Unparsable(reply.to_string()))?;
    if !value.is_finite() || !(MIN_READING_C..=MAX_READING_C).contains(&value) {
        return Err(ProtocolError::UnexpectedResponse(format!("temperature {} °C out of range", value)).into());
    }
    Ok(value)
}

#[async_trait]
impl TemperatureSource for ScpiThermometer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), CalibrationError> {
        {
            let mut link = self.link.lock().await;
            if link.transport.is_some() {
                return Ok(());
            }
            info!("🔌 Connecting {} via {}", self.name, self.connector.describe());
            let mut transport = self.connector.open()?;
            transport.clear_input()?;
            link.transport = Some(transport);
            link.selected = None;
        }

        let identity = match self.query_with_retry("*IDN?").await {
            Ok(identity) => identity,
            Err(e) => {
                self.disconnect().await;
                return Err(e);
            }
        };
        info!("🌡️ Thermometer identified: {}", identity);
        if let Some(hint) = &self.identity_hint {
            if !identity.to_uppercase().contains(&hint.to_uppercase()) {
                self.disconnect().await;
                return Err(CalibrationError::device_fault(
                    &self.name,
                    format!("unexpected identity '{}' (expected {})", identity, hint),
                ));
            }
        }

        let mut link = self.link.lock().await;
        Self::send(&mut link, "SYST:REM")?;
        Ok(())
    }

    async fn disconnect(&self) {
        let mut link = self.link.lock().await;
        if link.transport.is_none() {
            return;
        }
        if let Err(e) = Self::send(&mut link, "SYST:LOC") {
            warn!("⚠️ {} did not accept SYST:LOC: {}", self.name, e);
        }
        if let Some(mut transport) = link.transport.take() {
            transport.close();
        }
        link.selected = None;
        info!("✅ {} disconnected", self.name);
    }

    async fn read_temperature(&self) -> Result<f64, CalibrationError> {
        self.read_channel(&self.reference).await
    }

    async fn read_status(&self) -> Result<DeviceStatus, CalibrationError> {
        let reply = self.query_with_retry("SYST:ERR?").await?;
        if reply.starts_with('0') || reply.starts_with("+0") {
            Ok(DeviceStatus::Stable)
        } else {
            warn!("⚠️ {} reports error: {}", self.name, reply);
            Ok(DeviceStatus::Fault)
        }
    }
}

#[async_trait]
impl Thermometer for ScpiThermometer {
    async fn read_channel(&self, channel: &Channel) -> Result<f64, CalibrationError> {
        let operation = format!("READ? {}", channel.id);
        self.retry
            .run(&self.name, &operation, || self.read_channel_once(channel))
            .await
    }

    async fn read_raw(&self, channel: &Channel) -> Result<f64, CalibrationError> {
        let operation = format!("{} {}", raw_query(channel.sensor), channel.id);
        self.retry
            .run(&self.name, &operation, || self.read_raw_once(channel))
            .await
    }

    async fn self_test(&self) -> Result<bool, CalibrationError> {
        let reply = self.query_with_retry("*TST?").await?;
        Ok(reply.trim_start_matches('+') == "0")
    }
}
