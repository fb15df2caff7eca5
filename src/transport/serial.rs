use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use serialport::{ClearBuffer, SerialPort};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use super::{SerialConnector, SerialTransport};
use crate::config::settings::ParityConfig;
use crate::utils::error::TransportError;

/// Port parameters for one serial link (always 8 data bits, 1 stop bit).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    pub parity: ParityConfig,
    pub timeout_ms: u64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            parity: ParityConfig::None,
            timeout_ms: 1000,
        }
    }
}

impl SerialSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl SerialConnector for SerialSettings {
    fn describe(&self) -> String {
        format!("{} @ {} baud", self.port, self.baud_rate)
    }

    fn open(&self) -> Result<Box<dyn SerialTransport>, TransportError> {
        let transport = SerialPortTransport::open(&self.port, self.baud_rate, &self.parity, self.timeout())?;
        Ok(Box::new(transport))
    }
}

pub struct SerialPortTransport {
    port_name: String,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialPortTransport {
    pub fn open(
        port_name: &str,
        baud_rate: u32,
        parity: &ParityConfig,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        info!("🔌 Opening serial port: {}", port_name);
        info!("⚙️  Configuration: {} baud, 8 data bits, 1 stop bit, parity {:?}", baud_rate, parity);

        let serial_parity = match parity {
            ParityConfig::None => serialport::Parity::None,
            ParityConfig::Even => serialport::Parity::Even,
            ParityConfig::Odd => serialport::Parity::Odd,
        };

        let port = serialport::new(port_name, baud_rate)
            .timeout(timeout)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serial_parity)
            .open()
            .map_err(|e| {
                error!("❌ Failed to open serial port {}: {}", port_name, e);
                TransportError::Open {
                    port: port_name.to_string(),
                    reason: e.to_string(),
                }
            })?;

        Ok(Self {
            port_name: port_name.to_string(),
            port: Some(port),
        })
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>, TransportError> {
        self.port.as_mut().ok_or(TransportError::NotConnected)
    }

    fn io_error(&self, err: io::Error) -> TransportError {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => TransportError::Disconnected(self.port_name.clone()),
            _ => TransportError::Io {
                port: self.port_name.clone(),
                reason: err.to_string(),
            },
        }
    }
}

impl SerialTransport for SerialPortTransport {
    fn port_name(&self) -> &str {
        &self.port_name
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let result = {
            let port = self.port_mut()?;
            port.write_all(bytes).and_then(|_| port.flush())
        };
        result.map_err(|e| self.io_error(e))
    }

    fn read(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut buffer = vec![0u8; n];
        let mut filled = 0;

        while filled < n {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout {
                    port: self.port_name.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }

            let result = {
                let port = self.port_mut()?;
                port.set_timeout(remaining)
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
                    .and_then(|_| port.read(&mut buffer[filled..]))
            };

            match result {
                Ok(0) => return Err(TransportError::Disconnected(self.port_name.clone())),
                Ok(count) => filled += count,
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(self.io_error(e)),
            }
        }

        Ok(buffer)
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        let port_name = self.port_name.clone();
        self.port_mut()?
            .clear(ClearBuffer::Input)
            .map_err(|e| TransportError::Io {
                port: port_name,
                reason: e.to_string(),
            })
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            info!("✅ Serial port {} closed", self.port_name);
        }
    }
}

impl Drop for SerialPortTransport {
    fn drop(&mut self) {
        if self.port.is_some() {
            debug!("Releasing serial port {} on drop", self.port_name);
            self.close();
        }
    }
}
