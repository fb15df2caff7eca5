use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Byte-level serial failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Timeout on {port} after {timeout_ms} ms")]
    Timeout { port: String, timeout_ms: u64 },

    #[error("Port {0} disconnected")]
    Disconnected(String),

    #[error("Failed to open port {port}: {reason}")]
    Open { port: String, reason: String },

    #[error("IO error on {port}: {reason}")]
    Io { port: String, reason: String },

    #[error("Transport not connected")]
    NotConnected,
}

/// Malformed or unexpected device replies.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("CRC checksum mismatch (calculated 0x{calculated:04x}, received 0x{received:04x})")]
    CrcMismatch { calculated: u16, received: u16 },

    #[error("Frame too short: {0} bytes")]
    FrameTooShort(usize),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Unparsable reply: {0:?}")]
    Unparsable(String),

    #[error("Modbus exception 0x{code:02x} for function 0x{function:02x}")]
    Exception { function: u8, code: u8 },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Device fault on {device}: {reason}")]
    DeviceFault { device: String, reason: String },

    #[error("{device} failed '{operation}' after {attempts} attempts: {last_error}")]
    Device {
        device: String,
        operation: String,
        attempts: u32,
        last_error: Box<CalibrationError>,
    },

    #[error("Point {point_index} ({target_c} °C) not stable after {waited_s:.0} s")]
    StabilizationTimeout {
        point_index: usize,
        target_c: f64,
        waited_s: f64,
    },

    #[error("Channel {channel} at point {point_index}: {invalid}/{total} readings invalid")]
    DataQuality {
        point_index: usize,
        channel: String,
        invalid: usize,
        total: usize,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Output error: {0}")]
    Output(String),

    #[error("A calibration session is already running")]
    SessionBusy,

    #[error("Session aborted")]
    Aborted,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification carried in fault events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Transport,
    Protocol,
    DeviceFault,
    Device,
    StabilizationTimeout,
    DataQuality,
    Configuration,
    Output,
    SessionBusy,
    Aborted,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Transport => "TransportError",
            ErrorKind::Protocol => "ProtocolError",
            ErrorKind::DeviceFault => "DeviceFaultError",
            ErrorKind::Device => "DeviceError",
            ErrorKind::StabilizationTimeout => "StabilizationTimeoutError",
            ErrorKind::DataQuality => "DataQualityError",
            ErrorKind::Configuration => "ConfigurationError",
            ErrorKind::Output => "OutputError",
            ErrorKind::SessionBusy => "SessionBusy",
            ErrorKind::Aborted => "Aborted",
            ErrorKind::Internal => "InternalError",
        };
        f.write_str(name)
    }
}

impl CalibrationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CalibrationError::Transport(_) => ErrorKind::Transport,
            CalibrationError::Protocol(_) => ErrorKind::Protocol,
            CalibrationError::DeviceFault { .. } => ErrorKind::DeviceFault,
            CalibrationError::Device { .. } => ErrorKind::Device,
            CalibrationError::StabilizationTimeout { .. } => ErrorKind::StabilizationTimeout,
            CalibrationError::DataQuality { .. } => ErrorKind::DataQuality,
            CalibrationError::Configuration(_) => ErrorKind::Configuration,
            CalibrationError::Output(_) => ErrorKind::Output,
            CalibrationError::SessionBusy => ErrorKind::SessionBusy,
            CalibrationError::Aborted => ErrorKind::Aborted,
            CalibrationError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a driver may repeat the transaction that produced this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            CalibrationError::Transport(TransportError::NotConnected) => false,
            CalibrationError::Transport(_) => true,
            CalibrationError::Protocol(ProtocolError::Exception { .. }) => false,
            CalibrationError::Protocol(_) => true,
            _ => false,
        }
    }

    pub fn device_fault(device: &str, reason: impl Into<String>) -> Self {
        CalibrationError::DeviceFault {
            device: device.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for CalibrationError {
    fn from(err: serde_json::Error) -> Self {
        CalibrationError::Output(format!("JSON error: {}", err))
    }
}

impl From<toml::de::Error> for CalibrationError {
    fn from(err: toml::de::Error) -> Self {
        CalibrationError::Configuration(format!("TOML parse error: {}", err))
    }
}

impl From<toml::ser::Error> for CalibrationError {
    fn from(err: toml::ser::Error) -> Self {
        CalibrationError::Configuration(format!("TOML write error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let timeout = CalibrationError::Transport(TransportError::Timeout {
            port: "/dev/ttyUSB0".to_string(),
            timeout_ms: 500,
        });
        assert!(timeout.is_retryable());

        let crc = CalibrationError::Protocol(ProtocolError::CrcMismatch {
            calculated: 0x1234,
            received: 0x4321,
        });
        assert!(crc.is_retryable());

        let exception = CalibrationError::Protocol(ProtocolError::Exception {
            function: 0x03,
            code: 0x02,
        });
        assert!(!exception.is_retryable());
        assert!(!CalibrationError::device_fault("furnace", "heater open").is_retryable());
    }

    #[test]
    fn test_kind_names() {
        let err = CalibrationError::DataQuality {
            point_index: 0,
            channel: "B1".to_string(),
            invalid: 4,
            total: 10,
        };
        assert_eq!(err.kind(), ErrorKind::DataQuality);
        assert_eq!(err.kind().to_string(), "DataQualityError");

        let panicked = CalibrationError::Internal("engine task panicked".to_string());
        assert_eq!(panicked.kind().to_string(), "InternalError");
        assert!(!panicked.is_retryable());
    }
}
