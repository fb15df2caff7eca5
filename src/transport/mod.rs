//! Byte-level serial channels.
//!
//! A transport knows nothing about the protocol running over it. Drivers hold a
//! [`SerialConnector`] and open a fresh [`SerialTransport`] for each session; the
//! port is released when the boxed handle is dropped.

pub mod serial;
pub mod mock;

use std::time::{Duration, Instant};

use crate::utils::error::TransportError;

pub use mock::MockTransport;
pub use serial::{SerialSettings, SerialPortTransport};

pub trait SerialTransport: Send {
    fn port_name(&self) -> &str;

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Reads exactly `n` bytes or fails with `Timeout`.
    fn read(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Discards anything pending in the receive buffer.
    fn clear_input(&mut self) -> Result<(), TransportError>;

    fn close(&mut self);

    /// Reads until `terminator` (inclusive) or `max` bytes.
    fn read_until(
        &mut self,
        terminator: u8,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut line = Vec::new();

        while line.len() < max {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout {
                    port: self.port_name().to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            let byte = self.read(1, remaining)?;
            line.extend_from_slice(&byte);
            if byte.first() == Some(&terminator) {
                break;
            }
        }
        Ok(line)
    }
}

/// Opens transports on demand.
pub trait SerialConnector: Send + Sync {
    fn describe(&self) -> String;

    fn open(&self) -> Result<Box<dyn SerialTransport>, TransportError>;
}
