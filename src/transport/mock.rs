//! In-memory serial line for hardware-free runs.
//!
//! Every clone of a [`MockTransport`] shares the same line, so a test can keep
//! one handle for inspection while a driver owns another.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{SerialConnector, SerialTransport};
use crate::utils::error::TransportError;

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

struct MockLine {
    inbound: VecDeque<u8>,
    responder: Option<Responder>,
    writes: Vec<Vec<u8>>,
    open_count: usize,
    close_count: usize,
    unplugged: bool,
}

#[derive(Clone)]
pub struct MockTransport {
    name: String,
    line: Arc<Mutex<MockLine>>,
}

impl MockTransport {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            line: Arc::new(Mutex::new(MockLine {
                inbound: VecDeque::new(),
                responder: None,
                writes: Vec::new(),
                open_count: 0,
                close_count: 0,
                unplugged: false,
            })),
        }
    }

    /// A line whose peer answers every write with `responder(request)`.
    pub fn with_responder<F>(name: &str, responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        let mock = Self::new(name);
        mock.lock().responder = Some(Box::new(responder));
        mock
    }

    fn lock(&self) -> MutexGuard<'_, MockLine> {
        // A poisoned line only means a test panicked mid-write; keep the data.
        self.line.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push_inbound(&self, bytes: &[u8]) {
        self.lock().inbound.extend(bytes.iter().copied());
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    /// Writes decoded as text, for line protocols.
    pub fn written_lines(&self) -> Vec<String> {
        self.lock()
            .writes
            .iter()
            .map(|w| String::from_utf8_lossy(w).trim_end().to_string())
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.lock().open_count
    }

    pub fn close_count(&self) -> usize {
        self.lock().close_count
    }

    pub fn unplug(&self) {
        self.lock().unplugged = true;
    }
}

impl SerialTransport for MockTransport {
    fn port_name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut line = self.lock();
        if line.unplugged {
            return Err(TransportError::Disconnected(self.name.clone()));
        }
        line.writes.push(bytes.to_vec());
        let reply = line.responder.as_mut().map(|responder| responder(bytes));
        if let Some(reply) = reply {
            line.inbound.extend(reply);
        }
        Ok(())
    }

    fn read(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut line = self.lock();
        if line.unplugged {
            return Err(TransportError::Disconnected(self.name.clone()));
        }
        if line.inbound.len() < n {
            line.inbound.clear();
            return Err(TransportError::Timeout {
                port: self.name.clone(),
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        Ok(line.inbound.drain(..n).collect())
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        self.lock().inbound.clear();
        Ok(())
    }

    fn close(&mut self) {
        self.lock().close_count += 1;
    }
}

impl SerialConnector for MockTransport {
    fn describe(&self) -> String {
        format!("mock line {}", self.name)
    }

    fn open(&self) -> Result<Box<dyn SerialTransport>, TransportError> {
        let mut line = self.lock();
        if line.unplugged {
            return Err(TransportError::Open {
                port: self.name.clone(),
                reason: "unplugged".to_string(),
            });
        }
        line.open_count += 1;
        drop(line);
        Ok(Box::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_responder_feeds_reads() {
        let mock = MockTransport::with_responder("loop", |req| req.to_vec());
        let mut handle = mock.open().unwrap();

        handle.write(b"PING\n").unwrap();
        let line = handle.read_until(b'\n', 64, Duration::from_millis(10)).unwrap();

        assert_eq!(line, b"PING\n");
        assert_eq!(mock.written_lines(), vec!["PING".to_string()]);
    }

    #[test]
    fn test_short_read_times_out() {
        let mock = MockTransport::new("quiet");
        mock.push_inbound(&[0x01, 0x02]);
        let mut handle = mock.open().unwrap();

        let err = handle.read(4, Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }));
    }

    #[test]
    fn test_unplugged_line_reports_disconnect() {
        let mock = MockTransport::new("gone");
        let mut handle = mock.open().unwrap();
        mock.unplug();

        assert_eq!(
            handle.write(b"x").unwrap_err(),
            TransportError::Disconnected("gone".to_string())
        );
        assert!(mock.open().is_err());
    }
}
