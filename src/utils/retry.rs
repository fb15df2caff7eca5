use log::warn;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use super::error::CalibrationError;

/// Bounded retries with linear backoff: the n-th retry waits `n * backoff`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 200,
        }
    }
}

impl RetryPolicy {
    pub fn attempts(&self) -> u32 {
        self.max_retries + 1
    }

    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        Duration::from_millis(self.backoff_ms * retry as u64)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// budget is spent. Exhaustion is reported as `CalibrationError::Device`.
    pub async fn run<T, F, Fut>(&self, device: &str, operation: &str, mut op: F) -> Result<T, CalibrationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CalibrationError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) if attempt >= self.attempts() => {
                    return Err(CalibrationError::Device {
                        device: device.to_string(),
                        operation: operation.to_string(),
                        attempts: attempt,
                        last_error: Box::new(err),
                    });
                }
                Err(err) => {
                    warn!(
                        "⚠️ {} '{}' attempt {}/{} failed: {}",
                        device,
                        operation,
                        attempt,
                        self.attempts(),
                        err
                    );
                    sleep(self.delay_before_retry(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::error::{ProtocolError, TransportError};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn timeout() -> CalibrationError {
        CalibrationError::Transport(TransportError::Timeout {
            port: "mock".to_string(),
            timeout_ms: 100,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy { max_retries: 3, backoff_ms: 100 };
        let started = Instant::now();

        let value = policy
            .run("thermometer", "READ?", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(timeout())
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Linear backoff: 100 ms then 200 ms.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_becomes_device_error() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy { max_retries: 2, backoff_ms: 10 };

        let err = policy
            .run("furnace", "read_temperature", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CalibrationError::Protocol(ProtocolError::CrcMismatch {
                    calculated: 1,
                    received: 2,
                }))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            CalibrationError::Device { attempts, last_error, .. } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last_error, CalibrationError::Protocol(_)));
            }
            other => panic!("expected device error, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_fault_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = RetryPolicy::default()
            .run("thermometer", "READ?", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CalibrationError::device_fault("thermometer", "overflow"))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, CalibrationError::DeviceFault { .. }));
    }
}
