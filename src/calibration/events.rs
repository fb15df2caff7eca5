use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

use crate::calibration::model::{ChannelId, Reading};
use crate::calibration::session::CalibrationSession;
use crate::utils::error::{CalibrationError, ErrorKind};

pub const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    Idle,
    PointSetpointSet,
    Stabilizing,
    Sampling,
    Computing,
    PointComplete,
    SessionComplete,
    Aborted,
    Faulted,
}

impl EngineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::SessionComplete | EngineState::Aborted | EngineState::Faulted)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Operator requests delivered to a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Run,
    /// Hold the current setpoint and take no readings until resumed.
    Pause,
    Abort,
    EmergencyStop,
}

impl ControlSignal {
    pub fn is_stop(&self) -> bool {
        matches!(self, ControlSignal::Abort | ControlSignal::EmergencyStop)
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, ControlSignal::Pause)
    }
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    SessionStarted {
        session_id: Uuid,
        points: usize,
        channels: usize,
    },
    StateChanged {
        from: EngineState,
        to: EngineState,
        point_index: Option<usize>,
    },
    SetpointSent {
        point_index: usize,
        target_c: f64,
    },
    StabilityProgress {
        point_index: usize,
        furnace_c: f64,
        reference_c: f64,
        furnace_spread_c: Option<f64>,
        reference_spread_c: Option<f64>,
        elapsed_s: f64,
    },
    EquilibriumReached {
        point_index: usize,
        elapsed_s: f64,
    },
    ChannelSelected {
        point_index: usize,
        channel: ChannelId,
        repetition: usize,
    },
    ReadingTaken {
        point_index: usize,
        repetition: usize,
        reading: Reading,
    },
    PointCompleted {
        point_index: usize,
    },
    Fault {
        kind: ErrorKind,
        point_index: Option<usize>,
        channel: Option<ChannelId>,
        message: String,
    },
    SessionFinished(Box<CalibrationSession>),
}

/// Latest engine snapshot for status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub session_id: Option<Uuid>,
    pub state: EngineState,
    pub point_index: Option<usize>,
    pub target_c: Option<f64>,
    pub channel: Option<ChannelId>,
    pub furnace_c: Option<f64>,
    pub latest: BTreeMap<ChannelId, f64>,
    pub updated_at: DateTime<Utc>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            session_id: None,
            state: EngineState::Idle,
            point_index: None,
            target_c: None,
            channel: None,
            furnace_c: None,
            latest: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Fan-out of events and status. Sends never block and succeed without
/// listeners.
pub struct EventBus {
    events: broadcast::Sender<EngineEvent>,
    status: watch::Sender<StatusSnapshot>,
}

impl EventBus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (status, _) = watch::channel(StatusSnapshot::default());
        Self { events, status }
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    pub fn update_status<F: FnOnce(&mut StatusSnapshot)>(&self, update: F) {
        self.status.send_modify(|snapshot| {
            update(snapshot);
            snapshot.updated_at = Utc::now();
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once a stop is requested. Pending forever if the handle is gone.
pub async fn stop_requested(control: &mut watch::Receiver<ControlSignal>) {
    let closed = control.wait_for(|signal| signal.is_stop()).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

/// Resolves once the session is no longer running freely.
async fn interrupted(control: &mut watch::Receiver<ControlSignal>) {
    let closed = control.wait_for(|signal| *signal != ControlSignal::Run).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

/// Fails on a stop request. While paused, waits for resume and returns how
/// long the pause lasted. A handle dropped during a pause counts as abort.
pub async fn check_control(control: &mut watch::Receiver<ControlSignal>) -> Result<Duration, CalibrationError> {
    let signal = *control.borrow();
    if signal.is_stop() {
        return Err(CalibrationError::Aborted);
    }
    if !signal.is_paused() {
        return Ok(Duration::ZERO);
    }

    info!("⏸️ Session paused, holding setpoint");
    let paused_at = Instant::now();
    let resumed = control.wait_for(|signal| !signal.is_paused()).await.map(|signal| *signal);
    match resumed {
        Ok(signal) if !signal.is_stop() => {
            let paused = paused_at.elapsed();
            info!("▶️ Session resumed after {:.0} s", paused.as_secs_f64());
            Ok(paused)
        }
        _ => Err(CalibrationError::Aborted),
    }
}

/// Sleeps for `duration` of running time unless a stop request arrives
/// first. Returns the time spent paused on top of it.
pub async fn sleep_or_abort(
    duration: Duration,
    control: &mut watch::Receiver<ControlSignal>,
) -> Result<Duration, CalibrationError> {
    let mut paused = check_control(control).await?;
    let mut deadline = Instant::now() + duration;
    loop {
        tokio::select! {
            _ = sleep_until(deadline) => return Ok(paused),
            _ = interrupted(control) => {
                let pause = check_control(control).await?;
                deadline += pause;
                paused += pause;
            }
        }
    }
}

/// Runs a device operation, dropping it as soon as a stop is requested.
pub async fn abortable<T, F>(control: &mut watch::Receiver<ControlSignal>, operation: F) -> Result<T, CalibrationError>
where
    F: Future<Output = Result<T, CalibrationError>>,
{
    tokio::select! {
        result = operation => result,
        _ = stop_requested(control) => Err(CalibrationError::Aborted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn test_abort_interrupts_sleep() {
        let (tx, mut rx) = watch::channel(ControlSignal::Run);
        let started = Instant::now();
        tokio::spawn(async move {
            sleep(Duration::from_secs(2)).await;
            tx.send_replace(ControlSignal::Abort);
        });

        let result = sleep_or_abort(Duration::from_secs(60), &mut rx).await;

        assert_eq!(result, Err(CalibrationError::Aborted));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_control_never_aborts() {
        let (tx, mut rx) = watch::channel(ControlSignal::Run);
        drop(tx);
        assert_eq!(sleep_or_abort(Duration::from_secs(5), &mut rx).await, Ok(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_extends_sleep_until_resumed() {
        let (tx, mut rx) = watch::channel(ControlSignal::Run);
        let started = Instant::now();
        tokio::spawn(async move {
            sleep(Duration::from_secs(2)).await;
            tx.send_replace(ControlSignal::Pause);
            sleep(Duration::from_secs(30)).await;
            tx.send_replace(ControlSignal::Run);
            // Keep the sender alive past the sleep.
            sleep(Duration::from_secs(60)).await;
        });

        let paused = sleep_or_abort(Duration::from_secs(5), &mut rx).await.unwrap();

        assert_eq!(paused, Duration::from_secs(30));
        assert!(started.elapsed() >= Duration::from_secs(35));
        assert!(started.elapsed() < Duration::from_secs(36));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_while_paused() {
        let (tx, mut rx) = watch::channel(ControlSignal::Pause);
        tokio::spawn(async move {
            sleep(Duration::from_secs(10)).await;
            tx.send_replace(ControlSignal::Abort);
        });
        assert_eq!(check_control(&mut rx).await, Err(CalibrationError::Aborted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_control_while_paused_aborts() {
        let (tx, mut rx) = watch::channel(ControlSignal::Pause);
        drop(tx);
        assert_eq!(check_control(&mut rx).await, Err(CalibrationError::Aborted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_cuts_retry_backoff_short() {
        use crate::utils::error::TransportError;
        use crate::utils::retry::RetryPolicy;

        let (tx, mut rx) = watch::channel(ControlSignal::Run);
        let policy = RetryPolicy { max_retries: 5, backoff_ms: 10_000 };
        let started = Instant::now();
        tokio::spawn(async move {
            sleep(Duration::from_millis(500)).await;
            tx.send_replace(ControlSignal::Abort);
        });

        let silent = || async {
            Err::<f64, CalibrationError>(
                TransportError::Timeout {
                    port: "/dev/ttyUSB1".to_string(),
                    timeout_ms: 1000,
                }
                .into(),
            )
        };
        let result = abortable(&mut rx, policy.run("furnace", "read PV", silent)).await;

        assert_eq!(result, Err(CalibrationError::Aborted));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_emit_without_listeners() {
        let bus = EventBus::new();
        bus.emit(EngineEvent::PointCompleted { point_index: 0 });
        bus.update_status(|s| s.state = EngineState::Sampling);
        assert_eq!(bus.status().state, EngineState::Sampling);
    }
}
