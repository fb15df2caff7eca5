use chrono::Utc;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::calibration::classification::ClassificationEngine;
use crate::calibration::events::{
    abortable, check_control, sleep_or_abort, ControlSignal, EngineEvent, EngineState, EventBus, StatusSnapshot,
};
use crate::calibration::model::{CalibrationPoint, Channel, ChannelId};
use crate::calibration::sampler::MeasurementSampler;
use crate::calibration::session::{CalibrationSession, PointRecord};
use crate::calibration::stability::{StabilityCriteria, StabilityDetector};
use crate::calibration::statistics::{ChannelStatistics, StatisticsEngine};
use crate::calibration::uncertainty::UncertaintyEngine;
use crate::config::Config;
use crate::devices::{DeviceStatus, Furnace, Thermometer};
use crate::utils::error::CalibrationError;

/// Furnace setpoint read-back must match within this band.
const SETPOINT_ACK_TOLERANCE_C: f64 = 0.05;

/// Drives one calibration session at a time against a furnace and a
/// reference thermometer.
pub struct CalibrationEngine {
    thermometer: Arc<dyn Thermometer>,
    furnace: Arc<dyn Furnace>,
    bus: Arc<EventBus>,
    session_lock: Arc<Mutex<()>>,
}

/// Control and result of a running session.
pub struct SessionHandle {
    id: Uuid,
    control: watch::Sender<ControlSignal>,
    task: JoinHandle<CalibrationSession>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Stops after the current device transaction; the session ends `Aborted`.
    pub fn abort(&self) {
        self.control.send_replace(ControlSignal::Abort);
    }

    /// Like [`abort`](Self::abort), and also switches furnace heating off.
    pub fn emergency_stop(&self) {
        self.control.send_replace(ControlSignal::EmergencyStop);
    }

    /// Holds the current setpoint and stops taking readings. Paused time does
    /// not count toward stabilization or sampling delays. Ignored once a stop
    /// was requested.
    pub fn pause(&self) {
        self.control.send_if_modified(|signal| {
            if *signal != ControlSignal::Run {
                return false;
            }
            *signal = ControlSignal::Pause;
            true
        });
    }

    pub fn resume(&self) {
        self.control.send_if_modified(|signal| {
            if *signal != ControlSignal::Pause {
                return false;
            }
            *signal = ControlSignal::Run;
            true
        });
    }

    pub fn is_paused(&self) -> bool {
        self.control.borrow().is_paused()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the session to finish and returns the sealed record.
    pub async fn wait(self) -> Result<CalibrationSession, CalibrationError> {
        self.task
            .await
            .map_err(|e| CalibrationError::Internal(format!("engine task panicked: {}", e)))
    }
}

impl CalibrationEngine {
    pub fn new(thermometer: Arc<dyn Thermometer>, furnace: Arc<dyn Furnace>) -> Self {
        Self {
            thermometer,
            furnace,
            bus: Arc::new(EventBus::new()),
            session_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.bus.subscribe()
    }

    pub fn status(&self) -> StatusSnapshot {
        self.bus.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.bus.watch_status()
    }

    /// Validates `config` and runs the session on its own task. Fails with
    /// `SessionBusy` while another session is running.
    pub fn start(&self, config: Config) -> Result<SessionHandle, CalibrationError> {
        config.validate()?;
        let guard = self
            .session_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| CalibrationError::SessionBusy)?;

        let session = CalibrationSession::new(config);
        let id = session.id();
        let (control_tx, control_rx) = watch::channel(ControlSignal::Run);
        let run = SessionRun {
            thermometer: self.thermometer.clone(),
            furnace: self.furnace.clone(),
            bus: self.bus.clone(),
            control: control_rx,
            current_point: None,
            guard: Some(guard),
        };

        info!("🚀 Starting calibration session {} ({} points)", id, session.points().len());
        let task = tokio::spawn(run.execute(session));
        Ok(SessionHandle {
            id,
            control: control_tx,
            task,
        })
    }
}

/// State of the session task. Holding `guard` keeps the engine busy.
struct SessionRun {
    thermometer: Arc<dyn Thermometer>,
    furnace: Arc<dyn Furnace>,
    bus: Arc<EventBus>,
    control: watch::Receiver<ControlSignal>,
    current_point: Option<usize>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl SessionRun {
    async fn execute(mut self, mut session: CalibrationSession) -> CalibrationSession {
        let session_id = session.id();
        self.bus.update_status(|s| {
            *s = StatusSnapshot {
                session_id: Some(session_id),
                ..StatusSnapshot::default()
            };
        });
        self.bus.emit(EngineEvent::SessionStarted {
            session_id,
            points: session.points().len(),
            channels: session.channels().len(),
        });

        let outcome = self.run_points(&mut session).await;

        match outcome {
            Ok(()) => {
                self.park(&session).await;
                self.transition(&mut session, EngineState::SessionComplete);
                info!("✅ Calibration session {} complete", session_id);
            }
            Err(CalibrationError::Aborted) => {
                let emergency = *self.control.borrow() == ControlSignal::EmergencyStop;
                if emergency {
                    if let Err(e) = self.furnace.emergency_stop().await {
                        error!("❌ Emergency stop command failed: {}", e);
                    }
                    session.mark_emergency_stop();
                }
                self.transition(&mut session, EngineState::Aborted);
                warn!("🛑 Calibration session {} aborted", session_id);
            }
            Err(e) => {
                error!("❌ Calibration session {} faulted: {}", session_id, e);
                session.record_fault(&e, self.current_point);
                self.bus.emit(EngineEvent::Fault {
                    kind: e.kind(),
                    point_index: self.current_point,
                    channel: session.fault().and_then(|f| f.channel.clone()),
                    message: e.to_string(),
                });
                self.transition(&mut session, EngineState::Faulted);
            }
        }

        self.furnace.disconnect().await;
        self.thermometer.disconnect().await;

        session.finalize();
        // Listeners may start the next session as soon as they see this.
        drop(self.guard.take());
        self.bus.emit(EngineEvent::SessionFinished(Box::new(session.clone())));
        session
    }

    async fn run_points(&mut self, session: &mut CalibrationSession) -> Result<(), CalibrationError> {
        abortable(&mut self.control, self.furnace.connect()).await?;
        abortable(&mut self.control, self.thermometer.connect()).await?;
        if !abortable(&mut self.control, self.thermometer.self_test()).await? {
            return Err(CalibrationError::device_fault(self.thermometer.name(), "self-test failed"));
        }
        info!("🩺 {} self-test passed", self.thermometer.name());

        let points = session.points().to_vec();
        let channels = session.channels().to_vec();
        let config = session.config().clone();
        let uncertainty = UncertaintyEngine::new(config.uncertainty.clone());

        for point in &points {
            check_control(&mut self.control).await?;
            self.current_point = Some(point.index);
            let started_at = Utc::now();

            abortable(&mut self.control, self.furnace.set_setpoint(point.target_c)).await?;
            self.bus.update_status(|s| {
                s.point_index = Some(point.index);
                s.target_c = Some(point.target_c);
                s.channel = None;
                s.latest.clear();
            });
            self.transition(session, EngineState::PointSetpointSet);
            self.bus.emit(EngineEvent::SetpointSent {
                point_index: point.index,
                target_c: point.target_c,
            });

            let readback = abortable(&mut self.control, self.furnace.read_setpoint()).await?;
            self.acknowledge_setpoint(point, readback)?;
            check_control(&mut self.control).await?;
            self.transition(session, EngineState::Stabilizing);
            let stabilization = self.stabilize(point, &channels, &config).await?;

            self.transition(session, EngineState::Sampling);
            let sets = MeasurementSampler::new(
                self.thermometer.as_ref(),
                self.furnace.as_ref(),
                &config.sampling,
                &self.bus,
            )
            .sample(point, &channels, &mut self.control)
            .await?;

            self.transition(session, EngineState::Computing);
            let statistics = sets
                .iter()
                .map(StatisticsEngine::compute)
                .collect::<Result<Vec<_>, _>>()?;
            let reference = reference_statistics(&statistics, point)?;

            let mut budgets = Vec::with_capacity(channels.len());
            let mut classification = Vec::new();
            for (channel, own) in channels.iter().zip(&statistics) {
                if channel.id.is_reference() {
                    budgets.push(uncertainty.budget(channel, own, None));
                } else {
                    budgets.push(uncertainty.budget(channel, own, Some(reference)));
                    classification.push(ClassificationEngine::classify_point(
                        channel,
                        point.index,
                        own.mean,
                        reference.mean,
                    ));
                }
            }
            for result in &classification {
                info!(
                    "📏 Point {} {}: deviation {:+.4} °C, class {}",
                    point.index,
                    result.channel,
                    result.deviation_c,
                    result.class.map_or("out of tolerance".to_string(), |c| c.to_string())
                );
            }

            session.push_record(PointRecord {
                point: point.clone(),
                started_at,
                completed_at: Utc::now(),
                stabilization_s: stabilization.as_secs_f64(),
                measurements: sets,
                statistics,
                uncertainty: budgets,
                classification,
            });
            self.transition(session, EngineState::PointComplete);
            self.bus.emit(EngineEvent::PointCompleted { point_index: point.index });
        }

        self.current_point = None;
        Ok(())
    }

    fn acknowledge_setpoint(&self, point: &CalibrationPoint, readback: f64) -> Result<(), CalibrationError> {
        if (readback - point.target_c).abs() > SETPOINT_ACK_TOLERANCE_C {
            return Err(CalibrationError::device_fault(
                self.furnace.name(),
                format!("setpoint read back as {:.2} °C, expected {:.2} °C", readback, point.target_c),
            ));
        }
        Ok(())
    }

    /// Polls furnace and reference until both are stable and, when
    /// configured, all channels agree. Returns the running time it took;
    /// paused time extends the deadline and is not counted.
    async fn stabilize(
        &mut self,
        point: &CalibrationPoint,
        channels: &[Channel],
        config: &Config,
    ) -> Result<Duration, CalibrationError> {
        let stability = &config.stability;
        let mut started = Instant::now();
        let mut deadline = started + Duration::from_secs_f64(stability.max_wait_s);
        let poll = Duration::from_millis(stability.poll_interval_ms);

        let mut furnace_detector =
            StabilityDetector::new(StabilityCriteria::for_point(stability, point, true), started);
        let mut reference_detector =
            StabilityDetector::new(StabilityCriteria::for_point(stability, point, false), started);

        // Pause observed since the previous poll.
        let mut paused = Duration::ZERO;
        loop {
            paused += check_control(&mut self.control).await?;
            if !paused.is_zero() {
                started += paused;
                deadline += paused;
                furnace_detector.discount(paused);
                reference_detector.discount(paused);
            }

            if abortable(&mut self.control, self.furnace.read_status()).await? == DeviceStatus::Fault {
                return Err(CalibrationError::device_fault(self.furnace.name(), "furnace reports fault"));
            }
            let furnace_c = abortable(&mut self.control, self.furnace.read_temperature()).await?;
            let reference_c = abortable(&mut self.control, self.thermometer.read_temperature()).await?;
            let now = Instant::now();
            furnace_detector.push(now, furnace_c);
            reference_detector.push(now, reference_c);

            let elapsed = now.duration_since(started);
            self.bus.update_status(|s| {
                s.furnace_c = Some(furnace_c);
                s.latest.insert(ChannelId::reference(), reference_c);
            });
            self.bus.emit(EngineEvent::StabilityProgress {
                point_index: point.index,
                furnace_c,
                reference_c,
                furnace_spread_c: furnace_detector.spread(),
                reference_spread_c: reference_detector.spread(),
                elapsed_s: elapsed.as_secs_f64(),
            });

            if furnace_detector.is_latched()
                && reference_detector.is_latched()
                && self.in_equilibrium(channels, stability.equilibrium_threshold_c).await?
            {
                info!("🎯 Point {} stable after {:.0} s", point.index, elapsed.as_secs_f64());
                self.bus.emit(EngineEvent::EquilibriumReached {
                    point_index: point.index,
                    elapsed_s: elapsed.as_secs_f64(),
                });
                return Ok(elapsed);
            }

            if now >= deadline {
                return Err(CalibrationError::StabilizationTimeout {
                    point_index: point.index,
                    target_c: point.target_c,
                    waited_s: elapsed.as_secs_f64(),
                });
            }
            let remaining = deadline.saturating_duration_since(now);
            paused = sleep_or_abort(poll.min(remaining), &mut self.control).await?;
        }
    }

    /// One reading per channel; the spread must not exceed `threshold`.
    /// Channels reporting a sensor fault are left out here and surface as
    /// invalid readings during sampling.
    async fn in_equilibrium(&mut self, channels: &[Channel], threshold: Option<f64>) -> Result<bool, CalibrationError> {
        let Some(threshold) = threshold else {
            return Ok(true);
        };
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for channel in channels {
            // A pause takes effect at the next poll, after this pass.
            if self.control.borrow().is_stop() {
                return Err(CalibrationError::Aborted);
            }
            let value = match abortable(&mut self.control, self.thermometer.read_channel(channel)).await {
                Ok(value) => value,
                Err(CalibrationError::DeviceFault { reason, .. }) => {
                    warn!("⚠️ {} skipped in equilibrium check: {}", channel.id, reason);
                    continue;
                }
                Err(e) => return Err(e),
            };
            min = min.min(value);
            max = max.max(value);
        }
        let spread = max - min;
        if spread > threshold {
            info!("⏳ Channels not yet in equilibrium: spread {:.3} °C > {:.3} °C", spread, threshold);
            return Ok(false);
        }
        Ok(true)
    }

    async fn park(&self, session: &CalibrationSession) {
        let Some(parking) = session.config().parking_temperature_c else {
            return;
        };
        match self.furnace.set_setpoint(parking).await {
            Ok(()) => info!("🅿️ Furnace parked at {:.1} °C", parking),
            Err(e) => warn!("⚠️ Could not park furnace at {:.1} °C: {}", parking, e),
        }
    }

    fn transition(&self, session: &mut CalibrationSession, to: EngineState) {
        let from = session.state();
        if from == to {
            return;
        }
        session.set_state(to);
        info!("🔄 {} -> {}", from, to);
        self.bus.update_status(|s| s.state = to);
        self.bus.emit(EngineEvent::StateChanged {
            from,
            to,
            point_index: self.current_point,
        });
    }
}

fn reference_statistics<'a>(
    statistics: &'a [ChannelStatistics],
    point: &CalibrationPoint,
) -> Result<&'a ChannelStatistics, CalibrationError> {
    statistics
        .iter()
        .find(|s| s.channel.is_reference())
        .ok_or_else(|| CalibrationError::Configuration(format!("no reference readings at point {}", point.index)))
}
