//! Hardware-free furnace and thermometer.
//!
//! The furnace follows a first-order lag towards its setpoint on the tokio
//! clock, so paused-time tests see deterministic dynamics. The thermometer
//! either tracks a simulated furnace (plus a fixed per-channel offset) or plays
//! back scripted per-channel value cycles.

use async_trait::async_trait;
use log::{info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;

use super::traits::{DeviceStatus, Furnace, TemperatureSource, Thermometer};
use crate::calibration::model::{Channel, ChannelId, SensorType};
use crate::utils::error::{CalibrationError, TransportError};

/// PV within this distance of the setpoint counts as stable.
const STABLE_BAND_C: f64 = 0.1;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct FurnaceState {
    connected: bool,
    process_value: f64,
    setpoint: Option<f64>,
    last_update: Instant,
    fault: bool,
    stopped: bool,
    setpoint_history: Vec<f64>,
}

pub struct FurnaceSimulator {
    name: String,
    /// Time constant of the first-order response, seconds.
    time_constant_s: f64,
    state: Mutex<FurnaceState>,
}

impl FurnaceSimulator {
    pub fn new(initial_c: f64, time_constant_s: f64) -> Self {
        Self {
            name: "furnace-sim".to_string(),
            time_constant_s: time_constant_s.max(0.001),
            state: Mutex::new(FurnaceState {
                connected: false,
                process_value: initial_c,
                setpoint: None,
                last_update: Instant::now(),
                fault: false,
                stopped: false,
                setpoint_history: Vec::new(),
            }),
        }
    }

    /// Advances the simulated plant to the current instant.
    fn advance(&self, state: &mut FurnaceState) {
        let now = Instant::now();
        let dt = now.duration_since(state.last_update).as_secs_f64();
        state.last_update = now;
        if state.stopped {
            return;
        }
        if let Some(setpoint) = state.setpoint {
            let alpha = 1.0 - (-dt / self.time_constant_s).exp();
            state.process_value += (setpoint - state.process_value) * alpha;
        }
    }

    fn connected_state(&self) -> Result<MutexGuard<'_, FurnaceState>, CalibrationError> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(TransportError::NotConnected.into());
        }
        self.advance(&mut state);
        Ok(state)
    }

    pub fn set_fault(&self, fault: bool) {
        lock(&self.state).fault = fault;
    }

    pub fn process_value(&self) -> f64 {
        let mut state = lock(&self.state);
        self.advance(&mut state);
        state.process_value
    }

    pub fn setpoint_history(&self) -> Vec<f64> {
        lock(&self.state).setpoint_history.clone()
    }

    pub fn is_stopped(&self) -> bool {
        lock(&self.state).stopped
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }
}

#[async_trait]
impl TemperatureSource for FurnaceSimulator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), CalibrationError> {
        let mut state = lock(&self.state);
        state.connected = true;
        state.last_update = Instant::now();
        info!("🧪 {} connected", self.name);
        Ok(())
    }

    async fn disconnect(&self) {
        lock(&self.state).connected = false;
    }

    async fn read_temperature(&self) -> Result<f64, CalibrationError> {
        Ok(self.connected_state()?.process_value)
    }

    async fn read_status(&self) -> Result<DeviceStatus, CalibrationError> {
        let state = self.connected_state()?;
        let status = if state.fault {
            DeviceStatus::Fault
        } else {
            match state.setpoint {
                _ if state.stopped => DeviceStatus::Idle,
                None => DeviceStatus::Idle,
                Some(sp) if (sp - state.process_value).abs() <= STABLE_BAND_C => DeviceStatus::Stable,
                Some(_) => DeviceStatus::Heating,
            }
        };
        Ok(status)
    }
}

#[async_trait]
impl Furnace for FurnaceSimulator {
    async fn set_setpoint(&self, temperature_c: f64) -> Result<(), CalibrationError> {
        let mut state = self.connected_state()?;
        state.setpoint = Some(temperature_c);
        state.stopped = false;
        state.setpoint_history.push(temperature_c);
        Ok(())
    }

    async fn read_setpoint(&self) -> Result<f64, CalibrationError> {
        let state = self.connected_state()?;
        Ok(state.setpoint.unwrap_or(state.process_value))
    }

    async fn emergency_stop(&self) -> Result<(), CalibrationError> {
        warn!("🛑 {} heating stopped", self.name);
        self.connected_state()?.stopped = true;
        Ok(())
    }
}

struct Script {
    values: Vec<f64>,
    cursor: usize,
}

impl Script {
    fn next(&mut self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        let value = self.values[self.cursor % self.values.len()];
        self.cursor += 1;
        Some(value)
    }
}

struct ThermometerState {
    connected: bool,
    scripts: HashMap<ChannelId, Script>,
    faulty: HashSet<ChannelId>,
    reads: HashMap<ChannelId, usize>,
    last: HashMap<ChannelId, f64>,
    self_test_passes: bool,
}

pub struct ThermometerSimulator {
    name: String,
    furnace: Option<Arc<FurnaceSimulator>>,
    offsets: HashMap<ChannelId, f64>,
    reference: Channel,
    state: Mutex<ThermometerState>,
}

impl ThermometerSimulator {
    /// Readings follow `furnace` plus each channel's offset.
    pub fn tracking(furnace: Arc<FurnaceSimulator>, reference: Channel) -> Self {
        Self::build(Some(furnace), reference)
    }

    /// Readings come only from scripts set with [`Self::script`].
    pub fn scripted(reference: Channel) -> Self {
        Self::build(None, reference)
    }

    fn build(furnace: Option<Arc<FurnaceSimulator>>, reference: Channel) -> Self {
        Self {
            name: "thermometer-sim".to_string(),
            furnace,
            offsets: HashMap::new(),
            reference,
            state: Mutex::new(ThermometerState {
                connected: false,
                scripts: HashMap::new(),
                faulty: HashSet::new(),
                reads: HashMap::new(),
                last: HashMap::new(),
                self_test_passes: true,
            }),
        }
    }

    pub fn with_offset(mut self, channel: ChannelId, offset_c: f64) -> Self {
        self.offsets.insert(channel, offset_c);
        self
    }

    /// Values returned for `channel`, cycled in order.
    pub fn script(&self, channel: ChannelId, values: Vec<f64>) {
        lock(&self.state).scripts.insert(channel, Script { values, cursor: 0 });
    }

    /// Every read of `channel` fails as an open sensor.
    pub fn set_faulty(&self, channel: ChannelId, faulty: bool) {
        let mut state = lock(&self.state);
        if faulty {
            state.faulty.insert(channel);
        } else {
            state.faulty.remove(&channel);
        }
    }

    pub fn set_self_test_passes(&self, passes: bool) {
        lock(&self.state).self_test_passes = passes;
    }

    /// Temperature reads of `channel`; raw reads are not counted.
    pub fn read_count(&self, channel: &ChannelId) -> usize {
        lock(&self.state).reads.get(channel).copied().unwrap_or(0)
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }
}

#[async_trait]
impl TemperatureSource for ThermometerSimulator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), CalibrationError> {
        lock(&self.state).connected = true;
        info!("🧪 {} connected", self.name);
        Ok(())
    }

    async fn disconnect(&self) {
        lock(&self.state).connected = false;
    }

    async fn read_temperature(&self) -> Result<f64, CalibrationError> {
        self.read_channel(&self.reference).await
    }

    async fn read_status(&self) -> Result<DeviceStatus, CalibrationError> {
        if !lock(&self.state).connected {
            return Err(TransportError::NotConnected.into());
        }
        Ok(DeviceStatus::Stable)
    }
}

#[async_trait]
impl Thermometer for ThermometerSimulator {
    async fn read_channel(&self, channel: &Channel) -> Result<f64, CalibrationError> {
        let scripted = {
            let mut state = lock(&self.state);
            if !state.connected {
                return Err(TransportError::NotConnected.into());
            }
            *state.reads.entry(channel.id.clone()).or_insert(0) += 1;
            if state.faulty.contains(&channel.id) {
                return Err(CalibrationError::device_fault(&self.name, format!("{} open circuit", channel.id)));
            }
            state.scripts.get_mut(&channel.id).and_then(Script::next)
        };

        let value = match (scripted, &self.furnace) {
            (Some(value), _) => value,
            (None, Some(furnace)) => {
                furnace.process_value() + self.offsets.get(&channel.id).copied().unwrap_or(0.0)
            }
            (None, None) => {
                return Err(CalibrationError::Configuration(format!("no script for channel {}", channel.id)));
            }
        };
        lock(&self.state).last.insert(channel.id.clone(), value);
        Ok(value)
    }

    /// Converts the channel's latest temperature back to the sensor quantity.
    async fn read_raw(&self, channel: &Channel) -> Result<f64, CalibrationError> {
        let state = lock(&self.state);
        if !state.connected {
            return Err(TransportError::NotConnected.into());
        }
        if state.faulty.contains(&channel.id) {
            return Err(CalibrationError::device_fault(&self.name, format!("{} open circuit", channel.id)));
        }
        let t = state.last.get(&channel.id).copied().ok_or_else(|| {
            CalibrationError::Configuration(format!("no reading on channel {} yet", channel.id))
        })?;
        Ok(raw_from_temperature(channel.sensor, t))
    }

    async fn self_test(&self) -> Result<bool, CalibrationError> {
        Ok(lock(&self.state).self_test_passes)
    }
}

/// Pt100 resistance (Ω, linear Callendar-Van Dusen term) or thermocouple EMF
/// (mV, nominal Seebeck slope).
fn raw_from_temperature(sensor: SensorType, t: f64) -> f64 {
    match sensor {
        SensorType::Pt100 => 100.0 * (1.0 + 0.00385 * t),
        SensorType::ThermocoupleK => 0.041 * t,
        SensorType::ThermocoupleS => 0.0065 * t,
    }
}
