use clap::ArgMatches;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::calibration::model::{AccuracyClass, CalibrationPoint, Channel, ChannelId, SensorType};
use crate::transport::SerialSettings;
use crate::utils::error::CalibrationError;
use crate::utils::retry::RetryPolicy;

pub const MAX_CALIBRATION_POINTS: usize = 10;

/// Immutable session configuration. Built once (defaults, file, CLI overrides),
/// validated, then handed to the engine by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub session_name: String,
    pub operator: String,
    pub use_simulators: bool,

    /// Furnace setpoint written after the last point, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parking_temperature_c: Option<f64>,

    pub thermometer: ThermometerConfig,
    pub furnace: FurnaceConfig,
    pub stability: StabilityConfig,
    pub sampling: SamplingConfig,
    pub uncertainty: UncertaintyConfig,

    pub points: Vec<PointConfig>,
    pub channels: Vec<Channel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParityConfig {
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermometerConfig {
    pub serial: SerialSettings,
    pub retry: RetryPolicy,
    /// Substring expected in the `*IDN?` reply, e.g. "CROPICO".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_hint: Option<String>,
    /// Delay between triggering a conversion and asking for the value.
    pub trigger_settle_ms: u64,
}

impl Default for ThermometerConfig {
    fn default() -> Self {
        Self {
            serial: SerialSettings {
                port: "/dev/ttyUSB0".to_string(),
                baud_rate: 9600,
                parity: ParityConfig::None,
                timeout_ms: 3000,
            },
            retry: RetryPolicy::default(),
            identity_hint: Some("CROPICO".to_string()),
            trigger_settle_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FurnaceRegisters {
    pub status: u16,
    pub process_value: u16,
    pub setpoint: u16,
    pub control: u16,
}

impl Default for FurnaceRegisters {
    fn default() -> Self {
        Self {
            status: 0x8000,
            process_value: 0x8002,
            setpoint: 0x8004,
            control: 0x8010,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FurnaceConfig {
    pub slave_id: u8,
    pub min_temperature_c: f64,
    pub max_temperature_c: f64,
    pub serial: SerialSettings,
    pub retry: RetryPolicy,
    pub registers: FurnaceRegisters,
}

impl Default for FurnaceConfig {
    fn default() -> Self {
        Self {
            slave_id: 0x01,
            min_temperature_c: -40.0,
            max_temperature_c: 1200.0,
            serial: SerialSettings {
                port: "/dev/ttyUSB1".to_string(),
                baud_rate: 9600,
                parity: ParityConfig::None,
                timeout_ms: 1000,
            },
            retry: RetryPolicy::default(),
            registers: FurnaceRegisters::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    pub window_size: usize,
    /// Minimum time covered by a full window.
    pub min_window_span_s: f64,
    /// Maximum allowed max-min spread in the window.
    pub band_c: f64,
    /// Default dwell after a setpoint change; a point's own dwell overrides it.
    pub min_dwell_s: f64,
    pub max_wait_s: f64,
    pub poll_interval_ms: u64,
    /// Optional spread limit across all channels once both sources are stable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equilibrium_threshold_c: Option<f64>,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            min_window_span_s: 60.0,
            band_c: 0.05,
            min_dwell_s: 60.0,
            max_wait_s: 3600.0,
            poll_interval_ms: 5000,
            equilibrium_threshold_c: Some(0.3),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub repetitions: usize,
    pub inter_sample_delay_ms: u64,
    pub max_invalid_fraction: f64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            repetitions: 10,
            inter_sample_delay_ms: 10_000,
            max_invalid_fraction: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distribution {
    Normal,
    Rectangular,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentConfig {
    pub name: String,
    pub value: f64,
    pub distribution: Distribution,
    /// Multiplies `value` on thermocouple channels.
    #[serde(default = "unit_factor")]
    pub thermocouple_factor: f64,
}

fn unit_factor() -> f64 {
    1.0
}

impl ComponentConfig {
    pub fn new(name: &str, value: f64, distribution: Distribution) -> Self {
        Self {
            name: name.to_string(),
            value,
            distribution,
            thermocouple_factor: unit_factor(),
        }
    }

    pub fn doubled_for_thermocouples(mut self) -> Self {
        self.thermocouple_factor = 2.0;
        self
    }

    pub fn value_for(&self, sensor: SensorType) -> f64 {
        if sensor.is_thermocouple() {
            self.value * self.thermocouple_factor
        } else {
            self.value
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UncertaintyConfig {
    /// Extra rectangular Type-B term applied to thermocouple channels.
    pub thermocouple_cold_junction_c: f64,
    pub type_b: Vec<ComponentConfig>,
}

impl Default for UncertaintyConfig {
    fn default() -> Self {
        Self {
            thermocouple_cold_junction_c: 0.5,
            type_b: vec![
                ComponentConfig::new("reference thermometer", 0.01, Distribution::Normal)
                    .doubled_for_thermocouples(),
                ComponentConfig::new("resolution", 0.001, Distribution::Normal),
                ComponentConfig::new("furnace stability", 0.02, Distribution::Normal),
                ComponentConfig::new("homogeneity", 0.05, Distribution::Normal),
                ComponentConfig::new("drift", 0.01, Distribution::Normal)
                    .doubled_for_thermocouples(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointConfig {
    pub target_c: f64,
    #[serde(default = "default_point_tolerance")]
    pub tolerance_c: f64,
    /// Falls back to `stability.min_dwell_s` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dwell_s: Option<f64>,
}

fn default_point_tolerance() -> f64 {
    0.5
}

impl PointConfig {
    pub fn at(target_c: f64) -> Self {
        Self {
            target_c,
            tolerance_c: default_point_tolerance(),
            dwell_s: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session_name: "Temperature calibration".to_string(),
            operator: String::new(),
            use_simulators: false,
            parking_temperature_c: Some(30.0),
            thermometer: ThermometerConfig::default(),
            furnace: FurnaceConfig::default(),
            stability: StabilityConfig::default(),
            sampling: SamplingConfig::default(),
            uncertainty: UncertaintyConfig::default(),
            points: [50.0, 100.0, 150.0, 200.0, 250.0]
                .iter()
                .map(|t| PointConfig::at(*t))
                .collect(),
            channels: vec![
                Channel::new(ChannelId::reference(), SensorType::Pt100, None),
                Channel::new(
                    ChannelId::try_from("B0").unwrap_or_else(|_| ChannelId::reference()),
                    SensorType::Pt100,
                    Some(AccuracyClass::A),
                ),
            ],
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CalibrationError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CalibrationError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Config = toml::from_str(&content)?;
        info!("📄 Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), CalibrationError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CalibrationError::Configuration(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| {
            CalibrationError::Configuration(format!("cannot write {}: {}", path.display(), e))
        })?;
        Ok(())
    }

    /// Applies command-line overrides on top of the loaded file.
    pub fn apply_matches(&mut self, matches: &ArgMatches) -> Result<(), CalibrationError> {
        if let Some(port) = matches.get_one::<String>("thermometer-port") {
            self.thermometer.serial.port = port.clone();
        }
        if let Some(port) = matches.get_one::<String>("furnace-port") {
            self.furnace.serial.port = port.clone();
        }
        if let Some(repetitions) = matches.get_one::<String>("repetitions") {
            self.sampling.repetitions = repetitions
                .parse()
                .map_err(|_| CalibrationError::Configuration(format!("invalid repetitions '{}'", repetitions)))?;
        }
        if let Some(points) = matches.get_one::<String>("points") {
            self.points = points
                .split(',')
                .map(|s| {
                    s.trim()
                        .parse::<f64>()
                        .map(PointConfig::at)
                        .map_err(|_| CalibrationError::Configuration(format!("invalid point '{}'", s)))
                })
                .collect::<Result<Vec<_>, _>>()?;
        }
        if matches.get_flag("simulate") {
            self.use_simulators = true;
        }
        if let Some(operator) = matches.get_one::<String>("operator") {
            self.operator = operator.clone();
        }
        Ok(())
    }

    /// Points in configured order with their sequence index.
    pub fn calibration_points(&self) -> Vec<CalibrationPoint> {
        self.points
            .iter()
            .enumerate()
            .map(|(index, p)| CalibrationPoint {
                index,
                target_c: p.target_c,
                tolerance_c: p.tolerance_c,
                dwell_s: p.dwell_s.unwrap_or(self.stability.min_dwell_s),
            })
            .collect()
    }

    /// Reference channel first, then sensors in configured order.
    pub fn ordered_channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.channels.iter().filter(|c| c.id.is_reference()).cloned().collect();
        channels.extend(self.channels.iter().filter(|c| !c.id.is_reference()).cloned());
        channels
    }

    pub fn validate(&self) -> Result<(), CalibrationError> {
        let fail = |msg: String| Err(CalibrationError::Configuration(msg));

        if self.points.is_empty() {
            return fail("at least one calibration point is required".to_string());
        }
        if self.points.len() > MAX_CALIBRATION_POINTS {
            return fail(format!(
                "{} points configured, at most {} allowed",
                self.points.len(),
                MAX_CALIBRATION_POINTS
            ));
        }
        for (index, point) in self.points.iter().enumerate() {
            if !point.target_c.is_finite()
                || point.target_c < self.furnace.min_temperature_c
                || point.target_c > self.furnace.max_temperature_c
            {
                return fail(format!(
                    "point {} ({} °C) outside furnace range {}..{} °C",
                    index, point.target_c, self.furnace.min_temperature_c, self.furnace.max_temperature_c
                ));
            }
            if !(point.tolerance_c > 0.0) {
                return fail(format!("point {} tolerance must be positive", index));
            }
            if point.dwell_s.map_or(false, |d| d < 0.0) {
                return fail(format!("point {} dwell must not be negative", index));
            }
        }
        if let Some(parking) = self.parking_temperature_c {
            if parking < self.furnace.min_temperature_c || parking > self.furnace.max_temperature_c {
                return fail(format!("parking temperature {} °C outside furnace range", parking));
            }
        }

        let references = self.channels.iter().filter(|c| c.id.is_reference()).count();
        if references != 1 {
            return fail(format!("exactly one reference channel A0 required, found {}", references));
        }
        let mut seen = HashSet::new();
        for channel in &self.channels {
            if !seen.insert(channel.id.clone()) {
                return fail(format!("channel {} configured twice", channel.id));
            }
        }
        if self.channels.len() < 2 {
            warn!("⚠️ No sensor channels configured; only the reference will be sampled");
        }

        let s = &self.stability;
        if s.window_size < 2 {
            return fail("stability.window_size must be at least 2".to_string());
        }
        if !(s.band_c > 0.0) {
            return fail("stability.band_c must be positive".to_string());
        }
        if !(s.max_wait_s > 0.0) || s.poll_interval_ms == 0 {
            return fail("stability.max_wait_s and poll_interval_ms must be positive".to_string());
        }
        if s.min_window_span_s < 0.0 || s.min_dwell_s < 0.0 {
            return fail("stability durations must not be negative".to_string());
        }

        if self.sampling.repetitions == 0 {
            return fail("sampling.repetitions must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.sampling.max_invalid_fraction) {
            return fail("sampling.max_invalid_fraction must be within 0..1".to_string());
        }

        for component in &self.uncertainty.type_b {
            if !(component.value >= 0.0) || !(component.thermocouple_factor >= 0.0) {
                return fail(format!("uncertainty component '{}' must not be negative", component.name));
            }
        }

        for settings in [&self.thermometer.serial, &self.furnace.serial] {
            if settings.baud_rate == 0 || settings.timeout_ms == 0 {
                return fail(format!("serial settings for {} need baud rate and timeout", settings.port));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.calibration_points().len(), 5);
        assert_eq!(config.calibration_points()[2].dwell_s, 60.0);
    }

    #[test]
    fn test_toml_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.toml");
        let mut config = Config::default();
        config.operator = "J. Kowalski".to_string();
        config.points = vec![PointConfig {
            target_c: 420.0,
            tolerance_c: 0.2,
            dwell_s: Some(120.0),
        }];

        config.save_to_file(&path).unwrap();
        let loaded = Config::from_file(&path).unwrap();

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let toml = r#"
            operator = "lab"

            [sampling]
            repetitions = 3

            [[points]]
            target_c = 100.0

            [[channels]]
            id = "A0"
            sensor = "PT100"

            [[channels]]
            id = "B2"
            sensor = "TC_K"
            declared_class = "1"
        "#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.sampling.repetitions, 3);
        assert_eq!(config.sampling.max_invalid_fraction, 0.2);
        assert_eq!(config.points[0].tolerance_c, 0.5);
        assert_eq!(config.channels[1].sensor, SensorType::ThermocoupleK);
        assert_eq!(config.channels[1].declared_class, Some(AccuracyClass::Class1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_type_b_component_thermocouple_factor() {
        let toml = r#"
            [[uncertainty.type_b]]
            name = "reference thermometer"
            value = 0.01
            distribution = "normal"
            thermocouple_factor = 2.0

            [[uncertainty.type_b]]
            name = "homogeneity"
            value = 0.05
            distribution = "rectangular"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        let [reference, homogeneity] = &config.uncertainty.type_b[..] else {
            panic!("expected two components");
        };

        assert_eq!(reference.value_for(SensorType::ThermocoupleS), 0.02);
        assert_eq!(reference.value_for(SensorType::Pt100), 0.01);
        assert_eq!(homogeneity.thermocouple_factor, 1.0);
        assert_eq!(homogeneity.value_for(SensorType::ThermocoupleK), 0.05);

        let mut config = Config::default();
        config.uncertainty.type_b[0].thermocouple_factor = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_point_outside_furnace_range_is_rejected() {
        let mut config = Config::default();
        config.points.push(PointConfig::at(1500.0));
        assert!(matches!(config.validate(), Err(CalibrationError::Configuration(_))));
    }

    #[test]
    fn test_reference_channel_required() {
        let mut config = Config::default();
        config.channels.retain(|c| !c.id.is_reference());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_channel_fails_to_parse() {
        let toml = r#"
            [[channels]]
            id = "Z9"
            sensor = "PT100"
        "#;
        assert!(toml::from_str::<Config>(toml).is_err());
    }

    #[test]
    fn test_reference_is_ordered_first() {
        let mut config = Config::default();
        config.channels.reverse();
        assert!(config.ordered_channels()[0].id.is_reference());
    }
}
