//! Session data model: points, channels, readings and measurement sets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::utils::error::CalibrationError;

pub const REFERENCE_CHANNEL: &str = "A0";
pub const SENSOR_CHANNELS: [&str; 5] = ["B0", "B1", "B2", "B3", "B4"];

/// Scanner input, e.g. `A0` (reference) or `B3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelId(String);

impl ChannelId {
    pub fn reference() -> Self {
        Self(REFERENCE_CHANNEL.to_string())
    }

    pub fn is_reference(&self) -> bool {
        self.0 == REFERENCE_CHANNEL
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Scanner letter and input number, as the thermometer addresses them.
    pub fn scanner_input(&self) -> (char, u8) {
        let mut chars = self.0.chars();
        let scanner = chars.next().unwrap_or('A');
        let input = chars.as_str().parse().unwrap_or(0);
        (scanner, input)
    }
}

impl TryFrom<String> for ChannelId {
    type Error = CalibrationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let value = value.trim().to_uppercase();
        if value == REFERENCE_CHANNEL || SENSOR_CHANNELS.contains(&value.as_str()) {
            Ok(Self(value))
        } else {
            Err(CalibrationError::Configuration(format!(
                "unknown channel '{}' (expected A0 or B0-B4)",
                value
            )))
        }
    }
}

impl TryFrom<&str> for ChannelId {
    type Error = CalibrationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_string())
    }
}

impl From<ChannelId> for String {
    fn from(id: ChannelId) -> Self {
        id.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorType {
    #[serde(rename = "PT100")]
    Pt100,
    #[serde(rename = "TC_K")]
    ThermocoupleK,
    #[serde(rename = "TC_S")]
    ThermocoupleS,
}

impl SensorType {
    pub fn standard(&self) -> &'static str {
        match self {
            SensorType::Pt100 => "IEC 60751",
            SensorType::ThermocoupleK | SensorType::ThermocoupleS => "IEC 60584",
        }
    }

    pub fn is_thermocouple(&self) -> bool {
        !matches!(self, SensorType::Pt100)
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SensorType::Pt100 => "PT100",
            SensorType::ThermocoupleK => "TC_K",
            SensorType::ThermocoupleS => "TC_S",
        };
        f.write_str(name)
    }
}

/// Tolerance classes, strictest first within each standard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccuracyClass {
    AA,
    A,
    B,
    C,
    #[serde(rename = "1")]
    Class1,
    #[serde(rename = "2")]
    Class2,
}

impl fmt::Display for AccuracyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AccuracyClass::AA => "AA",
            AccuracyClass::A => "A",
            AccuracyClass::B => "B",
            AccuracyClass::C => "C",
            AccuracyClass::Class1 => "Class 1",
            AccuracyClass::Class2 => "Class 2",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub sensor: SensorType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_class: Option<AccuracyClass>,
}

impl Channel {
    pub fn new(id: ChannelId, sensor: SensorType, declared_class: Option<AccuracyClass>) -> Self {
        Self { id, sensor, declared_class }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    pub index: usize,
    pub target_c: f64,
    /// Allowed furnace offset from the target while stabilizing.
    pub tolerance_c: f64,
    pub dwell_s: f64,
}

impl CalibrationPoint {
    pub fn dwell(&self) -> Duration {
        Duration::from_secs_f64(self.dwell_s.max(0.0))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub channel: ChannelId,
    pub timestamp: DateTime<Utc>,
    /// Value exactly as the instrument reported it.
    pub raw_value: f64,
    pub temperature_c: f64,
    pub valid: bool,
}

impl Reading {
    pub fn valid(channel: ChannelId, raw_value: f64, temperature_c: f64) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            raw_value,
            temperature_c,
            valid: true,
        }
    }

    pub fn invalid(channel: ChannelId) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            raw_value: f64::NAN,
            temperature_c: f64::NAN,
            valid: false,
        }
    }
}

/// Readings of one channel at one point. Only [`MeasurementSetBuilder`] can
/// create one, so a finished set is never longer than its repetition count and
/// never changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementSet {
    channel: ChannelId,
    point_index: usize,
    capacity: usize,
    readings: Vec<Reading>,
}

impl MeasurementSet {
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn point_index(&self) -> usize {
        self.point_index
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn readings(&self) -> &[Reading] {
        &self.readings
    }

    pub fn valid_temperatures(&self) -> Vec<f64> {
        self.readings
            .iter()
            .filter(|r| r.valid)
            .map(|r| r.temperature_c)
            .collect()
    }

    pub fn invalid_count(&self) -> usize {
        self.readings.iter().filter(|r| !r.valid).count()
    }
}

#[derive(Debug)]
pub struct MeasurementSetBuilder {
    set: MeasurementSet,
}

impl MeasurementSetBuilder {
    pub fn new(channel: ChannelId, point_index: usize, capacity: usize) -> Self {
        Self {
            set: MeasurementSet {
                channel,
                point_index,
                capacity,
                readings: Vec::with_capacity(capacity),
            },
        }
    }

    pub fn len(&self) -> usize {
        self.set.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.readings.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.set.readings.len() >= self.set.capacity
    }

    pub fn invalid_count(&self) -> usize {
        self.set.invalid_count()
    }

    pub fn push(&mut self, reading: Reading) -> Result<(), CalibrationError> {
        if self.is_full() {
            return Err(CalibrationError::Configuration(format!(
                "measurement set for {} already holds {} readings",
                self.set.channel, self.set.capacity
            )));
        }
        self.set.readings.push(reading);
        Ok(())
    }

    /// Seals the set; it must be full.
    pub fn finish(self) -> Result<MeasurementSet, CalibrationError> {
        if !self.is_full() {
            return Err(CalibrationError::Configuration(format!(
                "measurement set for {} incomplete: {}/{}",
                self.set.channel,
                self.set.readings.len(),
                self.set.capacity
            )));
        }
        Ok(self.set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_ids() {
        let reference = ChannelId::try_from("a0").unwrap();
        assert!(reference.is_reference());
        assert_eq!(ChannelId::try_from("B3").unwrap().scanner_input(), ('B', 3));
        assert!(ChannelId::try_from("B5").is_err());
        assert!(ChannelId::try_from("C0").is_err());
    }

    #[test]
    fn test_measurement_set_capacity_is_enforced() {
        let channel = ChannelId::try_from("B0").unwrap();
        let mut builder = MeasurementSetBuilder::new(channel.clone(), 0, 2);
        builder.push(Reading::valid(channel.clone(), 100.0, 100.0)).unwrap();
        assert!(!builder.is_full());
        assert_eq!(builder.len(), 1);
        builder.push(Reading::invalid(channel.clone())).unwrap();
        assert!(builder.push(Reading::valid(channel.clone(), 100.0, 100.0)).is_err());

        let set = builder.finish().unwrap();
        assert_eq!(set.readings().len(), 2);
        assert_eq!(set.valid_temperatures(), vec![100.0]);
        assert_eq!(set.invalid_count(), 1);
    }

    #[test]
    fn test_incomplete_set_cannot_be_sealed() {
        let channel = ChannelId::reference();
        let mut builder = MeasurementSetBuilder::new(channel.clone(), 0, 3);
        builder.push(Reading::valid(channel, 99.9, 99.9)).unwrap();
        assert!(builder.finish().is_err());
    }
}
