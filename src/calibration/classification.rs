use serde::{Deserialize, Serialize};

use crate::calibration::model::{AccuracyClass, Channel, ChannelId, SensorType};

const PT100_CLASSES: [AccuracyClass; 4] = [AccuracyClass::AA, AccuracyClass::A, AccuracyClass::B, AccuracyClass::C];
const THERMOCOUPLE_CLASSES: [AccuracyClass; 2] = [AccuracyClass::Class1, AccuracyClass::Class2];

/// Classes defined for `sensor`, strictest first.
pub fn classes_for(sensor: SensorType) -> &'static [AccuracyClass] {
    match sensor {
        SensorType::Pt100 => &PT100_CLASSES,
        SensorType::ThermocoupleK | SensorType::ThermocoupleS => &THERMOCOUPLE_CLASSES,
    }
}

/// Permitted deviation in °C at `t` (IEC 60751 for PT100, IEC 60584 for
/// thermocouples). `None` when the class does not apply to the sensor.
pub fn tolerance(sensor: SensorType, class: AccuracyClass, t: f64) -> Option<f64> {
    let at = t.abs();
    let value = match (sensor, class) {
        (SensorType::Pt100, AccuracyClass::AA) => 0.1 + 0.0017 * at,
        (SensorType::Pt100, AccuracyClass::A) => 0.15 + 0.002 * at,
        (SensorType::Pt100, AccuracyClass::B) => 0.3 + 0.005 * at,
        (SensorType::Pt100, AccuracyClass::C) => 0.6 + 0.01 * at,
        (SensorType::ThermocoupleK, AccuracyClass::Class1) => f64::max(1.5, 0.004 * at),
        (SensorType::ThermocoupleK, AccuracyClass::Class2) => f64::max(2.5, 0.0075 * at),
        (SensorType::ThermocoupleS, AccuracyClass::Class1) => {
            if t <= 1100.0 {
                1.0
            } else {
                1.0 + 0.003 * (t - 1100.0)
            }
        }
        (SensorType::ThermocoupleS, AccuracyClass::Class2) => f64::max(1.5, 0.0025 * at),
        _ => return None,
    };
    Some(value)
}

/// Boundary is inclusive.
pub fn satisfies(sensor: SensorType, class: AccuracyClass, t: f64, deviation: f64) -> bool {
    tolerance(sensor, class, t).map_or(false, |tol| deviation.abs() <= tol)
}

/// Strictest class met by a single deviation, if any.
pub fn best_class(sensor: SensorType, t: f64, deviation: f64) -> Option<AccuracyClass> {
    classes_for(sensor)
        .iter()
        .copied()
        .find(|class| satisfies(sensor, *class, t, deviation))
}

/// Strictest first; used to compare an assigned class with a declared one.
fn rank(sensor: SensorType, class: AccuracyClass) -> Option<usize> {
    classes_for(sensor).iter().position(|c| *c == class)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub channel: ChannelId,
    pub point_index: usize,
    /// Reference temperature the tolerance is evaluated at.
    pub temperature_c: f64,
    pub deviation_c: f64,
    /// `None` means out of tolerance for every class at this point.
    pub class: Option<AccuracyClass>,
    /// Tolerance of `class`, or of the loosest class when out of tolerance.
    pub tolerance_c: f64,
}

impl ClassificationResult {
    pub fn in_tolerance(&self) -> bool {
        self.class.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelClassification {
    pub channel: ChannelId,
    pub sensor: SensorType,
    /// Strictest class satisfied at every tested point.
    pub assigned: Option<AccuracyClass>,
    pub declared: Option<AccuracyClass>,
    /// `None` when no class was declared.
    pub meets_declared: Option<bool>,
    pub points_tested: usize,
}

pub struct ClassificationEngine;

impl ClassificationEngine {
    pub fn classify_point(
        channel: &Channel,
        point_index: usize,
        sensor_mean: f64,
        reference_mean: f64,
    ) -> ClassificationResult {
        let deviation = sensor_mean - reference_mean;
        let class = best_class(channel.sensor, reference_mean, deviation);
        let shown = class.or_else(|| classes_for(channel.sensor).last().copied());
        let tolerance_c = shown
            .and_then(|c| tolerance(channel.sensor, c, reference_mean))
            .unwrap_or(0.0);

        ClassificationResult {
            channel: channel.id.clone(),
            point_index,
            temperature_c: reference_mean,
            deviation_c: deviation,
            class,
            tolerance_c,
        }
    }

    pub fn classify_channel(channel: &Channel, results: &[ClassificationResult]) -> ChannelClassification {
        let results: Vec<&ClassificationResult> = results.iter().filter(|r| r.channel == channel.id).collect();

        let assigned = if results.is_empty() {
            None
        } else {
            classes_for(channel.sensor).iter().copied().find(|class| {
                results
                    .iter()
                    .all(|r| satisfies(channel.sensor, *class, r.temperature_c, r.deviation_c))
            })
        };

        let meets_declared = channel.declared_class.map(|declared| {
            match (assigned.and_then(|a| rank(channel.sensor, a)), rank(channel.sensor, declared)) {
                (Some(got), Some(wanted)) => got <= wanted,
                _ => false,
            }
        });

        ChannelClassification {
            channel: channel.id.clone(),
            sensor: channel.sensor,
            assigned,
            declared: channel.declared_class,
            meets_declared,
            points_tested: results.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn next_up(x: f64) -> f64 {
        f64::from_bits(x.to_bits() + 1)
    }

    fn pt100(declared: Option<AccuracyClass>) -> Channel {
        Channel::new(ChannelId::try_from("B0").unwrap(), SensorType::Pt100, declared)
    }

    #[test]
    fn test_boundary_is_inclusive() {
        for &(sensor, class, t) in &[
            (SensorType::Pt100, AccuracyClass::AA, 100.0),
            (SensorType::Pt100, AccuracyClass::B, -150.0),
            (SensorType::ThermocoupleK, AccuracyClass::Class1, 600.0),
            (SensorType::ThermocoupleS, AccuracyClass::Class1, 1200.0),
        ] {
            let tol = tolerance(sensor, class, t).unwrap();
            assert!(satisfies(sensor, class, t, tol));
            assert!(satisfies(sensor, class, t, -tol));
            assert!(!satisfies(sensor, class, t, next_up(tol)));
        }
    }

    #[test]
    fn test_tolerance_values() {
        assert!((tolerance(SensorType::Pt100, AccuracyClass::A, 200.0).unwrap() - 0.55).abs() < 1e-12);
        assert_eq!(tolerance(SensorType::ThermocoupleK, AccuracyClass::Class2, 100.0), Some(2.5));
        assert!((tolerance(SensorType::ThermocoupleS, AccuracyClass::Class1, 1200.0).unwrap() - 1.3).abs() < 1e-12);
        assert_eq!(tolerance(SensorType::ThermocoupleS, AccuracyClass::A, 100.0), None);
    }

    #[test]
    fn test_point_result_reports_best_class() {
        let result = ClassificationEngine::classify_point(&pt100(None), 0, 100.2, 100.0);
        // AA at 100 °C is 0.27, so 0.2 is still AA.
        assert_eq!(result.class, Some(AccuracyClass::AA));

        let result = ClassificationEngine::classify_point(&pt100(None), 0, 102.0, 100.0);
        assert_eq!(result.class, None);
        assert!((result.tolerance_c - 1.6).abs() < 1e-12);
    }

    #[test]
    fn test_channel_class_must_hold_at_every_point() {
        let channel = pt100(Some(AccuracyClass::A));
        let results = vec![
            ClassificationEngine::classify_point(&channel, 0, 50.05, 50.0),
            ClassificationEngine::classify_point(&channel, 1, 200.5, 200.0),
        ];
        assert_eq!(results[0].class, Some(AccuracyClass::AA));
        assert_eq!(results[1].class, Some(AccuracyClass::A));

        let summary = ClassificationEngine::classify_channel(&channel, &results);
        assert_eq!(summary.assigned, Some(AccuracyClass::A));
        assert_eq!(summary.meets_declared, Some(true));
        assert_eq!(summary.points_tested, 2);
    }

    #[test]
    fn test_declared_class_not_met() {
        let channel = pt100(Some(AccuracyClass::AA));
        let results = vec![ClassificationEngine::classify_point(&channel, 0, 100.5, 100.0)];
        let summary = ClassificationEngine::classify_channel(&channel, &results);
        assert_eq!(summary.assigned, Some(AccuracyClass::B));
        assert_eq!(summary.meets_declared, Some(false));
    }
}
