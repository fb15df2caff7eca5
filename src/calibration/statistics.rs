use serde::{Deserialize, Serialize};

use crate::calibration::model::{ChannelId, MeasurementSet};
use crate::utils::error::CalibrationError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelStatistics {
    pub channel: ChannelId,
    pub point_index: usize,
    /// Valid readings used.
    pub n: usize,
    pub mean: f64,
    /// Sample standard deviation (n-1); `None` for a single sample.
    pub std_dev: Option<f64>,
    /// Type-A standard uncertainty of the mean, s/√n.
    pub std_uncertainty: f64,
    pub min: f64,
    pub max: f64,
    pub range: f64,
    pub single_sample: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
}

impl LinearFit {
    pub fn predict(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

pub struct StatisticsEngine;

impl StatisticsEngine {
    pub fn compute(set: &MeasurementSet) -> Result<ChannelStatistics, CalibrationError> {
        let values = set.valid_temperatures();
        let n = values.len();
        if n == 0 {
            return Err(CalibrationError::DataQuality {
                point_index: set.point_index(),
                channel: set.channel().to_string(),
                invalid: set.invalid_count(),
                total: set.readings().len(),
            });
        }

        let mean = values.iter().sum::<f64>() / n as f64;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let std_dev = if n > 1 {
            let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
            Some((ss / (n - 1) as f64).sqrt())
        } else {
            None
        };
        let std_uncertainty = std_dev.map_or(0.0, |s| s / (n as f64).sqrt());

        Ok(ChannelStatistics {
            channel: set.channel().clone(),
            point_index: set.point_index(),
            n,
            mean,
            std_dev,
            std_uncertainty,
            min,
            max,
            range: max - min,
            single_sample: n == 1,
        })
    }

    /// Sensor minus reference for each repetition where both readings are valid.
    pub fn paired_errors(sensor: &MeasurementSet, reference: &MeasurementSet) -> Vec<f64> {
        sensor
            .readings()
            .iter()
            .zip(reference.readings())
            .filter(|(s, r)| s.valid && r.valid)
            .map(|(s, r)| s.temperature_c - r.temperature_c)
            .collect()
    }

    pub fn max_abs(values: &[f64]) -> Option<f64> {
        values.iter().map(|v| v.abs()).fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.max(v))))
    }

    /// Least-squares line through `(x, y)`. Needs two distinct x values.
    pub fn linear_fit(xs: &[f64], ys: &[f64]) -> Option<LinearFit> {
        let n = xs.len().min(ys.len());
        if n < 2 {
            return None;
        }
        let (xs, ys) = (&xs[..n], &ys[..n]);
        let mean_x = xs.iter().sum::<f64>() / n as f64;
        let mean_y = ys.iter().sum::<f64>() / n as f64;

        let sxx: f64 = xs.iter().map(|x| (x - mean_x).powi(2)).sum();
        if sxx == 0.0 {
            return None;
        }
        let sxy: f64 = xs.iter().zip(ys).map(|(x, y)| (x - mean_x) * (y - mean_y)).sum();
        let syy: f64 = ys.iter().map(|y| (y - mean_y).powi(2)).sum();

        let slope = sxy / sxx;
        let intercept = mean_y - slope * mean_x;
        // A perfectly flat error curve is explained entirely by the line.
        let r_squared = if syy == 0.0 { 1.0 } else { (sxy * sxy) / (sxx * syy) };

        Some(LinearFit {
            slope,
            intercept,
            r_squared,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::model::{MeasurementSetBuilder, Reading};

    fn set_of(channel: &str, values: &[f64]) -> MeasurementSet {
        let id = ChannelId::try_from(channel).unwrap();
        let mut builder = MeasurementSetBuilder::new(id.clone(), 0, values.len());
        for v in values {
            let reading = if v.is_nan() {
                Reading::invalid(id.clone())
            } else {
                Reading::valid(id.clone(), *v, *v)
            };
            builder.push(reading).unwrap();
        }
        builder.finish().unwrap()
    }

    #[test]
    fn test_mean_and_sample_deviation() {
        let stats = StatisticsEngine::compute(&set_of("A0", &[100.00, 100.01, 99.99, 100.00, 100.00])).unwrap();
        assert!((stats.mean - 100.0).abs() < 1e-9);
        assert!((stats.std_dev.unwrap() - 0.00707).abs() < 1e-5);
        assert!((stats.std_uncertainty - 0.00707 / 5f64.sqrt()).abs() < 1e-5);
        assert!((stats.range - 0.02).abs() < 1e-9);
        assert!(!stats.single_sample);
    }

    #[test]
    fn test_single_sample_has_zero_type_a() {
        let stats = StatisticsEngine::compute(&set_of("B0", &[f64::NAN, 42.0, f64::NAN])).unwrap();
        assert_eq!(stats.n, 1);
        assert_eq!(stats.std_dev, None);
        assert_eq!(stats.std_uncertainty, 0.0);
        assert!(stats.single_sample);
    }

    #[test]
    fn test_no_valid_readings_is_data_quality_error() {
        let err = StatisticsEngine::compute(&set_of("B1", &[f64::NAN, f64::NAN])).unwrap_err();
        assert!(matches!(err, CalibrationError::DataQuality { invalid: 2, total: 2, .. }));
    }

    #[test]
    fn test_paired_errors_skip_invalid_repetitions() {
        let sensor = set_of("B0", &[100.1, f64::NAN, 100.3]);
        let reference = set_of("A0", &[100.0, 100.0, 100.0]);
        let errors = StatisticsEngine::paired_errors(&sensor, &reference);
        assert_eq!(errors.len(), 2);
        assert!((StatisticsEngine::max_abs(&errors).unwrap() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_linear_fit() {
        let fit = StatisticsEngine::linear_fit(&[0.0, 100.0, 200.0], &[0.1, 0.3, 0.5]).unwrap();
        assert!((fit.slope - 0.002).abs() < 1e-12);
        assert!((fit.intercept - 0.1).abs() < 1e-12);
        assert!((fit.r_squared - 1.0).abs() < 1e-12);
        assert!(StatisticsEngine::linear_fit(&[50.0], &[0.1]).is_none());
    }
}
