use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::calibration::classification::{ChannelClassification, ClassificationEngine, ClassificationResult};
use crate::calibration::events::EngineState;
use crate::calibration::model::{CalibrationPoint, Channel, ChannelId, MeasurementSet};
use crate::calibration::statistics::{ChannelStatistics, LinearFit, StatisticsEngine};
use crate::calibration::uncertainty::UncertaintyBudget;
use crate::config::Config;
use crate::utils::error::{CalibrationError, ErrorKind};

/// Everything recorded at one completed point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointRecord {
    pub point: CalibrationPoint,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub stabilization_s: f64,
    pub measurements: Vec<MeasurementSet>,
    pub statistics: Vec<ChannelStatistics>,
    pub uncertainty: Vec<UncertaintyBudget>,
    pub classification: Vec<ClassificationResult>,
}

impl PointRecord {
    pub fn statistics_for(&self, channel: &ChannelId) -> Option<&ChannelStatistics> {
        self.statistics.iter().find(|s| &s.channel == channel)
    }

    pub fn budget_for(&self, channel: &ChannelId) -> Option<&UncertaintyBudget> {
        self.uncertainty.iter().find(|b| &b.channel == channel)
    }

    pub fn classification_for(&self, channel: &ChannelId) -> Option<&ClassificationResult> {
        self.classification.iter().find(|c| &c.channel == channel)
    }

    pub fn measurements_for(&self, channel: &ChannelId) -> Option<&MeasurementSet> {
        self.measurements.iter().find(|m| m.channel() == channel)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaultRecord {
    pub kind: ErrorKind,
    pub point_index: Option<usize>,
    pub channel: Option<ChannelId>,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Error of one sensor channel across all completed points.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSummary {
    pub channel: ChannelId,
    pub points: usize,
    pub mean_error_c: f64,
    pub max_abs_error_c: f64,
    /// error = slope * t + intercept, with t the reference temperature.
    pub fit: Option<LinearFit>,
}

/// One calibration run. Only the engine mutates it; once finished it is
/// read-only and handed to persistence and reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationSession {
    id: Uuid,
    name: String,
    operator: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    config: Config,
    points: Vec<CalibrationPoint>,
    channels: Vec<Channel>,
    records: Vec<PointRecord>,
    state: EngineState,
    fault: Option<FaultRecord>,
    emergency_stop: bool,
    classifications: Vec<ChannelClassification>,
    summaries: Vec<ChannelSummary>,
}

impl CalibrationSession {
    pub(crate) fn new(config: Config) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: config.session_name.clone(),
            operator: config.operator.clone(),
            started_at: Utc::now(),
            finished_at: None,
            points: config.calibration_points(),
            channels: config.ordered_channels(),
            config,
            records: Vec::new(),
            state: EngineState::Idle,
            fault: None,
            emergency_stop: false,
            classifications: Vec::new(),
            summaries: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operator(&self) -> &str {
        &self.operator
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn points(&self) -> &[CalibrationPoint] {
        &self.points
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn sensor_channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter().filter(|c| !c.id.is_reference())
    }

    pub fn records(&self) -> &[PointRecord] {
        &self.records
    }

    pub fn record(&self, point_index: usize) -> Option<&PointRecord> {
        self.records.iter().find(|r| r.point.index == point_index)
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn fault(&self) -> Option<&FaultRecord> {
        self.fault.as_ref()
    }

    pub fn emergency_stop(&self) -> bool {
        self.emergency_stop
    }

    pub fn classifications(&self) -> &[ChannelClassification] {
        &self.classifications
    }

    pub fn classification(&self, channel: &ChannelId) -> Option<&ChannelClassification> {
        self.classifications.iter().find(|c| &c.channel == channel)
    }

    pub fn summaries(&self) -> &[ChannelSummary] {
        &self.summaries
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    pub(crate) fn set_state(&mut self, state: EngineState) {
        self.state = state;
    }

    pub(crate) fn push_record(&mut self, record: PointRecord) {
        self.records.push(record);
    }

    pub(crate) fn record_fault(&mut self, error: &CalibrationError, point_index: Option<usize>) {
        let channel = match error {
            CalibrationError::DataQuality { channel, .. } => ChannelId::try_from(channel.as_str()).ok(),
            _ => None,
        };
        self.fault = Some(FaultRecord {
            kind: error.kind(),
            point_index,
            channel,
            message: error.to_string(),
            at: Utc::now(),
        });
    }

    pub(crate) fn mark_emergency_stop(&mut self) {
        self.emergency_stop = true;
    }

    /// Computes per-channel results over the completed points and seals the
    /// session.
    pub(crate) fn finalize(&mut self) {
        let results: Vec<ClassificationResult> = self
            .records
            .iter()
            .flat_map(|r| r.classification.iter().cloned())
            .collect();

        self.classifications = self
            .sensor_channels()
            .map(|channel| ClassificationEngine::classify_channel(channel, &results))
            .collect();
        self.summaries = self
            .sensor_channels()
            .filter_map(|channel| summarize(&channel.id, &results))
            .collect();
        self.finished_at = Some(Utc::now());
    }
}

fn summarize(channel: &ChannelId, results: &[ClassificationResult]) -> Option<ChannelSummary> {
    let (temperatures, errors): (Vec<f64>, Vec<f64>) = results
        .iter()
        .filter(|r| &r.channel == channel)
        .map(|r| (r.temperature_c, r.deviation_c))
        .unzip();
    if errors.is_empty() {
        return None;
    }

    Some(ChannelSummary {
        channel: channel.clone(),
        points: errors.len(),
        mean_error_c: errors.iter().sum::<f64>() / errors.len() as f64,
        max_abs_error_c: StatisticsEngine::max_abs(&errors).unwrap_or(0.0),
        fit: StatisticsEngine::linear_fit(&temperatures, &errors),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::model::{AccuracyClass, SensorType};

    fn record(index: usize, sensor: &Channel, reference_c: f64, sensor_c: f64) -> PointRecord {
        let point = CalibrationPoint {
            index,
            target_c: reference_c,
            tolerance_c: 0.5,
            dwell_s: 0.0,
        };
        PointRecord {
            point,
            started_at: Utc::now(),
            completed_at: Utc::now(),
            stabilization_s: 0.0,
            measurements: Vec::new(),
            statistics: Vec::new(),
            uncertainty: Vec::new(),
            classification: vec![ClassificationEngine::classify_point(sensor, index, sensor_c, reference_c)],
        }
    }

    #[test]
    fn test_finalize_builds_summaries() {
        let mut config = Config::default();
        config.channels[1].declared_class = Some(AccuracyClass::A);
        let mut session = CalibrationSession::new(config);
        let sensor = session.channels()[1].clone();
        assert_eq!(sensor.sensor, SensorType::Pt100);

        session.push_record(record(0, &sensor, 50.0, 50.1));
        session.push_record(record(1, &sensor, 150.0, 150.3));
        session.set_state(EngineState::SessionComplete);
        session.finalize();

        assert!(session.is_finished());
        let summary = &session.summaries()[0];
        assert_eq!(summary.points, 2);
        assert!((summary.max_abs_error_c - 0.3).abs() < 1e-9);
        let fit = summary.fit.unwrap();
        assert!((fit.slope - 0.002).abs() < 1e-9);
        // AA allows 0.355 at 150 °C and 0.185 at 50 °C.
        assert_eq!(session.classification(&sensor.id).unwrap().assigned, Some(AccuracyClass::AA));
    }

    #[test]
    fn test_data_quality_fault_names_the_channel() {
        let mut session = CalibrationSession::new(Config::default());
        let err = CalibrationError::DataQuality {
            point_index: 2,
            channel: "B0".to_string(),
            invalid: 5,
            total: 10,
        };
        session.record_fault(&err, Some(2));
        let fault = session.fault().unwrap();
        assert_eq!(fault.kind, ErrorKind::DataQuality);
        assert_eq!(fault.channel, Some(ChannelId::try_from("B0").unwrap()));
    }
}
