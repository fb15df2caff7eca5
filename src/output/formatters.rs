use chrono::Utc;

use crate::calibration::events::EngineEvent;
use crate::calibration::session::CalibrationSession;
use crate::utils::error::CalibrationError;

pub trait DataFormatter: Send + Sync {
    fn format_session(&self, session: &CalibrationSession) -> Result<String, CalibrationError>;

    /// One progress line for a live event, or `None` to skip it.
    fn format_event(&self, event: &EngineEvent) -> Option<String>;

    fn format_header(&self) -> String;

    fn file_extension(&self) -> &str;
}

fn class_label<T: ToString>(class: Option<T>) -> String {
    class.map_or("out of tolerance".to_string(), |c| c.to_string())
}

pub struct ConsoleFormatter;

impl DataFormatter for ConsoleFormatter {
    fn format_session(&self, session: &CalibrationSession) -> Result<String, CalibrationError> {
        let mut output = format!("📋 Session {} - {}\n", session.name(), session.id());
        if !session.operator().is_empty() {
            output.push_str(&format!("Operator: {}\n", session.operator()));
        }
        output.push_str(&format!(
            "State: {}  ({} of {} points completed)\n",
            session.state(),
            session.records().len(),
            session.points().len()
        ));
        if let Some(fault) = session.fault() {
            output.push_str(&format!("❌ {}: {}\n", fault.kind, fault.message));
        }
        if session.emergency_stop() {
            output.push_str("🛑 Emergency stop was triggered\n");
        }
        output.push_str(&"═".repeat(72));
        output.push('\n');

        for record in session.records() {
            output.push_str(&format!(
                "🌡️ Point {} @ {:.2} °C (stable after {:.0} s)\n",
                record.point.index, record.point.target_c, record.stabilization_s
            ));
            output.push_str(&format!(
                "  {:<4} {:>10} {:>9} {:>9} {:>10} {:>9}  {}\n",
                "Ch", "Mean °C", "s °C", "u_A °C", "Dev °C", "U(k=2)", "Class"
            ));
            for stats in &record.statistics {
                let budget = record.budget_for(&stats.channel);
                let result = record.classification_for(&stats.channel);
                output.push_str(&format!(
                    "  {:<4} {:>10.4} {:>9} {:>9.5} {:>10} {:>9}  {}\n",
                    stats.channel,
                    stats.mean,
                    stats.std_dev.map_or("-".to_string(), |s| format!("{:.5}", s)),
                    stats.std_uncertainty,
                    result.map_or("-".to_string(), |r| format!("{:+.4}", r.deviation_c)),
                    budget.map_or("-".to_string(), |b| format!("{:.4}", b.expanded_uncertainty)),
                    result.map_or(String::new(), |r| class_label(r.class)),
                ));
            }
            output.push_str(&"-".repeat(72));
            output.push('\n');
        }

        for classification in session.classifications() {
            let verdict = match classification.meets_declared {
                Some(true) => " ✅ meets declared",
                Some(false) => " ❌ below declared",
                None => "",
            };
            output.push_str(&format!(
                "🏷️ {} ({}): {}{}\n",
                classification.channel,
                classification.sensor,
                class_label(classification.assigned),
                verdict
            ));
        }
        for summary in session.summaries() {
            let fit = summary.fit.map_or(String::new(), |f| {
                format!(", error = {:.6}·t {:+.4} (r² {:.4})", f.slope, f.intercept, f.r_squared)
            });
            output.push_str(&format!(
                "📈 {}: mean error {:+.4} °C, max |error| {:.4} °C{}\n",
                summary.channel, summary.mean_error_c, summary.max_abs_error_c, fit
            ));
        }
        Ok(output)
    }

    fn format_event(&self, event: &EngineEvent) -> Option<String> {
        match event {
            EngineEvent::StateChanged { to, point_index, .. } => Some(match point_index {
                Some(index) => format!("🔄 Point {}: {}", index, to),
                None => format!("🔄 {}", to),
            }),
            EngineEvent::StabilityProgress {
                point_index,
                furnace_c,
                reference_c,
                elapsed_s,
                ..
            } => Some(format!(
                "⏳ Point {} t+{:.0}s furnace {:.3} °C reference {:.3} °C",
                point_index, elapsed_s, furnace_c, reference_c
            )),
            EngineEvent::ReadingTaken { reading, repetition, .. } if reading.valid => Some(format!(
                "📊 {} #{} {:.4} °C",
                reading.channel,
                repetition + 1,
                reading.temperature_c
            )),
            EngineEvent::Fault { kind, message, .. } => Some(format!("❌ {}: {}", kind, message)),
            _ => None,
        }
    }

    fn format_header(&self) -> String {
        format!("🚀 Temperature calibration - {}\n", Utc::now().format("%Y-%m-%d %H:%M:%S"))
    }

    fn file_extension(&self) -> &str {
        "txt"
    }
}

pub struct JsonFormatter;

impl DataFormatter for JsonFormatter {
    fn format_session(&self, session: &CalibrationSession) -> Result<String, CalibrationError> {
        Ok(serde_json::to_string_pretty(session)?)
    }

    fn format_event(&self, event: &EngineEvent) -> Option<String> {
        let value = match event {
            EngineEvent::StateChanged { from, to, point_index } => serde_json::json!({
                "event": "state_changed",
                "from": from,
                "to": to,
                "point_index": point_index,
            }),
            EngineEvent::ReadingTaken {
                point_index,
                repetition,
                reading,
            } => serde_json::json!({
                "event": "reading",
                "point_index": point_index,
                "repetition": repetition,
                "reading": reading,
            }),
            EngineEvent::Fault {
                kind,
                point_index,
                channel,
                message,
            } => serde_json::json!({
                "event": "fault",
                "kind": kind,
                "point_index": point_index,
                "channel": channel,
                "message": message,
            }),
            _ => return None,
        };
        Some(value.to_string())
    }

    fn format_header(&self) -> String {
        String::new() // JSON doesn't need headers
    }

    fn file_extension(&self) -> &str {
        "json"
    }
}

/// One row per point and channel.
pub struct CsvFormatter;

impl DataFormatter for CsvFormatter {
    fn format_session(&self, session: &CalibrationSession) -> Result<String, CalibrationError> {
        let mut csv = self.format_header();
        for record in session.records() {
            for stats in &record.statistics {
                let sensor = session
                    .channels()
                    .iter()
                    .find(|c| c.id == stats.channel)
                    .map_or(String::new(), |c| c.sensor.to_string());
                let budget = record.budget_for(&stats.channel);
                let result = record.classification_for(&stats.channel);
                csv.push_str(&format!(
                    "{},{},{},{},{},{:.5},{},{:.6},{},{},{},{}\n",
                    session.id(),
                    record.point.index,
                    record.point.target_c,
                    stats.channel,
                    sensor,
                    stats.mean,
                    stats.std_dev.map_or(String::new(), |s| format!("{:.6}", s)),
                    stats.std_uncertainty,
                    result.map_or(String::new(), |r| format!("{:.5}", r.deviation_c)),
                    budget.map_or(String::new(), |b| format!("{:.6}", b.expanded_uncertainty)),
                    result.map_or(String::new(), |r| format!("{:.4}", r.tolerance_c)),
                    result.map_or(String::new(), |r| class_label(r.class)),
                ));
            }
        }
        Ok(csv)
    }

    fn format_event(&self, event: &EngineEvent) -> Option<String> {
        match event {
            EngineEvent::ReadingTaken {
                point_index,
                repetition,
                reading,
            } => Some(format!(
                "{},{},{},{},{},{}",
                point_index,
                repetition,
                reading.channel,
                reading.timestamp.to_rfc3339(),
                if reading.valid { reading.temperature_c.to_string() } else { String::new() },
                reading.valid
            )),
            _ => None,
        }
    }

    fn format_header(&self) -> String {
        "Session,Point,Target,Channel,Sensor,Mean,StdDev,TypeA,Deviation,Expanded,Tolerance,Class\n".to_string()
    }

    fn file_extension(&self) -> &str {
        "csv"
    }
}

pub fn formatter_for(name: &str) -> Option<Box<dyn DataFormatter>> {
    match name {
        "console" | "text" => Some(Box::new(ConsoleFormatter)),
        "json" => Some(Box::new(JsonFormatter)),
        "csv" => Some(Box::new(CsvFormatter)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::classification::ClassificationEngine;
    use crate::calibration::events::EngineState;
    use crate::calibration::model::{MeasurementSet, MeasurementSetBuilder, Reading};
    use crate::calibration::session::PointRecord;
    use crate::calibration::statistics::StatisticsEngine;
    use crate::calibration::uncertainty::UncertaintyEngine;
    use crate::config::Config;

    /// Reference at 50 °C and B0 reading 0.1 °C high.
    fn finished_session() -> CalibrationSession {
        let config = Config::default();
        let channels = config.ordered_channels();
        let mut session = CalibrationSession::new(config.clone());
        let point = session.points()[0].clone();

        let values = [[50.0, 50.02, 49.98], [50.1, 50.12, 50.08]];
        let sets: Vec<MeasurementSet> = channels
            .iter()
            .zip(values)
            .map(|(channel, values)| {
                let mut builder = MeasurementSetBuilder::new(channel.id.clone(), point.index, values.len());
                for v in values {
                    builder.push(Reading::valid(channel.id.clone(), v, v)).unwrap();
                }
                builder.finish().unwrap()
            })
            .collect();
        let statistics: Vec<_> = sets.iter().map(|s| StatisticsEngine::compute(s).unwrap()).collect();
        let engine = UncertaintyEngine::new(config.uncertainty.clone());

        session.push_record(PointRecord {
            point: point.clone(),
            started_at: Utc::now(),
            completed_at: Utc::now(),
            stabilization_s: 120.0,
            uncertainty: vec![
                engine.budget(&channels[0], &statistics[0], None),
                engine.budget(&channels[1], &statistics[1], Some(&statistics[0])),
            ],
            classification: vec![ClassificationEngine::classify_point(
                &channels[1],
                point.index,
                statistics[1].mean,
                statistics[0].mean,
            )],
            measurements: sets,
            statistics,
        });
        session.set_state(EngineState::SessionComplete);
        session.finalize();
        session
    }

    #[test]
    fn test_csv_has_one_row_per_channel() {
        let csv = CsvFormatter.format_session(&finished_session()).unwrap();
        let lines: Vec<&str> = csv.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Session,Point,Target,Channel"));
        assert!(lines[1].contains(",0,50,A0,PT100,"));
        assert!(lines[1].ends_with(','));
        assert!(lines[2].contains(",0,50,B0,PT100,"));
        assert!(lines[2].ends_with(",AA"));
    }

    #[test]
    fn test_json_report_parses_back() {
        let session = finished_session();
        let json = JsonFormatter.format_session(&session).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["state"], "SessionComplete");
        assert_eq!(value["records"].as_array().unwrap().len(), 1);
        assert_eq!(value["id"], session.id().to_string());
    }

    #[test]
    fn test_console_report_names_class_verdict() {
        let text = ConsoleFormatter.format_session(&finished_session()).unwrap();
        assert!(text.contains("Point 0 @ 50.00 °C"));
        assert!(text.contains("B0 (PT100): AA ✅ meets declared"));
    }

    #[test]
    fn test_unknown_format_is_rejected() {
        assert!(formatter_for("xml").is_none());
        assert_eq!(formatter_for("csv").unwrap().file_extension(), "csv");
    }
}
