use log::{debug, warn};
use std::time::Duration;
use tokio::sync::watch;

use crate::calibration::events::{abortable, check_control, sleep_or_abort, ControlSignal, EngineEvent, EventBus};
use crate::calibration::model::{CalibrationPoint, Channel, MeasurementSet, MeasurementSetBuilder, Reading};
use crate::config::SamplingConfig;
use crate::devices::{DeviceStatus, Furnace, Thermometer};
use crate::utils::error::CalibrationError;

/// Repeated reading of every channel at a point already confirmed stable.
pub struct MeasurementSampler<'a> {
    thermometer: &'a dyn Thermometer,
    furnace: &'a dyn Furnace,
    config: &'a SamplingConfig,
    bus: &'a EventBus,
}

impl<'a> MeasurementSampler<'a> {
    pub fn new(
        thermometer: &'a dyn Thermometer,
        furnace: &'a dyn Furnace,
        config: &'a SamplingConfig,
        bus: &'a EventBus,
    ) -> Self {
        Self {
            thermometer,
            furnace,
            config,
            bus,
        }
    }

    /// Most invalid readings a channel may collect before the point fails.
    pub fn invalid_budget(&self) -> usize {
        (self.config.max_invalid_fraction * self.config.repetitions as f64).floor() as usize
    }

    /// One complete set per channel, in `channels` order. On abort or error no
    /// set is returned.
    pub async fn sample(
        &self,
        point: &CalibrationPoint,
        channels: &[Channel],
        control: &mut watch::Receiver<ControlSignal>,
    ) -> Result<Vec<MeasurementSet>, CalibrationError> {
        let repetitions = self.config.repetitions;
        let delay = Duration::from_millis(self.config.inter_sample_delay_ms);
        let mut builders: Vec<MeasurementSetBuilder> = channels
            .iter()
            .map(|c| MeasurementSetBuilder::new(c.id.clone(), point.index, repetitions))
            .collect();

        for repetition in 0..repetitions {
            check_control(control).await?;
            let device_fault = abortable(control, self.devices_faulted()).await?;
            if device_fault {
                warn!(
                    "⚠️ Device fault during repetition {} at point {}; readings marked invalid",
                    repetition + 1,
                    point.index
                );
            }

            for (channel, builder) in channels.iter().zip(builders.iter_mut()) {
                check_control(control).await?;
                self.bus.emit(EngineEvent::ChannelSelected {
                    point_index: point.index,
                    channel: channel.id.clone(),
                    repetition,
                });
                self.bus.update_status(|s| s.channel = Some(channel.id.clone()));

                let reading = if device_fault {
                    Reading::invalid(channel.id.clone())
                } else {
                    abortable(control, self.read(channel)).await?
                };
                debug!(
                    "📊 {} #{}: {:.4} °C (raw {:.4}){}",
                    channel.id,
                    repetition + 1,
                    reading.temperature_c,
                    reading.raw_value,
                    if reading.valid { "" } else { " (invalid)" }
                );

                if reading.valid {
                    let value = reading.temperature_c;
                    self.bus.update_status(|s| {
                        s.latest.insert(channel.id.clone(), value);
                    });
                }
                self.bus.emit(EngineEvent::ReadingTaken {
                    point_index: point.index,
                    repetition,
                    reading: reading.clone(),
                });
                builder.push(reading)?;

                if builder.invalid_count() > self.invalid_budget() {
                    return Err(CalibrationError::DataQuality {
                        point_index: point.index,
                        channel: channel.id.to_string(),
                        invalid: builder.invalid_count(),
                        total: repetitions,
                    });
                }
            }

            if repetition + 1 < repetitions {
                sleep_or_abort(delay, control).await?;
            }
        }

        builders.into_iter().map(MeasurementSetBuilder::finish).collect()
    }

    async fn devices_faulted(&self) -> Result<bool, CalibrationError> {
        let furnace = self.furnace.read_status().await?;
        let thermometer = self.thermometer.read_status().await?;
        Ok(furnace == DeviceStatus::Fault || thermometer == DeviceStatus::Fault)
    }

    /// Temperature, then the raw resistance or voltage behind it. A
    /// device-reported fault on either yields an invalid reading; any other
    /// failure ends sampling.
    async fn read(&self, channel: &Channel) -> Result<Reading, CalibrationError> {
        match self.measure(channel).await {
            Ok((raw_value, temperature_c)) => Ok(Reading::valid(channel.id.clone(), raw_value, temperature_c)),
            Err(CalibrationError::DeviceFault { reason, .. }) => {
                warn!("⚠️ {} reading invalid: {}", channel.id, reason);
                Ok(Reading::invalid(channel.id.clone()))
            }
            Err(e) => Err(e),
        }
    }

    async fn measure(&self, channel: &Channel) -> Result<(f64, f64), CalibrationError> {
        let temperature_c = self.thermometer.read_channel(channel).await?;
        let raw_value = self.thermometer.read_raw(channel).await?;
        Ok((raw_value, temperature_c))
    }
}
