//! Humidity/temperature sensor module
//!
//! This module contains the sensor port, the reading types and the reader
//! that applies the recovery policy for single-wire DHT-class sensors: one
//! failed sample triggers exactly one hard reset and one retry.

use embedded_hal_async::delay::DelayNs;

use crate::config::SensorTiming;
use crate::mqtt::payload::{OutgoingMessage, SENSOR_FAILURE_MESSAGE, SENSOR_RECOVERED_MESSAGE};
use crate::retry::pause;

/// Result of one physical sample. Either channel is NaN when the sensor did
/// not answer correctly.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RawSample {
    /// Degrees Celsius
    pub temperature: f32,
    /// Relative humidity, percent
    pub humidity: f32,
}

impl RawSample {
    pub const FAILED: RawSample = RawSample {
        temperature: f32::NAN,
        humidity: f32::NAN,
    };

    pub fn is_valid(&self) -> bool {
        !self.temperature.is_nan() && !self.humidity.is_nan()
    }
}

/// Sensor reading handed to the publisher
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SensorReading {
    /// Degrees Celsius
    pub temperature: f32,
    /// Relative humidity, percent
    pub humidity: f32,
    /// False when the sample could not be recovered
    pub valid: bool,
}

impl SensorReading {
    pub const INVALID: SensorReading = SensorReading {
        temperature: f32::NAN,
        humidity: f32::NAN,
        valid: false,
    };
}

impl From<RawSample> for SensorReading {
    fn from(sample: RawSample) -> Self {
        Self {
            temperature: sample.temperature,
            humidity: sample.humidity,
            valid: sample.is_valid(),
        }
    }
}

/// Port for one physical humidity/temperature sensor on a single data line.
pub trait HumiditySensor {
    /// Take one sample. Failed channels come back as NaN.
    fn sample(&mut self) -> RawSample;

    /// Switch the data line to output and drive it low.
    fn drive_line_low(&mut self);

    /// Release the line and reinitialize the driver.
    fn reinitialize(&mut self);

    /// Configure the data line as input with pull-up (power-on state).
    fn enable_pull_up(&mut self);
}

/// Upstream sink for sensor health notices.
#[allow(async_fn_in_trait)]
pub trait StatusNotifier {
    async fn notify(&mut self, message: &OutgoingMessage<'_>);
}

/// Sensor wrapper applying the bounded reset-and-retry policy.
pub struct SensorReader<S> {
    sensor: S,
    timing: SensorTiming,
    resets: u32,
}

impl<S: HumiditySensor> SensorReader<S> {
    pub fn new(sensor: S, timing: SensorTiming) -> Self {
        Self {
            sensor,
            timing,
            resets: 0,
        }
    }

    /// Power-on initialization: pull-up, settle, then start the driver.
    pub async fn begin<D: DelayNs>(&mut self, delay: &mut D) {
        self.sensor.enable_pull_up();
        pause(delay, self.timing.power_on_settle).await;
        self.sensor.reinitialize();
        info!("sensor: initialized");
    }

    /// Sample once, recovering a failed sample with one reset and one retry.
    pub async fn read<N, D>(&mut self, notifier: &mut N, delay: &mut D) -> SensorReading
    where
        N: StatusNotifier,
        D: DelayNs,
    {
        let first = self.sensor.sample();
        if first.is_valid() {
            debug!(
                "sensor: temperature={} humidity={}",
                first.temperature, first.humidity
            );
            return first.into();
        }

        warn!("sensor: read failed, resetting");
        notifier
            .notify(&OutgoingMessage::notice(SENSOR_FAILURE_MESSAGE))
            .await;

        self.hard_reset(delay).await;
        pause(delay, self.timing.stabilize).await;

        let retry = self.sensor.sample();
        if !retry.is_valid() {
            error!("sensor: read failed again after reset");
            return SensorReading::INVALID;
        }

        info!(
            "sensor: recovered after reset, temperature={} humidity={}",
            retry.temperature, retry.humidity
        );
        notifier
            .notify(&OutgoingMessage::notice(SENSOR_RECOVERED_MESSAGE))
            .await;
        retry.into()
    }

    /// Pull the data line low briefly and restart the driver.
    pub async fn hard_reset<D: DelayNs>(&mut self, delay: &mut D) {
        info!("sensor: hard reset");
        self.sensor.drive_line_low();
        pause(delay, self.timing.reset_pulse).await;
        self.sensor.reinitialize();
        self.resets = self.resets.saturating_add(1);
        info!("sensor: hard reset completed");
    }

    /// Hard resets performed since start-up.
    pub fn resets(&self) -> u32 {
        self.resets
    }

    pub fn sensor(&self) -> &S {
        &self.sensor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockDelay, RecordingNotifier, ScriptedSensor};
    use embassy_futures::block_on;

    fn good() -> RawSample {
        RawSample {
            temperature: 21.5,
            humidity: 48.0,
        }
    }

    fn half_failed() -> RawSample {
        RawSample {
            temperature: 21.5,
            humidity: f32::NAN,
        }
    }

    #[test]
    fn valid_first_sample_needs_no_recovery() {
        let mut reader = SensorReader::new(ScriptedSensor::new([good()]), SensorTiming::default());
        let mut notifier = RecordingNotifier::default();
        let mut delay = MockDelay::default();

        let reading = block_on(reader.read(&mut notifier, &mut delay));

        assert!(reading.valid);
        assert_eq!(reading.temperature, 21.5);
        assert_eq!(reader.resets(), 0);
        assert!(notifier.messages.is_empty());
        assert!(delay.sleeps.is_empty());
    }

    #[test]
    fn failed_then_valid_recovers_with_one_reset() {
        let mut reader = SensorReader::new(
            ScriptedSensor::new([RawSample::FAILED, good()]),
            SensorTiming::default(),
        );
        let mut notifier = RecordingNotifier::default();
        let mut delay = MockDelay::default();

        let reading = block_on(reader.read(&mut notifier, &mut delay));

        assert!(reading.valid);
        assert_eq!(reading.humidity, 48.0);
        assert_eq!(reader.resets(), 1);
        assert_eq!(reader.sensor().line_low, 1);
        assert_eq!(
            notifier.messages,
            vec![
                r#"{"message":"Failed to read from DHT sensor"}"#,
                r#"{"message":"DHT read successful after reset"}"#,
            ]
        );
        // reset pulse, then stabilization
        assert_eq!(delay.sleeps, vec![50, 2_000]);
    }

    #[test]
    fn failed_twice_reports_invalid_after_single_reset() {
        let mut reader = SensorReader::new(
            ScriptedSensor::new([RawSample::FAILED, half_failed(), good()]),
            SensorTiming::default(),
        );
        let mut notifier = RecordingNotifier::default();
        let mut delay = MockDelay::default();

        let reading = block_on(reader.read(&mut notifier, &mut delay));

        assert!(!reading.valid);
        assert_eq!(reader.resets(), 1);
        assert_eq!(reader.sensor().samples_taken, 2);
        assert_eq!(
            notifier.messages,
            vec![r#"{"message":"Failed to read from DHT sensor"}"#]
        );
    }

    #[test]
    fn one_nan_channel_counts_as_failure() {
        assert!(!half_failed().is_valid());
        assert!(!SensorReading::from(half_failed()).valid);
        assert!(good().is_valid());
    }

    #[test]
    fn begin_settles_before_starting_driver() {
        let mut reader = SensorReader::new(ScriptedSensor::default(), SensorTiming::default());
        let mut delay = MockDelay::default();

        block_on(reader.begin(&mut delay));

        assert_eq!(reader.sensor().pull_ups, 1);
        assert_eq!(reader.sensor().reinits, 1);
        assert_eq!(delay.sleeps, vec![1_000]);
    }
}
