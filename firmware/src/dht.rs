//! DHT22 on a single open-drain GPIO line.

use defmt::warn;
use embedded_dht_rs::dht22::Dht22;
use esp_hal::delay::Delay;
use esp_hal::gpio::{DriveMode, Flex, InputConfig, OutputConfig, Pull};
use thermowatch::sensor::{HumiditySensor, RawSample};

pub struct Dht22Sensor {
    pin: Flex<'static>,
    delay: Delay,
}

impl Dht22Sensor {
    pub fn new(mut pin: Flex<'static>) -> Self {
        pin.apply_output_config(
            &OutputConfig::default()
                .with_drive_mode(DriveMode::OpenDrain)
                .with_pull(Pull::Up),
        );
        let mut sensor = Self {
            pin,
            delay: Delay::new(),
        };
        sensor.release_line();
        sensor
    }

    /// Open-drain idle: output driver enabled but not pulling, input enabled,
    /// so the driver can both pull the line low and read the sensor's reply.
    fn release_line(&mut self) {
        self.pin.set_high();
        self.pin.set_output_enable(true);
        self.pin.set_input_enable(true);
    }
}

impl HumiditySensor for Dht22Sensor {
    fn sample(&mut self) -> RawSample {
        // The driver only borrows the line, so a reset never has to take it back.
        let mut dht = Dht22::new(&mut self.pin, self.delay);
        match dht.read() {
            Ok(reading) => RawSample {
                temperature: reading.temperature,
                humidity: reading.humidity,
            },
            Err(e) => {
                warn!("dht: read error: {:?}", defmt::Debug2Format(&e));
                RawSample::FAILED
            }
        }
    }

    fn drive_line_low(&mut self) {
        self.pin.set_output_enable(true);
        self.pin.set_low();
    }

    fn reinitialize(&mut self) {
        // The pull-up brings the released line back to idle high.
        self.release_line();
    }

    fn enable_pull_up(&mut self) {
        self.pin
            .apply_input_config(&InputConfig::default().with_pull(Pull::Up));
        self.release_line();
    }
}
