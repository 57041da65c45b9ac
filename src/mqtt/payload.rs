//! Status message payloads.
//!
//! Messages are compact JSON with conditional fields: absent fields are
//! omitted, never written as `null`. Encoding builds the JSON by hand into a
//! `heapless::String` so numeric fields keep exactly two decimals; decoding
//! goes through `serde-json-core` and unescapes text into owned fields.

use core::fmt::Write;

use heapless::String;
use serde::Deserialize;

use crate::clock::TimeOfDay;
use crate::sensor::SensorReading;

/// Published when a sample fails, before recovery is attempted.
pub const SENSOR_FAILURE_MESSAGE: &str = "Failed to read from DHT sensor";
/// Published when a sample succeeds after a sensor reset.
pub const SENSOR_RECOVERED_MESSAGE: &str = "DHT read successful after reset";

/// Temperature at or above which a reading is treated as a heat alert.
pub const HEAT_ALERT_CELSIUS: f32 = 27.0;

pub const PAYLOAD_CAPACITY: usize = 256;

pub type Payload = String<PAYLOAD_CAPACITY>;

/// Error type for payload encoding and decoding
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PayloadError {
    /// Encoded message does not fit the payload buffer
    Overflow,
    /// Input is not a well-formed status message
    Malformed,
}

impl From<core::fmt::Error> for PayloadError {
    fn from(_: core::fmt::Error) -> Self {
        PayloadError::Overflow
    }
}

/// One status message. Every field is optional on the wire.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OutgoingMessage<'a> {
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    /// Day-boundary marker; only ever written as `true`.
    pub create_thread: bool,
    pub message: Option<&'a str>,
    /// Display time as `HH:MM`.
    pub current_time: Option<String<5>>,
}

/// A status message parsed back from the wire, text fields unescaped.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ReceivedMessage {
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub humidity: Option<f32>,
    #[serde(rename = "createThread", default)]
    pub create_thread: bool,
    #[serde(default)]
    pub message: Option<String<PAYLOAD_CAPACITY>>,
    #[serde(rename = "currentTime", default)]
    pub current_time: Option<String<5>>,
}

/// What a consumer of the message stream does with a message.
///
/// The day-boundary marker wins over everything else.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReportKind {
    /// Opens a new thread for the day.
    NewThread,
    /// Carries an error text or lacks a numeric channel.
    Fault,
    /// Temperature at or above [`HEAT_ALERT_CELSIUS`].
    HeatAlert,
    Reading,
}

impl<'a> OutgoingMessage<'a> {
    /// Message carrying only a text notice.
    pub fn notice(text: &'a str) -> Self {
        Self {
            message: Some(text),
            ..Self::default()
        }
    }

    /// The scheduled report for one reporting instant.
    ///
    /// A valid reading carries both channels and the display time; an invalid
    /// one carries only the failure text. Display midnight adds the
    /// day-boundary marker either way.
    pub fn report(reading: &SensorReading, display: &TimeOfDay) -> OutgoingMessage<'static> {
        let mut message = if reading.valid {
            OutgoingMessage {
                temperature: Some(reading.temperature),
                humidity: Some(reading.humidity),
                current_time: Some(display.hh_mm()),
                ..OutgoingMessage::default()
            }
        } else {
            OutgoingMessage::notice(SENSOR_FAILURE_MESSAGE)
        };
        message.create_thread = display.is_midnight();
        message
    }

    /// Serialize to compact JSON.
    pub fn encode(&self) -> Result<Payload, PayloadError> {
        let mut out = Payload::new();
        let mut fields = FieldWriter::new(&mut out)?;

        if let Some(temperature) = self.temperature {
            fields.raw("temperature", format_args!("{:.2}", temperature))?;
        }
        if let Some(humidity) = self.humidity {
            fields.raw("humidity", format_args!("{:.2}", humidity))?;
        }
        if self.create_thread {
            fields.raw("createThread", format_args!("true"))?;
        }
        if let Some(message) = self.message {
            fields.text("message", message)?;
        }
        if let Some(current_time) = &self.current_time {
            fields.text("currentTime", current_time)?;
        }

        fields.finish()?;
        Ok(out)
    }

    pub fn kind(&self) -> ReportKind {
        if self.create_thread {
            return ReportKind::NewThread;
        }
        match (self.temperature, self.humidity, self.message) {
            (Some(temperature), Some(_), None) if temperature >= HEAT_ALERT_CELSIUS => {
                ReportKind::HeatAlert
            }
            (Some(_), Some(_), None) => ReportKind::Reading,
            _ => ReportKind::Fault,
        }
    }
}

impl ReceivedMessage {
    /// Parse a payload produced by [`OutgoingMessage::encode`].
    pub fn decode(payload: &str) -> Result<Self, PayloadError> {
        let mut unescaped = [0u8; PAYLOAD_CAPACITY];
        serde_json_core::from_str_escaped::<ReceivedMessage>(payload, &mut unescaped)
            .map(|(message, _consumed)| message)
            .map_err(|_| PayloadError::Malformed)
    }

    /// Borrowed view, for comparison against what was sent.
    pub fn as_outgoing(&self) -> OutgoingMessage<'_> {
        OutgoingMessage {
            temperature: self.temperature,
            humidity: self.humidity,
            create_thread: self.create_thread,
            message: self.message.as_deref(),
            current_time: self.current_time.clone(),
        }
    }

    pub fn kind(&self) -> ReportKind {
        self.as_outgoing().kind()
    }
}

struct FieldWriter<'b> {
    out: &'b mut Payload,
    first: bool,
}

impl<'b> FieldWriter<'b> {
    fn new(out: &'b mut Payload) -> Result<Self, PayloadError> {
        out.push('{').map_err(|_| PayloadError::Overflow)?;
        Ok(Self { out, first: true })
    }

    fn key(&mut self, name: &str) -> Result<(), PayloadError> {
        if !self.first {
            self.out.push(',').map_err(|_| PayloadError::Overflow)?;
        }
        self.first = false;
        write!(self.out, "\"{}\":", name)?;
        Ok(())
    }

    fn raw(&mut self, name: &str, value: core::fmt::Arguments<'_>) -> Result<(), PayloadError> {
        self.key(name)?;
        self.out.write_fmt(value)?;
        Ok(())
    }

    fn text(&mut self, name: &str, value: &str) -> Result<(), PayloadError> {
        self.key(name)?;
        self.out.push('"').map_err(|_| PayloadError::Overflow)?;
        for c in value.chars() {
            match c {
                '"' => self.out.push_str("\\\"").map_err(|_| PayloadError::Overflow)?,
                '\\' => self.out.push_str("\\\\").map_err(|_| PayloadError::Overflow)?,
                '\n' => self.out.push_str("\\n").map_err(|_| PayloadError::Overflow)?,
                '\r' => self.out.push_str("\\r").map_err(|_| PayloadError::Overflow)?,
                '\t' => self.out.push_str("\\t").map_err(|_| PayloadError::Overflow)?,
                c if u32::from(c) < 0x20 => write!(self.out, "\\u{:04x}", u32::from(c))?,
                c => self.out.push(c).map_err(|_| PayloadError::Overflow)?,
            }
        }
        self.out.push('"').map_err(|_| PayloadError::Overflow)?;
        Ok(())
    }

    fn finish(self) -> Result<(), PayloadError> {
        self.out.push('}').map_err(|_| PayloadError::Overflow)
    }
}
