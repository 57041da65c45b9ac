//! Thermowatch: a resident telemetry agent for a DHT22 humidity and
//! temperature sensor.
//!
//! The crate holds the device-independent part of the agent. It keeps a Wi-Fi
//! link and a mutually authenticated MQTT session alive, samples the sensor
//! with a bounded reset-and-retry policy, and publishes one JSON report at
//! every reporting instant of the wall clock.
//!
//! Hardware and network stacks sit behind small async port traits
//! ([`network::WifiLink`], [`mqtt::BrokerClient`], [`sensor::HumiditySensor`],
//! [`clock::WallClock`]) so the supervision logic runs unchanged on the device
//! and in host tests. The ESP32 adapters live in the `firmware` package.
#![cfg_attr(not(test), no_std)]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod clock;
pub mod config;
pub mod mqtt;
pub mod network;
pub mod retry;
pub mod scheduler;
pub mod sensor;

#[cfg(test)]
mod testing;

pub use clock::{ClockError, TimeOfDay, WallClock};
pub use config::{BrokerConfig, ReportGuard, RetryPolicy, ScheduleConfig, WifiCredentials};
pub use mqtt::{BrokerClient, MessagingSession, OutgoingMessage, SessionError};
pub use network::{LinkError, NetworkSession, WifiLink};
pub use scheduler::{ReportingScheduler, TickOutcome};
pub use sensor::{HumiditySensor, SensorReader, SensorReading, StatusNotifier};
