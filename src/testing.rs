//! In-memory doubles for the hardware and network ports.

use std::collections::VecDeque;
use std::string::{String, ToString};
use std::vec::Vec;

use core::net::Ipv4Addr;

use embedded_hal_async::delay::DelayNs;

use crate::clock::{ClockError, WallClock};
use crate::config::{BrokerConfig, BrokerEndpoint, TrustMaterial, WifiCredentials};
use crate::mqtt::{BrokerClient, OutgoingMessage};
use crate::network::WifiLink;
use crate::sensor::{HumiditySensor, RawSample, StatusNotifier};

/// Records requested sleeps in milliseconds instead of sleeping.
#[derive(Default)]
pub(crate) struct MockDelay {
    pub sleeps: Vec<u32>,
}

impl MockDelay {
    pub fn total_ms(&self) -> u64 {
        self.sleeps.iter().map(|&ms| u64::from(ms)).sum()
    }
}

impl DelayNs for MockDelay {
    async fn delay_ns(&mut self, ns: u32) {
        self.sleeps.push(ns / 1_000_000);
    }

    async fn delay_us(&mut self, us: u32) {
        self.sleeps.push(us / 1_000);
    }

    async fn delay_ms(&mut self, ms: u32) {
        self.sleeps.push(ms);
    }
}

/// Replays a fixed list of samples, then fails forever.
#[derive(Default)]
pub(crate) struct ScriptedSensor {
    samples: VecDeque<RawSample>,
    pub samples_taken: u32,
    pub line_low: u32,
    pub reinits: u32,
    pub pull_ups: u32,
}

impl ScriptedSensor {
    pub fn new(samples: impl IntoIterator<Item = RawSample>) -> Self {
        Self {
            samples: samples.into_iter().collect(),
            ..Self::default()
        }
    }
}

impl HumiditySensor for ScriptedSensor {
    fn sample(&mut self) -> RawSample {
        self.samples_taken += 1;
        self.samples.pop_front().unwrap_or(RawSample::FAILED)
    }

    fn drive_line_low(&mut self) {
        self.line_low += 1;
    }

    fn reinitialize(&mut self) {
        self.reinits += 1;
    }

    fn enable_pull_up(&mut self) {
        self.pull_ups += 1;
    }
}

/// Keeps every notice as encoded JSON.
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    pub messages: Vec<String>,
}

impl StatusNotifier for RecordingNotifier {
    async fn notify(&mut self, message: &OutgoingMessage<'_>) {
        let payload = message.encode().unwrap();
        self.messages.push(payload.as_str().to_string());
    }
}

/// Station interface that associates on the n-th attempt.
pub(crate) struct MockLink {
    connected: bool,
    succeed_on: u32,
    /// Report every attempt as failed, even the one that brings the link up.
    pub associate_fails: bool,
    pub associate_calls: u32,
    pub disconnect_calls: u32,
    pub last_ssid: Option<String>,
    pub ip: Option<Ipv4Addr>,
}

impl MockLink {
    pub fn connected() -> Self {
        Self {
            connected: true,
            ..Self::connects_after(1)
        }
    }

    pub fn connects_after(attempts: u32) -> Self {
        Self {
            connected: false,
            succeed_on: attempts,
            associate_fails: false,
            associate_calls: 0,
            disconnect_calls: 0,
            last_ssid: None,
            ip: Some(Ipv4Addr::new(192, 168, 1, 42)),
        }
    }

    pub fn drop_association(&mut self) {
        self.connected = false;
    }
}

impl WifiLink for MockLink {
    type Err = ();

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn disconnect(&mut self) -> Result<(), ()> {
        self.disconnect_calls += 1;
        self.connected = false;
        Ok(())
    }

    async fn associate(&mut self, credentials: &WifiCredentials) -> Result<(), ()> {
        self.associate_calls += 1;
        self.last_ssid = Some(credentials.ssid.to_string());
        if self.associate_calls >= self.succeed_on {
            self.connected = true;
        }
        if self.connected && !self.associate_fails {
            Ok(())
        } else {
            Err(())
        }
    }

    fn ipv4_address(&self) -> Option<Ipv4Addr> {
        self.ip.filter(|_| self.connected)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MockBrokerError {
    /// CONNACK reason code, as the real adapter would surface it
    Refused(u8),
    ConnectionLost,
    PublishRejected,
}

/// Broker that refuses a set number of connections before accepting.
pub(crate) struct MockBroker {
    connected: bool,
    rejections_left: u32,
    pub connect_calls: u32,
    pub close_calls: u32,
    pub trust_installs: u32,
    pub last_endpoint: Option<BrokerEndpoint>,
    pub fail_poll: bool,
    pub polls: u32,
    pub fail_publish: bool,
    pub publish_calls: u32,
    pub published: Vec<(String, String)>,
}

impl MockBroker {
    pub fn connected() -> Self {
        Self {
            connected: true,
            ..Self::rejects(0)
        }
    }

    pub fn disconnected() -> Self {
        Self::rejects(0)
    }

    pub fn rejects(connections: u32) -> Self {
        Self {
            connected: false,
            rejections_left: connections,
            connect_calls: 0,
            close_calls: 0,
            trust_installs: 0,
            last_endpoint: None,
            fail_poll: false,
            polls: 0,
            fail_publish: false,
            publish_calls: 0,
            published: Vec::new(),
        }
    }
}

impl BrokerClient for MockBroker {
    type Err = MockBrokerError;

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn install_trust(&mut self, _trust: &TrustMaterial) -> Result<(), MockBrokerError> {
        self.trust_installs += 1;
        Ok(())
    }

    async fn connect(
        &mut self,
        endpoint: &BrokerEndpoint,
        _client_id: &str,
        _keep_alive_secs: u16,
    ) -> Result<(), MockBrokerError> {
        self.connect_calls += 1;
        self.last_endpoint = Some(*endpoint);
        if self.rejections_left > 0 {
            self.rejections_left -= 1;
            // Server unavailable
            return Err(MockBrokerError::Refused(0x88));
        }
        self.connected = true;
        Ok(())
    }

    async fn close(&mut self) {
        self.close_calls += 1;
        self.connected = false;
    }

    async fn poll(&mut self) -> Result<(), MockBrokerError> {
        self.polls += 1;
        if self.fail_poll {
            self.connected = false;
            return Err(MockBrokerError::ConnectionLost);
        }
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), MockBrokerError> {
        self.publish_calls += 1;
        if self.fail_publish {
            return Err(MockBrokerError::PublishRejected);
        }
        let payload = core::str::from_utf8(payload).unwrap();
        self.published.push((topic.to_string(), payload.to_string()));
        Ok(())
    }
}

/// Wall clock pinned to a settable Unix time.
pub(crate) struct MockClock {
    pub now: u64,
    pub sync_fails: bool,
    pub sync_calls: u32,
}

impl MockClock {
    pub fn at(now: u64) -> Self {
        Self {
            now,
            sync_fails: false,
            sync_calls: 0,
        }
    }
}

impl WallClock for MockClock {
    async fn synchronize(&mut self) -> Result<(), ClockError> {
        self.sync_calls += 1;
        if self.sync_fails {
            Err(ClockError::NoResponse)
        } else {
            Ok(())
        }
    }

    fn unix_time(&self) -> u64 {
        self.now
    }
}

pub(crate) fn broker_config() -> BrokerConfig {
    BrokerConfig {
        endpoint: BrokerEndpoint {
            host: "broker.test",
            port: 8883,
        },
        client_id: "thermowatch-test",
        topic: "test/status",
        trust: TrustMaterial {
            root_ca: "ca",
            client_cert: "cert",
            private_key: "key",
        },
        keep_alive_secs: 60,
    }
}
