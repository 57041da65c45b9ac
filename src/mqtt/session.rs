//! Secure messaging session supervision.

use embedded_hal_async::delay::DelayNs;

use super::client::BrokerClient;
use super::payload::{OutgoingMessage, PayloadError};
use crate::config::{BrokerConfig, RetryPolicy};
use crate::fmt::Dbg;
use crate::retry::Attempts;
use crate::sensor::StatusNotifier;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionState {
    Disconnected,
    Connected,
}

/// Unified error type for messaging session operations
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionError {
    /// A bounded retry policy ran out of connection attempts
    RetriesExhausted { attempts: u32 },
    /// Publish attempted without a session
    NotConnected,
    /// Message could not be encoded
    Payload(PayloadError),
    /// Broker client rejected the publish
    PublishFailed,
}

impl From<PayloadError> for SessionError {
    fn from(e: PayloadError) -> Self {
        SessionError::Payload(e)
    }
}

/// Owns the broker client and keeps the session up.
pub struct MessagingSession<C> {
    client: C,
    config: BrokerConfig,
    retry: RetryPolicy,
    state: SessionState,
}

impl<C: BrokerClient> MessagingSession<C> {
    pub fn new(client: C, config: BrokerConfig, retry: RetryPolicy) -> Self {
        Self {
            client,
            config,
            retry,
            state: SessionState::Disconnected,
        }
    }

    /// Poll the client and refresh the cached state.
    pub fn state(&mut self) -> SessionState {
        self.state = if self.client.is_connected() {
            SessionState::Connected
        } else {
            SessionState::Disconnected
        };
        self.state
    }

    /// Return immediately if the session is up; otherwise block until the
    /// broker accepts a connection.
    ///
    /// The link must already be connected. Trust material is re-installed
    /// before every attempt and failures back off by a fixed interval.
    pub async fn ensure_connected<D: DelayNs>(
        &mut self,
        delay: &mut D,
    ) -> Result<(), SessionError> {
        if self.state() == SessionState::Connected {
            return Ok(());
        }

        let endpoint = self.config.endpoint;
        let mut attempts = Attempts::new(self.retry);
        loop {
            info!(
                "mqtt: connecting to {}:{} as '{}'...",
                endpoint.host, endpoint.port, self.config.client_id
            );
            match self.attempt_connect().await {
                Ok(()) => break,
                Err(e) => {
                    error!(
                        "mqtt: connection failed, rc={:?}, retrying in {}ms",
                        Dbg(&e),
                        self.retry.interval.as_millis()
                    );
                }
            }
            if !attempts.back_off(delay).await {
                error!(
                    "mqtt: giving up after {} attempts",
                    attempts.failures()
                );
                return Err(SessionError::RetriesExhausted {
                    attempts: attempts.failures(),
                });
            }
        }

        self.state = SessionState::Connected;
        info!("mqtt: connected to broker");
        Ok(())
    }

    async fn attempt_connect(&mut self) -> Result<(), C::Err> {
        self.client.install_trust(&self.config.trust).await?;
        self.client
            .connect(
                &self.config.endpoint,
                self.config.client_id,
                self.config.keep_alive_secs,
            )
            .await
    }

    /// Drop the session so the next `ensure_connected` performs a full
    /// reconnect. Used after the link underneath was re-established: a
    /// session opened over the old association is dead even if the client
    /// has not noticed yet.
    pub async fn invalidate(&mut self) {
        if self.client.is_connected() {
            info!("mqtt: link was replaced, closing stale session");
        }
        self.client.close().await;
        self.state = SessionState::Disconnected;
    }

    /// Service keepalive. Called on every tick.
    ///
    /// A failure marks the session down so the next tick reconnects.
    pub async fn pump(&mut self) {
        if let Err(e) = self.client.poll().await {
            warn!("mqtt: keepalive failed: {:?}", Dbg(&e));
            self.state = SessionState::Disconnected;
        }
    }

    /// Publish one payload on the configured topic, at most once.
    pub async fn publish(&mut self, payload: &str) -> Result<(), SessionError> {
        if self.state == SessionState::Disconnected {
            warn!("mqtt: publish dropped, not connected");
            return Err(SessionError::NotConnected);
        }
        info!(
            "mqtt: publishing to topic='{}' len={}",
            self.config.topic,
            payload.len()
        );
        self.client
            .publish(self.config.topic, payload.as_bytes())
            .await
            .map_err(|e| {
                error!("mqtt: publish failed: {:?}", Dbg(&e));
                SessionError::PublishFailed
            })
    }

    /// Encode and publish one message.
    pub async fn send(&mut self, message: &OutgoingMessage<'_>) -> Result<(), SessionError> {
        let payload = message.encode().inspect_err(|e| {
            error!("mqtt: failed to encode payload: {:?}", e);
        })?;
        self.publish(payload.as_str()).await
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }
}

impl<C: BrokerClient> StatusNotifier for MessagingSession<C> {
    async fn notify(&mut self, message: &OutgoingMessage<'_>) {
        // Delivery is best effort; failures are already logged by `send`.
        let _ = self.send(message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SESSION_RETRY_INTERVAL;
    use crate::mqtt::payload::SENSOR_FAILURE_MESSAGE;
    use crate::testing::{MockBroker, MockDelay, broker_config};
    use embassy_futures::block_on;

    fn session(broker: MockBroker, retry: RetryPolicy) -> MessagingSession<MockBroker> {
        MessagingSession::new(broker, broker_config(), retry)
    }

    #[test]
    fn connected_session_performs_no_operations() {
        let mut messaging = session(
            MockBroker::connected(),
            RetryPolicy::unbounded(SESSION_RETRY_INTERVAL),
        );
        let mut delay = MockDelay::default();

        assert_eq!(block_on(messaging.ensure_connected(&mut delay)), Ok(()));

        assert_eq!(messaging.client().connect_calls, 0);
        assert_eq!(messaging.client().trust_installs, 0);
        assert!(delay.sleeps.is_empty());
    }

    #[test]
    fn reinstalls_trust_on_every_attempt_and_backs_off_two_seconds() {
        let mut messaging = session(
            MockBroker::rejects(2),
            RetryPolicy::unbounded(SESSION_RETRY_INTERVAL),
        );
        let mut delay = MockDelay::default();

        assert_eq!(block_on(messaging.ensure_connected(&mut delay)), Ok(()));

        let broker = messaging.client();
        assert_eq!(broker.connect_calls, 3);
        assert_eq!(broker.trust_installs, 3);
        assert_eq!(broker.last_endpoint.map(|e| e.port), Some(8883));
        assert_eq!(delay.sleeps, vec![2_000, 2_000]);
        assert_eq!(messaging.state(), SessionState::Connected);
    }

    #[test]
    fn bounded_policy_reports_exhaustion() {
        let mut messaging = session(
            MockBroker::rejects(5),
            RetryPolicy::bounded(SESSION_RETRY_INTERVAL, 3),
        );
        let mut delay = MockDelay::default();

        assert_eq!(
            block_on(messaging.ensure_connected(&mut delay)),
            Err(SessionError::RetriesExhausted { attempts: 3 })
        );
        assert_eq!(delay.sleeps.len(), 2);
    }

    #[test]
    fn failed_publish_is_not_retried() {
        let mut broker = MockBroker::connected();
        broker.fail_publish = true;
        let mut messaging = session(broker, RetryPolicy::unbounded(SESSION_RETRY_INTERVAL));
        messaging.state();

        let result = block_on(messaging.send(&OutgoingMessage::notice(SENSOR_FAILURE_MESSAGE)));

        assert_eq!(result, Err(SessionError::PublishFailed));
        assert_eq!(messaging.client().publish_calls, 1);
        assert!(messaging.client().published.is_empty());
    }

    #[test]
    fn publish_goes_to_configured_topic() {
        let mut messaging = session(
            MockBroker::connected(),
            RetryPolicy::unbounded(SESSION_RETRY_INTERVAL),
        );
        messaging.state();

        block_on(messaging.notify(&OutgoingMessage::notice(SENSOR_FAILURE_MESSAGE)));

        assert_eq!(
            messaging.client().published,
            vec![(
                "test/status".to_string(),
                r#"{"message":"Failed to read from DHT sensor"}"#.to_string()
            )]
        );
    }

    #[test]
    fn invalidated_session_reconnects_on_next_ensure() {
        let mut messaging = session(
            MockBroker::connected(),
            RetryPolicy::unbounded(SESSION_RETRY_INTERVAL),
        );
        let mut delay = MockDelay::default();

        block_on(messaging.invalidate());

        assert_eq!(messaging.state(), SessionState::Disconnected);
        assert_eq!(block_on(messaging.ensure_connected(&mut delay)), Ok(()));
        assert_eq!(messaging.client().close_calls, 1);
        assert_eq!(messaging.client().connect_calls, 1);
        assert_eq!(messaging.client().trust_installs, 1);
    }

    #[test]
    fn keepalive_failure_marks_session_down() {
        let mut broker = MockBroker::connected();
        broker.fail_poll = true;
        let mut messaging = session(broker, RetryPolicy::unbounded(SESSION_RETRY_INTERVAL));
        messaging.state();

        block_on(messaging.pump());

        assert_eq!(messaging.client().polls, 1);
        assert_eq!(
            block_on(messaging.publish("{}")),
            Err(SessionError::NotConnected)
        );
    }
}
