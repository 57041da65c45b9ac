//! MQTT broker client abstraction.
//!
//! The session manager talks to the broker only through [`BrokerClient`], so
//! the TLS stack and MQTT client crate stay behind the adapter that
//! implements it.

use crate::config::{BrokerEndpoint, TrustMaterial};

/// Minimal broker port: TLS trust setup, connect, keepalive, publish.
///
/// Publishes are QoS 0 (at most once) and never retained.
#[allow(async_fn_in_trait)]
pub trait BrokerClient {
    /// Adapter error; its `Debug` output carries the protocol failure code.
    type Err: core::fmt::Debug;

    /// Session established and not yet observed broken.
    fn is_connected(&self) -> bool;

    /// Load the CA chain, device certificate and private key for the next
    /// connection attempt.
    async fn install_trust(&mut self, trust: &TrustMaterial) -> Result<(), Self::Err>;

    /// Open the transport and perform the MQTT CONNECT handshake.
    async fn connect(
        &mut self,
        endpoint: &BrokerEndpoint,
        client_id: &str,
        keep_alive_secs: u16,
    ) -> Result<(), Self::Err>;

    /// Tear the session down, e.g. after the network under it was replaced.
    /// Infallible: afterwards `is_connected` reports `false`.
    async fn close(&mut self);

    /// Service keepalive and inbound traffic without blocking for long.
    async fn poll(&mut self) -> Result<(), Self::Err>;

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), Self::Err>;
}
