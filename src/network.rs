//! Wi-Fi link supervision.

use core::net::Ipv4Addr;

use embassy_time::Duration;
use embedded_hal_async::delay::DelayNs;

use crate::config::{RetryPolicy, WifiCredentials};
use crate::fmt::Dbg;
use crate::retry::{Attempts, pause};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkState {
    Disconnected,
    Connected,
}

/// Error type for link supervision
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkError {
    /// A bounded retry policy ran out of attempts
    RetriesExhausted { attempts: u32 },
}

/// Port for the wireless station interface.
#[allow(async_fn_in_trait)]
pub trait WifiLink {
    type Err: core::fmt::Debug;

    /// Associated and holding an address.
    fn is_connected(&self) -> bool;

    /// Drop any current or half-open association.
    async fn disconnect(&mut self) -> Result<(), Self::Err>;

    /// Make one association attempt with `credentials`.
    async fn associate(&mut self, credentials: &WifiCredentials) -> Result<(), Self::Err>;

    fn ipv4_address(&self) -> Option<Ipv4Addr>;
}

/// Owns the link and brings it back whenever it drops.
pub struct NetworkSession<L> {
    link: L,
    credentials: WifiCredentials,
    retry: RetryPolicy,
    settle: Duration,
    state: LinkState,
}

impl<L: WifiLink> NetworkSession<L> {
    pub fn new(link: L, credentials: WifiCredentials, retry: RetryPolicy, settle: Duration) -> Self {
        Self {
            link,
            credentials,
            retry,
            settle,
            state: LinkState::Disconnected,
        }
    }

    /// Poll the link and refresh the cached state.
    pub fn state(&mut self) -> LinkState {
        self.state = if self.link.is_connected() {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        };
        self.state
    }

    /// Return immediately if the link is up; otherwise block until it is.
    ///
    /// Retries follow the configured policy. The shipped policy never gives
    /// up, so this only returns an error under a bounded policy.
    pub async fn ensure_connected<D: DelayNs>(&mut self, delay: &mut D) -> Result<(), LinkError> {
        if self.state() == LinkState::Connected {
            return Ok(());
        }

        warn!(
            "wifi: disconnected, reconnecting to '{}'...",
            self.credentials.ssid
        );
        if let Err(e) = self.link.disconnect().await {
            debug!("wifi: disconnect before reconnect failed: {:?}", Dbg(&e));
        }
        pause(delay, self.settle).await;

        let mut attempts = Attempts::new(self.retry);
        loop {
            if let Err(e) = self.link.associate(&self.credentials).await {
                debug!("wifi: association attempt failed: {:?}", Dbg(&e));
            }
            // Link status decides, not the attempt's result: a late lease can
            // make an attempt fail on a station that is already up.
            if self.link.is_connected() {
                break;
            }
            debug!("wifi: association pending");
            if !attempts.back_off(delay).await {
                error!(
                    "wifi: giving up after {} attempts",
                    attempts.failures()
                );
                return Err(LinkError::RetriesExhausted {
                    attempts: attempts.failures(),
                });
            }
        }

        self.state = LinkState::Connected;
        match self.link.ipv4_address() {
            Some(ip) => info!("wifi: reconnected, IP address: {}", Dbg(&ip)),
            None => info!("wifi: reconnected"),
        }
        Ok(())
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }
}
