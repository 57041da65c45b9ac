//! Sleeping and retry bookkeeping shared by the reconnect loops.

use embassy_time::Duration;
use embedded_hal_async::delay::DelayNs;

use crate::config::RetryPolicy;

/// Sleep for `duration` on the injected delay provider.
pub async fn pause<D: DelayNs>(delay: &mut D, duration: Duration) {
    let ms = u32::try_from(duration.as_millis()).unwrap_or(u32::MAX);
    delay.delay_ms(ms).await;
}

/// Failed-attempt counter for one reconnect loop.
pub(crate) struct Attempts {
    policy: RetryPolicy,
    failures: u32,
}

impl Attempts {
    pub(crate) fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Record a failed attempt and wait out the retry interval.
    ///
    /// Returns `false` without sleeping once the policy allows no further
    /// attempts.
    pub(crate) async fn back_off<D: DelayNs>(&mut self, delay: &mut D) -> bool {
        self.failures = self.failures.saturating_add(1);
        if !self.policy.allows(self.failures) {
            return false;
        }
        pause(delay, self.policy.interval).await;
        true
    }

    pub(crate) fn failures(&self) -> u32 {
        self.failures
    }
}
