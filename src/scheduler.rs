//! Reporting scheduler: the control loop that ties the sessions, the clock
//! and the sensor together.
//!
//! Each tick checks the link, then the broker session, pumps keepalive, and
//! publishes one report when the wall clock sits on a reporting instant.

use embedded_hal_async::delay::DelayNs;

use crate::clock::{TimeOfDay, WallClock};
use crate::config::{ReportGuard, ScheduleConfig};
use crate::mqtt::{BrokerClient, MessagingSession, OutgoingMessage, SessionState};
use crate::network::{LinkState, NetworkSession, WifiLink};
use crate::retry::pause;
use crate::sensor::{HumiditySensor, SensorReader};

/// What one loop iteration did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TickOutcome {
    /// Not a reporting instant.
    Idle,
    /// Reporting instant already served in this slot.
    Suppressed,
    /// Connectivity could not be restored under a bounded retry policy.
    Offline,
    /// A report was built and handed to the session.
    Reported { valid: bool, published: bool },
}

/// Whether `at` (UTC) is a reporting instant for the given period.
pub fn is_reporting_instant(at: &TimeOfDay, period_minutes: u32) -> bool {
    period_minutes != 0 && at.minute % period_minutes == 0 && at.second == 0
}

/// Owns every collaborator of the supervisor; nothing is global.
pub struct ReportingScheduler<L, C, S, K, D> {
    network: NetworkSession<L>,
    messaging: MessagingSession<C>,
    sensor: SensorReader<S>,
    clock: K,
    delay: D,
    schedule: ScheduleConfig,
    /// Unix minute of the last report, for [`ReportGuard::OncePerSlot`].
    last_slot: Option<u64>,
}

impl<L, C, S, K, D> ReportingScheduler<L, C, S, K, D>
where
    L: WifiLink,
    C: BrokerClient,
    S: HumiditySensor,
    K: WallClock,
    D: DelayNs,
{
    pub fn new(
        network: NetworkSession<L>,
        messaging: MessagingSession<C>,
        sensor: SensorReader<S>,
        clock: K,
        delay: D,
        schedule: ScheduleConfig,
    ) -> Self {
        Self {
            network,
            messaging,
            sensor,
            clock,
            delay,
            schedule,
            last_slot: None,
        }
    }

    /// Boot sequence: link, sensor, broker, then time synchronization.
    ///
    /// A failed synchronization leaves the clock on its epoch baseline; the
    /// scheduler keeps running on that time.
    pub async fn start(&mut self) {
        info!(
            "supervisor: starting, report every {} min",
            self.schedule.report_period_minutes
        );
        if let Err(e) = self.network.ensure_connected(&mut self.delay).await {
            error!("supervisor: link unavailable at start-up: {:?}", e);
        }
        self.sensor.begin(&mut self.delay).await;
        if self.network.state() == LinkState::Connected
            && let Err(e) = self.messaging.ensure_connected(&mut self.delay).await
        {
            error!("supervisor: broker unavailable at start-up: {:?}", e);
        }
        match self.clock.synchronize().await {
            Ok(()) => info!("clock: synchronized, unix={}", self.clock.unix_time()),
            Err(e) => warn!(
                "clock: synchronization failed: {:?}, scheduling from epoch baseline",
                e
            ),
        }
    }

    /// One loop iteration, without the trailing sleep.
    pub async fn tick(&mut self) -> TickOutcome {
        if self.network.state() == LinkState::Disconnected {
            if let Err(e) = self.network.ensure_connected(&mut self.delay).await {
                error!("supervisor: link down: {:?}", e);
                return TickOutcome::Offline;
            }
            // Fresh association: any session from before the outage is dead.
            self.messaging.invalidate().await;
        }
        if self.messaging.state() == SessionState::Disconnected
            && let Err(e) = self.messaging.ensure_connected(&mut self.delay).await
        {
            error!("supervisor: session down: {:?}", e);
            return TickOutcome::Offline;
        }
        self.messaging.pump().await;

        let now = self.clock.unix_time();
        let utc = TimeOfDay::utc(now);
        if !is_reporting_instant(&utc, self.schedule.report_period_minutes) {
            return TickOutcome::Idle;
        }

        let slot = now / 60;
        if self.schedule.guard == ReportGuard::OncePerSlot && self.last_slot == Some(slot) {
            debug!("supervisor: slot {} already reported", slot);
            return TickOutcome::Suppressed;
        }
        self.last_slot = Some(slot);

        self.report(now).await
    }

    async fn report(&mut self, now: u64) -> TickOutcome {
        let display = TimeOfDay::with_offset(now, self.schedule.display_offset_secs);
        info!(
            "supervisor: reporting instant, display time {}",
            display.hh_mm().as_str()
        );

        let reading = self
            .sensor
            .read(&mut self.messaging, &mut self.delay)
            .await;
        let message = OutgoingMessage::report(&reading, &display);
        let published = self.messaging.send(&message).await.is_ok();
        if published {
            info!("supervisor: report published (valid={})", reading.valid);
        } else {
            warn!("supervisor: report dropped");
        }

        TickOutcome::Reported {
            valid: reading.valid,
            published,
        }
    }

    /// Run forever: tick, then sleep the loop period.
    pub async fn run(&mut self) -> ! {
        loop {
            self.tick().await;
            pause(&mut self.delay, self.schedule.loop_period).await;
        }
    }

    pub fn network(&self) -> &NetworkSession<L> {
        &self.network
    }

    pub fn messaging(&self) -> &MessagingSession<C> {
        &self.messaging
    }

    pub fn sensor(&self) -> &SensorReader<S> {
        &self.sensor
    }

    pub fn clock_mut(&mut self) -> &mut K {
        &mut self.clock
    }

    pub fn delay(&self) -> &D {
        &self.delay
    }
}
