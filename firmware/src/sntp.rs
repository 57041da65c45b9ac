//! Wall clock disciplined by a one-shot SNTP query through `sntpc`.

use core::net::{IpAddr, SocketAddr};

use defmt::{info, warn};
use embassy_net::Stack;
use embassy_net::dns::DnsQueryType;
use embassy_net::udp::{PacketMetadata, UdpSocket};
use embassy_time::{Duration, Instant, with_timeout};
use sntpc::{NtpContext, NtpTimestampGenerator, get_time};
use thermowatch::clock::{ClockError, WallClock};

const NTP_PORT: u16 = 123;
const LOCAL_PORT: u16 = 50123;
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Uptime stamps for the request; only the round-trip math uses them.
#[derive(Clone, Copy, Default)]
struct UptimeStamps {
    at: u64,
}

impl NtpTimestampGenerator for UptimeStamps {
    fn init(&mut self) {
        self.at = Instant::now().as_micros();
    }

    fn timestamp_sec(&self) -> u64 {
        self.at / 1_000_000
    }

    fn timestamp_subsec_micros(&self) -> u32 {
        (self.at % 1_000_000) as u32
    }
}

pub struct SntpClock {
    stack: Stack<'static>,
    servers: &'static [&'static str],
    /// Unix seconds at the uptime instant of the last successful query.
    reference: Option<(u64, Instant)>,
}

impl SntpClock {
    pub fn new(stack: Stack<'static>, servers: &'static [&'static str]) -> Self {
        Self {
            stack,
            servers,
            reference: None,
        }
    }

    async fn query(&self, server: &str) -> Result<u64, ClockError> {
        let addrs = self
            .stack
            .dns_query(server, DnsQueryType::A)
            .await
            .map_err(|_| ClockError::ResolveFailed)?;
        let addr: IpAddr = (*addrs.first().ok_or(ClockError::ResolveFailed)?).into();

        let mut rx_meta = [PacketMetadata::EMPTY; 1];
        let mut tx_meta = [PacketMetadata::EMPTY; 1];
        let mut rx_buffer = [0u8; 128];
        let mut tx_buffer = [0u8; 128];
        let mut socket = UdpSocket::new(
            self.stack,
            &mut rx_meta,
            &mut rx_buffer,
            &mut tx_meta,
            &mut tx_buffer,
        );
        socket
            .bind(LOCAL_PORT)
            .map_err(|_| ClockError::NoResponse)?;

        let context = NtpContext::new(UptimeStamps::default());
        let result = with_timeout(
            RESPONSE_TIMEOUT,
            get_time(SocketAddr::new(addr, NTP_PORT), &socket, context),
        )
        .await
        .map_err(|_| ClockError::NoResponse)?
        .map_err(|e| {
            warn!("sntp: exchange failed: {:?}", defmt::Debug2Format(&e));
            match e {
                sntpc::Error::Network => ClockError::NoResponse,
                _ => ClockError::InvalidResponse,
            }
        })?;

        Ok(u64::from(result.sec()))
    }
}

impl WallClock for SntpClock {
    async fn synchronize(&mut self) -> Result<(), ClockError> {
        let mut last_error = ClockError::ResolveFailed;
        for server in self.servers {
            info!("sntp: querying {}...", server);
            match self.query(server).await {
                Ok(unix) => {
                    self.reference = Some((unix, Instant::now()));
                    info!("sntp: time set from {}, unix={}", server, unix);
                    return Ok(());
                }
                Err(e) => {
                    warn!("sntp: {} failed: {:?}", server, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    fn unix_time(&self) -> u64 {
        match self.reference {
            Some((unix, at)) => unix + at.elapsed().as_secs(),
            None => Instant::now().as_secs(),
        }
    }
}
