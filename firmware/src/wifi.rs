//! Wi-Fi station adapter over esp-radio and the embassy-net stack.

use core::net::Ipv4Addr;

use defmt::{debug, info, warn};
use embassy_net::Stack;
use embassy_time::{Duration, with_timeout};
use esp_radio::wifi::{ClientConfig, ModeConfig, WifiController, WifiError};
use thermowatch::config::WifiCredentials;
use thermowatch::network::WifiLink;

/// How long one association attempt waits for a DHCP lease.
const DHCP_TIMEOUT: Duration = Duration::from_secs(10);

/// Station interface: the radio controller plus the IP stack riding on it.
///
/// Connected means associated *and* holding an IPv4 lease.
pub struct StationLink {
    controller: WifiController<'static>,
    stack: Stack<'static>,
}

impl StationLink {
    pub fn new(controller: WifiController<'static>, stack: Stack<'static>) -> Self {
        Self { controller, stack }
    }
}

impl WifiLink for StationLink {
    type Err = WifiError;

    fn is_connected(&self) -> bool {
        self.controller.is_connected().unwrap_or(false) && self.stack.is_config_up()
    }

    async fn disconnect(&mut self) -> Result<(), WifiError> {
        if self.controller.is_connected().unwrap_or(false) {
            self.controller.disconnect_async().await?;
        }
        Ok(())
    }

    async fn associate(&mut self, credentials: &WifiCredentials) -> Result<(), WifiError> {
        let client = ClientConfig::default()
            .with_ssid(credentials.ssid.into())
            .with_password(credentials.password.into());
        self.controller.set_config(&ModeConfig::Client(client))?;

        if !self.controller.is_started().unwrap_or(false) {
            self.controller.start_async().await?;
            info!("wifi: started STA mode");
        }

        self.controller.connect_async().await?;
        debug!("wifi: associated, waiting for DHCP lease...");

        if with_timeout(DHCP_TIMEOUT, self.stack.wait_config_up())
            .await
            .is_err()
        {
            warn!("wifi: no DHCP lease after {}s", DHCP_TIMEOUT.as_secs());
        }
        Ok(())
    }

    fn ipv4_address(&self) -> Option<Ipv4Addr> {
        self.stack.config_v4().map(|config| config.address.address())
    }
}

/// Embassy-net runner task: runs the network stack to process packets.
#[embassy_executor::task]
pub async fn net_task(
    mut runner: embassy_net::Runner<'static, esp_radio::wifi::WifiDevice<'static>>,
) -> ! {
    runner.run().await
}
