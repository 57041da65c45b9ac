#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]

mod broker;
mod dht;
mod sntp;
mod wifi;

use alloc::boxed::Box;
use alloc::ffi::CString;
use alloc::string::String;
use core::ffi::CStr;

use defmt::{error, info, warn};
use embassy_executor::Spawner;
use embassy_net::tcp::client::{TcpClient, TcpClientState};
use embassy_net::{Config as NetConfig, StackResources};
use embassy_sync::mutex::Mutex;
use embassy_time::Delay;
use esp_hal::clock::CpuClock;
use esp_hal::gpio::Flex;
use esp_hal::timer::timg::TimerGroup;
use esp_mbedtls::Tls;
use panic_rtt_target as _;
use static_cell::StaticCell;

use thermowatch::config::{
    self, BrokerConfig, LINK_RETRY_INTERVAL, LINK_SETTLE_AFTER_DISCONNECT, RetryPolicy,
    SESSION_RETRY_INTERVAL, ScheduleConfig, SensorTiming, TrustMaterial, WifiCredentials,
};
use thermowatch::{MessagingSession, NetworkSession, ReportingScheduler, SensorReader};

use crate::broker::{
    BrokerResources, BrokerTcpClient, MQTT_BUFFER, SessionSlot, TCP_BUFFER, TlsBroker,
};
use crate::dht::Dht22Sensor;
use crate::sntp::SntpClock;
use crate::wifi::StationLink;

// Optional local secrets support
#[cfg(feature = "local_secrets")]
mod secrets;

extern crate alloc;

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

// DHCP, DNS, the broker TCP connection and the SNTP UDP socket
static STACK_RESOURCES: StaticCell<StackResources<4>> = StaticCell::new();
static TCP_STATE: StaticCell<TcpClientState<1, TCP_BUFFER, TCP_BUFFER>> = StaticCell::new();
static TCP_CLIENT: StaticCell<BrokerTcpClient> = StaticCell::new();
static TLS: StaticCell<Tls<'static>> = StaticCell::new();
static SESSION_SLOT: StaticCell<SessionSlot> = StaticCell::new();
static MQTT_WRITE_BUFFER: StaticCell<[u8; MQTT_BUFFER]> = StaticCell::new();
static MQTT_RECV_BUFFER: StaticCell<[u8; MQTT_BUFFER]> = StaticCell::new();

// Credentials source options:
// - Preferred: create a local, Git-ignored `src/secrets.rs` with:
//     pub const WIFI_SSID: &str = "YourSSID";
//     pub const WIFI_PASS: &str = "YourPassword";
//     pub const BROKER_HOST: &str = "xxxxxxxx-ats.iot.<region>.amazonaws.com";
//     pub const ROOT_CA: &str = include_str!("../certs/AmazonRootCA1.pem");
//     pub const CLIENT_CERT: &str = include_str!("../certs/device.pem.crt");
//     pub const PRIVATE_KEY: &str = include_str!("../certs/private.pem.key");
//   and build with `--features local_secrets`.
// - Fallback: compile-time env vars read by `thermowatch::config`.
#[cfg(feature = "local_secrets")]
fn load_settings() -> (WifiCredentials, BrokerConfig) {
    let wifi = WifiCredentials {
        ssid: secrets::WIFI_SSID,
        password: secrets::WIFI_PASS,
    };
    let mut broker = BrokerConfig::from_build_env();
    broker.endpoint.host = secrets::BROKER_HOST;
    broker.trust = TrustMaterial {
        root_ca: secrets::ROOT_CA,
        client_cert: secrets::CLIENT_CERT,
        private_key: secrets::PRIVATE_KEY,
    };
    (wifi, broker)
}

#[cfg(not(feature = "local_secrets"))]
fn load_settings() -> (WifiCredentials, BrokerConfig) {
    (
        WifiCredentials::from_build_env(),
        BrokerConfig::from_build_env(),
    )
}

/// mbedtls parses PEM only when it is NUL-terminated.
fn nul_terminated(pem: &'static str) -> &'static str {
    if pem.ends_with('\0') {
        return pem;
    }
    let mut owned = String::from(pem);
    owned.push('\0');
    owned.leak()
}

fn servername(host: &str) -> &'static CStr {
    match CString::new(host) {
        Ok(name) => Box::leak(name.into_boxed_c_str()),
        Err(_) => {
            error!("mqtt: broker host contains a NUL byte");
            panic!("invalid broker host");
        }
    }
}

#[esp_rtos::main]
async fn main(spawner: Spawner) -> ! {
    rtt_target::rtt_init_defmt!();

    let hal_config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(hal_config);

    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: 65536);
    // mbedtls allocates its handshake state on the heap
    esp_alloc::heap_allocator!(size: 72 * 1024);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    let sw_interrupt =
        esp_hal::interrupt::software::SoftwareInterruptControl::new(peripherals.SW_INTERRUPT);
    esp_rtos::start(timg0.timer0, sw_interrupt.software_interrupt0);

    info!("thermowatch: device_id={}", config::DEVICE_ID);

    let (credentials, mut broker_config) = load_settings();
    if credentials.ssid.is_empty() {
        warn!("wifi: set WIFI_SSID/WIFI_PASS env vars at build time to enable STA connection");
    }
    broker_config.trust = TrustMaterial {
        root_ca: nul_terminated(broker_config.trust.root_ca),
        client_cert: nul_terminated(broker_config.trust.client_cert),
        private_key: nul_terminated(broker_config.trust.private_key),
    };

    // --- Wi-Fi and embassy-net bring-up ----------------------------------------------------
    let radio_init = match esp_radio::init() {
        Ok(radio_init) => Box::leak(Box::new(radio_init)),
        Err(e) => {
            error!("esp_radio init failed: {:?}", e);
            panic!("radio initialization failed");
        }
    };
    let (controller, ifaces) = match esp_radio::wifi::new(
        radio_init,
        peripherals.WIFI,
        esp_radio::wifi::Config::default(),
    ) {
        Ok(v) => v,
        Err(e) => {
            error!("wifi new() failed: {:?}", e);
            panic!("wifi initialization failed");
        }
    };

    let (stack, runner) = embassy_net::new(
        ifaces.sta,
        NetConfig::dhcpv4(Default::default()),
        STACK_RESOURCES.init(StackResources::new()),
        embassy_time::Instant::now().as_ticks(),
    );
    spawner.spawn(wifi::net_task(runner)).ok();
    info!("network: embassy-net stack initialized with DHCP");

    // --- TLS and MQTT resources ------------------------------------------------------------
    let tls: &'static Tls<'static> = match Tls::new(peripherals.SHA) {
        Ok(tls) => TLS.init(tls.with_hardware_rsa(peripherals.RSA)),
        Err(e) => {
            error!("tls: init failed: {:?}", defmt::Debug2Format(&e));
            panic!("tls initialization failed");
        }
    };
    let tcp_state = TCP_STATE.init(TcpClientState::new());
    let resources = BrokerResources {
        tcp: TCP_CLIENT.init(TcpClient::new(stack, tcp_state)),
        tls: tls.reference(),
        slot: SESSION_SLOT.init(Mutex::new(None)),
        write_buffer: MQTT_WRITE_BUFFER.init([0; MQTT_BUFFER]),
        recv_buffer: MQTT_RECV_BUFFER.init([0; MQTT_BUFFER]),
        servername: servername(broker_config.endpoint.host),
    };
    let broker = TlsBroker::new(
        stack,
        resources,
        broker_config.client_id,
        broker_config.keep_alive_secs,
    );

    // --- Sensor on GPIO4 (XIAO ESP32-C6 D4), powered from 3V3 ------------------------------
    let sensor = Dht22Sensor::new(Flex::new(peripherals.GPIO4));

    let mut scheduler = ReportingScheduler::new(
        NetworkSession::new(
            StationLink::new(controller, stack),
            credentials,
            RetryPolicy::unbounded(LINK_RETRY_INTERVAL),
            LINK_SETTLE_AFTER_DISCONNECT,
        ),
        MessagingSession::new(
            broker,
            broker_config,
            RetryPolicy::unbounded(SESSION_RETRY_INTERVAL),
        ),
        SensorReader::new(sensor, SensorTiming::default()),
        SntpClock::new(stack, &config::TIME_SERVERS),
        Delay,
        ScheduleConfig::default(),
    );

    info!("application: starting supervisor");
    scheduler.start().await;
    scheduler.run().await
}
