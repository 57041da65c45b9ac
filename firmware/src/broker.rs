//! MQTT v5 over mutual TLS: rust-mqtt on top of an esp-mbedtls session on
//! top of an embassy-net TCP connection.
//!
//! rust-mqtt keeps `'a` borrows of its buffers and transport, so the client is
//! built once over a [`SessionTransport`] handle. Reconnecting swaps the TLS
//! session behind the handle and repeats the CONNECT handshake on the same
//! client; the TCP buffers go back to the [`TcpClientState`] pool when the old
//! session drops.

use core::ffi::CStr;
use core::net::SocketAddr;

use defmt::{debug, error, info, warn};
use embassy_net::Stack;
use embassy_net::dns::DnsQueryType;
use embassy_net::tcp::client::{TcpClient, TcpConnection};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::{Duration, Instant};
use embedded_io_async::{ErrorKind, ErrorType, Read, Write};
use embedded_nal_async::TcpConnect;
use esp_mbedtls::asynch::Session;
use esp_mbedtls::{Certificates, Mode, TlsReference, TlsVersion, X509};
use rust_mqtt::client::client::MqttClient;
use rust_mqtt::client::client_config::{ClientConfig, MqttVersion};
use rust_mqtt::packet::v5::publish_packet::QualityOfService;
use rust_mqtt::packet::v5::reason_codes::ReasonCode;
use rust_mqtt::utils::rng_generator::CountingRng;
use thermowatch::config::{BrokerEndpoint, TrustMaterial};
use thermowatch::mqtt::BrokerClient;

pub const TCP_BUFFER: usize = 4096;
pub const MQTT_BUFFER: usize = 2048;

pub type BrokerTcpClient = TcpClient<'static, 1, TCP_BUFFER, TCP_BUFFER>;
type Connection = TcpConnection<'static, 1, TCP_BUFFER, TCP_BUFFER>;
type TlsSession = Session<'static, Connection>;

/// Slot holding the live TLS session, if any.
pub type SessionSlot = Mutex<NoopRawMutex, Option<TlsSession>>;

/// Error type for the broker adapter
pub enum BrokerError {
    /// Broker host did not resolve
    Dns,
    /// TCP connect failed
    Tcp,
    /// Trust material rejected or TLS handshake failed
    Tls,
    /// Broker refused or dropped the MQTT exchange
    Mqtt(ReasonCode),
    /// Transport used without a session
    NotConnected,
}

impl BrokerError {
    /// Operator-facing hint for the failure; CONNACK refusals are grouped by
    /// what has to change on the device or in the broker policy.
    pub fn describe(&self) -> &'static str {
        match self {
            BrokerError::Dns => "broker host did not resolve",
            BrokerError::Tcp => "broker port unreachable",
            BrokerError::Tls => "TLS rejected, check the CA chain and device certificate",
            BrokerError::NotConnected => "no broker session",
            BrokerError::Mqtt(reason) => match reason {
                ReasonCode::NotAuthorized | ReasonCode::BadUserNameOrPassword => {
                    "broker refused the device, check the certificate policy"
                }
                ReasonCode::ClientIdNotValid | ReasonCode::Banned => {
                    "broker refused the client id"
                }
                ReasonCode::ServerUnavailable
                | ReasonCode::ServerBusy
                | ReasonCode::ConnectionRateExceeded
                | ReasonCode::QuotaExceeded => "broker busy, will retry",
                ReasonCode::UseAnotherServer | ReasonCode::ServerMoved => {
                    "broker redirected the client, update the endpoint"
                }
                ReasonCode::UnsupportedProtocolVersion
                | ReasonCode::MalformedPacket
                | ReasonCode::ProtocolError => "broker rejected the MQTT v5 exchange",
                ReasonCode::TopicNameInvalid
                | ReasonCode::PacketTooLarge
                | ReasonCode::PayloadFormatInvalid
                | ReasonCode::QoSNotSupported
                | ReasonCode::RetainNotSupported => "broker rejected the publish",
                _ => "broker closed the session",
            },
        }
    }
}

impl core::fmt::Debug for BrokerError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            BrokerError::Mqtt(reason) => write!(f, "Mqtt({:?}): {}", reason, self.describe()),
            _ => f.write_str(self.describe()),
        }
    }
}

impl defmt::Format for BrokerError {
    fn format(&self, f: defmt::Formatter<'_>) {
        match self {
            BrokerError::Mqtt(reason) => defmt::write!(
                f,
                "{} ({:?})",
                self.describe(),
                defmt::Debug2Format(reason)
            ),
            _ => defmt::write!(f, "{}", self.describe()),
        }
    }
}

/// Error surfaced to rust-mqtt by the transport handle.
#[derive(Debug)]
pub enum TransportError {
    Closed,
    Tls,
}

impl embedded_io_async::Error for TransportError {
    fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Closed => ErrorKind::NotConnected,
            TransportError::Tls => ErrorKind::Other,
        }
    }
}

/// `embedded-io-async` handle onto whatever session currently sits in the slot.
pub struct SessionTransport {
    slot: &'static SessionSlot,
}

impl ErrorType for SessionTransport {
    type Error = TransportError;
}

impl Read for SessionTransport {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let mut slot = self.slot.lock().await;
        let session = slot.as_mut().ok_or(TransportError::Closed)?;
        session.read(buf).await.map_err(|_| TransportError::Tls)
    }
}

impl Write for SessionTransport {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        let mut slot = self.slot.lock().await;
        let session = slot.as_mut().ok_or(TransportError::Closed)?;
        session.write(buf).await.map_err(|_| TransportError::Tls)
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        let mut slot = self.slot.lock().await;
        let session = slot.as_mut().ok_or(TransportError::Closed)?;
        session.flush().await.map_err(|_| TransportError::Tls)
    }
}

/// Static resources the adapter borrows for the program lifetime.
pub struct BrokerResources {
    pub tcp: &'static BrokerTcpClient,
    pub tls: TlsReference<'static>,
    pub slot: &'static SessionSlot,
    pub write_buffer: &'static mut [u8; MQTT_BUFFER],
    pub recv_buffer: &'static mut [u8; MQTT_BUFFER],
    /// NUL-terminated broker host name for SNI and certificate checks.
    pub servername: &'static CStr,
}

/// [`BrokerClient`] for AWS-IoT-style brokers: mutual TLS, MQTT v5, QoS 0.
pub struct TlsBroker {
    stack: Stack<'static>,
    tcp: &'static BrokerTcpClient,
    tls: TlsReference<'static>,
    slot: &'static SessionSlot,
    servername: &'static CStr,
    trust: Option<TrustMaterial>,
    client: MqttClient<'static, SessionTransport, 5, CountingRng>,
    connected: bool,
    keep_alive: Duration,
    last_ping: Instant,
}

impl TlsBroker {
    /// Client id and keepalive are fixed here; rust-mqtt keeps its
    /// configuration for the life of the client.
    pub fn new(
        stack: Stack<'static>,
        resources: BrokerResources,
        client_id: &'static str,
        keep_alive_secs: u16,
    ) -> Self {
        let mut config = ClientConfig::new(MqttVersion::MQTTv5, CountingRng(0));
        config.add_client_id(client_id);
        config.keep_alive = keep_alive_secs;

        let transport = SessionTransport {
            slot: resources.slot,
        };
        let client = MqttClient::<_, 5, _>::new(
            transport,
            resources.write_buffer,
            MQTT_BUFFER,
            resources.recv_buffer,
            MQTT_BUFFER,
            config,
        );

        Self {
            stack,
            tcp: resources.tcp,
            tls: resources.tls,
            slot: resources.slot,
            servername: resources.servername,
            trust: None,
            client,
            connected: false,
            keep_alive: Duration::from_secs(u64::from(keep_alive_secs)),
            last_ping: Instant::now(),
        }
    }

    async fn resolve(&self, host: &str) -> Result<embassy_net::IpAddress, BrokerError> {
        match self.stack.dns_query(host, DnsQueryType::A).await {
            Ok(addrs) => addrs.first().copied().ok_or_else(|| {
                error!("mqtt: DNS resolution returned no addresses");
                BrokerError::Dns
            }),
            Err(e) => {
                error!("mqtt: DNS resolution failed: {:?}", defmt::Debug2Format(&e));
                Err(BrokerError::Dns)
            }
        }
    }

    async fn open_session(&mut self, endpoint: &BrokerEndpoint) -> Result<(), BrokerError> {
        let trust = self.trust.ok_or(BrokerError::Tls)?;
        let certificates = Certificates {
            ca_chain: Some(X509::pem(trust.root_ca.as_bytes()).map_err(|_| BrokerError::Tls)?),
            certificate: Some(
                X509::pem(trust.client_cert.as_bytes()).map_err(|_| BrokerError::Tls)?,
            ),
            private_key: Some(
                X509::pem(trust.private_key.as_bytes()).map_err(|_| BrokerError::Tls)?,
            ),
            password: None,
        };

        // Old session first: its drop returns the TCP buffers to the pool.
        *self.slot.lock().await = None;

        let addr = self.resolve(endpoint.host).await?;
        info!("mqtt: resolved '{}' to {}", endpoint.host, addr);

        let connection = self
            .tcp
            .connect(SocketAddr::new(addr.into(), endpoint.port))
            .await
            .map_err(|e| {
                error!("mqtt: TCP connection failed: {:?}", defmt::Debug2Format(&e));
                BrokerError::Tcp
            })?;
        debug!("mqtt: TCP connected");

        let mut session = Session::new(
            connection,
            Mode::Client {
                servername: self.servername,
            },
            TlsVersion::Tls1_2,
            certificates,
            self.tls,
        )
        .map_err(|e| {
            error!("mqtt: TLS setup failed: {:?}", defmt::Debug2Format(&e));
            BrokerError::Tls
        })?;
        session.connect().await.map_err(|e| {
            error!("mqtt: TLS handshake failed: {:?}", defmt::Debug2Format(&e));
            BrokerError::Tls
        })?;
        debug!("mqtt: TLS session established");

        *self.slot.lock().await = Some(session);
        Ok(())
    }

    async fn drop_session(&mut self) {
        self.connected = false;
        *self.slot.lock().await = None;
    }
}

impl BrokerClient for TlsBroker {
    type Err = BrokerError;

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn install_trust(&mut self, trust: &TrustMaterial) -> Result<(), BrokerError> {
        self.trust = Some(*trust);
        debug!(
            "mqtt: trust material installed (ca={}B, cert={}B)",
            trust.root_ca.len(),
            trust.client_cert.len()
        );
        Ok(())
    }

    async fn connect(
        &mut self,
        endpoint: &BrokerEndpoint,
        client_id: &str,
        keep_alive_secs: u16,
    ) -> Result<(), BrokerError> {
        debug!(
            "mqtt: client id '{}', keep-alive {}s",
            client_id, keep_alive_secs
        );
        self.connected = false;
        if let Err(e) = self.open_session(endpoint).await {
            self.drop_session().await;
            return Err(e);
        }

        if let Err(reason) = self.client.connect_to_broker().await {
            let err = BrokerError::Mqtt(reason);
            match &err {
                BrokerError::Mqtt(ReasonCode::ServerUnavailable | ReasonCode::ServerBusy) => {
                    warn!("mqtt: CONNACK refused: {}", err);
                }
                BrokerError::Mqtt(ReasonCode::ClientIdNotValid) => {
                    error!("mqtt: CONNACK refused client id '{}': {}", client_id, err);
                }
                _ => error!("mqtt: CONNACK refused: {}", err),
            }
            self.drop_session().await;
            return Err(err);
        }

        self.connected = true;
        self.last_ping = Instant::now();
        info!("mqtt: connected successfully (MQTT v5)");
        Ok(())
    }

    async fn close(&mut self) {
        if self.connected {
            // Best effort: the link under the session may already be gone.
            if let Err(reason) = self.client.disconnect().await {
                debug!("mqtt: DISCONNECT not delivered: {:?}", defmt::Debug2Format(&reason));
            }
        }
        self.drop_session().await;
    }

    async fn poll(&mut self) -> Result<(), BrokerError> {
        if !self.connected {
            return Err(BrokerError::NotConnected);
        }
        if self.last_ping.elapsed() < self.keep_alive / 2 {
            return Ok(());
        }
        match self.client.send_ping().await {
            Ok(()) => {
                self.last_ping = Instant::now();
                Ok(())
            }
            Err(reason) => {
                self.drop_session().await;
                Err(BrokerError::Mqtt(reason))
            }
        }
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        if !self.connected {
            return Err(BrokerError::NotConnected);
        }
        match self
            .client
            .send_message(topic, payload, QualityOfService::QoS0, false)
            .await
        {
            // Published, just nobody listening.
            Ok(()) | Err(ReasonCode::NoMatchingSubscribers) => Ok(()),
            Err(reason) => {
                self.drop_session().await;
                Err(BrokerError::Mqtt(reason))
            }
        }
    }
}
