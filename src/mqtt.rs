use crate::config::{MqttConfig, TlsConfig};
use crate::error::{AppError, Result};
use std::time::Duration;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, warn};

// Use the MQTT v5 API surface only
use rumqttc::v5 as mqtt5;
use rumqttc::{Outgoing, TlsConfiguration, Transport};

// Re-export types so the rest of the code can use these names
pub type MqttOptions = mqtt5::MqttOptions;
pub type AsyncClient = mqtt5::AsyncClient;
pub type EventLoop = mqtt5::EventLoop;
pub type Incoming = mqtt5::Incoming;
pub type QoS = mqtt5::mqttbytes::QoS;
pub type ConnectionError = mqtt5::ConnectionError;

/// A message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// PEM material for mutual TLS, provisioned out of band.
#[derive(Clone)]
pub struct TlsMaterial {
    pub ca: Vec<u8>,
    pub client_cert: Vec<u8>,
    pub client_key: Vec<u8>,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("ca", &format_args!("{} bytes", self.ca.len()))
            .field("client_cert", &format_args!("{} bytes", self.client_cert.len()))
            .field("client_key", &"<redacted>")
            .finish()
    }
}

impl TlsMaterial {
    pub fn load(cfg: &TlsConfig) -> Result<Self> {
        Ok(Self {
            ca: read_pem(&cfg.ca_file)?,
            client_cert: read_pem(&cfg.cert_file)?,
            client_key: read_pem(&cfg.key_file)?,
        })
    }
}

fn read_pem(path: &str) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path).map_err(|e| AppError::Tls(format!("{}: {}", path, e)))?;
    if !bytes.windows(11).any(|w| w == b"-----BEGIN ") {
        return Err(AppError::Tls(format!("{}: no PEM block found", path)));
    }
    Ok(bytes)
}

/// The secure pub/sub session to the broker.
#[allow(async_fn_in_trait)]
pub trait TelemetryTransport {
    /// Installs trust anchor and client identity; must precede `connect`.
    fn configure_tls(&mut self, material: &TlsMaterial) -> Result<()>;
    /// One session attempt, authenticating as `client_id`.
    async fn connect(&mut self, client_id: &str) -> Result<()>;
    fn is_connected(&self) -> bool;
    async fn subscribe(&mut self, topic: &str) -> Result<()>;
    /// Resolves once the message has been written to the session, not merely queued.
    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()>;
    /// Gives the session a short slice of I/O: flushes queued publishes, answers
    /// keep-alives and returns any inbound messages. An error means the session is gone.
    async fn service(&mut self) -> Result<Vec<InboundMessage>>;
}

// Return the v5 QoS type explicitly
pub fn qos(v: u8) -> QoS {
    match v {
        2 => QoS::ExactlyOnce,
        0 => QoS::AtMostOnce,
        _ => QoS::AtLeastOnce,
    }
}

pub fn build_options(
    client_id: &str,
    host: &str,
    port: u16,
    keep_alive_secs: u64,
    tls: Option<&TlsMaterial>,
) -> MqttOptions {
    // Using v5::MqttOptions selects MQTT 5
    let mut opts = MqttOptions::new(client_id, host, port);
    opts.set_keep_alive(Duration::from_secs(keep_alive_secs));
    opts.set_clean_start(true);
    match tls {
        Some(m) => {
            opts.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
                ca: m.ca.clone(),
                alpn: None,
                client_auth: Some((m.client_cert.clone(), m.client_key.clone())),
            }));
        }
        None if port == 8883 => {
            opts.set_transport(Transport::tls_with_default_config());
        }
        None => {}
    }
    opts
}

/// rumqttc-backed transport. The event loop is only driven from `connect` and `service`.
pub struct MqttTransport {
    host: String,
    port: u16,
    keep_alive_secs: u64,
    qos: QoS,
    connect_timeout: Duration,
    service_slice: Duration,
    tls: Option<TlsMaterial>,
    session: Option<(AsyncClient, EventLoop)>,
    connected: bool,
    /// Messages that arrived while a publish was being driven out
    inbound: Vec<InboundMessage>,
}

impl MqttTransport {
    pub fn new(cfg: &MqttConfig, connect_timeout: Duration) -> Self {
        Self {
            host: cfg.host.clone(),
            port: cfg.port,
            keep_alive_secs: cfg.keep_alive_secs,
            qos: qos(cfg.qos),
            connect_timeout,
            service_slice: Duration::from_millis(50),
            tls: None,
            session: None,
            connected: false,
            inbound: Vec::new(),
        }
    }

    fn client(&self) -> Result<&AsyncClient> {
        match &self.session {
            Some((client, _)) if self.connected => Ok(client),
            _ => Err(AppError::Mqtt("session not established".into())),
        }
    }
}

impl TelemetryTransport for MqttTransport {
    fn configure_tls(&mut self, material: &TlsMaterial) -> Result<()> {
        self.tls = Some(material.clone());
        Ok(())
    }

    async fn connect(&mut self, client_id: &str) -> Result<()> {
        self.connected = false;
        self.session = None;
        self.inbound.clear();

        let opts = build_options(
            client_id,
            &self.host,
            self.port,
            self.keep_alive_secs,
            self.tls.as_ref(),
        );
        let (client, mut eventloop) = AsyncClient::new(opts, 50);

        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(mqtt5::Event::Incoming(Incoming::ConnAck(_))) => return Ok(()),
                    Ok(_) => continue,
                    Err(e) => return Err(AppError::Mqtt(e.to_string())),
                }
            }
        };
        let outcome = timeout(self.connect_timeout, handshake).await;
        match outcome {
            Ok(Ok(())) => {
                debug!(host = %self.host, port = self.port, "CONNACK received");
                self.session = Some((client, eventloop));
                self.connected = true;
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AppError::Mqtt(format!(
                "no CONNACK within {:?}",
                self.connect_timeout
            ))),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.client()?
            .subscribe(topic.to_string(), self.qos)
            .await
            .map_err(|e| AppError::Mqtt(e.to_string()))
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client()?
            .try_publish(topic.to_string(), self.qos, false, payload)
            .map_err(|e| AppError::Mqtt(e.to_string()))?;

        let Some((_, eventloop)) = self.session.as_mut() else {
            self.connected = false;
            return Err(AppError::Mqtt("session not established".into()));
        };
        let deadline = Instant::now() + self.connect_timeout;
        loop {
            let polled = match timeout_at(deadline, eventloop.poll()).await {
                Ok(polled) => polled,
                Err(_) => {
                    return Err(AppError::Mqtt(format!(
                        "publish not written within {:?}",
                        self.connect_timeout
                    )))
                }
            };
            match absorb(polled, &mut self.inbound) {
                Ok(Some(Outgoing::Publish(pkid))) => {
                    debug!(pkid, topic, "publish written");
                    return Ok(());
                }
                Ok(_) => continue,
                Err(e) => {
                    self.connected = false;
                    return Err(e);
                }
            }
        }
    }

    async fn service(&mut self) -> Result<Vec<InboundMessage>> {
        let Some((_, eventloop)) = self.session.as_mut() else {
            self.connected = false;
            return Err(AppError::Mqtt("session not established".into()));
        };

        let deadline = Instant::now() + self.service_slice;
        loop {
            let Ok(polled) = timeout_at(deadline, eventloop.poll()).await else {
                break;
            };
            if let Err(e) = absorb(polled, &mut self.inbound) {
                self.connected = false;
                return Err(e);
            }
        }
        Ok(std::mem::take(&mut self.inbound))
    }
}

/// Files one event-loop result: inbound publishes go to `inbound`, outgoing
/// packets are handed back, a broker DISCONNECT or a loop error ends the session.
fn absorb(
    polled: std::result::Result<mqtt5::Event, ConnectionError>,
    inbound: &mut Vec<InboundMessage>,
) -> Result<Option<Outgoing>> {
    match polled {
        Ok(mqtt5::Event::Incoming(Incoming::Publish(p))) => {
            inbound.push(InboundMessage {
                topic: String::from_utf8_lossy(&p.topic).into_owned(),
                payload: p.payload.to_vec(),
            });
            Ok(None)
        }
        Ok(mqtt5::Event::Incoming(Incoming::Disconnect(d))) => {
            warn!(packet = ?d, "broker sent DISCONNECT");
            Err(AppError::Mqtt("disconnected by broker".into()))
        }
        Ok(mqtt5::Event::Incoming(_)) => Ok(None),
        Ok(mqtt5::Event::Outgoing(out)) => Ok(Some(out)),
        Err(e) => Err(AppError::Mqtt(e.to_string())),
    }
}
