//! rumqttc-backed broker connector

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::errors::AgentError;
use crate::mqtt::broker::{BrokerEvents, BrokerSession, Connection, Connector, LastWill, MqttMessage};
use crate::storage::settings::MqttBrokerSettings;

/// MQTT broker address
#[derive(Debug, Clone)]
pub struct MqttAddress {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    /// Optional path to a PEM-encoded CA certificate for broker verification.
    /// When `None` and `use_tls` is `true`, the system certificate store is used.
    pub ca_cert_path: Option<String>,
}

impl Default for MqttAddress {
    fn default() -> Self {
        Self {
            host: "".to_string(),
            port: 8883,
            use_tls: true,
            ca_cert_path: None,
        }
    }
}

/// Username/password presented to the broker
#[derive(Debug, Clone)]
pub struct BrokerCredentials {
    pub username: String,
    pub password: SecretString,
}

/// Connector options
#[derive(Debug, Clone)]
pub struct MqttConnectorOptions {
    pub address: MqttAddress,
    pub client_id: String,
    pub credentials: Option<BrokerCredentials>,
    pub keep_alive: Duration,
    /// How long to wait for CONNACK
    pub connect_timeout: Duration,
    /// Capacity of the client request channel
    pub request_capacity: usize,
}

impl MqttConnectorOptions {
    pub fn from_settings(settings: &MqttBrokerSettings, client_id: &str) -> Self {
        let credentials = settings.username.as_ref().map(|username| BrokerCredentials {
            username: username.clone(),
            password: SecretString::from(settings.password.clone().unwrap_or_default()),
        });

        Self {
            address: MqttAddress {
                host: settings.host.clone(),
                port: settings.port,
                use_tls: settings.tls,
                ca_cert_path: settings.ca_cert_path.clone(),
            },
            client_id: client_id.to_string(),
            credentials,
            keep_alive: Duration::from_secs(settings.keep_alive_secs),
            connect_timeout: Duration::from_secs(10),
            request_capacity: 64,
        }
    }
}

/// Opens rumqttc connections
pub struct MqttConnector {
    options: MqttConnectorOptions,
}

impl MqttConnector {
    pub fn new(options: MqttConnectorOptions) -> Result<Self, AgentError> {
        if options.address.host.is_empty() {
            return Err(AgentError::ConfigError("MQTT host is not configured".to_string()));
        }
        Ok(Self { options })
    }

    fn mqtt_options(&self, last_will: Option<&LastWill>) -> Result<MqttOptions, AgentError> {
        let address = &self.options.address;
        let mut options = MqttOptions::new(&self.options.client_id, &address.host, address.port);
        options.set_keep_alive(self.options.keep_alive);
        // Subscriptions are replayed by the transport after every reconnect
        options.set_clean_session(true);

        if let Some(credentials) = &self.options.credentials {
            options.set_credentials(
                credentials.username.clone(),
                credentials.password.expose_secret().to_string(),
            );
        }

        if let Some(will) = last_will {
            options.set_last_will(rumqttc::LastWill::new(
                will.topic.clone(),
                will.payload.clone(),
                will.qos,
                will.retain,
            ));
        }

        if address.use_tls {
            use rumqttc::{TlsConfiguration, Transport};
            use rustls::ClientConfig;

            let mut root_cert_store = rustls::RootCertStore::empty();

            if let Some(ref ca_path) = address.ca_cert_path {
                let ca_pem = std::fs::read(ca_path)
                    .map_err(|e| AgentError::MqttError(format!("Failed to read CA cert {ca_path}: {e}")))?;
                let mut cursor = std::io::Cursor::new(ca_pem);
                for cert in rustls_pemfile::certs(&mut cursor).flatten() {
                    let _ = root_cert_store.add(cert);
                }
            } else {
                for cert in rustls_native_certs::load_native_certs().unwrap_or_default() {
                    let _ = root_cert_store.add(cert);
                }
            }

            let client_config = ClientConfig::builder()
                .with_root_certificates(root_cert_store)
                .with_no_client_auth();

            options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
                Arc::new(client_config),
            )));
        }

        Ok(options)
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(&self, last_will: Option<&LastWill>) -> Result<Connection, AgentError> {
        let options = self.mqtt_options(last_will)?;
        let (client, mut eventloop) = AsyncClient::new(options, self.options.request_capacity);

        let connack = tokio::time::timeout(self.options.connect_timeout, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => return Ok(ack),
                    Ok(_) => continue,
                    Err(e) => return Err(AgentError::MqttError(e.to_string())),
                }
            }
        })
        .await
        .map_err(|_| AgentError::Timeout(format!("CONNACK from {}", self.describe())))??;

        if connack.code != ConnectReturnCode::Success {
            return Err(AgentError::MqttError(format!(
                "Broker refused connection: {:?}",
                connack.code
            )));
        }

        info!("MQTT connected to {}", self.describe());

        Ok(Connection {
            session: Arc::new(MqttSession { client }),
            events: Box::new(MqttEvents { eventloop }),
        })
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.options.address.host, self.options.address.port)
    }
}

struct MqttSession {
    client: AsyncClient,
}

#[async_trait]
impl BrokerSession for MqttSession {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), AgentError> {
        self.client
            .subscribe(topic, qos)
            .await
            .map_err(|e| AgentError::MqttError(e.to_string()))?;
        info!("Subscribed to: {}", topic);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), AgentError> {
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| AgentError::MqttError(e.to_string()))
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), AgentError> {
        self.client
            .publish(topic, qos, retain, payload)
            .await
            .map_err(|e| AgentError::MqttError(e.to_string()))?;
        debug!("Published to: {}", topic);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), AgentError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| AgentError::MqttError(e.to_string()))?;
        info!("MQTT disconnected");
        Ok(())
    }
}

struct MqttEvents {
    eventloop: EventLoop,
}

#[async_trait]
impl BrokerEvents for MqttEvents {
    async fn next_message(&mut self) -> Result<MqttMessage, AgentError> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    debug!("Received message on topic: {}", publish.topic);
                    return Ok(MqttMessage {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                    });
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    return Err(AgentError::MqttError("Broker closed the connection".to_string()));
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    debug!("Subscription acknowledged");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("MQTT poll error: {}", e);
                    return Err(AgentError::MqttError(e.to_string()));
                }
            }
        }
    }
}
