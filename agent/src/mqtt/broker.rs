//! Broker connection seams
//!
//! The transport only needs topic publish/subscribe with per-message QoS, retain
//! and a last will. [`Connector`] hands out one [`Connection`] per successful
//! connect; the transport owns reconnecting and resubscribing.

use std::sync::Arc;

use async_trait::async_trait;
use rumqttc::QoS;
use serde::Deserialize;

use crate::errors::AgentError;

/// Inbound MQTT message
#[derive(Debug, Clone, PartialEq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl MqttMessage {
    /// Parse payload as JSON
    pub fn parse_json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, AgentError> {
        serde_json::from_slice(&self.payload).map_err(|e| AgentError::MqttError(e.to_string()))
    }
}

/// Message the broker publishes on behalf of a client that vanishes without
/// disconnecting.
#[derive(Debug, Clone, PartialEq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Outbound half of a live broker connection
#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), AgentError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), AgentError>;

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), AgentError>;

    /// Deliberate disconnect; the last will is not published.
    async fn disconnect(&self) -> Result<(), AgentError>;
}

/// Inbound half of a live broker connection
#[async_trait]
pub trait BrokerEvents: Send {
    /// Next application message. An error means the connection is gone.
    async fn next_message(&mut self) -> Result<MqttMessage, AgentError>;
}

/// A connected session and its inbound stream
pub struct Connection {
    pub session: Arc<dyn BrokerSession>,
    pub events: Box<dyn BrokerEvents>,
}

/// Opens broker connections
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, last_will: Option<&LastWill>) -> Result<Connection, AgentError>;

    /// Human readable broker address for logs
    fn describe(&self) -> String;
}
