//! In-process broker
//!
//! Routes messages between transports living in the same process. Supports
//! wildcard subscriptions, retained messages and last wills, and can drop
//! connections or refuse new ones to exercise the reconnect path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rumqttc::QoS;
use tokio::sync::mpsc;

use crate::errors::AgentError;
use crate::mqtt::broker::{BrokerEvents, BrokerSession, Connection, Connector, LastWill, MqttMessage};
use crate::mqtt::topics::Topics;

struct ClientEntry {
    client_id: String,
    subscriptions: Vec<String>,
    sender: mpsc::UnboundedSender<MqttMessage>,
    last_will: Option<LastWill>,
}

#[derive(Default)]
struct BrokerState {
    clients: HashMap<u64, ClientEntry>,
    retained: HashMap<String, Vec<u8>>,
    next_id: u64,
    refuse_connections: bool,
    connects: u64,
    published: Vec<(String, QoS, bool)>,
}

impl BrokerState {
    fn route(&mut self, topic: &str, payload: &[u8], retain: bool) {
        if retain {
            if payload.is_empty() {
                self.retained.remove(topic);
            } else {
                self.retained.insert(topic.to_string(), payload.to_vec());
            }
        }

        for client in self.clients.values() {
            if client.subscriptions.iter().any(|p| Topics::matches(p, topic)) {
                let _ = client.sender.send(MqttMessage {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                });
            }
        }
    }

    fn drop_client(&mut self, id: u64) {
        if let Some(client) = self.clients.remove(&id) {
            if let Some(will) = client.last_will {
                self.route(&will.topic, &will.payload, will.retain);
            }
        }
    }
}

/// In-process broker. Cloning shares the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Connector that identifies itself as `client_id`
    pub fn connector(&self, client_id: &str) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
            client_id: client_id.to_string(),
        }
    }

    /// Sever every connection as a network failure would, publishing last wills.
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.clients.keys().copied().collect();
        for id in ids {
            state.drop_client(id);
        }
    }

    /// Sever the connections of one client, publishing its last will.
    pub fn drop_client(&self, client_id: &str) {
        let mut state = self.lock();
        let ids: Vec<u64> = state
            .clients
            .iter()
            .filter(|(_, c)| c.client_id == client_id)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            state.drop_client(id);
        }
    }

    /// Make new connection attempts fail until reset
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    /// Successful connects so far
    pub fn connect_count(&self) -> u64 {
        self.lock().connects
    }

    /// Live connections of `client_id`
    pub fn is_connected(&self, client_id: &str) -> bool {
        self.lock().clients.values().any(|c| c.client_id == client_id)
    }

    /// Retained payload for `topic`
    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.lock().retained.get(topic).cloned()
    }

    /// Every publish seen as (topic, qos, retain), in order
    pub fn published(&self) -> Vec<(String, QoS, bool)> {
        self.lock().published.clone()
    }
}

/// [`Connector`] for a [`MemoryBroker`]
pub struct MemoryConnector {
    broker: MemoryBroker,
    client_id: String,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, last_will: Option<&LastWill>) -> Result<Connection, AgentError> {
        let mut state = self.broker.lock();
        if state.refuse_connections {
            return Err(AgentError::MqttError("Connection refused".to_string()));
        }

        let id = state.next_id;
        state.next_id += 1;
        state.connects += 1;

        let (sender, receiver) = mpsc::unbounded_channel();
        state.clients.insert(
            id,
            ClientEntry {
                client_id: self.client_id.clone(),
                subscriptions: Vec::new(),
                sender,
                last_will: last_will.cloned(),
            },
        );

        Ok(Connection {
            session: Arc::new(MemorySession {
                broker: self.broker.clone(),
                id,
            }),
            events: Box::new(MemoryEvents { receiver }),
        })
    }

    fn describe(&self) -> String {
        format!("memory://{}", self.client_id)
    }
}

struct MemorySession {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), AgentError> {
        let mut state = self.broker.lock();
        let retained: Vec<(String, Vec<u8>)> = state
            .retained
            .iter()
            .filter(|(t, _)| Topics::matches(topic, t))
            .map(|(t, p)| (t.clone(), p.clone()))
            .collect();

        let client = state.clients.get_mut(&self.id).ok_or(AgentError::NotConnected)?;
        if !client.subscriptions.iter().any(|s| s == topic) {
            client.subscriptions.push(topic.to_string());
        }
        for (topic, payload) in retained {
            let _ = client.sender.send(MqttMessage { topic, payload });
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), AgentError> {
        let mut state = self.broker.lock();
        let client = state.clients.get_mut(&self.id).ok_or(AgentError::NotConnected)?;
        client.subscriptions.retain(|s| s != topic);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), AgentError> {
        let mut state = self.broker.lock();
        if !state.clients.contains_key(&self.id) {
            return Err(AgentError::NotConnected);
        }
        state.published.push((topic.to_string(), qos, retain));
        state.route(topic, &payload, retain);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), AgentError> {
        // Graceful: no last will
        self.broker.lock().clients.remove(&self.id);
        Ok(())
    }
}

struct MemoryEvents {
    receiver: mpsc::UnboundedReceiver<MqttMessage>,
}

#[async_trait]
impl BrokerEvents for MemoryEvents {
    async fn next_message(&mut self) -> Result<MqttMessage, AgentError> {
        self.receiver
            .recv()
            .await
            .ok_or_else(|| AgentError::MqttError("Connection closed".to_string()))
    }
}
