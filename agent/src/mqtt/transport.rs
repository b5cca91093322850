//! Self-healing messaging transport
//!
//! [`MqttTransport`] owns one broker connection at a time. It keeps a registry
//! of subscriptions so that a reconnect can replay them, runs at most one
//! reconnect loop, bounds concurrent publishes and announces presence on the
//! status topic (ONLINE on connect, OFFLINE on shutdown or as the last will).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use patch_protocol::ServiceStatus;
use rumqttc::QoS;
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::AgentError;
use crate::mqtt::broker::{BrokerEvents, BrokerSession, Connector, LastWill, MqttMessage};
use crate::mqtt::dispatch::{DispatchQueue, MessageHandler};
use crate::mqtt::policy::MessageClass;
use crate::mqtt::topics::Topics;
use crate::retry::{retry_with_backoff, RetryPolicy};

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Transport options
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// How long a single publish may take before it counts as a transient failure
    pub publish_timeout: Duration,

    /// Backoff used by the reconnect loop
    pub reconnect: RetryPolicy,

    /// Publishes allowed in flight at once
    pub max_inflight_publishes: usize,

    /// Retries for message classes that must not be lost
    pub reliable_publish: RetryPolicy,

    /// Retained presence topic; also registered as the last will
    pub status_topic: Option<String>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_secs(5),
            reconnect: RetryPolicy::exponential(None, Duration::from_secs(1), Duration::from_secs(60))
                .with_jitter(Duration::from_millis(1000)),
            max_inflight_publishes: 10,
            reliable_publish: RetryPolicy::exponential(
                Some(3),
                Duration::from_millis(500),
                Duration::from_secs(4),
            ),
            status_topic: None,
        }
    }
}

struct Subscription {
    qos: QoS,
    queue: DispatchQueue,
}

type ReconnectCallback = Arc<dyn Fn() + Send + Sync>;

struct TransportInner {
    connector: Arc<dyn Connector>,
    options: TransportOptions,
    session: Mutex<Option<Arc<dyn BrokerSession>>>,
    state: watch::Sender<ConnectionState>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    reconnect_guard: Arc<tokio::sync::Mutex<()>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    reconnected: Mutex<Vec<ReconnectCallback>>,
    // Bumped on every connect so a stale reader cannot tear down a newer session
    generation: AtomicU64,
    publish_permits: Semaphore,
    shutdown: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Messaging transport shared by every component of a process
#[derive(Clone)]
pub struct MqttTransport {
    inner: Arc<TransportInner>,
}

impl MqttTransport {
    pub fn new(connector: Arc<dyn Connector>, options: TransportOptions) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let permits = options.max_inflight_publishes.max(1);

        Self {
            inner: Arc::new(TransportInner {
                connector,
                options,
                session: Mutex::new(None),
                state,
                subscriptions: Mutex::new(HashMap::new()),
                reconnect_guard: Arc::new(tokio::sync::Mutex::new(())),
                reconnect_task: Mutex::new(None),
                reader_task: Mutex::new(None),
                reconnected: Mutex::new(Vec::new()),
                generation: AtomicU64::new(0),
                publish_permits: Semaphore::new(permits),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Connect once. On failure the caller may fall back to
    /// [`MqttTransport::reconnect_in_background`].
    pub async fn connect(&self) -> Result<(), AgentError> {
        self.inner.establish().await
    }

    /// Start the reconnect loop unless one is already running.
    pub fn reconnect_in_background(&self) {
        self.inner.schedule_reconnect();
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch connection state changes
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Wait until the transport reaches `state`, giving up after `timeout`.
    pub async fn wait_for_state(&self, state: ConnectionState, timeout: Duration) -> bool {
        let mut changes = self.state_changes();
        let reached = matches!(
            tokio::time::timeout(timeout, changes.wait_for(|s| *s == state)).await,
            Ok(Ok(_))
        );
        reached
    }

    /// Register a callback run after every successful reconnect.
    pub fn on_reconnected(&self, callback: impl Fn() + Send + Sync + 'static) {
        lock(&self.inner.reconnected).push(Arc::new(callback));
    }

    /// Register `handler` for `pattern`. The subscription survives reconnects.
    ///
    /// When disconnected the handler is only registered and the broker
    /// subscription is issued on the next connect.
    pub async fn subscribe(
        &self,
        pattern: &str,
        qos: QoS,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), AgentError> {
        let queue = DispatchQueue::spawn(handler);
        let replaced = lock(&self.inner.subscriptions)
            .insert(pattern.to_string(), Subscription { qos, queue });
        if let Some(old) = replaced {
            old.queue.close();
        }

        match self.inner.current_session() {
            Some(session) => session.subscribe(pattern, qos).await,
            None => {
                debug!("Not connected, {} will be subscribed on connect", pattern);
                Ok(())
            }
        }
    }

    pub async fn unsubscribe(&self, pattern: &str) -> Result<(), AgentError> {
        let removed = lock(&self.inner.subscriptions).remove(pattern);
        if let Some(subscription) = removed {
            subscription.queue.close();
        }
        match self.inner.current_session() {
            Some(session) => session.unsubscribe(pattern).await,
            None => Ok(()),
        }
    }

    /// Patterns currently in the subscription registry
    pub fn subscriptions(&self) -> Vec<String> {
        let mut patterns: Vec<String> = lock(&self.inner.subscriptions).keys().cloned().collect();
        patterns.sort();
        patterns
    }

    /// Publish one message.
    ///
    /// Fails with [`AgentError::NotConnected`] while disconnected, which also
    /// kicks off a reconnect, and with [`AgentError::Timeout`] when the broker
    /// does not take the message within the publish timeout. Both are transient.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), AgentError> {
        let Some(session) = self.inner.current_session() else {
            debug!("Dropping publish to {} while disconnected", topic);
            self.inner.schedule_reconnect();
            return Err(AgentError::NotConnected);
        };

        let _permit = self
            .inner
            .publish_permits
            .acquire()
            .await
            .map_err(|_| AgentError::ShutdownError("publish permits closed".to_string()))?;

        match tokio::time::timeout(
            self.inner.options.publish_timeout,
            session.publish(topic, qos, retain, payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!("Publish to {} timed out", topic);
                Err(AgentError::Timeout(format!("publish to {}", topic)))
            }
        }
    }

    /// Serialize `value` and publish it with the delivery guarantees of `class`.
    pub async fn publish_class<T: Serialize>(
        &self,
        class: MessageClass,
        topic: &str,
        value: &T,
    ) -> Result<(), AgentError> {
        let payload = serde_json::to_vec(value)?;
        let delivery = class.delivery();

        if !delivery.reliable {
            return self.publish(topic, payload, delivery.qos, delivery.retain).await;
        }

        let shutdown = self.inner.shutdown.clone();
        retry_with_backoff(
            &self.inner.options.reliable_publish,
            |delay| {
                let shutdown = shutdown.clone();
                async move {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            },
            |attempt| {
                if attempt > 0 {
                    debug!("Retrying {:?} publish to {} (attempt {})", class, topic, attempt + 1);
                }
                self.publish(topic, payload.clone(), delivery.qos, delivery.retain)
            },
        )
        .await
    }

    /// Graceful shutdown: announce OFFLINE, stop reconnecting, drop every
    /// subscription and disconnect. Never schedules a reconnect.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();

        let reconnect = lock(&inner.reconnect_task).take();
        if let Some(task) = reconnect {
            task.abort();
        }

        let session = inner.current_session();
        let timeout = inner.options.publish_timeout;

        if let (Some(session), Some(topic)) = (&session, &inner.options.status_topic) {
            let offline = ServiceStatus::Offline.as_str().as_bytes().to_vec();
            match tokio::time::timeout(timeout, session.publish(topic, QoS::AtLeastOnce, true, offline))
                .await
            {
                Ok(Ok(())) => info!("Published OFFLINE to {}", topic),
                Ok(Err(e)) => warn!("Failed to publish OFFLINE: {}", e),
                Err(_) => warn!("Timed out publishing OFFLINE"),
            }
        }

        let subscriptions: Vec<(String, Subscription)> = lock(&inner.subscriptions).drain().collect();
        for (pattern, subscription) in subscriptions {
            if let Some(session) = &session {
                if let Ok(Err(e)) = tokio::time::timeout(timeout, session.unsubscribe(&pattern)).await {
                    debug!("Unsubscribe from {} failed: {}", pattern, e);
                }
            }
            subscription.queue.close();
        }

        if let Some(session) = &session {
            if let Ok(Err(e)) = tokio::time::timeout(timeout, session.disconnect()).await {
                warn!("Disconnect failed: {}", e);
            }
        }
        lock(&inner.session).take();
        inner.set_state(ConnectionState::Disconnected);

        // The reader flushes the disconnect; give it a moment before aborting
        let reader = lock(&inner.reader_task).take();
        if let Some(mut reader) = reader {
            if tokio::time::timeout(Duration::from_secs(1), &mut reader).await.is_err() {
                reader.abort();
            }
        }

        info!("Transport to {} shut down", inner.connector.describe());
    }
}

impl TransportInner {
    fn current_session(&self) -> Option<Arc<dyn BrokerSession>> {
        lock(&self.session).clone()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn last_will(&self) -> Option<LastWill> {
        self.options.status_topic.as_ref().map(|topic| LastWill {
            topic: topic.clone(),
            payload: ServiceStatus::Offline.as_str().as_bytes().to_vec(),
            qos: QoS::AtLeastOnce,
            retain: true,
        })
    }

    /// Open a connection, replay the subscription registry, start the reader
    /// and announce ONLINE.
    async fn establish(self: &Arc<Self>) -> Result<(), AgentError> {
        if self.shutdown.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        self.set_state(ConnectionState::Connecting);
        let last_will = self.last_will();
        let connection = match self.connector.connect(last_will.as_ref()).await {
            Ok(connection) => connection,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let session = connection.session;
        *lock(&self.session) = Some(session.clone());

        let registered: Vec<(String, QoS)> = lock(&self.subscriptions)
            .iter()
            .map(|(pattern, s)| (pattern.clone(), s.qos))
            .collect();
        for (pattern, qos) in registered {
            if let Err(e) = session.subscribe(&pattern, qos).await {
                warn!("Failed to resubscribe to {}: {}", pattern, e);
            }
        }

        let reader = tokio::spawn(Self::read_loop(self.clone(), connection.events, generation));
        let previous = lock(&self.reader_task).replace(reader);
        if let Some(previous) = previous {
            previous.abort();
        }

        self.set_state(ConnectionState::Connected);

        if let Some(topic) = &self.options.status_topic {
            let online = ServiceStatus::Online.as_str().as_bytes().to_vec();
            match tokio::time::timeout(
                self.options.publish_timeout,
                session.publish(topic, QoS::AtLeastOnce, true, online),
            )
            .await
            {
                Ok(Ok(())) => debug!("Published ONLINE to {}", topic),
                Ok(Err(e)) => warn!("Failed to publish ONLINE: {}", e),
                Err(_) => warn!("Timed out publishing ONLINE"),
            }
        }

        Ok(())
    }

    async fn read_loop(self: Arc<Self>, mut events: Box<dyn BrokerEvents>, generation: u64) {
        loop {
            match events.next_message().await {
                Ok(message) => self.route(message),
                Err(e) => {
                    self.on_connection_lost(generation, e);
                    return;
                }
            }
        }
    }

    /// Hand a message to every matching subscription without waiting on handlers.
    fn route(&self, message: MqttMessage) {
        let subscriptions = lock(&self.subscriptions);
        let mut delivered = false;
        for (pattern, subscription) in subscriptions.iter() {
            if Topics::matches(pattern, &message.topic) {
                delivered |= subscription.queue.push(message.clone());
            }
        }
        if !delivered {
            debug!("No handler for message on {}", message.topic);
        }
    }

    fn on_connection_lost(self: &Arc<Self>, generation: u64, error: AgentError) {
        if self.shutdown.is_cancelled() {
            debug!("Connection closed during shutdown");
            return;
        }
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }

        warn!("Connection to {} lost: {}", self.connector.describe(), error);
        lock(&self.session).take();
        self.set_state(ConnectionState::Disconnected);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }

        // Concurrent disconnect notifications collapse into one loop
        let guard = match self.reconnect_guard.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Reconnect already in progress");
                return;
            }
        };

        let inner = self.clone();
        let task = tokio::spawn(async move {
            inner.reconnect_loop().await;
            drop(guard);

            // The new session may have dropped while the guard was still held
            if lock(&inner.session).is_none() && !inner.shutdown.is_cancelled() {
                inner.schedule_reconnect();
            }
        });
        *lock(&self.reconnect_task) = Some(task);
    }

    async fn reconnect_loop(self: &Arc<Self>) {
        let shutdown = self.shutdown.clone();
        let result = retry_with_backoff(
            &self.options.reconnect,
            |delay| {
                let shutdown = shutdown.clone();
                async move {
                    debug!("Reconnecting in {:?}", delay);
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            },
            |attempt| {
                let inner = self.clone();
                async move {
                    info!(
                        "Reconnecting to {} (attempt {})",
                        inner.connector.describe(),
                        attempt + 1
                    );
                    inner.establish().await
                }
            },
        )
        .await;

        match result {
            Ok(()) => {
                info!("Reconnected to {}", self.connector.describe());
                let callbacks: Vec<ReconnectCallback> = lock(&self.reconnected).clone();
                for callback in callbacks {
                    callback();
                }
            }
            Err(AgentError::Cancelled) => debug!("Reconnect loop stopped by shutdown"),
            Err(e) => error!("Giving up reconnecting: {}", e),
        }
    }
}
