//! Supervised dispatch of inbound messages to handlers
//!
//! Each subscription owns one worker task that feeds messages to its handler in
//! arrival order. A failing or panicking handler is logged and the worker moves
//! on to the next message.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::errors::AgentError;
use crate::mqtt::broker::MqttMessage;

/// Receives messages for one subscription
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: MqttMessage) -> Result<(), AgentError>;
}

/// Outcome of one supervised dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    Failed(String),
    Panicked(String),
}

/// Run `handler` on `message`, converting errors and panics into an outcome.
pub async fn supervise(handler: &dyn MessageHandler, message: MqttMessage) -> DispatchOutcome {
    let topic = message.topic.clone();

    match AssertUnwindSafe(handler.handle(message)).catch_unwind().await {
        Ok(Ok(())) => {
            debug!("Handled message on {}", topic);
            DispatchOutcome::Handled
        }
        Ok(Err(e)) => {
            error!("Handler for {} failed: {}", topic, e);
            DispatchOutcome::Failed(e.to_string())
        }
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("Handler for {} panicked: {}", topic, reason);
            DispatchOutcome::Panicked(reason)
        }
    }
}

/// Sequential, supervised queue in front of a handler
pub struct DispatchQueue {
    sender: mpsc::UnboundedSender<MqttMessage>,
    worker: JoinHandle<()>,
}

impl DispatchQueue {
    pub fn spawn(handler: Arc<dyn MessageHandler>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<MqttMessage>();
        let worker = tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                supervise(handler.as_ref(), message).await;
            }
        });
        Self { sender, worker }
    }

    /// Hand a message off without waiting for the handler.
    pub fn push(&self, message: MqttMessage) -> bool {
        self.sender.send(message).is_ok()
    }

    /// Stop the worker, dropping queued messages
    pub fn close(self) {
        self.worker.abort();
    }
}
