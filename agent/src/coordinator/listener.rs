//! Inbound patch status routing
//!
//! Events are processed in arrival order per branch, with branches running in
//! parallel up to a shared persistence limit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use patch_protocol::StatusEvent;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error};

use crate::coordinator::service::{Coordinator, StatusDisposition};
use crate::errors::AgentError;
use crate::mqtt::broker::MqttMessage;
use crate::mqtt::dispatch::MessageHandler;
use crate::mqtt::topics::Topics;

/// Handler for `server/+/PATCH/Status`
pub struct StatusListener {
    coordinator: Arc<Coordinator>,
    permits: Arc<Semaphore>,
    lanes: Mutex<HashMap<String, mpsc::UnboundedSender<StatusEvent>>>,
}

impl StatusListener {
    pub fn new(coordinator: Arc<Coordinator>, max_concurrent: usize) -> Self {
        Self {
            coordinator,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            lanes: Mutex::new(HashMap::new()),
        }
    }

    fn enqueue(&self, branch_id: String, mut event: StatusEvent) {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lane) = lanes.get(&branch_id) {
            match lane.send(event) {
                Ok(()) => return,
                // Lane worker is gone; start a new one
                Err(mpsc::error::SendError(returned)) => event = returned,
            }
        }
        let lane = self.spawn_lane(branch_id.clone());
        let _ = lane.send(event);
        lanes.insert(branch_id, lane);
    }

    fn spawn_lane(&self, branch_id: String) -> mpsc::UnboundedSender<StatusEvent> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<StatusEvent>();
        let coordinator = self.coordinator.clone();
        let permits = self.permits.clone();

        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let Ok(_permit) = permits.acquire().await else {
                    return;
                };
                match coordinator.handle_status(&branch_id, event).await {
                    Ok(StatusDisposition::Applied { .. }) => {}
                    Ok(StatusDisposition::Ignored { reason }) => {
                        debug!(branch_id = %branch_id, "Ignored status event: {}", reason)
                    }
                    Err(e) => error!(branch_id = %branch_id, "Failed to apply status event: {}", e),
                }
            }
        });
        sender
    }
}

#[async_trait]
impl MessageHandler for StatusListener {
    async fn handle(&self, message: MqttMessage) -> Result<(), AgentError> {
        let branch_id = Topics::parse_branch_id(&message.topic).ok_or_else(|| {
            AgentError::ValidationError(format!("No branch in topic {}", message.topic))
        })?;
        if message.payload.is_empty() {
            return Ok(());
        }
        let event: StatusEvent = message.parse_json()?;
        self.enqueue(branch_id, event);
        Ok(())
    }
}
