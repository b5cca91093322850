//! Status event publishing

use async_trait::async_trait;
use patch_protocol::{PatchStatus, StatusEvent};
use tracing::{debug, warn};

use crate::mqtt::policy::MessageClass;
use crate::mqtt::topics::Topics;
use crate::mqtt::transport::MqttTransport;

/// Where the patch engine sends its status events
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn publish(&self, event: &StatusEvent);
}

/// Message class for a status event: terminal outcomes must not be lost.
pub fn status_class(event: &StatusEvent) -> MessageClass {
    if event.is_terminal() || event.status == PatchStatus::Rollback {
        MessageClass::PatchTerminal
    } else {
        MessageClass::PatchProgress
    }
}

/// Publishes status events on `server/{branch}/PATCH/Status`
pub struct MqttStatusReporter {
    transport: MqttTransport,
    topic: String,
}

impl MqttStatusReporter {
    pub fn new(transport: MqttTransport, branch_id: &str) -> Self {
        Self {
            transport,
            topic: Topics::patch_status(branch_id),
        }
    }
}

#[async_trait]
impl StatusSink for MqttStatusReporter {
    async fn publish(&self, event: &StatusEvent) {
        let class = status_class(event);
        match self.transport.publish_class(class, &self.topic, event).await {
            Ok(()) => debug!(
                "Published {}/{} ({}%)",
                event.status, event.step, event.progress_percent
            ),
            Err(e) => warn!(
                "Failed to publish {}/{} for {}: {}",
                event.status, event.step, event.patch_id, e
            ),
        }
    }
}
