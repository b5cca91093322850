//! Branch presence fed by retained ONLINE/OFFLINE messages and last wills

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use patch_protocol::ServiceStatus;
use tracing::{debug, info};

use crate::errors::AgentError;
use crate::mqtt::broker::MqttMessage;
use crate::mqtt::dispatch::MessageHandler;
use crate::mqtt::topics::Topics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceEntry {
    pub status: ServiceStatus,
    pub since: DateTime<Utc>,
}

/// Last known presence of every branch that ever reported one
#[derive(Default)]
pub struct BranchPresence {
    entries: RwLock<HashMap<String, PresenceEntry>>,
}

impl BranchPresence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, branch_id: &str, status: ServiceStatus) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let changed = entries
            .get(branch_id)
            .is_none_or(|entry| entry.status != status);
        if changed {
            info!(branch_id = %branch_id, "Branch is now {}", status.as_str());
            entries.insert(
                branch_id.to_string(),
                PresenceEntry {
                    status,
                    since: Utc::now(),
                },
            );
        }
    }

    pub fn get(&self, branch_id: &str) -> Option<PresenceEntry> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(branch_id).copied()
    }

    /// Branches never heard from count as offline.
    pub fn is_online(&self, branch_id: &str) -> bool {
        self.get(branch_id)
            .is_some_and(|entry| entry.status == ServiceStatus::Online)
    }

    pub fn online_branches(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut online: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.status == ServiceStatus::Online)
            .map(|(branch, _)| branch.clone())
            .collect();
        online.sort();
        online
    }
}

#[async_trait]
impl MessageHandler for BranchPresence {
    async fn handle(&self, message: MqttMessage) -> Result<(), AgentError> {
        let branch_id = Topics::parse_branch_id(&message.topic).ok_or_else(|| {
            AgentError::ValidationError(format!("No branch in topic {}", message.topic))
        })?;

        // An empty retained payload is a cleared retained message
        if message.payload.is_empty() {
            debug!("Presence for {} cleared", branch_id);
            return Ok(());
        }

        let status = ServiceStatus::from_payload(&message.payload).ok_or_else(|| {
            AgentError::ValidationError(format!(
                "Unrecognised presence payload from {}",
                branch_id
            ))
        })?;
        self.update(&branch_id, status);
        Ok(())
    }
}
