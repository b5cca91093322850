//! Progress sinks for the transfer service

use async_trait::async_trait;
use patch_protocol::{FileOperation, FileOperationProgress, FileOperationResult};
use tracing::{debug, info, warn};

use crate::mqtt::policy::MessageClass;
use crate::mqtt::topics::Topics;
use crate::mqtt::transport::MqttTransport;

/// Snapshot of a running transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub percent: u8,
}

impl TransferProgress {
    pub fn new(bytes_transferred: u64, total_bytes: u64) -> Self {
        let percent = if total_bytes == 0 {
            100
        } else {
            ((bytes_transferred.min(total_bytes) as u128 * 100) / total_bytes as u128) as u8
        };
        Self {
            bytes_transferred,
            total_bytes,
            percent,
        }
    }
}

/// Final result of a transfer. Only cancellation is reported as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// `bytes` were copied by this call; the destination now matches the source
    Completed { bytes: u64 },
    /// Destination already had the source's size; nothing was copied
    AlreadyTransferred { bytes: u64 },
    /// Every attempt failed
    Failed { reason: String },
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, TransferOutcome::Failed { .. })
    }
}

/// Receives throttled progress and the terminal outcome of one transfer
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn progress(&self, progress: TransferProgress);

    async fn finished(&self, outcome: &TransferOutcome);
}

/// Discards everything
pub struct NullSink;

#[async_trait]
impl ProgressSink for NullSink {
    async fn progress(&self, _progress: TransferProgress) {}

    async fn finished(&self, _outcome: &TransferOutcome) {}
}

/// Writes progress to the log
pub struct LogSink {
    pub label: String,
}

#[async_trait]
impl ProgressSink for LogSink {
    async fn progress(&self, progress: TransferProgress) {
        debug!(
            "{}: {}% ({}/{} bytes)",
            self.label, progress.percent, progress.bytes_transferred, progress.total_bytes
        );
    }

    async fn finished(&self, outcome: &TransferOutcome) {
        match outcome {
            TransferOutcome::Failed { reason } => warn!("{} failed: {}", self.label, reason),
            other => info!("{} finished: {:?}", self.label, other),
        }
    }
}

/// Publishes progress and the result of a remotely requested file operation
pub struct MqttProgressSink {
    pub transport: MqttTransport,
    pub branch_id: String,
    pub operation: FileOperation,
    pub request_id: Option<String>,
    pub source: String,
    pub dest: String,
    pub user: String,
}

#[async_trait]
impl ProgressSink for MqttProgressSink {
    async fn progress(&self, progress: TransferProgress) {
        let message = FileOperationProgress {
            request_id: self.request_id.clone(),
            operation: self.operation,
            source: self.source.clone(),
            user: self.user.clone(),
            percent: progress.percent,
            bytes_transferred: progress.bytes_transferred,
            total_bytes: progress.total_bytes,
        };
        let topic = Topics::file_progress(&self.branch_id, self.operation);
        if let Err(e) = self
            .transport
            .publish_class(MessageClass::TransferProgress, &topic, &message)
            .await
        {
            debug!("Dropped progress update for {}: {}", self.source, e);
        }
    }

    async fn finished(&self, outcome: &TransferOutcome) {
        let (success, message, bytes) = match outcome {
            TransferOutcome::Completed { bytes } => (true, "Transfer completed".to_string(), *bytes),
            TransferOutcome::AlreadyTransferred { bytes } => {
                (true, "Already transferred".to_string(), *bytes)
            }
            TransferOutcome::Failed { reason } => (false, reason.clone(), 0),
        };
        let result = FileOperationResult {
            request_id: self.request_id.clone(),
            operation: self.operation,
            source: self.source.clone(),
            dest: self.dest.clone(),
            user: self.user.clone(),
            success,
            message,
            bytes_transferred: bytes,
            entries: None,
        };
        let topic = Topics::file_response(&self.branch_id, self.operation);
        if let Err(e) = self
            .transport
            .publish_class(MessageClass::TransferResult, &topic, &result)
            .await
        {
            warn!("Failed to publish transfer result for {}: {}", self.source, e);
        }
    }
}
