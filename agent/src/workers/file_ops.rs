//! Agent side of `branch/{id}/SFTP/{op}`
//!
//! Download and Upload go through the resumable transfer service and report
//! progress as they run. Delete and FolderStucher act on the local file system
//! and only report a result.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use patch_protocol::{FileEntry, FileOperation, FileOperationRequest, FileOperationResult};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::AgentError;
use crate::filesys::listing::{delete_path, list_directory};
use crate::mqtt::broker::MqttMessage;
use crate::mqtt::dispatch::MessageHandler;
use crate::mqtt::policy::MessageClass;
use crate::mqtt::topics::Topics;
use crate::mqtt::transport::MqttTransport;
use crate::transfer::service::TransferService;
use crate::transfer::sink::{MqttProgressSink, ProgressSink, TransferOutcome};

/// Runs remotely requested file operations, one task each
pub struct FileOperationWorker {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    branch_id: String,
    transport: MqttTransport,
    transfer: Arc<TransferService>,
    cancel: CancellationToken,
}

impl FileOperationWorker {
    pub fn new(
        branch_id: &str,
        transport: MqttTransport,
        transfer: Arc<TransferService>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                branch_id: branch_id.to_string(),
                transport,
                transfer,
                cancel,
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Wait for every running operation
    pub async fn wait_idle(&self) {
        let tasks: Vec<_> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!("File operation task ended abnormally: {}", e);
            }
        }
    }

    /// Cancel in-flight transfers and wait for them to unwind
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.wait_idle().await;
    }
}

#[async_trait]
impl MessageHandler for FileOperationWorker {
    async fn handle(&self, message: MqttMessage) -> Result<(), AgentError> {
        let operation = Topics::parse_file_operation(&message.topic).ok_or_else(|| {
            AgentError::ValidationError(format!("Unknown file operation topic {}", message.topic))
        })?;
        let request: FileOperationRequest = message.parse_json()?;
        info!(
            "{} requested by {}: {} -> {}",
            operation.as_str(),
            request.user,
            request.source,
            request.dest
        );

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.execute(operation, request).await });

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
        Ok(())
    }
}

impl Inner {
    async fn execute(&self, operation: FileOperation, request: FileOperationRequest) {
        match operation {
            FileOperation::Download | FileOperation::Upload => self.transfer(operation, request).await,
            FileOperation::Delete => {
                let result = delete_path(&request.source).await;
                let (success, message) = match result {
                    Ok(()) => (true, format!("Deleted {}", request.source)),
                    Err(e) => (false, format!("Failed to delete {}: {}", request.source, e)),
                };
                self.publish_result(operation, &request, success, message, None)
                    .await;
            }
            FileOperation::FolderStucher => {
                let (success, message, entries) = match list_directory(&request.source).await {
                    Ok(entries) => (true, format!("{} entries", entries.len()), Some(entries)),
                    Err(e) => (false, format!("Failed to list {}: {}", request.source, e), None),
                };
                self.publish_result(operation, &request, success, message, entries)
                    .await;
            }
        }
    }

    async fn transfer(&self, operation: FileOperation, request: FileOperationRequest) {
        if request.dest.trim().is_empty() {
            self.publish_result(
                operation,
                &request,
                false,
                "Destination is required".to_string(),
                None,
            )
            .await;
            return;
        }

        let sink = MqttProgressSink {
            transport: self.transport.clone(),
            branch_id: self.branch_id.clone(),
            operation,
            request_id: request.request_id.clone(),
            source: request.source.clone(),
            dest: request.dest.clone(),
            user: request.user.clone(),
        };

        let result = if operation == FileOperation::Download {
            self.transfer
                .download(&request.source, &PathBuf::from(&request.dest), &sink, &self.cancel)
                .await
        } else {
            self.transfer
                .upload(&PathBuf::from(&request.source), &request.dest, &sink, &self.cancel)
                .await
        };

        // Only cancellation comes back as an error; report it like any failure
        if let Err(e) = result {
            sink.finished(&TransferOutcome::Failed {
                reason: e.to_string(),
            })
            .await;
        }
    }

    async fn publish_result(
        &self,
        operation: FileOperation,
        request: &FileOperationRequest,
        success: bool,
        message: String,
        entries: Option<Vec<FileEntry>>,
    ) {
        if !success {
            warn!("{} failed: {}", operation.as_str(), message);
        }
        let result = FileOperationResult {
            request_id: request.request_id.clone(),
            operation,
            source: request.source.clone(),
            dest: request.dest.clone(),
            user: request.user.clone(),
            success,
            message,
            bytes_transferred: 0,
            entries,
        };
        let topic = Topics::file_response(&self.branch_id, operation);
        if let Err(e) = self
            .transport
            .publish_class(MessageClass::TransferResult, &topic, &result)
            .await
        {
            warn!("Failed to publish {} result: {}", operation.as_str(), e);
        }
    }
}
