//! Message payloads

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::status::{PatchStatus, PatchStep};

/// Request type carried by application patches.
pub const PATCH_REQUEST_TYPE_APPLICATION: &str = "Application";

fn default_request_type() -> String {
    PATCH_REQUEST_TYPE_APPLICATION.to_string()
}

/// Deployment request sent from the coordinator to one branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchDeploymentRequest {
    /// Coordinator job id; older senders may omit it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,

    pub user_id: String,

    pub patch_id: String,

    /// Path of the artifact inside the remote file store
    pub patch_zip_path: String,

    /// Hex SHA-256 of the artifact. Validation is skipped when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_checksum: Option<String>,

    pub status: PatchStatus,

    pub step: PatchStep,

    #[serde(default = "default_request_type")]
    pub request_type: String,
}

/// Progress or outcome reported by a branch agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,

    pub user_id: String,

    pub patch_id: String,

    #[serde(default = "default_request_type")]
    pub patch_request_type: String,

    pub status: PatchStatus,

    pub step: PatchStep,

    #[serde(default)]
    pub message: String,

    pub progress_percent: u8,

    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    /// Build a status event answering `request`.
    pub fn for_request(
        request: &PatchDeploymentRequest,
        status: PatchStatus,
        step: PatchStep,
        progress_percent: u8,
        message: impl Into<String>,
    ) -> Self {
        Self {
            job_id: request.job_id.clone(),
            user_id: request.user_id.clone(),
            patch_id: request.patch_id.clone(),
            patch_request_type: request.request_type.clone(),
            status,
            step,
            message: message.into(),
            progress_percent: progress_percent.min(100),
            timestamp: Utc::now(),
        }
    }

    /// No further events follow a terminal one for the same job.
    pub fn is_terminal(&self) -> bool {
        self.status == PatchStatus::Failed || self.step.closes_job()
    }
}

/// File operations the coordinator can ask a branch to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileOperation {
    Download,
    Upload,
    Delete,
    /// Directory listing. The spelling is part of the deployed topic contract.
    FolderStucher,
}

impl FileOperation {
    pub const ALL: [FileOperation; 4] = [
        FileOperation::Download,
        FileOperation::Upload,
        FileOperation::Delete,
        FileOperation::FolderStucher,
    ];

    /// Topic segment for this operation
    pub fn as_str(self) -> &'static str {
        match self {
            FileOperation::Download => "Download",
            FileOperation::Upload => "Upload",
            FileOperation::Delete => "Delete",
            FileOperation::FolderStucher => "FolderStucher",
        }
    }

    pub fn from_segment(segment: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == segment)
    }
}

/// File operation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOperationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    pub source: String,

    #[serde(default)]
    pub dest: String,

    pub user: String,
}

/// Throttled progress for a running file transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOperationProgress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub operation: FileOperation,
    pub source: String,
    pub user: String,
    pub percent: u8,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
}

/// Terminal result of a file operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOperationResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub operation: FileOperation,
    pub source: String,
    pub dest: String,
    pub user: String,
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub bytes_transferred: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<FileEntry>>,
}

/// Metadata for a single file or directory entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    /// Last-modified time as a Unix timestamp in seconds (None if unavailable).
    pub modified: Option<u64>,
}
