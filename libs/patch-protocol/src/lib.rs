//! Wire models shared by the patch coordinator and the branch agents.

pub mod models;

pub use models::messages::{
    FileEntry, FileOperation, FileOperationProgress, FileOperationRequest, FileOperationResult,
    PatchDeploymentRequest, StatusEvent, PATCH_REQUEST_TYPE_APPLICATION,
};
pub use models::status::{PatchStatus, PatchStep, ServiceStatus};
