//! Control plane: deployment bookkeeping, status ingestion and scheduling

pub mod listener;
pub mod presence;
pub mod scheduler;
pub mod service;
pub mod store;

pub use service::{Coordinator, CoordinatorOptions, DeployOutcome, DeploymentSummary};
