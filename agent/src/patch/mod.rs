//! Branch patch engine: download, validate, back up, update, verify and roll back

pub mod archive;
pub mod engine;
pub mod host;
pub mod reporter;
pub mod tracker;

pub use engine::{PatchEngine, PatchEngineOptions, PatchOutcome};
