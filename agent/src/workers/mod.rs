//! Long-running workers

pub mod file_ops;
pub mod patch_listener;
pub mod scheduler;
