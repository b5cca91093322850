//! Coordinator HTTP surface

pub mod handlers;
pub mod serve;
pub mod state;
