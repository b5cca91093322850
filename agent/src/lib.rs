//! Branch patch deployment
//!
//! Shared library for the branch agent and the patch coordinator: a
//! self-healing MQTT transport, resumable file transfer, the patch engine with
//! rollback and the coordinator's deployment bookkeeping.

pub mod app;
pub mod coordinator;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod mqtt;
pub mod patch;
pub mod retry;
pub mod server;
pub mod storage;
pub mod transfer;
pub mod utils;
pub mod workers;
