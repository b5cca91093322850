//! Resumable chunked file transfer against the remote artifact store

pub mod path;
pub mod remote;
pub mod service;
pub mod sink;
