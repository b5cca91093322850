//! Integration tests for the branch agent and the coordinator

mod common;
mod test_end_to_end;
mod test_engine;
mod test_patch_listener;
mod test_server;
mod test_transfer;
