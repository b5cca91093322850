//! Server state

use std::sync::Arc;

use crate::coordinator::presence::BranchPresence;
use crate::coordinator::service::Coordinator;
use crate::mqtt::transport::MqttTransport;

/// Server state shared across handlers
pub struct ServerState {
    pub coordinator: Arc<Coordinator>,
    pub presence: Arc<BranchPresence>,
    pub transport: MqttTransport,
}

impl ServerState {
    pub fn new(coordinator: Arc<Coordinator>, presence: Arc<BranchPresence>, transport: MqttTransport) -> Self {
        Self {
            coordinator,
            presence,
            transport,
        }
    }
}
