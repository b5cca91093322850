//! Delivery guarantees per message class

use rumqttc::QoS;

/// What kind of message is being published
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// Routine telemetry
    Telemetry,
    /// File transfer progress percentages
    TransferProgress,
    /// File transfer completion or failure
    TransferResult,
    /// Intermediate patch progress
    PatchProgress,
    /// Patch completion, failure or rollback
    PatchTerminal,
    /// Coordinator to branch deployment request
    PatchRequest,
    /// Coordinator to branch file operation request
    FileRequest,
    /// ONLINE/OFFLINE presence
    ServiceStatus,
}

/// How a message class is handed to the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub qos: QoS,
    pub retain: bool,
    /// Retry the publish with backoff instead of giving up after one try
    pub reliable: bool,
}

impl MessageClass {
    pub fn delivery(self) -> Delivery {
        match self {
            MessageClass::Telemetry | MessageClass::TransferProgress => Delivery {
                qos: QoS::AtMostOnce,
                retain: false,
                reliable: false,
            },
            MessageClass::PatchProgress | MessageClass::FileRequest => Delivery {
                qos: QoS::AtLeastOnce,
                retain: false,
                reliable: false,
            },
            // A lost terminal status leaves the control plane waiting forever
            MessageClass::TransferResult | MessageClass::PatchTerminal => Delivery {
                qos: QoS::ExactlyOnce,
                retain: true,
                reliable: true,
            },
            MessageClass::PatchRequest => Delivery {
                qos: QoS::ExactlyOnce,
                retain: false,
                reliable: true,
            },
            MessageClass::ServiceStatus => Delivery {
                qos: QoS::AtLeastOnce,
                retain: true,
                reliable: false,
            },
        }
    }
}
