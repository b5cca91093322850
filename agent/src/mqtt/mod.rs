//! Messaging transport over an MQTT broker

pub mod broker;
pub mod client;
pub mod dispatch;
pub mod memory;
pub mod policy;
pub mod topics;
pub mod transport;

pub use rumqttc::QoS;
