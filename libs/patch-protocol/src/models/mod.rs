//! Protocol models

pub mod messages;
pub mod status;
