//! On-disk layout and configuration files

pub mod layout;
pub mod settings;
