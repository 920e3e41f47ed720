//! GrblBridge Settings Crate
//!
//! Handles machine protocol configuration and local daemon settings.

pub mod config;
pub mod error;

pub use config::{DaemonSettings, FirmwareUploadConfig, MachineConfig};
pub use error::{ConfigError, SettingsError, SettingsResult};
