//! Configuration for GrblBridge
//!
//! Two kinds of configuration live here:
//! - [`MachineConfig`]: what a particular machine speaks. Instruction names
//!   map to wire commands, some instructions are real-time, and the response
//!   vocabulary and firmware upload timing vary per board. Clients send it
//!   as JSON; it can also be loaded from a JSON or TOML file.
//! - [`DaemonSettings`]: local daemon preferences stored as TOML in the
//!   platform config directory.

use crate::error::{ConfigError, SettingsError, SettingsResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

fn default_success_response() -> String {
    "ok".to_string()
}

fn default_ready_responses() -> Vec<String> {
    vec!["Grbl".to_string()]
}

fn default_baud_rate() -> u32 {
    115200
}

/// Timing and programmer parameters for firmware upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareUploadConfig {
    /// avrdude part number (`-p`)
    pub avr_device: String,
    /// avrdude programmer id (`-c`)
    pub programmer: String,
    /// Bootloader baud rate (`-b`)
    pub baud_rate: u32,
    /// Send `$K` before the keepalive phase to reboot into the bootloader
    #[serde(default)]
    pub pre_reset: bool,
    /// Total keepalive duration before the port is released
    #[serde(default, rename = "resetDelay")]
    pub reset_delay_ms: u64,
    /// Interval between keepalive writes
    #[serde(rename = "resetKeepAliveInterval")]
    pub reset_keep_alive_interval_ms: u64,
}

/// Per-machine protocol configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineConfig {
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Instruction name to wire command
    #[serde(default)]
    pub gcode: HashMap<String, String>,
    /// Instructions written immediately, bypassing the command queue
    #[serde(default)]
    pub real_time_commands: HashSet<String>,
    /// Marker contained in acknowledgment lines
    #[serde(default = "default_success_response")]
    pub success_response: String,
    /// Markers contained in the device's startup banner
    #[serde(default = "default_ready_responses")]
    pub ready_responses: Vec<String>,
    /// Serial baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Firmware upload parameters, absent for boards that cannot be flashed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_upload: Option<FirmwareUploadConfig>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            gcode: HashMap::new(),
            real_time_commands: HashSet::new(),
            success_response: default_success_response(),
            ready_responses: default_ready_responses(),
            baud_rate: default_baud_rate(),
            firmware_upload: None,
        }
    }
}

/// Decode a mapped command written as `\uNN` (decimal) or `\u0xNN` (hex)
fn decode_escaped_command(command: &str) -> Option<String> {
    let Some(idx) = command.find("\\u") else {
        return Some(command.to_string());
    };
    let code = format!("{}{}", &command[..idx], &command[idx + 2..]);
    let code = code.trim();
    let value = match code.strip_prefix("0x").or_else(|| code.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => code.parse::<u32>().ok()?,
    };
    char::from_u32(value).map(String::from)
}

impl MachineConfig {
    /// Wire command for an instruction, with escapes decoded
    ///
    /// Returns `None` when the instruction is unmapped or its escape cannot
    /// be decoded.
    pub fn gcode_for(&self, instruction: &str) -> Option<String> {
        let raw = self.gcode.get(instruction)?;
        if raw.is_empty() {
            return None;
        }
        let decoded = decode_escaped_command(raw);
        if decoded.is_none() {
            tracing::warn!(instruction, command = %raw, "Undecodable command escape");
        }
        decoded
    }

    /// Whether the instruction is written out-of-band
    pub fn is_real_time(&self, instruction: &str) -> bool {
        self.real_time_commands.contains(instruction)
    }

    /// Load config from file (JSON or TOML)
    pub fn load_from_file(path: &Path) -> SettingsResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|source| SettingsError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        let config: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            other => {
                return Err(
                    ConfigError::UnsupportedFormat(other.unwrap_or_default().to_string()).into(),
                )
            }
        };

        config.validate()?;
        tracing::info!(name = %config.name, path = %path.display(), "Loaded machine config");
        Ok(config)
    }

    /// Save config to file (JSON or TOML)
    pub fn save_to_file(&self, path: &Path) -> SettingsResult<()> {
        self.validate()?;

        let content = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("toml") => toml::to_string_pretty(self)?,
            other => {
                return Err(
                    ConfigError::UnsupportedFormat(other.unwrap_or_default().to_string()).into(),
                )
            }
        };

        std::fs::write(path, content)
            .map_err(|source| SettingsError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> SettingsResult<()> {
        if self.baud_rate == 0 {
            return Err(ConfigError::ValueOutOfRange {
                key: "baudRate".to_string(),
                value: "0".to_string(),
            }
            .into());
        }

        if self.success_response.is_empty() {
            return Err(ConfigError::MissingKey("successResponse".to_string()).into());
        }

        if let Some(upload) = &self.firmware_upload {
            if upload.reset_keep_alive_interval_ms == 0 {
                return Err(ConfigError::ValueOutOfRange {
                    key: "firmwareUpload.resetKeepAliveInterval".to_string(),
                    value: "0".to_string(),
                }
                .into());
            }
            if upload.baud_rate == 0 {
                return Err(ConfigError::ValueOutOfRange {
                    key: "firmwareUpload.baudRate".to_string(),
                    value: "0".to_string(),
                }
                .into());
            }
        }

        Ok(())
    }
}

fn default_progress_throttle_ms() -> u64 {
    500
}

/// Local daemon preferences
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonSettings {
    /// Accept firmware upload requests from clients
    #[serde(default)]
    pub firmware_upload_enabled: bool,
    /// Minimum spacing of job progress messages to clients
    #[serde(default = "default_progress_throttle_ms")]
    pub progress_throttle_ms: u64,
    /// Root of the bundled avrdude installation
    #[serde(default)]
    pub flash_tools_root: Option<PathBuf>,
    /// Machine config loaded at startup
    #[serde(default)]
    pub default_machine_config: Option<PathBuf>,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            firmware_upload_enabled: false,
            progress_throttle_ms: default_progress_throttle_ms(),
            flash_tools_root: None,
            default_machine_config: None,
        }
    }
}

impl DaemonSettings {
    /// Platform config directory for the daemon
    pub fn config_dir() -> SettingsResult<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("grblbridge"))
            .ok_or_else(|| {
                SettingsError::ConfigDirectory("no config directory on this platform".to_string())
            })
    }

    /// Default settings file path
    pub fn default_path() -> SettingsResult<PathBuf> {
        Ok(Self::config_dir()?.join("daemon.toml"))
    }

    /// Load settings from a TOML file
    pub fn load_from_file(path: &Path) -> SettingsResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|source| SettingsError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(toml::from_str(&content)?)
    }

    /// Load settings, falling back to defaults when the file does not exist
    pub fn load_or_default(path: &Path) -> SettingsResult<Self> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            tracing::debug!(path = %path.display(), "No daemon settings file, using defaults");
            Ok(Self::default())
        }
    }

    /// Save settings as TOML, creating the parent directory
    pub fn save_to_file(&self, path: &Path) -> SettingsResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SettingsError::ConfigDirectory(e.to_string()))?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .map_err(|source| SettingsError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(())
    }

    /// Tool root used by the flasher, falling back to the config directory
    pub fn flash_tools_root(&self) -> PathBuf {
        self.flash_tools_root.clone().unwrap_or_else(|| {
            Self::config_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("arduino-flash-tools")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_escapes() {
        assert_eq!(decode_escaped_command("\\u0x18").as_deref(), Some("\u{18}"));
        assert_eq!(decode_escaped_command("\\u24").as_deref(), Some("\u{18}"));
        assert_eq!(decode_escaped_command("G0 Z5").as_deref(), Some("G0 Z5"));
        assert_eq!(decode_escaped_command("\\uzz"), None);
    }

    #[test]
    fn test_gcode_for() {
        let mut config = MachineConfig::default();
        config.gcode.insert("status".into(), "?".into());
        config.gcode.insert("reset".into(), "\\u0x18".into());
        config.gcode.insert("empty".into(), String::new());
        assert_eq!(config.gcode_for("status").as_deref(), Some("?"));
        assert_eq!(config.gcode_for("reset").as_deref(), Some("\u{18}"));
        assert_eq!(config.gcode_for("empty"), None);
        assert_eq!(config.gcode_for("park"), None);
    }

    #[test]
    fn test_client_json_shape() {
        let json = r#"{
            "name": "X-Carve",
            "gcode": {"pause": "!", "resume": "~", "status": "?"},
            "realTimeCommands": ["pause", "resume", "status"],
            "firmwareUpload": {
                "avrDevice": "atmega328p",
                "programmer": "arduino",
                "baudRate": 115200,
                "preReset": true,
                "resetDelay": 1000,
                "resetKeepAliveInterval": 100
            }
        }"#;
        let config: MachineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.success_response, "ok");
        assert_eq!(config.ready_responses, vec!["Grbl".to_string()]);
        assert!(config.is_real_time("pause"));
        assert!(!config.is_real_time("park"));
        let upload = config.firmware_upload.unwrap();
        assert_eq!(upload.reset_delay_ms, 1000);
        assert_eq!(upload.reset_keep_alive_interval_ms, 100);
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = MachineConfig {
            firmware_upload: Some(FirmwareUploadConfig {
                avr_device: "m328p".into(),
                programmer: "arduino".into(),
                baud_rate: 115200,
                pre_reset: false,
                reset_delay_ms: 100,
                reset_keep_alive_interval_ms: 0,
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_daemon_defaults() {
        let settings: DaemonSettings = toml::from_str("").unwrap();
        assert!(!settings.firmware_upload_enabled);
        assert_eq!(settings.progress_throttle_ms, 500);
    }
}
