//! GRBL Response Parser
//!
//! Splits the raw byte stream from the device into lines and classifies each
//! line. Classification is ordered; the first matching rule wins:
//! ready marker, success marker, status report, `$n=` setting, probe result,
//! bracketed build info, `error:`, `ALARM:`, over-current, unknown.

use super::status_parser::{StatusParser, StatusReport};
use grblbridge_settings::MachineConfig;
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// Classified device output
#[derive(Debug, Clone, PartialEq)]
pub enum GrblResponse {
    /// Device announced itself (startup banner)
    Ready(String),
    /// Command acknowledgment
    Ack,
    /// Status report
    Status(StatusReport),
    /// Settings line (`$n=value`)
    Settings(String),
    /// Probe cycle result flag
    ProbeResult(u8),
    /// Bracketed build or version info
    BuildInfo(String),
    /// `error:` line
    Error(String),
    /// `ALARM:` line
    Alarm(String),
    /// Over-current report
    OverCurrent(String),
    /// Anything else
    Unknown(String),
}

impl fmt::Display for GrblResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(line) => write!(f, "ready:{}", line),
            Self::Ack => write!(f, "ok"),
            Self::Status(report) => write!(f, "status:{}", report.state),
            Self::Settings(line) => write!(f, "settings:{}", line),
            Self::ProbeResult(flag) => write!(f, "probe:{}", flag),
            Self::BuildInfo(line) => write!(f, "build_info:{}", line),
            Self::Error(line) => write!(f, "error:{}", line),
            Self::Alarm(line) => write!(f, "alarm:{}", line),
            Self::OverCurrent(line) => write!(f, "over_current:{}", line),
            Self::Unknown(line) => write!(f, "unknown:{}", line),
        }
    }
}

fn settings_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\$\d+\s*=").expect("invalid regex pattern"))
}

fn probe_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[PRB:.+").expect("invalid regex pattern"))
}

fn probe_flag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[PRB:.+:(0|1)\]").expect("invalid regex pattern"))
}

fn build_info_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\[.+:[\d-]*(:[^:]+)*\]$").expect("invalid regex pattern"))
}

fn over_current_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[OverCurrent:(.+)\]").expect("invalid regex pattern"))
}

/// Line-oriented decoder for device output
///
/// Holds the partial line left over from the previous read so lines split
/// across reads are reassembled in arrival order.
#[derive(Debug, Default)]
pub struct GrblResponseParser {
    pending: Vec<u8>,
}

impl GrblResponseParser {
    /// Create a new GRBL response parser
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes and return every completed, trimmed, non-empty line
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    /// Drop any partial line
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Classify one line against the configured response vocabulary
    ///
    /// Returns `None` for empty lines and for lines that look like status
    /// reports or probe results but cannot be decoded; those are logged.
    pub fn parse(&self, line: &str, config: &MachineConfig) -> Option<GrblResponse> {
        let line = line.trim();

        if line.is_empty() {
            return None;
        }

        if config
            .ready_responses
            .iter()
            .any(|marker| !marker.is_empty() && line.contains(marker.as_str()))
        {
            return Some(GrblResponse::Ready(line.to_string()));
        }

        if !config.success_response.is_empty() && line.contains(config.success_response.as_str())
        {
            return Some(GrblResponse::Ack);
        }

        if line.starts_with('<') && line.ends_with('>') {
            return match StatusParser::parse(line) {
                Some(report) => Some(GrblResponse::Status(report)),
                None => {
                    tracing::error!(line, "Unknown status format");
                    None
                }
            };
        }

        if settings_regex().is_match(line) {
            return Some(GrblResponse::Settings(line.to_string()));
        }

        if probe_regex().is_match(line) {
            return match probe_flag_regex()
                .captures(line)
                .and_then(|caps| caps[1].parse::<u8>().ok())
            {
                Some(flag) => Some(GrblResponse::ProbeResult(flag)),
                None => {
                    tracing::error!(line, "Probe result without success flag");
                    None
                }
            };
        }

        if build_info_regex().is_match(line) {
            return Some(GrblResponse::BuildInfo(line.to_string()));
        }

        if line.contains("error:") {
            return Some(GrblResponse::Error(line.to_string()));
        }

        if line.contains("ALARM:") {
            return Some(GrblResponse::Alarm(line.to_string()));
        }

        if over_current_regex().is_match(line) {
            return Some(GrblResponse::OverCurrent(line.to_string()));
        }

        Some(GrblResponse::Unknown(line.to_string()))
    }
}
