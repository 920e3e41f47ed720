//! Feed rate units
//!
//! The controller only tracks the unit mode a G-code program selects with
//! `G20`/`G21`; positions are reported by the device in whatever unit it is
//! configured for and are passed through untouched.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Feed rate units selected by the active G-code program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedRateUnits {
    /// Millimeters per minute (`G21`)
    #[serde(rename = "mm/min")]
    MmPerMin,
    /// Inches per minute (`G20`)
    #[serde(rename = "in/min")]
    InPerMin,
}

impl Default for FeedRateUnits {
    fn default() -> Self {
        Self::MmPerMin
    }
}

impl fmt::Display for FeedRateUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MmPerMin => write!(f, "mm/min"),
            Self::InPerMin => write!(f, "in/min"),
        }
    }
}

impl FromStr for FeedRateUnits {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mm/min" | "mm" => Ok(Self::MmPerMin),
            "in/min" | "in" | "inch" => Ok(Self::InPerMin),
            _ => Err(format!("Unknown feed rate unit: {}", s)),
        }
    }
}
