//! Data models for positions, job state, and overrides
//!
//! This module provides:
//! - Three-axis coordinates and the machine/work position pair
//! - Run state of an active job
//! - Job progress accounting
//! - Feed rate override snapshots
//! - Run time and port-lost diagnostic payloads

use crate::units::FeedRateUnits;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

/// A point in the device's three-axis coordinate space
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Coordinates {
    /// X-axis position
    pub x: f64,
    /// Y-axis position
    pub y: f64,
    /// Z-axis position
    pub z: f64,
}

/// Translation between the machine frame and the active work frame
pub type WorkCoordinateOffset = Coordinates;

impl Coordinates {
    /// Create a new coordinate triple
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Parse a comma separated `x,y,z` triple as reported by the device
    ///
    /// Extra trailing axes (A/B/C on some builds) are ignored.
    pub fn parse_triple(s: &str) -> Option<Self> {
        let mut parts = s.split(',').map(|p| p.trim().parse::<f64>());
        let x = parts.next()?.ok()?;
        let y = parts.next()?.ok()?;
        let z = parts.next()?.ok()?;
        Some(Self { x, y, z })
    }
}

impl Add for Coordinates {
    type Output = Coordinates;

    fn add(self, rhs: Self) -> Self::Output {
        Coordinates::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Coordinates {
    type Output = Coordinates;

    fn sub(self, rhs: Self) -> Self::Output {
        Coordinates::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X:{:.3} Y:{:.3} Z:{:.3}", self.x, self.y, self.z)
    }
}

/// Machine and work positions of the tool
///
/// Every published position satisfies `work = machine - offset` for the
/// last known work coordinate offset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Absolute machine position
    pub machine: Coordinates,
    /// Position in the active work coordinate system
    pub work: Coordinates,
}

impl Position {
    /// Build a position from both frames as reported
    pub fn new(machine: Coordinates, work: Coordinates) -> Self {
        Self { machine, work }
    }

    /// Derive the work frame from a machine position and an offset
    pub fn from_machine(machine: Coordinates, offset: WorkCoordinateOffset) -> Self {
        Self {
            machine,
            work: machine - offset,
        }
    }

    /// Derive the machine frame from a work position and an offset
    pub fn from_work(work: Coordinates, offset: WorkCoordinateOffset) -> Self {
        Self {
            machine: work + offset,
            work,
        }
    }

    /// Offset implied by the two frames
    pub fn offset(&self) -> WorkCoordinateOffset {
        self.machine - self.work
    }
}

/// Execution mode of an active job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    /// Job lines are being streamed
    #[default]
    Running,
    /// Feed hold requested, device still decelerating
    Pausing,
    /// Device reported hold
    Paused,
    /// Safety door opened
    PausedDoorOpen,
    /// Cycle start requested after a pause
    Resuming,
}

impl RunState {
    /// Whether this state counts as paused when collapsing job status
    pub fn is_paused(&self) -> bool {
        matches!(
            self,
            RunState::Pausing | RunState::Paused | RunState::PausedDoorOpen
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Running => "RUNNING",
            RunState::Pausing => "PAUSING",
            RunState::Paused => "PAUSED",
            RunState::PausedDoorOpen => "PAUSED_DOOR_OPEN",
            RunState::Resuming => "RESUMING",
        };
        write!(f, "{}", s)
    }
}

/// Progress accounting for the active job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobProgress {
    /// Commands acknowledged by the device
    pub completed: usize,
    /// Commands queued or in flight
    pub unprocessed: usize,
}

impl JobProgress {
    /// Percentage of commands completed, `None` before anything is accounted for
    pub fn percent_complete(&self) -> Option<f64> {
        let total = self.completed + self.unprocessed;
        if total == 0 {
            None
        } else {
            Some(self.completed as f64 / total as f64 * 100.0)
        }
    }
}

/// Snapshot of the feed rate override
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedRateOverride {
    /// Operator override percentage
    pub percentage: u32,
    /// Effective feed rate, unknown until a feed command has been seen
    pub value: Option<f64>,
    /// Unit of the base feed rate
    pub unit: Option<FeedRateUnits>,
}

impl Default for FeedRateOverride {
    fn default() -> Self {
        Self {
            percentage: 100,
            value: None,
            unit: None,
        }
    }
}

/// All operator overrides reported to clients
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Overrides {
    /// Feed rate override
    pub feed_rate: FeedRateOverride,
}

/// Wall-clock span a job spent running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTime {
    /// When the job (or resumed segment) started
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start: DateTime<Utc>,
    /// When it stopped running
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub end: DateTime<Utc>,
}

impl RunTime {
    /// Elapsed time in milliseconds
    pub fn elapsed_ms(&self) -> i64 {
        (self.end - self.start).num_milliseconds()
    }
}

/// Diagnostic payload emitted when the device connection is lost
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortLostReport {
    /// Last command the device acknowledged
    #[serde(rename = "last_instruction", skip_serializing_if = "Option::is_none")]
    pub last_command: Option<String>,
    /// Commands that were in the device buffer
    #[serde(rename = "active_buffer", skip_serializing_if = "Option::is_none")]
    pub buffer: Option<Vec<String>>,
    /// Human readable reason
    #[serde(rename = "sender_note")]
    pub note: String,
}

impl PortLostReport {
    /// Report for an unexpected disconnect with the commands that were lost
    pub fn disconnected(last_command: Option<String>, buffer: Vec<String>) -> Self {
        Self {
            last_command,
            buffer: Some(buffer),
            note: "Machine disconnected".to_string(),
        }
    }

    /// Report carrying only a note
    pub fn note(note: impl Into<String>) -> Self {
        Self {
            last_command: None,
            buffer: None,
            note: note.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_triple() {
        let c = Coordinates::parse_triple("1.000,-2.5,+3").unwrap();
        assert_eq!(c, Coordinates::new(1.0, -2.5, 3.0));
        assert!(Coordinates::parse_triple("1.0,2.0").is_none());
        assert!(Coordinates::parse_triple("a,b,c").is_none());
    }

    #[test]
    fn test_parse_triple_ignores_extra_axes() {
        let c = Coordinates::parse_triple("1,2,3,4").unwrap();
        assert_eq!(c, Coordinates::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_position_reconciliation() {
        let offset = Coordinates::new(1.0, 1.0, 1.0);
        let p = Position::from_machine(Coordinates::new(0.0, 0.0, 0.0), offset);
        assert_eq!(p.work, Coordinates::new(-1.0, -1.0, -1.0));

        let p = Position::from_work(Coordinates::new(2.0, 3.0, 4.0), offset);
        assert_eq!(p.machine, Coordinates::new(3.0, 4.0, 5.0));
        assert_eq!(p.offset(), offset);
    }

    #[test]
    fn test_percent_complete() {
        assert_eq!(JobProgress::default().percent_complete(), None);
        let progress = JobProgress {
            completed: 1,
            unprocessed: 3,
        };
        assert_eq!(progress.percent_complete(), Some(25.0));
    }

    #[test]
    fn test_run_state_serializes_screaming_case() {
        let json = serde_json::to_string(&RunState::PausedDoorOpen).unwrap();
        assert_eq!(json, "\"PAUSED_DOOR_OPEN\"");
        assert_eq!(RunState::PausedDoorOpen.to_string(), "PAUSED_DOOR_OPEN");
    }

    #[test]
    fn test_overrides_serialize_camel_case() {
        let overrides = Overrides {
            feed_rate: FeedRateOverride {
                percentage: 110,
                value: Some(110.0),
                unit: Some(FeedRateUnits::MmPerMin),
            },
        };
        let json = serde_json::to_value(overrides).unwrap();
        assert_eq!(json["feedRate"]["percentage"], 110);
        assert_eq!(json["feedRate"]["unit"], "mm/min");
    }

    #[test]
    fn test_port_lost_report_fields() {
        let report = PortLostReport::disconnected(Some("G1 X1".into()), vec!["G1 X2".into()]);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["last_instruction"], "G1 X1");
        assert_eq!(json["active_buffer"][0], "G1 X2");
        assert_eq!(json["sender_note"], "Machine disconnected");

        let json = serde_json::to_value(PortLostReport::note("done")).unwrap();
        assert!(json.get("active_buffer").is_none());
    }
}
