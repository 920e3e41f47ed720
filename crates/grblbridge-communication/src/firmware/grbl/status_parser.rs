//! GRBL Status Report Parsing
//!
//! Status reports come in two wire formats:
//! - before 1.1: `<Run,MPos:x,y,z,WPos:x,y,z[,Pin:nnn|b|]>`
//! - 1.1 and later: `<State[:Sub](|Key:Value)*>`
//!
//! Position fields may carry only one frame plus a work coordinate offset;
//! [`ReportedPosition::resolve`] reconciles them against what is already known.

use grblbridge_core::{Coordinates, Position, WorkCoordinateOffset};
use regex::Regex;
use std::sync::OnceLock;

/// Position fields present in a single status report
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ReportedPosition {
    /// `MPos` field
    pub machine: Option<Coordinates>,
    /// `WPos` field
    pub work: Option<Coordinates>,
    /// `WCO` field
    pub offset: Option<WorkCoordinateOffset>,
}

impl ReportedPosition {
    /// Whether the report carried any position field at all
    pub fn is_empty(&self) -> bool {
        self.machine.is_none() && self.work.is_none() && self.offset.is_none()
    }

    /// Build a complete position from this report
    ///
    /// `offset` is the best known work coordinate offset (this report's, or
    /// the last one seen). `last` is the last published position, used when
    /// the report carries only an offset.
    pub fn resolve(
        &self,
        offset: Option<WorkCoordinateOffset>,
        last: Option<Position>,
    ) -> Option<Position> {
        match (self.machine, self.work, offset) {
            (Some(machine), Some(work), _) => Some(Position::new(machine, work)),
            (Some(machine), None, Some(offset)) => Some(Position::from_machine(machine, offset)),
            (None, Some(work), Some(offset)) => Some(Position::from_work(work, offset)),
            (None, None, Some(offset)) if self.offset.is_some() => {
                last.map(|p| Position::from_machine(p.machine, offset))
            }
            _ => None,
        }
    }
}

/// Decoded status report
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatusReport {
    /// Device state, lower-cased
    pub state: String,
    /// Substate, lower-cased
    pub substate: Option<String>,
    /// Position fields
    pub position: ReportedPosition,
    /// Probe pin bit
    ///
    /// Modern reports always carry a value; a missing `Pn` field reads as 0,
    /// which cannot be told apart from an explicit "not triggered".
    pub probe: Option<u8>,
    /// Spindle current, verbatim
    pub spindle_current: Option<String>,
}

fn legacy_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let n = r"([-+]?[0-9]*\.?[0-9]+)";
        let triple = format!("{n},{n},{n}");
        Regex::new(&format!(
            r"(\w+),MPos:{triple},WPos:{triple}(?:,Pin:(?:\d{{3}})?\|(\d)\|)?"
        ))
        .expect("invalid regex pattern")
    })
}

fn modern_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^<([\w:]+)((?:\|\w+:\S+)*)>$").expect("invalid regex pattern")
    })
}

/// Status report parser
pub struct StatusParser;

impl StatusParser {
    /// Parse a bracketed status line in either format
    ///
    /// Returns `None` when the line matches neither format.
    pub fn parse(line: &str) -> Option<StatusReport> {
        Self::parse_legacy(line).or_else(|| Self::parse_modern(line))
    }

    /// Parse the pre-1.1 comma separated format
    pub fn parse_legacy(line: &str) -> Option<StatusReport> {
        let caps = legacy_regex().captures(line)?;
        let num = |i: usize| caps[i].parse::<f64>().ok();
        let machine = Coordinates::new(num(2)?, num(3)?, num(4)?);
        let work = Coordinates::new(num(5)?, num(6)?, num(7)?);

        Some(StatusReport {
            state: caps[1].to_lowercase(),
            substate: None,
            position: ReportedPosition {
                machine: Some(machine),
                work: Some(work),
                offset: None,
            },
            probe: caps.get(8).and_then(|m| m.as_str().parse::<u8>().ok()),
            spindle_current: None,
        })
    }

    /// Parse the 1.1 pipe separated format
    pub fn parse_modern(line: &str) -> Option<StatusReport> {
        let caps = modern_regex().captures(line)?;
        let state_field = caps[1].to_lowercase();
        let mut state_parts = state_field.split(':');
        let state = state_parts.next().unwrap_or_default().to_string();
        let substate = state_parts.next().map(str::to_string);

        let mut report = StatusReport {
            state,
            substate,
            probe: Some(0),
            ..Default::default()
        };

        let fields = caps.get(2).map_or("", |m| m.as_str());
        for field in fields.split('|').filter(|f| !f.is_empty()) {
            let Some((key, value)) = field.split_once(':') else {
                continue;
            };
            match key {
                "MPos" => report.position.machine = Coordinates::parse_triple(value),
                "WPos" => report.position.work = Coordinates::parse_triple(value),
                "WCO" => report.position.offset = Coordinates::parse_triple(value),
                "Pn" => report.probe = Some(u8::from(value.contains('P'))),
                "I" if !value.is_empty() => report.spindle_current = Some(value.to_string()),
                _ => {}
            }
        }

        Some(report)
    }
}
