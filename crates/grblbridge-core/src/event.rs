//! Event system for machine communication
//!
//! Provides:
//! - The typed set of events a machine controller emits
//! - Event dispatcher fanning events out to subscribers

use crate::data::{Overrides, Position, PortLostReport, RunState, RunTime};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted by the machine controller
///
/// Serialized as `{"event": <name>, "data": <payload>}` using the names
/// clients subscribe to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum MachineEvent {
    /// Device announced itself; carries the identification line
    Connected(String),
    /// Connected and idle, no job active
    Ready,
    /// Reconciled tool position
    Position(Position),
    /// Raw device state, lower-cased
    GrblState {
        /// State such as `idle`, `run`, `hold`
        state: String,
        /// Optional substate code
        substate: Option<String>,
    },
    /// Run state of the active job
    RunState(RunState),
    /// Job progress with the current overrides
    Progress {
        /// Percent complete
        percent: Option<f64>,
        /// Override snapshot
        overrides: Overrides,
    },
    /// Job paused at the given percent
    Paused(Option<f64>),
    /// Job resumed at the given percent
    Resumed(Option<f64>),
    /// A running segment of the job ended
    RunTime(RunTime),
    /// Abort sequence in progress
    Stopping,
    /// Firmware upload in progress
    UploadingFirmware,
    /// Raw `$n=` settings line
    Settings(String),
    /// Raw build info line
    MachineBuildInfo(String),
    /// Probe pin state
    ProbeStatus(u8),
    /// Probe cycle result flag
    ProbeResult(u8),
    /// Spindle current as reported
    SpindleCurrent(String),
    /// Feed rate override or base rate changed
    OverridesChanged,
    /// Connection to the device was lost
    #[serde(rename = "port_lost")]
    PortLost(PortLostReport),
    /// Transport reported an error
    PortError(String),
    /// Device reported `error:`
    GrblError(String),
    /// Device reported `ALARM:`
    GrblAlarm(String),
    /// Device reported an over-current condition
    GrblOverCurrent(String),
    /// Unclassified device output
    Unknown(String),
    /// Machine may be acquired by another client
    Release(i64),
}

impl MachineEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            MachineEvent::Connected(_) => "connected",
            MachineEvent::Ready => "ready",
            MachineEvent::Position(_) => "position",
            MachineEvent::GrblState { .. } => "grbl-state",
            MachineEvent::RunState(_) => "run-state",
            MachineEvent::Progress { .. } => "progress",
            MachineEvent::Paused(_) => "paused",
            MachineEvent::Resumed(_) => "resumed",
            MachineEvent::RunTime(_) => "run-time",
            MachineEvent::Stopping => "stopping",
            MachineEvent::UploadingFirmware => "uploading-firmware",
            MachineEvent::Settings(_) => "settings",
            MachineEvent::MachineBuildInfo(_) => "machine-build-info",
            MachineEvent::ProbeStatus(_) => "probe-status",
            MachineEvent::ProbeResult(_) => "probe-result",
            MachineEvent::SpindleCurrent(_) => "spindle-current",
            MachineEvent::OverridesChanged => "overrides-changed",
            MachineEvent::PortLost(_) => "port_lost",
            MachineEvent::PortError(_) => "port-error",
            MachineEvent::GrblError(_) => "grbl-error",
            MachineEvent::GrblAlarm(_) => "grbl-alarm",
            MachineEvent::GrblOverCurrent(_) => "grbl-over-current",
            MachineEvent::Unknown(_) => "unknown",
            MachineEvent::Release(_) => "release",
        }
    }
}

impl std::fmt::Display for MachineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineEvent::Connected(id) => write!(f, "Connected to {}", id),
            MachineEvent::Position(p) => write!(f, "Position - Machine: {}, Work: {}", p.machine, p.work),
            MachineEvent::GrblState { state, substate } => match substate {
                Some(sub) => write!(f, "State: {}:{}", state, sub),
                None => write!(f, "State: {}", state),
            },
            MachineEvent::RunState(state) => write!(f, "Run state: {}", state),
            MachineEvent::GrblError(msg) => write!(f, "Error: {}", msg),
            MachineEvent::GrblAlarm(msg) => write!(f, "Alarm: {}", msg),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// Event dispatcher for publishing events to subscribers
#[derive(Clone)]
pub struct EventDispatcher {
    tx: broadcast::Sender<MachineEvent>,
}

impl EventDispatcher {
    /// Create a new event dispatcher
    ///
    /// # Arguments
    /// * `buffer_size` - Capacity of the broadcast buffer
    pub fn new(buffer_size: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer_size);
        Self { tx }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<MachineEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all subscribers
    ///
    /// Returns the number of receivers; zero when nobody is listening.
    pub fn publish(&self, event: MachineEvent) -> usize {
        tracing::trace!(event = event.name(), "publish");
        self.tx.send(event).unwrap_or(0)
    }

    /// Get number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(1024)
    }
}
