//! Run state transitions
//!
//! Two separate tables drive [`RunState`]: one keyed by the state the device
//! reports, one keyed by operator actions. A `None` result means the input
//! does not apply in the current state and the state is left unchanged.

use grblbridge_core::RunState;

/// Signal derived from the device's reported state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSignal {
    /// Device is in feed hold
    Hold,
    /// Safety door is open
    Door,
    /// Device is executing motion
    Run,
}

impl DeviceSignal {
    /// Map a lower-cased device state to a signal
    pub fn from_device_state(state: &str) -> Option<Self> {
        match state {
            "hold" => Some(DeviceSignal::Hold),
            "door" => Some(DeviceSignal::Door),
            "run" => Some(DeviceSignal::Run),
            _ => None,
        }
    }
}

/// Operator request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorAction {
    /// Feed hold
    Pause,
    /// Cycle start
    Resume,
}

/// Device-driven transitions
pub fn device_transition(state: RunState, signal: DeviceSignal) -> Option<RunState> {
    use DeviceSignal::*;
    use RunState::*;

    match (state, signal) {
        (Running, Hold) => Some(Paused),
        (Running, Door) => Some(PausedDoorOpen),
        (Pausing, Hold) => Some(Paused),
        (Pausing, Door) => Some(PausedDoorOpen),
        (Paused, Run) => Some(Running),
        (Paused, Door) => Some(PausedDoorOpen),
        (PausedDoorOpen, Hold) => Some(Paused),
        (PausedDoorOpen, Run) => Some(Running),
        (Resuming, Run) => Some(Running),
        (Resuming, Door) => Some(PausedDoorOpen),
        _ => None,
    }
}

/// Operator-driven transitions
///
/// An open door accepts no operator action; only the device can leave it.
pub fn operator_transition(state: RunState, action: OperatorAction) -> Option<RunState> {
    use OperatorAction::*;
    use RunState::*;

    match (state, action) {
        (Running, Pause) => Some(Pausing),
        (Pausing, Resume) => Some(Resuming),
        (Paused, Resume) => Some(Resuming),
        (Resuming, Pause) => Some(Pausing),
        _ => None,
    }
}
