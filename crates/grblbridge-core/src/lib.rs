//! # GrblBridge Core
//!
//! Core types shared by the GrblBridge crates: the position and job data
//! model, the typed machine event set with its dispatcher, and the error
//! types used across the workspace.

pub mod data;
pub mod error;
pub mod event;
pub mod units;

pub use data::{
    Coordinates, FeedRateOverride, JobProgress, Overrides, PortLostReport, Position, RunState,
    RunTime, WorkCoordinateOffset,
};

pub use error::{ConnectionError, ControllerError, FirmwareError};

pub use event::{EventDispatcher, MachineEvent};

pub use units::FeedRateUnits;
