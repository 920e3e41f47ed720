//! GRBL protocol support
//!
//! Decoding of device output, run state tables, line inspection and the
//! machine controller built on top of them.

pub mod controller;
pub mod line_interpreter;
pub mod response_parser;
pub mod run_state;
pub mod status_parser;

pub use controller::{ControllerTiming, MachineController, UploadContinuation};
pub use line_interpreter::{interpret, LineIntent};
pub use response_parser::{GrblResponse, GrblResponseParser};
pub use run_state::{device_transition, operator_transition, DeviceSignal, OperatorAction};
pub use status_parser::{ReportedPosition, StatusParser, StatusReport};
