//! # GrblBridge Communication
//!
//! Serial transport, command streaming and the GRBL machine controller.
//! Also runs avrdude for firmware updates.

pub mod communication;
pub mod firmware;

pub use communication::{
    list_ports, CommandBuffer, SerialEvent, SerialPortInfo, SerialTransport, Transport, MAX_BYTES,
};
pub use firmware::grbl::{ControllerTiming, MachineController, UploadContinuation};
pub use firmware::{FeedRateTracker, FirmwareFlasher, FlashOutcome, FlashProgressParser};
