//! Transport and command streaming
//!
//! The machine controller writes through a [`Transport`]; inbound traffic is
//! delivered separately as [`SerialEvent`]s by whoever owns the read side.

pub mod buffered;
pub mod serial;

use grblbridge_core::ConnectionError;

pub use buffered::{CommandBuffer, MAX_BYTES};
pub use serial::{list_ports, SerialPortInfo, SerialTransport};

/// Events produced by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialEvent {
    /// Raw bytes received
    Data(Vec<u8>),
    /// Raw bytes written to the device
    Written(Vec<u8>),
    /// Transport reported an error; the connection may still be open
    Error(String),
    /// Transport closed; always the last event
    Closed,
}

/// Write side of the link to the device
pub trait Transport: Send {
    /// Port name for logging
    fn name(&self) -> &str;

    /// Write raw bytes
    fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError>;

    /// Close the link
    ///
    /// The read side reports [`SerialEvent::Closed`] once it has stopped.
    fn close(&mut self);
}
