//! Serial port communication implementation
//!
//! Provides the serial link to the controller:
//! - Port enumeration and discovery
//! - Opening a port at the configured baud rate
//! - A blocking reader thread forwarding bytes as [`SerialEvent`]s
//! - Writes from the owning controller

use super::{SerialEvent, Transport};
use grblbridge_core::ConnectionError;
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialPortInfo {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    pub com_name: String,

    /// Port description (e.g., "USB Serial Port")
    pub description: String,

    /// Manufacturer name if available
    pub manufacturer: Option<String>,

    /// Serial number if available
    pub serial_number: Option<String>,

    /// USB vendor ID if applicable
    pub vendor_id: Option<u16>,

    /// USB product ID if applicable
    pub product_id: Option<u16>,
}

impl SerialPortInfo {
    /// Create a new port info
    pub fn new(com_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            com_name: com_name.into(),
            description: description.into(),
            manufacturer: None,
            serial_number: None,
            vendor_id: None,
            product_id: None,
        }
    }

    /// Set manufacturer
    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    /// Set serial number
    pub fn with_serial_number(mut self, serial_number: impl Into<String>) -> Self {
        self.serial_number = Some(serial_number.into());
        self
    }

    /// Set USB IDs
    pub fn with_usb_ids(mut self, vid: u16, pid: u16) -> Self {
        self.vendor_id = Some(vid);
        self.product_id = Some(pid);
        self
    }
}

/// List available serial ports on the system
///
/// Filters ports to the patterns CNC controllers show up as:
/// - Windows: COM* (e.g., COM1, COM3)
/// - Linux: /dev/ttyUSB*, /dev/ttyACM*
/// - macOS: /dev/cu.usbserial-*, /dev/cu.usbmodem*
pub fn list_ports() -> Result<Vec<SerialPortInfo>, ConnectionError> {
    let ports = serialport::available_ports().map_err(|e| {
        tracing::error!("Failed to enumerate serial ports: {}", e);
        ConnectionError::SerialError {
            reason: format!("Failed to enumerate ports: {}", e),
        }
    })?;

    Ok(ports
        .iter()
        .filter(|port| is_valid_cnc_port(&port.port_name))
        .map(|port| {
            let info = SerialPortInfo::new(&port.port_name, get_port_description(port));
            match &port.port_type {
                serialport::SerialPortType::UsbPort(usb_info) => {
                    let mut info = info.with_usb_ids(usb_info.vid, usb_info.pid);
                    if let Some(ref mfg) = usb_info.manufacturer {
                        info = info.with_manufacturer(mfg);
                    }
                    if let Some(ref serial) = usb_info.serial_number {
                        info = info.with_serial_number(serial);
                    }
                    info
                }
                _ => info,
            }
        })
        .collect())
}

fn is_valid_cnc_port(port_name: &str) -> bool {
    if let Some(num) = port_name.strip_prefix("COM") {
        return !num.is_empty() && num.chars().all(|c| c.is_ascii_digit());
    }

    port_name.starts_with("/dev/ttyUSB")
        || port_name.starts_with("/dev/ttyACM")
        || port_name.starts_with("/dev/cu.usbserial-")
        || port_name.starts_with("/dev/cu.usbmodem")
}

fn get_port_description(port: &serialport::SerialPortInfo) -> String {
    match &port.port_type {
        serialport::SerialPortType::UsbPort(usb_info) => {
            format!(
                "USB {} {}",
                usb_info.manufacturer.as_deref().unwrap_or("Device"),
                usb_info.product.as_deref().unwrap_or("Serial Port")
            )
        }
        serialport::SerialPortType::BluetoothPort => "Bluetooth Serial".to_string(),
        serialport::SerialPortType::PciPort => "PCI Serial".to_string(),
        _ => "Serial Port".to_string(),
    }
}

/// Serial transport backed by the `serialport` crate
///
/// Reading happens on a dedicated thread that hands every chunk to the sink
/// supplied at open time. The thread always delivers [`SerialEvent::Closed`]
/// as its last event. Successful writes are reported to the same sink as
/// [`SerialEvent::Written`].
pub struct SerialTransport {
    name: String,
    port: Option<Box<dyn serialport::SerialPort>>,
    sink: Arc<dyn Fn(SerialEvent) + Send + Sync>,
    closing: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl SerialTransport {
    /// Open `port_name` and start the reader thread
    pub fn open<F>(port_name: &str, baud_rate: u32, sink: F) -> Result<Self, ConnectionError>
    where
        F: Fn(SerialEvent) + Send + Sync + 'static,
    {
        let sink: Arc<dyn Fn(SerialEvent) + Send + Sync> = Arc::new(sink);
        let port = serialport::new(port_name, baud_rate)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| {
                tracing::warn!("Failed to open serial port {}: {}", port_name, e);
                match e.kind() {
                    serialport::ErrorKind::NoDevice => ConnectionError::PortNotFound {
                        port: port_name.to_string(),
                    },
                    _ => ConnectionError::FailedToOpen {
                        port: port_name.to_string(),
                        reason: e.to_string(),
                    },
                }
            })?;

        let mut reader_port = port.try_clone().map_err(|e| ConnectionError::FailedToOpen {
            port: port_name.to_string(),
            reason: e.to_string(),
        })?;

        let closing = Arc::new(AtomicBool::new(false));
        let reader_closing = closing.clone();
        let reader_sink = sink.clone();
        let thread_name = format!("serial-reader:{}", port_name);
        let reader = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let mut buf = [0u8; 1024];
                while !reader_closing.load(Ordering::SeqCst) {
                    match reader_port.read(&mut buf) {
                        Ok(0) => {}
                        Ok(n) => reader_sink(SerialEvent::Data(buf[..n].to_vec())),
                        Err(e) if e.kind() == ErrorKind::TimedOut => {}
                        Err(e) if e.kind() == ErrorKind::Interrupted => {}
                        Err(e) => {
                            reader_sink(SerialEvent::Error(e.to_string()));
                            break;
                        }
                    }
                }
                reader_sink(SerialEvent::Closed);
            })
            .map_err(|e| ConnectionError::IoError {
                reason: e.to_string(),
            })?;

        tracing::info!(port = port_name, baud_rate, "Serial port opened");

        Ok(Self {
            name: port_name.to_string(),
            port: Some(port),
            sink,
            closing,
            reader: Some(reader),
        })
    }
}

impl Transport for SerialTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        let port = self.port.as_mut().ok_or(ConnectionError::NotOpen)?;
        port.write_all(data)?;
        port.flush()?;
        (self.sink)(SerialEvent::Written(data.to_vec()));
        Ok(())
    }

    fn close(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        self.port = None;
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                tracing::warn!(port = %self.name, "Serial reader thread panicked");
            }
        }
        tracing::info!(port = %self.name, "Serial port closed");
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        if self.port.is_some() {
            self.close();
        }
    }
}
