//! Client bridge
//!
//! Translates line-delimited JSON client commands into machine controller
//! calls and machine events into outbound client messages.
//!
//! Inbound: `{"type": "<command>", ...fields}`
//! Outbound: `{"event": "<name>", "data": <payload>}`

use crate::daemon::Inbound;
use grblbridge_communication::{
    FlashOutcome, MachineController, SerialEvent, SerialPortInfo, Transport,
};
use grblbridge_core::{FirmwareError, MachineEvent, Overrides};
use grblbridge_settings::{DaemonSettings, FirmwareUploadConfig, MachineConfig};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// Command sent by a client
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    SetConfig { config: MachineConfig },
    InitPort { port: String },
    GetPorts,
    Gcode {
        #[serde(default)]
        name: String,
        gcode: String,
    },
    Console { line: String },
    Execute { instructions: Vec<String> },
    Pause,
    Resume,
    Stop,
    Acquire { timestamp: i64 },
    GetConnection,
    GetJobStatus,
    GetMachineBuildInfo,
    MachineSettings,
    UpdateFirmware { hex: String },
    Disconnect,
    SetEcho { enabled: bool },
}

/// Error payload sent to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorNote {
    pub sender_note: String,
}

impl ErrorNote {
    pub fn new(note: impl Into<String>) -> Self {
        Self {
            sender_note: note.into(),
        }
    }
}

/// Raw transport activity mirrored to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EchoAction {
    Write,
    Read,
    PortOpened,
    Close,
    #[serde(rename = "port-error")]
    PortError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Echo {
    pub action: EchoAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// Job progress tagged with the job name
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobReport {
    pub percent: Option<f64>,
    pub overrides: Overrides,
    pub name: String,
}

/// Messages produced by the bridge itself
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum BridgeEvent {
    Version(String),
    Progress(JobReport),
    Echo(Echo),
    #[serde(rename = "connection_status")]
    ConnectionStatus(Option<String>),
    Overrides(Overrides),
    Ports(Vec<SerialPortInfo>),
    Error(ErrorNote),
    FirmwareUploadStart,
    FirmwareUploadProgress(u32),
    FirmwareUploadDone(FlashOutcome),
}

/// Anything written to the client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    Machine(MachineEvent),
    Bridge(BridgeEvent),
}

impl From<MachineEvent> for Outbound {
    fn from(event: MachineEvent) -> Self {
        Outbound::Machine(event)
    }
}

impl From<BridgeEvent> for Outbound {
    fn from(event: BridgeEvent) -> Self {
        Outbound::Bridge(event)
    }
}

/// Port released for flashing, ready for the flasher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashRequest {
    pub port: String,
    pub hex: String,
    pub upload: FirmwareUploadConfig,
}

/// Work the bridge needs the daemon to perform
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Send a message to the client
    Send(Outbound),
    /// Open the serial port at the given baud rate
    OpenPort { port: String, baud_rate: u32 },
    /// Enumerate serial ports and report them
    ListPorts,
}

/// Command/event translation state
pub struct Bridge {
    settings: DaemonSettings,
    inbound: UnboundedSender<Inbound>,
    project_name: String,
    echo_enabled: bool,
    last_progress: Option<Instant>,
    firmware_progress: u32,
}

impl Bridge {
    pub fn new(settings: DaemonSettings, inbound: UnboundedSender<Inbound>) -> Self {
        Self {
            settings,
            inbound,
            project_name: "Unknown".to_string(),
            echo_enabled: false,
            last_progress: None,
            firmware_progress: 0,
        }
    }

    /// Apply a client command to the controller
    pub fn handle_command<T: Transport>(
        &mut self,
        command: ClientCommand,
        controller: &mut MachineController<T>,
    ) -> Vec<Effect> {
        match command {
            ClientCommand::SetConfig { config } => {
                if let Err(e) = config.validate() {
                    warn!(name = %config.name, error = %e, "Rejected machine config");
                    return vec![Self::error(e.to_string())];
                }
                info!(name = %config.name, "Setting config");
                controller.set_config(config);
                Vec::new()
            }
            ClientCommand::InitPort { port } => match controller.config() {
                Some(config) => {
                    info!(port = %port, "Opening port");
                    vec![Effect::OpenPort {
                        port,
                        baud_rate: config.baud_rate,
                    }]
                }
                None => {
                    warn!(port = %port, "Trying to connect without setting a configuration");
                    Vec::new()
                }
            },
            ClientCommand::GetPorts => vec![Effect::ListPorts],
            ClientCommand::Gcode { name, gcode } => {
                let lines: Vec<String> = gcode.split('\n').map(str::to_string).collect();
                info!(lines = lines.len(), "Got gcode");
                self.project_name = name;
                controller.stream_job(lines);
                Vec::new()
            }
            ClientCommand::Console { line } => {
                controller.enqueue_instant(line);
                Vec::new()
            }
            ClientCommand::Execute { instructions } => {
                controller.execute(instructions);
                Vec::new()
            }
            ClientCommand::Pause => {
                controller.pause();
                Vec::new()
            }
            ClientCommand::Resume => {
                controller.resume();
                Vec::new()
            }
            ClientCommand::Stop => {
                controller.stop();
                Vec::new()
            }
            ClientCommand::Acquire { timestamp } => {
                controller.acquire(timestamp);
                Vec::new()
            }
            ClientCommand::GetConnection => vec![self.connection_status(controller)],
            ClientCommand::GetJobStatus => {
                controller.report_job_status();
                vec![Self::overrides(controller)]
            }
            ClientCommand::GetMachineBuildInfo => {
                controller.report_build_info();
                Vec::new()
            }
            ClientCommand::MachineSettings => {
                controller.request_settings();
                Vec::new()
            }
            ClientCommand::UpdateFirmware { hex } => self.update_firmware(hex, controller),
            ClientCommand::Disconnect => {
                controller.disconnect();
                Vec::new()
            }
            ClientCommand::SetEcho { enabled } => {
                debug!(enabled, "Serial echo");
                self.echo_enabled = enabled;
                Vec::new()
            }
        }
    }

    fn update_firmware<T: Transport>(
        &mut self,
        hex: String,
        controller: &mut MachineController<T>,
    ) -> Vec<Effect> {
        if !self.settings.firmware_upload_enabled {
            warn!("Firmware upload requested but disabled in settings");
            return vec![Self::error("Firmware upload is disabled")];
        }
        info!("Received request to upload firmware");

        let Some(upload) = controller
            .config()
            .and_then(|config| config.firmware_upload.clone())
        else {
            return vec![Self::error(
                "Cannot upload firmware with unsupported machine config",
            )];
        };
        let Some(port) = controller.port_name().map(str::to_string) else {
            return vec![Self::error(
                "Cannot upload firmware without a connected machine",
            )];
        };

        let request = FlashRequest {
            port,
            hex,
            upload: upload.clone(),
        };
        let inbound = self.inbound.clone();
        let continuation = Box::new(move || {
            if inbound.send(Inbound::PortReleased(request)).is_err() {
                warn!("Daemon loop gone before flashing could start");
            }
        });

        match controller.begin_firmware_upload(continuation, &upload) {
            Ok(()) => {
                info!("Beginning firmware upload");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "Cannot upload firmware");
                vec![Self::error("Cannot upload firmware in machine's current state")]
            }
        }
    }

    /// Port was released; flashing starts now
    pub fn firmware_upload_started(&mut self) -> Vec<Effect> {
        self.firmware_progress = 0;
        vec![
            Effect::Send(BridgeEvent::FirmwareUploadStart.into()),
            Effect::Send(BridgeEvent::FirmwareUploadProgress(0).into()),
        ]
    }

    /// Progress reported by the flasher
    pub fn firmware_upload_progress(&mut self, percent: u32) -> Vec<Effect> {
        self.firmware_progress = percent;
        vec![Effect::Send(
            BridgeEvent::FirmwareUploadProgress(percent).into(),
        )]
    }

    /// Flasher finished
    pub fn firmware_upload_finished<T: Transport>(
        &mut self,
        result: Result<FlashOutcome, FirmwareError>,
        controller: &mut MachineController<T>,
    ) -> Vec<Effect> {
        let effects = match result {
            Ok(outcome) => vec![Effect::Send(BridgeEvent::FirmwareUploadDone(outcome).into())],
            Err(e) => {
                tracing::error!(error = %e, "Firmware upload failed");
                vec![
                    Self::error(e.to_string()),
                    Effect::Send(
                        BridgeEvent::FirmwareUploadDone(FlashOutcome {
                            success: false,
                            code: None,
                        })
                        .into(),
                    ),
                ]
            }
        };
        controller.end_firmware_upload();
        effects
    }

    /// Translate a controller event into client messages
    pub fn forward<T: Transport>(
        &mut self,
        event: MachineEvent,
        controller: &MachineController<T>,
        now: Instant,
    ) -> Vec<Effect> {
        match event {
            MachineEvent::Connected(_) => vec![self.connection_status(controller)],
            MachineEvent::OverridesChanged => vec![Self::overrides(controller)],
            MachineEvent::UploadingFirmware => vec![Effect::Send(
                BridgeEvent::FirmwareUploadProgress(self.firmware_progress).into(),
            )],
            MachineEvent::Progress { percent, overrides } => {
                let complete = percent.is_some_and(|p| p >= 100.0);
                let throttle = Duration::from_millis(self.settings.progress_throttle_ms);
                let due = self
                    .last_progress
                    .is_none_or(|last| now.duration_since(last) > throttle);
                if complete || due {
                    self.last_progress = Some(now);
                    vec![Effect::Send(
                        BridgeEvent::Progress(JobReport {
                            percent,
                            overrides,
                            name: self.project_name.clone(),
                        })
                        .into(),
                    )]
                } else {
                    Vec::new()
                }
            }
            other => vec![Effect::Send(other.into())],
        }
    }

    /// Mirror transport activity while echo is enabled
    pub fn echo_serial(&self, event: &SerialEvent) -> Vec<Effect> {
        if !self.echo_enabled {
            return Vec::new();
        }
        let (action, data) = match event {
            SerialEvent::Written(bytes) => (EchoAction::Write, Some(lossy(bytes))),
            SerialEvent::Data(bytes) => (EchoAction::Read, Some(lossy(bytes))),
            SerialEvent::Error(e) => (EchoAction::PortError, Some(e.clone())),
            SerialEvent::Closed => (EchoAction::Close, None),
        };
        vec![Effect::Send(BridgeEvent::Echo(Echo { action, data }).into())]
    }

    pub fn echo_port_opened(&self) -> Vec<Effect> {
        if !self.echo_enabled {
            return Vec::new();
        }
        vec![Effect::Send(
            BridgeEvent::Echo(Echo {
                action: EchoAction::PortOpened,
                data: None,
            })
            .into(),
        )]
    }

    fn connection_status<T: Transport>(&self, controller: &MachineController<T>) -> Effect {
        Effect::Send(BridgeEvent::ConnectionStatus(controller.machine_identification()).into())
    }

    fn overrides<T: Transport>(controller: &MachineController<T>) -> Effect {
        Effect::Send(BridgeEvent::Overrides(controller.current_overrides()).into())
    }

    fn error(note: impl Into<String>) -> Effect {
        Effect::Send(BridgeEvent::Error(ErrorNote::new(note)).into())
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
