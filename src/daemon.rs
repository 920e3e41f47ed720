//! Daemon event loop
//!
//! Everything that touches the machine controller runs on one task. Serial
//! reads, client commands and flasher progress arrive over a single channel;
//! controller timers are served by sleeping until the next deadline.

use crate::bridge::{Bridge, BridgeEvent, ClientCommand, Effect, ErrorNote, FlashRequest, Outbound};
use grblbridge_communication::{
    list_ports, FirmwareFlasher, FlashOutcome, MachineController, SerialEvent, SerialTransport,
};
use grblbridge_core::{EventDispatcher, FirmwareError, MachineEvent};
use grblbridge_settings::{DaemonSettings, MachineConfig};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Input to the daemon loop
#[derive(Debug)]
pub enum Inbound {
    /// Serial traffic, tagged with the connection it belongs to
    Serial { generation: u64, event: SerialEvent },
    /// Decoded client command
    Client(ClientCommand),
    /// Client sent a line that is not a valid command
    InvalidCommand(String),
    /// Client input ended
    ClientClosed,
    /// Controller released the port for flashing
    PortReleased(FlashRequest),
    /// Flasher progress percentage
    FlashProgress(u32),
    /// Flasher exited
    FlashFinished(Result<FlashOutcome, FirmwareError>),
}

/// Read line-delimited JSON commands from `input` until it ends
pub fn spawn_client_reader<R>(input: R, tx: UnboundedSender<Inbound>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(input).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let message = match serde_json::from_str::<ClientCommand>(line) {
                        Ok(command) => Inbound::Client(command),
                        Err(e) => {
                            warn!(error = %e, "Invalid client command");
                            Inbound::InvalidCommand(e.to_string())
                        }
                    };
                    if tx.send(message).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Client input failed");
                    break;
                }
            }
        }
        let _ = tx.send(Inbound::ClientClosed);
    })
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

/// Owns the controller and the client bridge
pub struct Daemon {
    controller: MachineController<SerialTransport>,
    events: broadcast::Receiver<MachineEvent>,
    bridge: Bridge,
    flasher: FirmwareFlasher,
    tx: UnboundedSender<Inbound>,
    rx: UnboundedReceiver<Inbound>,
    generation: u64,
    outbound: Vec<Outbound>,
    shutting_down: bool,
}

impl Daemon {
    pub fn new(settings: DaemonSettings, machine_config: Option<MachineConfig>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = EventDispatcher::default();
        let events = dispatcher.subscribe();
        let mut controller =
            MachineController::new(dispatcher, tracing::info_span!("machine"));
        if let Some(config) = machine_config {
            controller.set_config(config);
        }
        let flasher = FirmwareFlasher::new(settings.flash_tools_root());

        Self {
            controller,
            events,
            bridge: Bridge::new(settings, tx.clone()),
            flasher,
            tx,
            rx,
            generation: 0,
            outbound: Vec::new(),
            shutting_down: false,
        }
    }

    /// Sender feeding the daemon loop
    pub fn sender(&self) -> UnboundedSender<Inbound> {
        self.tx.clone()
    }

    /// Open `port` with the configured baud rate
    pub fn open_port(&mut self, port: &str) {
        let Some(baud_rate) = self.controller.config().map(|c| c.baud_rate) else {
            warn!(port, "Trying to connect without setting a configuration");
            return;
        };
        self.open_port_with(port, baud_rate);
    }

    fn open_port_with(&mut self, port: &str, baud_rate: u32) {
        if self.controller.port_name().is_some() {
            self.controller.disconnect();
        }

        self.generation += 1;
        let generation = self.generation;
        let tx = self.tx.clone();
        let opened = SerialTransport::open(port, baud_rate, move |event| {
            let _ = tx.send(Inbound::Serial { generation, event });
        });

        match opened {
            Ok(transport) => {
                self.controller.on_port_opened(transport);
                let effects = self.bridge.echo_port_opened();
                self.apply(effects);
            }
            Err(e) => {
                error!(port, error = %e, "Failed to open port");
                self.outbound
                    .push(MachineEvent::PortError(e.to_string()).into());
            }
        }
    }

    /// Run until client input ends and any stop sequence has finished
    pub async fn run<W>(mut self, mut output: W) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        info!(version = crate::VERSION, "Daemon started");
        self.outbound
            .push(BridgeEvent::Version(crate::VERSION.to_string()).into());
        self.flush(&mut output).await?;

        loop {
            let deadline = self.controller.next_deadline();
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(message) => self.handle(message),
                    None => break,
                },
                _ = wait_until(deadline) => self.controller.poll_timers(Instant::now()),
            }

            self.flush(&mut output).await?;

            if self.shutting_down && !self.controller.is_stopping() {
                info!("Client gone, shutting down");
                self.controller.disconnect();
                self.flush(&mut output).await?;
                break;
            }
        }
        Ok(())
    }

    fn handle(&mut self, message: Inbound) {
        match message {
            Inbound::Serial { generation, event } => {
                if generation != self.generation {
                    debug!(generation, current = self.generation, "Dropping stale serial event");
                    return;
                }
                let effects = self.bridge.echo_serial(&event);
                self.apply(effects);
                match event {
                    SerialEvent::Data(bytes) => self.controller.on_data(&bytes),
                    SerialEvent::Written(_) => {}
                    SerialEvent::Error(e) => self.controller.on_port_error(e),
                    SerialEvent::Closed => self.controller.on_port_closed(),
                }
            }
            Inbound::Client(command) => {
                debug!(?command, "Client command");
                let effects = self.bridge.handle_command(command, &mut self.controller);
                self.apply(effects);
            }
            Inbound::InvalidCommand(reason) => {
                self.outbound
                    .push(BridgeEvent::Error(ErrorNote::new(reason)).into());
            }
            Inbound::ClientClosed => {
                self.shutting_down = true;
                self.controller.stop();
            }
            Inbound::PortReleased(request) => {
                let effects = self.bridge.firmware_upload_started();
                self.apply(effects);
                self.spawn_flash(request);
            }
            Inbound::FlashProgress(percent) => {
                let effects = self.bridge.firmware_upload_progress(percent);
                self.apply(effects);
            }
            Inbound::FlashFinished(result) => {
                let effects = self
                    .bridge
                    .firmware_upload_finished(result, &mut self.controller);
                self.apply(effects);
            }
        }
    }

    fn spawn_flash(&self, request: FlashRequest) {
        let flasher = self.flasher.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let progress_tx = tx.clone();
            let result = flasher
                .upload(&request.port, &request.hex, &request.upload, move |percent| {
                    let _ = progress_tx.send(Inbound::FlashProgress(percent));
                })
                .await;
            let _ = tx.send(Inbound::FlashFinished(result));
        });
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send(message) => self.outbound.push(message),
                Effect::OpenPort { port, baud_rate } => self.open_port_with(&port, baud_rate),
                Effect::ListPorts => match list_ports() {
                    Ok(ports) => self.outbound.push(BridgeEvent::Ports(ports).into()),
                    Err(e) => self
                        .outbound
                        .push(BridgeEvent::Error(ErrorNote::new(e.to_string())).into()),
                },
            }
        }
    }

    async fn flush<W>(&mut self, output: &mut W) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let now = Instant::now();
        loop {
            match self.events.try_recv() {
                Ok(event) => {
                    let effects = self.bridge.forward(event, &self.controller, now);
                    self.apply(effects);
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event receiver lagged");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }

        for message in self.outbound.drain(..) {
            let mut line = serde_json::to_string(&message)?;
            line.push('\n');
            output.write_all(line.as_bytes()).await?;
        }
        output.flush().await?;
        Ok(())
    }
}
