//! GRBL Machine Controller
//!
//! Composes the response parser, command buffer, run state tables and feed
//! rate tracker into the command/event surface clients talk to.
//!
//! The controller is synchronous and owned by a single task. Inbound traffic
//! arrives through [`MachineController::on_data`] and friends; timed work
//! (status heartbeat, stop sequence, firmware keepalive) is exposed as a
//! deadline through [`MachineController::next_deadline`] and executed by
//! [`MachineController::poll_timers`].

use super::line_interpreter::{interpret, LineIntent};
use super::response_parser::{GrblResponse, GrblResponseParser};
use super::run_state::{device_transition, operator_transition, DeviceSignal, OperatorAction};
use super::status_parser::{ReportedPosition, StatusReport};
use crate::communication::{CommandBuffer, Transport};
use crate::firmware::override_manager::FeedRateTracker;
use chrono::{DateTime, Utc};
use grblbridge_core::{
    ControllerError, EventDispatcher, FeedRateUnits, JobProgress, MachineEvent, Overrides,
    PortLostReport, Position, RunState, RunTime, WorkCoordinateOffset,
};
use grblbridge_settings::{FirmwareUploadConfig, MachineConfig};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn, Span};

/// Continuation run once the port has been released for flashing
pub type UploadContinuation = Box<dyn FnOnce() + Send>;

/// Timer intervals used by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerTiming {
    /// Status poll interval while connected
    pub heartbeat_interval: Duration,
    /// Delay between the phases of the stop sequence
    pub stop_settle_delay: Duration,
}

impl Default for ControllerTiming {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(500),
            stop_settle_delay: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopPhase {
    Flush,
    Resume,
    Park,
}

#[derive(Debug)]
struct StopSequence {
    phase: StopPhase,
    due: Instant,
}

struct FirmwareHandoff {
    remaining_ms: i64,
    interval: Duration,
    due: Instant,
    continuation: Option<UploadContinuation>,
}

/// Machine controller for GRBL-class devices
pub struct MachineController<T: Transport> {
    span: Span,
    events: EventDispatcher,
    timing: ControllerTiming,
    transport: Option<T>,
    config: Option<Arc<MachineConfig>>,
    parser: GrblResponseParser,
    buffer: CommandBuffer,
    feed_rate: FeedRateTracker,
    gcode_unit: FeedRateUnits,
    run_state: RunState,
    is_running: bool,
    is_stopping: bool,
    is_uploading_firmware: bool,
    is_connected: bool,
    identification: Option<String>,
    position: Option<Position>,
    work_offset: Option<WorkCoordinateOffset>,
    run_started: Option<DateTime<Utc>>,
    heartbeat_due: Option<Instant>,
    stop_sequence: Option<StopSequence>,
    firmware_handoff: Option<FirmwareHandoff>,
}

impl<T: Transport> MachineController<T> {
    /// Create a controller publishing to `events` and logging under `span`
    pub fn new(events: EventDispatcher, span: Span) -> Self {
        Self::with_timing(events, span, ControllerTiming::default())
    }

    /// Create a controller with custom timer intervals
    pub fn with_timing(events: EventDispatcher, span: Span, timing: ControllerTiming) -> Self {
        Self {
            span,
            events,
            timing,
            transport: None,
            config: None,
            parser: GrblResponseParser::new(),
            buffer: CommandBuffer::new(),
            feed_rate: FeedRateTracker::default(),
            gcode_unit: FeedRateUnits::MmPerMin,
            run_state: RunState::Running,
            is_running: false,
            is_stopping: false,
            is_uploading_firmware: false,
            is_connected: false,
            identification: None,
            position: None,
            work_offset: None,
            run_started: None,
            heartbeat_due: None,
            stop_sequence: None,
            firmware_handoff: None,
        }
    }

    // ---- transport lifecycle -------------------------------------------

    /// The transport opened; the device has not announced itself yet
    pub fn on_port_opened(&mut self, transport: T) {
        let span = self.span.clone();
        let _enter = span.enter();
        info!(port = transport.name(), "Port opened");

        if let Some(mut old) = self.transport.replace(transport) {
            old.close();
        }
        self.parser.clear();
        self.stop_sequence = None;
        self.is_stopping = false;
        self.firmware_handoff = None;
        self.is_uploading_firmware = false;
        self.send_instruction("flush");
    }

    /// Raw bytes from the transport
    pub fn on_data(&mut self, bytes: &[u8]) {
        let span = self.span.clone();
        let _enter = span.enter();

        let config = self.config.clone().unwrap_or_default();
        for line in self.parser.feed(bytes) {
            debug!(line = %line, "recv");
            if let Some(response) = self.parser.parse(&line, &config) {
                self.handle_response(response);
            }
        }
    }

    /// Transport reported an error; connection state is left alone
    pub fn on_port_error(&mut self, error: impl Into<String>) {
        let span = self.span.clone();
        let _enter = span.enter();

        let error = error.into();
        warn!(error = %error, "Port error");
        self.emit(MachineEvent::PortError(error));
    }

    /// Transport closed
    pub fn on_port_closed(&mut self) {
        let span = self.span.clone();
        let _enter = span.enter();
        info!("Port closed");

        self.heartbeat_due = None;
        self.is_connected = false;
        self.transport = None;
        self.stop_sequence = None;
        self.is_stopping = false;
        self.firmware_handoff = None;
        self.report_run_time();
        self.emit(MachineEvent::PortLost(PortLostReport::disconnected(
            self.buffer.last_completed().map(str::to_string),
            self.buffer.in_flight(),
        )));
        self.reset();
    }

    /// Close the transport and drop all state
    pub fn disconnect(&mut self) {
        let span = self.span.clone();
        let _enter = span.enter();
        info!("Disconnecting");

        self.heartbeat_due = None;
        self.stop_sequence = None;
        self.is_stopping = false;
        if self.firmware_handoff.take().is_some() {
            info!("Firmware upload cancelled before handoff");
            self.is_uploading_firmware = false;
        }
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.is_connected = false;
        self.reset();
    }

    /// Replace the machine configuration, forcing a disconnect
    pub fn set_config(&mut self, config: MachineConfig) {
        self.disconnect();
        let span = self.span.clone();
        let _enter = span.enter();
        info!(name = %config.name, "Setting config");
        self.config = Some(Arc::new(config));
    }

    // ---- commands ------------------------------------------------------

    /// Replace the job queue and start streaming it
    pub fn stream_job<I, S>(&mut self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let span = self.span.clone();
        let _enter = span.enter();

        if self.is_uploading_firmware {
            warn!("Rejected job during firmware upload");
            return;
        }
        let lines: Vec<String> = lines.into_iter().map(Into::into).collect();
        if lines.is_empty() {
            warn!("Ignoring empty job");
            return;
        }

        info!(lines = lines.len(), "Streaming job");
        self.buffer.replace_job(lines);
        self.is_running = true;
        self.run_state = RunState::Running;
        self.run_started = Some(Utc::now());
        self.report_job_status();
        self.fill_buffer();
    }

    /// Queue a console line ahead of job lines
    pub fn enqueue_instant(&mut self, line: impl Into<String>) {
        let span = self.span.clone();
        let _enter = span.enter();
        self.enqueue_command(line.into());
    }

    /// Send each named instruction through the instruction map
    pub fn execute<I, S>(&mut self, instructions: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let span = self.span.clone();
        let _enter = span.enter();
        for instruction in instructions {
            self.send_instruction(instruction.as_ref());
        }
    }

    /// Feed hold
    pub fn pause(&mut self) {
        let span = self.span.clone();
        let _enter = span.enter();
        self.send_instruction("pause");
        self.operator_action(OperatorAction::Pause);
    }

    /// Cycle start
    pub fn resume(&mut self) {
        let span = self.span.clone();
        let _enter = span.enter();
        self.send_instruction("resume");
        self.operator_action(OperatorAction::Resume);
    }

    /// Abort the active job
    ///
    /// Queues are cleared and `pause` is sent at once; `flush`, `resume` and
    /// the park instructions follow at settle-delay intervals.
    pub fn stop(&mut self) {
        let span = self.span.clone();
        let _enter = span.enter();

        if !self.is_running {
            debug!("Stop requested without an active job");
            return;
        }

        info!("Stopping job");
        self.is_stopping = true;
        self.emit(MachineEvent::Stopping);
        self.report_run_time();
        self.reset();
        self.send_instruction("pause");
        self.stop_sequence = Some(StopSequence {
            phase: StopPhase::Flush,
            due: Instant::now() + self.timing.stop_settle_delay,
        });
    }

    /// Announce the machine may be taken over when no job is running
    pub fn acquire(&mut self, timestamp: i64) {
        if !self.is_running {
            self.emit(MachineEvent::Release(timestamp));
        }
    }

    /// Ask the device for its `$n` settings
    pub fn request_settings(&mut self) {
        let span = self.span.clone();
        let _enter = span.enter();
        self.send_instruction("settings");
    }

    /// Ask the device for its build info
    pub fn report_build_info(&mut self) {
        let span = self.span.clone();
        let _enter = span.enter();
        self.send_instruction("readSerialNumber");
    }

    /// Publish the current job status
    pub fn report_job_status(&mut self) {
        if self.is_running {
            self.emit(MachineEvent::RunState(self.run_state));
            if self.run_state.is_paused() {
                self.emit(MachineEvent::Paused(self.percent_complete()));
            } else {
                self.emit(MachineEvent::Progress {
                    percent: self.percent_complete(),
                    overrides: self.current_overrides(),
                });
            }
        } else if self.is_stopping {
            self.emit(MachineEvent::Stopping);
        } else if self.is_uploading_firmware {
            self.emit(MachineEvent::UploadingFirmware);
        } else if self.is_connected {
            self.emit(MachineEvent::Ready);
        }
    }

    // ---- firmware handoff ----------------------------------------------

    /// Put the device into its bootloader and release the port
    ///
    /// Sends `$K` when configured, then writes a keepalive every
    /// `reset_keep_alive_interval_ms` until `reset_delay_ms` has elapsed,
    /// closes the transport and runs `continuation`.
    pub fn begin_firmware_upload(
        &mut self,
        continuation: UploadContinuation,
        upload: &FirmwareUploadConfig,
    ) -> Result<(), ControllerError> {
        let span = self.span.clone();
        let _enter = span.enter();

        if !self.is_connected {
            return Err(ControllerError::NotConnected);
        }
        if self.is_running {
            return Err(ControllerError::JobActive);
        }
        if self.is_uploading_firmware {
            return Err(ControllerError::FirmwareUploadInProgress);
        }

        info!(
            delay_ms = upload.reset_delay_ms,
            interval_ms = upload.reset_keep_alive_interval_ms,
            "Beginning firmware upload"
        );
        self.heartbeat_due = None;
        self.reset();
        if upload.pre_reset {
            self.send_line("$K");
        }
        self.is_uploading_firmware = true;

        let interval = Duration::from_millis(upload.reset_keep_alive_interval_ms.max(1));
        self.firmware_handoff = Some(FirmwareHandoff {
            remaining_ms: i64::try_from(upload.reset_delay_ms).unwrap_or(i64::MAX),
            interval,
            due: Instant::now() + interval,
            continuation: Some(continuation),
        });
        if upload.reset_delay_ms == 0 {
            self.finish_firmware_handoff();
        }
        Ok(())
    }

    /// Flashing finished; the device reboots into its application
    pub fn end_firmware_upload(&mut self) {
        let span = self.span.clone();
        let _enter = span.enter();
        info!("Firmware upload finished");

        self.is_connected = false;
        self.emit(MachineEvent::PortLost(PortLostReport::note(
            "Firmware upload complete?",
        )));
        self.reset();
    }

    fn finish_firmware_handoff(&mut self) {
        let Some(mut handoff) = self.firmware_handoff.take() else {
            return;
        };
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        if let Some(continuation) = handoff.continuation.take() {
            continuation();
        }
    }

    // ---- timers --------------------------------------------------------

    /// Earliest instant at which [`poll_timers`](Self::poll_timers) has work
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.heartbeat_due,
            self.stop_sequence.as_ref().map(|s| s.due),
            self.firmware_handoff.as_ref().map(|h| h.due),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Run every timer due at `now`
    pub fn poll_timers(&mut self, now: Instant) {
        let span = self.span.clone();
        let _enter = span.enter();

        if self.heartbeat_due.is_some_and(|due| due <= now) {
            if self.is_connected && self.transport.is_some() {
                self.send_instruction("status");
                self.heartbeat_due = Some(now + self.timing.heartbeat_interval);
            } else {
                self.heartbeat_due = None;
            }
        }

        if self.stop_sequence.as_ref().is_some_and(|s| s.due <= now) {
            self.advance_stop_sequence(now);
        }

        if self.firmware_handoff.as_ref().is_some_and(|h| h.due <= now) {
            self.tick_firmware_handoff(now);
        }
    }

    fn advance_stop_sequence(&mut self, now: Instant) {
        let Some(sequence) = self.stop_sequence.take() else {
            return;
        };
        if self.transport.is_none() || !self.is_stopping {
            debug!("Stop sequence abandoned");
            self.is_stopping = false;
            return;
        }

        let next_due = now + self.timing.stop_settle_delay;
        match sequence.phase {
            StopPhase::Flush => {
                self.send_instruction("flush");
                self.stop_sequence = Some(StopSequence {
                    phase: StopPhase::Resume,
                    due: next_due,
                });
            }
            StopPhase::Resume => {
                self.send_instruction("resume");
                self.stop_sequence = Some(StopSequence {
                    phase: StopPhase::Park,
                    due: next_due,
                });
            }
            StopPhase::Park => {
                self.send_instruction("liftToSafeHeight");
                self.send_instruction("spindleOff");
                self.send_instruction("park");
                self.is_stopping = false;
                info!("Stop sequence complete");
                self.report_job_status();
            }
        }
    }

    fn tick_firmware_handoff(&mut self, now: Instant) {
        if self.transport.is_none() {
            debug!("Firmware keepalive abandoned");
            self.firmware_handoff = None;
            return;
        }

        self.write_raw(b"\r\n");
        let Some(handoff) = self.firmware_handoff.as_mut() else {
            return;
        };
        handoff.remaining_ms -= i64::try_from(handoff.interval.as_millis()).unwrap_or(i64::MAX);
        if handoff.remaining_ms <= 0 {
            self.finish_firmware_handoff();
        } else {
            handoff.due = now + handoff.interval;
        }
    }

    // ---- queries -------------------------------------------------------

    /// Device identification while connected
    pub fn machine_identification(&self) -> Option<String> {
        if self.is_connected {
            self.identification.clone()
        } else {
            None
        }
    }

    /// Feed rate override snapshot
    pub fn current_overrides(&self) -> Overrides {
        Overrides {
            feed_rate: self.feed_rate.snapshot(),
        }
    }

    /// Subscribe to controller events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<MachineEvent> {
        self.events.subscribe()
    }

    /// Active machine configuration
    pub fn config(&self) -> Option<&Arc<MachineConfig>> {
        self.config.as_ref()
    }

    /// Name of the open port
    pub fn port_name(&self) -> Option<&str> {
        self.transport.as_ref().map(|t| t.name())
    }

    /// Run state of the active job
    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    /// Whether a job is active
    pub fn is_running(&self) -> bool {
        self.is_running
    }

    /// Whether the stop sequence is in progress
    pub fn is_stopping(&self) -> bool {
        self.is_stopping
    }

    /// Whether a firmware upload is in progress
    pub fn is_uploading_firmware(&self) -> bool {
        self.is_uploading_firmware
    }

    /// Whether the device has announced itself
    pub fn is_connected(&self) -> bool {
        self.is_connected
    }

    /// Completed/unprocessed command counts
    pub fn progress(&self) -> JobProgress {
        self.buffer.progress()
    }

    /// Lines in the device buffer awaiting acknowledgment
    pub fn in_flight(&self) -> Vec<String> {
        self.buffer.in_flight()
    }

    /// Last published position
    pub fn position(&self) -> Option<Position> {
        self.position
    }

    // ---- internals -----------------------------------------------------

    fn emit(&self, event: MachineEvent) {
        self.events.publish(event);
    }

    fn percent_complete(&self) -> Option<f64> {
        self.buffer.progress().percent_complete()
    }

    fn reset(&mut self) {
        debug!("Resetting");
        self.is_running = false;
        self.run_state = RunState::Running;
        self.buffer.reset();
        self.feed_rate.reset();
    }

    fn handle_response(&mut self, response: GrblResponse) {
        match response {
            GrblResponse::Ready(identification) => self.on_machine_connected(identification),
            GrblResponse::Ack => self.on_ack(),
            GrblResponse::Status(report) => self.on_status(report),
            GrblResponse::Settings(line) => self.emit(MachineEvent::Settings(line)),
            GrblResponse::ProbeResult(flag) => self.emit(MachineEvent::ProbeResult(flag)),
            GrblResponse::BuildInfo(line) => self.emit(MachineEvent::MachineBuildInfo(line)),
            GrblResponse::Error(line) => self.emit(MachineEvent::GrblError(line)),
            GrblResponse::Alarm(line) => self.emit(MachineEvent::GrblAlarm(line)),
            GrblResponse::OverCurrent(line) => self.emit(MachineEvent::GrblOverCurrent(line)),
            GrblResponse::Unknown(line) => self.emit(MachineEvent::Unknown(line)),
        }
    }

    fn on_machine_connected(&mut self, identification: String) {
        info!(identification = %identification, "Machine connected");
        self.identification = Some(identification.clone());
        self.is_connected = true;
        self.heartbeat_due = Some(Instant::now() + self.timing.heartbeat_interval);
        self.emit(MachineEvent::Connected(identification));
    }

    fn on_ack(&mut self) {
        if self.buffer.acknowledge().is_none() {
            debug!("Acknowledgment with nothing in flight");
            return;
        }
        self.fill_buffer();

        if self.is_running && self.run_state == RunState::Running {
            self.report_job_status();
            if self.buffer.unprocessed() == 0 {
                info!(completed = self.buffer.completed(), "Job complete");
                self.is_running = false;
                self.report_run_time();
            }
        }
    }

    fn on_status(&mut self, report: StatusReport) {
        if self.is_running {
            if let Some(signal) = DeviceSignal::from_device_state(&report.state) {
                if let Some(next) = device_transition(self.run_state, signal) {
                    self.transition_run_state(next);
                }
            }
        }
        self.emit(MachineEvent::GrblState {
            state: report.state,
            substate: report.substate,
        });

        if !report.position.is_empty() {
            self.on_position(report.position);
        }
        if let Some(probe) = report.probe {
            self.emit(MachineEvent::ProbeStatus(probe));
        }
        if let Some(current) = report.spindle_current {
            self.emit(MachineEvent::SpindleCurrent(current));
        }
    }

    fn on_position(&mut self, reported: ReportedPosition) {
        if reported.offset.is_some() {
            self.work_offset = reported.offset;
        }
        match reported.resolve(self.work_offset, self.position) {
            Some(position) => {
                self.position = Some(position);
                self.emit(MachineEvent::Position(position));
            }
            None => debug!("Position report without enough frames to resolve"),
        }
    }

    fn operator_action(&mut self, action: OperatorAction) {
        if !self.is_running {
            debug!(?action, "Ignoring operator action without an active job");
            return;
        }
        if let Some(next) = operator_transition(self.run_state, action) {
            self.transition_run_state(next);
        }
    }

    fn transition_run_state(&mut self, next: RunState) {
        debug!(from = %self.run_state, to = %next, "Run state transition");
        if self.is_running && self.run_state == RunState::Running {
            self.report_run_time();
        } else if self.is_running && next == RunState::Running {
            self.run_started = Some(Utc::now());
        }
        self.run_state = next;

        match next {
            RunState::Pausing | RunState::Paused | RunState::PausedDoorOpen => {
                self.emit(MachineEvent::Paused(self.percent_complete()));
            }
            RunState::Resuming | RunState::Running => {
                self.fill_buffer();
                self.emit(MachineEvent::Resumed(self.percent_complete()));
            }
        }
    }

    fn report_run_time(&mut self) {
        if let Some(start) = self.run_started.take() {
            self.emit(MachineEvent::RunTime(RunTime {
                start,
                end: Utc::now(),
            }));
        }
    }

    fn send_instruction(&mut self, instruction: &str) {
        if self.is_uploading_firmware {
            warn!(instruction, "Tried to send instruction during firmware upload");
            return;
        }

        match instruction {
            "flush" => {
                self.buffer.clear_queues();
                self.feed_rate.reset();
            }
            "resetFeedRate" => {
                self.feed_rate.reset();
                self.emit(MachineEvent::OverridesChanged);
            }
            "increaseFeedRate" => {
                self.feed_rate.increase();
                self.emit(MachineEvent::OverridesChanged);
            }
            "decreaseFeedRate" => {
                self.feed_rate.decrease();
                self.emit(MachineEvent::OverridesChanged);
            }
            _ => {}
        }

        let Some(config) = self.config.clone() else {
            warn!(instruction, "Cannot send an instruction before a config is received");
            return;
        };
        match config.gcode_for(instruction) {
            Some(command) if config.is_real_time(instruction) => {
                debug!(instruction, "send real-time");
                self.write_raw(command.as_bytes());
            }
            Some(command) => self.enqueue_command(command),
            None => warn!(instruction, "No command currently defined for instruction"),
        }
    }

    fn enqueue_command(&mut self, line: String) {
        if self.is_uploading_firmware {
            warn!(line = %line, "Tried to queue a line during firmware upload");
            return;
        }
        self.buffer.push_console(line);
        self.fill_buffer();
    }

    fn fill_buffer(&mut self) {
        let job_may_advance = self.is_running && self.run_state == RunState::Running;
        for line in self.buffer.fill(job_may_advance) {
            self.send_line(&line);
        }
    }

    fn send_line(&mut self, line: &str) {
        if self.is_uploading_firmware {
            warn!(line, "Tried to send line during firmware upload");
            return;
        }
        self.track_line(line);
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.write_raw(&data);
    }

    fn track_line(&mut self, line: &str) {
        let intent = interpret(line);
        match intent {
            LineIntent::Inches => self.gcode_unit = FeedRateUnits::InPerMin,
            LineIntent::Millimeters => self.gcode_unit = FeedRateUnits::MmPerMin,
            LineIntent::Feed { .. } => {
                if let Some(rate) = intent.planar_feed_rate() {
                    if self.feed_rate.set_base_rate(rate, self.gcode_unit) {
                        self.emit(MachineEvent::OverridesChanged);
                    }
                }
            }
            LineIntent::Seek | LineIntent::Other => {}
        }
    }

    fn write_raw(&mut self, data: &[u8]) {
        let Some(transport) = self.transport.as_mut() else {
            debug!(bytes = data.len(), "No open port, dropping write");
            return;
        };
        debug!(data = %String::from_utf8_lossy(data).escape_debug(), "send");
        if let Err(e) = transport.write(data) {
            tracing::error!(error = %e, "Write failed");
            self.events.publish(MachineEvent::PortError(e.to_string()));
        }
    }
}
