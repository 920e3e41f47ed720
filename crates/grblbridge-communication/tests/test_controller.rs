use grblbridge_communication::{ControllerTiming, MachineController, Transport};
use grblbridge_core::{
    ConnectionError, ControllerError, Coordinates, EventDispatcher, FeedRateUnits, MachineEvent,
    PortLostReport, Position, RunState,
};
use grblbridge_settings::{FirmwareUploadConfig, MachineConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::Receiver;

#[derive(Clone, Default)]
struct MockTransport {
    writes: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

impl MockTransport {
    fn take_writes(&self) -> Vec<String> {
        std::mem::take(&mut *self.writes.lock().unwrap())
    }
}

impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.writes
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(data).to_string());
        Ok(())
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn machine_config() -> MachineConfig {
    let mut config = MachineConfig {
        name: "test".to_string(),
        ..Default::default()
    };
    for (name, command) in [
        ("flush", "\\u0x18"),
        ("pause", "!"),
        ("resume", "~"),
        ("status", "?"),
        ("settings", "$$"),
        ("readSerialNumber", "$I"),
        ("liftToSafeHeight", "G0 Z5"),
        ("spindleOff", "M5"),
        ("park", "G0 X0 Y0"),
    ] {
        config.gcode.insert(name.to_string(), command.to_string());
    }
    for name in ["flush", "pause", "resume", "status"] {
        config.real_time_commands.insert(name.to_string());
    }
    config
}

fn upload_config(pre_reset: bool, delay: u64, interval: u64) -> FirmwareUploadConfig {
    FirmwareUploadConfig {
        avr_device: "atmega328p".into(),
        programmer: "arduino".into(),
        baud_rate: 115200,
        pre_reset,
        reset_delay_ms: delay,
        reset_keep_alive_interval_ms: interval,
    }
}

struct Harness {
    controller: MachineController<MockTransport>,
    transport: MockTransport,
    events: Receiver<MachineEvent>,
}

impl Harness {
    fn connected() -> Self {
        Self::connected_with(ControllerTiming {
            heartbeat_interval: Duration::from_secs(3600),
            ..Default::default()
        })
    }

    fn connected_with(timing: ControllerTiming) -> Self {
        let dispatcher = EventDispatcher::default();
        let events = dispatcher.subscribe();
        let mut controller =
            MachineController::with_timing(dispatcher, tracing::info_span!("machine"), timing);
        controller.set_config(machine_config());

        let transport = MockTransport::default();
        controller.on_port_opened(transport.clone());
        controller.on_data(b"Grbl 1.1f ['$' for help]\r\n");
        transport.take_writes();

        let mut harness = Self {
            controller,
            transport,
            events,
        };
        harness.drain();
        harness
    }

    fn drain(&mut self) -> Vec<MachineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    fn writes(&self) -> Vec<String> {
        self.transport.take_writes()
    }

    fn fire_next_timer(&mut self) {
        let deadline = self.controller.next_deadline().expect("a pending timer");
        self.controller.poll_timers(deadline);
    }
}

fn twenty_byte_lines(count: usize) -> Vec<String> {
    (0..count).map(|n| format!("G1 X{n:<16}")).collect()
}

#[test]
fn test_port_open_and_ready() {
    let dispatcher = EventDispatcher::default();
    let mut events = dispatcher.subscribe();
    let mut controller = MachineController::new(dispatcher, tracing::info_span!("machine"));
    controller.set_config(machine_config());

    let transport = MockTransport::default();
    controller.on_port_opened(transport.clone());
    assert_eq!(transport.take_writes(), vec!["\u{18}"]);
    assert!(!controller.is_connected());
    assert_eq!(controller.machine_identification(), None);

    controller.on_data(b"Grbl 1.1f ['$' for help]\r\n");
    assert!(controller.is_connected());
    assert_eq!(
        controller.machine_identification().as_deref(),
        Some("Grbl 1.1f ['$' for help]")
    );
    assert_eq!(
        events.try_recv().unwrap(),
        MachineEvent::Connected("Grbl 1.1f ['$' for help]".to_string())
    );
    assert!(controller.next_deadline().is_some());
}

#[test]
fn test_heartbeat_polls_status() {
    let mut h = Harness::connected_with(ControllerTiming::default());
    h.fire_next_timer();
    assert_eq!(h.writes(), vec!["?"]);
    h.fire_next_timer();
    assert_eq!(h.writes(), vec!["?"]);

    h.controller.disconnect();
    assert!(h.transport.closed.load(Ordering::SeqCst));
    assert_eq!(h.controller.next_deadline(), None);
}

#[test]
fn test_stream_job_respects_byte_budget() {
    let mut h = Harness::connected();
    let lines = twenty_byte_lines(10);
    h.controller.stream_job(lines.clone());

    let expected: Vec<String> = lines[..6].iter().map(|l| format!("{l}\n")).collect();
    assert_eq!(h.writes(), expected);

    h.controller.on_data(b"ok\r\n");
    assert_eq!(h.writes(), vec![format!("{}\n", lines[6])]);
    assert_eq!(h.controller.progress().completed, 1);
}

#[test]
fn test_pause_then_hold_freezes_job_but_not_console() {
    let mut h = Harness::connected();
    let lines = twenty_byte_lines(10);
    h.controller.stream_job(lines);
    h.writes();
    h.drain();

    h.controller.pause();
    assert_eq!(h.controller.run_state(), RunState::Pausing);
    assert_eq!(h.writes(), vec!["!"]);
    assert!(h
        .drain()
        .iter()
        .any(|e| matches!(e, MachineEvent::Paused(_))));

    h.controller
        .on_data(b"<Hold:0|MPos:0.000,0.000,0.000|WCO:0.000,0.000,0.000>\r\n");
    assert_eq!(h.controller.run_state(), RunState::Paused);

    h.controller.on_data(b"ok\r\n");
    assert!(h.writes().is_empty());

    h.controller.enqueue_instant("G0 Z5");
    assert_eq!(h.writes(), vec!["G0 Z5\n"]);

    h.controller.resume();
    assert_eq!(h.controller.run_state(), RunState::Resuming);
    assert_eq!(h.writes(), vec!["~"]);

    h.controller
        .on_data(b"<Run|MPos:0.000,0.000,0.000|WCO:0.000,0.000,0.000>\r\n");
    assert_eq!(h.controller.run_state(), RunState::Running);
    h.controller.on_data(b"ok\r\n");
    assert_eq!(h.writes().len(), 1);
}

#[test]
fn test_door_open_ignores_operator_resume() {
    let mut h = Harness::connected();
    h.controller.stream_job(twenty_byte_lines(3));
    h.controller.on_data(b"<Door:1|MPos:0.000,0.000,0.000|WCO:0.000,0.000,0.000>\r\n");
    assert_eq!(h.controller.run_state(), RunState::PausedDoorOpen);

    h.controller.resume();
    assert_eq!(h.controller.run_state(), RunState::PausedDoorOpen);

    h.controller.on_data(b"<Hold:0|MPos:0.000,0.000,0.000|WCO:0.000,0.000,0.000>\r\n");
    assert_eq!(h.controller.run_state(), RunState::Paused);
}

#[test]
fn test_device_state_ignored_without_job() {
    let mut h = Harness::connected();
    h.controller.on_data(b"<Hold:0|MPos:0.000,0.000,0.000|WCO:0.000,0.000,0.000>\r\n");
    assert_eq!(h.controller.run_state(), RunState::Running);
    assert!(h.drain().iter().any(|e| *e
        == MachineEvent::GrblState {
            state: "hold".into(),
            substate: Some("0".into())
        }));
}

#[test]
fn test_stop_sequence_order() {
    let mut h = Harness::connected();
    h.controller.stream_job(twenty_byte_lines(10));
    h.writes();
    h.drain();

    h.controller.stop();
    assert!(h.controller.is_stopping());
    assert!(!h.controller.is_running());
    assert_eq!(h.controller.progress().unprocessed, 0);
    assert!(h.controller.in_flight().is_empty());
    assert_eq!(h.writes(), vec!["!"]);

    let events = h.drain();
    assert_eq!(events[0], MachineEvent::Stopping);
    assert!(matches!(events[1], MachineEvent::RunTime(_)));

    h.fire_next_timer();
    assert_eq!(h.writes(), vec!["\u{18}"]);
    h.fire_next_timer();
    assert_eq!(h.writes(), vec!["~"]);
    h.fire_next_timer();
    assert_eq!(h.writes(), vec!["G0 Z5\n", "M5\n", "G0 X0 Y0\n"]);

    assert!(!h.controller.is_stopping());
    assert_eq!(h.drain(), vec![MachineEvent::Ready]);
}

#[test]
fn test_stop_without_job_is_ignored() {
    let mut h = Harness::connected();
    h.controller.stop();
    assert!(!h.controller.is_stopping());
    assert!(h.writes().is_empty());
    assert!(h.drain().is_empty());
}

#[test]
fn test_disconnect_mid_stop_abandons_sequence() {
    let mut h = Harness::connected();
    h.controller.stream_job(twenty_byte_lines(4));
    h.controller.stop();
    h.writes();

    h.controller.on_port_closed();
    assert!(!h.controller.is_stopping());
    assert_eq!(h.controller.next_deadline(), None);
    assert!(h.writes().is_empty());
}

#[test]
fn test_port_lost_reports_in_flight_commands() {
    let mut h = Harness::connected();
    h.controller.stream_job(vec!["G1 X1", "G1 X2", "G1 X3"]);
    h.controller.on_data(b"ok\n");
    h.drain();

    h.controller.on_port_closed();
    assert!(!h.controller.is_connected());
    assert!(!h.controller.is_running());
    assert_eq!(h.controller.progress().unprocessed, 0);

    let events = h.drain();
    assert!(matches!(events[0], MachineEvent::RunTime(_)));
    assert_eq!(
        events[1],
        MachineEvent::PortLost(PortLostReport::disconnected(
            Some("G1 X1".to_string()),
            vec!["G1 X2".to_string(), "G1 X3".to_string()],
        ))
    );
}

#[test]
fn test_port_error_keeps_connection() {
    let mut h = Harness::connected();
    h.controller.on_port_error("framing error");
    assert!(h.controller.is_connected());
    assert_eq!(
        h.drain(),
        vec![MachineEvent::PortError("framing error".to_string())]
    );
}

#[test]
fn test_missing_mapping_is_dropped() {
    let mut h = Harness::connected();
    h.controller.execute(["homeAll"]);
    assert!(h.writes().is_empty());
    assert_eq!(h.controller.progress().unprocessed, 0);

    h.controller.execute(["settings"]);
    assert_eq!(h.writes(), vec!["$$\n"]);
    h.controller.report_build_info();
    assert_eq!(h.writes(), vec!["$I\n"]);
}

#[test]
fn test_instructions_need_config() {
    let dispatcher = EventDispatcher::default();
    let mut controller: MachineController<MockTransport> =
        MachineController::new(dispatcher, tracing::info_span!("machine"));
    let transport = MockTransport::default();
    controller.on_port_opened(transport.clone());
    controller.execute(["status"]);
    assert!(transport.take_writes().is_empty());
}

#[test]
fn test_position_reconciliation() {
    let mut h = Harness::connected();
    h.controller
        .on_data(b"<Idle|MPos:1.000,2.000,3.000|FS:0,0|WCO:1.000,1.000,1.000>\r\n");
    let expected = Position::new(Coordinates::new(1.0, 2.0, 3.0), Coordinates::new(0.0, 1.0, 2.0));
    let events = h.drain();
    assert!(events.contains(&MachineEvent::Position(expected)));
    assert!(events.contains(&MachineEvent::ProbeStatus(0)));

    h.controller.on_data(b"<Idle|MPos:2.000,2.000,3.000|FS:0,0>\r\n");
    assert_eq!(
        h.controller.position().map(|p| p.work),
        Some(Coordinates::new(1.0, 1.0, 2.0))
    );

    h.controller.on_data(b"<Idle|WCO:0.000,0.000,0.000>\r\n");
    assert_eq!(
        h.controller.position().map(|p| p.work),
        Some(Coordinates::new(2.0, 2.0, 3.0))
    );
}

#[test]
fn test_device_reports_become_events() {
    let mut h = Harness::connected();
    h.controller
        .on_data(b"$110=500.000\r\nerror:22\r\nALARM:1\r\n[PRB:0.000,0.000,-1.000:1]\r\n");
    assert_eq!(
        h.drain(),
        vec![
            MachineEvent::Settings("$110=500.000".into()),
            MachineEvent::GrblError("error:22".into()),
            MachineEvent::GrblAlarm("ALARM:1".into()),
            MachineEvent::ProbeResult(1),
        ]
    );
}

#[test]
fn test_job_completion_reports_run_time() {
    let mut h = Harness::connected();
    h.controller.stream_job(vec!["G21", "G1 X10 F500"]);
    assert_eq!(h.writes(), vec!["G21\n", "G1 X10 F500\n"]);

    let events = h.drain();
    assert_eq!(events[0], MachineEvent::RunState(RunState::Running));
    assert!(events.contains(&MachineEvent::OverridesChanged));

    let overrides = h.controller.current_overrides();
    assert_eq!(overrides.feed_rate.value, Some(500.0));
    assert_eq!(overrides.feed_rate.unit, Some(FeedRateUnits::MmPerMin));

    h.controller.on_data(b"ok\nok\n");
    assert!(!h.controller.is_running());
    let events = h.drain();
    assert!(events.iter().any(|e| matches!(
        e,
        MachineEvent::Progress {
            percent: Some(p),
            ..
        } if (*p - 100.0).abs() < f64::EPSILON
    )));
    assert!(matches!(events.last(), Some(MachineEvent::RunTime(_))));
}

#[test]
fn test_feed_rate_overrides() {
    let mut h = Harness::connected();
    h.controller.execute(["increaseFeedRate", "increaseFeedRate"]);
    assert_eq!(h.controller.current_overrides().feed_rate.percentage, 120);
    assert_eq!(
        h.drain(),
        vec![MachineEvent::OverridesChanged, MachineEvent::OverridesChanged]
    );

    h.controller.execute(["resetFeedRate"]);
    assert_eq!(h.controller.current_overrides().feed_rate.percentage, 100);
    for _ in 0..30 {
        h.controller.execute(["decreaseFeedRate"]);
    }
    assert_eq!(h.controller.current_overrides().feed_rate.percentage, 10);
}

#[test]
fn test_inch_mode_feed_unit() {
    let mut h = Harness::connected();
    h.controller.enqueue_instant("G20");
    h.controller.enqueue_instant("G1 X1 F20");
    let overrides = h.controller.current_overrides();
    assert_eq!(overrides.feed_rate.unit, Some(FeedRateUnits::InPerMin));
    assert_eq!(overrides.feed_rate.value, Some(20.0));
}

#[test]
fn test_acquire_releases_only_when_idle() {
    let mut h = Harness::connected();
    h.controller.acquire(42);
    assert_eq!(h.drain(), vec![MachineEvent::Release(42)]);

    h.controller.stream_job(vec!["G1 X1"]);
    h.drain();
    h.controller.acquire(43);
    assert!(h.drain().is_empty());
}

#[test]
fn test_report_job_status_when_idle() {
    let mut h = Harness::connected();
    h.controller.report_job_status();
    assert_eq!(h.drain(), vec![MachineEvent::Ready]);
}

#[test]
fn test_set_config_forces_disconnect() {
    let mut h = Harness::connected();
    h.controller.stream_job(vec!["G1 X1"]);
    h.controller.set_config(machine_config());
    assert!(h.transport.closed.load(Ordering::SeqCst));
    assert!(!h.controller.is_connected());
    assert!(!h.controller.is_running());
}

#[test]
fn test_firmware_upload_preconditions() {
    let mut h = Harness::connected();
    h.controller.stream_job(vec!["G1 X1"]);
    let err = h
        .controller
        .begin_firmware_upload(Box::new(|| {}), &upload_config(false, 0, 100))
        .unwrap_err();
    assert_eq!(err, ControllerError::JobActive);

    h.controller.disconnect();
    let err = h
        .controller
        .begin_firmware_upload(Box::new(|| {}), &upload_config(false, 0, 100))
        .unwrap_err();
    assert_eq!(err, ControllerError::NotConnected);
}

#[test]
fn test_firmware_keepalive_then_handoff() {
    let mut h = Harness::connected();
    let handed_off = Arc::new(AtomicBool::new(false));
    let flag = handed_off.clone();

    h.controller
        .begin_firmware_upload(
            Box::new(move || flag.store(true, Ordering::SeqCst)),
            &upload_config(true, 1000, 300),
        )
        .unwrap();
    assert!(h.controller.is_uploading_firmware());
    assert_eq!(h.writes(), vec!["$K\n"]);

    let err = h
        .controller
        .begin_firmware_upload(Box::new(|| {}), &upload_config(true, 1000, 300))
        .unwrap_err();
    assert_eq!(err, ControllerError::FirmwareUploadInProgress);

    h.controller.enqueue_instant("G0 X1");
    h.controller.stream_job(vec!["G1 X1"]);
    h.controller.execute(["status"]);
    assert!(h.writes().is_empty());

    for _ in 0..3 {
        h.fire_next_timer();
        assert!(!handed_off.load(Ordering::SeqCst));
    }
    h.fire_next_timer();
    assert_eq!(h.writes(), vec!["\r\n"; 4]);
    assert!(handed_off.load(Ordering::SeqCst));
    assert!(h.transport.closed.load(Ordering::SeqCst));
    assert_eq!(h.controller.next_deadline(), None);

    h.drain();
    h.controller.report_job_status();
    assert_eq!(h.drain(), vec![MachineEvent::UploadingFirmware]);

    h.controller.end_firmware_upload();
    assert!(!h.controller.is_connected());
    assert_eq!(
        h.drain(),
        vec![MachineEvent::PortLost(PortLostReport::note(
            "Firmware upload complete?"
        ))]
    );
}

#[test]
fn test_firmware_upload_without_delay_hands_off_immediately() {
    let mut h = Harness::connected();
    let handed_off = Arc::new(AtomicBool::new(false));
    let flag = handed_off.clone();
    h.controller
        .begin_firmware_upload(
            Box::new(move || flag.store(true, Ordering::SeqCst)),
            &upload_config(false, 0, 100),
        )
        .unwrap();
    assert!(handed_off.load(Ordering::SeqCst));
    assert!(h.writes().is_empty());
}

#[test]
fn test_disconnect_cancels_firmware_keepalive() {
    let mut h = Harness::connected();
    let handed_off = Arc::new(AtomicBool::new(false));
    let flag = handed_off.clone();
    h.controller
        .begin_firmware_upload(
            Box::new(move || flag.store(true, Ordering::SeqCst)),
            &upload_config(false, 1000, 300),
        )
        .unwrap();

    h.controller.disconnect();
    assert_eq!(h.controller.next_deadline(), None);
    assert!(!h.controller.is_uploading_firmware());

    let fresh = MockTransport::default();
    h.controller.on_port_opened(fresh.clone());
    fresh.take_writes();
    assert!(!h.controller.is_uploading_firmware());
    assert_eq!(h.controller.next_deadline(), None);
    assert!(fresh.take_writes().is_empty());
    assert!(!fresh.closed.load(Ordering::SeqCst));
    assert!(!handed_off.load(Ordering::SeqCst));
}
