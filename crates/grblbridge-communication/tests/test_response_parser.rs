use grblbridge_communication::firmware::grbl::{GrblResponse, GrblResponseParser};
use grblbridge_core::Coordinates;
use grblbridge_settings::MachineConfig;

fn parse(line: &str) -> Option<GrblResponse> {
    GrblResponseParser::new().parse(line, &MachineConfig::default())
}

#[test]
fn test_legacy_status_report() {
    let Some(GrblResponse::Status(report)) =
        parse("<Run,MPos:1.000,2.000,3.000,WPos:0.500,1.500,2.500>")
    else {
        panic!("expected status report");
    };
    assert_eq!(report.state, "run");
    assert_eq!(report.position.machine, Some(Coordinates::new(1.0, 2.0, 3.0)));
    assert_eq!(report.position.work, Some(Coordinates::new(0.5, 1.5, 2.5)));
    assert_eq!(report.probe, None);
}

#[test]
fn test_modern_status_report() {
    let Some(GrblResponse::Status(report)) =
        parse("<Hold:0|MPos:0.000,0.000,0.000|WCO:1.000,1.000,1.000>")
    else {
        panic!("expected status report");
    };
    assert_eq!(report.state, "hold");
    assert_eq!(report.substate.as_deref(), Some("0"));
    assert_eq!(report.position.offset, Some(Coordinates::new(1.0, 1.0, 1.0)));

    let position = report.position.resolve(report.position.offset, None).unwrap();
    assert_eq!(position.work, Coordinates::new(-1.0, -1.0, -1.0));
}

#[test]
fn test_ready_before_ack() {
    assert_eq!(
        parse("Grbl 1.1f ['$' for help]"),
        Some(GrblResponse::Ready("Grbl 1.1f ['$' for help]".to_string()))
    );
    assert_eq!(parse("ok"), Some(GrblResponse::Ack));
}

#[test]
fn test_custom_vocabulary() {
    let config = MachineConfig {
        success_response: "done".to_string(),
        ready_responses: vec!["Marlin".to_string()],
        ..Default::default()
    };
    let parser = GrblResponseParser::new();
    assert_eq!(parser.parse("done", &config), Some(GrblResponse::Ack));
    assert!(matches!(
        parser.parse("Marlin 2.0", &config),
        Some(GrblResponse::Ready(_))
    ));
    assert!(matches!(
        parser.parse("ok", &config),
        Some(GrblResponse::Unknown(_))
    ));
}

#[test]
fn test_device_reports() {
    assert!(matches!(parse("$110=500.000"), Some(GrblResponse::Settings(_))));
    assert!(matches!(parse("error:22"), Some(GrblResponse::Error(_))));
    assert!(matches!(parse("ALARM:1"), Some(GrblResponse::Alarm(_))));
    assert!(matches!(parse("something else"), Some(GrblResponse::Unknown(_))));
}

#[test]
fn test_undecodable_status_is_dropped() {
    assert_eq!(parse("<Idle|MPos>"), None);
}

#[test]
fn test_split_lines_in_arrival_order() {
    let mut parser = GrblResponseParser::new();
    let mut lines = parser.feed(b"ok\r\nerr");
    lines.extend(parser.feed(b"or:1\r\nALARM:2\n"));
    assert_eq!(lines, vec!["ok", "error:1", "ALARM:2"]);
}
