mod common;

use can_trace_engine::formats;
use can_trace_engine::{
    CaptureConfig, Direction, EngineError, Frame, LinkConfig, Mode, MonitorConfig, ReplayConfig,
    TransportError, TransportErrorKind, WorkerState,
};
use common::{frame, init_logging, wait_for_result, wait_until, write_trace, MockBus};
use std::time::Duration;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(5);

fn bus_traffic() -> Vec<Frame> {
    vec![
        frame(0.0, 0x0CF00400, &[0xF0, 0x7D, 0x7D, 0x00, 0x00, 0x00, 0xF0, 0xFF]),
        frame(0.5, 0x18FEF100, &[0x00, 0x12]),
        frame(1.25, 0x321, &[0x01]),
    ]
}

fn link() -> LinkConfig {
    let mut link = LinkConfig::default();
    link.receive_timeout_ms = 20;
    link
}

#[test]
fn test_capture_writes_every_received_frame() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("capture.asc");
    let bus = MockBus::new();
    bus.script(|s| s.inbound.extend(bus_traffic()));
    let mut session = bus.controller();

    session
        .start_capture(CaptureConfig::new(&output).with_link(link()))
        .unwrap();
    assert_eq!(session.mode(), Mode::Capturing);
    assert!(wait_until(WAIT, || session.progress().map_or(false, |p| p.frames == 3)));

    let outcome = session.stop().unwrap();
    assert_eq!(outcome.state, WorkerState::Stopped);
    assert_eq!(outcome.result.unwrap().unwrap().frames, 3);

    let replayed: Vec<Frame> = formats::iterate(&output).unwrap().collect();
    assert_eq!(replayed, bus_traffic());
    assert_eq!(formats::count(&output), 3);

    let events = session.flush_events();
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|e| e.direction == Direction::Rx));

    bus.inspect(|s| {
        assert_eq!(s.connections, vec![true]);
        assert_eq!(s.closes, 1);
        assert!(s.sent.is_empty());
    });
}

#[test]
fn test_capture_survives_receive_timeouts() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("quiet.asc");
    let bus = MockBus::new();
    bus.script(|s| {
        s.receive_failures
            .push_back(TransportError::timeout("no traffic"));
        s.inbound.push_back(frame(2.0, 0x100, &[0x01]));
    });
    let mut session = bus.controller();

    session
        .start_capture(CaptureConfig::new(&output).with_link(link()))
        .unwrap();
    assert!(wait_until(WAIT, || session.progress().map_or(false, |p| p.frames == 1)));
    let report = session.stop().unwrap().result.unwrap().unwrap();

    assert_eq!(report.frames, 1);
    assert_eq!(formats::count(&output), 1);
}

#[test]
fn test_capture_stores_frames_at_trace_resolution() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("precise.asc");
    let bus = MockBus::new();
    bus.script(|s| {
        s.inbound.push_back(frame(0.123456789, 0x100, &[0x01]));
        s.inbound.push_back(frame(3.0000004, 0x200, &[0x02, 0x03]));
    });
    let mut session = bus.controller();

    session
        .start_capture(CaptureConfig::new(&output).with_link(link()))
        .unwrap();
    assert!(wait_until(WAIT, || session.progress().map_or(false, |p| p.frames == 2)));
    session.stop().unwrap();

    let published: Vec<Frame> = session.flush_events().into_iter().map(|e| e.frame).collect();
    let stored: Vec<Frame> = formats::iterate(&output).unwrap().collect();
    assert_eq!(stored, published);
    assert_eq!(stored[0].timestamp(), 0.123457);
    assert_eq!(stored[1].timestamp(), 3.0);
}

#[test]
fn test_failed_connect_leaves_existing_trace_untouched() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let output = write_trace(dir.path(), "keep.asc", &bus_traffic());
    let before = std::fs::read(&output).unwrap();
    let bus = MockBus::new();
    bus.script(|s| {
        s.connect_failures.push_back(TransportError::new(
            TransportErrorKind::DeviceNotFound,
            "no such device can9",
        ));
    });
    let mut session = bus.controller();

    session
        .start_capture(CaptureConfig::new(&output).with_link(link()))
        .unwrap();
    let err = wait_for_result(&mut session, WAIT).unwrap_err();

    assert!(matches!(
        err,
        EngineError::Transport(ref e) if e.kind == TransportErrorKind::DeviceNotFound
    ));
    assert_eq!(std::fs::read(&output).unwrap(), before);
}

#[test]
fn test_capture_fails_on_device_error() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("broken.asc");
    let bus = MockBus::new();
    bus.script(|s| {
        s.receive_failures.push_back(TransportError::new(
            TransportErrorKind::DeviceNotFound,
            "adapter unplugged",
        ));
    });
    let mut session = bus.controller();

    session
        .start_capture(CaptureConfig::new(&output).with_link(link()))
        .unwrap();
    let err = wait_for_result(&mut session, WAIT).unwrap_err();

    assert!(matches!(
        err,
        EngineError::Transport(ref e) if e.kind == TransportErrorKind::DeviceNotFound
    ));
    assert_eq!(session.mode(), Mode::Idle);
    assert_eq!(bus.inspect(|s| s.closes), 1);
    // Header and footer are still written
    assert_eq!(formats::count(&output), 0);
}

#[test]
fn test_monitor_publishes_without_persisting() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let bus = MockBus::new();
    bus.script(|s| s.inbound.extend(bus_traffic()));
    let mut session = bus.controller();

    session.start_monitor(MonitorConfig::new(link())).unwrap();
    assert_eq!(session.mode(), Mode::Monitoring);
    assert!(wait_until(WAIT, || session.progress().map_or(false, |p| p.frames == 3)));
    session.stop().unwrap();

    assert_eq!(session.flush_events().len(), 3);
    assert_eq!(session.with_engine(|engine| engine.len()), 3);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    assert_eq!(bus.inspect(|s| s.connections.clone()), vec![true]);
}

#[test]
fn test_analysis_state_kept_until_next_session() {
    init_logging();
    let bus = MockBus::new();
    bus.script(|s| s.inbound.extend(bus_traffic()));
    let mut session = bus.controller();

    session.start_monitor(MonitorConfig::new(link())).unwrap();
    assert!(wait_until(WAIT, || session.progress().map_or(false, |p| p.frames == 3)));
    session.stop().unwrap();

    // Still inspectable after the stop
    assert_eq!(session.mode(), Mode::Idle);
    assert_eq!(session.ranked_view(None).len(), 3);

    // Cleared as soon as the next session starts
    session.start_monitor(MonitorConfig::new(link())).unwrap();
    assert!(session.with_engine(|engine| engine.is_empty()));
    assert!(session.flush_events().is_empty());
    session.stop().unwrap();
}

#[test]
fn test_mode_switch_stops_previous_worker() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let trace = write_trace(dir.path(), "switch.asc", &bus_traffic());
    let bus = MockBus::new();
    let mut session = bus.controller();

    session.start_monitor(MonitorConfig::new(link())).unwrap();
    assert!(wait_until(WAIT, || bus.inspect(|s| s.connections.len() == 1)));

    session
        .start_replay(
            ReplayConfig::new(&trace)
                .with_link(link())
                .with_fixed_interval(Duration::from_millis(1))
                .with_max_loops(1),
        )
        .unwrap();
    assert_eq!(session.mode(), Mode::Replaying);

    let report = wait_for_result(&mut session, WAIT).unwrap();
    assert_eq!(report.mode, Mode::Replaying);
    assert_eq!(report.frames, 3);

    bus.inspect(|s| {
        // Monitor connected listen-only, replay connected for transmit
        assert_eq!(s.connections, vec![true, false]);
        assert_eq!(s.closes, 2);
        assert_eq!(s.sent.len(), 3);
    });
}

#[test]
fn test_batched_events_flush_on_interval() {
    init_logging();
    let bus = MockBus::new();
    bus.script(|s| s.inbound.extend(bus_traffic()));
    let mut session = bus.controller();

    session.start_monitor(MonitorConfig::new(link())).unwrap();
    assert!(wait_until(WAIT, || session.progress().map_or(false, |p| p.frames == 3)));

    let mut delivered = Vec::new();
    assert!(wait_until(WAIT, || {
        if let Some(batch) = session.flush_events_if_due(std::time::Instant::now()) {
            delivered.extend(batch);
        }
        !delivered.is_empty()
    }));
    session.stop().unwrap();

    let frames: Vec<Frame> = delivered.into_iter().map(|e| e.frame).collect();
    assert_eq!(frames, bus_traffic());
}
