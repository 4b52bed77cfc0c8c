// Scripted in-memory bus shared by the session tests
#![allow(dead_code)]

use can_trace_engine::formats;
use can_trace_engine::{
    Bitrate, Connector, Direction, Frame, Result, SessionController, SessionReport, Transport,
    TransportError, TransportErrorKind,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Default)]
pub struct BusState {
    /// Failures returned by successive connect calls before one succeeds
    pub connect_failures: VecDeque<TransportError>,
    /// Failures returned by successive sends before they succeed again
    pub send_failures: VecDeque<TransportError>,
    /// Failures returned by successive receives
    pub receive_failures: VecDeque<TransportError>,
    /// Frames handed out by receive, in order
    pub inbound: VecDeque<Frame>,
    /// Every frame accepted by send, with the instant it arrived
    pub sent: Vec<(Instant, Frame)>,
    pub connect_calls: u32,
    /// listen_only flag of every successful connect
    pub connections: Vec<bool>,
    pub closes: u32,
}

#[derive(Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<BusState>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, f: impl FnOnce(&mut BusState)) {
        f(&mut self.state.lock());
    }

    pub fn inspect<R>(&self, f: impl FnOnce(&BusState) -> R) -> R {
        f(&self.state.lock())
    }

    pub fn sent_frames(&self) -> Vec<Frame> {
        self.inspect(|s| s.sent.iter().map(|(_, f)| f.clone()).collect())
    }

    /// Send instants relative to the first sent frame
    pub fn send_offsets(&self) -> Vec<Duration> {
        self.inspect(|s| match s.sent.first() {
            Some((first, _)) => s.sent.iter().map(|(at, _)| *at - *first).collect(),
            None => Vec::new(),
        })
    }

    pub fn controller(&self) -> SessionController {
        SessionController::new(Arc::new(self.clone()))
    }
}

impl Connector for MockBus {
    fn connect(
        &self,
        _channel: &str,
        _bitrate: Bitrate,
        listen_only: bool,
    ) -> std::result::Result<Box<dyn Transport>, TransportError> {
        let mut state = self.state.lock();
        state.connect_calls += 1;
        if let Some(err) = state.connect_failures.pop_front() {
            return Err(err);
        }
        state.connections.push(listen_only);
        Ok(Box::new(MockTransport {
            state: self.state.clone(),
            listen_only,
        }))
    }
}

struct MockTransport {
    state: Arc<Mutex<BusState>>,
    listen_only: bool,
}

impl Transport for MockTransport {
    fn send(&mut self, frame: &Frame) -> std::result::Result<(), TransportError> {
        if self.listen_only {
            return Err(TransportError::new(
                TransportErrorKind::Other,
                "listen-only transport cannot send",
            ));
        }
        let mut state = self.state.lock();
        if let Some(err) = state.send_failures.pop_front() {
            return Err(err);
        }
        state.sent.push((Instant::now(), frame.clone()));
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> std::result::Result<Option<Frame>, TransportError> {
        {
            let mut state = self.state.lock();
            if let Some(err) = state.receive_failures.pop_front() {
                return Err(err);
            }
            if let Some(frame) = state.inbound.pop_front() {
                return Ok(Some(frame));
            }
        }
        std::thread::sleep(timeout.min(Duration::from_millis(5)));
        Ok(None)
    }

    fn close(&mut self) {
        self.state.lock().closes += 1;
    }
}

pub fn frame(timestamp: f64, identifier: u32, data: &[u8]) -> Frame {
    Frame::new(timestamp, identifier, data.to_vec()).unwrap()
}

/// Write `frames` as a trace under `dir`
pub fn write_trace(dir: &Path, name: &str, frames: &[Frame]) -> PathBuf {
    let path = dir.join(name);
    let mut writer = formats::open_for_write(&path, 1).unwrap();
    for frame in frames {
        writer.append(frame, Direction::Tx).unwrap();
    }
    writer.finish().unwrap();
    path
}

/// Wait for the active worker to exit on its own and collect its result
pub fn wait_for_result(session: &mut SessionController, timeout: Duration) -> Result<SessionReport> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(result) = session.poll() {
            return result;
        }
        assert!(Instant::now() < deadline, "worker did not finish within {:?}", timeout);
        std::thread::sleep(Duration::from_millis(5));
    }
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
