//! Capture, replay and monitor workers
//!
//! Each worker runs on its own thread and owns a fresh [`SessionContext`]:
//! the cancellation token, the transport slot, progress counters and a handle
//! to the analysis pipeline. Exactly one worker is active at a time; the
//! [`SessionController`](crate::session::SessionController) enforces this.

use crate::batch::EventBatcher;
use crate::cancel::CancellationToken;
use crate::transport::{Connector, Transport, TransportError, TransportErrorKind};
use crate::types::{Direction, Frame, Mode, RetryRecord, Timestamp};
use crate::volatility::VolatilityEngine;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub mod capture;
pub mod monitor;
pub mod replay;

pub use capture::run_capture;
pub use monitor::run_monitor;
pub use replay::run_replay;

/// Everything a worker needs for one session
///
/// Built fresh for every session and dropped on mode switch.
#[derive(Clone)]
pub struct SessionContext {
    pub token: CancellationToken,
    pub pipeline: Pipeline,
    pub slot: TransportSlot,
    pub stats: Arc<SessionStats>,
    pub connector: Arc<dyn Connector>,
}

impl SessionContext {
    pub fn new(connector: Arc<dyn Connector>, pipeline: Pipeline) -> Self {
        Self {
            token: CancellationToken::new(),
            pipeline,
            slot: TransportSlot::default(),
            stats: Arc::new(SessionStats::default()),
            connector,
        }
    }

    /// Publish a frame on behalf of this session's worker
    ///
    /// Dropped once the session is cancelled; returns whether it was published.
    pub fn publish(&self, direction: Direction, frame: &Frame) -> bool {
        self.pipeline.publish(&self.token, direction, frame)
    }
}

/// Analysis fan-out: every frame goes to the volatility engine and the batcher
///
/// Both sides are only ever fed from the single active worker thread, so they
/// observe frames in exactly the order they were sent or received.
#[derive(Clone)]
pub struct Pipeline {
    batcher: Arc<Mutex<EventBatcher>>,
    engine: Arc<Mutex<VolatilityEngine>>,
}

impl Pipeline {
    pub fn new(batcher: EventBatcher) -> Self {
        Self {
            batcher: Arc::new(Mutex::new(batcher)),
            engine: Arc::new(Mutex::new(VolatilityEngine::new())),
        }
    }

    /// Feed a frame to the engine and the batcher unless `token` is cancelled
    ///
    /// The check runs under the engine lock, which [`reset`](Self::reset) also
    /// holds, so a worker abandoned after a forced stop cannot publish into
    /// the session that replaced it.
    pub fn publish(&self, token: &CancellationToken, direction: Direction, frame: &Frame) -> bool {
        let mut engine = self.engine.lock();
        if token.is_cancelled() {
            return false;
        }
        engine.observe(frame);
        self.batcher.lock().push(direction, frame.clone());
        true
    }

    pub fn batcher(&self) -> &Arc<Mutex<EventBatcher>> {
        &self.batcher
    }

    pub fn engine(&self) -> &Arc<Mutex<VolatilityEngine>> {
        &self.engine
    }

    /// Clear analysis state and pending events
    pub fn reset(&self) {
        let mut engine = self.engine.lock();
        engine.clear();
        self.batcher.lock().clear();
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(EventBatcher::default())
    }
}

/// Holder of the active worker's transport
///
/// The worker is the only user during normal operation. The controller only
/// reaches in on a forced stop, to close the handle the worker failed to
/// release in time.
#[derive(Clone, Default)]
pub struct TransportSlot {
    inner: Arc<Mutex<Option<Box<dyn Transport>>>>,
}

impl TransportSlot {
    /// Install a freshly connected transport, closing any previous one
    pub fn install(&self, transport: Box<dyn Transport>) {
        let previous = self.inner.lock().replace(transport);
        if let Some(mut previous) = previous {
            previous.close();
        }
    }

    /// Run an operation against the transport
    ///
    /// Fails with [`TransportErrorKind::Closed`] once the slot is empty.
    pub fn with<R>(
        &self,
        op: impl FnOnce(&mut dyn Transport) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        let mut guard = self.inner.lock();
        match guard.as_mut() {
            Some(transport) => op(&mut **transport),
            None => Err(TransportError::closed()),
        }
    }

    /// Close and drop the transport; returns false if the slot was empty
    pub fn release(&self) -> bool {
        let taken = self.inner.lock().take();
        match taken {
            Some(mut transport) => {
                transport.close();
                true
            }
            None => false,
        }
    }

    /// Release the transport from outside the worker, waiting at most `wait`
    /// for an in-flight operation to finish
    pub fn force_release(&self, wait: Duration) -> bool {
        let taken = match self.inner.try_lock_for(wait) {
            Some(mut guard) => guard.take(),
            None => {
                log::error!("Transport still busy after {:?}; unable to release it", wait);
                return false;
            }
        };
        match taken {
            Some(mut transport) => {
                transport.close();
                true
            }
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Guard that releases the transport when the worker exits, on any path
    pub fn guard(&self) -> SlotGuard<'_> {
        SlotGuard { slot: self }
    }
}

pub struct SlotGuard<'a> {
    slot: &'a TransportSlot,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.slot.release() {
            log::debug!("Transport released");
        }
    }
}

/// Live counters of the active session
#[derive(Debug, Default)]
pub struct SessionStats {
    frames: AtomicU64,
    dropped: AtomicU64,
    loops: AtomicU64,
    pass_frames: AtomicU64,
    trace_frames: AtomicU64,
    connection_attempt: AtomicU32,
}

impl SessionStats {
    pub(crate) fn frame_done(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Start of a pass over the trace, including one restarted by a reconnect
    pub(crate) fn pass_started(&self) {
        self.pass_frames.store(0, Ordering::Relaxed);
    }

    /// A trace frame was handled in the current pass, sent or dropped
    pub(crate) fn pass_advanced(&self) {
        self.pass_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn loop_done(&self) {
        self.loops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_trace_frames(&self, total: u64) {
        self.trace_frames.store(total, Ordering::Relaxed);
    }

    pub(crate) fn set_connection_attempt(&self, attempt: u32) {
        self.connection_attempt.store(attempt, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Progress {
        Progress {
            frames: self.frames.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            loops: self.loops.load(Ordering::Relaxed),
            pass_frames: self.pass_frames.load(Ordering::Relaxed),
            trace_frames: self.trace_frames.load(Ordering::Relaxed),
            connection_attempt: self.connection_attempt.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of session progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    /// Frames captured, monitored or successfully sent
    pub frames: u64,
    /// Frames dropped after exhausting per-frame retries (replay only)
    pub dropped: u64,
    /// Completed passes over the trace (replay only)
    pub loops: u64,
    /// Trace frames handled in the current pass (replay only)
    pub pass_frames: u64,
    /// Frames in the trace, 0 if unknown (replay only)
    pub trace_frames: u64,
    /// Current connection attempt, 1-based (replay only)
    pub connection_attempt: u32,
}

impl Progress {
    /// Position within the current pass, as a fraction of the trace
    pub fn loop_fraction(&self) -> Option<f64> {
        if self.trace_frames == 0 {
            return None;
        }
        let done = self.pass_frames.min(self.trace_frames);
        Some(done as f64 / self.trace_frames as f64)
    }
}

/// Summary returned by a worker that ended without a fatal error
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReport {
    pub mode: Mode,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub frames: u64,
    pub dropped: u64,
    pub loops: u64,
    /// Connection attempts that failed before the session succeeded
    pub retries: Vec<RetryRecord>,
}

impl SessionReport {
    pub(crate) fn from_stats(
        mode: Mode,
        started_at: Timestamp,
        stats: &SessionStats,
        retries: Vec<RetryRecord>,
    ) -> Self {
        let progress = stats.snapshot();
        Self {
            mode,
            started_at,
            finished_at: chrono::Utc::now(),
            frames: progress.frames,
            dropped: progress.dropped,
            loops: progress.loops,
            retries,
        }
    }
}

/// Shared listen loop of capture and monitor
///
/// Receives until cancelled, handing each frame to `on_frame`. A receive
/// timeout is not an error; every other transport failure ends the loop.
pub(crate) fn receive_loop<F>(
    ctx: &SessionContext,
    timeout: Duration,
    mut on_frame: F,
) -> crate::Result<()>
where
    F: FnMut(&Frame) -> crate::Result<()>,
{
    while !ctx.token.is_cancelled() {
        match ctx.slot.with(|transport| transport.receive(timeout)) {
            Ok(Some(frame)) => {
                // Persisted and published at trace resolution
                let frame = frame.rounded_to_micros();
                on_frame(&frame)?;
                ctx.publish(Direction::Rx, &frame);
                ctx.stats.frame_done();
            }
            Ok(None) => {}
            Err(e) if e.kind == TransportErrorKind::Timeout => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingTransport {
        closes: Arc<AtomicU32>,
    }

    impl Transport for CountingTransport {
        fn send(&mut self, _frame: &Frame) -> Result<(), TransportError> {
            Ok(())
        }

        fn receive(&mut self, _timeout: Duration) -> Result<Option<Frame>, TransportError> {
            Ok(None)
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_slot_guard_releases_transport() {
        let closes = Arc::new(AtomicU32::new(0));
        let slot = TransportSlot::default();
        {
            let _guard = slot.guard();
            slot.install(Box::new(CountingTransport {
                closes: closes.clone(),
            }));
            assert!(slot.is_open());
        }
        assert!(!slot.is_open());
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        let err = slot.with(|t| t.receive(Duration::ZERO)).unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Closed);
    }

    #[test]
    fn test_install_replaces_and_closes_previous() {
        let closes = Arc::new(AtomicU32::new(0));
        let slot = TransportSlot::default();
        slot.install(Box::new(CountingTransport { closes: closes.clone() }));
        slot.install(Box::new(CountingTransport { closes: closes.clone() }));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(slot.force_release(Duration::from_millis(10)));
        assert_eq!(closes.load(Ordering::SeqCst), 2);
        assert!(!slot.release());
    }

    #[test]
    fn test_pipeline_feeds_engine_and_batcher() {
        let pipeline = Pipeline::default();
        let frame = Frame::new(0.0, 0x123, vec![1, 2]).unwrap();
        let token = CancellationToken::new();
        assert!(pipeline.publish(&token, Direction::Tx, &frame));
        assert!(pipeline.publish(&token, Direction::Tx, &frame));

        assert_eq!(pipeline.engine().lock().observed_frames(), 2);
        assert_eq!(pipeline.batcher().lock().pending(), 2);

        pipeline.reset();
        assert!(pipeline.engine().lock().is_empty());
        assert_eq!(pipeline.batcher().lock().pending(), 0);
    }

    #[test]
    fn test_cancelled_session_cannot_publish() {
        let pipeline = Pipeline::default();
        let frame = Frame::new(0.0, 0x222, vec![1]).unwrap();
        let stale = CancellationToken::new();
        stale.cancel();

        assert!(!pipeline.publish(&stale, Direction::Tx, &frame));
        assert!(pipeline.engine().lock().is_empty());
        assert_eq!(pipeline.batcher().lock().pending(), 0);
    }

    #[test]
    fn test_progress_fraction() {
        let stats = SessionStats::default();
        assert_eq!(stats.snapshot().loop_fraction(), None);
        stats.set_trace_frames(4);
        stats.pass_started();
        stats.frame_done();
        stats.pass_advanced();
        assert_eq!(stats.snapshot().loop_fraction(), Some(0.25));
    }

    #[test]
    fn test_progress_fraction_restarts_with_pass() {
        let stats = SessionStats::default();
        stats.set_trace_frames(4);
        stats.pass_started();
        for _ in 0..3 {
            stats.frame_done();
            stats.pass_advanced();
        }
        // A reconnect restarts the trace mid-pass
        stats.pass_started();
        stats.frame_done();
        stats.pass_advanced();

        let progress = stats.snapshot();
        assert_eq!(progress.frames, 4);
        assert_eq!(progress.loop_fraction(), Some(0.25));
    }
}
