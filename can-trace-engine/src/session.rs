//! Mode control
//!
//! The [`SessionController`] owns the session state: which mode is active and
//! the handle of the worker running it. Starting a mode stops whatever is
//! running first, so no two workers ever run concurrently. Analysis state
//! (volatility engine, pending events) survives a stop and is cleared when
//! the next session starts.

use crate::batch::EventBatcher;
use crate::cancel::WorkerState;
use crate::config::{BatchConfig, CaptureConfig, MonitorConfig, ReplayConfig};
use crate::modifier::{FrameModifier, Passthrough};
use crate::transport::Connector;
use crate::types::{EngineError, FrameEvent, Mode, Result};
use crate::volatility::{RankedEntry, VolatilityEngine};
use crate::worker::{self, Pipeline, Progress, SessionContext, SessionReport};
use std::any::Any;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Default time a worker gets to notice a stop request
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);

const JOIN_POLL: Duration = Duration::from_millis(5);

struct ActiveWorker {
    mode: Mode,
    context: SessionContext,
    handle: JoinHandle<Result<SessionReport>>,
    state: WorkerState,
    receive_timeout: Duration,
}

/// Result of stopping a worker
#[derive(Debug)]
pub struct StopOutcome {
    pub mode: Mode,
    /// `Stopped` or `ForceStopped`
    pub state: WorkerState,
    /// The worker's own result; `None` if it had to be abandoned
    pub result: Option<Result<SessionReport>>,
}

/// Drives capture, replay and monitor sessions
pub struct SessionController {
    connector: Arc<dyn Connector>,
    pipeline: Pipeline,
    stop_grace: Duration,
    active: Option<ActiveWorker>,
}

impl SessionController {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::with_batch_config(connector, &BatchConfig::default())
    }

    pub fn with_batch_config(connector: Arc<dyn Connector>, batch: &BatchConfig) -> Self {
        Self {
            connector,
            pipeline: Pipeline::new(EventBatcher::new(batch.flush_interval())),
            stop_grace: DEFAULT_STOP_GRACE,
            active: None,
        }
    }

    /// Builder method: set the stop grace period
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Start capturing to a trace file
    pub fn start_capture(&mut self, config: CaptureConfig) -> Result<()> {
        config.validate()?;
        let receive_timeout = config.link.receive_timeout();
        self.launch(Mode::Capturing, receive_timeout, move |ctx| {
            worker::run_capture(&ctx, &config)
        })
    }

    /// Start replaying a trace with frames passed through unchanged
    pub fn start_replay(&mut self, config: ReplayConfig) -> Result<()> {
        self.start_replay_with(config, Arc::new(Passthrough))
    }

    /// Start replaying a trace through a frame modifier
    ///
    /// A missing trace is reported here, before any worker starts.
    pub fn start_replay_with(
        &mut self,
        config: ReplayConfig,
        modifier: Arc<dyn FrameModifier>,
    ) -> Result<()> {
        config.validate()?;
        let receive_timeout = config.link.receive_timeout();
        self.launch(Mode::Replaying, receive_timeout, move |ctx| {
            worker::run_replay(&ctx, &config, modifier.as_ref())
        })
    }

    /// Start a passive monitor session
    pub fn start_monitor(&mut self, config: MonitorConfig) -> Result<()> {
        config.validate()?;
        let receive_timeout = config.link.receive_timeout();
        self.launch(Mode::Monitoring, receive_timeout, move |ctx| {
            worker::run_monitor(&ctx, &config)
        })
    }

    fn launch<F>(&mut self, mode: Mode, receive_timeout: Duration, body: F) -> Result<()>
    where
        F: FnOnce(SessionContext) -> Result<SessionReport> + Send + 'static,
    {
        if let Some(outcome) = self.stop() {
            log::info!("Stopped {} session ({:?}) to start {}", outcome.mode, outcome.state, mode);
        }

        self.pipeline.reset();
        let context = SessionContext::new(self.connector.clone(), self.pipeline.clone());
        let worker_context = context.clone();

        let thread_name = match mode {
            Mode::Capturing => "can-capture",
            Mode::Replaying => "can-replay",
            Mode::Monitoring => "can-monitor",
            Mode::Idle => "can-idle",
        };
        let handle = std::thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || body(worker_context))?;

        log::info!("{} session started", mode);
        self.active = Some(ActiveWorker {
            mode,
            context,
            handle,
            state: WorkerState::Running,
            receive_timeout,
        });
        Ok(())
    }

    /// Currently active mode
    ///
    /// A worker that has exited on its own keeps reporting its mode until
    /// [`poll`](Self::poll) or [`stop`](Self::stop) collects its result.
    pub fn mode(&self) -> Mode {
        self.active.as_ref().map_or(Mode::Idle, |worker| worker.mode)
    }

    pub fn worker_state(&self) -> Option<WorkerState> {
        self.active.as_ref().map(|worker| worker.state)
    }

    /// True if a worker has exited and its result is waiting to be collected
    pub fn is_finished(&self) -> bool {
        self.active
            .as_ref()
            .map_or(false, |worker| worker.handle.is_finished())
    }

    /// Collect the result of a worker that exited on its own
    pub fn poll(&mut self) -> Option<Result<SessionReport>> {
        if !self.is_finished() {
            return None;
        }
        let worker = self.active.take()?;
        let result = join_worker(worker.handle);
        log_result(worker.mode, &result);
        Some(result)
    }

    /// Stop the active worker
    ///
    /// Sets the stop flag and waits up to the grace period. A worker that has
    /// not exited by then is force-stopped: its transport is released from
    /// here and the thread is detached. Returns `None` when nothing was
    /// running.
    pub fn stop(&mut self) -> Option<StopOutcome> {
        let mut worker = self.active.take()?;
        worker.state = worker.state.request_stop();
        worker.context.token.cancel();
        log::info!("Stop requested for {} session", worker.mode);

        let deadline = Instant::now() + self.stop_grace;
        while !worker.handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(JOIN_POLL);
        }

        if worker.handle.is_finished() {
            let result = join_worker(worker.handle);
            log_result(worker.mode, &result);
            return Some(StopOutcome {
                mode: worker.mode,
                state: WorkerState::Stopped,
                result: Some(result),
            });
        }

        log::warn!(
            "{} worker did not stop within {:?}; forcing",
            worker.mode,
            self.stop_grace
        );
        let released = worker
            .context
            .slot
            .force_release(worker.receive_timeout + Duration::from_millis(100));
        if released {
            log::info!("Transport released by forced stop");
        }
        // Detach; the worker exits on its next transport access or flag check
        drop(worker.handle);

        Some(StopOutcome {
            mode: worker.mode,
            state: WorkerState::ForceStopped,
            result: None,
        })
    }

    /// Progress of the active session
    pub fn progress(&self) -> Option<Progress> {
        self.active
            .as_ref()
            .map(|worker| worker.context.stats.snapshot())
    }

    /// Drain every buffered frame event
    pub fn flush_events(&self) -> Vec<FrameEvent> {
        self.pipeline.batcher().lock().flush()
    }

    /// Drain buffered frame events if the flush interval has elapsed
    pub fn flush_events_if_due(&self, now: Instant) -> Option<Vec<FrameEvent>> {
        self.pipeline.batcher().lock().flush_if_due(now)
    }

    /// Time until the next batch flush is due
    pub fn time_until_flush(&self, now: Instant) -> Duration {
        self.pipeline.batcher().lock().time_until_due(now)
    }

    /// Identifiers ranked by volatility
    pub fn ranked_view(&self, filter: Option<&str>) -> Vec<u32> {
        self.pipeline.engine().lock().ranked_view(filter)
    }

    /// Top `limit` ranked identifiers with per-byte detail
    pub fn ranked_entries(&self, filter: Option<&str>, limit: usize) -> Vec<RankedEntry> {
        self.pipeline.engine().lock().ranked_entries(filter, limit)
    }

    /// Inspect the volatility engine
    pub fn with_engine<R>(&self, f: impl FnOnce(&VolatilityEngine) -> R) -> R {
        f(&self.pipeline.engine().lock())
    }

    /// Clear analysis state and pending events
    pub fn reset_analysis(&self) {
        self.pipeline.reset();
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_worker(handle: JoinHandle<Result<SessionReport>>) -> Result<SessionReport> {
    match handle.join() {
        Ok(result) => result,
        Err(payload) => Err(EngineError::WorkerPanicked(panic_message(&*payload))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn log_result(mode: Mode, result: &Result<SessionReport>) {
    match result {
        Ok(report) => log::info!(
            "{} session ended: {} frames, {} dropped, {} loops, {} retries",
            mode,
            report.frames,
            report.dropped,
            report.loops,
            report.retries.len()
        ),
        Err(e) => log::error!("{} session failed: {}", mode, e),
    }
}
