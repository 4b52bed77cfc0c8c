//! Cooperative cancellation
//!
//! A [`CancellationToken`] is shared between the session controller and the
//! active worker. The worker checks it at every loop boundary and after every
//! sleep; the controller sets it, waits a bounded grace period and escalates
//! to a forced stop if the worker has not exited.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Granularity of interruptible waits
const WAIT_SLICE: Duration = Duration::from_millis(20);

/// Shared stop flag
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless cancelled first
    ///
    /// Returns true if the full duration elapsed without cancellation.
    pub fn wait(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(WAIT_SLICE));
        }
    }
}

/// Lifecycle of a worker as seen by its controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    Running,
    StopRequested,
    /// Exited on its own or within the grace period
    Stopped,
    /// Did not exit within the grace period; transport released and thread detached
    ForceStopped,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Stopped | WorkerState::ForceStopped)
    }

    /// Apply a stop request; a no-op for workers that are already stopping
    pub fn request_stop(self) -> Self {
        match self {
            WorkerState::Running => WorkerState::StopRequested,
            other => other,
        }
    }
}
