//! CAN Trace Engine Library
//!
//! Capture, replay and passive monitoring of CAN bus traffic with
//! sub-millisecond replay timing, plus a concurrent analysis pipeline that
//! ranks message identifiers by how often their payload bytes change.
//!
//! # Architecture
//!
//! - A [`SessionController`] runs exactly one worker at a time (capture,
//!   replay or monitor) on its own thread
//! - Workers talk to the bus through the [`Transport`]/[`Connector`]
//!   boundary; the hardware adapter itself lives outside this crate
//! - Traces are line-oriented ASC-style text files ([`formats`])
//! - Every sent or received frame feeds the [`VolatilityEngine`] and the
//!   [`EventBatcher`], which the caller drains on a fixed cadence
//!
//! The library does NOT:
//! - Configure bit timing, filters or arbitration on the adapter
//! - Render anything; presentation belongs to the application layer
//!
//! # Example Usage
//!
//! ```no_run
//! use can_trace_engine::{Connector, ReplayConfig, SessionController};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! fn run(connector: Arc<dyn Connector>) -> can_trace_engine::Result<()> {
//!     let mut session = SessionController::new(connector);
//!
//!     let config = ReplayConfig::new("truck_log.asc")
//!         .with_original_timing()
//!         .with_max_loops(1);
//!     session.start_replay(config)?;
//!
//!     while session.poll().is_none() {
//!         for event in session.flush_events() {
//!             println!("{} {}", event.direction, event.frame);
//!         }
//!         std::thread::sleep(Duration::from_millis(100));
//!     }
//!
//!     for id in session.ranked_view(Some("fee")) {
//!         println!("{:08X}", id);
//!     }
//!     Ok(())
//! }
//! ```

// Public modules
pub mod batch;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod formats;
pub mod modifier;
pub mod session;
pub mod transport;
pub mod types;
pub mod volatility;
pub mod worker;

// Re-export main types for convenience
pub use batch::EventBatcher;
pub use cancel::{CancellationToken, WorkerState};
pub use config::{
    BatchConfig, Bitrate, CadenceMode, CaptureConfig, LinkConfig, MonitorConfig, ReplayConfig,
};
pub use modifier::{FrameModifier, Passthrough};
pub use session::{SessionController, StopOutcome};
pub use transport::{Connector, Transport, TransportError, TransportErrorKind};
pub use types::{
    Direction, EngineError, Frame, FrameEvent, Mode, Result, RetryRecord, Timestamp,
};
pub use volatility::{ChangeLevel, RankedEntry, VolatilityEngine};
pub use worker::{Progress, SessionReport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_basics() {
        // Smoke test: an idle controller has nothing to report
        let connector: std::sync::Arc<dyn Connector> = std::sync::Arc::new(
            |_: &str, _: Bitrate, _: bool| -> std::result::Result<Box<dyn Transport>, TransportError> {
                Err(TransportError::new(TransportErrorKind::DeviceNotFound, "no adapter"))
            },
        );
        let mut session = SessionController::new(connector);
        assert_eq!(session.mode(), Mode::Idle);
        assert!(session.stop().is_none());
        assert!(session.poll().is_none());
        assert!(session.ranked_view(None).is_empty());
    }
}
