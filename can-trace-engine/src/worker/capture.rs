//! Capture worker
//!
//! Drains the transport in listen-only mode, appends every frame to a trace
//! and publishes it to the analysis pipeline.
//!
//! `Connecting -> Capturing -> Stopped`, or `Failed` on any transport error.
//! The output trace is only created once the transport is connected, so a
//! failed connect leaves an existing file at that path untouched.

use super::{receive_loop, SessionContext, SessionReport};
use crate::config::CaptureConfig;
use crate::formats;
use crate::types::{Direction, Mode, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureState {
    Connecting,
    Capturing,
    Stopped,
    Failed,
}

pub fn run_capture(ctx: &SessionContext, config: &CaptureConfig) -> Result<SessionReport> {
    let started_at = chrono::Utc::now();
    let _release = ctx.slot.guard();

    let mut state = CaptureState::Connecting;
    log::info!(
        "Capture {:?}: opening {} at {} (listen-only)",
        state,
        config.link.channel,
        config.link.bitrate
    );

    let transport = match ctx
        .connector
        .connect(&config.link.channel, config.link.bitrate, true)
    {
        Ok(transport) => transport,
        Err(e) => {
            state = CaptureState::Failed;
            log::error!("Capture {:?}: {}", state, e);
            return Err(e.into());
        }
    };
    ctx.slot.install(transport);

    let mut writer = formats::open_for_write(&config.output, config.trace_channel)?;

    state = CaptureState::Capturing;
    log::info!("Capture {:?}: writing to {:?}", state, config.output);

    let result = receive_loop(ctx, config.link.receive_timeout(), |frame| {
        writer.append(frame, Direction::Rx)
    });

    let finished = writer.finish();

    match result {
        Ok(()) => {
            finished?;
            state = CaptureState::Stopped;
            log::info!(
                "Capture {:?}: {} frames written",
                state,
                writer.frames_written()
            );
            Ok(SessionReport::from_stats(
                Mode::Capturing,
                started_at,
                &ctx.stats,
                Vec::new(),
            ))
        }
        Err(e) => {
            state = CaptureState::Failed;
            log::error!(
                "Capture {:?} after {} frames: {}",
                state,
                writer.frames_written(),
                e
            );
            Err(e)
        }
    }
}
