//! Replay worker
//!
//! Plays a trace back onto the bus, looping until stopped (or until
//! `max_loops` passes are done). Two retry tiers keep playback going:
//!
//! - **Per frame**: a transient send failure is retried immediately, with no
//!   delay, so the next frame's slot is not disturbed. A frame that still
//!   fails is dropped and playback continues.
//! - **Per connection**: transient failures that need a reconnect (failed
//!   connect, bus-off) release the transport, back off and reconnect, up to
//!   `max_connection_retries` attempts in total.
//!
//! Any other transport failure is fatal and ends the session immediately.

use super::{SessionContext, SessionReport};
use crate::clock;
use crate::config::{CadenceMode, ReplayConfig};
use crate::formats;
use crate::modifier::FrameModifier;
use crate::transport::{TransportError, TransportErrorKind};
use crate::types::{Direction, EngineError, Frame, Mode, Result, RetryRecord};
use std::time::{Duration, Instant};

/// How a playback run ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlaybackEnd {
    Stopped,
    Completed,
}

/// Outcome of sending one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendOutcome {
    Sent,
    Dropped,
}

pub fn run_replay(
    ctx: &SessionContext,
    config: &ReplayConfig,
    modifier: &dyn FrameModifier,
) -> Result<SessionReport> {
    let started_at = chrono::Utc::now();
    let _release = ctx.slot.guard();

    let total = formats::count(&config.trace);
    ctx.stats.set_trace_frames(total);
    log::info!(
        "Replaying {:?} ({} frames, {:?}{})",
        config.trace,
        total,
        config.cadence,
        if config.offline { ", offline" } else { "" }
    );

    let mut retries: Vec<RetryRecord> = Vec::new();
    let mut attempt: u32 = 0;

    loop {
        if ctx.token.is_cancelled() {
            break;
        }

        attempt += 1;
        ctx.stats.set_connection_attempt(attempt);

        match connect_and_play(ctx, config, modifier) {
            Ok(end) => {
                log::info!("Replay {:?} after {} connection attempt(s)", end, attempt);
                break;
            }
            Err(EngineError::Transport(cause)) if cause.is_transient() => {
                ctx.slot.release();
                retries.push(RetryRecord {
                    attempt,
                    cause: cause.clone(),
                });

                if attempt >= config.max_connection_retries {
                    log::error!(
                        "Replay giving up after {} attempts, last error: {}",
                        attempt,
                        cause
                    );
                    return Err(EngineError::RetriesExhausted {
                        attempts: attempt,
                        last: cause,
                        history: retries,
                    });
                }

                log::warn!(
                    "Connection attempt {}/{} failed ({}); reconnecting in {:?}",
                    attempt,
                    config.max_connection_retries,
                    cause,
                    config.reconnect_delay()
                );
                if !ctx.token.wait(config.reconnect_delay()) {
                    break;
                }
            }
            Err(e) => {
                ctx.slot.release();
                log::error!("Replay failed on attempt {}: {}", attempt, e);
                return Err(e);
            }
        }
    }

    Ok(SessionReport::from_stats(
        Mode::Replaying,
        started_at,
        &ctx.stats,
        retries,
    ))
}

fn connect_and_play(
    ctx: &SessionContext,
    config: &ReplayConfig,
    modifier: &dyn FrameModifier,
) -> Result<PlaybackEnd> {
    if !config.offline {
        let transport =
            ctx.connector
                .connect(&config.link.channel, config.link.bitrate, false)?;
        ctx.slot.install(transport);
        log::info!(
            "Connected to {} at {}",
            config.link.channel,
            config.link.bitrate
        );
    }

    play(ctx, config, modifier)
}

fn play(
    ctx: &SessionContext,
    config: &ReplayConfig,
    modifier: &dyn FrameModifier,
) -> Result<PlaybackEnd> {
    let mut loops: u64 = 0;

    loop {
        // (playback_start, trace_start) of the current pass
        let mut anchor: Option<(Instant, f64)> = None;
        let mut frames_this_loop: u64 = 0;
        ctx.stats.pass_started();

        for frame in formats::iterate(&config.trace)? {
            if ctx.token.is_cancelled() {
                return Ok(PlaybackEnd::Stopped);
            }

            match config.cadence {
                CadenceMode::FixedInterval => clock::sleep_precise(config.fixed_interval()),
                CadenceMode::OriginalTiming => {
                    let (playback_start, trace_start) =
                        *anchor.get_or_insert_with(|| (Instant::now(), frame.timestamp()));
                    let offset = frame.timestamp() - trace_start;
                    if offset > 0.0 {
                        if let Ok(offset) = Duration::try_from_secs_f64(offset) {
                            clock::sleep_until_precise(playback_start + offset);
                        }
                    }
                }
            }

            // The delay is where a stop request most likely lands
            if ctx.token.is_cancelled() {
                return Ok(PlaybackEnd::Stopped);
            }

            let frame = modifier.modify(frame);
            frames_this_loop += 1;

            match send_with_retry(ctx, config, &frame)? {
                SendOutcome::Sent => {
                    ctx.publish(Direction::Tx, &frame);
                    ctx.stats.frame_done();
                }
                SendOutcome::Dropped => ctx.stats.frame_dropped(),
            }
            ctx.stats.pass_advanced();
        }

        if frames_this_loop == 0 {
            log::warn!("Trace {:?} contains no frames; nothing to replay", config.trace);
            return Ok(PlaybackEnd::Completed);
        }

        loops += 1;
        ctx.stats.loop_done();
        log::debug!("Completed pass {} over {:?}", loops, config.trace);

        if config.max_loops.map_or(false, |max| loops >= max) {
            return Ok(PlaybackEnd::Completed);
        }
    }
}

fn send_with_retry(
    ctx: &SessionContext,
    config: &ReplayConfig,
    frame: &Frame,
) -> Result<SendOutcome> {
    if config.offline {
        return Ok(SendOutcome::Sent);
    }

    let mut last_error: Option<TransportError> = None;
    for attempt in 1..=config.send_attempts {
        match ctx.slot.with(|transport| transport.send(frame)) {
            Ok(()) => return Ok(SendOutcome::Sent),
            Err(e) if e.is_transient() => {
                log::trace!(
                    "Send attempt {} for {:08X} failed: {}",
                    attempt,
                    frame.identifier(),
                    e
                );
                last_error = Some(e);
            }
            Err(e) => return Err(e.into()),
        }
    }

    match last_error {
        // The adapter has left the bus; only a reconnect can help
        Some(e) if e.kind == TransportErrorKind::BusOff => Err(e.into()),
        Some(e) => {
            log::debug!("Dropped frame {:08X}: {}", frame.identifier(), e);
            Ok(SendOutcome::Dropped)
        }
        None => Ok(SendOutcome::Dropped),
    }
}
