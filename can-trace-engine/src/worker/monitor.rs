//! Passive monitor worker
//!
//! Same as capture without the trace: frames go to the analysis pipeline only.

use super::{receive_loop, SessionContext, SessionReport};
use crate::config::MonitorConfig;
use crate::types::{Mode, Result};

pub fn run_monitor(ctx: &SessionContext, config: &MonitorConfig) -> Result<SessionReport> {
    let started_at = chrono::Utc::now();
    let _release = ctx.slot.guard();

    log::info!(
        "Monitor connecting to {} at {} (listen-only)",
        config.link.channel,
        config.link.bitrate
    );
    let transport = ctx
        .connector
        .connect(&config.link.channel, config.link.bitrate, true)
        .map_err(|e| {
            log::error!("Monitor failed to connect: {}", e);
            e
        })?;
    ctx.slot.install(transport);

    receive_loop(ctx, config.link.receive_timeout(), |_| Ok(())).map_err(|e| {
        log::error!("Monitor failed: {}", e);
        e
    })?;

    log::info!("Monitor stopped");
    Ok(SessionReport::from_stats(
        Mode::Monitoring,
        started_at,
        &ctx.stats,
        Vec::new(),
    ))
}
