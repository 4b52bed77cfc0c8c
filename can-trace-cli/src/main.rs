//! CAN Trace CLI Application
//!
//! Command-line front end for the can-trace-engine library. It adds:
//! - SocketCAN transport on Linux
//! - TOML configuration with command-line overrides
//! - Periodic volatility ranking and frame printing (text or JSON)

use anyhow::{Context, Result};
use can_trace_engine::formats::AscReader;
use can_trace_engine::{
    Bitrate, CadenceMode, CancellationToken, CaptureConfig, Connector, Direction, MonitorConfig,
    ReplayConfig, SessionController, StopOutcome,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

mod config;
mod display;
#[cfg(target_os = "linux")]
mod socketcan_transport;

use config::{AppConfig, DisplaySection};
use display::Display;

/// Longest the run loop sleeps between checks
const TICK: Duration = Duration::from_millis(50);

/// CAN Trace - Capture, replay and monitor CAN bus traffic
#[derive(Parser, Debug)]
#[command(name = "can-trace")]
#[command(about = "Capture, replay and monitor CAN bus traffic", long_about = None)]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (config.toml)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// CAN interface to open (default: can0)
    #[arg(long, value_name = "NAME", global = true)]
    channel: Option<String>,

    /// Bus bitrate: 125k, 250k, 500k or 1M
    #[arg(long, value_name = "RATE", global = true)]
    bitrate: Option<Bitrate>,

    /// Stop after this many seconds (default: run until Enter is pressed)
    #[arg(long, value_name = "SECONDS", global = true)]
    duration: Option<f64>,

    /// Only rank identifiers whose hex form contains this text
    #[arg(long, value_name = "HEX", global = true)]
    filter: Option<String>,

    /// Number of ranked identifiers to show
    #[arg(long, value_name = "COUNT", global = true)]
    top: Option<usize>,

    /// Print every frame as it is flushed
    #[arg(long, global = true)]
    frames: bool,

    /// Emit JSON lines instead of tables
    #[arg(long, global = true)]
    json: bool,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record bus traffic to a trace file (listen-only)
    Capture {
        /// Trace file to write
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },
    /// Play a trace back onto the bus
    Replay {
        /// Trace file to play
        trace: PathBuf,

        /// Timing: original or fixed
        #[arg(long, value_name = "MODE")]
        cadence: Option<CadenceMode>,

        /// Interval between frames in fixed cadence (implies --cadence fixed)
        #[arg(long, value_name = "MS")]
        interval_ms: Option<u64>,

        /// Time and publish frames without opening the bus
        #[arg(long)]
        offline: bool,

        /// Stop after this many passes over the trace
        #[arg(long, value_name = "COUNT")]
        loops: Option<u64>,

        /// Connection attempts before giving up
        #[arg(long, value_name = "COUNT")]
        retries: Option<u32>,
    },
    /// Watch bus traffic without recording it (listen-only)
    Monitor,
    /// Summarise a trace file
    Info {
        /// Trace file to inspect
        trace: PathBuf,
    },
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.quiet);

    log::info!("CAN Trace CLI v{}", env!("CARGO_PKG_VERSION"));
    log::debug!("Using engine library v{}", can_trace_engine::VERSION);

    let app_config = match &args.config {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            config::load_config(path)?
        }
        None => AppConfig::default(),
    };

    let link = config::link_with_overrides(
        &app_config.link,
        args.channel.as_deref(),
        args.bitrate,
    );
    let display = Display {
        json: args.json,
        show_frames: args.frames,
        top: args.top.unwrap_or(app_config.display.top),
        filter: args.filter.clone(),
    };

    let mut session =
        SessionController::with_batch_config(connector(), &app_config.display.batch_config())
            .with_stop_grace(Duration::from_millis(app_config.display.stop_grace_ms));

    match args.command {
        Command::Capture { output } => {
            let mut capture = CaptureConfig::new(&output).with_link(link);
            capture.trace_channel = app_config.capture.trace_channel;
            session
                .start_capture(capture)
                .with_context(|| format!("Failed to start capture to {:?}", output))?;
        }
        Command::Replay {
            trace,
            cadence,
            interval_ms,
            offline,
            loops,
            retries,
        } => {
            let section = &app_config.replay;
            let cadence = cadence.unwrap_or(if interval_ms.is_some() {
                CadenceMode::FixedInterval
            } else {
                section.cadence
            });

            let mut replay = ReplayConfig::new(&trace)
                .with_link(link)
                .with_offline(offline)
                .with_connection_retries(
                    retries.unwrap_or(section.max_connection_retries),
                    Duration::from_millis(section.reconnect_delay_ms),
                )
                .with_send_attempts(section.send_attempts);
            replay = match cadence {
                CadenceMode::OriginalTiming => replay.with_original_timing(),
                CadenceMode::FixedInterval => replay.with_fixed_interval(Duration::from_millis(
                    interval_ms.unwrap_or(section.interval_ms),
                )),
            };
            if let Some(loops) = loops.or(section.loops) {
                replay = replay.with_max_loops(loops);
            }

            session
                .start_replay(replay)
                .with_context(|| format!("Failed to start replay of {:?}", trace))?;
        }
        Command::Monitor => {
            session
                .start_monitor(MonitorConfig::new(link))
                .context("Failed to start monitor")?;
        }
        Command::Info { trace } => return trace_info(&trace, args.json),
    }

    run_session(&mut session, &display, &app_config.display, args.duration)
}

#[cfg(target_os = "linux")]
fn connector() -> Arc<dyn Connector> {
    Arc::new(socketcan_transport::SocketCanConnector)
}

#[cfg(not(target_os = "linux"))]
fn connector() -> Arc<dyn Connector> {
    use can_trace_engine::{Transport, TransportError, TransportErrorKind};

    Arc::new(
        |channel: &str,
         _: Bitrate,
         _: bool|
         -> std::result::Result<Box<dyn Transport>, TransportError> {
            Err(TransportError::new(
                TransportErrorKind::DeviceNotFound,
                format!("{}: SocketCAN is only available on Linux", channel),
            ))
        },
    )
}

/// Drive the active session until it ends, the duration elapses or Enter is pressed
fn run_session(
    session: &mut SessionController,
    display: &Display,
    settings: &DisplaySection,
    duration: Option<f64>,
) -> Result<()> {
    let stop = CancellationToken::new();
    watch_stdin(stop.clone());

    let deadline = duration
        .map(Duration::try_from_secs_f64)
        .transpose()
        .context("Invalid --duration")?
        .map(|d| Instant::now() + d);
    let refresh = Duration::from_millis(settings.refresh_ms.max(1));
    let mut next_refresh = Instant::now() + refresh;

    if !display.json {
        eprintln!("{} session running; press Enter to stop", session.mode());
    }

    loop {
        if let Some(result) = session.poll() {
            show_final_state(session, display)?;
            let report = result.context("Session failed")?;
            return display.print_report(&report);
        }

        let now = Instant::now();
        if stop.is_cancelled() || deadline.map_or(false, |deadline| now >= deadline) {
            let outcome = session.stop();
            show_final_state(session, display)?;
            return match outcome {
                Some(outcome) => finish(outcome, display),
                None => Ok(()),
            };
        }

        if let Some(events) = session.flush_events_if_due(now) {
            display.print_events(&events)?;
        }

        if now >= next_refresh {
            let ranking = session.ranked_entries(display.filter.as_deref(), display.top);
            display.print_ranking(&ranking, session.progress())?;
            next_refresh = now + refresh;
        }

        let wait = session
            .time_until_flush(Instant::now())
            .clamp(Duration::from_millis(1), TICK);
        std::thread::sleep(wait);
    }
}

/// Print what is still buffered plus the last ranking
fn show_final_state(session: &SessionController, display: &Display) -> Result<()> {
    display.print_events(&session.flush_events())?;
    let ranking = session.ranked_entries(display.filter.as_deref(), display.top);
    if !ranking.is_empty() {
        display.print_ranking(&ranking, None)?;
    }
    Ok(())
}

fn finish(outcome: StopOutcome, display: &Display) -> Result<()> {
    match outcome.result {
        Some(Ok(report)) => display.print_report(&report),
        Some(Err(e)) => Err(e).with_context(|| format!("{} session failed", outcome.mode)),
        None => {
            log::warn!(
                "{} worker did not stop within the grace period; transport released",
                outcome.mode
            );
            Ok(())
        }
    }
}

/// Cancel `stop` when a line is read from stdin
///
/// A closed stdin (EOF) does not stop the session.
fn watch_stdin(stop: CancellationToken) {
    let spawned = std::thread::Builder::new()
        .name("stdin-watch".to_string())
        .spawn(move || {
            let mut line = String::new();
            match io::stdin().read_line(&mut line) {
                Ok(0) => log::debug!("stdin closed; use --duration to bound the session"),
                Ok(_) => stop.cancel(),
                Err(e) => log::debug!("Unable to read stdin: {}", e),
            }
        });
    if let Err(e) = spawned {
        log::warn!("Unable to watch stdin: {}", e);
    }
}

#[derive(Debug, Default, Serialize)]
struct TraceSummary {
    frames: u64,
    received: u64,
    transmitted: u64,
    extended: u64,
    identifiers: usize,
    first_timestamp: Option<f64>,
    last_timestamp: Option<f64>,
    skipped_lines: usize,
}

fn summarize(path: &Path) -> Result<TraceSummary> {
    let mut reader =
        AscReader::open(path).with_context(|| format!("Failed to open trace {:?}", path))?;

    let mut summary = TraceSummary::default();
    let mut identifiers = BTreeSet::new();
    for entry in reader.by_ref() {
        summary.frames += 1;
        match entry.direction {
            Direction::Rx => summary.received += 1,
            Direction::Tx => summary.transmitted += 1,
        }
        if entry.frame.is_extended() {
            summary.extended += 1;
        }
        identifiers.insert(entry.frame.identifier());
        let timestamp = entry.frame.timestamp();
        if summary.first_timestamp.is_none() {
            summary.first_timestamp = Some(timestamp);
        }
        summary.last_timestamp = Some(timestamp);
    }
    summary.identifiers = identifiers.len();
    summary.skipped_lines = reader.skipped_lines();
    Ok(summary)
}

fn trace_info(path: &Path, json: bool) -> Result<()> {
    let summary = summarize(path)?;

    if json {
        println!("{}", serde_json::to_string(&summary)?);
        return Ok(());
    }

    println!("Trace: {:?}", path);
    println!("  Frames:      {} ({} Rx, {} Tx)", summary.frames, summary.received, summary.transmitted);
    println!("  Extended:    {}", summary.extended);
    println!("  Identifiers: {}", summary.identifiers);
    if let (Some(first), Some(last)) = (summary.first_timestamp, summary.last_timestamp) {
        println!("  Span:        {:.6}s .. {:.6}s ({:.3}s)", first, last, last - first);
    }
    println!("  Other lines: {}", summary.skipped_lines);
    Ok(())
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
