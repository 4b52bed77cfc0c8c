//! Terminal presentation of session output
//!
//! Renders flushed frame batches, the ranked volatility table and session
//! summaries, either as aligned text or as one JSON document per line.

use anyhow::Result;
use can_trace_engine::{ChangeLevel, FrameEvent, Progress, RankedEntry, SessionReport};
use serde::Serialize;
use std::io::{self, Write};

/// Shading glyph per change level, none to constant
const SHADES: [char; 7] = [' ', '.', ':', '-', '=', '+', '#'];

#[derive(Debug, Clone)]
pub struct Display {
    pub json: bool,
    pub show_frames: bool,
    pub top: usize,
    pub filter: Option<String>,
}

#[derive(Serialize)]
struct RankingSnapshot<'a> {
    progress: Option<Progress>,
    ranking: &'a [RankedEntry],
}

impl Display {
    /// Print a flushed batch of frame events
    pub fn print_events(&self, events: &[FrameEvent]) -> Result<()> {
        if !self.show_frames || events.is_empty() {
            return Ok(());
        }
        let stdout = io::stdout();
        let mut out = stdout.lock();
        for event in events {
            if self.json {
                serde_json::to_writer(&mut out, event)?;
                writeln!(out)?;
            } else {
                writeln!(out, "{} {}", event.direction, event.frame)?;
            }
        }
        Ok(())
    }

    /// Print the ranked identifier table
    pub fn print_ranking(&self, ranking: &[RankedEntry], progress: Option<Progress>) -> Result<()> {
        let stdout = io::stdout();
        let mut out = stdout.lock();

        if self.json {
            serde_json::to_writer(&mut out, &RankingSnapshot { progress, ranking })?;
            writeln!(out)?;
            return Ok(());
        }

        writeln!(out, "{}", progress_line(progress))?;
        writeln!(out, "{:<10} {:>8} {:>8}  {:<24} {}", "ID", "SCORE", "FRAMES", "DATA", "ACTIVITY")?;
        for entry in ranking {
            writeln!(out, "{}", ranking_row(entry))?;
        }
        writeln!(out)?;
        Ok(())
    }

    pub fn print_report(&self, report: &SessionReport) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(report)?);
            return Ok(());
        }
        println!("\n{} session finished", report.mode);
        println!("  Duration: {:.1}s", duration_secs(report));
        println!("  Frames:   {}", report.frames);
        if report.dropped > 0 {
            println!("  Dropped:  {}", report.dropped);
        }
        if report.loops > 0 {
            println!("  Loops:    {}", report.loops);
        }
        for retry in &report.retries {
            println!("  Retry {}: {}", retry.attempt, retry.cause);
        }
        Ok(())
    }
}

fn duration_secs(report: &SessionReport) -> f64 {
    (report.finished_at - report.started_at).num_milliseconds() as f64 / 1000.0
}

fn progress_line(progress: Option<Progress>) -> String {
    let Some(progress) = progress else {
        return "idle".to_string();
    };
    let mut line = format!("frames {}", progress.frames);
    if progress.dropped > 0 {
        line.push_str(&format!("  dropped {}", progress.dropped));
    }
    if let Some(fraction) = progress.loop_fraction() {
        line.push_str(&format!(
            "  loop {} at {:.0}%",
            progress.loops + 1,
            fraction * 100.0
        ));
    }
    if progress.connection_attempt > 1 {
        line.push_str(&format!("  connection attempt {}", progress.connection_attempt));
    }
    line
}

fn ranking_row(entry: &RankedEntry) -> String {
    let payload: Vec<String> = entry.payload.iter().map(|b| format!("{:02X}", b)).collect();
    format!(
        "{:<10} {:>8.2} {:>8}  {:<24} {}",
        format!("{:08X}", entry.identifier),
        entry.score,
        entry.frame_count,
        payload.join(" "),
        shading(&entry.byte_levels)
    )
}

/// One glyph per payload byte, darker for bytes that change more often
pub fn shading(levels: &[ChangeLevel]) -> String {
    levels
        .iter()
        .map(|level| SHADES[usize::from(level.ordinal())])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shading_per_level() {
        let levels = [ChangeLevel::None, ChangeLevel::Moderate, ChangeLevel::Constant];
        assert_eq!(shading(&levels), " -#");
    }

    #[test]
    fn test_ranking_row_layout() {
        let entry = RankedEntry {
            identifier: 0x18FEF100,
            score: 4.5,
            frame_count: 12,
            payload: vec![0x01, 0xAB],
            byte_rates: vec![0.0, 12.0],
            byte_levels: vec![ChangeLevel::None, ChangeLevel::Constant],
        };
        let row = ranking_row(&entry);
        assert!(row.starts_with("18FEF100"));
        assert!(row.contains("4.50"));
        assert!(row.contains("01 AB"));
        assert!(row.ends_with(" #"));
    }

    #[test]
    fn test_progress_line() {
        assert_eq!(progress_line(None), "idle");
        let progress = Progress {
            frames: 5,
            dropped: 1,
            loops: 0,
            pass_frames: 6,
            trace_frames: 12,
            connection_attempt: 2,
        };
        assert_eq!(
            progress_line(Some(progress)),
            "frames 5  dropped 1  loop 1 at 50%  connection attempt 2"
        );
    }
}
