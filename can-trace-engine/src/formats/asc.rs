//! ASC-style text trace format
//!
//! One frame per line:
//!
//! ```text
//!  12.345678 1  18FEE500x Rx   d 8 FF FF FF FF 00 00 00 00
//! ```
//!
//! Fields are timestamp (seconds, 6 decimals), channel, identifier (8
//! uppercase hex digits, `x` suffix for extended IDs), direction, the `d`
//! data marker, DLC and the payload bytes. Writers add the usual ASC header
//! and footer; readers skip every line that does not parse as a frame, so
//! headers, footers and corrupt lines never abort playback.

use super::TraceEntry;
use crate::types::{Direction, EngineError, Frame, Result, MAX_PAYLOAD_LEN};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Lines, Write};
use std::path::{Path, PathBuf};

/// Appends frames to a trace file
///
/// Every append is flushed so a crash never loses more than the frame being
/// written.
pub struct AscWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    channel: u8,
    frames_written: u64,
    finished: bool,
}

impl AscWriter {
    /// Create (or truncate) a trace file and write the ASC header
    pub fn create(path: &Path, channel: u8) -> Result<Self> {
        log::info!("Creating trace file: {:?}", path);

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let now = chrono::Local::now();
        writeln!(writer, "date {}", now.format("%a %b %d %H:%M:%S%.3f %Y"))?;
        writeln!(writer, "base hex  timestamps absolute")?;
        writeln!(writer, "internal events logged")?;
        writeln!(writer, "Begin Triggerblock {}", now.format("%a %b %d %H:%M:%S%.3f %Y"))?;
        writeln!(writer, " 0.000000 Start of measurement")?;
        writer.flush()?;

        Ok(Self {
            path: path.to_path_buf(),
            writer,
            channel,
            frames_written: 0,
            finished: false,
        })
    }

    /// Append one frame
    pub fn append(&mut self, frame: &Frame, direction: Direction) -> Result<()> {
        writeln!(self.writer, "{}", format_line(frame, self.channel, direction))?;
        self.writer.flush()?;
        self.frames_written += 1;
        Ok(())
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the footer and flush
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        writeln!(self.writer, "End TriggerBlock")?;
        self.writer.flush()?;
        log::info!(
            "Trace file closed: {:?} ({} frames)",
            self.path,
            self.frames_written
        );
        Ok(())
    }
}

impl Drop for AscWriter {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            log::warn!("Failed to finalise trace file {:?}: {}", self.path, e);
        }
    }
}

/// Lazily reads frames from a trace file
pub struct AscReader {
    lines: Lines<BufReader<File>>,
    line_number: usize,
    skipped: usize,
}

impl AscReader {
    /// Open a trace file for reading from the start
    pub fn open(path: &Path) -> Result<Self> {
        log::debug!("Opening trace file: {:?}", path);

        let file = File::open(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => EngineError::TraceNotFound(path.to_path_buf()),
            _ => EngineError::IoError(e),
        })?;

        Ok(Self {
            lines: BufReader::new(file).lines(),
            line_number: 0,
            skipped: 0,
        })
    }

    /// Number of non-frame lines skipped so far
    pub fn skipped_lines(&self) -> usize {
        self.skipped
    }
}

impl Iterator for AscReader {
    type Item = TraceEntry;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => {
                    log::warn!("Trace read aborted at line {}: {}", self.line_number + 1, e);
                    return None;
                }
            };
            self.line_number += 1;

            match parse_line(&line) {
                Some(entry) => return Some(entry),
                None => {
                    if !line.trim().is_empty() {
                        log::trace!("Skipping line {}: {:?}", self.line_number, line);
                    }
                    self.skipped += 1;
                }
            }
        }
    }
}

/// Render a frame as one trace line (without newline)
pub fn format_line(frame: &Frame, channel: u8, direction: Direction) -> String {
    let mut line = format!(
        " {:.6} {}  {:08X}{} {}   d {}",
        frame.timestamp(),
        channel,
        frame.identifier(),
        if frame.is_extended() { "x" } else { "" },
        direction,
        frame.dlc()
    );
    for byte in frame.data() {
        line.push_str(&format!(" {:02X}", byte));
    }
    line
}

/// Parse one trace line, returning `None` for anything that is not a frame
pub fn parse_line(line: &str) -> Option<TraceEntry> {
    let mut fields = line.split_whitespace();

    let timestamp: f64 = fields.next()?.parse().ok()?;
    if !timestamp.is_finite() {
        return None;
    }

    let channel: u8 = fields.next()?.parse().ok()?;

    let id_field = fields.next()?;
    let (id_digits, extended) = match id_field.strip_suffix(|c: char| c == 'x' || c == 'X') {
        Some(digits) => (digits, true),
        None => (id_field, false),
    };
    if id_digits.is_empty() || id_digits.len() > 8 || !is_hex(id_digits) {
        return None;
    }
    let identifier = u32::from_str_radix(id_digits, 16).ok()?;

    let direction = match fields.next()? {
        "Rx" => Direction::Rx,
        "Tx" => Direction::Tx,
        _ => return None,
    };

    if fields.next()? != "d" {
        return None;
    }

    let dlc: usize = fields.next()?.parse().ok()?;
    if dlc > MAX_PAYLOAD_LEN {
        return None;
    }

    let mut data = Vec::with_capacity(dlc);
    for _ in 0..dlc {
        let byte = fields.next()?;
        if byte.len() != 2 || !is_hex(byte) {
            return None;
        }
        data.push(u8::from_str_radix(byte, 16).ok()?);
    }

    let frame = if extended {
        Frame::with_format(timestamp, identifier, true, data)
    } else {
        Frame::new(timestamp, identifier, data)
    }
    .ok()?;

    Some(TraceEntry {
        frame,
        channel,
        direction,
    })
}

fn is_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_hexdigit())
}
