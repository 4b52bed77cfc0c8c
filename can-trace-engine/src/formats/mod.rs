//! Trace store
//!
//! Sequential on-disk storage of frames. Writing is append-only; reading is a
//! lazy, restartable iteration (each call reopens the file and starts from the
//! first line). Malformed lines are skipped so partial or damaged traces still
//! play as far as possible.

use crate::types::{Direction, Frame, Result};
use std::path::Path;

pub mod asc;

pub use asc::{AscReader, AscWriter};

/// A frame plus the metadata stored alongside it in the trace
#[derive(Debug, Clone, PartialEq)]
pub struct TraceEntry {
    pub frame: Frame,
    pub channel: u8,
    pub direction: Direction,
}

/// Lazy sequence of frames read from a trace
pub type TraceFrames = std::iter::Map<AscReader, fn(TraceEntry) -> Frame>;

/// Create a trace file for writing (truncates an existing file)
pub fn open_for_write(path: &Path, channel: u8) -> Result<AscWriter> {
    AscWriter::create(path, channel)
}

/// Iterate the frames of a trace from the beginning
///
/// Fails with [`EngineError::TraceNotFound`](crate::EngineError::TraceNotFound)
/// if the path does not exist.
pub fn iterate(path: &Path) -> Result<TraceFrames> {
    let reader = AscReader::open(path)?;
    Ok(reader.map(entry_frame as fn(TraceEntry) -> Frame))
}

fn entry_frame(entry: TraceEntry) -> Frame {
    entry.frame
}

/// Count the frames in a trace by scanning it fully
///
/// Used for progress estimation only; any failure yields 0.
pub fn count(path: &Path) -> u64 {
    match AscReader::open(path) {
        Ok(reader) => reader.count() as u64,
        Err(e) => {
            log::warn!("Unable to count frames in {:?}: {}", path, e);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EngineError;
    use std::io::Write;

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::new(0.0, 0x18FEE500, vec![0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0, 0]).unwrap(),
            Frame::new(0.010000, 0x123, vec![0xAA, 0xBB]).unwrap(),
            Frame::new(0.0205, 0x0CF00300, vec![]).unwrap(),
            Frame::with_format(1.234567, 0x42, true, vec![1, 2, 3, 4, 5, 6, 7, 8]).unwrap(),
        ]
    }

    #[test]
    fn test_write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.asc");

        let frames = sample_frames();
        {
            let mut writer = open_for_write(&path, 1).unwrap();
            for frame in &frames {
                writer.append(frame, Direction::Rx).unwrap();
            }
            assert_eq!(writer.frames_written(), frames.len() as u64);
            writer.finish().unwrap();
        }

        let read: Vec<Frame> = iterate(&path).unwrap().collect();
        assert_eq!(read, frames);
        assert_eq!(count(&path), frames.len() as u64);
    }

    #[test]
    fn test_iterate_is_restartable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loop.asc");
        let mut writer = open_for_write(&path, 1).unwrap();
        for frame in sample_frames() {
            writer.append(&frame, Direction::Rx).unwrap();
        }
        drop(writer);

        let first: Vec<Frame> = iterate(&path).unwrap().collect();
        let second: Vec<Frame> = iterate(&path).unwrap().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_malformed_line_between_valid_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("damaged.asc");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, " 0.000000 1  00000123 Rx   d 2 AA BB").unwrap();
        writeln!(file, " 0.0@0000 1  0000012 garbage").unwrap();
        writeln!(file, " 0.010000 1  00000123 Rx   d 2 AA CC").unwrap();
        drop(file);

        let frames: Vec<Frame> = iterate(&path).unwrap().collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].data(), &[0xAA, 0xCC]);
    }

    #[test]
    fn test_missing_trace() {
        let result = iterate(Path::new("nonexistent.asc"));
        assert!(matches!(result, Err(EngineError::TraceNotFound(_))));
        assert_eq!(count(Path::new("nonexistent.asc")), 0);
    }

    #[test]
    fn test_unfinished_trace_is_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crashed.asc");
        let mut writer = open_for_write(&path, 1).unwrap();
        writer.append(&sample_frames()[0], Direction::Rx).unwrap();
        // Simulate a crash: the footer is never written
        std::mem::forget(writer);

        assert_eq!(count(&path), 1);
    }
}
