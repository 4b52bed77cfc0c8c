//! Core types for the CAN trace engine
//!
//! This module defines the frame representation shared by every worker, the
//! direction-tagged events handed to the batching layer, and the error type
//! surfaced by all engine operations.

use crate::transport::TransportError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Wall-clock timestamp type used in session reports
pub type Timestamp = DateTime<Utc>;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Maximum payload length of a classic CAN frame
pub const MAX_PAYLOAD_LEN: usize = 8;

/// Highest identifier that fits the 11-bit standard format
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// Mask for the 29-bit extended identifier range
pub const EXTENDED_ID_MASK: u32 = 0x1FFF_FFFF;

/// A single CAN frame with its capture timestamp
///
/// Frames are immutable once constructed. They are produced by a transport
/// (capture/monitor) or by the trace store (replay).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Timestamp in seconds (monotonic from the transport, or as stored in the trace)
    timestamp: f64,
    /// CAN identifier (11-bit or 29-bit)
    identifier: u32,
    /// True if the identifier uses the extended (29-bit) form
    extended: bool,
    /// Payload bytes (0-8)
    data: Vec<u8>,
}

impl Frame {
    /// Create a new frame
    ///
    /// Identifiers above 0x7FF are flagged as extended. Fails if the payload is
    /// longer than 8 bytes or the identifier does not fit in 29 bits.
    pub fn new(timestamp: f64, identifier: u32, data: impl Into<Vec<u8>>) -> Result<Self> {
        Self::with_format(timestamp, identifier, identifier > MAX_STANDARD_ID, data)
    }

    /// Create a new frame with an explicit identifier format
    pub fn with_format(
        timestamp: f64,
        identifier: u32,
        extended: bool,
        data: impl Into<Vec<u8>>,
    ) -> Result<Self> {
        let data = data.into();
        if data.len() > MAX_PAYLOAD_LEN {
            return Err(EngineError::InvalidFrame(format!(
                "payload of {} bytes exceeds {} bytes (ID 0x{:X})",
                data.len(),
                MAX_PAYLOAD_LEN,
                identifier
            )));
        }
        if identifier > EXTENDED_ID_MASK || (!extended && identifier > MAX_STANDARD_ID) {
            return Err(EngineError::InvalidFrame(format!(
                "identifier 0x{:X} out of range for {} format",
                identifier,
                if extended { "extended" } else { "standard" }
            )));
        }
        Ok(Self {
            timestamp,
            identifier,
            extended,
            data,
        })
    }

    /// Timestamp in seconds
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// CAN identifier
    pub fn identifier(&self) -> u32 {
        self.identifier
    }

    /// True if this frame carries an extended (29-bit) identifier
    pub fn is_extended(&self) -> bool {
        self.extended
    }

    /// Payload bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Data length code - number of payload bytes
    pub fn dlc(&self) -> usize {
        self.data.len()
    }

    /// Return a copy of this frame with a different payload
    ///
    /// Used by frame modifiers; identifier and timestamp are preserved.
    pub fn with_data(&self, data: impl Into<Vec<u8>>) -> Result<Self> {
        Self::with_format(self.timestamp, self.identifier, self.extended, data)
    }

    /// Return a copy of this frame with a different timestamp
    pub fn with_timestamp(&self, timestamp: f64) -> Self {
        Self {
            timestamp,
            ..self.clone()
        }
    }

    /// Return a copy with the timestamp rounded to whole microseconds, the
    /// resolution a trace line stores
    pub fn rounded_to_micros(&self) -> Self {
        self.with_timestamp((self.timestamp * 1e6).round() / 1e6)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6} {:08X}", self.timestamp, self.identifier)?;
        if self.extended {
            write!(f, "x")?;
        }
        write!(f, " [{}]", self.dlc())?;
        for byte in &self.data {
            write!(f, " {:02X}", byte)?;
        }
        Ok(())
    }
}

/// Direction of a frame relative to this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Received from the bus (capture, monitor)
    Rx,
    /// Transmitted onto the bus (replay)
    Tx,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Rx => write!(f, "Rx"),
            Direction::Tx => write!(f, "Tx"),
        }
    }
}

/// A direction-tagged frame handed to the batching layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameEvent {
    pub direction: Direction,
    pub frame: Frame,
}

/// Operating mode of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Idle,
    Capturing,
    Replaying,
    Monitoring,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Idle => write!(f, "Idle"),
            Mode::Capturing => write!(f, "Capturing"),
            Mode::Replaying => write!(f, "Replaying"),
            Mode::Monitoring => write!(f, "Monitoring"),
        }
    }
}

/// One recorded connection-level retry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRecord {
    /// Attempt number that failed (1-based)
    pub attempt: u32,
    /// Underlying transport failure
    pub cause: TransportError,
}

/// Errors that can occur in the engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Trace file not found: {0:?}")]
    TraceNotFound(PathBuf),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport failure: {0}")]
    Transport(TransportError),

    #[error("Gave up after {attempts} connection attempts, last error: {last}")]
    RetriesExhausted {
        /// Total number of connection attempts made
        attempts: u32,
        /// Last underlying transport failure
        last: TransportError,
        /// Every failed attempt, in order
        history: Vec<RetryRecord>,
    },

    #[error("Worker thread panicked: {0}")]
    WorkerPanicked(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl EngineError {
    /// True if this error was produced after exhausting connection retries,
    /// as opposed to an immediate fatal fault
    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self, EngineError::RetriesExhausted { .. })
    }
}

impl From<TransportError> for EngineError {
    fn from(err: TransportError) -> Self {
        EngineError::Transport(err)
    }
}
