//! Transport boundary
//!
//! The hardware adapter is an opaque transport: connect, send one frame,
//! receive one frame with a bounded timeout, disconnect. Implementations live
//! outside this crate (the CLI provides SocketCAN on Linux; tests provide
//! scripted mocks).
//!
//! Failures carry a structured [`TransportErrorKind`] set by the transport
//! itself, so the engine never has to inspect error text to decide whether a
//! failure is worth retrying.

use crate::config::Bitrate;
use crate::types::Frame;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Classification of a transport failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportErrorKind {
    /// Operation did not complete in time
    Timeout,
    /// USB-class I/O failure on the adapter
    UsbIo,
    /// Controller went bus-off after excessive errors
    BusOff,
    /// Access to the device was denied
    PermissionDenied,
    /// The requested channel/device does not exist
    DeviceNotFound,
    /// The transport handle has already been released
    Closed,
    /// Any other failure
    Other,
}

impl TransportErrorKind {
    /// True for failures that a retry or reconnect can recover from
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            TransportErrorKind::Timeout | TransportErrorKind::UsbIo | TransportErrorKind::BusOff
        )
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::UsbIo => "USB I/O error",
            TransportErrorKind::BusOff => "bus-off",
            TransportErrorKind::PermissionDenied => "permission denied",
            TransportErrorKind::DeviceNotFound => "device not found",
            TransportErrorKind::Closed => "transport closed",
            TransportErrorKind::Other => "transport error",
        };
        write!(f, "{}", name)
    }
}

/// A failure reported by the transport boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn closed() -> Self {
        Self::new(TransportErrorKind::Closed, "transport handle released")
    }

    /// True if a retry or reconnect can recover from this failure
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// An open connection to a CAN channel
///
/// A transport is owned by exactly one worker at a time.
pub trait Transport: Send {
    /// Transmit one frame
    fn send(&mut self, frame: &Frame) -> Result<(), TransportError>;

    /// Block for at most `timeout` waiting for a frame
    ///
    /// Returns `Ok(None)` when the timeout elapses without traffic.
    fn receive(&mut self, timeout: Duration) -> Result<Option<Frame>, TransportError>;

    /// Release the underlying device
    ///
    /// Must be safe to call more than once.
    fn close(&mut self);
}

/// Factory for transports
pub trait Connector: Send + Sync {
    /// Open a channel at the given bitrate
    ///
    /// In listen-only mode the transport must never put anything on the bus,
    /// acknowledgements included.
    fn connect(
        &self,
        channel: &str,
        bitrate: Bitrate,
        listen_only: bool,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

impl<F> Connector for F
where
    F: Fn(&str, Bitrate, bool) -> Result<Box<dyn Transport>, TransportError> + Send + Sync,
{
    fn connect(
        &self,
        channel: &str,
        bitrate: Bitrate,
        listen_only: bool,
    ) -> Result<Box<dyn Transport>, TransportError> {
        self(channel, bitrate, listen_only)
    }
}
