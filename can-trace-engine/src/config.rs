//! Session configuration types
//!
//! One configuration struct per worker mode plus the link settings they share.
//! All of them deserialize with sensible defaults so an application can load
//! partial configurations from a file and override individual fields.

use crate::types::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Supported bus bitrates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Bitrate {
    #[serde(rename = "125k")]
    Kbps125,
    #[serde(rename = "250k")]
    Kbps250,
    #[serde(rename = "500k")]
    Kbps500,
    #[serde(rename = "1M")]
    Mbps1,
}

impl Bitrate {
    /// All selectable bitrates, slowest first
    pub const ALL: [Bitrate; 4] = [
        Bitrate::Kbps125,
        Bitrate::Kbps250,
        Bitrate::Kbps500,
        Bitrate::Mbps1,
    ];

    /// Bitrate in bits per second
    pub fn bits_per_second(self) -> u32 {
        match self {
            Bitrate::Kbps125 => 125_000,
            Bitrate::Kbps250 => 250_000,
            Bitrate::Kbps500 => 500_000,
            Bitrate::Mbps1 => 1_000_000,
        }
    }
}

impl Default for Bitrate {
    /// J1939 networks run at 250 kbit/s
    fn default() -> Self {
        Bitrate::Kbps250
    }
}

impl fmt::Display for Bitrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bitrate::Kbps125 => write!(f, "125k"),
            Bitrate::Kbps250 => write!(f, "250k"),
            Bitrate::Kbps500 => write!(f, "500k"),
            Bitrate::Mbps1 => write!(f, "1M"),
        }
    }
}

impl FromStr for Bitrate {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "125k" | "125000" => Ok(Bitrate::Kbps125),
            "250k" | "250000" => Ok(Bitrate::Kbps250),
            "500k" | "500000" => Ok(Bitrate::Kbps500),
            "1m" | "1000k" | "1000000" => Ok(Bitrate::Mbps1),
            other => Err(EngineError::InvalidConfig(format!(
                "unsupported bitrate '{}' (expected one of 125k, 250k, 500k, 1M)",
                other
            ))),
        }
    }
}

/// How replay schedules frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CadenceMode {
    /// Reproduce the inter-frame gaps recorded in the trace
    #[default]
    OriginalTiming,
    /// Wait a constant interval before every frame
    FixedInterval,
}

impl FromStr for CadenceMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "original" | "original_timing" => Ok(CadenceMode::OriginalTiming),
            "fixed" | "fixed_interval" => Ok(CadenceMode::FixedInterval),
            other => Err(EngineError::InvalidConfig(format!(
                "unknown cadence mode '{}' (expected 'original' or 'fixed')",
                other
            ))),
        }
    }
}

/// Channel settings shared by every mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Channel/interface name passed to the connector (e.g. "can0")
    #[serde(default = "default_channel")]
    pub channel: String,

    #[serde(default)]
    pub bitrate: Bitrate,

    /// Bound on each blocking receive in milliseconds (default: 100ms)
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_ms: u64,
}

fn default_channel() -> String {
    "can0".to_string()
}

fn default_receive_timeout() -> u64 {
    100
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            bitrate: Bitrate::default(),
            receive_timeout_ms: default_receive_timeout(),
        }
    }
}

impl LinkConfig {
    pub fn new(channel: impl Into<String>, bitrate: Bitrate) -> Self {
        Self {
            channel: channel.into(),
            bitrate,
            ..Self::default()
        }
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    fn validate(&self) -> crate::Result<()> {
        if self.receive_timeout_ms == 0 {
            return Err(EngineError::InvalidConfig(
                "receive timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for a capture session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub link: LinkConfig,

    /// Trace file to create
    pub output: PathBuf,

    /// Channel number written into each trace line
    #[serde(default = "default_trace_channel")]
    pub trace_channel: u8,
}

fn default_trace_channel() -> u8 {
    1
}

impl CaptureConfig {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            link: LinkConfig::default(),
            output: output.into(),
            trace_channel: default_trace_channel(),
        }
    }

    /// Builder method: set link settings
    pub fn with_link(mut self, link: LinkConfig) -> Self {
        self.link = link;
        self
    }

    pub fn validate(&self) -> crate::Result<()> {
        self.link.validate()
    }
}

/// Configuration for a passive monitor session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub link: LinkConfig,
}

impl MonitorConfig {
    pub fn new(link: LinkConfig) -> Self {
        Self { link }
    }

    pub fn validate(&self) -> crate::Result<()> {
        self.link.validate()
    }
}

/// Configuration for a replay session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayConfig {
    #[serde(default)]
    pub link: LinkConfig,

    /// Trace file to play back
    pub trace: PathBuf,

    #[serde(default)]
    pub cadence: CadenceMode,

    /// Interval used in fixed-cadence mode, in microseconds (default: 10ms)
    #[serde(default = "default_fixed_interval")]
    pub fixed_interval_us: u64,

    /// Discard frames instead of transmitting; no transport is opened
    #[serde(default)]
    pub offline: bool,

    /// Total connection attempts before giving up (default: 5)
    #[serde(default = "default_max_connection_retries")]
    pub max_connection_retries: u32,

    /// Backoff between connection attempts in milliseconds (default: 1000ms)
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,

    /// Send attempts per frame before it is dropped (default: 2)
    #[serde(default = "default_send_attempts")]
    pub send_attempts: u32,

    /// Stop after this many passes over the trace (default: loop until stopped)
    #[serde(default)]
    pub max_loops: Option<u64>,
}

fn default_fixed_interval() -> u64 {
    10_000
}

fn default_max_connection_retries() -> u32 {
    5
}

fn default_reconnect_delay() -> u64 {
    1000
}

fn default_send_attempts() -> u32 {
    2
}

impl ReplayConfig {
    /// Create a replay configuration with default settings
    pub fn new(trace: impl Into<PathBuf>) -> Self {
        Self {
            link: LinkConfig::default(),
            trace: trace.into(),
            cadence: CadenceMode::default(),
            fixed_interval_us: default_fixed_interval(),
            offline: false,
            max_connection_retries: default_max_connection_retries(),
            reconnect_delay_ms: default_reconnect_delay(),
            send_attempts: default_send_attempts(),
            max_loops: None,
        }
    }

    /// Builder method: set link settings
    pub fn with_link(mut self, link: LinkConfig) -> Self {
        self.link = link;
        self
    }

    /// Builder method: replay with the trace's own timing
    pub fn with_original_timing(mut self) -> Self {
        self.cadence = CadenceMode::OriginalTiming;
        self
    }

    /// Builder method: replay at a constant interval
    pub fn with_fixed_interval(mut self, interval: Duration) -> Self {
        self.cadence = CadenceMode::FixedInterval;
        self.fixed_interval_us = interval.as_micros() as u64;
        self
    }

    /// Builder method: enable or disable offline (test) mode
    pub fn with_offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    /// Builder method: set connection retry policy
    pub fn with_connection_retries(mut self, max_attempts: u32, delay: Duration) -> Self {
        self.max_connection_retries = max_attempts;
        self.reconnect_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Builder method: set per-frame send attempts
    pub fn with_send_attempts(mut self, attempts: u32) -> Self {
        self.send_attempts = attempts;
        self
    }

    /// Builder method: bound the number of passes over the trace
    pub fn with_max_loops(mut self, loops: u64) -> Self {
        self.max_loops = Some(loops);
        self
    }

    pub fn fixed_interval(&self) -> Duration {
        Duration::from_micros(self.fixed_interval_us)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Check the configuration and that the trace exists
    ///
    /// A missing trace is reported here, before any worker starts.
    pub fn validate(&self) -> crate::Result<()> {
        self.link.validate()?;
        if self.max_connection_retries == 0 {
            return Err(EngineError::InvalidConfig(
                "max_connection_retries must be at least 1".to_string(),
            ));
        }
        if self.send_attempts == 0 {
            return Err(EngineError::InvalidConfig(
                "send_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_loops == Some(0) {
            return Err(EngineError::InvalidConfig(
                "max_loops must be at least 1 when set".to_string(),
            ));
        }
        check_trace_exists(&self.trace)
    }
}

fn check_trace_exists(path: &Path) -> crate::Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(EngineError::TraceNotFound(path.to_path_buf()))
    }
}

/// Settings for the event batching layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Flush cadence in milliseconds (default: 100ms)
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,
}

fn default_flush_interval() -> u64 {
    100
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval(),
        }
    }
}

impl BatchConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}
