//! Configuration loading and parsing

use anyhow::{Context, Result};
use can_trace_engine::{BatchConfig, Bitrate, CadenceMode, LinkConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Application configuration (loaded from config.toml)
///
/// Every section is optional; command-line flags override what is set here.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub replay: ReplaySection,
    #[serde(default)]
    pub capture: CaptureSection,
    #[serde(default)]
    pub display: DisplaySection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplaySection {
    #[serde(default)]
    pub cadence: CadenceMode,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_max_connection_retries")]
    pub max_connection_retries: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_send_attempts")]
    pub send_attempts: u32,
    #[serde(default)]
    pub loops: Option<u64>,
}

fn default_interval_ms() -> u64 {
    10
}

fn default_max_connection_retries() -> u32 {
    5
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_send_attempts() -> u32 {
    2
}

impl Default for ReplaySection {
    fn default() -> Self {
        Self {
            cadence: CadenceMode::default(),
            interval_ms: default_interval_ms(),
            max_connection_retries: default_max_connection_retries(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            send_attempts: default_send_attempts(),
            loops: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureSection {
    /// Channel number written into trace lines
    #[serde(default = "default_trace_channel")]
    pub trace_channel: u8,
}

fn default_trace_channel() -> u8 {
    1
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            trace_channel: default_trace_channel(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DisplaySection {
    /// Number of ranked identifiers shown per refresh
    #[serde(default = "default_top")]
    pub top: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_refresh_ms")]
    pub refresh_ms: u64,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

fn default_top() -> usize {
    20
}

fn default_flush_interval_ms() -> u64 {
    100
}

fn default_refresh_ms() -> u64 {
    1000
}

fn default_stop_grace_ms() -> u64 {
    2000
}

impl Default for DisplaySection {
    fn default() -> Self {
        Self {
            top: default_top(),
            flush_interval_ms: default_flush_interval_ms(),
            refresh_ms: default_refresh_ms(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

impl DisplaySection {
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            flush_interval_ms: self.flush_interval_ms,
        }
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    if config.display.flush_interval_ms == 0 {
        anyhow::bail!("display.flush_interval_ms must be greater than zero");
    }

    Ok(config)
}

/// Apply `--channel`/`--bitrate` overrides to the configured link
pub fn link_with_overrides(
    base: &LinkConfig,
    channel: Option<&str>,
    bitrate: Option<Bitrate>,
) -> LinkConfig {
    let mut link = base.clone();
    if let Some(channel) = channel {
        link.channel = channel.to_string();
    }
    if let Some(bitrate) = bitrate {
        link.bitrate = bitrate;
    }
    link
}
