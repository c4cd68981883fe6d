//! Configuration loading and validation.
//!
//! Settings come from a JSON file, then `FOX_*` environment variables
//! override individual fields, then everything is validated. Any failure is
//! fatal at startup; the relay never runs on a half-valid config.

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::constants::MIN_OUTBOUND_QUEUE_DEPTH;
use crate::framer::DEFAULT_MAX_LINE_BYTES;
use crate::registry::DuplicatePolicy;
use crate::store::DEFAULT_MAX_MESSAGES;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/fox.json";

/// Amateur radio callsign with optional SSID, e.g. `W1ABC-1`.
///
/// One or two prefix letters, one digit, one to four suffix letters.
static CALLSIGN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Z]{1,2}\d[A-Z]{1,4}(-\d{1,2})?$").expect("callsign regex is valid")
});

/// Configuration for the relay.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Callsign (with SSID) the relay registers and announces.
    pub callsign: String,
    /// Host running Direwolf's AGWPE server.
    #[serde(default = "default_direwolf_host")]
    pub direwolf_host: String,
    /// AGWPE TCP port.
    #[serde(default = "default_direwolf_port")]
    pub direwolf_port: u32,
    /// Direwolf radio channel to listen on.
    #[serde(default)]
    pub radio_port: u32,
    /// Number of messages kept for new arrivals.
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    /// Maximum bytes buffered for one unterminated line.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    /// Seconds a single write may take before the session is dropped.
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
    /// Pending outbound chunks per session before it counts as stalled.
    #[serde(default = "default_outbound_queue_depth")]
    pub outbound_queue_depth: usize,
    /// Handling of a second connection from an already connected station.
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,
}

fn default_direwolf_host() -> String {
    "localhost".to_string()
}

fn default_direwolf_port() -> u32 {
    8000
}

fn default_max_messages() -> usize {
    DEFAULT_MAX_MESSAGES
}

fn default_max_line_bytes() -> usize {
    DEFAULT_MAX_LINE_BYTES
}

fn default_write_timeout_secs() -> u64 {
    30
}

fn default_outbound_queue_depth() -> usize {
    64
}

impl Config {
    /// Build a config with defaults for everything but the callsign.
    pub fn new(callsign: impl Into<String>) -> Self {
        Self {
            callsign: callsign.into(),
            direwolf_host: default_direwolf_host(),
            direwolf_port: default_direwolf_port(),
            radio_port: 0,
            max_messages: default_max_messages(),
            max_line_bytes: default_max_line_bytes(),
            write_timeout_secs: default_write_timeout_secs(),
            outbound_queue_depth: default_outbound_queue_depth(),
            duplicate_policy: DuplicatePolicy::default(),
        }
    }

    /// Load from `path`, apply environment overrides, and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Configuration file not found: {}", path.display()))?;
        let mut config = Self::from_json(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document without env overrides or validation.
    pub fn from_json(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            bail!("Configuration file is empty");
        }
        serde_json::from_str(content).context("Invalid configuration file")
    }

    /// Apply `FOX_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup.
    ///
    /// Unparseable numeric values are ignored, leaving the file value.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(callsign) = lookup("FOX_CALLSIGN") {
            self.callsign = callsign;
        }

        if let Some(host) = lookup("FOX_DIREWOLF_HOST") {
            self.direwolf_host = host;
        }

        if let Some(port) = lookup("FOX_DIREWOLF_PORT") {
            if let Ok(port) = port.parse::<u32>() {
                self.direwolf_port = port;
            }
        }

        if let Some(port) = lookup("FOX_RADIO_PORT") {
            if let Ok(port) = port.parse::<u32>() {
                self.radio_port = port;
            }
        }

        if let Some(max) = lookup("FOX_MAX_MESSAGES") {
            if let Ok(max) = max.parse::<usize>() {
                self.max_messages = max;
            }
        }
    }

    /// Normalize and check every field.
    pub fn validate(&mut self) -> Result<()> {
        self.callsign = self.callsign.trim().to_uppercase();
        if !is_valid_callsign(&self.callsign) {
            bail!(
                "Invalid callsign format: {}. Must be a valid amateur radio callsign \
                 with optional SSID (e.g., W1ABC-1)",
                self.callsign
            );
        }

        if !(1..=65535).contains(&self.direwolf_port) {
            bail!(
                "Invalid Direwolf port: {}. Must be between 1-65535",
                self.direwolf_port
            );
        }

        if self.radio_port > 255 {
            bail!("Invalid radio port: {}. Must be between 0-255", self.radio_port);
        }

        if self.max_line_bytes == 0 {
            bail!("Invalid max_line_bytes: must be > 0");
        }

        if self.write_timeout_secs == 0 {
            bail!("Invalid write_timeout_secs: must be > 0");
        }

        if self.outbound_queue_depth < MIN_OUTBOUND_QUEUE_DEPTH {
            bail!(
                "Invalid outbound_queue_depth: {}. Must be at least {MIN_OUTBOUND_QUEUE_DEPTH}",
                self.outbound_queue_depth
            );
        }

        Ok(())
    }

    /// Write timeout as a `Duration`.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

/// Check a callsign (case-insensitive) against the amateur format.
pub fn is_valid_callsign(callsign: &str) -> bool {
    CALLSIGN_RE.is_match(&callsign.to_uppercase())
}
