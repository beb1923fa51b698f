//! Session configuration
//!
//! Stored as a JSON file. Missing fields fall back to their defaults so a
//! config can name only what it changes.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::protocol::frame::DEFAULT_MAX_BUFFER_LEN;
use crate::protocol::{EngineConfig, ProtocolError, RequestSelection, DEFAULT_BAUD_RATE};

/// Errors loading or interpreting a configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid register selection: {0}")]
    Selection(#[from] ProtocolError),
}

/// Consult session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsultConfig {
    /// Serial port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub port_name: String,

    /// Line speed
    pub baud_rate: u32,

    /// Register names to poll; empty selects the default dashboard set
    pub registers: Vec<String>,

    /// Period of the automatic trouble code read, disabled when unset
    pub dtc_interval_ms: Option<u64>,

    /// Bound on buffered reply bytes that have not formed a frame
    pub max_buffer_len: usize,

    /// Size of a single transport read
    pub read_chunk_size: usize,
}

impl Default for ConsultConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            registers: Vec::new(),
            dtc_interval_ms: None,
            max_buffer_len: DEFAULT_MAX_BUFFER_LEN,
            read_chunk_size: 256,
        }
    }
}

impl ConsultConfig {
    /// Load a configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("Loading config from {}", path.display());
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        // Surface bad register names at load time rather than at connect
        config.selection()?;
        Ok(config)
    }

    /// Write the configuration as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Registers to poll
    pub fn selection(&self) -> Result<RequestSelection, ProtocolError> {
        if self.registers.is_empty() {
            Ok(RequestSelection::default_dashboard())
        } else {
            RequestSelection::from_names(&self.registers)
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_buffer_len: self.max_buffer_len,
        }
    }

    pub fn dtc_interval(&self) -> Option<Duration> {
        self.dtc_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}
