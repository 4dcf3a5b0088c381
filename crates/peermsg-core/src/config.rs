//! Node configuration
//!
//! Loaded from `config.json` in the data directory. Every field has a
//! default, so a missing file or a partial file is fine.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PeerError, PeerResult};

/// Config file name inside a data directory
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Default number of message ids announced in a `have` frame
pub const DEFAULT_HAVE_LIMIT: usize = 200;

/// Runtime settings for a messenger node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Relay WebSocket URL; reconnection is disabled without one
    pub signaling_url: Option<String>,
    /// Backoff floor in milliseconds
    pub reconnect_min_ms: u64,
    /// Backoff ceiling in milliseconds
    pub reconnect_max_ms: u64,
    /// Multiplier applied after each failed attempt
    pub backoff_factor: u32,
    /// How many recent ids a `have` frame carries
    pub have_limit: usize,
    /// Address the transport listens on for incoming channels
    pub listen_addr: String,
    /// How long a negotiation may take before it is failed
    pub negotiation_timeout_ms: u64,
    /// Name announced in invite codes
    pub display_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling_url: None,
            reconnect_min_ms: 1_500,
            reconnect_max_ms: 15_000,
            backoff_factor: 2,
            have_limit: DEFAULT_HAVE_LIMIT,
            listen_addr: "127.0.0.1:0".to_string(),
            negotiation_timeout_ms: 20_000,
            display_name: "Me".to_string(),
        }
    }
}

impl Config {
    /// Load `config.json` from `data_dir`, falling back to defaults if absent.
    pub fn load(data_dir: impl AsRef<Path>) -> PeerResult<Self> {
        let path = data_dir.as_ref().join(CONFIG_FILE_NAME);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| PeerError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write as pretty JSON to `config.json` in `data_dir`.
    pub fn save(&self, data_dir: impl AsRef<Path>) -> PeerResult<()> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| PeerError::Serialization(e.to_string()))?;
        std::fs::write(data_dir.join(CONFIG_FILE_NAME), text)?;
        Ok(())
    }

    /// Reject settings the backoff and gossip code cannot work with.
    pub fn validate(&self) -> PeerResult<()> {
        if self.reconnect_min_ms == 0 {
            return Err(PeerError::Config("reconnect_min_ms must be positive".into()));
        }
        if self.reconnect_max_ms < self.reconnect_min_ms {
            return Err(PeerError::Config(
                "reconnect_max_ms must not be below reconnect_min_ms".into(),
            ));
        }
        if self.backoff_factor < 1 {
            return Err(PeerError::Config("backoff_factor must be at least 1".into()));
        }
        if self.have_limit == 0 {
            return Err(PeerError::Config("have_limit must be positive".into()));
        }
        Ok(())
    }

    /// Backoff floor
    pub fn reconnect_min(&self) -> Duration {
        Duration::from_millis(self.reconnect_min_ms)
    }

    /// Backoff ceiling
    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    /// Negotiation deadline
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }
}
