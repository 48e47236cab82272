use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::scrub::DEFAULT_SCRUB_MARKER;
use crate::writer::WRITE_CHUNK_SIZE;
use crate::PcapError;

/// Tunables of a [`PcapService`](crate::service::PcapService)
///
/// Every field has a default, so a config file only lists what it changes:
///
/// ```toml
/// fetch_concurrency = 4
/// scrub_marker = "REDACTED "
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Delay before an unreferenced file handle is closed
    pub eviction_grace_ms: u64,
    /// Reads in flight per session, also the width of the reorder window
    pub fetch_concurrency: usize,
    pub scrub_concurrency: usize,
    /// Per-file headers cached by the block-fetch strategy
    pub header_cache_entries: usize,
    /// Size of the aligned window used for record reads (rounded up to 256)
    pub read_window: usize,
    /// Default packet cap for reassembly
    pub max_packets: usize,
    pub write_chunk_size: usize,
    /// Pattern of the last scrub pass
    pub scrub_marker: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            eviction_grace_ms: 500,
            fetch_concurrency: 10,
            scrub_concurrency: 10,
            header_cache_entries: 16,
            read_window: 8192,
            max_packets: 200,
            write_chunk_size: WRITE_CHUNK_SIZE,
            scrub_marker: DEFAULT_SCRUB_MARKER.to_string(),
        }
    }
}

impl Config {
    pub fn from_toml(s: &str) -> Result<Config, PcapError> {
        let config: Config = toml::from_str(s).map_err(|e| PcapError::Config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a `.toml` or `.json` file
    pub fn load_from_file(path: &Path) -> Result<Config, PcapError> {
        let content = std::fs::read_to_string(path).map_err(|source| PcapError::File {
            path: path.to_path_buf(),
            source,
        })?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Config::from_toml(&content),
            Some("json") => {
                let config: Config =
                    serde_json::from_str(&content).map_err(|e| PcapError::Config(format!("invalid JSON: {}", e)))?;
                config.validate()?;
                Ok(config)
            }
            _ => Err(PcapError::Config(format!("unsupported config file {}", path.display()))),
        }
    }

    pub fn validate(&self) -> Result<(), PcapError> {
        let positive = [
            ("fetch_concurrency", self.fetch_concurrency),
            ("scrub_concurrency", self.scrub_concurrency),
            ("header_cache_entries", self.header_cache_entries),
            ("read_window", self.read_window),
            ("write_chunk_size", self.write_chunk_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(PcapError::Config(format!("{} must be positive", name)));
            }
        }
        if self.scrub_marker.is_empty() {
            return Err(PcapError::Config("scrub_marker must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn eviction_grace(&self) -> Duration {
        Duration::from_millis(self.eviction_grace_ms)
    }
}
