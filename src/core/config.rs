//! Engine configuration loaded from `<store>/sightline.toml`.
//!
//! Every key is optional; a missing file means defaults.
//!
//! ```toml
//! [ledger]
//! flush_threshold = 64
//! max_frame_bytes = 65536
//! read_chunk_bytes = 65536
//!
//! [lock]
//! stale_after_secs = 30
//!
//! [patterns]
//! min_cohort = 5
//! z_threshold = 2.0
//! ```

use crate::core::error::{SightlineError, io_at};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub ledger: LedgerConfig,
    pub lock: LockConfig,
    pub patterns: PatternConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Pending records a writer holds before it forces a durable flush.
    pub flush_threshold: usize,
    /// Upper bound on a single log frame; larger records span several frames.
    pub max_frame_bytes: usize,
    /// Block size used when streaming target files.
    pub read_chunk_bytes: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 64,
            max_frame_bytes: 64 * 1024,
            read_chunk_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub stale_after_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 30,
        }
    }
}

impl LockConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// Smallest cohort for which a statistical claim is made.
    pub min_cohort: usize,
    /// |z| above this marks a statistical outlier.
    pub z_threshold: f64,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            min_cohort: 5,
            z_threshold: 2.0,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, SightlineError> {
        let config: EngineConfig =
            toml::from_str(content).map_err(|e| SightlineError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from `path`; absent file = defaults (not an error).
    pub fn load(path: &Path) -> Result<Self, SightlineError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(io_at(path))?;
        Self::from_toml_str(&content)
    }

    fn validate(&self) -> Result<(), SightlineError> {
        if self.ledger.flush_threshold == 0 {
            return Err(SightlineError::ConfigError(
                "ledger.flush_threshold must be at least 1".to_string(),
            ));
        }
        if self.ledger.max_frame_bytes < 64 {
            return Err(SightlineError::ConfigError(
                "ledger.max_frame_bytes must be at least 64".to_string(),
            ));
        }
        if self.ledger.max_frame_bytes > super::storage::MAX_FRAME_LEN {
            return Err(SightlineError::ConfigError(format!(
                "ledger.max_frame_bytes must not exceed {}",
                super::storage::MAX_FRAME_LEN
            )));
        }
        if self.ledger.read_chunk_bytes == 0 {
            return Err(SightlineError::ConfigError(
                "ledger.read_chunk_bytes must be at least 1".to_string(),
            ));
        }
        if self.patterns.min_cohort < 2 {
            return Err(SightlineError::ConfigError(
                "patterns.min_cohort must be at least 2".to_string(),
            ));
        }
        if !(self.patterns.z_threshold.is_finite() && self.patterns.z_threshold > 0.0) {
            return Err(SightlineError::ConfigError(
                "patterns.z_threshold must be a positive number".to_string(),
            ));
        }
        Ok(())
    }
}
