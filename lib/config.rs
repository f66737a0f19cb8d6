//! Engine configuration.
//!
//! Tuning knobs for the metadata engine. These may be specified in a TOML
//! file; anything unspecified falls back to the defaults below. Layout
//! constants (key widths, lock-region geometry) are part of the volume
//! format and are deliberately *not* configurable.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lock::INODE_GROUP_SIZE;

fn default_orphan_scan_min_ms() -> u64 {
    10_000
}

fn default_orphan_scan_jitter_ms() -> u64 {
    40_000
}

fn default_ino_batch_groups() -> u64 {
    10
}

/// Errors raised while reading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML for this schema.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Runtime tuning for one mount of the metadata engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct EngineConfig {
    /// Minimum delay between orphan scans, in milliseconds.
    pub orphan_scan_min_ms: u64,

    /// Uniform random extra delay added to each orphan scan interval, in
    /// milliseconds. The jitter desynchronizes the scanners of different
    /// cluster nodes so they don't bunch up on the same inodes.
    pub orphan_scan_jitter_ms: u64,

    /// Size of each inode-number batch requested from the cluster
    /// authority, in units of lock groups ([`INODE_GROUP_SIZE`] numbers
    /// per group). Unused numbers are abandoned on unmount, so the batch
    /// stays small relative to the numeric space.
    pub ino_batch_groups: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            orphan_scan_min_ms: default_orphan_scan_min_ms(),
            orphan_scan_jitter_ms: default_orphan_scan_jitter_ms(),
            ino_batch_groups: default_ino_batch_groups(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Check the configuration for values the engine cannot run with.
    ///
    /// Returns every problem found, not just the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();

        if self.orphan_scan_min_ms == 0 {
            problems.push("orphan-scan-min-ms must be greater than zero".to_owned());
        }
        if self.ino_batch_groups == 0 {
            problems.push("ino-batch-groups must be greater than zero".to_owned());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }

    /// The minimum orphan-scan interval as a [`Duration`].
    #[must_use]
    pub fn orphan_scan_min(&self) -> Duration {
        Duration::from_millis(self.orphan_scan_min_ms)
    }

    /// The orphan-scan jitter bound as a [`Duration`].
    #[must_use]
    pub fn orphan_scan_jitter(&self) -> Duration {
        Duration::from_millis(self.orphan_scan_jitter_ms)
    }

    /// Inode numbers requested per authority round-trip.
    #[must_use]
    pub fn ino_batch_size(&self) -> u64 {
        self.ino_batch_groups * INODE_GROUP_SIZE
    }
}
