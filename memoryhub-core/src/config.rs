//! Runtime configuration for a [`crate::manager::MemoryHub`] instance.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How aggressively the log tiers fsync appended records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsyncPolicy {
    /// fsync after every append. Slowest, safest.
    Always,
    /// Let the OS decide when to flush to disk. Default.
    Never,
}

impl Default for FsyncPolicy {
    fn default() -> Self {
        Self::Never
    }
}

/// All knobs a [`crate::manager::MemoryHub`] needs at construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryHubConfig {
    /// Root directory backing the core DB and the application/archive logs.
    /// The session tier lives in memory only and ignores this path.
    pub data_path: PathBuf,

    /// Number of pending recall-count increments a log tier buffers before
    /// flushing a full rewrite of its log and sidecar.
    pub flush_batch_size: usize,

    /// Maximum number of (query, tags) search results cached per log tier.
    pub query_cache_size: usize,

    /// fsync behavior for log-tier appends.
    pub fsync_policy: FsyncPolicy,

    /// Maximum number of recall latency samples retained for stats.
    pub max_latency_samples: usize,
}

impl Default for MemoryHubConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("./memoryhub_data"),
            flush_batch_size: 10,
            query_cache_size: 500,
            fsync_policy: FsyncPolicy::default(),
            max_latency_samples: 1000,
        }
    }
}

impl MemoryHubConfig {
    /// Loads a config from a TOML file, falling back to field defaults for
    /// anything the file omits.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| Error::InvalidInput(format!("invalid config: {e}")))
    }

    /// Path to the core tier's database file.
    #[must_use]
    pub fn core_db_path(&self) -> PathBuf {
        self.data_path.join("core.db")
    }

    /// Path to a log tier's JSONL file ("application" or "archive").
    #[must_use]
    pub fn log_path(&self, tier_name: &str) -> PathBuf {
        self.data_path.join(format!("{tier_name}.jsonl"))
    }

    /// Path to a log tier's offset/length sidecar index.
    #[must_use]
    pub fn sidecar_path(&self, tier_name: &str) -> PathBuf {
        self.data_path.join(format!("{tier_name}.idx"))
    }
}
