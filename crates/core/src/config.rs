//! Ingester configuration
//!
//! Plain serde structs with defaults. Durations are integer milliseconds.
//! [`IngesterConfig::validate`] rejects values the ingester cannot run
//! with; [`IngesterConfig::check`] reports combinations that run but are
//! probably not what the operator meant.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Maximum zstd compression level.
const MAX_ZSTD_LEVEL: i32 = 22;

/// Default search result limit when a request asks for 0.
pub const DEFAULT_SEARCH_LIMIT: usize = 20;

/// Default number of matching spans returned per span set.
pub const DEFAULT_SPANS_PER_SPAN_SET: usize = 3;

/// When the push log and head files are fsynced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// fsync after every append
    #[default]
    EveryWrite,
    /// fsync only when a generation rotates or a head is sealed
    OnRotate,
    /// Never fsync; the OS decides. Tests and benchmarks only.
    NoSync,
}

impl SyncMode {
    /// Whether an individual append must be fsynced.
    pub fn sync_each_write(&self) -> bool {
        matches!(self, SyncMode::EveryWrite)
    }

    /// Whether rotation and sealing must fsync.
    pub fn sync_on_rotate(&self) -> bool {
        !matches!(self, SyncMode::NoSync)
    }
}

/// Which block sections go through the shared range cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheControl {
    /// Cache the footer
    pub footer: bool,
    /// Cache the column index
    pub column_index: bool,
    /// Cache the offset index
    pub offset_index: bool,
}

impl Default for CacheControl {
    fn default() -> Self {
        Self {
            footer: true,
            column_index: true,
            offset_index: true,
        }
    }
}

impl CacheControl {
    /// Nothing cached.
    pub fn none() -> Self {
        Self {
            footer: false,
            column_index: false,
            offset_index: false,
        }
    }
}

/// Push log settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// fsync policy
    pub sync_mode: SyncMode,
}

/// Completed block encoding settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockConfig {
    /// Traces per row group
    pub row_group_traces: usize,
    /// zstd level for column chunks
    pub zstd_level: i32,
    /// Sections routed through the range cache
    pub cache_control: CacheControl,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            row_group_traces: 1000,
            zstd_level: 3,
            cache_control: CacheControl::default(),
        }
    }
}

/// Search execution settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Shard worker pool size
    pub concurrency: usize,
    /// Result limit used when a request asks for 0
    pub default_limit: usize,
    /// Spans per span set used when a request asks for 0
    pub default_spans_per_span_set: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            default_limit: DEFAULT_SEARCH_LIMIT,
            default_spans_per_span_set: DEFAULT_SPANS_PER_SPAN_SET,
        }
    }
}

/// Top-level ingester configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngesterConfig {
    /// Root of the push log, head files and local blocks
    pub data_dir: PathBuf,
    /// Idle time after which a live trace is cut
    pub max_trace_idle_ms: u64,
    /// Head age that triggers a block cut
    pub max_block_duration_ms: u64,
    /// Head size that triggers a block cut (0 = disabled)
    pub max_block_bytes: u64,
    /// Head trace count that triggers a block cut (0 = disabled)
    pub max_block_traces: usize,
    /// Period of the cutter and block-ready checker
    pub flush_check_period_ms: u64,
    /// Time allowed for completing one block
    pub complete_block_timeout_ms: u64,
    /// How long a flushed block is kept locally
    pub flush_grace_period_ms: u64,
    /// Push log
    pub wal: WalConfig,
    /// Block encoding
    pub block: BlockConfig,
    /// Search
    pub search: SearchConfig,
}

impl Default for IngesterConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            max_trace_idle_ms: 10_000,
            max_block_duration_ms: 30 * 60 * 1000,
            max_block_bytes: 500 * 1024 * 1024,
            max_block_traces: 0,
            flush_check_period_ms: 10_000,
            complete_block_timeout_ms: 15 * 60 * 1000,
            flush_grace_period_ms: 15 * 60 * 1000,
            wal: WalConfig::default(),
            block: BlockConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

/// A configuration that runs but looks wrong
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    /// What is wrong
    pub message: String,
    /// What it will do at runtime
    pub explain: String,
}

impl IngesterConfig {
    /// Config rooted at `data_dir`, defaults otherwise.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Push log directory.
    pub fn wal_dir(&self) -> PathBuf {
        self.data_dir.join("wal")
    }

    /// Local completed block directory.
    pub fn blocks_dir(&self) -> PathBuf {
        self.data_dir.join("blocks")
    }

    /// [`Self::max_trace_idle_ms`] as a duration.
    pub fn max_trace_idle(&self) -> Duration {
        Duration::from_millis(self.max_trace_idle_ms)
    }

    /// [`Self::max_block_duration_ms`] as a duration.
    pub fn max_block_duration(&self) -> Duration {
        Duration::from_millis(self.max_block_duration_ms)
    }

    /// [`Self::flush_check_period_ms`] as a duration.
    pub fn flush_check_period(&self) -> Duration {
        Duration::from_millis(self.flush_check_period_ms)
    }

    /// [`Self::complete_block_timeout_ms`] as a duration.
    pub fn complete_block_timeout(&self) -> Duration {
        Duration::from_millis(self.complete_block_timeout_ms)
    }

    /// [`Self::flush_grace_period_ms`] as a duration.
    pub fn flush_grace_period(&self) -> Duration {
        Duration::from_millis(self.flush_grace_period_ms)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if:
    /// - `data_dir` is empty
    /// - `flush_check_period_ms` is 0
    /// - `block.row_group_traces` is 0
    /// - `block.zstd_level` is outside 1-22
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(Error::InvalidArgument("data_dir must be set".to_string()));
        }
        if self.flush_check_period_ms == 0 {
            return Err(Error::InvalidArgument(
                "flush_check_period_ms must be > 0".to_string(),
            ));
        }
        if self.block.row_group_traces == 0 {
            return Err(Error::InvalidArgument(
                "block.row_group_traces must be > 0".to_string(),
            ));
        }
        if self.block.zstd_level < 1 || self.block.zstd_level > MAX_ZSTD_LEVEL {
            return Err(Error::InvalidArgument(format!(
                "block.zstd_level must be 1-{}, got {}",
                MAX_ZSTD_LEVEL, self.block.zstd_level
            )));
        }
        Ok(())
    }

    /// Suspicious but runnable combinations.
    pub fn check(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        if self.complete_block_timeout_ms < self.flush_check_period_ms {
            warnings.push(ConfigWarning {
                message: "complete_block_timeout_ms < flush_check_period_ms".to_string(),
                explain: "blocks may be abandoned before the completer picks them up"
                    .to_string(),
            });
        }
        if self.search.concurrency == 0 {
            warnings.push(ConfigWarning {
                message: "search.concurrency is 0".to_string(),
                explain: "searches run on a single worker".to_string(),
            });
        }
        if self.max_block_bytes == 0
            && self.max_block_traces == 0
            && self.max_block_duration_ms == 0
        {
            warnings.push(ConfigWarning {
                message: "no block cut threshold is set".to_string(),
                explain: "head blocks are only cut on shutdown or forced flush".to_string(),
            });
        }
        if self.wal.sync_mode == SyncMode::NoSync {
            warnings.push(ConfigWarning {
                message: "wal.sync_mode is no_sync".to_string(),
                explain: "acknowledged pushes can be lost on power failure".to_string(),
            });
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = IngesterConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.check().is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_zstd_level() {
        let mut config = IngesterConfig::default();
        config.block.zstd_level = 0;
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidArgument(msg)) if msg.contains("zstd_level")
        ));
    }

    #[test]
    fn test_check_flags_short_complete_timeout() {
        let config = IngesterConfig {
            complete_block_timeout_ms: 10,
            flush_check_period_ms: 1000,
            ..IngesterConfig::default()
        };
        let warnings = config.check();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("complete_block_timeout_ms"));
    }

    #[test]
    fn test_toml_overrides_nested_sections() {
        let config: IngesterConfig = toml::from_str(
            r#"
            data_dir = "/var/spanstore"
            max_trace_idle_ms = 500

            [wal]
            sync_mode = "no_sync"

            [block.cache_control]
            footer = false
            "#,
        )
        .unwrap();
        assert_eq!(config.max_trace_idle(), Duration::from_millis(500));
        assert_eq!(config.wal.sync_mode, SyncMode::NoSync);
        assert!(!config.block.cache_control.footer);
        assert!(config.block.cache_control.column_index);
        assert_eq!(config.search.default_limit, DEFAULT_SEARCH_LIMIT);
        assert_eq!(config.wal_dir(), PathBuf::from("/var/spanstore/wal"));
    }
}
