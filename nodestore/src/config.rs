//! Store and shard-geometry configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_LEDGERS_PER_SHARD: u32 = 16_384;

/// Sequence of the earliest ledger the network retains. System constant;
/// overridden only by tests that need small shard geometries.
pub const DEFAULT_GENESIS_SEQ: u32 = 32_570;

const DEFAULT_MAX_SIZE_GB: u64 = 256;
const DEFAULT_CACHE_SIZE: usize = 16_384;
const DEFAULT_CACHE_AGE_SECS: u64 = 300;

/// Average disk space per ledger used to seed shard-size estimates, before
/// any real shard has completed.
const AVG_LEDGER_SIZE: u64 = 192 * 1024;

/// Fixed shard geometry: how ledger sequences map onto shard indexes.
///
/// Shard `i` covers sequences `1 + i * ledgers_per_shard` through
/// `(i + 1) * ledgers_per_shard`. The genesis shard is the one containing
/// `genesis_seq` and may cover fewer ledgers.
#[derive(Debug, Clone)]
pub struct ShardConfig {
    ledgers_per_shard: u32,
    genesis_seq: u32,
    avg_shard_size: u64,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGERS_PER_SHARD, DEFAULT_GENESIS_SEQ)
    }
}

impl ShardConfig {
    pub fn new(ledgers_per_shard: u32, genesis_seq: u32) -> Self {
        assert!(ledgers_per_shard > 0, "ledgers_per_shard must be nonzero");
        assert!(genesis_seq > 0, "genesis_seq must be nonzero");
        Self {
            ledgers_per_shard,
            genesis_seq,
            avg_shard_size: u64::from(ledgers_per_shard) * AVG_LEDGER_SIZE,
        }
    }

    pub fn ledgers_per_shard(&self) -> u32 {
        self.ledgers_per_shard
    }

    pub fn genesis_seq(&self) -> u32 {
        self.genesis_seq
    }

    /// Estimated disk space a shard requires, in bytes.
    pub fn avg_shard_size(&self) -> u64 {
        self.avg_shard_size
    }

    pub fn set_avg_shard_size(&mut self, bytes: u64) {
        self.avg_shard_size = bytes;
    }

    /// First ledger sequence of the shard range (before genesis clamping).
    pub fn first_seq(&self, shard_index: u32) -> u32 {
        1 + shard_index * self.ledgers_per_shard
    }

    /// Last ledger sequence of the shard range.
    pub fn last_seq(&self, shard_index: u32) -> u32 {
        (shard_index + 1) * self.ledgers_per_shard
    }

    pub fn seq_to_shard_index(&self, seq: u32) -> u32 {
        seq.saturating_sub(1) / self.ledgers_per_shard
    }

    pub fn genesis_shard_index(&self) -> u32 {
        self.seq_to_shard_index(self.genesis_seq)
    }

    /// Ledger count of the genesis shard, which starts at `genesis_seq`
    /// rather than at its range boundary.
    pub fn genesis_num_ledgers(&self) -> u32 {
        self.ledgers_per_shard - (self.genesis_seq - self.first_seq(self.genesis_shard_index()))
    }

    /// Number of ledgers a shard must store to be complete.
    pub fn expected_ledger_count(&self, shard_index: u32) -> u32 {
        if shard_index == self.genesis_shard_index() {
            self.genesis_num_ledgers()
        } else {
            self.ledgers_per_shard
        }
    }
}

/// Store configuration, matching the recognized config-file options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend factory name, resolved through the backend registry.
    #[serde(rename = "type")]
    pub backend: String,

    /// Root directory holding per-shard subdirectories.
    pub path: PathBuf,

    /// Disk budget in gigabytes.
    #[serde(default = "default_max_size_gb")]
    pub max_size_gb: u64,

    /// Default target size for per-shard caches.
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    /// Default target age for per-shard caches, in seconds.
    #[serde(default = "default_cache_age_secs")]
    pub cache_age_secs: u64,

    /// Byte-granular override of `max_size_gb`, for embedders and tests.
    #[serde(skip)]
    pub max_disk_space: Option<u64>,
}

fn default_max_size_gb() -> u64 {
    DEFAULT_MAX_SIZE_GB
}

fn default_cache_size() -> usize {
    DEFAULT_CACHE_SIZE
}

fn default_cache_age_secs() -> u64 {
    DEFAULT_CACHE_AGE_SECS
}

impl StoreConfig {
    pub fn new(backend: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            backend: backend.into(),
            path: path.into(),
            max_size_gb: DEFAULT_MAX_SIZE_GB,
            cache_size: DEFAULT_CACHE_SIZE,
            cache_age_secs: DEFAULT_CACHE_AGE_SECS,
            max_disk_space: None,
        }
    }

    /// Disk budget in bytes.
    pub fn max_disk_space(&self) -> u64 {
        self.max_disk_space.unwrap_or(self.max_size_gb << 30)
    }

    pub fn cache_age(&self) -> Duration {
        Duration::from_secs(self.cache_age_secs)
    }
}
