//! Table settings.

use crate::error::{MergeTreeError, Result};
use crate::merge::MergeMode;
use std::time::Duration;

/// Default number of background worker threads.
pub const DEFAULT_BACKGROUND_POOL_SIZE: usize = 4;

/// Default interval between periodic scheduling ticks: 1 second.
pub const DEFAULT_SCHEDULER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default maximum number of parts in one merge.
pub const DEFAULT_MAX_PARTS_TO_MERGE_AT_ONCE: usize = 100;

/// Default size ceiling for merge inputs: 150 GiB.
pub const DEFAULT_MAX_BYTES_TO_MERGE: u64 = 150 * 1024 * 1024 * 1024;

/// Default exponent of the part-count term in the merge score.
pub const DEFAULT_MERGE_COUNT_WEIGHT: f64 = 0.5;

/// Default retention of outdated parts: 8 minutes.
pub const DEFAULT_OLD_PARTS_LIFETIME: Duration = Duration::from_secs(8 * 60);

/// Default minimum interval between reaper runs: 30 seconds.
pub const DEFAULT_CLEANUP_DELAY_PERIOD: Duration = Duration::from_secs(30);

/// Default retention of finished mutations: 1 hour.
pub const DEFAULT_FINISHED_MUTATION_RETENTION: Duration = Duration::from_secs(3600);

/// Default capacity of the in-memory part log.
pub const DEFAULT_PART_LOG_CAPACITY: usize = 1024;

/// Default size of a mutation log segment: 4 MB.
pub const DEFAULT_MUTATION_LOG_SEGMENT_SIZE: usize = 4 * 1024 * 1024;

/// Sync mode for mutation log durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Fsync after each record (default, highest durability).
    #[default]
    Fsync,
    /// Use fdatasync (skip metadata update, faster).
    Fdatasync,
    /// No sync (fastest, lowest durability - for testing only).
    None,
}

/// Whether merge candidates may span block numbers no active part covers.
///
/// Gaps appear after `drop_part`. Merging across a gap is only safe while no
/// outdated part in the gap has a higher level than the merge output would,
/// otherwise that outdated part would look uncovered after a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeGapPolicy {
    /// Only block-adjacent parts are merged.
    #[default]
    Forbid,
    /// Gaps are allowed when every outdated part inside the gap has a level
    /// no higher than both of its neighbours' maximum.
    AllowLowerLevels,
}

/// Configuration for the mutation log.
#[derive(Debug, Clone)]
pub struct MutationLogConfig {
    /// Maximum size of a single segment file.
    pub segment_size: usize,
    /// Sync mode for durability guarantees.
    pub sync_mode: SyncMode,
}

impl Default for MutationLogConfig {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_MUTATION_LOG_SEGMENT_SIZE,
            sync_mode: SyncMode::default(),
        }
    }
}

impl MutationLogConfig {
    /// Creates a new mutation log configuration.
    pub fn new(segment_size: usize, sync_mode: SyncMode) -> Self {
        Self {
            segment_size,
            sync_mode,
        }
    }
}

/// Settings of one table instance.
///
/// # Examples
/// ```rust,ignore
/// use alopex_mergetree::{MergeMode, TableSettings};
/// use std::time::Duration;
///
/// let settings = TableSettings::default()
///     .with_merge_mode(MergeMode::Summing)
///     .with_background_pool_size(0)
///     .with_old_parts_lifetime(Duration::ZERO);
/// settings.validate()?;
/// ```
#[derive(Debug, Clone)]
pub struct TableSettings {
    /// How rows with equal keys are combined during merges.
    pub merge_mode: MergeMode,

    /// Number of background worker threads.
    ///
    /// `0` disables background threads; work only runs through
    /// `run_background_job`. Default: 4.
    pub background_pool_size: usize,

    /// Interval of the periodic scheduling tick. Default: 1 second.
    pub scheduler_poll_interval: Duration,

    /// Maximum number of parts combined by one merge. Default: 100.
    pub max_parts_to_merge_at_once: usize,

    /// Parts larger than this are never selected for a regular merge, and a
    /// merge whose inputs sum above it is rejected. Default: 150 GiB.
    pub max_bytes_to_merge: u64,

    /// Exponent applied to the part-count reduction in the merge score.
    ///
    /// Higher values favour merging more parts at once. Default: 0.5.
    pub merge_count_weight: f64,

    /// Whether merges may span gaps left by dropped parts.
    pub merge_gap_policy: MergeGapPolicy,

    /// How long outdated parts are kept after their last reference is
    /// released. Default: 8 minutes.
    pub old_parts_lifetime: Duration,

    /// Minimum interval between reaper runs. Default: 30 seconds.
    pub cleanup_delay_period: Duration,

    /// How long finished mutations stay in the ledger. Default: 1 hour.
    pub finished_mutation_retention: Duration,

    /// Rows older than this are dropped by TTL merges. Default: disabled.
    pub row_ttl: Option<Duration>,

    /// Number of entries kept by the part log. Default: 1024.
    pub part_log_capacity: usize,

    /// Mutation log settings.
    pub mutation_log: MutationLogConfig,
}

impl Default for TableSettings {
    fn default() -> Self {
        Self {
            merge_mode: MergeMode::default(),
            background_pool_size: DEFAULT_BACKGROUND_POOL_SIZE,
            scheduler_poll_interval: DEFAULT_SCHEDULER_POLL_INTERVAL,
            max_parts_to_merge_at_once: DEFAULT_MAX_PARTS_TO_MERGE_AT_ONCE,
            max_bytes_to_merge: DEFAULT_MAX_BYTES_TO_MERGE,
            merge_count_weight: DEFAULT_MERGE_COUNT_WEIGHT,
            merge_gap_policy: MergeGapPolicy::default(),
            old_parts_lifetime: DEFAULT_OLD_PARTS_LIFETIME,
            cleanup_delay_period: DEFAULT_CLEANUP_DELAY_PERIOD,
            finished_mutation_retention: DEFAULT_FINISHED_MUTATION_RETENTION,
            row_ttl: None,
            part_log_capacity: DEFAULT_PART_LOG_CAPACITY,
            mutation_log: MutationLogConfig::default(),
        }
    }
}

impl TableSettings {
    /// Sets the merge mode.
    pub fn with_merge_mode(mut self, mode: MergeMode) -> Self {
        self.merge_mode = mode;
        self
    }

    /// Sets the background worker count (`0` for manual mode).
    pub fn with_background_pool_size(mut self, size: usize) -> Self {
        self.background_pool_size = size;
        self
    }

    /// Sets the periodic tick interval.
    pub fn with_scheduler_poll_interval(mut self, interval: Duration) -> Self {
        self.scheduler_poll_interval = interval;
        self
    }

    /// Sets the maximum number of parts per merge.
    pub fn with_max_parts_to_merge_at_once(mut self, max: usize) -> Self {
        self.max_parts_to_merge_at_once = max;
        self
    }

    /// Sets the merge input size ceiling.
    pub fn with_max_bytes_to_merge(mut self, bytes: u64) -> Self {
        self.max_bytes_to_merge = bytes;
        self
    }

    /// Sets the merge score exponent.
    pub fn with_merge_count_weight(mut self, weight: f64) -> Self {
        self.merge_count_weight = weight;
        self
    }

    /// Sets the merge gap policy.
    pub fn with_merge_gap_policy(mut self, policy: MergeGapPolicy) -> Self {
        self.merge_gap_policy = policy;
        self
    }

    /// Sets the outdated part retention window.
    pub fn with_old_parts_lifetime(mut self, lifetime: Duration) -> Self {
        self.old_parts_lifetime = lifetime;
        self
    }

    /// Sets the reaper throttle.
    pub fn with_cleanup_delay_period(mut self, period: Duration) -> Self {
        self.cleanup_delay_period = period;
        self
    }

    /// Sets the finished mutation retention.
    pub fn with_finished_mutation_retention(mut self, retention: Duration) -> Self {
        self.finished_mutation_retention = retention;
        self
    }

    /// Enables TTL merges for rows older than `ttl`.
    pub fn with_row_ttl(mut self, ttl: Duration) -> Self {
        self.row_ttl = Some(ttl);
        self
    }

    /// Sets the part log capacity.
    pub fn with_part_log_capacity(mut self, capacity: usize) -> Self {
        self.part_log_capacity = capacity;
        self
    }

    /// Sets the mutation log configuration.
    pub fn with_mutation_log(mut self, config: MutationLogConfig) -> Self {
        self.mutation_log = config;
        self
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_parts_to_merge_at_once < 2 {
            return Err(MergeTreeError::InvalidConfig(format!(
                "max_parts_to_merge_at_once must be at least 2, got {}",
                self.max_parts_to_merge_at_once
            )));
        }
        if self.max_bytes_to_merge == 0 {
            return Err(MergeTreeError::InvalidConfig(
                "max_bytes_to_merge must be positive".to_string(),
            ));
        }
        if !self.merge_count_weight.is_finite() || self.merge_count_weight < 0.0 {
            return Err(MergeTreeError::InvalidConfig(format!(
                "merge_count_weight must be a non-negative number, got {}",
                self.merge_count_weight
            )));
        }
        if self.scheduler_poll_interval.is_zero() {
            return Err(MergeTreeError::InvalidConfig(
                "scheduler_poll_interval must be positive".to_string(),
            ));
        }
        if self.row_ttl == Some(Duration::ZERO) {
            return Err(MergeTreeError::InvalidConfig(
                "row_ttl must be positive".to_string(),
            ));
        }
        if self.mutation_log.segment_size < 1024 {
            return Err(MergeTreeError::InvalidConfig(format!(
                "mutation log segment_size must be at least 1024 bytes, got {}",
                self.mutation_log.segment_size
            )));
        }
        Ok(())
    }
}
