//! Immutable data parts and their lifecycle states.

pub mod file;
pub mod info;
pub mod storage;

pub use info::{validate_partition_id, BlockNumber, PartInfo};
pub use storage::{DiskStorage, PartListing, PartStorage};

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// A single table row.
///
/// `sign` is only meaningful for [`MergeMode::Collapsing`](crate::merge::MergeMode) tables;
/// other modes write `1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Row {
    /// Sorting key.
    pub key: u64,
    /// Event time in nanoseconds since the Unix epoch.
    pub timestamp: i64,
    /// Payload column.
    pub value: i64,
    /// Collapsing sign, `1` or `-1`.
    pub sign: i8,
}

impl Row {
    /// Creates a row with sign `1`.
    pub fn new(key: u64, timestamp: i64, value: i64) -> Self {
        Self {
            key,
            timestamp,
            value,
            sign: 1,
        }
    }

    /// Returns a copy with the given collapsing sign.
    pub fn with_sign(mut self, sign: i8) -> Self {
        self.sign = sign;
        self
    }
}

/// Lifecycle state of a part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartState {
    /// Written to a temporary location, not yet part of a commit.
    Temporary,
    /// Inside a commit, about to be swapped in.
    PreActive,
    /// Visible to queries.
    Active,
    /// Superseded; kept until unreferenced and past the retention window.
    Outdated,
    /// Being removed from storage.
    Deleting,
}

impl fmt::Display for PartState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Temporary => "Temporary",
            Self::PreActive => "PreActive",
            Self::Active => "Active",
            Self::Outdated => "Outdated",
            Self::Deleting => "Deleting",
        };
        f.write_str(name)
    }
}

/// Size and range statistics of written part data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartMeta {
    /// Number of rows.
    pub rows: u64,
    /// Bytes occupied on disk.
    pub bytes_on_disk: u64,
    /// Oldest row timestamp, `i64::MAX` when empty.
    pub min_timestamp: i64,
    /// Newest row timestamp, `i64::MIN` when empty.
    pub max_timestamp: i64,
}

impl PartMeta {
    /// Computes statistics for rows about to be written.
    pub fn from_rows(rows: &[Row], bytes_on_disk: u64) -> Self {
        let (min_timestamp, max_timestamp) = rows.iter().fold(
            (i64::MAX, i64::MIN),
            |(min, max), row| (min.min(row.timestamp), max.max(row.timestamp)),
        );
        Self {
            rows: rows.len() as u64,
            bytes_on_disk,
            min_timestamp,
            max_timestamp,
        }
    }
}

/// An immutable committed (or committing) part.
///
/// The registry keeps one `Arc<DataPart>` per part; every snapshot handed to
/// readers or jobs clones it, so `Arc::strong_count` is the reference count
/// the reaper checks.
#[derive(Debug)]
pub struct DataPart {
    info: PartInfo,
    name: String,
    meta: PartMeta,
    created_at: SystemTime,
}

/// Shared handle to a part.
pub type DataPartPtr = Arc<DataPart>;

impl DataPart {
    /// Creates a part descriptor.
    pub fn new(info: PartInfo, meta: PartMeta) -> Self {
        Self {
            name: info.name(),
            info,
            meta,
            created_at: SystemTime::now(),
        }
    }

    /// Part identity.
    pub fn info(&self) -> &PartInfo {
        &self.info
    }

    /// Directory name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Partition identifier.
    pub fn partition_id(&self) -> &str {
        &self.info.partition_id
    }

    /// Mutation version already applied.
    pub fn data_version(&self) -> u64 {
        self.info.data_version
    }

    /// Size and range statistics.
    pub fn meta(&self) -> &PartMeta {
        &self.meta
    }

    /// Bytes on disk.
    pub fn bytes(&self) -> u64 {
        self.meta.bytes_on_disk
    }

    /// Row count.
    pub fn rows(&self) -> u64 {
        self.meta.rows
    }

    /// When this descriptor was created.
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }
}

impl fmt::Display for DataPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_from_rows() {
        let rows = vec![Row::new(1, 50, 1), Row::new(2, 10, 1), Row::new(3, 30, 1)];
        let meta = PartMeta::from_rows(&rows, 128);
        assert_eq!(meta.rows, 3);
        assert_eq!(meta.min_timestamp, 10);
        assert_eq!(meta.max_timestamp, 50);

        let empty = PartMeta::from_rows(&[], 0);
        assert_eq!(empty.min_timestamp, i64::MAX);
    }

    #[test]
    fn test_data_part_name_matches_info() {
        let info = PartInfo::new("p", 1, 4, 1).with_data_version(3);
        let part = DataPart::new(info.clone(), PartMeta::default());
        assert_eq!(part.name(), "p_1_4_1_3");
        assert_eq!(part.info(), &info);
        assert_eq!(part.data_version(), 3);
    }
}
