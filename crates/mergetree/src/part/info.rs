//! Part identity: partition, block interval, level and data version encoded in a name.

use crate::error::{MergeTreeError, Result};
use std::cmp::Ordering;
use std::fmt;

/// Block number assigned to an insert.
pub type BlockNumber = u64;

/// Identity of a part, parsed from or rendered into its directory name.
///
/// # Examples
/// ```rust,ignore
/// use alopex_mergetree::part::PartInfo;
///
/// let info = PartInfo::new("202401", 1, 10, 0);
/// assert_eq!(info.name(), "202401_1_10_0");
/// let parsed = PartInfo::parse_name("202401_1_10_0_5")?;
/// assert_eq!(parsed.data_version, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartInfo {
    /// Partition identifier.
    pub partition_id: String,
    /// First block number covered (inclusive).
    pub min_block: BlockNumber,
    /// Last block number covered (inclusive).
    pub max_block: BlockNumber,
    /// Merge depth; 0 for freshly inserted parts.
    pub level: u32,
    /// Highest mutation version already applied; 0 if none.
    pub data_version: u64,
}

impl PartInfo {
    /// Creates a part identity with `data_version` 0.
    pub fn new(
        partition_id: impl Into<String>,
        min_block: BlockNumber,
        max_block: BlockNumber,
        level: u32,
    ) -> Self {
        Self {
            partition_id: partition_id.into(),
            min_block,
            max_block,
            level,
            data_version: 0,
        }
    }

    /// Returns a copy with the given data version.
    pub fn with_data_version(mut self, data_version: u64) -> Self {
        self.data_version = data_version;
        self
    }

    /// Builds a name using `{partition}_{min}_{max}_{level}[_{data_version}]`.
    pub fn name(&self) -> String {
        if self.data_version > 0 {
            format!(
                "{}_{}_{}_{}_{}",
                self.partition_id, self.min_block, self.max_block, self.level, self.data_version
            )
        } else {
            format!(
                "{}_{}_{}_{}",
                self.partition_id, self.min_block, self.max_block, self.level
            )
        }
    }

    /// Parses a part name into its components.
    pub fn parse_name(name: &str) -> Result<Self> {
        let invalid = || MergeTreeError::InvalidPartName(name.to_string());
        let mut parts = name.split('_');
        let partition_id = parts.next().ok_or_else(invalid)?;
        let min_block = parse_number::<u64>(parts.next()).ok_or_else(invalid)?;
        let max_block = parse_number::<u64>(parts.next()).ok_or_else(invalid)?;
        let level = parse_number::<u32>(parts.next()).ok_or_else(invalid)?;
        let data_version = match parts.next() {
            Some(raw) => parse_number::<u64>(Some(raw)).ok_or_else(invalid)?,
            None => 0,
        };
        if parts.next().is_some() || min_block > max_block {
            return Err(invalid());
        }
        validate_partition_id(partition_id).map_err(|_| invalid())?;

        Ok(Self {
            partition_id: partition_id.to_string(),
            min_block,
            max_block,
            level,
            data_version,
        })
    }

    /// Returns true if `other` lies entirely within this part and is not newer.
    ///
    /// A covering part supersedes `other` at load time.
    pub fn contains(&self, other: &PartInfo) -> bool {
        self.partition_id == other.partition_id
            && self.min_block <= other.min_block
            && self.max_block >= other.max_block
            && self.level >= other.level
            && self.data_version >= other.data_version
    }

    /// Returns true if the block intervals overlap within the same partition.
    pub fn intersects(&self, other: &PartInfo) -> bool {
        self.partition_id == other.partition_id
            && self.min_block <= other.max_block
            && other.min_block <= self.max_block
    }

    /// Returns true if `other` starts right after this part ends.
    pub fn is_adjacent_to(&self, other: &PartInfo) -> bool {
        self.partition_id == other.partition_id
            && self.max_block.checked_add(1) == Some(other.min_block)
    }
}

impl fmt::Display for PartInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl Ord for PartInfo {
    fn cmp(&self, other: &Self) -> Ordering {
        self.partition_id
            .cmp(&other.partition_id)
            .then(self.min_block.cmp(&other.min_block))
            .then(self.max_block.cmp(&other.max_block))
            .then(self.level.cmp(&other.level))
            .then(self.data_version.cmp(&other.data_version))
    }
}

impl PartialOrd for PartInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Checks that a partition id is non-empty and uses only `[A-Za-z0-9-]`.
///
/// `tmp` is reserved: `tmp_*` directories are uncommitted parts.
pub fn validate_partition_id(partition_id: &str) -> Result<()> {
    let valid = !partition_id.is_empty()
        && partition_id != "tmp"
        && partition_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(MergeTreeError::InvalidPartition(partition_id.to_string()))
    }
}

fn parse_number<T: std::str::FromStr>(raw: Option<&str>) -> Option<T> {
    let raw = raw?;
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}
