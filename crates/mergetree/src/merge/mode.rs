//! Row merging policies.

use crate::part::Row;
use std::collections::HashSet;

/// How rows sharing a key are combined when parts are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeMode {
    /// Keep every row.
    #[default]
    Ordinary,
    /// Keep only the most recently written row per key.
    Replacing,
    /// Sum `value` per key; keys summing to zero disappear.
    Summing,
    /// Cancel rows with opposite `sign` per key.
    Collapsing,
}

impl MergeMode {
    /// Short name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ordinary => "ordinary",
            Self::Replacing => "replacing",
            Self::Summing => "summing",
            Self::Collapsing => "collapsing",
        }
    }
}

/// Merges the rows of several parts.
///
/// `inputs` must be given in part order (oldest block range first) with each
/// input sorted by key. The result is sorted by key; for equal keys the
/// relative order of the inputs is preserved, which is what "most recent"
/// means for [`MergeMode::Replacing`] and [`MergeMode::Collapsing`].
///
/// # Examples
/// ```rust,ignore
/// use alopex_mergetree::merge::{merge_rows, MergeMode};
/// use alopex_mergetree::Row;
///
/// let older = vec![Row::new(1, 0, 5)];
/// let newer = vec![Row::new(1, 1, 7)];
/// let merged = merge_rows(MergeMode::Replacing, vec![older, newer], false);
/// assert_eq!(merged, vec![Row::new(1, 1, 7)]);
/// ```
pub fn merge_rows(mode: MergeMode, inputs: Vec<Vec<Row>>, deduplicate: bool) -> Vec<Row> {
    let mut rows: Vec<Row> = inputs.into_iter().flatten().collect();
    rows.sort_by_key(|row| row.key);

    let mut merged = Vec::with_capacity(rows.len());
    for group in rows.chunk_by(|a, b| a.key == b.key) {
        let group = if deduplicate {
            dedup_group(group)
        } else {
            group.to_vec()
        };
        match mode {
            MergeMode::Ordinary => merged.extend(group),
            MergeMode::Replacing => merged.extend(group.last().copied()),
            MergeMode::Summing => merged.extend(sum_group(&group)),
            MergeMode::Collapsing => merged.extend(collapse_group(&group)),
        }
    }
    merged
}

/// Removes rows whose timestamp is older than `cutoff`.
pub fn drop_expired(rows: Vec<Row>, cutoff: i64) -> Vec<Row> {
    rows.into_iter().filter(|row| row.timestamp >= cutoff).collect()
}

fn dedup_group(group: &[Row]) -> Vec<Row> {
    let mut seen = HashSet::with_capacity(group.len());
    group
        .iter()
        .filter(|row| seen.insert((row.timestamp, row.value, row.sign)))
        .copied()
        .collect()
}

fn sum_group(group: &[Row]) -> Option<Row> {
    let first = group.first()?;
    let total = group
        .iter()
        .fold(0i64, |acc, row| acc.wrapping_add(row.value));
    if total == 0 {
        return None;
    }
    let timestamp = group.iter().map(|row| row.timestamp).max()?;
    Some(Row::new(first.key, timestamp, total))
}

fn collapse_group(group: &[Row]) -> Option<Row> {
    let positives = group.iter().filter(|row| row.sign > 0).count();
    let negatives = group.len() - positives;
    if positives > negatives {
        group.iter().rev().find(|row| row.sign > 0).copied()
    } else if negatives > positives {
        group.iter().find(|row| row.sign <= 0).copied()
    } else {
        None
    }
}
