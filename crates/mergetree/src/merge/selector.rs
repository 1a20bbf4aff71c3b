//! Merge and mutation selection.
//!
//! Selection is a pure function of a registry snapshot, the set of parts
//! already claimed by running jobs and a ledger snapshot. It performs no I/O
//! and takes no locks; the scheduler calls it inside its claim critical
//! section.

use crate::config::{MergeGapPolicy, TableSettings};
use crate::mutation::{LedgerState, MutationCommand};
use crate::part::{DataPartPtr, PartInfo};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Outcome of a selection: a candidate, or the reason there is none.
#[derive(Debug, Clone)]
pub enum Selection<T> {
    /// A job to run.
    Found(T),
    /// Nothing to do.
    Empty {
        /// Human-readable reason, for logs and `optimize` callers.
        reason: String,
    },
}

impl<T> Selection<T> {
    /// Empty selection with a reason.
    pub fn empty(reason: impl Into<String>) -> Self {
        Self::Empty {
            reason: reason.into(),
        }
    }

    /// Returns true if a candidate was found.
    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }

    /// The candidate, if any.
    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(candidate) => Some(candidate),
            Self::Empty { .. } => None,
        }
    }

    /// The reason nothing was selected.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Found(_) => None,
            Self::Empty { reason } => Some(reason),
        }
    }

    /// Maps the candidate.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Selection<U> {
        match self {
            Self::Found(candidate) => Selection::Found(f(candidate)),
            Self::Empty { reason } => Selection::Empty { reason },
        }
    }
}

/// Why a merge was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    /// Size-driven merge of several parts.
    Regular,
    /// Single-part rewrite dropping expired rows.
    Ttl {
        /// Rows with a timestamp below this are dropped.
        cutoff: i64,
    },
}

/// A selected merge.
#[derive(Debug, Clone)]
pub struct MergeCandidate {
    /// Inputs in block order.
    pub parts: Vec<DataPartPtr>,
    /// Identity of the part the merge produces.
    pub output: PartInfo,
    /// Regular or TTL merge.
    pub kind: MergeKind,
    /// Remove fully identical rows from the output.
    pub deduplicate: bool,
}

impl MergeCandidate {
    /// Sum of input sizes.
    pub fn bytes(&self) -> u64 {
        self.parts.iter().map(|part| part.bytes()).sum()
    }
}

impl fmt::Display for MergeCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.parts.iter().map(|part| part.name()).collect();
        write!(f, "[{}] -> {}", names.join(", "), self.output)
    }
}

/// A selected mutation.
#[derive(Debug, Clone)]
pub struct MutationCandidate {
    /// Part to rewrite.
    pub part: DataPartPtr,
    /// Highest version applied by this job.
    pub target_version: u64,
    /// Identity of the rewritten part.
    pub output: PartInfo,
    /// Commands of every version in `(part.data_version, target_version]`.
    pub commands: Vec<(u64, Arc<Vec<MutationCommand>>)>,
}

impl fmt::Display for MutationCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.part, self.output)
    }
}

/// Selector limits, taken from [`TableSettings`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectorSettings {
    /// Maximum parts per merge.
    pub max_parts_to_merge_at_once: usize,
    /// Size ceiling for regular merges.
    pub max_bytes_to_merge: u64,
    /// Exponent of the part-count term of the score.
    pub merge_count_weight: f64,
    /// Whether runs may span gaps.
    pub gap_policy: MergeGapPolicy,
}

impl From<&TableSettings> for SelectorSettings {
    fn from(settings: &TableSettings) -> Self {
        Self {
            max_parts_to_merge_at_once: settings.max_parts_to_merge_at_once,
            max_bytes_to_merge: settings.max_bytes_to_merge,
            merge_count_weight: settings.merge_count_weight,
            gap_policy: settings.merge_gap_policy,
        }
    }
}

/// Everything selection looks at.
#[derive(Debug, Clone, Copy)]
pub struct SelectionInput<'a> {
    /// Active parts ordered by partition and block.
    pub active: &'a [DataPartPtr],
    /// Parts claimed by running jobs.
    pub processing: &'a BTreeSet<PartInfo>,
    /// Ledger snapshot.
    pub ledger: &'a LedgerState,
    /// Outdated parts, consulted for merges across gaps.
    pub outdated: &'a [PartInfo],
    /// Limits.
    pub settings: &'a SelectorSettings,
}

/// Options of a merge request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeRequest {
    /// Restrict selection to one partition.
    pub partition: Option<String>,
    /// Take the longest run and ignore the size ceiling.
    pub aggressive: bool,
    /// Merge a whole partition into one part.
    pub final_merge: bool,
    /// Carried to the executor.
    pub deduplicate: bool,
}

impl MergeRequest {
    /// Background merge request.
    pub fn regular() -> Self {
        Self::default()
    }
}

/// Picks the next merge.
///
/// Regular requests score every window of every contiguous run as
/// `bytes / (parts - 1)^merge_count_weight` and take the lowest; ties go to
/// the window that starts first. Aggressive requests take the longest run.
/// Final requests merge every part of a partition.
pub fn select_parts_to_merge(
    input: &SelectionInput<'_>,
    request: &MergeRequest,
) -> Selection<MergeCandidate> {
    if request.final_merge {
        return select_final(input, request);
    }
    let partitions = partition_groups(input.active, request.partition.as_deref());
    if partitions.is_empty() {
        return Selection::empty("no active parts");
    }

    let mut best: Option<(f64, &[DataPartPtr])> = None;
    for parts in partitions {
        for run in contiguous_runs(input, parts, request.aggressive) {
            let window = if request.aggressive {
                let len = run.len().min(input.settings.max_parts_to_merge_at_once);
                Some((-(len as f64), &run[..len]))
            } else {
                best_window(input.settings, run)
            };
            if let Some((score, window)) = window {
                if best.map_or(true, |(best_score, _)| score < best_score) {
                    best = Some((score, window));
                }
            }
        }
    }

    match best {
        Some((_, window)) => Selection::Found(merge_candidate(
            window,
            MergeKind::Regular,
            request.deduplicate,
        )),
        None => Selection::empty("no contiguous run of mergeable parts"),
    }
}

/// Picks the part with the oldest expired row for a TTL merge.
pub fn select_ttl_merge(input: &SelectionInput<'_>, cutoff: i64) -> Selection<MergeCandidate> {
    let oldest = input
        .active
        .iter()
        .filter(|part| !input.processing.contains(part.info()))
        .filter(|part| part.rows() > 0 && part.meta().min_timestamp < cutoff)
        .fold(None::<&DataPartPtr>, |oldest, part| match oldest {
            Some(current) if current.meta().min_timestamp <= part.meta().min_timestamp => {
                Some(current)
            }
            _ => Some(part),
        });
    match oldest {
        Some(part) => Selection::Found(merge_candidate(
            std::slice::from_ref(part),
            MergeKind::Ttl { cutoff },
            false,
        )),
        None => Selection::empty("no part has expired rows"),
    }
}

/// Picks the next part to mutate.
///
/// The part whose oldest pending version is lowest wins, then the smallest
/// part. The job applies every pending version up to the highest one.
pub fn select_part_to_mutate(input: &SelectionInput<'_>) -> Selection<MutationCandidate> {
    let mut best: Option<((u64, u64), &DataPartPtr)> = None;
    for part in input.active {
        if input.processing.contains(part.info()) {
            continue;
        }
        let Some(first) = input.ledger.first_pending_version_for(part.info()) else {
            continue;
        };
        let key = (first, part.bytes());
        if best.map_or(true, |(best_key, _)| key < best_key) {
            best = Some((key, part));
        }
    }

    let Some((_, part)) = best else {
        return Selection::empty("no part has pending mutations");
    };
    let Some(target_version) = input.ledger.outstanding_version_for(part.info()) else {
        return Selection::empty("no part has pending mutations");
    };
    Selection::Found(MutationCandidate {
        part: Arc::clone(part),
        target_version,
        output: part.info().clone().with_data_version(target_version),
        commands: input.ledger.commands_for(part.info(), target_version),
    })
}

/// Highest level among outdated parts lying strictly between `left` and
/// `right`, or `None` if the gap holds none.
pub fn max_level_in_between(
    outdated: &[PartInfo],
    left: &PartInfo,
    right: &PartInfo,
) -> Option<u32> {
    gap_parts(outdated, left, right).map(|info| info.level).max()
}

fn gap_parts<'a>(
    outdated: &'a [PartInfo],
    left: &'a PartInfo,
    right: &'a PartInfo,
) -> impl Iterator<Item = &'a PartInfo> {
    outdated.iter().filter(move |info| {
        info.partition_id == left.partition_id
            && info.max_block > left.max_block
            && info.min_block < right.min_block
    })
}

fn can_join(input: &SelectionInput<'_>, left: &PartInfo, right: &PartInfo) -> bool {
    if left.is_adjacent_to(right) {
        return true;
    }
    match input.settings.gap_policy {
        MergeGapPolicy::Forbid => false,
        MergeGapPolicy::AllowLowerLevels => {
            let level = left.level.max(right.level);
            let data_version = left.data_version.max(right.data_version);
            right.min_block > left.max_block
                && gap_parts(input.outdated, left, right)
                    .all(|info| info.level <= level && info.data_version <= data_version)
        }
    }
}

fn partition_groups<'a>(
    active: &'a [DataPartPtr],
    partition: Option<&str>,
) -> Vec<&'a [DataPartPtr]> {
    active
        .chunk_by(|a, b| a.partition_id() == b.partition_id())
        .filter(|group| {
            partition.map_or(true, |id| group.first().is_some_and(|p| p.partition_id() == id))
        })
        .collect()
}

/// Splits a partition into maximal runs of eligible parts that may be merged
/// together.
fn contiguous_runs<'a>(
    input: &SelectionInput<'_>,
    parts: &'a [DataPartPtr],
    aggressive: bool,
) -> Vec<&'a [DataPartPtr]> {
    let mut runs = Vec::new();
    let mut start = 0;
    let mut previous_pending: Option<Vec<u64>> = None;
    for (i, part) in parts.iter().enumerate() {
        let eligible = !input.processing.contains(part.info())
            && (aggressive || part.bytes() <= input.settings.max_bytes_to_merge);
        if !eligible {
            if i > start {
                runs.push(&parts[start..i]);
            }
            start = i + 1;
            previous_pending = None;
            continue;
        }
        let pending = input.ledger.pending_versions_for(part.info());
        if i > start {
            let left = parts[i - 1].info();
            let same_mutations = previous_pending.as_ref() == Some(&pending);
            if !same_mutations || !can_join(input, left, part.info()) {
                runs.push(&parts[start..i]);
                start = i;
            }
        }
        previous_pending = Some(pending);
    }
    if parts.len() > start {
        runs.push(&parts[start..]);
    }
    runs.retain(|run| run.len() >= 2);
    runs
}

fn best_window<'a>(
    settings: &SelectorSettings,
    run: &'a [DataPartPtr],
) -> Option<(f64, &'a [DataPartPtr])> {
    let mut best: Option<(f64, &[DataPartPtr])> = None;
    for start in 0..run.len() {
        let mut bytes = run[start].bytes();
        let max_end = run.len().min(start + settings.max_parts_to_merge_at_once);
        for end in start + 2..=max_end {
            bytes = bytes.saturating_add(run[end - 1].bytes());
            if bytes > settings.max_bytes_to_merge {
                break;
            }
            let reduction = (end - start - 1) as f64;
            let score = bytes as f64 / reduction.powf(settings.merge_count_weight);
            if best.map_or(true, |(best_score, _)| score < best_score) {
                best = Some((score, &run[start..end]));
            }
        }
    }
    best
}

fn select_final(input: &SelectionInput<'_>, request: &MergeRequest) -> Selection<MergeCandidate> {
    let partitions = partition_groups(input.active, request.partition.as_deref());
    let mut reason = match &request.partition {
        Some(id) => format!("partition {} has no active parts", id),
        None => "no active parts".to_string(),
    };
    for parts in partitions {
        match final_candidate(input, parts, request.deduplicate) {
            Ok(candidate) => return Selection::Found(candidate),
            Err(why) => reason = why,
        }
    }
    Selection::empty(reason)
}

fn final_candidate(
    input: &SelectionInput<'_>,
    parts: &[DataPartPtr],
    deduplicate: bool,
) -> std::result::Result<MergeCandidate, String> {
    let Some(first) = parts.first() else {
        return Err("no active parts".to_string());
    };
    let partition = first.partition_id();
    if let Some(busy) = parts.iter().find(|p| input.processing.contains(p.info())) {
        return Err(format!(
            "part {} of partition {} is being processed",
            busy, partition
        ));
    }
    if parts.len() == 1 && first.info().level > 0 && !deduplicate {
        return Err(format!(
            "partition {} is already merged into one part",
            partition
        ));
    }
    let pending = input.ledger.pending_versions_for(first.info());
    for pair in parts.windows(2) {
        if input.ledger.pending_versions_for(pair[1].info()) != pending {
            return Err(format!(
                "parts of partition {} have different pending mutations",
                partition
            ));
        }
        if !can_join(input, pair[0].info(), pair[1].info()) {
            return Err(format!(
                "parts {} and {} are not contiguous",
                pair[0], pair[1]
            ));
        }
    }
    Ok(merge_candidate(parts, MergeKind::Regular, deduplicate))
}

fn merge_candidate(parts: &[DataPartPtr], kind: MergeKind, deduplicate: bool) -> MergeCandidate {
    let first = parts[0].info();
    let last = parts[parts.len() - 1].info();
    let level = parts.iter().map(|p| p.info().level).max().unwrap_or(0) + 1;
    let data_version = parts.iter().map(|p| p.data_version()).max().unwrap_or(0);
    MergeCandidate {
        parts: parts.to_vec(),
        output: PartInfo::new(first.partition_id.clone(), first.min_block, last.max_block, level)
            .with_data_version(data_version),
        kind,
        deduplicate,
    }
}
