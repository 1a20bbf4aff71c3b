//! Part registry: the authoritative set of parts and their lifecycle states.
//!
//! All state transitions go through this module under a single table-wide
//! lock. Readers get an `Arc` snapshot of the active set, so listing never
//! waits on I/O done by a commit.
//!
//! ## Lifecycle
//!
//! ```text
//! Temporary ──write──▶ PreActive ──commit──▶ Active ──merge/mutate/drop──▶ Outdated
//!                                                                            │
//!                                   removed ◀──storage delete── Deleting ◀───┘
//! ```

use crate::config::{MergeGapPolicy, TableSettings};
use crate::error::{MergeTreeError, Result};
use crate::part::{BlockNumber, DataPart, DataPartPtr, PartInfo, PartMeta, PartState, PartStorage};
use crate::wait::ChangeSignal;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Ordered, immutable view of the active parts.
pub type ActiveParts = Arc<Vec<DataPartPtr>>;

#[derive(Debug)]
struct PartEntry {
    part: DataPartPtr,
    state: PartState,
    outdated_since: Option<Instant>,
}

#[derive(Debug, Default)]
struct RegistryState {
    parts: BTreeMap<PartInfo, PartEntry>,
    active: ActiveParts,
    /// Last block number handed out per partition.
    block_increments: BTreeMap<String, BlockNumber>,
    /// Blocks handed out to inserts that have not committed or been
    /// abandoned yet.
    inserting: BTreeSet<PartInfo>,
    /// Covered parts found at load time, registered by `load_outdated_parts`.
    unloaded_outdated: Vec<PartInfo>,
}

impl RegistryState {
    fn rebuild_active(&mut self) {
        let active = self
            .parts
            .values()
            .filter(|entry| entry.state == PartState::Active)
            .map(|entry| Arc::clone(&entry.part))
            .collect();
        self.active = Arc::new(active);
    }

    fn active_entry(&self, info: &PartInfo) -> Option<&PartEntry> {
        self.parts
            .get(info)
            .filter(|entry| entry.state == PartState::Active)
    }

    fn intersecting_active<'a>(&'a self, info: &'a PartInfo) -> impl Iterator<Item = &'a DataPartPtr> {
        self.active
            .iter()
            .filter(move |part| part.info().intersects(info))
    }

    fn set_outdated(&mut self, info: &PartInfo, now: Instant) {
        if let Some(entry) = self.parts.get_mut(info) {
            entry.state = PartState::Outdated;
            entry.outdated_since = Some(now);
        }
    }
}

/// Summary of a registry load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Parts registered as active.
    pub active: usize,
    /// Covered parts left for the background loader.
    pub outdated: usize,
    /// Incomplete `tmp_*` / `delete_tmp_*` directories discarded.
    pub leftovers_removed: usize,
}

/// The part registry of one table.
#[derive(Debug)]
pub struct PartRegistry {
    storage: Arc<dyn PartStorage>,
    state: RwLock<RegistryState>,
    signal: Arc<ChangeSignal>,
    gap_policy: MergeGapPolicy,
    old_parts_lifetime: Duration,
    cleanup_delay_period: Duration,
    last_reap: Mutex<Option<Instant>>,
    outdated_loaded: AtomicBool,
    broken: Mutex<Option<String>>,
}

impl PartRegistry {
    /// Rebuilds the registry from the storage listing.
    ///
    /// Parts not covered by any other part become active. Covered parts are
    /// outdated and are only registered by [`PartRegistry::load_outdated_parts`].
    /// Leftover temporary directories are removed.
    ///
    /// # Errors
    ///
    /// Returns `InvariantViolation` if two uncovered parts intersect, and any
    /// storage error reading active part metadata.
    pub fn load(
        storage: Arc<dyn PartStorage>,
        settings: &TableSettings,
        signal: Arc<ChangeSignal>,
    ) -> Result<(Self, LoadReport)> {
        let listing = storage.list_parts()?;
        let mut report = LoadReport::default();
        for leftover in &listing.leftovers {
            info!("Removing incomplete part directory {}", leftover);
            storage.remove_leftover(leftover)?;
            report.leftovers_removed += 1;
        }

        let mut state = RegistryState::default();
        for info in &listing.committed {
            let last = state
                .block_increments
                .entry(info.partition_id.clone())
                .or_insert(0);
            *last = (*last).max(info.max_block);
        }

        let (active, covered) = classify(&listing.committed)?;
        for info in active {
            let meta = storage.read_meta(&info)?;
            let part = Arc::new(DataPart::new(info.clone(), meta));
            state.parts.insert(
                info,
                PartEntry {
                    part,
                    state: PartState::Active,
                    outdated_since: None,
                },
            );
            report.active += 1;
        }
        report.outdated = covered.len();
        state.unloaded_outdated = covered;
        state.rebuild_active();

        info!(
            "Loaded {} active parts, {} outdated parts pending, {} leftovers removed",
            report.active, report.outdated, report.leftovers_removed
        );

        let registry = Self {
            storage,
            state: RwLock::new(state),
            signal,
            gap_policy: settings.merge_gap_policy,
            old_parts_lifetime: settings.old_parts_lifetime,
            cleanup_delay_period: settings.cleanup_delay_period,
            last_reap: Mutex::new(None),
            outdated_loaded: AtomicBool::new(report.outdated == 0),
            broken: Mutex::new(None),
        };
        Ok((registry, report))
    }

    /// Registers the covered parts found at load time as outdated.
    ///
    /// Unreadable outdated parts are registered with empty metadata; they are
    /// only kept around to be deleted.
    pub fn load_outdated_parts(&self) -> usize {
        let pending = std::mem::take(&mut self.state.write().unloaded_outdated);
        let mut loaded = Vec::with_capacity(pending.len());
        for info in pending {
            let meta = match self.storage.read_meta(&info) {
                Ok(meta) => meta,
                Err(e) => {
                    warn!("Outdated part {} is unreadable: {}", info, e);
                    PartMeta::default()
                }
            };
            loaded.push(Arc::new(DataPart::new(info, meta)));
        }

        let count = loaded.len();
        {
            let mut state = self.state.write();
            let now = Instant::now();
            for part in loaded {
                state
                    .parts
                    .entry(part.info().clone())
                    .or_insert_with(|| PartEntry {
                        part,
                        state: PartState::Outdated,
                        outdated_since: Some(now),
                    });
            }
        }
        self.outdated_loaded.store(true, Ordering::Release);
        self.signal.notify();
        debug!("Loaded {} outdated parts", count);
        count
    }

    /// Returns true once every outdated part found at load time is registered.
    pub fn outdated_parts_loaded(&self) -> bool {
        self.outdated_loaded.load(Ordering::Acquire)
    }

    /// Snapshot of active parts ordered by partition and interval start.
    pub fn list_active(&self) -> ActiveParts {
        Arc::clone(&self.state.read().active)
    }

    /// Active parts of one partition.
    pub fn list_active_in_partition(&self, partition_id: &str) -> Vec<DataPartPtr> {
        self.list_active()
            .iter()
            .filter(|part| part.partition_id() == partition_id)
            .cloned()
            .collect()
    }

    /// Parts currently in `state`.
    pub fn list_parts_in_state(&self, state: PartState) -> Vec<DataPartPtr> {
        self.state
            .read()
            .parts
            .values()
            .filter(|entry| entry.state == state)
            .map(|entry| Arc::clone(&entry.part))
            .collect()
    }

    /// Identities of outdated parts, used to check merges across gaps.
    pub fn outdated_infos(&self) -> Vec<PartInfo> {
        self.state
            .read()
            .parts
            .iter()
            .filter(|(_, entry)| entry.state == PartState::Outdated)
            .map(|(info, _)| info.clone())
            .collect()
    }

    /// State of a part by name.
    pub fn part_state(&self, name: &str) -> Option<PartState> {
        let info = PartInfo::parse_name(name).ok()?;
        self.state.read().parts.get(&info).map(|entry| entry.state)
    }

    /// Active part by name.
    pub fn get_active(&self, name: &str) -> Option<DataPartPtr> {
        let info = PartInfo::parse_name(name).ok()?;
        self.state
            .read()
            .active_entry(&info)
            .map(|entry| Arc::clone(&entry.part))
    }

    /// Highest `data_version` among all known parts.
    pub fn max_data_version(&self) -> u64 {
        let state = self.state.read();
        state
            .parts
            .keys()
            .chain(state.unloaded_outdated.iter())
            .map(|info| info.data_version)
            .max()
            .unwrap_or(0)
    }

    /// Allocates the next block number of a partition.
    ///
    /// The block stays in flight until `commit_new_part` commits it or
    /// `abandon_block` gives it up. In-flight blocks count as mutation
    /// subjects, see [`PartRegistry::mutation_subjects`].
    pub fn allocate_block_number(&self, partition_id: &str) -> Result<BlockNumber> {
        crate::part::validate_partition_id(partition_id)?;
        let mut state = self.state.write();
        let last = state
            .block_increments
            .entry(partition_id.to_string())
            .or_insert(0);
        *last += 1;
        let block = *last;
        state
            .inserting
            .insert(PartInfo::new(partition_id, block, block, 0));
        Ok(block)
    }

    /// Gives up an in-flight block whose insert failed.
    ///
    /// The block number is not reused. Returns false if the block was not
    /// in flight.
    pub fn abandon_block(&self, info: &PartInfo) -> bool {
        let removed = self.state.write().inserting.remove(info);
        if removed {
            debug!("Abandoned block {}", info);
            self.signal.notify();
        }
        removed
    }

    /// Active parts plus in-flight blocks.
    ///
    /// A mutation is done only once none of these need it: an insert that
    /// allocated its block below the fence commits a part the mutation must
    /// still rewrite.
    pub fn mutation_subjects(&self) -> Vec<PartInfo> {
        let state = self.state.read();
        subjects_of(&state)
    }

    /// Highest allocated block number per partition and the mutation
    /// subjects, read atomically.
    ///
    /// The fence of a new mutation: parts allocated later get larger block
    /// numbers and are not subject to it.
    pub fn fence_and_subjects(&self) -> (BTreeMap<String, BlockNumber>, Vec<PartInfo>) {
        let state = self.state.read();
        (state.block_increments.clone(), subjects_of(&state))
    }

    /// Commits a freshly inserted part written to temporary storage.
    pub fn commit_new_part(&self, info: PartInfo, meta: PartMeta) -> Result<DataPartPtr> {
        self.commit_replacement(&[], info, meta, |_, _| Ok(()))
    }

    /// Atomically replaces `inputs` with the merged `output`.
    ///
    /// # Errors
    ///
    /// - `Conflict` if any input is no longer active; the caller abandons the
    ///   job.
    /// - `InvariantViolation` if the inputs do not exactly tile the output
    ///   interval or another active part intersects it. The table is marked
    ///   broken.
    pub fn commit_merge(
        &self,
        inputs: &[DataPartPtr],
        output: PartInfo,
        meta: PartMeta,
    ) -> Result<DataPartPtr> {
        let gap_policy = self.gap_policy;
        self.commit_replacement(inputs, output, meta, |inputs, output| {
            validate_merge(inputs, output, gap_policy)
        })
    }

    /// Atomically replaces `input` with its mutated `output`.
    ///
    /// `output` keeps the interval and level of `input` and carries a higher
    /// `data_version`.
    pub fn commit_mutation(
        &self,
        input: &DataPartPtr,
        output: PartInfo,
        meta: PartMeta,
    ) -> Result<DataPartPtr> {
        self.commit_replacement(std::slice::from_ref(input), output, meta, |inputs, output| {
            let input = inputs[0].info();
            if input.partition_id != output.partition_id
                || input.min_block != output.min_block
                || input.max_block != output.max_block
                || input.level != output.level
            {
                return Err(format!("mutation of {} cannot produce {}", input, output));
            }
            if output.data_version <= input.data_version {
                return Err(format!(
                    "mutation of {} does not advance data version ({})",
                    input, output.data_version
                ));
            }
            Ok(())
        })
    }

    fn commit_replacement(
        &self,
        inputs: &[DataPartPtr],
        output: PartInfo,
        meta: PartMeta,
        validate: impl FnOnce(&[DataPartPtr], &PartInfo) -> std::result::Result<(), String>,
    ) -> Result<DataPartPtr> {
        let mut state = self.state.write();
        for input in inputs {
            if state.active_entry(input.info()).is_none() {
                return Err(MergeTreeError::Conflict(format!(
                    "part {} is no longer active",
                    input
                )));
            }
        }
        if let Err(reason) = validate(inputs, &output) {
            return Err(self.violation(reason));
        }
        let overlapping: Vec<String> = state
            .intersecting_active(&output)
            .filter(|part| !inputs.iter().any(|input| input.info() == part.info()))
            .map(|part| part.name().to_string())
            .collect();
        if !overlapping.is_empty() {
            return Err(self.violation(format!(
                "{} would intersect active parts {}",
                output,
                overlapping.join(", ")
            )));
        }
        if state.parts.contains_key(&output) {
            return Err(self.violation(format!("part {} already exists", output)));
        }

        let part = Arc::new(DataPart::new(output.clone(), meta));
        state.parts.insert(
            output.clone(),
            PartEntry {
                part: Arc::clone(&part),
                state: PartState::PreActive,
                outdated_since: None,
            },
        );
        if let Err(e) = self.storage.commit_part(&output) {
            state.parts.remove(&output);
            if matches!(e, MergeTreeError::InvariantViolation(_)) {
                return Err(self.violation(e.to_string()));
            }
            return Err(e);
        }

        let now = Instant::now();
        for input in inputs {
            state.set_outdated(input.info(), now);
        }
        if let Some(entry) = state.parts.get_mut(&output) {
            entry.state = PartState::Active;
        }
        state.inserting.remove(&output);
        state.rebuild_active();
        drop(state);

        debug!(
            "Committed part {} replacing [{}]",
            output,
            inputs
                .iter()
                .map(|p| p.name())
                .collect::<Vec<_>>()
                .join(", ")
        );
        self.signal.notify();
        Ok(part)
    }

    /// Moves an active part to outdated outside of merges (drop).
    ///
    /// Callers must serialize this against part selection.
    pub fn retire(&self, name: &str) -> Result<DataPartPtr> {
        let info =
            PartInfo::parse_name(name).map_err(|_| MergeTreeError::PartNotFound(name.to_string()))?;
        let part = {
            let mut state = self.state.write();
            let part = state
                .active_entry(&info)
                .map(|entry| Arc::clone(&entry.part))
                .ok_or_else(|| MergeTreeError::PartNotFound(name.to_string()))?;
            state.set_outdated(&info, Instant::now());
            state.rebuild_active();
            part
        };
        debug!("Retired part {}", name);
        self.signal.notify();
        Ok(part)
    }

    /// Moves every active part of a partition to outdated.
    pub fn retire_partition(&self, partition_id: &str) -> Vec<DataPartPtr> {
        let retired: Vec<DataPartPtr> = {
            let mut state = self.state.write();
            let retired: Vec<DataPartPtr> = state
                .active
                .iter()
                .filter(|part| part.partition_id() == partition_id)
                .cloned()
                .collect();
            let now = Instant::now();
            for part in &retired {
                state.set_outdated(part.info(), now);
            }
            state.rebuild_active();
            retired
        };
        debug!(
            "Retired {} parts of partition {}",
            retired.len(),
            partition_id
        );
        self.signal.notify();
        retired
    }

    /// Deletes outdated parts that nobody references and whose retention
    /// window has passed. Returns the removed part names.
    ///
    /// Runs at most once per cleanup delay period unless `force` is set, and
    /// never before outdated parts are loaded.
    pub fn reap_outdated(&self, force: bool) -> Vec<String> {
        if !self.outdated_parts_loaded() {
            return Vec::new();
        }
        {
            let mut last_reap = self.last_reap.lock();
            let throttled = last_reap.is_some_and(|at| at.elapsed() < self.cleanup_delay_period);
            if throttled && !force {
                return Vec::new();
            }
            *last_reap = Some(Instant::now());
        }

        let victims: Vec<DataPartPtr> = {
            let mut state = self.state.write();
            let mut victims = Vec::new();
            for entry in state.parts.values_mut() {
                let expired = entry
                    .outdated_since
                    .is_some_and(|since| since.elapsed() >= self.old_parts_lifetime);
                if entry.state == PartState::Outdated
                    && expired
                    && Arc::strong_count(&entry.part) == 1
                {
                    entry.state = PartState::Deleting;
                    victims.push(Arc::clone(&entry.part));
                }
            }
            victims
        };

        let mut removed = Vec::with_capacity(victims.len());
        for part in victims {
            let result = self.storage.remove_part(part.info());
            let mut state = self.state.write();
            match result {
                Ok(()) => {
                    state.parts.remove(part.info());
                    removed.push(part.name().to_string());
                }
                Err(e) => {
                    warn!("Failed to remove outdated part {}: {}", part, e);
                    if let Some(entry) = state.parts.get_mut(part.info()) {
                        entry.state = PartState::Outdated;
                    }
                }
            }
        }
        if !removed.is_empty() {
            debug!("Removed {} outdated parts", removed.len());
        }
        removed
    }

    /// Names of outdated parts still referenced outside the registry.
    pub fn referenced_outdated_parts(&self) -> Vec<String> {
        self.state
            .read()
            .parts
            .values()
            .filter(|entry| entry.state == PartState::Outdated && Arc::strong_count(&entry.part) > 1)
            .map(|entry| entry.part.name().to_string())
            .collect()
    }

    /// Reason background processing was halted, if it was.
    pub fn broken_reason(&self) -> Option<String> {
        self.broken.lock().clone()
    }

    /// Halts background processing for this table.
    pub fn mark_broken(&self, reason: &str) {
        let mut broken = self.broken.lock();
        if broken.is_none() {
            error!("Table marked broken: {}", reason);
            *broken = Some(reason.to_string());
        }
        drop(broken);
        self.signal.notify();
    }

    fn violation(&self, reason: String) -> MergeTreeError {
        self.mark_broken(&reason);
        MergeTreeError::InvariantViolation(reason)
    }
}

/// Splits committed parts into uncovered (active) and covered (outdated).
fn subjects_of(state: &RegistryState) -> Vec<PartInfo> {
    state
        .active
        .iter()
        .map(|part| part.info().clone())
        .chain(state.inserting.iter().cloned())
        .collect()
}

fn classify(committed: &[PartInfo]) -> Result<(Vec<PartInfo>, Vec<PartInfo>)> {
    let mut by_partition: BTreeMap<&str, Vec<&PartInfo>> = BTreeMap::new();
    for info in committed {
        by_partition
            .entry(info.partition_id.as_str())
            .or_default()
            .push(info);
    }

    let mut active = Vec::new();
    let mut covered = Vec::new();
    for infos in by_partition.values() {
        let mut uncovered: Vec<&PartInfo> = Vec::new();
        for info in infos {
            let is_covered = infos
                .iter()
                .any(|other| other != info && other.contains(info));
            if is_covered {
                covered.push((*info).clone());
            } else {
                uncovered.push(*info);
            }
        }
        uncovered.sort();
        for pair in uncovered.windows(2) {
            if pair[0].intersects(pair[1]) {
                return Err(MergeTreeError::InvariantViolation(format!(
                    "parts {} and {} intersect and neither covers the other",
                    pair[0], pair[1]
                )));
            }
        }
        active.extend(uncovered.into_iter().cloned());
    }
    Ok((active, covered))
}

/// Checks that `inputs` tile `output` in order.
pub(crate) fn validate_merge(
    inputs: &[DataPartPtr],
    output: &PartInfo,
    gap_policy: MergeGapPolicy,
) -> std::result::Result<(), String> {
    let (first, last) = match (inputs.first(), inputs.last()) {
        (Some(first), Some(last)) => (first.info(), last.info()),
        _ => return Err(format!("merge into {} has no inputs", output)),
    };
    if first.min_block != output.min_block || last.max_block != output.max_block {
        return Err(format!(
            "inputs span [{}, {}] but output {} does not",
            first.min_block, last.max_block, output
        ));
    }
    for part in inputs {
        let info = part.info();
        if info.partition_id != output.partition_id {
            return Err(format!("{} is not in partition of {}", info, output));
        }
        if info.level >= output.level {
            return Err(format!("{} is not below the level of {}", info, output));
        }
        if info.data_version > output.data_version {
            return Err(format!("{} is newer than {}", info, output));
        }
    }
    for pair in inputs.windows(2) {
        let (left, right) = (pair[0].info(), pair[1].info());
        let adjacent = left.is_adjacent_to(right);
        let ordered = right.min_block > left.max_block;
        match gap_policy {
            MergeGapPolicy::Forbid if !adjacent => {
                return Err(format!("{} and {} are not adjacent", left, right));
            }
            MergeGapPolicy::AllowLowerLevels if !ordered => {
                return Err(format!("{} and {} overlap or are out of order", left, right));
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::{DiskStorage, Row};
    use tempfile::TempDir;

    fn settings() -> TableSettings {
        TableSettings::default().with_old_parts_lifetime(Duration::ZERO)
    }

    fn open(dir: &TempDir) -> (Arc<DiskStorage>, PartRegistry) {
        let storage = Arc::new(DiskStorage::new(dir.path()).unwrap());
        let (registry, _) =
            PartRegistry::load(storage.clone(), &settings(), Arc::new(ChangeSignal::new()))
                .unwrap();
        (storage, registry)
    }

    fn insert(storage: &DiskStorage, registry: &PartRegistry, info: PartInfo) -> DataPartPtr {
        let meta = storage.write_part(&info, &[Row::new(1, 0, 1)]).unwrap();
        registry.commit_new_part(info, meta).unwrap()
    }

    fn write(storage: &DiskStorage, info: &PartInfo) -> PartMeta {
        storage.write_part(info, &[Row::new(1, 0, 1)]).unwrap()
    }

    fn names(parts: &[DataPartPtr]) -> Vec<String> {
        parts.iter().map(|p| p.name().to_string()).collect()
    }

    #[test]
    fn test_commit_merge_replaces_inputs() {
        let temp_dir = TempDir::new().unwrap();
        let (storage, registry) = open(&temp_dir);
        let a = insert(&storage, &registry, PartInfo::new("p", 0, 10, 0));
        let b = insert(&storage, &registry, PartInfo::new("p", 11, 20, 0));
        insert(&storage, &registry, PartInfo::new("p", 21, 30, 0));

        let output = PartInfo::new("p", 0, 20, 1);
        let meta = write(&storage, &output);
        registry
            .commit_merge(&[a.clone(), b.clone()], output, meta)
            .unwrap();

        assert_eq!(
            names(&registry.list_active()),
            ["p_0_20_1", "p_21_30_0"]
        );
        assert_eq!(registry.part_state("p_0_10_0"), Some(PartState::Outdated));
        assert_eq!(registry.referenced_outdated_parts().len(), 2);
        drop((a, b));
        assert!(registry.referenced_outdated_parts().is_empty());
    }

    #[test]
    fn test_commit_merge_conflicts_after_retire() {
        let temp_dir = TempDir::new().unwrap();
        let (storage, registry) = open(&temp_dir);
        let a = insert(&storage, &registry, PartInfo::new("p", 0, 10, 0));
        let b = insert(&storage, &registry, PartInfo::new("p", 11, 20, 0));
        registry.retire_partition("p");

        let output = PartInfo::new("p", 0, 20, 1);
        let meta = write(&storage, &output);
        let err = registry.commit_merge(&[a, b], output, meta).unwrap_err();
        assert!(matches!(err, MergeTreeError::Conflict(_)));
        assert!(registry.list_active().is_empty());
        assert!(registry.broken_reason().is_none());
    }

    #[test]
    fn test_commit_merge_rejects_bad_tiling() {
        let temp_dir = TempDir::new().unwrap();
        let (storage, registry) = open(&temp_dir);
        let a = insert(&storage, &registry, PartInfo::new("p", 0, 10, 0));
        let c = insert(&storage, &registry, PartInfo::new("p", 21, 30, 0));
        insert(&storage, &registry, PartInfo::new("p", 11, 20, 0));

        let output = PartInfo::new("p", 0, 30, 1);
        let meta = write(&storage, &output);
        let err = registry.commit_merge(&[a, c], output, meta).unwrap_err();
        assert!(matches!(err, MergeTreeError::InvariantViolation(_)));
        assert!(registry.broken_reason().is_some());
        assert_eq!(registry.list_active().len(), 3);
    }

    #[test]
    fn test_commit_mutation_keeps_interval() {
        let temp_dir = TempDir::new().unwrap();
        let (storage, registry) = open(&temp_dir);
        let part = insert(&storage, &registry, PartInfo::new("p", 1, 1, 0));

        let output = part.info().clone().with_data_version(3);
        let meta = write(&storage, &output);
        registry.commit_mutation(&part, output, meta).unwrap();
        assert_eq!(names(&registry.list_active()), ["p_1_1_0_3"]);

        let bad = PartInfo::new("p", 1, 2, 0).with_data_version(4);
        let active = registry.list_active()[0].clone();
        let meta = write(&storage, &bad);
        assert!(matches!(
            registry.commit_mutation(&active, bad, meta),
            Err(MergeTreeError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_load_classifies_covered_parts() {
        let temp_dir = TempDir::new().unwrap();
        {
            let (storage, registry) = open(&temp_dir);
            let a = insert(&storage, &registry, PartInfo::new("p", 1, 1, 0));
            let b = insert(&storage, &registry, PartInfo::new("p", 2, 2, 0));
            let output = PartInfo::new("p", 1, 2, 1);
            let meta = write(&storage, &output);
            registry.commit_merge(&[a, b], output, meta).unwrap();
            write(&storage, &PartInfo::new("p", 3, 3, 0));
        }

        let storage = Arc::new(DiskStorage::new(temp_dir.path()).unwrap());
        let (registry, report) =
            PartRegistry::load(storage, &settings(), Arc::new(ChangeSignal::new())).unwrap();
        assert_eq!(
            report,
            LoadReport {
                active: 1,
                outdated: 2,
                leftovers_removed: 1
            }
        );
        assert_eq!(names(&registry.list_active()), ["p_1_2_1"]);
        assert!(!registry.outdated_parts_loaded());
        assert!(registry.reap_outdated(true).is_empty());

        assert_eq!(registry.load_outdated_parts(), 2);
        assert!(registry.outdated_parts_loaded());
        assert_eq!(registry.list_parts_in_state(PartState::Outdated).len(), 2);
        assert_eq!(registry.allocate_block_number("p").unwrap(), 3);
    }

    #[test]
    fn test_load_rejects_intersecting_parts() {
        let temp_dir = TempDir::new().unwrap();
        let storage = DiskStorage::new(temp_dir.path()).unwrap();
        for info in [PartInfo::new("p", 1, 5, 1), PartInfo::new("p", 3, 8, 1)] {
            write(&storage, &info);
            storage.commit_part(&info).unwrap();
        }
        let result = PartRegistry::load(
            Arc::new(storage),
            &settings(),
            Arc::new(ChangeSignal::new()),
        );
        assert!(matches!(result, Err(MergeTreeError::InvariantViolation(_))));
    }

    #[test]
    fn test_reap_respects_references_and_throttle() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(DiskStorage::new(temp_dir.path()).unwrap());
        let settings = settings().with_cleanup_delay_period(Duration::from_secs(3600));
        let (registry, _) =
            PartRegistry::load(storage.clone(), &settings, Arc::new(ChangeSignal::new())).unwrap();
        let part = insert(&storage, &registry, PartInfo::new("p", 1, 1, 0));
        registry.retire("p_1_1_0").unwrap();

        assert!(registry.reap_outdated(false).is_empty());
        drop(part);
        assert!(registry.reap_outdated(false).is_empty());
        assert_eq!(registry.reap_outdated(true), vec!["p_1_1_0".to_string()]);
        assert!(storage.list_parts().unwrap().committed.is_empty());
        assert_eq!(registry.part_state("p_1_1_0"), None);
    }

    #[test]
    fn test_block_numbers_are_per_partition() {
        let temp_dir = TempDir::new().unwrap();
        let (_, registry) = open(&temp_dir);
        assert_eq!(registry.allocate_block_number("a").unwrap(), 1);
        assert_eq!(registry.allocate_block_number("a").unwrap(), 2);
        assert_eq!(registry.allocate_block_number("b").unwrap(), 1);
        assert!(registry.allocate_block_number("bad_id").is_err());
        let (fence, _) = registry.fence_and_subjects();
        assert_eq!(fence.get("a"), Some(&2));
        assert_eq!(fence.get("b"), Some(&1));
    }

    #[test]
    fn test_in_flight_blocks_are_mutation_subjects() {
        let temp_dir = TempDir::new().unwrap();
        let (storage, registry) = open(&temp_dir);
        let first = registry.allocate_block_number("p").unwrap();
        let second = registry.allocate_block_number("p").unwrap();
        let (fence, subjects) = registry.fence_and_subjects();
        assert_eq!(fence.get("p"), Some(&second));
        assert_eq!(
            subjects,
            vec![
                PartInfo::new("p", first, first, 0),
                PartInfo::new("p", second, second, 0)
            ]
        );

        let committed = insert(&storage, &registry, PartInfo::new("p", first, first, 0));
        assert!(registry.abandon_block(&PartInfo::new("p", second, second, 0)));
        assert!(!registry.abandon_block(&PartInfo::new("p", second, second, 0)));
        assert_eq!(registry.mutation_subjects(), vec![committed.info().clone()]);
        assert_eq!(registry.allocate_block_number("p").unwrap(), second + 1);
    }

    #[test]
    fn test_validate_merge_gap_policy() {
        let part = |min, max| Arc::new(DataPart::new(PartInfo::new("p", min, max, 0), PartMeta::default()));
        let gapped = [part(0, 4), part(8, 9)];
        let output = PartInfo::new("p", 0, 9, 1);
        assert!(validate_merge(&gapped, &output, MergeGapPolicy::Forbid).is_err());
        assert!(validate_merge(&gapped, &output, MergeGapPolicy::AllowLowerLevels).is_ok());
        let wrong_level = PartInfo::new("p", 0, 9, 0);
        assert!(validate_merge(&gapped, &wrong_level, MergeGapPolicy::AllowLowerLevels).is_err());
    }
}
