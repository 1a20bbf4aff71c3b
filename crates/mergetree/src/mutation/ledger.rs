//! Mutation ledger: versioned mutation entries and their applicability.
//!
//! Writers (submit, kill, failure tracking, gc) are serialized by the log
//! mutex and persist before publishing. Readers take an [`Arc`] snapshot of
//! the ledger state and never block writers for longer than a pointer swap.
//!
//! Completion is computed against a view of the parts a mutation may still
//! touch. Writers read that view through a closure while holding the log
//! mutex, so two writers never publish completion from views taken in the
//! opposite order.

use crate::config::MutationLogConfig;
use crate::error::Result;
use crate::mutation::command::{summarize, MutationCommand};
use crate::mutation::log::{LogRecord, MutationLog};
use crate::part::{BlockNumber, PartInfo};
use crate::wait::ChangeSignal;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info};

/// One submitted mutation.
#[derive(Debug, Clone)]
pub struct MutationEntry {
    /// Strictly increasing version.
    pub version: u64,
    /// Submission time.
    pub create_time: SystemTime,
    /// Highest block number per partition at submission time.
    pub block_numbers: BTreeMap<String, BlockNumber>,
    /// Commands to apply.
    pub commands: Arc<Vec<MutationCommand>>,
    /// True once no subject part still needs this mutation.
    pub is_done: bool,
    /// Subject parts still needing this mutation at the last refresh.
    pub parts_to_do: usize,
    /// When the entry was last observed done.
    pub done_at: Option<Instant>,
    /// Last part the mutation failed on.
    pub latest_failed_part: Option<String>,
    /// Why it failed.
    pub latest_fail_reason: Option<String>,
    /// When it failed.
    pub latest_fail_time: Option<SystemTime>,
}

impl MutationEntry {
    /// Returns true if the mutation must still be applied to `part`.
    ///
    /// The part must predate the fence of its partition and not already
    /// carry this version.
    pub fn applies_to(&self, part: &PartInfo) -> bool {
        self.version > part.data_version
            && self
                .block_numbers
                .get(&part.partition_id)
                .is_some_and(|fence| part.max_block <= *fence)
    }

    fn clear_failure(&mut self) {
        self.latest_failed_part = None;
        self.latest_fail_reason = None;
        self.latest_fail_time = None;
    }
}

/// Status row reported by `mutations_status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationStatus {
    /// Mutation version.
    pub version: u64,
    /// Human-readable summary of the commands.
    pub command: String,
    /// Submission time.
    pub create_time: SystemTime,
    /// Block fence per partition.
    pub block_numbers: BTreeMap<String, BlockNumber>,
    /// Whether every subject part carries this version.
    pub is_done: bool,
    /// Number of active or in-flight parts still to mutate.
    pub parts_to_do: usize,
    /// Last part the mutation failed on.
    pub latest_failed_part: Option<String>,
    /// Why it failed.
    pub latest_fail_reason: Option<String>,
    /// When it failed.
    pub latest_fail_time: Option<SystemTime>,
}

/// What the ledger knows about a version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionState {
    /// Not assigned yet.
    NotSubmitted,
    /// Submitted and still needed by at least one active part.
    Pending {
        /// Last recorded failure, if any.
        latest_fail_reason: Option<String>,
    },
    /// Applied everywhere (or already garbage-collected).
    Done,
    /// Killed before completion.
    Killed,
}

/// Immutable view of the ledger.
#[derive(Debug, Clone, Default)]
pub struct LedgerState {
    entries: BTreeMap<u64, MutationEntry>,
    killed: BTreeSet<u64>,
    last_version: u64,
}

/// Shared read-only ledger snapshot.
pub type LedgerSnapshot = Arc<LedgerState>;

impl LedgerState {
    /// Highest version assigned so far.
    pub fn last_version(&self) -> u64 {
        self.last_version
    }

    /// Entry for a version.
    pub fn entry(&self, version: u64) -> Option<&MutationEntry> {
        self.entries.get(&version)
    }

    /// Entries ordered by version.
    pub fn entries(&self) -> impl Iterator<Item = &MutationEntry> {
        self.entries.values()
    }

    /// Number of tracked entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no entries are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn pending_for<'a>(&'a self, part: &'a PartInfo) -> impl Iterator<Item = &'a MutationEntry> {
        self.entries
            .range(part.data_version + 1..)
            .map(|(_, entry)| entry)
            .filter(move |entry| entry.applies_to(part))
    }

    /// Highest version still unapplied to `part`.
    pub fn outstanding_version_for(&self, part: &PartInfo) -> Option<u64> {
        self.pending_for(part).last().map(|entry| entry.version)
    }

    /// Lowest version still unapplied to `part`.
    pub fn first_pending_version_for(&self, part: &PartInfo) -> Option<u64> {
        self.pending_for(part).next().map(|entry| entry.version)
    }

    /// Every version still unapplied to `part`, ascending.
    ///
    /// Two parts may only be merged when these sets are equal, so the merged
    /// part owes exactly the mutations each input owed.
    pub fn pending_versions_for(&self, part: &PartInfo) -> Vec<u64> {
        self.pending_for(part).map(|entry| entry.version).collect()
    }

    /// Commands to bring `part` up to `target`, in version order.
    pub fn commands_for(&self, part: &PartInfo, target: u64) -> Vec<(u64, Arc<Vec<MutationCommand>>)> {
        self.pending_for(part)
            .take_while(|entry| entry.version <= target)
            .map(|entry| (entry.version, Arc::clone(&entry.commands)))
            .collect()
    }

    /// Classifies `version` for waiters.
    pub fn version_state(&self, version: u64) -> VersionState {
        if let Some(entry) = self.entries.get(&version) {
            if entry.is_done {
                VersionState::Done
            } else {
                VersionState::Pending {
                    latest_fail_reason: entry.latest_fail_reason.clone(),
                }
            }
        } else if self.killed.contains(&version) {
            VersionState::Killed
        } else if version > self.last_version {
            VersionState::NotSubmitted
        } else {
            VersionState::Done
        }
    }

    /// Returns true if any entry is not done.
    pub fn has_pending(&self) -> bool {
        self.entries.values().any(|entry| !entry.is_done)
    }

    fn refresh(&mut self, subjects: &[PartInfo]) -> Vec<u64> {
        let mut newly_done = Vec::new();
        for entry in self.entries.values_mut() {
            let parts_to_do = subjects
                .iter()
                .filter(|part| entry.applies_to(part))
                .count();
            entry.parts_to_do = parts_to_do;
            if parts_to_do == 0 {
                if !entry.is_done {
                    entry.is_done = true;
                    entry.done_at = Some(Instant::now());
                    entry.clear_failure();
                    newly_done.push(entry.version);
                }
            } else {
                entry.is_done = false;
                entry.done_at = None;
            }
        }
        newly_done
    }
}

/// The mutation ledger.
///
/// # Examples
/// ```rust,ignore
/// let signal = Arc::new(ChangeSignal::new());
/// let ledger = MutationLedger::open(dir.join("mutations"), MutationLogConfig::default(), 0, signal)?;
/// let version = ledger.submit(commands, || registry.fence_and_subjects())?;
/// assert!(ledger.snapshot().entry(version).is_some());
/// ```
#[derive(Debug)]
pub struct MutationLedger {
    log: Mutex<MutationLog>,
    state: RwLock<LedgerSnapshot>,
    signal: Arc<ChangeSignal>,
}

impl MutationLedger {
    /// Opens the ledger, replaying the mutation log.
    ///
    /// New versions are assigned above both the log's history and
    /// `version_floor` (the highest `data_version` found among parts).
    pub fn open(
        log_dir: impl AsRef<Path>,
        config: MutationLogConfig,
        version_floor: u64,
        signal: Arc<ChangeSignal>,
    ) -> Result<Self> {
        let (log, replay) = MutationLog::open(log_dir, config)?;
        let mut state = LedgerState {
            last_version: replay.max_version.max(version_floor),
            ..LedgerState::default()
        };
        for record in replay.records {
            match record {
                LogRecord::Submit {
                    version,
                    create_time,
                    block_numbers,
                    commands,
                } => {
                    state.entries.insert(
                        version,
                        MutationEntry {
                            version,
                            create_time,
                            block_numbers,
                            commands: Arc::new(commands),
                            is_done: false,
                            parts_to_do: 0,
                            done_at: None,
                            latest_failed_part: None,
                            latest_fail_reason: None,
                            latest_fail_time: None,
                        },
                    );
                }
                LogRecord::Kill { version } => {
                    state.entries.remove(&version);
                    state.killed.insert(version);
                }
                LogRecord::Remove { version } => {
                    state.entries.remove(&version);
                }
            }
        }
        info!(
            "Loaded {} mutation entries, last version {}",
            state.entries.len(),
            state.last_version
        );

        Ok(Self {
            log: Mutex::new(log),
            state: RwLock::new(Arc::new(state)),
            signal,
        })
    }

    /// Consistent point-in-time view of the ledger.
    pub fn snapshot(&self) -> LedgerSnapshot {
        self.state.read().clone()
    }

    fn publish(&self, update: impl FnOnce(&mut LedgerState)) {
        {
            let mut guard = self.state.write();
            update(Arc::make_mut(&mut guard));
        }
        self.signal.notify();
    }

    /// Assigns the next version, persists the entry and publishes it.
    ///
    /// `view` returns the block number fence and the subject parts used for
    /// the initial `parts_to_do`. It runs under the log mutex.
    pub fn submit(
        &self,
        commands: Vec<MutationCommand>,
        view: impl FnOnce() -> (BTreeMap<String, BlockNumber>, Vec<PartInfo>),
    ) -> Result<u64> {
        let mut log = self.log.lock();
        let (block_numbers, subjects) = view();
        let version = self.snapshot().last_version.max(log.max_version()) + 1;
        let create_time = SystemTime::now();
        log.append(&LogRecord::Submit {
            version,
            create_time,
            block_numbers: block_numbers.clone(),
            commands: commands.clone(),
        })?;

        let summary = summarize(&commands);
        self.publish(|state| {
            state.last_version = version;
            state.entries.insert(
                version,
                MutationEntry {
                    version,
                    create_time,
                    block_numbers,
                    commands: Arc::new(commands),
                    is_done: false,
                    parts_to_do: 0,
                    done_at: None,
                    latest_failed_part: None,
                    latest_fail_reason: None,
                    latest_fail_time: None,
                },
            );
            state.refresh(&subjects);
        });
        info!("Submitted mutation {}: {}", version, summary);
        Ok(version)
    }

    /// Records that `part` now carries `version` and recomputes completion
    /// against the subjects returned by `view`, read under the log mutex.
    /// Returns versions that became done.
    pub fn mark_applied(
        &self,
        part: &PartInfo,
        version: u64,
        view: impl FnOnce() -> Vec<PartInfo>,
    ) -> Vec<u64> {
        let _log = self.log.lock();
        let subjects = view();
        let name = part.name();
        let mut newly_done = Vec::new();
        self.publish(|state| {
            for entry in state.entries.range_mut(..=version).map(|(_, e)| e) {
                if entry.latest_failed_part.as_deref() == Some(name.as_str()) {
                    entry.clear_failure();
                }
            }
            newly_done = state.refresh(&subjects);
        });
        for version in &newly_done {
            debug!("Mutation {} is done", version);
        }
        newly_done
    }

    /// Recomputes completion of every entry against the subjects returned
    /// by `view`, read under the log mutex.
    pub fn refresh(&self, view: impl FnOnce() -> Vec<PartInfo>) -> Vec<u64> {
        let _log = self.log.lock();
        let subjects = view();
        let mut newly_done = Vec::new();
        self.publish(|state| newly_done = state.refresh(&subjects));
        newly_done
    }

    /// Records a failure to bring `part` up to `target`.
    ///
    /// Every entry the job was applying keeps the failure until a later
    /// success. The entries stay pending.
    pub fn record_failure(&self, part: &PartInfo, target: u64, reason: &str) {
        let _log = self.log.lock();
        let now = SystemTime::now();
        self.publish(|state| {
            for entry in state.entries.range_mut(..=target).map(|(_, e)| e) {
                if entry.applies_to(part) {
                    entry.latest_failed_part = Some(part.name());
                    entry.latest_fail_reason = Some(reason.to_string());
                    entry.latest_fail_time = Some(now);
                }
            }
        });
    }

    /// Kills a mutation. Returns the removed entry, or `None` if unknown.
    pub fn kill(&self, version: u64) -> Result<Option<MutationEntry>> {
        let mut log = self.log.lock();
        let entry = match self.snapshot().entries.get(&version) {
            Some(entry) => entry.clone(),
            None => return Ok(None),
        };
        log.append(&LogRecord::Kill { version })?;
        self.publish(|state| {
            state.entries.remove(&version);
            state.killed.insert(version);
        });
        info!("Killed mutation {}", version);
        Ok(Some(entry))
    }

    /// Removes finished entries.
    ///
    /// Entries are removed when done for at least `retention`, or when done
    /// at all if `truncate` is set. Pending entries are never removed. Log
    /// segments left without live entries are deleted.
    pub fn gc(&self, retention: Duration, truncate: bool) -> Result<Vec<u64>> {
        let mut log = self.log.lock();
        let snapshot = self.snapshot();
        let removable: Vec<u64> = snapshot
            .entries
            .values()
            .filter(|entry| {
                entry.is_done
                    && (truncate
                        || entry
                            .done_at
                            .is_some_and(|done_at| done_at.elapsed() >= retention))
            })
            .map(|entry| entry.version)
            .collect();
        if removable.is_empty() {
            return Ok(removable);
        }

        for version in &removable {
            log.append(&LogRecord::Remove { version: *version })?;
        }
        self.publish(|state| {
            for version in &removable {
                state.entries.remove(version);
            }
        });

        let live = self.snapshot();
        let segments = log.truncate(|version| live.entries.contains_key(&version))?;
        debug!(
            "Removed {} finished mutations, {} log segments",
            removable.len(),
            segments
        );
        Ok(removable)
    }

    /// Status of every tracked mutation.
    pub fn status(&self) -> Vec<MutationStatus> {
        self.snapshot()
            .entries
            .values()
            .map(|entry| MutationStatus {
                version: entry.version,
                command: summarize(&entry.commands),
                create_time: entry.create_time,
                block_numbers: entry.block_numbers.clone(),
                is_done: entry.is_done,
                parts_to_do: entry.parts_to_do,
                latest_failed_part: entry.latest_failed_part.clone(),
                latest_fail_reason: entry.latest_fail_reason.clone(),
                latest_fail_time: entry.latest_fail_time,
            })
            .collect()
    }
}
