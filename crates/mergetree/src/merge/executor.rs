//! Task executor: runs one claimed merge or mutation job to completion.

use crate::error::{MergeTreeError, Result};
use crate::merge::mode::{drop_expired, merge_rows, MergeMode};
use crate::merge::selector::{MergeCandidate, MergeKind, MutationCandidate};
use crate::mutation::{apply_commands, MutationLedger};
use crate::part::{DataPartPtr, PartInfo, PartStorage};
use crate::part_log::{PartLog, PartLogEntry, PartLogEvent};
use crate::registry::PartRegistry;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// A claimed unit of background work.
#[derive(Debug, Clone)]
pub enum Job {
    /// Merge several parts (or rewrite one for TTL).
    Merge(MergeCandidate),
    /// Apply pending mutations to one part.
    Mutate(MutationCandidate),
}

impl Job {
    /// Parts the job reads and replaces.
    pub fn inputs(&self) -> Vec<DataPartPtr> {
        match self {
            Self::Merge(candidate) => candidate.parts.clone(),
            Self::Mutate(candidate) => vec![Arc::clone(&candidate.part)],
        }
    }

    /// Identity of the part the job produces.
    pub fn output(&self) -> &PartInfo {
        match self {
            Self::Merge(candidate) => &candidate.output,
            Self::Mutate(candidate) => &candidate.output,
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Merge(candidate) => write!(f, "merge {}", candidate),
            Self::Mutate(candidate) => write!(f, "mutation {}", candidate),
        }
    }
}

/// How a job ended.
#[derive(Debug)]
pub enum JobOutcome {
    /// The merged part was committed.
    Merged(DataPartPtr),
    /// The mutated part was committed.
    Mutated(DataPartPtr),
    /// An input was retired concurrently or the job was cancelled. Not an
    /// error.
    Aborted(String),
    /// The job failed; its parts stay active and are retried later.
    Failed(MergeTreeError),
}

impl JobOutcome {
    /// The committed part, if any.
    pub fn committed(&self) -> Option<&DataPartPtr> {
        match self {
            Self::Merged(part) | Self::Mutated(part) => Some(part),
            Self::Aborted(_) | Self::Failed(_) => None,
        }
    }
}

/// Executes jobs against storage and commits them to the registry.
#[derive(Debug)]
pub struct TaskExecutor {
    storage: Arc<dyn PartStorage>,
    registry: Arc<PartRegistry>,
    ledger: Arc<MutationLedger>,
    part_log: Arc<PartLog>,
    merge_mode: MergeMode,
}

impl TaskExecutor {
    /// Creates an executor.
    pub fn new(
        storage: Arc<dyn PartStorage>,
        registry: Arc<PartRegistry>,
        ledger: Arc<MutationLedger>,
        part_log: Arc<PartLog>,
        merge_mode: MergeMode,
    ) -> Self {
        Self {
            storage,
            registry,
            ledger,
            part_log,
            merge_mode,
        }
    }

    /// Runs `job`. Never panics on job errors; failures are reported through
    /// the outcome, the part log and, for mutations, the ledger.
    ///
    /// `cancelled` is checked between steps; once set, the job stops without
    /// committing.
    pub fn execute(&self, job: &Job, cancelled: &AtomicBool) -> JobOutcome {
        let started = Instant::now();
        debug!("Starting {}", job);
        let result = match job {
            Job::Merge(candidate) => self.merge(candidate, cancelled),
            Job::Mutate(candidate) => self.mutate(candidate, cancelled),
        };

        let (event, sources) = match job {
            Job::Merge(candidate) => (
                PartLogEvent::MergeParts,
                candidate.parts.iter().map(|p| p.name().to_string()).collect(),
            ),
            Job::Mutate(candidate) => {
                (PartLogEvent::MutatePart, vec![candidate.part.name().to_string()])
            }
        };
        let entry = PartLogEntry::new(event, job.output().name())
            .with_sources(sources)
            .with_duration(started.elapsed());

        match result {
            Ok(part) => {
                debug!("Finished {} in {:?}", job, started.elapsed());
                self.part_log.record(entry.with_rows(part.rows()));
                match job {
                    Job::Merge(_) => JobOutcome::Merged(part),
                    Job::Mutate(_) => JobOutcome::Mutated(part),
                }
            }
            Err(e) => {
                if let Err(discard_err) = self.storage.discard_temporary(job.output()) {
                    warn!(
                        "Failed to discard temporary part {}: {}",
                        job.output(),
                        discard_err
                    );
                }
                let reason = e.to_string();
                self.part_log.record(entry.with_error(reason.clone()));
                match e {
                    MergeTreeError::Conflict(_) | MergeTreeError::Cancelled(_) => {
                        debug!("Aborted {}: {}", job, reason);
                        JobOutcome::Aborted(reason)
                    }
                    other => {
                        warn!("Failed {}: {}", job, reason);
                        if let Job::Mutate(candidate) = job {
                            self.ledger.record_failure(
                                candidate.part.info(),
                                candidate.target_version,
                                &reason,
                            );
                        }
                        JobOutcome::Failed(other)
                    }
                }
            }
        }
    }

    fn merge(&self, candidate: &MergeCandidate, cancelled: &AtomicBool) -> Result<DataPartPtr> {
        let mut inputs = Vec::with_capacity(candidate.parts.len());
        for part in &candidate.parts {
            check_cancelled(cancelled, "merge")?;
            inputs.push(self.storage.read_part(part.info())?);
        }
        let mut rows = merge_rows(self.merge_mode, inputs, candidate.deduplicate);
        if let MergeKind::Ttl { cutoff } = candidate.kind {
            let before = rows.len();
            rows = drop_expired(rows, cutoff);
            trace!(
                "TTL merge of {} dropped {} rows",
                candidate.output,
                before - rows.len()
            );
        }
        check_cancelled(cancelled, "merge")?;
        let meta = self.storage.write_part(&candidate.output, &rows)?;
        self.registry
            .commit_merge(&candidate.parts, candidate.output.clone(), meta)
    }

    fn mutate(&self, candidate: &MutationCandidate, cancelled: &AtomicBool) -> Result<DataPartPtr> {
        let mut rows = self.storage.read_part(candidate.part.info())?;
        for (version, commands) in &candidate.commands {
            rows = apply_commands(rows, commands, cancelled)?;
            trace!(
                "Applied mutation {} to {}, {} rows left",
                version,
                candidate.part,
                rows.len()
            );
        }
        check_cancelled(cancelled, "mutation")?;
        let meta = self.storage.write_part(&candidate.output, &rows)?;
        check_cancelled(cancelled, "mutation")?;
        let part =
            self.registry
                .commit_mutation(&candidate.part, candidate.output.clone(), meta)?;
        self.ledger
            .mark_applied(candidate.part.info(), candidate.target_version, || {
                self.registry.mutation_subjects()
            });
        Ok(part)
    }
}

fn check_cancelled(cancelled: &AtomicBool, what: &str) -> Result<()> {
    if cancelled.load(Ordering::Acquire) {
        return Err(MergeTreeError::Cancelled(format!("{} cancelled", what)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableSettings;
    use crate::merge::selector::{
        select_part_to_mutate, select_parts_to_merge, MergeRequest, SelectionInput,
        SelectorSettings,
    };
    use crate::mutation::{MutationCommand, RowPredicate};
    use crate::part::{DiskStorage, Row};
    use crate::wait::ChangeSignal;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        storage: Arc<DiskStorage>,
        registry: Arc<PartRegistry>,
        ledger: Arc<MutationLedger>,
        part_log: Arc<PartLog>,
        executor: TaskExecutor,
    }

    fn fixture(mode: MergeMode) -> Fixture {
        let dir = TempDir::new().unwrap();
        let signal = Arc::new(ChangeSignal::new());
        let storage = Arc::new(DiskStorage::new(dir.path()).unwrap());
        let (registry, _) =
            PartRegistry::load(storage.clone(), &TableSettings::default(), signal.clone())
                .unwrap();
        let registry = Arc::new(registry);
        let ledger = Arc::new(
            MutationLedger::open(dir.path().join("mutations"), Default::default(), 0, signal)
                .unwrap(),
        );
        let part_log = Arc::new(PartLog::new(16));
        let executor = TaskExecutor::new(
            storage.clone(),
            registry.clone(),
            ledger.clone(),
            part_log.clone(),
            mode,
        );
        Fixture {
            _dir: dir,
            storage,
            registry,
            ledger,
            part_log,
            executor,
        }
    }

    impl Fixture {
        fn insert(&self, rows: &[Row]) {
            let block = self.registry.allocate_block_number("p").unwrap();
            let info = PartInfo::new("p", block, block, 0);
            let meta = self.storage.write_part(&info, rows).unwrap();
            self.registry.commit_new_part(info, meta).unwrap();
        }

        fn merge_job(&self) -> Job {
            let active = self.registry.list_active();
            let ledger = self.ledger.snapshot();
            let settings = SelectorSettings::from(&TableSettings::default());
            let processing = BTreeSet::new();
            let input = SelectionInput {
                active: &active,
                processing: &processing,
                ledger: &ledger,
                outdated: &[],
                settings: &settings,
            };
            Job::Merge(
                select_parts_to_merge(&input, &MergeRequest::regular())
                    .found()
                    .unwrap(),
            )
        }

        fn mutation_job(&self) -> Job {
            let active = self.registry.list_active();
            let ledger = self.ledger.snapshot();
            let settings = SelectorSettings::from(&TableSettings::default());
            let processing = BTreeSet::new();
            let input = SelectionInput {
                active: &active,
                processing: &processing,
                ledger: &ledger,
                outdated: &[],
                settings: &settings,
            };
            Job::Mutate(select_part_to_mutate(&input).found().unwrap())
        }
    }

    #[test]
    fn test_merge_job_commits_merged_rows() {
        let fx = fixture(MergeMode::Replacing);
        fx.insert(&[Row::new(1, 0, 10), Row::new(2, 0, 20)]);
        fx.insert(&[Row::new(1, 1, 11)]);

        let job = fx.merge_job();
        let outcome = fx.executor.execute(&job, &AtomicBool::new(false));
        let part = outcome.committed().unwrap().clone();
        assert_eq!(part.name(), "p_1_2_1");

        let rows = fx.storage.read_part(part.info()).unwrap();
        assert_eq!(rows, vec![Row::new(1, 1, 11), Row::new(2, 0, 20)]);
        let log = fx.part_log.entries_of(PartLogEvent::MergeParts);
        assert_eq!(log[0].source_parts, ["p_1_1_0", "p_2_2_0"]);
        assert!(log[0].error.is_none());
    }

    #[test]
    fn test_merge_conflict_is_aborted() {
        let fx = fixture(MergeMode::Ordinary);
        fx.insert(&[Row::new(1, 0, 1)]);
        fx.insert(&[Row::new(2, 0, 1)]);
        let job = fx.merge_job();
        fx.registry.retire_partition("p");

        let outcome = fx.executor.execute(&job, &AtomicBool::new(false));
        assert!(matches!(outcome, JobOutcome::Aborted(_)));
        assert!(fx.registry.list_active().is_empty());
        assert!(fx.storage.list_parts().unwrap().leftovers.is_empty());
    }

    #[test]
    fn test_mutation_job_marks_applied() {
        let fx = fixture(MergeMode::Ordinary);
        fx.insert(&[Row::new(1, 0, 1), Row::new(2, 0, 2)]);
        let version = fx
            .ledger
            .submit(
                vec![MutationCommand::delete(RowPredicate::KeyEquals(1))],
                || fx.registry.fence_and_subjects(),
            )
            .unwrap();

        let job = fx.mutation_job();
        let outcome = fx.executor.execute(&job, &AtomicBool::new(false));
        assert!(matches!(outcome, JobOutcome::Mutated(_)));
        let active = fx.registry.list_active();
        assert_eq!(active[0].data_version(), version);
        assert_eq!(
            fx.storage.read_part(active[0].info()).unwrap(),
            vec![Row::new(2, 0, 2)]
        );
        assert!(fx.ledger.snapshot().entry(version).unwrap().is_done);
    }

    #[test]
    fn test_cancelled_mutation_leaves_part_untouched() {
        let fx = fixture(MergeMode::Ordinary);
        fx.insert(&[Row::new(1, 0, 1)]);
        fx.ledger
            .submit(
                vec![MutationCommand::delete(RowPredicate::All)],
                || fx.registry.fence_and_subjects(),
            )
            .unwrap();

        let job = fx.mutation_job();
        let outcome = fx.executor.execute(&job, &AtomicBool::new(true));
        assert!(matches!(outcome, JobOutcome::Aborted(_)));
        assert_eq!(fx.registry.list_active()[0].name(), "p_1_1_0");
        let status = &fx.ledger.status()[0];
        assert!(status.latest_fail_reason.is_none());
    }

    #[test]
    fn test_failed_mutation_records_failure() {
        let fx = fixture(MergeMode::Ordinary);
        fx.insert(&[Row::new(1, 0, 1)]);
        fx.ledger
            .submit(
                vec![MutationCommand::delete(RowPredicate::All)],
                || fx.registry.fence_and_subjects(),
            )
            .unwrap();
        let job = fx.mutation_job();
        let part = fx.registry.list_active()[0].clone();
        std::fs::remove_dir_all(fx.storage.part_dir(part.info())).unwrap();

        let outcome = fx.executor.execute(&job, &AtomicBool::new(false));
        assert!(matches!(outcome, JobOutcome::Failed(_)));
        let status = &fx.ledger.status()[0];
        assert_eq!(status.latest_failed_part.as_deref(), Some("p_1_1_0"));
        assert!(status.latest_fail_reason.is_some());
        assert!(!status.is_done);
    }
}
