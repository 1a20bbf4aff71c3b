//! The table engine handle.
//!
//! [`MergeTreeTable`] owns one table's registry, mutation ledger, scheduler
//! and action locks and exposes the administrative operations. Several
//! tables can live in one process; nothing is global.

use crate::config::TableSettings;
use crate::error::{MergeTreeError, Result};
use crate::merge::executor::{JobOutcome, TaskExecutor};
use crate::merge::selector::{MergeRequest, Selection};
use crate::mutation::{MutationCommand, MutationLedger, MutationStatus};
use crate::part::{
    validate_partition_id, DataPartPtr, DiskStorage, PartInfo, PartStorage, Row,
};
use crate::part_log::{PartLog, PartLogEntry, PartLogEvent};
use crate::registry::{ActiveParts, PartRegistry};
use crate::scheduler::{
    ActionKind, ActionLockStatus, ActionLocks, BackgroundScheduler, SchedulerContext,
};
use crate::wait::{ChangeSignal, WaitCoordinator};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Name of the mutation log directory under a table's data directory.
pub const MUTATIONS_DIR: &str = "mutations";

/// Result of `kill_mutation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationCode {
    /// The mutation was removed and running jobs were told to stop.
    CancelSent,
    /// No pending mutation has this version.
    NotFound,
}

/// A merge-tree table.
///
/// # Examples
/// ```rust,ignore
/// use alopex_mergetree::{MergeTreeTable, Row, TableSettings};
/// use alopex_mergetree::mutation::{MutationCommand, RowPredicate};
/// use std::time::Duration;
///
/// let table = MergeTreeTable::open_dir("/data/events", TableSettings::default())?;
/// table.insert("202401", vec![Row::new(1, 0, 10), Row::new(2, 0, 20)])?;
///
/// let version = table.submit_mutation(vec![MutationCommand::delete(RowPredicate::KeyEquals(1))])?;
/// table.wait_for_mutation(version, Duration::from_secs(5))?;
/// ```
#[derive(Debug)]
pub struct MergeTreeTable {
    settings: TableSettings,
    storage: Arc<dyn PartStorage>,
    registry: Arc<PartRegistry>,
    ledger: Arc<MutationLedger>,
    locks: Arc<ActionLocks>,
    part_log: Arc<PartLog>,
    scheduler: BackgroundScheduler,
    waits: WaitCoordinator,
    loader: Mutex<Option<JoinHandle<()>>>,
}

impl MergeTreeTable {
    /// Opens a table stored in `path`, with the mutation log in
    /// `path/mutations`.
    pub fn open_dir(path: impl AsRef<Path>, settings: TableSettings) -> Result<Self> {
        let path = path.as_ref();
        let storage = Arc::new(DiskStorage::new(path)?);
        Self::open(storage, path.join(MUTATIONS_DIR), settings)
    }

    /// Opens a table over any storage backend.
    ///
    /// Active parts are registered before this returns; covered parts are
    /// loaded in the background (inline with a pool size of 0). Background
    /// threads start immediately unless the pool size is 0.
    pub fn open(
        storage: Arc<dyn PartStorage>,
        log_dir: impl AsRef<Path>,
        settings: TableSettings,
    ) -> Result<Self> {
        settings.validate()?;
        let signal = Arc::new(ChangeSignal::new());
        let (registry, report) =
            PartRegistry::load(Arc::clone(&storage), &settings, Arc::clone(&signal))?;
        let registry = Arc::new(registry);
        let ledger = Arc::new(MutationLedger::open(
            log_dir,
            settings.mutation_log.clone(),
            registry.max_data_version(),
            Arc::clone(&signal),
        )?);
        ledger.refresh(|| registry.mutation_subjects());

        let part_log = Arc::new(PartLog::new(settings.part_log_capacity));
        let locks = Arc::new(ActionLocks::new());
        let executor = Arc::new(TaskExecutor::new(
            Arc::clone(&storage),
            Arc::clone(&registry),
            Arc::clone(&ledger),
            Arc::clone(&part_log),
            settings.merge_mode,
        ));
        let scheduler = BackgroundScheduler::new(
            SchedulerContext {
                registry: Arc::clone(&registry),
                ledger: Arc::clone(&ledger),
                executor,
                part_log: Arc::clone(&part_log),
                locks: Arc::clone(&locks),
            },
            &settings,
        );
        let waits = WaitCoordinator::new(Arc::clone(&ledger), Arc::clone(&registry), signal);

        let loader = if report.outdated == 0 {
            None
        } else if settings.background_pool_size == 0 {
            registry.load_outdated_parts();
            None
        } else {
            let registry = Arc::clone(&registry);
            Some(
                thread::Builder::new()
                    .name("mergetree-outdated-loader".to_string())
                    .spawn(move || {
                        registry.load_outdated_parts();
                    })?,
            )
        };

        let table = Self {
            settings,
            storage,
            registry,
            ledger,
            locks,
            part_log,
            scheduler,
            waits,
            loader: Mutex::new(loader),
        };
        table.scheduler.start()?;
        info!(
            "Opened table with {} active parts and {} mutations",
            report.active,
            table.ledger.snapshot().len()
        );
        Ok(table)
    }

    /// Table settings.
    pub fn settings(&self) -> &TableSettings {
        &self.settings
    }

    /// Part registry of this table.
    pub fn registry(&self) -> &Arc<PartRegistry> {
        &self.registry
    }

    /// Inserts rows as a new level-0 part of `partition_id`.
    ///
    /// Mutations submitted while the part is being written count it as a
    /// subject from the moment its block number is allocated.
    pub fn insert(&self, partition_id: &str, mut rows: Vec<Row>) -> Result<DataPartPtr> {
        rows.sort_by_key(|row| row.key);
        let block = self.registry.allocate_block_number(partition_id)?;
        let info = PartInfo::new(partition_id, block, block, 0);
        let committed = self
            .storage
            .write_part(&info, &rows)
            .and_then(|meta| self.registry.commit_new_part(info.clone(), meta));
        let part = match committed {
            Ok(part) => part,
            Err(e) => {
                if let Err(discard_err) = self.storage.discard_temporary(&info) {
                    warn!("Failed to discard temporary part {}: {}", info, discard_err);
                }
                self.registry.abandon_block(&info);
                self.ledger.refresh(|| self.registry.mutation_subjects());
                return Err(e);
            }
        };
        self.part_log
            .record(PartLogEntry::new(PartLogEvent::NewPart, part.name()).with_rows(part.rows()));
        self.scheduler.trigger();
        Ok(part)
    }

    /// Snapshot of active parts.
    pub fn list_active(&self) -> ActiveParts {
        self.registry.list_active()
    }

    /// Reads every row of the active parts, part by part.
    pub fn read_rows(&self) -> Result<Vec<Row>> {
        let active = self.registry.list_active();
        let mut rows = Vec::new();
        for part in active.iter() {
            rows.extend(self.storage.read_part(part.info())?);
        }
        Ok(rows)
    }

    /// Blocks a category of background work until resumed. Running jobs
    /// finish. Returns false if it was already paused.
    pub fn pause_category(&self, kind: ActionKind) -> bool {
        self.locks.pause(kind)
    }

    /// Lifts a pause and schedules immediately.
    pub fn resume_category(&self, kind: ActionKind) -> bool {
        let resumed = self.locks.resume(kind);
        self.scheduler.trigger();
        resumed
    }

    /// State of every action lock category.
    pub fn action_lock_status(&self) -> Vec<ActionLockStatus> {
        self.locks.status()
    }

    /// Submits a mutation. The fence is the current block number of every
    /// partition: parts inserted afterwards are not affected.
    pub fn submit_mutation(&self, commands: Vec<MutationCommand>) -> Result<u64> {
        let version = self
            .ledger
            .submit(commands, || self.registry.fence_and_subjects())?;
        self.scheduler.trigger();
        Ok(version)
    }

    /// Kills a pending mutation and cancels jobs applying it.
    pub fn kill_mutation(&self, version: u64) -> Result<CancellationCode> {
        if self.ledger.kill(version)?.is_none() {
            return Ok(CancellationCode::NotFound);
        }
        let signalled = self.scheduler.cancel_mutation(version);
        debug!(
            "Signalled {} running jobs to stop mutation {}",
            signalled, version
        );
        self.scheduler.trigger();
        Ok(CancellationCode::CancelSent)
    }

    /// Blocks until mutation `version` is applied to every part it covers.
    pub fn wait_for_mutation(&self, version: u64, timeout: Duration) -> Result<()> {
        self.waits.wait_for_mutation(version, timeout)
    }

    /// Status of every tracked mutation.
    pub fn mutations_status(&self) -> Vec<MutationStatus> {
        self.ledger.status()
    }

    /// Blocks until outdated parts found at open are registered.
    pub fn wait_for_outdated_parts_to_be_loaded(&self, timeout: Duration) -> Result<()> {
        self.waits.wait_for_outdated_parts_to_be_loaded(timeout)
    }

    /// Blocks until no outdated part is referenced by a reader or job.
    pub fn wait_for_all_outdated_parts_released(&self, timeout: Duration) -> Result<()> {
        self.waits.wait_for_all_outdated_parts_released(timeout)
    }

    /// Runs one aggressive merge on the calling thread.
    ///
    /// With `final_merge`, every part of the partition is merged into one.
    /// Returns the reason when there is nothing to merge.
    ///
    /// # Errors
    ///
    /// `Conflict` if a concurrent drop retired an input, or the error of a
    /// failed merge.
    pub fn optimize(
        &self,
        partition_id: Option<&str>,
        final_merge: bool,
        deduplicate: bool,
    ) -> Result<Selection<DataPartPtr>> {
        if let Some(id) = partition_id {
            validate_partition_id(id)?;
        }
        let request = MergeRequest {
            partition: partition_id.map(str::to_string),
            aggressive: true,
            final_merge,
            deduplicate,
        };
        let claimed = match self.scheduler.select_merge(&request) {
            Selection::Found(claimed) => claimed,
            Selection::Empty { reason } => {
                info!("Nothing to optimize: {}", reason);
                return Ok(Selection::Empty { reason });
            }
        };
        match self.scheduler.run(claimed) {
            JobOutcome::Merged(part) | JobOutcome::Mutated(part) => Ok(Selection::Found(part)),
            JobOutcome::Aborted(reason) => Err(MergeTreeError::Conflict(reason)),
            JobOutcome::Failed(e) => Err(e),
        }
    }

    /// Drops one active part.
    ///
    /// # Errors
    ///
    /// `PartBusy` if a background job holds it, `PartNotFound` if it is not
    /// active.
    pub fn drop_part(&self, name: &str) -> Result<()> {
        let info = PartInfo::parse_name(name)
            .map_err(|_| MergeTreeError::PartNotFound(name.to_string()))?;
        self.scheduler.with_selection_lock(|processing| {
            if processing.contains(&info) {
                return Err(MergeTreeError::PartBusy(name.to_string()));
            }
            self.registry.retire(name)
        })?;
        info!("Dropped part {}", name);
        self.ledger.refresh(|| self.registry.mutation_subjects());
        Ok(())
    }

    /// Drops every active part of a partition. Jobs running over the
    /// partition fail to commit with `Conflict`. Returns the number of parts
    /// dropped.
    pub fn drop_partition(&self, partition_id: &str) -> Result<usize> {
        validate_partition_id(partition_id)?;
        let retired = {
            let _merges = self.locks.lock(ActionKind::Merges);
            let retired = self
                .scheduler
                .with_selection_lock(|_| self.registry.retire_partition(partition_id));
            self.ledger.refresh(|| self.registry.mutation_subjects());
            retired
        };
        info!(
            "Dropped partition {} ({} parts)",
            partition_id,
            retired.len()
        );
        self.scheduler.trigger();
        Ok(retired.len())
    }

    /// Removes unreferenced outdated parts now, ignoring the reaper throttle.
    /// Parts younger than the retention window stay. Returns removed names.
    pub fn clear_old_parts(&self) -> Vec<String> {
        let removed = self.registry.reap_outdated(true);
        for name in &removed {
            self.part_log
                .record(PartLogEntry::new(PartLogEvent::RemovePart, name.as_str()));
        }
        removed
    }

    /// Removes finished mutations older than the retention, or every finished
    /// mutation with `truncate`. Returns removed versions.
    pub fn clear_old_mutations(&self, truncate: bool) -> Result<Vec<u64>> {
        self.ledger
            .gc(self.settings.finished_mutation_retention, truncate)
    }

    /// Selects and runs one background job on the calling thread.
    pub fn run_background_job(&self) -> Selection<JobOutcome> {
        self.scheduler.run_background_job()
    }

    /// Runs background jobs inline until nothing is left to do. Returns the
    /// number of jobs run.
    pub fn run_until_idle(&self) -> usize {
        let mut jobs = 0;
        while self.scheduler.run_background_job().is_found() {
            jobs += 1;
        }
        jobs
    }

    /// Recent part events.
    pub fn part_log(&self) -> Vec<PartLogEntry> {
        self.part_log.entries()
    }

    /// Reason background work was halted, if it was.
    pub fn broken_reason(&self) -> Option<String> {
        self.registry.broken_reason()
    }

    /// Starts background threads if they are not running.
    pub fn start(&self) -> Result<()> {
        self.scheduler.start()
    }

    /// Stops background work and joins every thread. Idempotent.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        if let Some(loader) = self.loader.lock().take() {
            if loader.join().is_err() {
                warn!("Outdated part loader panicked");
            }
        }
    }
}

impl Drop for MergeTreeTable {
    fn drop(&mut self) {
        self.shutdown();
    }
}
