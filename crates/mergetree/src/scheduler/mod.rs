//! Background scheduler.
//!
//! One scheduler thread wakes on triggers (inserts, mutation submissions,
//! finished jobs, resumes) or on the poll interval, runs housekeeping, then
//! selects and claims jobs until no worker slot is free or nothing is left
//! to do. Claimed jobs go to a fixed pool of worker threads.
//!
//! The currently-processing set and the selector run under one mutex: a part
//! is claimed in the same critical section that saw it unclaimed, so two
//! ticks can never select overlapping parts.

pub mod action_lock;

pub use action_lock::{ActionBlocker, ActionKind, ActionLock, ActionLockStatus, ActionLocks};

use crate::config::{MergeGapPolicy, TableSettings};
use crate::error::{MergeTreeError, Result};
use crate::merge::executor::{Job, JobOutcome, TaskExecutor};
use crate::merge::selector::{
    select_part_to_mutate, select_parts_to_merge, select_ttl_merge, MergeRequest, Selection,
    SelectionInput, SelectorSettings,
};
use crate::mutation::MutationLedger;
use crate::part::PartInfo;
use crate::part_log::{PartLog, PartLogEntry, PartLogEvent};
use crate::registry::PartRegistry;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

#[derive(Debug)]
struct RunningMutation {
    versions: BTreeSet<u64>,
    cancel: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct ProcessingState {
    parts: BTreeSet<PartInfo>,
    running: usize,
    mutations: BTreeMap<u64, RunningMutation>,
}

/// State shared between the scheduler and the taggers of running jobs.
#[derive(Debug, Default)]
struct Shared {
    processing: Mutex<ProcessingState>,
    released: Condvar,
    wake: Mutex<bool>,
    wake_cv: Condvar,
    shutdown: AtomicBool,
    next_job_id: AtomicU64,
}

impl Shared {
    fn trigger(&self) {
        let mut pending = self.wake.lock();
        *pending = true;
        self.wake_cv.notify_all();
    }
}

/// Claim on the parts of one job; releases them and triggers a tick on drop.
#[derive(Debug)]
pub struct PartsTagger {
    shared: Arc<Shared>,
    parts: Vec<PartInfo>,
    job_id: u64,
}

impl PartsTagger {
    /// Claimed parts.
    pub fn parts(&self) -> &[PartInfo] {
        &self.parts
    }
}

impl Drop for PartsTagger {
    fn drop(&mut self) {
        {
            let mut state = self.shared.processing.lock();
            for part in &self.parts {
                state.parts.remove(part);
            }
            state.running = state.running.saturating_sub(1);
            state.mutations.remove(&self.job_id);
        }
        self.shared.released.notify_all();
        self.shared.trigger();
    }
}

/// A job together with its claim and cancellation flag.
#[derive(Debug)]
pub struct ClaimedJob {
    /// The job.
    pub job: Job,
    /// Set by `kill_mutation`; checked by the executor between steps.
    pub cancel: Arc<AtomicBool>,
    tagger: PartsTagger,
}

impl ClaimedJob {
    /// Parts held by this job.
    pub fn parts(&self) -> &[PartInfo] {
        self.tagger.parts()
    }
}

/// Collaborators of the scheduler.
#[derive(Debug)]
pub struct SchedulerContext {
    /// Part registry.
    pub registry: Arc<PartRegistry>,
    /// Mutation ledger.
    pub ledger: Arc<MutationLedger>,
    /// Executor of claimed jobs.
    pub executor: Arc<TaskExecutor>,
    /// Part event history.
    pub part_log: Arc<PartLog>,
    /// Action locks of the table.
    pub locks: Arc<ActionLocks>,
}

#[derive(Debug)]
struct Inner {
    ctx: SchedulerContext,
    shared: Arc<Shared>,
    selector: SelectorSettings,
    settings: TableSettings,
    last_gc: Mutex<Option<Instant>>,
}

/// The background scheduler of one table.
#[derive(Debug)]
pub struct BackgroundScheduler {
    inner: Arc<Inner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundScheduler {
    /// Creates a scheduler. No threads run until [`BackgroundScheduler::start`].
    pub fn new(ctx: SchedulerContext, settings: &TableSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                shared: Arc::new(Shared::default()),
                selector: SelectorSettings::from(settings),
                settings: settings.clone(),
                last_gc: Mutex::new(None),
            }),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the scheduler thread and `background_pool_size` workers.
    ///
    /// Does nothing with a pool size of 0 or when already started.
    pub fn start(&self) -> Result<()> {
        let pool_size = self.inner.settings.background_pool_size;
        let mut threads = self.threads.lock();
        if pool_size == 0 || !threads.is_empty() {
            return Ok(());
        }
        if self.inner.shared.shutdown.load(Ordering::Acquire) {
            return Err(MergeTreeError::ShuttingDown);
        }

        let (tx, rx) = mpsc::channel::<ClaimedJob>();
        let rx = Arc::new(Mutex::new(rx));
        for i in 0..pool_size {
            let inner = Arc::clone(&self.inner);
            let rx = Arc::clone(&rx);
            let handle = thread::Builder::new()
                .name(format!("mergetree-worker-{}", i))
                .spawn(move || run_worker(inner, rx))?;
            threads.push(handle);
        }
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("mergetree-scheduler".to_string())
            .spawn(move || run_scheduler(inner, tx))?;
        threads.push(handle);
        info!("Started background scheduler with {} workers", pool_size);
        Ok(())
    }

    /// Requests an immediate scheduling tick.
    pub fn trigger(&self) {
        self.inner.shared.trigger();
    }

    /// Stops the scheduler. In-flight jobs finish; queued jobs are dropped.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shared.trigger();
        let threads: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                error!("Background thread panicked during shutdown");
            }
        }
        info!("Background scheduler stopped");
    }

    /// Returns true once shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shared.shutdown.load(Ordering::Acquire)
    }

    /// Selects and claims the next background job, honouring the worker
    /// slot limit and action locks.
    pub fn select_job(&self) -> Selection<ClaimedJob> {
        self.inner.select_job()
    }

    /// Selects and claims a merge for `optimize`, bypassing the slot limit.
    pub fn select_merge(&self, request: &MergeRequest) -> Selection<ClaimedJob> {
        self.inner.select_merge(request)
    }

    /// Runs a claimed job on the calling thread and releases its parts.
    pub fn run(&self, claimed: ClaimedJob) -> JobOutcome {
        self.inner.run(claimed)
    }

    /// Runs one background job inline. Used when the pool size is 0.
    pub fn run_background_job(&self) -> Selection<JobOutcome> {
        self.inner.housekeeping();
        self.inner.select_job().map(|claimed| self.inner.run(claimed))
    }

    /// Reaper and ledger GC, throttled.
    pub fn housekeeping(&self) {
        self.inner.housekeeping();
    }

    /// Sets the cancellation flag of every running job applying `version`.
    /// Returns how many jobs were signalled.
    pub fn cancel_mutation(&self, version: u64) -> usize {
        let state = self.inner.shared.processing.lock();
        let mut signalled = 0;
        for running in state.mutations.values() {
            if running.versions.contains(&version) {
                running.cancel.store(true, Ordering::Release);
                signalled += 1;
            }
        }
        signalled
    }

    /// Runs `f` with the processing set locked, so no part can be selected
    /// or released meanwhile.
    pub fn with_selection_lock<R>(&self, f: impl FnOnce(&BTreeSet<PartInfo>) -> R) -> R {
        let state = self.inner.shared.processing.lock();
        f(&state.parts)
    }

    /// Parts currently claimed by jobs.
    pub fn processing_parts(&self) -> Vec<PartInfo> {
        self.inner
            .shared
            .processing
            .lock()
            .parts
            .iter()
            .cloned()
            .collect()
    }

    /// Number of claimed jobs.
    pub fn running_jobs(&self) -> usize {
        self.inner.shared.processing.lock().running
    }

    /// Blocks until no job holds a claim or `timeout` passes. Returns true
    /// if idle.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.shared.processing.lock();
        while state.running > 0 {
            if self
                .inner
                .shared
                .released
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.running == 0;
            }
        }
        true
    }
}

impl Drop for BackgroundScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn select_job(&self) -> Selection<ClaimedJob> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Selection::empty("table is shutting down");
        }
        if let Some(reason) = self.ctx.registry.broken_reason() {
            return Selection::empty(format!("table is broken: {}", reason));
        }
        let capacity = self.settings.background_pool_size.max(1);

        let mut state = self.shared.processing.lock();
        if state.running >= capacity {
            return Selection::empty("all background slots are busy");
        }
        let active = self.ctx.registry.list_active();
        let ledger = self.ctx.ledger.snapshot();
        let outdated = self.outdated_for_selection();
        let selection = {
            let input = SelectionInput {
                active: &active,
                processing: &state.parts,
                ledger: &ledger,
                outdated: &outdated,
                settings: &self.selector,
            };
            self.choose(&input)
        };
        selection.map(|job| self.claim(&mut state, job))
    }

    fn choose(&self, input: &SelectionInput<'_>) -> Selection<Job> {
        let locks = &self.ctx.locks;
        let merges_blocked = locks.is_blocked(ActionKind::Merges);
        let mut reasons = Vec::new();

        if merges_blocked {
            reasons.push("merges are disabled".to_string());
        } else {
            match select_parts_to_merge(input, &MergeRequest::regular()) {
                Selection::Found(candidate) => return Selection::Found(Job::Merge(candidate)),
                Selection::Empty { reason } => reasons.push(reason),
            }
        }

        if let Some(ttl) = self.settings.row_ttl {
            if locks.is_blocked(ActionKind::TtlMerges) {
                reasons.push("TTL merges are disabled".to_string());
            } else {
                match select_ttl_merge(input, ttl_cutoff(ttl)) {
                    Selection::Found(candidate) => {
                        return Selection::Found(Job::Merge(candidate))
                    }
                    Selection::Empty { reason } => reasons.push(reason),
                }
            }
        }

        if !merges_blocked {
            match select_part_to_mutate(input) {
                Selection::Found(candidate) => return Selection::Found(Job::Mutate(candidate)),
                Selection::Empty { reason } => reasons.push(reason),
            }
        }
        Selection::empty(reasons.join("; "))
    }

    fn select_merge(&self, request: &MergeRequest) -> Selection<ClaimedJob> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Selection::empty("table is shutting down");
        }
        if let Some(reason) = self.ctx.registry.broken_reason() {
            return Selection::empty(format!("table is broken: {}", reason));
        }
        if self.ctx.locks.is_blocked(ActionKind::Merges) {
            return Selection::empty("merges are disabled");
        }
        let mut state = self.shared.processing.lock();
        let active = self.ctx.registry.list_active();
        let ledger = self.ctx.ledger.snapshot();
        let outdated = self.outdated_for_selection();
        let selection = {
            let input = SelectionInput {
                active: &active,
                processing: &state.parts,
                ledger: &ledger,
                outdated: &outdated,
                settings: &self.selector,
            };
            select_parts_to_merge(&input, request)
        };
        selection.map(|candidate| self.claim(&mut state, Job::Merge(candidate)))
    }

    fn outdated_for_selection(&self) -> Vec<PartInfo> {
        match self.selector.gap_policy {
            MergeGapPolicy::Forbid => Vec::new(),
            MergeGapPolicy::AllowLowerLevels => self.ctx.registry.outdated_infos(),
        }
    }

    fn claim(&self, state: &mut ProcessingState, job: Job) -> ClaimedJob {
        let job_id = self.shared.next_job_id.fetch_add(1, Ordering::Relaxed);
        let parts: Vec<PartInfo> = job.inputs().iter().map(|p| p.info().clone()).collect();
        state.parts.extend(parts.iter().cloned());
        state.running += 1;

        let cancel = Arc::new(AtomicBool::new(false));
        if let Job::Mutate(candidate) = &job {
            state.mutations.insert(
                job_id,
                RunningMutation {
                    versions: candidate.commands.iter().map(|(v, _)| *v).collect(),
                    cancel: Arc::clone(&cancel),
                },
            );
        }
        debug!("Claimed {}", job);
        ClaimedJob {
            job,
            cancel,
            tagger: PartsTagger {
                shared: Arc::clone(&self.shared),
                parts,
                job_id,
            },
        }
    }

    fn run(&self, claimed: ClaimedJob) -> JobOutcome {
        let ClaimedJob {
            job,
            cancel,
            tagger,
        } = claimed;
        let outcome = self.ctx.executor.execute(&job, &cancel);
        drop(tagger);
        outcome
    }

    fn housekeeping(&self) {
        for name in self.ctx.registry.reap_outdated(false) {
            self.ctx
                .part_log
                .record(PartLogEntry::new(PartLogEvent::RemovePart, name));
        }

        let due = {
            let mut last_gc = self.last_gc.lock();
            let due = last_gc.map_or(true, |at| at.elapsed() >= self.settings.cleanup_delay_period);
            if due {
                *last_gc = Some(Instant::now());
            }
            due
        };
        if due {
            if let Err(e) = self
                .ctx
                .ledger
                .gc(self.settings.finished_mutation_retention, false)
            {
                warn!("Failed to clean up finished mutations: {}", e);
            }
        }
    }
}

fn run_scheduler(inner: Arc<Inner>, jobs: Sender<ClaimedJob>) {
    let poll_interval = inner.settings.scheduler_poll_interval;
    loop {
        {
            let mut pending = inner.shared.wake.lock();
            if !*pending && !inner.shared.shutdown.load(Ordering::Acquire) {
                let _ = inner.shared.wake_cv.wait_for(&mut pending, poll_interval);
            }
            *pending = false;
        }
        if inner.shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        inner.housekeeping();
        loop {
            match inner.select_job() {
                Selection::Found(claimed) => {
                    if jobs.send(claimed).is_err() {
                        error!("Background workers are gone, stopping scheduler");
                        return;
                    }
                }
                Selection::Empty { reason } => {
                    debug!("Nothing to schedule: {}", reason);
                    break;
                }
            }
        }
    }
    debug!("Scheduler thread exiting");
}

fn run_worker(inner: Arc<Inner>, jobs: Arc<Mutex<Receiver<ClaimedJob>>>) {
    loop {
        let next = jobs.lock().recv();
        let Ok(claimed) = next else {
            break;
        };
        if inner.shared.shutdown.load(Ordering::Acquire) {
            debug!("Dropping queued {}", claimed.job);
            continue;
        }
        let description = claimed.job.to_string();
        let result = catch_unwind(AssertUnwindSafe(|| inner.run(claimed)));
        match result {
            Ok(JobOutcome::Failed(e)) => debug!("Background {} failed: {}", description, e),
            Ok(_) => {}
            Err(_) => error!("Background {} panicked", description),
        }
    }
}

/// Row timestamps below the returned value have outlived `ttl`.
pub fn ttl_cutoff(ttl: Duration) -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0);
    now.saturating_sub(i64::try_from(ttl.as_nanos()).unwrap_or(i64::MAX))
}
