//! End-to-end tests for merge selection, mutation fences, races and waits.

use alopex_mergetree::merge::Selection;
use alopex_mergetree::mutation::{Assignment, MutationCommand, MutationLedger, RowPredicate};
use alopex_mergetree::part::{DiskStorage, PartStorage};
use alopex_mergetree::scheduler::{ActionLocks, BackgroundScheduler, SchedulerContext};
use alopex_mergetree::{
    ActionKind, ChangeSignal, JobOutcome, MergeTreeError, MergeTreeTable, MutationLogConfig,
    PartInfo, PartLog, PartRegistry, Row, SyncMode, TableSettings, TaskExecutor,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn manual_settings() -> TableSettings {
    TableSettings::default()
        .with_background_pool_size(0)
        .with_mutation_log(MutationLogConfig::new(64 * 1024, SyncMode::None))
}

fn write_committed(storage: &DiskStorage, info: PartInfo, key: u64) {
    storage.write_part(&info, &[Row::new(key, 0, 1)]).unwrap();
    storage.commit_part(&info).unwrap();
}

fn active_names(table: &MergeTreeTable) -> Vec<String> {
    table
        .list_active()
        .iter()
        .map(|part| part.name().to_string())
        .collect()
}

/// Components wired by hand so tests can hold claims across operations.
struct Engine {
    _dir: TempDir,
    storage: Arc<DiskStorage>,
    registry: Arc<PartRegistry>,
    scheduler: BackgroundScheduler,
}

fn engine(settings: TableSettings) -> Engine {
    let dir = TempDir::new().unwrap();
    let signal = Arc::new(ChangeSignal::new());
    let storage = Arc::new(DiskStorage::new(dir.path()).unwrap());
    let (registry, _) = PartRegistry::load(storage.clone(), &settings, signal.clone()).unwrap();
    let registry = Arc::new(registry);
    let ledger = Arc::new(
        MutationLedger::open(
            dir.path().join("mutations"),
            settings.mutation_log.clone(),
            0,
            signal,
        )
        .unwrap(),
    );
    let part_log = Arc::new(PartLog::new(64));
    let executor = Arc::new(TaskExecutor::new(
        storage.clone(),
        registry.clone(),
        ledger.clone(),
        part_log.clone(),
        settings.merge_mode,
    ));
    let scheduler = BackgroundScheduler::new(
        SchedulerContext {
            registry: registry.clone(),
            ledger,
            executor,
            part_log,
            locks: Arc::new(ActionLocks::new()),
        },
        &settings,
    );
    Engine {
        _dir: dir,
        storage,
        registry,
        scheduler,
    }
}

impl Engine {
    fn insert(&self, partition: &str, key: u64) {
        let block = self.registry.allocate_block_number(partition).unwrap();
        let info = PartInfo::new(partition, block, block, 0);
        let meta = self
            .storage
            .write_part(&info, &[Row::new(key, 0, 1)])
            .unwrap();
        self.registry.commit_new_part(info, meta).unwrap();
    }
}

#[test]
fn test_lowest_start_pair_is_merged_first() {
    let temp_dir = TempDir::new().unwrap();
    {
        let storage = DiskStorage::new(temp_dir.path()).unwrap();
        write_committed(&storage, PartInfo::new("p", 0, 10, 0), 1);
        write_committed(&storage, PartInfo::new("p", 11, 20, 0), 2);
        write_committed(&storage, PartInfo::new("p", 21, 30, 0), 3);
    }
    let table = MergeTreeTable::open_dir(temp_dir.path(), manual_settings()).unwrap();

    let outcome = table.run_background_job().found().unwrap();
    assert_eq!(outcome.committed().unwrap().name(), "p_0_20_1");
    assert_eq!(active_names(&table), ["p_0_20_1", "p_21_30_0"]);
}

#[test]
fn test_parts_above_fence_are_not_subject() {
    let temp_dir = TempDir::new().unwrap();
    let ledger = MutationLedger::open(
        temp_dir.path(),
        MutationLogConfig::new(64 * 1024, SyncMode::None),
        0,
        Arc::new(ChangeSignal::new()),
    )
    .unwrap();
    let fence = BTreeMap::from([("p".to_string(), 20)]);
    ledger
        .submit(vec![MutationCommand::delete(RowPredicate::All)], || {
            (fence, Vec::new())
        })
        .unwrap();

    let snapshot = ledger.snapshot();
    assert_eq!(
        snapshot.outstanding_version_for(&PartInfo::new("p", 21, 30, 0)),
        None
    );
    assert_eq!(
        snapshot.outstanding_version_for(&PartInfo::new("p", 11, 20, 0)),
        Some(1)
    );
    assert_eq!(
        snapshot.outstanding_version_for(&PartInfo::new("q", 1, 1, 0)),
        None
    );
}

#[test]
fn test_inserts_after_submission_are_not_mutated() {
    let temp_dir = TempDir::new().unwrap();
    let table = MergeTreeTable::open_dir(temp_dir.path(), manual_settings()).unwrap();
    table.insert("p", vec![Row::new(1, 0, 1)]).unwrap();
    let version = table
        .submit_mutation(vec![MutationCommand::delete(RowPredicate::All)])
        .unwrap();
    table.insert("p", vec![Row::new(2, 0, 2)]).unwrap();

    // Parts with different pending mutations never merge.
    let optimize = table.optimize(Some("p"), false, false).unwrap();
    assert!(!optimize.is_found());
    table.run_until_idle();
    table.wait_for_mutation(version, Duration::from_secs(1)).unwrap();
    assert_eq!(table.read_rows().unwrap(), vec![Row::new(2, 0, 2)]);
}

#[test]
fn test_racing_selections_never_share_a_part() {
    let engine = engine(manual_settings().with_background_pool_size(8));
    let engine = Arc::new(engine);
    for key in 0..2 {
        engine.insert("p", key);
    }

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || engine.scheduler.select_job().found())
        })
        .collect();
    let claimed: Vec<_> = handles
        .into_iter()
        .filter_map(|handle| handle.join().unwrap())
        .collect();

    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].parts().len(), 2);
    assert_eq!(engine.scheduler.running_jobs(), 1);
    drop(claimed);
    assert_eq!(engine.scheduler.running_jobs(), 0);
}

#[test]
fn test_racing_optimize_claims_once() {
    let temp_dir = TempDir::new().unwrap();
    {
        let storage = DiskStorage::new(temp_dir.path()).unwrap();
        write_committed(&storage, PartInfo::new("p", 5, 9, 0), 1);
        write_committed(&storage, PartInfo::new("p", 10, 12, 0), 2);
    }
    let table = Arc::new(MergeTreeTable::open_dir(temp_dir.path(), manual_settings()).unwrap());
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let table = Arc::clone(&table);
            thread::spawn(move || table.optimize(Some("p"), false, false))
        })
        .collect();
    let merged = handles
        .into_iter()
        .map(|handle| handle.join().unwrap().unwrap())
        .filter(Selection::is_found)
        .count();

    assert_eq!(merged, 1);
    assert_eq!(active_names(&table), ["p_5_12_1"]);
}

#[test]
fn test_drop_partition_aborts_claimed_merge() {
    let engine = engine(manual_settings());
    engine.insert("p", 1);
    engine.insert("p", 2);
    engine.insert("q", 3);

    let claimed = engine.scheduler.select_job().found().unwrap();
    let retired = engine
        .scheduler
        .with_selection_lock(|_| engine.registry.retire_partition("p"));
    assert_eq!(retired.len(), 2);

    let outcome = engine.scheduler.run(claimed);
    assert!(matches!(outcome, JobOutcome::Aborted(_)));
    let names: Vec<String> = engine
        .registry
        .list_active()
        .iter()
        .map(|p| p.name().to_string())
        .collect();
    assert_eq!(names, ["q_1_1_0"]);
    assert!(engine.registry.broken_reason().is_none());
    assert!(engine.scheduler.processing_parts().is_empty());
}

#[test]
fn test_commit_merge_after_retire_is_conflict() {
    let engine = engine(manual_settings());
    engine.insert("p", 1);
    engine.insert("p", 2);
    let inputs = engine.registry.list_active().to_vec();
    engine.registry.retire("p_1_1_0").unwrap();

    let output = PartInfo::new("p", 1, 2, 1);
    let meta = engine
        .storage
        .write_part(&output, &[Row::new(1, 0, 1)])
        .unwrap();
    let result = engine.registry.commit_merge(&inputs, output, meta);
    assert!(matches!(result, Err(MergeTreeError::Conflict(_))));
    assert_eq!(engine.registry.list_active().len(), 1);
}

#[test]
fn test_wait_returns_once_mutation_is_applied() {
    let temp_dir = TempDir::new().unwrap();
    let settings = manual_settings()
        .with_background_pool_size(2)
        .with_scheduler_poll_interval(Duration::from_millis(20));
    let table = Arc::new(MergeTreeTable::open_dir(temp_dir.path(), settings).unwrap());
    table
        .insert("p", vec![Row::new(1, 0, 1), Row::new(2, 0, 2)])
        .unwrap();
    for _ in 0..6 {
        table
            .submit_mutation(vec![MutationCommand::update(
                RowPredicate::All,
                Assignment::Add(1),
            )])
            .unwrap();
    }

    let waiter = {
        let table = Arc::clone(&table);
        thread::spawn(move || table.wait_for_mutation(7, Duration::from_millis(5000)))
    };
    thread::sleep(Duration::from_millis(50));
    let version = table
        .submit_mutation(vec![MutationCommand::delete(RowPredicate::KeyEquals(1))])
        .unwrap();
    assert_eq!(version, 7);

    waiter.join().unwrap().unwrap();
    assert_eq!(table.read_rows().unwrap(), vec![Row::new(2, 0, 8)]);
    assert_eq!(table.list_active()[0].data_version(), 7);
    table.shutdown();
}

#[test]
fn test_wait_times_out_with_pending_mutation() {
    let temp_dir = TempDir::new().unwrap();
    let table = MergeTreeTable::open_dir(temp_dir.path(), manual_settings()).unwrap();
    table.insert("p", vec![Row::new(1, 0, 1)]).unwrap();
    let version = table
        .submit_mutation(vec![MutationCommand::delete(RowPredicate::All)])
        .unwrap();
    let err = table
        .wait_for_mutation(version, Duration::from_millis(30))
        .unwrap_err();
    assert!(matches!(err, MergeTreeError::MutationTimeout { version: v, .. } if v == version));

    let status = table.mutations_status();
    assert_eq!(status.len(), 1);
    assert!(!status[0].is_done);
    assert_eq!(status[0].parts_to_do, 1);
    assert_eq!(status[0].command, "DELETE WHERE 1");
}

#[test]
fn test_paused_merges_yield_nothing_until_resumed() {
    let temp_dir = TempDir::new().unwrap();
    let table = MergeTreeTable::open_dir(temp_dir.path(), manual_settings()).unwrap();
    table.insert("p", vec![Row::new(1, 0, 1)]).unwrap();
    table.insert("p", vec![Row::new(2, 0, 1)]).unwrap();

    assert!(table.pause_category(ActionKind::Merges));
    let selection = table.run_background_job();
    assert!(selection.reason().unwrap().contains("merges are disabled"));
    let optimize = table.optimize(None, false, false).unwrap();
    assert_eq!(optimize.reason(), Some("merges are disabled"));

    assert!(table.resume_category(ActionKind::Merges));
    let outcome = table.run_background_job().found().unwrap();
    assert_eq!(outcome.committed().unwrap().name(), "p_1_2_1");
}

#[test]
fn test_final_optimize_deduplicates() {
    let temp_dir = TempDir::new().unwrap();
    let table = MergeTreeTable::open_dir(temp_dir.path(), manual_settings()).unwrap();
    table.insert("p", vec![Row::new(1, 5, 1)]).unwrap();
    table.insert("p", vec![Row::new(1, 5, 1), Row::new(2, 5, 1)]).unwrap();

    let merged = table
        .optimize(Some("p"), true, true)
        .unwrap()
        .found()
        .unwrap();
    assert_eq!(merged.rows(), 2);
}
