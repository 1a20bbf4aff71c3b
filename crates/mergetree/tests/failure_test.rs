//! Failure injection through a storage wrapper.

use alopex_mergetree::mutation::{MutationCommand, RowPredicate};
use alopex_mergetree::part::{DiskStorage, PartListing, PartStorage};
use alopex_mergetree::{
    DataPartPtr, ErrorKind, JobOutcome, MergeTreeError, MergeTreeTable, MutationLogConfig, PartInfo,
    PartLogEvent, PartMeta, Result, Row, SyncMode, TableSettings,
};
use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

/// Disk storage whose next N reads, writes or commits fail.
#[derive(Debug)]
struct FlakyStorage {
    inner: DiskStorage,
    failing_reads: AtomicUsize,
    failing_writes: AtomicUsize,
    failing_commits: AtomicUsize,
}

impl FlakyStorage {
    fn new(root: &std::path::Path) -> Self {
        Self {
            inner: DiskStorage::new(root).unwrap(),
            failing_reads: AtomicUsize::new(0),
            failing_writes: AtomicUsize::new(0),
            failing_commits: AtomicUsize::new(0),
        }
    }

    fn injected(counter: &AtomicUsize, what: &str) -> Result<()> {
        let remaining = counter.load(Ordering::SeqCst);
        if remaining == 0 {
            return Ok(());
        }
        counter.store(remaining - 1, Ordering::SeqCst);
        Err(MergeTreeError::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("injected {} failure", what),
        )))
    }
}

impl PartStorage for FlakyStorage {
    fn write_part(&self, info: &PartInfo, rows: &[Row]) -> Result<PartMeta> {
        Self::injected(&self.failing_writes, "write")?;
        self.inner.write_part(info, rows)
    }

    fn commit_part(&self, info: &PartInfo) -> Result<()> {
        Self::injected(&self.failing_commits, "commit")?;
        self.inner.commit_part(info)
    }

    fn discard_temporary(&self, info: &PartInfo) -> Result<()> {
        self.inner.discard_temporary(info)
    }

    fn read_part(&self, info: &PartInfo) -> Result<Vec<Row>> {
        Self::injected(&self.failing_reads, "read")?;
        self.inner.read_part(info)
    }

    fn read_meta(&self, info: &PartInfo) -> Result<PartMeta> {
        self.inner.read_meta(info)
    }

    fn remove_part(&self, info: &PartInfo) -> Result<()> {
        self.inner.remove_part(info)
    }

    fn list_parts(&self) -> Result<PartListing> {
        self.inner.list_parts()
    }

    fn remove_leftover(&self, dir_name: &str) -> Result<()> {
        self.inner.remove_leftover(dir_name)
    }
}

/// Disk storage whose inserts stop in `write_part` while the gate is closed.
#[derive(Debug)]
struct GatedStorage {
    inner: DiskStorage,
    gate_open: Mutex<bool>,
    opened: Condvar,
    entered: AtomicBool,
    fail_gated_write: AtomicBool,
}

impl GatedStorage {
    fn new(root: &std::path::Path) -> Self {
        Self {
            inner: DiskStorage::new(root).unwrap(),
            gate_open: Mutex::new(true),
            opened: Condvar::new(),
            entered: AtomicBool::new(false),
            fail_gated_write: AtomicBool::new(false),
        }
    }

    fn close_gate(&self) {
        *self.gate_open.lock() = false;
        self.entered.store(false, Ordering::SeqCst);
    }

    fn open_gate(&self) {
        *self.gate_open.lock() = true;
        self.opened.notify_all();
    }

    fn wait_until_entered(&self) {
        while !self.entered.load(Ordering::SeqCst) {
            thread::yield_now();
        }
    }
}

impl PartStorage for GatedStorage {
    fn write_part(&self, info: &PartInfo, rows: &[Row]) -> Result<PartMeta> {
        if info.level == 0 && info.data_version == 0 {
            let mut open = self.gate_open.lock();
            if !*open {
                self.entered.store(true, Ordering::SeqCst);
                while !*open {
                    self.opened.wait(&mut open);
                }
                if self.fail_gated_write.load(Ordering::SeqCst) {
                    return Err(MergeTreeError::Io(io::Error::new(
                        io::ErrorKind::Other,
                        "injected write failure",
                    )));
                }
            }
        }
        self.inner.write_part(info, rows)
    }

    fn commit_part(&self, info: &PartInfo) -> Result<()> {
        self.inner.commit_part(info)
    }

    fn discard_temporary(&self, info: &PartInfo) -> Result<()> {
        self.inner.discard_temporary(info)
    }

    fn read_part(&self, info: &PartInfo) -> Result<Vec<Row>> {
        self.inner.read_part(info)
    }

    fn read_meta(&self, info: &PartInfo) -> Result<PartMeta> {
        self.inner.read_meta(info)
    }

    fn remove_part(&self, info: &PartInfo) -> Result<()> {
        self.inner.remove_part(info)
    }

    fn list_parts(&self) -> Result<PartListing> {
        self.inner.list_parts()
    }

    fn remove_leftover(&self, dir_name: &str) -> Result<()> {
        self.inner.remove_leftover(dir_name)
    }
}

fn manual_settings() -> TableSettings {
    TableSettings::default()
        .with_background_pool_size(0)
        .with_mutation_log(MutationLogConfig::new(64 * 1024, SyncMode::None))
}

fn open_flaky(temp_dir: &TempDir) -> (Arc<FlakyStorage>, MergeTreeTable) {
    let storage = Arc::new(FlakyStorage::new(temp_dir.path()));
    let table = MergeTreeTable::open(
        storage.clone(),
        temp_dir.path().join("mutations"),
        manual_settings(),
    )
    .unwrap();
    (storage, table)
}

fn open_gated(temp_dir: &TempDir) -> (Arc<GatedStorage>, Arc<MergeTreeTable>) {
    let storage = Arc::new(GatedStorage::new(temp_dir.path()));
    let table = MergeTreeTable::open(
        storage.clone(),
        temp_dir.path().join("mutations"),
        manual_settings(),
    )
    .unwrap();
    (storage, Arc::new(table))
}

/// Starts an insert of `rows` that stops inside `write_part`.
fn start_gated_insert(
    storage: &Arc<GatedStorage>,
    table: &Arc<MergeTreeTable>,
    rows: Vec<Row>,
) -> thread::JoinHandle<Result<DataPartPtr>> {
    storage.close_gate();
    let writer = {
        let table = Arc::clone(table);
        thread::spawn(move || table.insert("p", rows))
    };
    storage.wait_until_entered();
    writer
}

#[test]
fn test_failed_mutation_is_reported_and_retried() {
    let temp_dir = TempDir::new().unwrap();
    let (storage, table) = open_flaky(&temp_dir);
    table
        .insert("p", vec![Row::new(1, 0, 1), Row::new(2, 0, 2)])
        .unwrap();
    let version = table
        .submit_mutation(vec![MutationCommand::delete(RowPredicate::KeyEquals(1))])
        .unwrap();

    storage.failing_reads.store(1, Ordering::SeqCst);
    let outcome = table.run_background_job().found().unwrap();
    assert!(matches!(outcome, JobOutcome::Failed(ref e) if e.kind() == ErrorKind::Io));

    let status = table.mutations_status();
    assert_eq!(status[0].latest_failed_part.as_deref(), Some("p_1_1_0"));
    assert!(status[0]
        .latest_fail_reason
        .as_deref()
        .is_some_and(|reason| reason.contains("injected read failure")));

    let err = table
        .wait_for_mutation(version, Duration::from_millis(20))
        .unwrap_err();
    match err {
        MergeTreeError::MutationTimeout {
            latest_fail_reason, ..
        } => assert!(latest_fail_reason.is_some()),
        other => panic!("unexpected error {other}"),
    }

    let failures: Vec<_> = table
        .part_log()
        .into_iter()
        .filter(|entry| entry.event == PartLogEvent::MutatePart)
        .collect();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].error.is_some());
    assert_eq!(failures[0].source_parts, ["p_1_1_0"]);

    // The part was released, so the next tick retries it.
    let outcome = table.run_background_job().found().unwrap();
    assert_eq!(outcome.committed().unwrap().name(), "p_1_1_0_1");
    table
        .wait_for_mutation(version, Duration::from_millis(100))
        .unwrap();
    assert_eq!(table.read_rows().unwrap(), vec![Row::new(2, 0, 2)]);
}

#[test]
fn test_failed_merge_keeps_inputs_active() {
    let temp_dir = TempDir::new().unwrap();
    let (storage, table) = open_flaky(&temp_dir);
    table.insert("p", vec![Row::new(1, 0, 1)]).unwrap();
    table.insert("p", vec![Row::new(2, 0, 1)]).unwrap();

    storage.failing_writes.store(1, Ordering::SeqCst);
    let err = table.optimize(Some("p"), false, false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
    assert_eq!(table.list_active().len(), 2);
    assert!(table.broken_reason().is_none());

    let merged = table.optimize(Some("p"), false, false).unwrap();
    assert_eq!(merged.found().unwrap().name(), "p_1_2_1");
}

#[test]
fn test_failed_commit_leaves_no_trace() {
    let temp_dir = TempDir::new().unwrap();
    let (storage, table) = open_flaky(&temp_dir);
    table.insert("p", vec![Row::new(1, 0, 1)]).unwrap();
    table.insert("p", vec![Row::new(2, 0, 1)]).unwrap();

    storage.failing_commits.store(1, Ordering::SeqCst);
    let outcome = table.run_background_job().found().unwrap();
    assert!(matches!(outcome, JobOutcome::Failed(_)));
    assert!(table.registry().part_state("p_1_2_1").is_none());
    assert!(!temp_dir.path().join("tmp_p_1_2_1").exists());
    assert!(table.broken_reason().is_none());

    let outcome = table.run_background_job().found().unwrap();
    assert_eq!(outcome.committed().unwrap().name(), "p_1_2_1");
}

#[test]
fn test_failed_insert_commits_nothing() {
    let temp_dir = TempDir::new().unwrap();
    let (storage, table) = open_flaky(&temp_dir);

    storage.failing_commits.store(1, Ordering::SeqCst);
    assert!(table.insert("p", vec![Row::new(1, 0, 1)]).is_err());
    assert!(table.list_active().is_empty());

    // The failed insert consumed its block number.
    let part = table.insert("p", vec![Row::new(1, 0, 1)]).unwrap();
    assert_eq!(part.name(), "p_2_2_0");
}

#[test]
fn test_mutation_waits_for_in_flight_insert() {
    let temp_dir = TempDir::new().unwrap();
    let (storage, table) = open_gated(&temp_dir);
    table.insert("p", vec![Row::new(1, 0, 1)]).unwrap();
    let writer = start_gated_insert(&storage, &table, vec![Row::new(2, 0, 2)]);

    let version = table
        .submit_mutation(vec![MutationCommand::delete(RowPredicate::All)])
        .unwrap();
    assert_eq!(table.mutations_status()[0].parts_to_do, 2);
    table.run_until_idle();
    assert_eq!(table.mutations_status()[0].parts_to_do, 1);
    assert!(matches!(
        table.wait_for_mutation(version, Duration::from_millis(20)),
        Err(MergeTreeError::MutationTimeout { .. })
    ));
    assert!(table.clear_old_mutations(true).unwrap().is_empty());

    storage.open_gate();
    let part = writer.join().unwrap().unwrap();
    assert_eq!(part.name(), "p_2_2_0");
    table.run_until_idle();
    table
        .wait_for_mutation(version, Duration::from_millis(100))
        .unwrap();
    assert!(table.read_rows().unwrap().is_empty());
    for part in table.list_active().iter() {
        assert_eq!(part.data_version(), version);
    }
}

#[test]
fn test_failed_in_flight_insert_releases_mutation() {
    let temp_dir = TempDir::new().unwrap();
    let (storage, table) = open_gated(&temp_dir);
    table.insert("p", vec![Row::new(1, 0, 1)]).unwrap();
    let writer = start_gated_insert(&storage, &table, vec![Row::new(2, 0, 2)]);

    let version = table
        .submit_mutation(vec![MutationCommand::delete(RowPredicate::KeyEquals(1))])
        .unwrap();
    table.run_until_idle();
    assert_eq!(table.mutations_status()[0].parts_to_do, 1);

    storage.fail_gated_write.store(true, Ordering::SeqCst);
    storage.open_gate();
    assert!(writer.join().unwrap().is_err());
    table
        .wait_for_mutation(version, Duration::from_millis(100))
        .unwrap();
    assert!(table.mutations_status()[0].is_done);
    assert!(table.read_rows().unwrap().is_empty());
}
