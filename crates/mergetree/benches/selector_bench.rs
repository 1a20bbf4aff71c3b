//! Benchmarks for merge selection and row merging.
//!
//! Run with: cargo bench --package alopex-mergetree
//!
//! ## Benchmark Categories
//!
//! - **Merge Selection**: regular, aggressive and final selection over many parts
//! - **Mutation Selection**: picking a part with pending mutations
//! - **Row Merging**: combining sorted inputs per merge mode

use alopex_mergetree::merge::{
    merge_rows, select_part_to_mutate, select_parts_to_merge, MergeMode, MergeRequest,
    SelectionInput, SelectorSettings,
};
use alopex_mergetree::mutation::{LedgerState, MutationCommand, MutationLedger, RowPredicate};
use alopex_mergetree::{
    ChangeSignal, DataPart, DataPartPtr, MutationLogConfig, PartInfo, PartMeta, Row, SyncMode,
    TableSettings,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tempfile::TempDir;

/// Level-0 parts with sizes that vary like a bursty insert stream.
fn generate_parts(partition: &str, count: usize) -> Vec<DataPartPtr> {
    (1..=count as u64)
        .map(|block| {
            let rows = 100 + (block * 7919) % 5000;
            let meta = PartMeta {
                rows,
                bytes_on_disk: rows * 24,
                min_timestamp: 0,
                max_timestamp: 0,
            };
            Arc::new(DataPart::new(PartInfo::new(partition, block, block, 0), meta))
        })
        .collect()
}

fn bench_select_regular(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_regular");
    let settings = SelectorSettings::from(&TableSettings::default());
    let ledger = LedgerState::default();
    let processing = BTreeSet::new();

    for count in [10, 100, 1000] {
        let parts = generate_parts("p", count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &parts, |b, parts| {
            let input = SelectionInput {
                active: parts,
                processing: &processing,
                ledger: &ledger,
                outdated: &[],
                settings: &settings,
            };
            b.iter(|| select_parts_to_merge(black_box(&input), &MergeRequest::regular()))
        });
    }
    group.finish();
}

fn bench_select_aggressive_and_final(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_optimize");
    let settings = SelectorSettings::from(&TableSettings::default());
    let ledger = LedgerState::default();
    let processing = BTreeSet::new();
    let mut parts = generate_parts("a", 200);
    parts.extend(generate_parts("b", 200));

    let input = SelectionInput {
        active: &parts,
        processing: &processing,
        ledger: &ledger,
        outdated: &[],
        settings: &settings,
    };
    let aggressive = MergeRequest {
        aggressive: true,
        ..MergeRequest::default()
    };
    let final_merge = MergeRequest {
        partition: Some("b".to_string()),
        aggressive: true,
        final_merge: true,
        deduplicate: false,
    };
    group.bench_function("aggressive", |b| {
        b.iter(|| select_parts_to_merge(black_box(&input), &aggressive))
    });
    group.bench_function("final", |b| {
        b.iter(|| select_parts_to_merge(black_box(&input), &final_merge))
    });
    group.finish();
}

fn bench_select_mutation(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let ledger = MutationLedger::open(
        temp_dir.path(),
        MutationLogConfig::new(1024 * 1024, SyncMode::None),
        0,
        Arc::new(ChangeSignal::new()),
    )
    .unwrap();
    let parts = generate_parts("p", 500);
    let fence = BTreeMap::from([("p".to_string(), 500)]);
    let subjects: Vec<PartInfo> = parts.iter().map(|part| part.info().clone()).collect();
    for key in 0..20 {
        ledger
            .submit(
                vec![MutationCommand::delete(RowPredicate::KeyEquals(key))],
                || (fence.clone(), subjects.clone()),
            )
            .unwrap();
    }
    let snapshot = ledger.snapshot();
    let settings = SelectorSettings::from(&TableSettings::default());
    let processing = BTreeSet::new();
    let input = SelectionInput {
        active: &parts,
        processing: &processing,
        ledger: &snapshot,
        outdated: &[],
        settings: &settings,
    };

    c.bench_function("select_mutation_500_parts_20_versions", |b| {
        b.iter(|| select_part_to_mutate(black_box(&input)))
    });
}

fn bench_merge_rows(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_rows");
    let inputs: Vec<Vec<Row>> = (0..8u64)
        .map(|part| {
            (0..10_000u64)
                .map(|i| Row::new(i * 8 + part % 3, i as i64, (i % 100) as i64 + 1))
                .collect()
        })
        .collect();
    let total: usize = inputs.iter().map(Vec::len).sum();
    group.throughput(Throughput::Elements(total as u64));

    for mode in [
        MergeMode::Ordinary,
        MergeMode::Replacing,
        MergeMode::Summing,
        MergeMode::Collapsing,
    ] {
        group.bench_with_input(
            BenchmarkId::from_parameter(mode.as_str()),
            &inputs,
            |b, inputs| b.iter(|| merge_rows(mode, black_box(inputs.clone()), false)),
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_select_regular,
    bench_select_aggressive_and_final,
    bench_select_mutation,
    bench_merge_rows,
);
criterion_main!(benches);
