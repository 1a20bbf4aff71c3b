//! Alopex MergeTree - part lifecycle, merge and mutation scheduling
//!
//! This crate maintains the set of immutable data parts of a merge-tree
//! table and decides, in the background, which parts to merge and which to
//! rewrite for pending mutations.
//!
//! # Components
//!
//! - [`PartRegistry`]: authoritative part set and lifecycle transitions
//! - [`MutationLedger`]: versioned, durable mutation entries
//! - [`merge::selector`]: pure merge and mutation selection
//! - [`BackgroundScheduler`]: claim-then-dispatch loop over a worker pool
//! - [`TaskExecutor`]: runs one merge or mutation and commits it
//! - [`WaitCoordinator`]: blocking waits on mutations and outdated parts
//! - [`MergeTreeTable`]: the engine handle tying them together
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_mergetree::{MergeTreeTable, Row, TableSettings};
//! use alopex_mergetree::mutation::{Assignment, MutationCommand, RowPredicate};
//! use std::time::Duration;
//!
//! let table = MergeTreeTable::open_dir("/data/events", TableSettings::default())?;
//! table.insert("202401", vec![Row::new(1, ts, 10), Row::new(2, ts, 20)])?;
//! table.insert("202401", vec![Row::new(3, ts, 30)])?;
//!
//! // Background workers merge 202401_1_1_0 and 202401_2_2_0 on their own.
//! let version = table.submit_mutation(vec![MutationCommand::update(
//!     RowPredicate::KeyEquals(2),
//!     Assignment::Add(1),
//! )])?;
//! table.wait_for_mutation(version, Duration::from_secs(10))?;
//! ```

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod merge;
pub mod mutation;
pub mod part;
pub mod part_log;
pub mod registry;
pub mod scheduler;
pub mod table;
pub mod wait;

pub use config::{MergeGapPolicy, MutationLogConfig, SyncMode, TableSettings};
pub use error::{ErrorKind, MergeTreeError, Result};
pub use merge::{
    JobOutcome, MergeCandidate, MergeMode, MergeRequest, MutationCandidate, Selection,
    TaskExecutor,
};
pub use mutation::{MutationCommand, MutationLedger, MutationStatus};
pub use part::{BlockNumber, DataPart, DataPartPtr, PartInfo, PartMeta, PartState, Row};
pub use part_log::{PartLog, PartLogEntry, PartLogEvent};
pub use registry::{ActiveParts, PartRegistry};
pub use scheduler::{ActionKind, ActionLockStatus, BackgroundScheduler};
pub use table::{CancellationCode, MergeTreeTable};
pub use wait::{ChangeSignal, WaitCoordinator};
