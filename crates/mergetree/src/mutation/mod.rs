//! Mutations: row-rewriting commands, their durable log and the ledger that
//! tracks which parts still need them.

pub mod command;
pub mod ledger;
pub mod log;

pub use command::{apply_commands, Assignment, MutationCommand, RowPredicate};
pub use ledger::{
    LedgerSnapshot, LedgerState, MutationEntry, MutationLedger, MutationStatus, VersionState,
};
pub use log::{LogRecord, MutationLog};
