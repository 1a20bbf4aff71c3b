//! Merges: row merging policies, candidate selection and job execution.

pub mod executor;
pub mod mode;
pub mod selector;

pub use executor::{Job, JobOutcome, TaskExecutor};
pub use mode::{drop_expired, merge_rows, MergeMode};
pub use selector::{
    select_part_to_mutate, select_parts_to_merge, select_ttl_merge, MergeCandidate, MergeKind,
    MergeRequest, MutationCandidate, Selection, SelectionInput, SelectorSettings,
};
