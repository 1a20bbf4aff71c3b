//! Error and Result types for merge-tree table operations.

use std::io;
use thiserror::Error;

/// A convenience `Result` type for merge-tree operations.
pub type Result<T> = std::result::Result<T, MergeTreeError>;

/// Coarse classification of [`MergeTreeError`] used for propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Expected race between structural operations; the job is abandoned.
    Conflict,
    /// Part data could not be decoded.
    Corrupt,
    /// Underlying I/O failure.
    Io,
    /// A deadline elapsed while waiting.
    Timeout,
    /// Interval coverage of the registry would be broken.
    InvariantViolation,
    /// Anything else (bad input, cancellation, shutdown).
    Other,
}

/// The error type for merge-tree operations.
#[derive(Debug, Error)]
pub enum MergeTreeError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid magic bytes in a part or log file header.
    #[error("Invalid magic bytes: got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported on-disk format version.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// File checksum does not match expected value.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected CRC32 checksum.
        expected: u32,
        /// Actual computed CRC32 checksum.
        actual: u32,
    },

    /// Part data is unreadable.
    #[error("Corrupt part {name}: {reason}")]
    CorruptPart {
        /// Name of the part.
        name: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A directory name could not be parsed as a part name.
    #[error("Invalid part name: {0}")]
    InvalidPartName(String),

    /// Partition identifier contains unsupported characters.
    #[error("Invalid partition id: {0:?}")]
    InvalidPartition(String),

    /// A concurrent structural change retired a part this operation relied on.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A commit would break the interval coverage of active parts.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Background processing was halted after an invariant violation.
    #[error("Table is broken and needs manual intervention: {0}")]
    TableBroken(String),

    /// `wait_for_mutation` exceeded its deadline.
    #[error("Timed out waiting for mutation {version}{}", fail_suffix(.latest_fail_reason))]
    MutationTimeout {
        /// Mutation version waited for.
        version: u64,
        /// Last failure recorded for the mutation, if any.
        latest_fail_reason: Option<String>,
    },

    /// A generic wait exceeded its deadline.
    #[error("Timed out waiting for {0}")]
    WaitTimeout(String),

    /// The awaited mutation was killed.
    #[error("Mutation {0} was killed")]
    MutationKilled(u64),

    /// No mutation with this version is known.
    #[error("Mutation {0} not found")]
    MutationNotFound(u64),

    /// No active part with this name exists.
    #[error("Part not found: {0}")]
    PartNotFound(String),

    /// The part is claimed by a background merge or mutation.
    #[error("Part {0} is being processed by a background job")]
    PartBusy(String),

    /// A job observed its cancellation flag.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The mutation log holds an undecodable record.
    #[error("Mutation log corrupted: {0}")]
    LogCorrupted(String),

    /// Table settings are inconsistent.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// The table is shutting down and accepts no new background work.
    #[error("Table is shutting down")]
    ShuttingDown,
}

fn fail_suffix(reason: &Option<String>) -> String {
    match reason {
        Some(reason) => format!(" (latest failure: {})", reason),
        None => String::new(),
    }
}

impl MergeTreeError {
    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::InvalidMagic(_)
            | Self::UnsupportedVersion(_)
            | Self::ChecksumMismatch { .. }
            | Self::CorruptPart { .. }
            | Self::LogCorrupted(_) => ErrorKind::Corrupt,
            Self::Io(_) => ErrorKind::Io,
            Self::MutationTimeout { .. } | Self::WaitTimeout(_) => ErrorKind::Timeout,
            Self::InvariantViolation(_) | Self::TableBroken(_) => ErrorKind::InvariantViolation,
            _ => ErrorKind::Other,
        }
    }

    /// Returns true if a later scheduling tick may succeed where this failed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Corrupt | ErrorKind::Io)
    }
}
