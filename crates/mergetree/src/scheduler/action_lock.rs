//! Action locks: counted gates over categories of background work.
//!
//! Any number of holders may block a category at once; the category is
//! enabled again when the last [`ActionLock`] is dropped. Administrative
//! pause/resume holds one extra lock per category.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

/// Category of background work that can be paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ActionKind {
    /// Regular merges and mutations.
    Merges,
    /// TTL merges.
    TtlMerges,
    /// Moves between disks.
    Moves,
    /// Fetches from replicas.
    Fetches,
    /// Sends to replicas.
    ReplicatedSends,
    /// Sends of distributed inserts.
    DistributedSends,
    /// Replication queue processing.
    ReplicationQueue,
}

impl ActionKind {
    /// Every category, in reporting order.
    pub const ALL: [ActionKind; 7] = [
        Self::Merges,
        Self::TtlMerges,
        Self::Moves,
        Self::Fetches,
        Self::ReplicatedSends,
        Self::DistributedSends,
        Self::ReplicationQueue,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Name used in logs and status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Merges => "Merges",
            Self::TtlMerges => "TtlMerges",
            Self::Moves => "Moves",
            Self::Fetches => "Fetches",
            Self::ReplicatedSends => "ReplicatedSends",
            Self::DistributedSends => "DistributedSends",
            Self::ReplicationQueue => "ReplicationQueue",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counter of holders blocking one category.
#[derive(Debug, Default)]
pub struct ActionBlocker {
    holders: AtomicUsize,
}

impl ActionBlocker {
    /// Returns true while at least one lock is held.
    pub fn is_cancelled(&self) -> bool {
        self.holders.load(Ordering::Acquire) > 0
    }

    /// Number of live locks.
    pub fn holders(&self) -> usize {
        self.holders.load(Ordering::Acquire)
    }
}

/// Scoped hold on an [`ActionBlocker`]; unblocks on drop.
#[derive(Debug)]
#[must_use = "the category is unblocked as soon as the lock is dropped"]
pub struct ActionLock {
    blocker: Arc<ActionBlocker>,
    kind: ActionKind,
}

impl ActionLock {
    /// Category this lock blocks.
    pub fn kind(&self) -> ActionKind {
        self.kind
    }
}

impl Drop for ActionLock {
    fn drop(&mut self) {
        self.blocker.holders.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Whether a category is blocked, as reported by `action_lock_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionLockStatus {
    /// Category.
    pub kind: ActionKind,
    /// True while any holder blocks it.
    pub blocked: bool,
    /// Number of holders, including an administrative pause.
    pub holders: usize,
    /// True if paused through `pause`.
    pub paused: bool,
}

/// Action blockers of one table.
#[derive(Debug)]
pub struct ActionLocks {
    blockers: [Arc<ActionBlocker>; 7],
    paused: Mutex<Vec<ActionLock>>,
}

impl Default for ActionLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionLocks {
    /// Creates locks with every category enabled.
    pub fn new() -> Self {
        Self {
            blockers: std::array::from_fn(|_| Arc::new(ActionBlocker::default())),
            paused: Mutex::new(Vec::new()),
        }
    }

    /// Blocks `kind` until the returned guard is dropped.
    pub fn lock(&self, kind: ActionKind) -> ActionLock {
        let blocker = Arc::clone(&self.blockers[kind.index()]);
        blocker.holders.fetch_add(1, Ordering::AcqRel);
        ActionLock { blocker, kind }
    }

    /// Returns true while `kind` is blocked.
    pub fn is_blocked(&self, kind: ActionKind) -> bool {
        self.blockers[kind.index()].is_cancelled()
    }

    /// Administratively pauses `kind`. Returns false if it was already
    /// paused.
    pub fn pause(&self, kind: ActionKind) -> bool {
        let mut paused = self.paused.lock();
        if paused.iter().any(|lock| lock.kind == kind) {
            return false;
        }
        paused.push(self.lock(kind));
        info!("Paused {}", kind);
        true
    }

    /// Releases an administrative pause. Returns false if `kind` was not
    /// paused.
    pub fn resume(&self, kind: ActionKind) -> bool {
        let mut paused = self.paused.lock();
        let before = paused.len();
        paused.retain(|lock| lock.kind != kind);
        let resumed = paused.len() != before;
        if resumed {
            info!("Resumed {}", kind);
        }
        resumed
    }

    /// State of every category.
    pub fn status(&self) -> Vec<ActionLockStatus> {
        let paused = self.paused.lock();
        ActionKind::ALL
            .iter()
            .map(|&kind| {
                let blocker = &self.blockers[kind.index()];
                ActionLockStatus {
                    kind,
                    blocked: blocker.is_cancelled(),
                    holders: blocker.holders(),
                    paused: paused.iter().any(|lock| lock.kind == kind),
                }
            })
            .collect()
    }
}
