//! Change notification and blocking waits on table state.

use crate::error::{MergeTreeError, Result};
use crate::mutation::{MutationLedger, VersionState};
use crate::registry::PartRegistry;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Poll slice used while waiting for outdated part references to drop.
const RELEASE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Monotonic change counter with broadcast wake-ups.
///
/// Every ledger change, part commit and outdated-part load bumps the counter.
/// Waiters capture [`ChangeSignal::current`] before checking their predicate
/// and then wait for the counter to move past it, so a change between the
/// check and the wait is never missed.
#[derive(Debug, Default)]
pub struct ChangeSignal {
    sequence: Mutex<u64>,
    condvar: Condvar,
}

impl ChangeSignal {
    /// Creates a signal at sequence 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current sequence.
    pub fn current(&self) -> u64 {
        *self.sequence.lock()
    }

    /// Bumps the sequence and wakes every waiter.
    pub fn notify(&self) {
        let mut sequence = self.sequence.lock();
        *sequence += 1;
        self.condvar.notify_all();
    }

    /// Blocks until the sequence exceeds `since` or `deadline` passes.
    ///
    /// Returns the new sequence, or `WaitTimeout` at the deadline.
    pub fn wait_for(&self, since: u64, deadline: Instant) -> Result<u64> {
        let mut sequence = self.sequence.lock();
        while *sequence <= since {
            if self.condvar.wait_until(&mut sequence, deadline).timed_out() {
                if *sequence > since {
                    break;
                }
                return Err(MergeTreeError::WaitTimeout("change signal".to_string()));
            }
        }
        Ok(*sequence)
    }
}

/// Blocking waits used by administrative callers.
#[derive(Debug, Clone)]
pub struct WaitCoordinator {
    ledger: Arc<MutationLedger>,
    registry: Arc<PartRegistry>,
    signal: Arc<ChangeSignal>,
}

impl WaitCoordinator {
    /// Creates a coordinator over the given ledger and registry.
    pub fn new(
        ledger: Arc<MutationLedger>,
        registry: Arc<PartRegistry>,
        signal: Arc<ChangeSignal>,
    ) -> Self {
        Self {
            ledger,
            registry,
            signal,
        }
    }

    /// Blocks until mutation `version` is done.
    ///
    /// A version that has not been assigned yet is waited for like a pending
    /// one. A version that was assigned and is no longer tracked was finished
    /// and garbage-collected, so it counts as done.
    ///
    /// # Errors
    ///
    /// - `MutationKilled` if the mutation was killed.
    /// - `TableBroken` if background processing halted.
    /// - `MutationTimeout` with the latest failure reason at the deadline;
    ///   the mutation keeps running in the background.
    pub fn wait_for_mutation(&self, version: u64, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let seen = self.signal.current();
            let latest_fail_reason = match self.ledger.snapshot().version_state(version) {
                VersionState::Done => return Ok(()),
                VersionState::Killed => return Err(MergeTreeError::MutationKilled(version)),
                VersionState::Pending { latest_fail_reason } => latest_fail_reason,
                VersionState::NotSubmitted => None,
            };
            if let Some(reason) = self.registry.broken_reason() {
                return Err(MergeTreeError::TableBroken(reason));
            }
            if self.signal.wait_for(seen, deadline).is_err() {
                return Err(MergeTreeError::MutationTimeout {
                    version,
                    latest_fail_reason,
                });
            }
        }
    }

    /// Blocks until the background load of outdated parts has finished.
    pub fn wait_for_outdated_parts_to_be_loaded(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let seen = self.signal.current();
            if self.registry.outdated_parts_loaded() {
                return Ok(());
            }
            if self.signal.wait_for(seen, deadline).is_err() {
                return Err(MergeTreeError::WaitTimeout(
                    "outdated parts to be loaded".to_string(),
                ));
            }
        }
    }

    /// Blocks until no outdated part is referenced outside the registry.
    ///
    /// Dropping a part handle does not notify anyone, so this polls in short
    /// slices.
    pub fn wait_for_all_outdated_parts_released(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let referenced = self.registry.referenced_outdated_parts();
            if referenced.is_empty() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(MergeTreeError::WaitTimeout(format!(
                    "outdated parts to be released: {}",
                    referenced.join(", ")
                )));
            }
            thread::sleep(RELEASE_POLL_INTERVAL.min(deadline - now));
        }
    }
}
