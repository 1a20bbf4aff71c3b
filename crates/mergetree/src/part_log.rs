//! Bounded in-memory history of part events.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, SystemTime};

/// Kind of part event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartLogEvent {
    /// A part was inserted.
    NewPart,
    /// Parts were merged.
    MergeParts,
    /// A part was mutated.
    MutatePart,
    /// An outdated part was deleted.
    RemovePart,
}

impl fmt::Display for PartLogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NewPart => "NewPart",
            Self::MergeParts => "MergeParts",
            Self::MutatePart => "MutatePart",
            Self::RemovePart => "RemovePart",
        };
        f.write_str(name)
    }
}

/// One recorded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartLogEntry {
    /// What happened.
    pub event: PartLogEvent,
    /// When it was recorded.
    pub event_time: SystemTime,
    /// Resulting (or removed) part.
    pub part_name: String,
    /// Inputs of a merge or mutation.
    pub source_parts: Vec<String>,
    /// Rows in the resulting part.
    pub rows: u64,
    /// Wall time of the job.
    pub duration: Duration,
    /// Failure or abort reason; `None` on success.
    pub error: Option<String>,
}

impl PartLogEntry {
    /// Creates a successful entry.
    pub fn new(event: PartLogEvent, part_name: impl Into<String>) -> Self {
        Self {
            event,
            event_time: SystemTime::now(),
            part_name: part_name.into(),
            source_parts: Vec::new(),
            rows: 0,
            duration: Duration::ZERO,
            error: None,
        }
    }

    /// Sets the source parts.
    pub fn with_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.source_parts = sources.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the resulting row count.
    pub fn with_rows(mut self, rows: u64) -> Self {
        self.rows = rows;
        self
    }

    /// Sets the job duration.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Marks the entry as failed.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Ring buffer of the most recent part events.
#[derive(Debug)]
pub struct PartLog {
    entries: Mutex<VecDeque<PartLogEntry>>,
    capacity: usize,
}

impl PartLog {
    /// Creates a log keeping at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// Appends an entry, evicting the oldest when full.
    pub fn record(&self, entry: PartLogEntry) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Entries from oldest to newest.
    pub fn entries(&self) -> Vec<PartLogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Entries of one kind, oldest first.
    pub fn entries_of(&self, event: PartLogEvent) -> Vec<PartLogEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.event == event)
            .cloned()
            .collect()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
