//! In-memory view of the replicated log, offset by the last snapshot.
//!
//! Indexes are 1-based. Index 0 with term 0 is the empty-log sentinel and is
//! also what `snapshot_index`/`snapshot_term` hold before any compaction.

use shared::types::{Index, LogEntry, Term};

#[derive(Debug, Clone, Default)]
pub struct RaftLog {
    snapshot_index: Index,
    snapshot_term: Term,
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted pieces. Entries already covered by the snapshot
    /// are dropped.
    pub fn restore(snapshot_index: Index, snapshot_term: Term, entries: Vec<LogEntry>) -> Self {
        let entries = entries
            .into_iter()
            .filter(|e| e.index > snapshot_index)
            .collect();
        Self {
            snapshot_index,
            snapshot_term,
            entries,
        }
    }

    pub fn snapshot_index(&self) -> Index {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> Term {
        self.snapshot_term
    }

    pub fn last_index(&self) -> Index {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or(self.snapshot_index)
    }

    pub fn last_term(&self) -> Term {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Term of the entry at `index`, or `None` when it was compacted away or
    /// does not exist yet.
    pub fn term_at(&self, index: Index) -> Option<Term> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    pub fn get(&self, index: Index) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        self.entries.get((index - self.snapshot_index - 1) as usize)
    }

    /// Up to `max` entries starting at `from`.
    pub fn entries_from(&self, from: Index, max: usize) -> Vec<LogEntry> {
        if from <= self.snapshot_index {
            return Vec::new();
        }
        let start = (from - self.snapshot_index - 1) as usize;
        self.entries.iter().skip(start).take(max).cloned().collect()
    }

    pub fn append(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_index() + 1, "log append must be contiguous");
        self.entries.push(entry);
    }

    /// Drop every entry at or after `index`.
    pub fn truncate_from(&mut self, index: Index) {
        if index <= self.snapshot_index {
            self.entries.clear();
            return;
        }
        self.entries.truncate((index - self.snapshot_index - 1) as usize);
    }

    /// Discard the prefix up to and including `index`, which is now covered by
    /// a snapshot. Later entries are kept.
    pub fn compact_to(&mut self, index: Index, term: Term) {
        if index <= self.snapshot_index {
            return;
        }
        let keep_from = (index - self.snapshot_index) as usize;
        if keep_from >= self.entries.len() {
            self.entries.clear();
        } else {
            self.entries.drain(..keep_from);
        }
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// Replace the whole log with a snapshot boundary.
    pub fn reset_to_snapshot(&mut self, index: Index, term: Term) {
        self.entries.clear();
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// First index holding `term`, searching back from `from`. Used as the
    /// backtracking hint when a follower rejects `AppendEntries`.
    pub fn first_index_of_term(&self, term: Term, from: Index) -> Index {
        let mut index = from;
        while index > self.snapshot_index + 1 {
            match self.term_at(index - 1) {
                Some(t) if t == term => index -= 1,
                _ => break,
            }
        }
        index
    }
}
