//! Operation tracker.
//!
//! Counts in-flight and finished operations of one index and the writers
//! still inside each Memory component. A flush waits here until the
//! component it sealed has no writers left.

use crate::component::ComponentId;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Operation classes tracked per index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Search,
    Modify,
    Flush,
    Merge,
}

impl OperationKind {
    fn index(self) -> usize {
        match self {
            OperationKind::Search => 0,
            OperationKind::Modify => 1,
            OperationKind::Flush => 2,
            OperationKind::Merge => 3,
        }
    }
}

#[derive(Default)]
struct Counters {
    active: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Counters of one operation class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OperationCounts {
    pub active: u64,
    /// Finished successfully.
    pub completed: u64,
    pub failed: u64,
}

impl OperationCounts {
    /// Finished operations, successful or not.
    pub fn archived(&self) -> u64 {
        self.completed + self.failed
    }
}

/// Read-only snapshot of the tracker, for external reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OperationStats {
    pub searches: OperationCounts,
    pub modifies: OperationCounts,
    pub flushes: OperationCounts,
    pub merges: OperationCounts,
}

/// Reference counts of in-flight operations of one index.
#[derive(Default)]
pub struct OperationTracker {
    counters: [Counters; 4],
    writers: Mutex<HashMap<ComponentId, usize>>,
    writers_drained: Condvar,
}

impl OperationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the start of an operation.
    pub fn begin(&self, kind: OperationKind) {
        self.counters[kind.index()]
            .active
            .fetch_add(1, Ordering::AcqRel);
    }

    /// Marks the end of an operation started with [`OperationTracker::begin`].
    pub fn end(&self, kind: OperationKind, success: bool) {
        let counters = &self.counters[kind.index()];
        let previous = counters.active.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "{:?} ended without a begin", kind);
        if success {
            counters.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a writer entering Memory component `id`.
    pub fn enter_modify(&self, id: ComponentId) {
        self.begin(OperationKind::Modify);
        *self.writers.lock().entry(id).or_insert(0) += 1;
    }

    /// Records a writer leaving Memory component `id`.
    pub fn exit_modify(&self, id: ComponentId, success: bool) {
        {
            let mut writers = self.writers.lock();
            if let Some(count) = writers.get_mut(&id) {
                *count -= 1;
                if *count == 0 {
                    writers.remove(&id);
                    self.writers_drained.notify_all();
                }
            } else {
                debug_assert!(false, "writer left {} without entering", id);
            }
        }
        self.end(OperationKind::Modify, success);
    }

    /// Writers currently inside component `id`.
    pub fn writers(&self, id: ComponentId) -> usize {
        self.writers.lock().get(&id).copied().unwrap_or(0)
    }

    /// Blocks until no writer is inside component `id`.
    pub fn wait_for_writers(&self, id: ComponentId) {
        let mut writers = self.writers.lock();
        while writers.contains_key(&id) {
            self.writers_drained.wait(&mut writers);
        }
    }

    pub fn counts(&self, kind: OperationKind) -> OperationCounts {
        let counters = &self.counters[kind.index()];
        OperationCounts {
            active: counters.active.load(Ordering::Acquire),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
        }
    }

    pub fn stats(&self) -> OperationStats {
        OperationStats {
            searches: self.counts(OperationKind::Search),
            modifies: self.counts(OperationKind::Modify),
            flushes: self.counts(OperationKind::Flush),
            merges: self.counts(OperationKind::Merge),
        }
    }
}
