//! Bounded in-memory buffer of the agent's most recent log lines.
//!
//! The logging writer pushes formatted lines; the router reads them back for
//! `getRecentLogs`, which the host uses to enrich timeout failures.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Default number of lines retained.
pub const DEFAULT_CAPACITY: usize = 500;

/// A cloneable handle to a shared ring buffer of log lines.
#[derive(Debug, Clone)]
pub struct RecentLogs {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl Default for RecentLogs {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl RecentLogs {
    /// Create a buffer retaining at most `capacity` lines.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a line, evicting the oldest once full.
    pub fn push(&self, line: impl Into<String>) {
        let mut lines = self.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// Append every non-empty line of `text`.
    pub fn push_text(&self, text: &str) {
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            self.push(line.trim_end());
        }
    }

    /// The newest `max` lines (all when `None`), oldest first.
    pub fn lines(&self, max: Option<usize>) -> Vec<String> {
        let lines = self.lock();
        let skip = max.map_or(0, |max| lines.len().saturating_sub(max));
        lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
