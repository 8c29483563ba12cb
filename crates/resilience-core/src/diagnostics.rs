use std::collections::VecDeque;

use crate::error::ClassifiedError;

/// In-memory ring of recent classified errors with bounded retention.
#[derive(Debug, Clone)]
pub struct DiagnosticLog {
    entries: VecDeque<ClassifiedError>,
    capacity: usize,
}

impl DiagnosticLog {
    /// Create a log with an entry cap (`capacity >= 1`).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an entry, evicting the oldest when full.
    pub fn push(&mut self, error: ClassifiedError) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(error);
    }

    /// Entries oldest first.
    pub fn snapshot(&self) -> Vec<ClassifiedError> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
