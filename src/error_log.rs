//! Bounded, process-wide log of plugin failures.
//!
//! Every component pushes failures here instead of propagating them to the
//! host. The log keeps the ten most recent entries, newest first.

use std::collections::VecDeque;
use std::error::Error as StdError;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// Number of entries the log retains.
pub const ERROR_LOG_CAPACITY: usize = 10;

/// A captured failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorLogEntry {
    /// Top-level message.
    pub message: String,
    /// Messages of the underlying causes, outermost first.
    pub causes: Vec<String>,
    /// Instance the failure belongs to, if any.
    pub plugin: Option<String>,
    /// When the failure was recorded.
    pub captured_at: DateTime<Utc>,
}

impl ErrorLogEntry {
    /// Create an entry with no cause chain.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            causes: Vec::new(),
            plugin: None,
            captured_at: Utc::now(),
        }
    }

    /// Capture an error and walk its `source()` chain.
    pub fn from_error(err: &(dyn StdError + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        Self {
            message: err.to_string(),
            causes,
            plugin: None,
            captured_at: Utc::now(),
        }
    }

    /// Attach the owning instance name.
    pub fn with_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugin = Some(plugin.into());
        self
    }
}

/// LIFO failure buffer with a fixed capacity.
#[derive(Debug, Default)]
pub struct ErrorLog {
    entries: Mutex<VecDeque<ErrorLogEntry>>,
}

impl ErrorLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(ERROR_LOG_CAPACITY)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<ErrorLogEntry>> {
        // A panic while holding the lock cannot leave the deque half-written.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Push an entry, evicting the oldest one past capacity.
    pub fn push(&self, entry: ErrorLogEntry) {
        let mut entries = self.lock();
        entries.push_front(entry);
        entries.truncate(ERROR_LOG_CAPACITY);
    }

    /// Capture an error with an optional owning instance.
    pub fn record(&self, err: &(dyn StdError + 'static), plugin: Option<&str>) {
        let mut entry = ErrorLogEntry::from_error(err);
        entry.plugin = plugin.map(str::to_string);
        self.push(entry);
    }

    /// The most recently pushed entry.
    pub fn last_error(&self) -> Option<ErrorLogEntry> {
        self.lock().front().cloned()
    }

    /// Entry at `index`, where 0 is the most recent.
    pub fn get(&self, index: usize) -> Option<ErrorLogEntry> {
        self.lock().get(index).cloned()
    }

    /// All entries, most recent first. `None` when the log is empty.
    pub fn errors(&self) -> Option<Vec<ErrorLogEntry>> {
        let entries = self.lock();
        if entries.is_empty() {
            None
        } else {
            Some(entries.iter().cloned().collect())
        }
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the log holds no entries.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.lock().clear();
    }
}
