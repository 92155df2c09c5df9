//! In-memory activity log
//!
//! A bounded ring of timestamped, operator-facing log lines. Device errors
//! and task outcomes land here so the UI can show them; the ring holds the
//! most recent entries and drops the oldest on overflow. The ring is not
//! persisted; `tracing` carries the same events to the structured log.

use shared::api::LogEntry;
use shared::utils::current_timestamp;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Handle to the shared activity ring. Cheap to clone.
#[derive(Clone)]
pub struct ActivityLog {
    entries: Arc<RwLock<VecDeque<LogEntry>>>,
    capacity: usize,
}

impl ActivityLog {
    /// Create a ring holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Append a line, dropping the oldest entry when the ring is full.
    pub async fn append(&self, message: impl Into<String>) {
        let message = message.into();
        info!(activity = %message, "activity");

        let mut entries = self.entries.write().await;
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(LogEntry {
            ts: current_timestamp(),
            message,
        });
    }

    /// Copy out the current entries, oldest first.
    pub async fn recent(&self) -> Vec<LogEntry> {
        self.entries.read().await.iter().cloned().collect()
    }
}
