//! Persistent store for the auto-tester controller
//!
//! The controller keeps its durable state in a local SQLite database,
//! organized as three buckets with JSON records:
//! - `autotester` — the analyzer configuration, single key `default`;
//! - `autotester_readings` — measurement results, append-only;
//! - `autotester_queue` — the persisted task FIFO.
//
// SQLite is used the same way throughout: WAL journal for concurrency, a
// busy timeout so concurrent access waits instead of failing, and a lazy
// connection owned by this manager. All access is funneled through one
// `Arc<Mutex<ControllerDatabase>>`, which doubles as the queue lock.

mod db_config;
mod db_queue;
mod db_readings;

use anyhow::{Context, Result};
use rusqlite::Connection;
use shared::config::{AnalyzerConfig, Parameter};
use shared::task::{Reading, Task, TaskKind};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Default database file name. Using a constant avoids magic strings.
const DATABASE_FILE: &str = "autotester.db";

/// SQLite-backed bucket store.
///
/// The `connection` field is an `Option<Connection>` so the connection can
/// be opened lazily and closed on shutdown.
pub struct ControllerDatabase {
    /// Path to the database file.
    db_path: PathBuf,
    /// The active SQLite connection, opened on first use.
    connection: Option<Connection>,
    /// Database busy timeout in seconds
    busy_timeout_seconds: u64,
}

impl ControllerDatabase {
    /// Create a store manager for a given data directory, creating the
    /// directory if necessary.
    pub fn new<P: AsRef<Path>>(data_dir: P, busy_timeout_seconds: u64) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        if !data_dir.exists() {
            std::fs::create_dir_all(data_dir).with_context(|| {
                format!("Failed to create data directory: {}", data_dir.display())
            })?;
        }

        Ok(Self {
            db_path: data_dir.join(DATABASE_FILE),
            connection: None,
            busy_timeout_seconds,
        })
    }

    /// Create the bucket tables. Idempotent; safe to call on every startup.
    pub async fn initialize(&mut self) -> Result<()> {
        info!("Initializing store at {}", self.db_path.display());

        let conn = self.get_connection()?;
        db_config::create_table(conn)?;
        db_readings::create_table(conn)?;
        db_queue::create_table(conn)?;

        info!("Store initialization complete");
        Ok(())
    }

    /// Lazily gets a mutable reference to the database connection,
    /// opening and configuring it on first use.
    pub fn get_connection(&mut self) -> Result<&mut Connection> {
        if self.connection.is_none() {
            let conn = Connection::open(&self.db_path)
                .with_context(|| format!("Failed to open database: {}", self.db_path.display()))?;

            // WAL lets readers proceed while a writer is active.
            conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
                .context("Failed to enable WAL mode")?;

            // Cap WAL growth between explicit checkpoints.
            conn.query_row("PRAGMA wal_autocheckpoint=1000", [], |_| Ok(()))
                .context("Failed to set WAL auto-checkpoint")?;

            conn.busy_timeout(std::time::Duration::from_secs(self.busy_timeout_seconds))
                .context("Failed to set busy timeout")?;

            self.connection = Some(conn);
        }

        // `unwrap` is safe here because we've just ensured `self.connection` is `Some`.
        Ok(self.connection.as_mut().unwrap())
    }

    /// Close the database connection gracefully.
    pub async fn close(&mut self) {
        if let Some(conn) = self.connection.take() {
            if let Err(e) = conn.close() {
                warn!("Error closing database connection: {:?}", e);
            } else {
                debug!("Database connection closed");
            }
        }
    }

    /// Checkpoint the WAL to prevent unbounded growth.
    ///
    /// # Returns
    /// Number of WAL frames that were checkpointed
    pub async fn checkpoint_wal(&mut self) -> Result<i64> {
        let conn = self.get_connection()?;

        let (busy, log_frames, checkpointed): (i64, i64, i64) =
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;

        if busy > 0 {
            debug!(
                "WAL checkpoint: {} frames checkpointed, {} busy, {} total in log",
                checkpointed, busy, log_frames
            );
        } else {
            debug!(
                "WAL checkpoint complete: {} frames checkpointed, WAL truncated",
                checkpointed
            );
        }

        Ok(checkpointed)
    }

    // ========== Configuration bucket ==========

    /// Load the `default` configuration record, creating it with defaults
    /// on first use.
    pub async fn load_config(&mut self) -> Result<AnalyzerConfig> {
        let conn = self.get_connection()?;
        match db_config::get(conn)? {
            Some(config) => Ok(config),
            None => {
                info!("No configuration record found, creating defaults");
                let config = AnalyzerConfig::default();
                db_config::put(conn, &config)?;
                Ok(config)
            }
        }
    }

    /// Replace the `default` configuration record with the full record given.
    pub async fn store_config(&mut self, config: &AnalyzerConfig) -> Result<()> {
        let conn = self.get_connection()?;
        db_config::put(conn, config)
    }

    // ========== Queue bucket ==========

    /// Persist a new task; the store assigns its key.
    pub async fn enqueue_task(&mut self, kind: TaskKind, ts: u64) -> Result<Task> {
        let conn = self.get_connection()?;
        db_queue::insert(conn, kind, ts)
    }

    /// The queued task for a given param, if any.
    pub async fn find_queued_task(&mut self, kind: TaskKind) -> Result<Option<Task>> {
        let conn = self.get_connection()?;
        db_queue::find_by_param(conn, kind)
    }

    /// Remove the queued task for a given param. Returns whether one existed.
    pub async fn remove_queued_task(&mut self, kind: TaskKind) -> Result<bool> {
        let conn = self.get_connection()?;
        db_queue::delete_by_param(conn, kind)
    }

    /// Remove and return the task with the minimum enqueue time
    /// (ties broken by key).
    pub async fn pop_next_task(&mut self) -> Result<Option<Task>> {
        let conn = self.get_connection()?;
        db_queue::pop_next(conn)
    }

    /// All queued tasks in FIFO order.
    pub async fn list_queued_tasks(&mut self) -> Result<Vec<Task>> {
        let conn = self.get_connection()?;
        db_queue::list(conn)
    }

    /// Whether the queue bucket holds any task.
    pub async fn queue_is_empty(&mut self) -> Result<bool> {
        let conn = self.get_connection()?;
        db_queue::is_empty(conn)
    }

    // ========== Readings bucket ==========

    /// Append one measurement result.
    pub async fn append_reading(&mut self, reading: &Reading) -> Result<i64> {
        let conn = self.get_connection()?;
        db_readings::append(conn, reading)
    }

    /// Full reading history for a parameter, oldest first.
    pub async fn readings_for(&mut self, param: Parameter) -> Result<Vec<Reading>> {
        let conn = self.get_connection()?;
        db_readings::list_for_param(conn, param)
    }
}
