//! Queue bucket: the persisted task FIFO
//!
//! Tasks are JSON records keyed by a store-assigned id. `ts` is the sole
//! ordering key, with the id as a stable tie-break. The UNIQUE constraint
//! on `param` backs the one-task-per-param invariant at the storage layer
//! as well; the queue front-end checks it first and reports the typed
//! duplicate error.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use shared::task::{Task, TaskKind, TaskRecord};
use tracing::debug;

/// Create the queue bucket.
pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS autotester_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            param TEXT NOT NULL UNIQUE,
            ts INTEGER NOT NULL,
            record TEXT NOT NULL
        )
        "#,
        [],
    )
    .context("Failed to create autotester_queue bucket")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_queue_ts ON autotester_queue(ts, id)",
        [],
    )?;

    Ok(())
}

fn decode(id: i64, json: &str) -> Result<Task> {
    let record: TaskRecord =
        serde_json::from_str(json).context("Failed to decode queued task record")?;
    Ok(record.into_task(id))
}

/// Persist a new task and return it with its store-assigned key.
pub fn insert(conn: &Connection, kind: TaskKind, ts: u64) -> Result<Task> {
    let record = TaskRecord {
        param: kind,
        code: kind.opcode(),
        ts,
    };
    let json = serde_json::to_string(&record).context("Failed to encode task record")?;

    conn.execute(
        "INSERT INTO autotester_queue (param, ts, record) VALUES (?1, ?2, ?3)",
        params![kind.to_string(), ts as i64, json],
    )?;
    let id = conn.last_insert_rowid();

    debug!(param = %kind, id, "Task persisted");
    Ok(record.into_task(id))
}

/// The queued task with a given param, if any.
pub fn find_by_param(conn: &Connection, kind: TaskKind) -> Result<Option<Task>> {
    let row: Option<(i64, String)> = conn
        .query_row(
            "SELECT id, record FROM autotester_queue WHERE param = ?1",
            params![kind.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match row {
        Some((id, json)) => Ok(Some(decode(id, &json)?)),
        None => Ok(None),
    }
}

/// Delete the queued task with a given param. Returns whether one existed.
pub fn delete_by_param(conn: &Connection, kind: TaskKind) -> Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM autotester_queue WHERE param = ?1",
        params![kind.to_string()],
    )?;
    Ok(deleted > 0)
}

/// Remove and return the entry with the minimum `ts` (ties broken by id).
pub fn pop_next(conn: &Connection) -> Result<Option<Task>> {
    let row: Option<(i64, String)> = conn
        .query_row(
            "SELECT id, record FROM autotester_queue ORDER BY ts ASC, id ASC LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let Some((id, json)) = row else {
        return Ok(None);
    };

    conn.execute("DELETE FROM autotester_queue WHERE id = ?1", params![id])?;
    Ok(Some(decode(id, &json)?))
}

/// All queued tasks, FIFO order.
pub fn list(conn: &Connection) -> Result<Vec<Task>> {
    let mut stmt =
        conn.prepare("SELECT id, record FROM autotester_queue ORDER BY ts ASC, id ASC")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut tasks = Vec::new();
    for row in rows {
        let (id, json) = row?;
        tasks.push(decode(id, &json)?);
    }
    Ok(tasks)
}

/// Whether the bucket holds any task.
pub fn is_empty(conn: &Connection) -> Result<bool> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM autotester_queue", [], |row| row.get(0))?;
    Ok(count == 0)
}
