//! Readings bucket: measurement results
//!
//! Readings are create-only JSON records; nothing ever updates or deletes
//! them. The `param`/`ts` columns exist for the per-parameter history query.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use shared::config::Parameter;
use shared::task::Reading;

/// Create the readings bucket.
pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS autotester_readings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            param TEXT NOT NULL,
            ts INTEGER NOT NULL,
            record TEXT NOT NULL
        )
        "#,
        [],
    )
    .context("Failed to create autotester_readings bucket")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_readings_param_ts ON autotester_readings(param, ts)",
        [],
    )?;

    Ok(())
}

/// Append one reading and return its store-assigned key.
pub fn append(conn: &Connection, reading: &Reading) -> Result<i64> {
    let json = serde_json::to_string(reading).context("Failed to encode reading record")?;
    conn.execute(
        "INSERT INTO autotester_readings (param, ts, record) VALUES (?1, ?2, ?3)",
        params![reading.param.as_str(), reading.ts as i64, json],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Full history for one parameter, oldest first.
pub fn list_for_param(conn: &Connection, param: Parameter) -> Result<Vec<Reading>> {
    let mut stmt = conn.prepare(
        "SELECT record FROM autotester_readings WHERE param = ?1 ORDER BY ts ASC, id ASC",
    )?;
    let rows = stmt.query_map(params![param.as_str()], |row| row.get::<_, String>(0))?;

    let mut readings = Vec::new();
    for row in rows {
        let json = row?;
        readings.push(
            serde_json::from_str(&json).context("Failed to decode reading record")?,
        );
    }
    Ok(readings)
}
