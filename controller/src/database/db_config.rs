//! Configuration bucket: the single `default` analyzer record

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use shared::config::AnalyzerConfig;

/// Key of the one configuration record.
const DEFAULT_KEY: &str = "default";

/// Create the configuration bucket.
pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS autotester (
            key TEXT PRIMARY KEY,
            record TEXT NOT NULL
        )
        "#,
        [],
    )
    .context("Failed to create autotester bucket")?;
    Ok(())
}

/// Load the configuration record, if present.
pub fn get(conn: &Connection) -> Result<Option<AnalyzerConfig>> {
    let record: Option<String> = conn
        .query_row(
            "SELECT record FROM autotester WHERE key = ?1",
            params![DEFAULT_KEY],
            |row| row.get(0),
        )
        .optional()?;

    match record {
        Some(json) => {
            let config = serde_json::from_str(&json)
                .context("Failed to decode configuration record")?;
            Ok(Some(config))
        }
        None => Ok(None),
    }
}

/// Write the full configuration record, replacing any previous one.
pub fn put(conn: &Connection, config: &AnalyzerConfig) -> Result<()> {
    let json = serde_json::to_string(config).context("Failed to encode configuration record")?;
    conn.execute(
        "INSERT OR REPLACE INTO autotester (key, record) VALUES (?1, ?2)",
        params![DEFAULT_KEY, json],
    )?;
    Ok(())
}
