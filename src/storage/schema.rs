//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Current schema version recorded in `schema_version`.
pub const SCHEMA_VERSION: i64 = 3;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS readings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            node_id TEXT NOT NULL,
            ts TEXT NOT NULL,
            values_json TEXT NOT NULL,
            received_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_readings_node_id ON readings(node_id, id);
        CREATE INDEX IF NOT EXISTS idx_readings_node_ts ON readings(node_id, ts);",
    )?;

    // v2: substitution flags recorded on each reading
    let has_flags: i64 = conn.query_row(
        "SELECT count(*) FROM pragma_table_info('readings') WHERE name='flags_json'",
        [],
        |row| row.get(0),
    )?;
    if has_flags == 0 {
        conn.execute(
            "ALTER TABLE readings ADD COLUMN flags_json TEXT NOT NULL DEFAULT '[]'",
            [],
        )?;
    }

    // v3: alert event log
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts TEXT NOT NULL,
            level TEXT NOT NULL,
            node_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            message TEXT NOT NULL,
            abnormal_probability REAL NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_events_ts ON events(ts);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;
    Ok(())
}
