//! Reading storage -- the `ReadingStore` seam, SQLite and in-memory backends.
//!
//! Rows are ordered by insertion id, not by the timestamp a node reports, so
//! history windows follow arrival order even when node clocks drift.

pub mod memory;
pub mod schema;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use tracing::{debug, info};

pub use memory::MemoryStore;

use crate::detect::events::{parse_level, AlertEvent, EventKind};
use crate::detect::NodeHistory;
use crate::telemetry::Reading;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Append/query/prune store keyed by node and insertion order.
pub trait ReadingStore: Send + Sync {
    /// Persist `reading` and return its insertion id.
    fn append(&self, reading: &Reading) -> Result<i64>;

    /// The last `limit` rows for `node_id`, oldest first.
    fn history(&self, node_id: &str, limit: usize) -> Result<Vec<Reading>>;

    fn latest(&self, node_id: &str) -> Result<Option<Reading>>;

    /// The last `limit` rows across all nodes, oldest first.
    fn recent(&self, limit: usize) -> Result<Vec<Reading>>;

    /// Drop the oldest rows so at most `max_rows` remain. Returns rows removed.
    fn prune(&self, max_rows: usize) -> Result<usize>;

    /// Every node that has at least one stored row.
    fn node_ids(&self) -> Result<Vec<String>>;

    /// Persist an alert event and return its id.
    fn append_event(&self, event: &AlertEvent) -> Result<i64>;

    /// The last `limit` alert events, newest first.
    fn events(&self, limit: usize) -> Result<Vec<AlertEvent>>;
}

/// Load a recompute input for every stored node plus every `known` node.
/// Known nodes without rows get an empty history.
pub fn load_histories(
    store: &dyn ReadingStore,
    known: &[String],
    limit: usize,
) -> Result<Vec<NodeHistory>> {
    let nodes: BTreeSet<String> = store
        .node_ids()?
        .into_iter()
        .chain(known.iter().cloned())
        .collect();
    nodes
        .into_iter()
        .map(|node| {
            let rows = store.history(&node, limit)?;
            Ok(NodeHistory::new(node, rows))
        })
        .collect()
}

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create database directory {}", parent.display()))?;
    }
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;
    info!(path = %path.display(), "reading store ready");

    Ok(pool)
}

/// [`ReadingStore`] over a pooled SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

const READING_COLUMNS: &str = "id, node_id, ts, values_json, flags_json";

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            pool: open_pool(path)?,
        })
    }

    pub fn from_pool(pool: Pool) -> Self {
        Self { pool }
    }

    fn query(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Reading>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, row_to_reading)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl ReadingStore for SqliteStore {
    fn append(&self, reading: &Reading) -> Result<i64> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO readings (node_id, ts, values_json, flags_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                reading.node_id,
                reading.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
                serde_json::to_string(&reading.values)?,
                serde_json::to_string(&reading.flags)?,
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(node = %reading.node_id, id, "reading stored");
        Ok(id)
    }

    fn history(&self, node_id: &str, limit: usize) -> Result<Vec<Reading>> {
        let sql = format!(
            "SELECT {READING_COLUMNS} FROM readings WHERE node_id = ?1 ORDER BY id DESC LIMIT ?2"
        );
        let mut rows = self.query(&sql, &[&node_id as &dyn rusqlite::ToSql, &sql_limit(limit)])?;
        rows.reverse();
        Ok(rows)
    }

    fn latest(&self, node_id: &str) -> Result<Option<Reading>> {
        Ok(self.history(node_id, 1)?.pop())
    }

    fn recent(&self, limit: usize) -> Result<Vec<Reading>> {
        let sql = format!("SELECT {READING_COLUMNS} FROM readings ORDER BY id DESC LIMIT ?1");
        let mut rows = self.query(&sql, &[&sql_limit(limit) as &dyn rusqlite::ToSql])?;
        rows.reverse();
        Ok(rows)
    }

    fn prune(&self, max_rows: usize) -> Result<usize> {
        let conn = self.pool.get()?;
        let removed = conn.execute(
            "DELETE FROM readings WHERE id IN (
                SELECT id FROM readings ORDER BY id DESC LIMIT -1 OFFSET ?1
            )",
            [sql_limit(max_rows)],
        )?;
        if removed > 0 {
            debug!(removed, max_rows, "pruned old readings");
        }
        Ok(removed)
    }

    fn node_ids(&self) -> Result<Vec<String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT DISTINCT node_id FROM readings ORDER BY node_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    fn append_event(&self, event: &AlertEvent) -> Result<i64> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO events (ts, level, node_id, kind, message, abnormal_probability)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.ts.to_rfc3339_opts(SecondsFormat::Micros, true),
                event.level.to_string(),
                event.node_id,
                event.kind.as_str(),
                event.message,
                event.abnormal_probability,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn events(&self, limit: usize) -> Result<Vec<AlertEvent>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, ts, level, node_id, kind, message, abnormal_probability
             FROM events ORDER BY id DESC LIMIT ?1",
        )?;
        let events = stmt
            .query_map([sql_limit(limit)], row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }
}

fn sql_limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn conversion_error<E>(column: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
}

fn row_to_reading(row: &rusqlite::Row<'_>) -> rusqlite::Result<Reading> {
    let ts: String = row.get(2)?;
    let values_json: String = row.get(3)?;
    let flags_json: String = row.get(4)?;

    let timestamp = DateTime::parse_from_rfc3339(&ts)
        .map_err(|e| conversion_error(2, e))?
        .with_timezone(&Utc);
    let values: BTreeMap<String, Option<f64>> =
        serde_json::from_str(&values_json).map_err(|e| conversion_error(3, e))?;
    let flags: BTreeSet<String> =
        serde_json::from_str(&flags_json).map_err(|e| conversion_error(4, e))?;

    Ok(Reading {
        id: Some(row.get(0)?),
        node_id: row.get(1)?,
        timestamp,
        values,
        flags,
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<AlertEvent> {
    let ts: String = row.get(1)?;
    let level: String = row.get(2)?;
    let kind: String = row.get(4)?;
    Ok(AlertEvent {
        id: Some(row.get(0)?),
        ts: DateTime::parse_from_rfc3339(&ts)
            .map_err(|e| conversion_error(1, e))?
            .with_timezone(&Utc),
        level: parse_level(&level).map_err(|e| conversion_error(2, e))?,
        node_id: row.get(3)?,
        kind: kind
            .parse::<EventKind>()
            .map_err(|e| conversion_error(4, e))?,
        message: row.get(5)?,
        abnormal_probability: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{EventKind, Status};
    use crate::telemetry::forced_flag;
    use chrono::Duration;

    fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("db").join("readings.db")).unwrap();
        (dir, store)
    }

    fn reading(node: &str, offset: i64, tds: Option<f64>) -> Reading {
        Reading::new(node, Utc::now() + Duration::seconds(offset))
            .with_value("tds", tds)
            .unwrap()
    }

    #[test]
    fn test_append_and_history_order() {
        let (_dir, s) = store();
        for i in 0..5 {
            s.append(&reading("water_1", i, Some(400.0 + i as f64))).unwrap();
        }
        s.append(&reading("ground_1", 0, None)).unwrap();

        let h = s.history("water_1", 3).unwrap();
        assert_eq!(h.len(), 3);
        let tds: Vec<f64> = h.iter().filter_map(|r| r.value("tds")).collect();
        assert_eq!(tds, vec![402.0, 403.0, 404.0]);
        assert!(h[0].id < h[2].id);
    }

    #[test]
    fn test_round_trip_preserves_nulls_and_flags() {
        let (_dir, s) = store();
        let mut r = reading("ground_2", 0, None)
            .with_value("pm25", Some(1.2))
            .unwrap();
        r.flags.insert(forced_flag("pm25"));
        let id = s.append(&r).unwrap();

        let back = s.latest("ground_2").unwrap().unwrap();
        assert_eq!(back.id, Some(id));
        assert_eq!(back.values.get("tds"), Some(&None));
        assert_eq!(back.value("pm25"), Some(1.2));
        assert!(back.is_forced("pm25"));
        assert_eq!(
            back.timestamp.timestamp_micros(),
            r.timestamp.timestamp_micros()
        );
    }

    #[test]
    fn test_latest_missing_node() {
        let (_dir, s) = store();
        assert!(s.latest("water_1").unwrap().is_none());
        assert!(s.history("water_1", 10).unwrap().is_empty());
    }

    #[test]
    fn test_prune_keeps_newest() {
        let (_dir, s) = store();
        for i in 0..10 {
            s.append(&reading("water_1", i, Some(i as f64))).unwrap();
        }
        assert_eq!(s.prune(4).unwrap(), 6);
        assert_eq!(s.prune(4).unwrap(), 0);
        let rest = s.recent(100).unwrap();
        assert_eq!(rest.len(), 4);
        assert_eq!(rest[0].value("tds"), Some(6.0));
    }

    #[test]
    fn test_events_newest_first() {
        let (_dir, s) = store();
        let now = Utc::now();
        for (i, node) in ["ground_1", "water_1", "all"].iter().enumerate() {
            let event = AlertEvent {
                id: None,
                ts: now + Duration::seconds(i as i64),
                level: if i == 0 { Status::Danger } else { Status::Warning },
                node_id: node.to_string(),
                kind: if i == 2 { EventKind::Correlation } else { EventKind::Anomaly },
                message: format!("event {i}"),
                abnormal_probability: 0.5 + i as f64 / 10.0,
            };
            s.append_event(&event).unwrap();
        }
        let events = s.events(2).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].node_id, "all");
        assert_eq!(events[0].kind, EventKind::Correlation);
        assert_eq!(events[1].message, "event 1");
        assert!(events[0].id > events[1].id);

        let all = s.events(50).unwrap();
        assert_eq!(all[2].level, Status::Danger);
        assert_eq!(all[2].ts.timestamp_micros(), now.timestamp_micros());
    }

    #[test]
    fn test_load_histories_includes_known_nodes() {
        let (_dir, s) = store();
        s.append(&reading("water_1", 0, Some(1.0))).unwrap();
        let known = vec!["ground_1".to_string(), "water_1".to_string()];
        let inputs = load_histories(&s, &known, 50).unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[0].node_id, "ground_1");
        assert!(inputs[0].rows.is_empty());
        assert_eq!(inputs[1].rows.len(), 1);
        assert_eq!(inputs[1].features.len(), 4);
        assert_eq!(s.node_ids().unwrap(), vec!["water_1".to_string()]);
    }
}
