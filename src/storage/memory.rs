//! In-process [`ReadingStore`] for tests and `serve --memory`.

use std::collections::BTreeSet;

use anyhow::Result;
use parking_lot::Mutex;

use super::ReadingStore;
use crate::detect::AlertEvent;
use crate::telemetry::Reading;

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    rows: Vec<Reading>,
    events: Vec<AlertEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn tail<T>(items: impl DoubleEndedIterator<Item = T>, limit: usize) -> Vec<T> {
    let mut out: Vec<T> = items.rev().take(limit).collect();
    out.reverse();
    out
}

impl ReadingStore for MemoryStore {
    fn append(&self, reading: &Reading) -> Result<i64> {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        let mut row = reading.clone();
        row.id = Some(id);
        inner.rows.push(row);
        Ok(id)
    }

    fn history(&self, node_id: &str, limit: usize) -> Result<Vec<Reading>> {
        let inner = self.inner.lock();
        Ok(tail(
            inner.rows.iter().filter(|r| r.node_id == node_id).cloned(),
            limit,
        ))
    }

    fn latest(&self, node_id: &str) -> Result<Option<Reading>> {
        let inner = self.inner.lock();
        Ok(inner.rows.iter().rev().find(|r| r.node_id == node_id).cloned())
    }

    fn recent(&self, limit: usize) -> Result<Vec<Reading>> {
        let inner = self.inner.lock();
        Ok(tail(inner.rows.iter().cloned(), limit))
    }

    fn prune(&self, max_rows: usize) -> Result<usize> {
        let mut inner = self.inner.lock();
        let excess = inner.rows.len().saturating_sub(max_rows);
        inner.rows.drain(..excess);
        Ok(excess)
    }

    fn node_ids(&self) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        let ids: BTreeSet<String> = inner.rows.iter().map(|r| r.node_id.clone()).collect();
        Ok(ids.into_iter().collect())
    }

    fn append_event(&self, event: &AlertEvent) -> Result<i64> {
        let mut inner = self.inner.lock();
        let id = inner.events.len() as i64 + 1;
        let mut event = event.clone();
        event.id = Some(id);
        inner.events.push(event);
        Ok(id)
    }

    fn events(&self, limit: usize) -> Result<Vec<AlertEvent>> {
        let inner = self.inner.lock();
        Ok(inner.events.iter().rev().take(limit).cloned().collect())
    }
}
