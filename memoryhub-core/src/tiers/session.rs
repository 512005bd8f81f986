//! In-memory tier. Never persisted; lost on process exit.

use std::collections::HashMap;

use chrono::Utc;

use crate::types::Record;

/// Transient store backing the `session` tier.
///
/// Records are held in a `Vec` in append order, with a side index from id to
/// position -- a plain `id`-keyed map would reorder lexicographically once
/// ids like `mem_10` sort ahead of `mem_2`, breaking the insertion-order
/// contract `search` must honor.
#[derive(Default)]
pub struct SessionTier {
    records: Vec<Record>,
    index: HashMap<String, usize>,
}

impl SessionTier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&mut self, record: Record) {
        let idx = self.records.len();
        self.index.insert(record.id.clone(), idx);
        self.records.push(record);
    }

    /// Case-insensitive substring search in insertion order, capped by `limit`.
    #[must_use]
    pub fn search(&self, query: &str, limit: usize) -> Vec<Record> {
        let query_lower = query.to_lowercase();
        self.records
            .iter()
            .filter(|r| r.matches(&query_lower))
            .take(limit)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Record> {
        let idx = *self.index.get(id)?;
        self.records.get(idx).cloned()
    }

    /// Bumps `recalled_count`/`last_recalled` in place and returns the
    /// updated record.
    pub fn increment_recall(&mut self, id: &str) -> Option<Record> {
        let idx = *self.index.get(id)?;
        let record = self.records.get_mut(idx)?;
        record.recalled_count += 1;
        record.last_recalled = Some(Utc::now());
        Some(record.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.records.iter().map(|r| r.id.clone()).collect()
    }
}
