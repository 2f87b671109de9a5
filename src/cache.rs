//! Process-wide memo of fetched file contents.
//!
//! Records are created on the first successful fetch and never replaced
//! until the whole cache is cleared by a "project changed" signal. Insertion
//! order is kept so the predictor corpus is stable across calls.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::Serialize;

use crate::predictor::CorpusEntry;

/// One fetched file.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub path: String,
    pub content: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct FileCache {
    records: RwLock<IndexMap<String, FileRecord>>,
}

impl FileCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<FileRecord> {
        self.records.read().get(path.trim()).cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.records.read().contains_key(path.trim())
    }

    /// Store a fetched file. An existing record wins; the stored record is
    /// returned either way.
    pub fn insert(&self, path: &str, content: String) -> FileRecord {
        let path = path.trim().to_string();
        let mut records = self.records.write();
        records
            .entry(path.clone())
            .or_insert_with(|| FileRecord {
                path,
                content,
                fetched_at: Utc::now(),
            })
            .clone()
    }

    /// Cached contents in insertion order, ready for prediction.
    pub fn corpus(&self) -> Vec<CorpusEntry> {
        self.records
            .read()
            .values()
            .map(|record| CorpusEntry::new(record.path.clone(), record.content.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Drop every record. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut records = self.records.write();
        let removed = records.len();
        records.clear();
        removed
    }
}
