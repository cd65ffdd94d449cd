//! In-memory vector store for chunk records. Supports upsert by id, filtering,
//! ranking against a query embedding, and stats.
//!
//! The store never persists itself; it only tracks whether it changed since the
//! last flush (see [crate::persistence]).

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::record::{ChunkRecord, MetadataFilter, ValidationError, WORD_COUNT};
use crate::similarity::{rank_by_query, Scored};

/// What an accepted upsert did. Replaced records keep their original position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
}

/// Summary of a bulk upsert. Rejected records never abort the batch.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BatchReport {
    pub inserted: usize,
    pub replaced: usize,
    pub rejected: Vec<ValidationError>,
}

impl BatchReport {
    pub fn accepted(&self) -> usize {
        self.inserted + self.replaced
    }

    fn record(&mut self, result: Result<UpsertOutcome, ValidationError>) {
        match result {
            Ok(UpsertOutcome::Inserted) => self.inserted += 1,
            Ok(UpsertOutcome::Replaced) => self.replaced += 1,
            Err(e) => self.rejected.push(e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total_documents: usize,
    pub average_embedding_length: f64,
    /// Metadata field that was summed into `field_total`.
    pub field: String,
    pub field_total: f64,
}

impl StoreStats {
    /// Stats over any set of records, including ones not held by a store.
    pub fn over<'a>(records: impl IntoIterator<Item = &'a ChunkRecord>, field: &str) -> Self {
        let (mut total, mut embedding_values, mut field_total) = (0usize, 0usize, 0.0f64);
        for r in records {
            total += 1;
            embedding_values += r.embedding.len();
            field_total += r.metadata.get(field).and_then(|v| v.as_f64()).unwrap_or(0.0);
        }
        let average_embedding_length = if total == 0 {
            0.0
        } else {
            embedding_values as f64 / total as f64
        };
        StoreStats {
            total_documents: total,
            average_embedding_length,
            field: field.to_string(),
            field_total,
        }
    }
}

/// Ordered collection of chunk records, unique by id.
#[derive(Debug, Default)]
pub struct VectorStore {
    records: Vec<ChunkRecord>,
    positions: HashMap<String, usize>,
    dirty: bool,
}

impl VectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from records, applying the same validation as [`Self::upsert`].
    pub fn from_records(records: impl IntoIterator<Item = ChunkRecord>) -> (Self, BatchReport) {
        let mut store = Self::new();
        let report = store.upsert_batch(records);
        (store, report)
    }

    /// Inserts the record, or replaces the one with the same id in place.
    /// Invalid records are logged and rejected without touching the store.
    pub fn upsert(&mut self, record: ChunkRecord) -> Result<UpsertOutcome, ValidationError> {
        if let Err(e) = record.validate() {
            warn!("rejected record: {}", e);
            return Err(e);
        }
        self.dirty = true;
        if let Some(&pos) = self.positions.get(&record.id) {
            debug!("replaced record {}", record.id);
            self.records[pos] = record;
            return Ok(UpsertOutcome::Replaced);
        }
        debug!("inserted record {}", record.id);
        self.positions.insert(record.id.clone(), self.records.len());
        self.records.push(record);
        Ok(UpsertOutcome::Inserted)
    }

    /// Upserts every record in order.
    pub fn upsert_batch(&mut self, records: impl IntoIterator<Item = ChunkRecord>) -> BatchReport {
        let mut report = BatchReport::default();
        for record in records {
            report.record(self.upsert(record));
        }
        if !report.rejected.is_empty() {
            warn!(
                "{} record(s) rejected out of {}",
                report.rejected.len(),
                report.rejected.len() + report.accepted()
            );
        }
        report
    }

    /// Removes the record with this id, keeping the order of the others.
    pub fn remove(&mut self, id: &str) -> Option<ChunkRecord> {
        let pos = self.positions.remove(id)?;
        let removed = self.records.remove(pos);
        for record in &self.records[pos..] {
            if let Some(p) = self.positions.get_mut(&record.id) {
                *p -= 1;
            }
        }
        self.dirty = true;
        Some(removed)
    }

    /// Empties the store and returns how many records were dropped.
    pub fn clear(&mut self) -> usize {
        let count = self.records.len();
        self.records.clear();
        self.positions.clear();
        if count > 0 {
            self.dirty = true;
        }
        info!("cleared {} record(s) from store", count);
        count
    }

    pub fn get(&self, id: &str) -> Option<&ChunkRecord> {
        self.positions.get(id).map(|&pos| &self.records[pos])
    }

    /// All records in insertion order, optionally restricted to those whose
    /// metadata matches every field of `filter`.
    pub fn all(&self, filter: Option<&MetadataFilter>) -> Vec<&ChunkRecord> {
        match filter {
            Some(f) if !f.is_empty() => self
                .records
                .iter()
                .filter(|r| r.metadata.matches(f))
                .collect(),
            _ => self.records.iter().collect(),
        }
    }

    pub fn records(&self) -> &[ChunkRecord] {
        &self.records
    }

    /// Most similar records to `query`, best first. Never fails; see [rank_by_query].
    pub fn rank(&self, query: &[f32], top_k: usize) -> Vec<Scored<'_>> {
        rank_by_query(query, &self.records, top_k)
    }

    /// Stats with `wordCount` as the summed field.
    pub fn stats(&self) -> StoreStats {
        self.stats_for(WORD_COUNT)
    }

    /// Stats summing a numeric metadata `field`. Records without it count as 0.
    pub fn stats_for(&self, field: &str) -> StoreStats {
        StoreStats::over(&self.records, field)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// True when the store changed since the last [`Self::mark_clean`].
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Forces the next flush to save, for changes made to records held outside the store.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

/// A ranked record detached from the store lock.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedRecord {
    pub record: ChunkRecord,
    pub score: f64,
}

/// Shared handle to one store: many concurrent readers, one writer at a time.
/// Readers see the store either before or after a write, never halfway through.
#[derive(Debug, Clone, Default)]
pub struct SharedStore {
    inner: Arc<RwLock<VectorStore>>,
}

impl SharedStore {
    pub fn new(store: VectorStore) -> Self {
        Self {
            inner: Arc::new(RwLock::new(store)),
        }
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, VectorStore> {
        self.inner.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, VectorStore> {
        self.inner.write().await
    }

    /// Ranks under a read lock and clones the winners out.
    pub async fn rank(&self, query: &[f32], top_k: usize) -> Vec<RankedRecord> {
        self.read()
            .await
            .rank(query, top_k)
            .into_iter()
            .map(|s| RankedRecord {
                record: s.record.clone(),
                score: s.score,
            })
            .collect()
    }

    /// Upserts a batch under a single write lock.
    pub async fn upsert_batch(&self, records: impl IntoIterator<Item = ChunkRecord>) -> BatchReport {
        self.write().await.upsert_batch(records)
    }
}
