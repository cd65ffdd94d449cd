//! Saving and loading the store through a [`KeyValueStore`].
//!
//! The full payload (records with embeddings) lives under the store key. When the
//! medium refuses it, a reduced payload without embeddings is written under
//! `<key>_reduced` instead and the save is reported as degraded.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::kv::{KeyValueStore, KvError};
use crate::record::{ChunkRecord, Metadata};
use crate::store::{BatchReport, VectorStore};

/// Key used when the config does not name one.
pub const DEFAULT_STORE_KEY: &str = "vector_store";

/// A successful save, at full or reduced fidelity.
#[derive(Debug)]
pub enum SaveOutcome {
    Full {
        records: usize,
        bytes: usize,
    },
    /// Embeddings were dropped; `cause` is why the full payload was refused.
    Degraded {
        records: usize,
        bytes: usize,
        cause: KvError,
    },
}

impl SaveOutcome {
    pub fn is_degraded(&self) -> bool {
        matches!(self, SaveOutcome::Degraded { .. })
    }
}

/// Which payload a load came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Full,
    /// Records have no embeddings and must be re-embedded before ranking.
    Reduced,
    Missing,
}

#[derive(Debug)]
pub struct Loaded {
    pub records: Vec<ChunkRecord>,
    pub source: LoadSource,
    /// Elements of the payload that were not records and were dropped.
    pub malformed: usize,
    /// Set when a payload existed but could not be read; `records` is then empty.
    pub fault: Option<PersistenceError>,
}

#[derive(Debug)]
pub struct Hydrated {
    pub source: LoadSource,
    pub report: BatchReport,
    /// Records from a reduced payload, waiting for embeddings.
    pub pending_reembed: Vec<ChunkRecord>,
    pub malformed: usize,
    pub fault: Option<PersistenceError>,
}

#[derive(Serialize)]
struct ReducedRecord<'a> {
    id: &'a str,
    text: &'a str,
    metadata: &'a Metadata,
}

/// Persists one store under a fixed key in a key-value medium.
#[derive(Debug)]
pub struct PersistenceAdapter<K> {
    kv: K,
    key: String,
    reduced_key: String,
}

impl<K: KeyValueStore> PersistenceAdapter<K> {
    pub fn new(kv: K, key: impl Into<String>) -> Self {
        let key = key.into();
        let reduced_key = format!("{key}_reduced");
        Self {
            kv,
            key,
            reduced_key,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn reduced_key(&self) -> &str {
        &self.reduced_key
    }

    pub fn kv(&self) -> &K {
        &self.kv
    }

    /// Writes the full payload, falling back to the reduced one if the medium refuses it.
    pub fn save(&mut self, records: &[ChunkRecord]) -> Result<SaveOutcome, PersistenceError> {
        let full = serde_json::to_vec(records).map_err(PersistenceError::Serialize)?;
        let cause = match self.kv.put(&self.key, &full) {
            Ok(()) => {
                if let Err(e) = self.kv.remove(&self.reduced_key) {
                    warn!("could not remove stale reduced payload: {}", e);
                }
                info!("saved {} record(s) ({} bytes)", records.len(), full.len());
                return Ok(SaveOutcome::Full {
                    records: records.len(),
                    bytes: full.len(),
                });
            }
            Err(e) => e,
        };

        warn!("full save failed ({}); retrying without embeddings", cause);
        let reduced: Vec<ReducedRecord<'_>> = records
            .iter()
            .map(|r| ReducedRecord {
                id: &r.id,
                text: &r.text,
                metadata: &r.metadata,
            })
            .collect();
        let reduced = serde_json::to_vec(&reduced).map_err(PersistenceError::Serialize)?;
        let mut put = self.kv.put(&self.reduced_key, &reduced);
        if let Err(KvError::CapacityExceeded { .. }) = put {
            // The previous full payload still counts against the quota.
            if let Ok(Some(stale)) = self.kv.get(&self.key) {
                debug!("dropping stale full payload to make room for the reduced one");
                self.kv.remove(&self.key)?;
                put = self.kv.put(&self.reduced_key, &reduced);
                if put.is_err() {
                    if let Err(e) = self.kv.put(&self.key, &stale) {
                        error!("could not restore previous full payload: {}", e);
                    }
                }
            }
        }
        if let Err(e) = put {
            error!("reduced save failed too: {}", e);
            return Err(PersistenceError::FallbackFailed {
                full: cause,
                reduced: e,
            });
        }
        // An older full payload would otherwise shadow the reduced one on load.
        if let Err(e) = self.kv.remove(&self.key) {
            warn!("could not remove stale full payload: {}", e);
        }
        warn!(
            "saved {} record(s) without embeddings ({} bytes)",
            records.len(),
            reduced.len()
        );
        Ok(SaveOutcome::Degraded {
            records: records.len(),
            bytes: reduced.len(),
            cause,
        })
    }

    /// Saves only if the store changed, and marks it clean on success.
    pub fn flush(&mut self, store: &mut VectorStore) -> Result<Option<SaveOutcome>, PersistenceError> {
        if !store.is_dirty() {
            return Ok(None);
        }
        let outcome = self.save(store.records())?;
        store.mark_clean();
        Ok(Some(outcome))
    }

    /// Reads the full payload, else the reduced one. Never fails: a missing key is
    /// an empty load and an unreadable payload is reported in `fault`.
    pub fn load(&self) -> Loaded {
        for (key, source) in [(&self.key, LoadSource::Full), (&self.reduced_key, LoadSource::Reduced)] {
            match self.kv.get(key) {
                Ok(None) => continue,
                Ok(Some(bytes)) => {
                    return match parse_payload(&bytes) {
                        Ok((records, malformed)) => {
                            if malformed > 0 {
                                warn!("dropped {} malformed record(s) from {}", malformed, key);
                            }
                            info!("loaded {} record(s) from {}", records.len(), key);
                            Loaded {
                                records,
                                source,
                                malformed,
                                fault: None,
                            }
                        }
                        Err(e) => {
                            error!("stored payload {} is corrupt: {}", key, e);
                            Loaded::faulted(PersistenceError::Parse {
                                key: key.clone(),
                                source: e,
                            })
                        }
                    };
                }
                Err(e) => {
                    error!("could not read {}: {}", key, e);
                    return Loaded::faulted(PersistenceError::Kv(e));
                }
            }
        }
        Loaded {
            records: Vec::new(),
            source: LoadSource::Missing,
            malformed: 0,
            fault: None,
        }
    }

    /// Loads into `store`. Reduced records are handed back for re-embedding
    /// rather than inserted, since the store only holds embedded records.
    pub fn hydrate(&self, store: &mut VectorStore) -> Hydrated {
        let loaded = self.load();
        let mut hydrated = Hydrated {
            source: loaded.source,
            report: BatchReport::default(),
            pending_reembed: Vec::new(),
            malformed: loaded.malformed,
            fault: loaded.fault,
        };
        match loaded.source {
            LoadSource::Full => {
                hydrated.report = store.upsert_batch(loaded.records);
                store.mark_clean();
            }
            LoadSource::Reduced => hydrated.pending_reembed = loaded.records,
            LoadSource::Missing => {}
        }
        hydrated
    }

    /// Removes both the full and the reduced payload.
    pub fn wipe(&mut self) -> Result<(), PersistenceError> {
        self.kv.remove(&self.key)?;
        self.kv.remove(&self.reduced_key)?;
        info!("wiped {} and {}", self.key, self.reduced_key);
        Ok(())
    }
}

/// Parses a stored array element by element. Only a payload that is not a JSON
/// array fails as a whole; elements that are not records are counted and dropped.
fn parse_payload(bytes: &[u8]) -> Result<(Vec<ChunkRecord>, usize), serde_json::Error> {
    let items: Vec<serde_json::Value> = serde_json::from_slice(bytes)?;
    let total = items.len();
    let records: Vec<ChunkRecord> = items
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect();
    let malformed = total - records.len();
    Ok((records, malformed))
}

impl Loaded {
    fn faulted(fault: PersistenceError) -> Self {
        Self {
            records: Vec::new(),
            source: LoadSource::Missing,
            malformed: 0,
            fault: Some(fault),
        }
    }
}

/// Writes records in the interchange format: a pretty-printed JSON array.
pub fn export_to_writer<W: Write>(records: &[ChunkRecord], writer: W) -> Result<(), PersistenceError> {
    serde_json::to_writer_pretty(writer, records).map_err(PersistenceError::Serialize)
}

pub fn export_to_path(records: &[ChunkRecord], path: &Path) -> Result<(), PersistenceError> {
    let file = std::fs::File::create(path).map_err(|e| PersistenceError::Export(path.to_path_buf(), e))?;
    let mut writer = std::io::BufWriter::new(file);
    export_to_writer(records, &mut writer)?;
    writer
        .flush()
        .map_err(|e| PersistenceError::Export(path.to_path_buf(), e))
}

/// Parses the interchange format back into records. Records are not validated here;
/// upsert them into a store to filter out invalid ones.
pub fn read_records(bytes: &[u8]) -> Result<Vec<ChunkRecord>, PersistenceError> {
    serde_json::from_slice(bytes).map_err(|source| PersistenceError::Parse {
        key: "<export>".to_string(),
        source,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("failed to serialize store: {0}")]
    Serialize(serde_json::Error),
    #[error("stored payload {key} is not a valid record array: {source}")]
    Parse {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("storage error: {0}")]
    Kv(#[from] KvError),
    #[error("full save failed ({full}) and reduced save failed ({reduced})")]
    FallbackFailed { full: KvError, reduced: KvError },
    #[error("failed to export to {0}: {1}")]
    Export(PathBuf, std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn sample() -> Vec<ChunkRecord> {
        (0..4)
            .map(|i| {
                let mut metadata = Metadata {
                    source_file: Some("doc.pdf".into()),
                    word_count: Some(10 + i),
                    chunk_index: Some(i),
                    ..Metadata::default()
                };
                metadata.insert_extra("documentType", "Report");
                ChunkRecord::new(
                    format!("doc.pdf#{i}"),
                    format!("chunk number {i}"),
                    (0..64).map(|d| (d as f32 + i as f32) / 100.0).collect(),
                )
                .with_metadata(metadata)
            })
            .collect()
    }

    #[test]
    fn save_then_load_round_trips() {
        let records = sample();
        let mut adapter = PersistenceAdapter::new(MemoryKv::new(), DEFAULT_STORE_KEY);
        let outcome = adapter.save(&records).unwrap();
        assert!(matches!(outcome, SaveOutcome::Full { records: 4, .. }));

        let loaded = adapter.load();
        assert_eq!(loaded.source, LoadSource::Full);
        assert!(loaded.fault.is_none());
        assert_eq!(loaded.records, records);
    }

    #[test]
    fn over_capacity_falls_back_to_reduced_payload() {
        let records = sample();
        let full_len = serde_json::to_vec(&records).unwrap().len() as u64;
        let mut adapter = PersistenceAdapter::new(MemoryKv::with_quota(full_len - 1), "store");

        let outcome = adapter.save(&records).unwrap();
        assert!(outcome.is_degraded());
        assert!(matches!(
            outcome,
            SaveOutcome::Degraded {
                cause: KvError::CapacityExceeded { .. },
                ..
            }
        ));
        assert!(adapter.kv().contains("store_reduced"));

        let loaded = adapter.load();
        assert_eq!(loaded.source, LoadSource::Reduced);
        assert_eq!(loaded.records.len(), records.len());
        for (got, want) in loaded.records.iter().zip(&records) {
            assert_eq!(got.id, want.id);
            assert_eq!(got.text, want.text);
            assert_eq!(got.metadata, want.metadata);
            assert!(got.embedding.is_empty());
        }
    }

    #[test]
    fn degraded_save_hides_older_full_payload() {
        let records = sample();
        let full_len = serde_json::to_vec(&records).unwrap().len() as u64;
        let mut kv = MemoryKv::with_quota(full_len - 1);
        kv.put("store", &serde_json::to_vec(&records[..1]).unwrap()).unwrap();

        let mut adapter = PersistenceAdapter::new(kv, "store");
        assert!(adapter.save(&records).unwrap().is_degraded());
        assert!(!adapter.kv().contains("store"));
        assert_eq!(adapter.load().source, LoadSource::Reduced);
    }

    #[test]
    fn failure_when_both_payloads_refused() {
        let mut adapter = PersistenceAdapter::new(MemoryKv::with_quota(4), "store");
        let err = adapter.save(&sample()).unwrap_err();
        assert!(matches!(err, PersistenceError::FallbackFailed { .. }));
    }

    #[test]
    fn missing_key_loads_empty() {
        let adapter = PersistenceAdapter::new(MemoryKv::new(), "store");
        let loaded = adapter.load();
        assert_eq!(loaded.source, LoadSource::Missing);
        assert!(loaded.records.is_empty());
        assert!(loaded.fault.is_none());
    }

    #[test]
    fn corrupt_payload_loads_empty_with_fault() {
        let mut kv = MemoryKv::new();
        kv.put("store", b"{not json").unwrap();
        let adapter = PersistenceAdapter::new(kv, "store");
        let loaded = adapter.load();
        assert!(loaded.records.is_empty());
        assert!(matches!(loaded.fault, Some(PersistenceError::Parse { .. })));
    }

    #[test]
    fn wipe_removes_both_keys() {
        let mut kv = MemoryKv::new();
        kv.put("store", b"[]").unwrap();
        kv.put("store_reduced", b"[]").unwrap();
        let mut adapter = PersistenceAdapter::new(kv, "store");
        adapter.wipe().unwrap();
        assert!(!adapter.kv().contains("store"));
        assert!(!adapter.kv().contains("store_reduced"));
    }

    #[test]
    fn flush_saves_only_dirty_stores() {
        let mut adapter = PersistenceAdapter::new(MemoryKv::new(), "store");
        let (mut store, _) = VectorStore::from_records(sample());
        assert!(adapter.flush(&mut store).unwrap().is_some());
        assert!(!store.is_dirty());
        assert!(adapter.flush(&mut store).unwrap().is_none());

        let mut fresh = VectorStore::new();
        let hydrated = adapter.hydrate(&mut fresh);
        assert_eq!(hydrated.source, LoadSource::Full);
        assert_eq!(hydrated.report.inserted, 4);
        assert_eq!(fresh.records(), store.records());
        assert!(!fresh.is_dirty());
    }

    #[test]
    fn export_writes_interchange_format() {
        let records = sample();
        let mut buf = Vec::new();
        export_to_writer(&records, &mut buf).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        let first = &value.as_array().unwrap()[0];
        assert_eq!(first["id"], "doc.pdf#0");
        assert_eq!(first["metadata"]["sourceFile"], "doc.pdf");
        assert_eq!(first["embedding"].as_array().unwrap().len(), 64);
    }

    #[test]
    fn exported_records_read_back() {
        let records = sample();
        let mut buf = Vec::new();
        export_to_writer(&records, &mut buf).unwrap();
        assert_eq!(read_records(&buf).unwrap(), records);
        assert!(matches!(read_records(b"{}"), Err(PersistenceError::Parse { .. })));
    }

    #[test]
    fn growing_past_quota_after_full_save_degrades() {
        let mut records = sample();
        let full_len = serde_json::to_vec(&records).unwrap().len() as u64;
        let mut adapter = PersistenceAdapter::new(MemoryKv::with_quota(full_len + 10), "store");
        assert!(!adapter.save(&records).unwrap().is_degraded());

        records.push(ChunkRecord::new("doc.pdf#4", "one more", vec![0.25; 64]));
        let outcome = adapter.save(&records).unwrap();
        assert!(outcome.is_degraded());
        assert!(!adapter.kv().contains("store"));

        let loaded = adapter.load();
        assert_eq!(loaded.source, LoadSource::Reduced);
        assert_eq!(loaded.records.len(), 5);
    }

    #[test]
    fn previous_full_payload_kept_when_reduced_cannot_fit() {
        let records = sample();
        let full_len = serde_json::to_vec(&records).unwrap().len() as u64;
        let mut adapter = PersistenceAdapter::new(MemoryKv::with_quota(full_len), "store");
        adapter.save(&records).unwrap();

        let huge = vec![ChunkRecord::new("big", "x".repeat(full_len as usize * 2), vec![1.0])];
        assert!(matches!(
            adapter.save(&huge),
            Err(PersistenceError::FallbackFailed { .. })
        ));
        let loaded = adapter.load();
        assert_eq!(loaded.source, LoadSource::Full);
        assert_eq!(loaded.records, records);
    }

    #[test]
    fn one_bad_stored_record_does_not_empty_the_store() {
        let mut kv = MemoryKv::new();
        kv.put(
            "store",
            br#"[{"id": "a", "text": "t", "embedding": [1]},
                {"id": "b", "text": "t", "embedding": [1], "metadata": {"chunkIndex": -1}},
                {"id": "c", "text": "t", "embedding": [1]}]"#,
        )
        .unwrap();
        let adapter = PersistenceAdapter::new(kv, "store");
        let mut store = VectorStore::new();
        let hydrated = adapter.hydrate(&mut store);
        assert!(hydrated.fault.is_none());
        assert_eq!(hydrated.malformed, 1);
        let ids: Vec<_> = store.records().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["a", "c"]);
    }
}
