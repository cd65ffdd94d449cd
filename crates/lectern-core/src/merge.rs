//! Merging exported stores (one JSON array of records per file) into one collection.
//!
//! Every record is stamped with the file it came from and the import time, then
//! records are deduplicated by id with the last one winning. A duplicate keeps the
//! position of the first occurrence, the same as an upsert into a [`VectorStore`].
//! Ids are not namespaced by file, so `chunk-0` from two files collides.
//!
//! [`VectorStore`]: crate::store::VectorStore

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{info, warn};

use crate::record::{ChunkRecord, ValidationError};

/// One serialized store to merge, named after the file it came from.
#[derive(Debug, Clone)]
pub struct ImportSource {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl ImportSource {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }

    /// Reads a file; the source is named after the file name.
    pub fn from_path(path: &Path) -> Result<Self, MalformedImportSource> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        match std::fs::read(path) {
            Ok(bytes) => Ok(Self { name, bytes }),
            Err(e) => Err(MalformedImportSource {
                name,
                reason: MalformedReason::Unreadable(e),
            }),
        }
    }
}

/// How one accepted source contributed to the merge.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSummary {
    pub name: String,
    pub accepted: usize,
    /// Records dropped from this source for failing validation.
    pub rejected: Vec<ValidationError>,
}

#[derive(Debug, Default)]
pub struct MergeReport {
    /// Deduplicated records, ready to upsert into a store.
    pub records: Vec<ChunkRecord>,
    pub sources: Vec<SourceSummary>,
    pub skipped: Vec<MalformedImportSource>,
    /// Records that replaced an earlier record with the same id.
    pub duplicates: usize,
}

/// Merges `sources` in order, stamping `sourceFile` and `importedAt` on every record.
/// The stamp overrides any provenance the record already carried.
pub fn merge(sources: impl IntoIterator<Item = ImportSource>, imported_at: DateTime<Utc>) -> MergeReport {
    let stamp = imported_at.to_rfc3339_opts(SecondsFormat::Millis, true);
    let mut report = MergeReport::default();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for source in sources {
        let (records, rejected) = match parse_source(&source.bytes) {
            Ok(parsed) => parsed,
            Err(reason) => {
                let skipped = MalformedImportSource {
                    name: source.name,
                    reason,
                };
                warn!("{}", skipped);
                report.skipped.push(skipped);
                continue;
            }
        };
        if !rejected.is_empty() {
            warn!("{}: dropped {} invalid record(s)", source.name, rejected.len());
        }
        report.sources.push(SourceSummary {
            name: source.name.clone(),
            accepted: records.len(),
            rejected,
        });

        for mut record in records {
            record.metadata.source_file = Some(source.name.clone());
            record.metadata.imported_at = Some(stamp.clone());
            match positions.get(&record.id) {
                Some(&pos) => {
                    report.records[pos] = record;
                    report.duplicates += 1;
                }
                None => {
                    positions.insert(record.id.clone(), report.records.len());
                    report.records.push(record);
                }
            }
        }
    }

    info!(
        "merged {} record(s) from {} source(s); {} duplicate(s), {} source(s) skipped",
        report.records.len(),
        report.sources.len(),
        report.duplicates,
        report.skipped.len()
    );
    report
}

/// [`merge`] stamped with the current time.
pub fn merge_now(sources: impl IntoIterator<Item = ImportSource>) -> MergeReport {
    merge(sources, Utc::now())
}

/// Reads and merges files. Unreadable files are reported like malformed ones.
pub fn merge_paths<P: AsRef<Path>>(paths: &[P], imported_at: DateTime<Utc>) -> MergeReport {
    let mut sources = Vec::with_capacity(paths.len());
    let mut unreadable = Vec::new();
    for path in paths {
        match ImportSource::from_path(path.as_ref()) {
            Ok(source) => sources.push(source),
            Err(e) => {
                warn!("{}", e);
                unreadable.push(e);
            }
        }
    }
    let mut report = merge(sources, imported_at);
    report.skipped.extend(unreadable);
    report
}

/// Parses one export. Individually invalid records are returned separately; the
/// whole source is refused when its shape is wrong or nothing in it is valid.
fn parse_source(bytes: &[u8]) -> Result<(Vec<ChunkRecord>, Vec<ValidationError>), MalformedReason> {
    let value: serde_json::Value = serde_json::from_slice(bytes).map_err(MalformedReason::InvalidJson)?;
    let serde_json::Value::Array(items) = value else {
        return Err(MalformedReason::NotAnArray);
    };
    let total = items.len();
    let mut records = Vec::with_capacity(total);
    let mut rejected = Vec::new();
    for (index, item) in items.into_iter().enumerate() {
        let record: ChunkRecord =
            serde_json::from_value(item).map_err(|error| MalformedReason::BadElement { index, error })?;
        match record.validate() {
            Ok(()) => records.push(record),
            Err(e) => rejected.push(e),
        }
    }
    if total > 0 && records.is_empty() {
        return Err(MalformedReason::NoValidRecords(total));
    }
    Ok((records, rejected))
}

#[derive(Debug, thiserror::Error)]
#[error("skipped import source {name}: {reason}")]
pub struct MalformedImportSource {
    pub name: String,
    pub reason: MalformedReason,
}

#[derive(Debug, thiserror::Error)]
pub enum MalformedReason {
    #[error("could not read file: {0}")]
    Unreadable(std::io::Error),
    #[error("not valid JSON: {0}")]
    InvalidJson(serde_json::Error),
    #[error("expected a JSON array of records")]
    NotAnArray,
    #[error("element {index} is not a record: {error}")]
    BadElement { index: usize, error: serde_json::Error },
    #[error("none of its {0} record(s) is valid")]
    NoValidRecords(usize),
}
