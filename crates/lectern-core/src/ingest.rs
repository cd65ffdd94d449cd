//! Ingest pipeline: document → chunks → embeddings → store.
//!
//! Documents are embedded concurrently, up to a fixed number at a time; chunks of
//! one document are embedded one after another. Upserts into the shared store
//! happen afterwards under a single write lock.

use futures::stream::{self, StreamExt};
use tracing::{info, warn};

use crate::chunks::{chunk_document, DEFAULT_MAX_CHARS};
use crate::config::Config;
use crate::model::{EmbedError, Embedder};
use crate::reader::Document;
use crate::record::{ChunkRecord, Metadata};
use crate::store::{BatchReport, SharedStore};

/// Metadata key holding the page count of the originating document.
pub const PAGE_COUNT: &str = "pageCount";

const DEFAULT_CONCURRENCY: usize = 4;

/// A chunk that could not be embedded and was left out.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkFailure {
    pub id: String,
    pub error: EmbedError,
}

#[derive(Debug, Clone)]
pub struct EmbeddedDocument {
    pub name: String,
    pub records: Vec<ChunkRecord>,
    pub failures: Vec<ChunkFailure>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSummary {
    pub name: String,
    pub embedded: usize,
    pub failures: Vec<ChunkFailure>,
}

/// Result of [`Ingestor::reembed`].
#[derive(Debug, Default)]
pub struct Reembedded {
    pub restored: Vec<ChunkRecord>,
    /// Records still without embeddings, in input order.
    pub pending: Vec<ChunkRecord>,
    pub failures: Vec<ChunkFailure>,
}

#[derive(Debug, Default)]
pub struct IngestReport {
    pub documents: Vec<DocumentSummary>,
    pub upsert: BatchReport,
}

/// Id of chunk `index` of the document called `name`.
pub fn chunk_id(name: &str, index: usize) -> String {
    format!("{name}#{index}")
}

pub struct Ingestor<E> {
    embedder: E,
    max_chunk_chars: usize,
    concurrency: usize,
}

impl<E: Embedder> Ingestor<E> {
    pub fn new(embedder: E) -> Self {
        Self {
            embedder,
            max_chunk_chars: DEFAULT_MAX_CHARS,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn from_config(embedder: E, config: &Config) -> Self {
        Self::new(embedder)
            .with_max_chunk_chars(config.max_chunk_chars)
            .with_concurrency(config.embed_concurrency)
    }

    pub fn with_max_chunk_chars(mut self, max_chars: usize) -> Self {
        self.max_chunk_chars = max_chars;
        self
    }

    /// How many documents are embedded at once. Clamped to at least 1.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Chunks and embeds one document. Chunks whose embedding fails are reported and skipped.
    pub async fn embed_document(&self, doc: &Document) -> EmbeddedDocument {
        let chunks = chunk_document(doc, self.max_chunk_chars);
        let mut records = Vec::with_capacity(chunks.len());
        let mut failures = Vec::new();

        for chunk in chunks {
            let id = chunk_id(&doc.name, chunk.index);
            let embedding = match self.embedder.embed(&chunk.text).await {
                Ok(e) => e,
                Err(error) => {
                    warn!("no embedding for {}: {}", id, error);
                    failures.push(ChunkFailure { id, error });
                    continue;
                }
            };
            let mut metadata = Metadata {
                source_file: Some(doc.name.clone()),
                word_count: Some(chunk.word_count as u64),
                chunk_index: Some(chunk.index as u64),
                ..Metadata::default()
            };
            for (key, value) in &doc.metadata {
                metadata.insert_extra(key.clone(), value.clone());
            }
            metadata.insert_extra(PAGE_COUNT, doc.page_count as u64);
            records.push(ChunkRecord::new(id, chunk.text, embedding).with_metadata(metadata));
        }

        info!(
            "{}: embedded {} chunk(s), {} failed",
            doc.name,
            records.len(),
            failures.len()
        );
        EmbeddedDocument {
            name: doc.name.clone(),
            records,
            failures,
        }
    }

    /// Embeds `docs` with bounded concurrency, then upserts everything into `store`
    /// in document order.
    pub async fn ingest(&self, docs: &[Document], store: &SharedStore) -> IngestReport {
        let embedded: Vec<EmbeddedDocument> = stream::iter(docs)
            .map(|doc| self.embed_document(doc))
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut report = IngestReport::default();
        let mut guard = store.write().await;
        for doc in embedded {
            let batch = guard.upsert_batch(doc.records);
            report.upsert.inserted += batch.inserted;
            report.upsert.replaced += batch.replaced;
            report.upsert.rejected.extend(batch.rejected);
            report.documents.push(DocumentSummary {
                name: doc.name,
                embedded: batch.inserted + batch.replaced,
                failures: doc.failures,
            });
        }
        report
    }

    /// Restores embeddings for records that lost them (e.g. loaded from a reduced
    /// payload). Records that still cannot be embedded are handed back unchanged in
    /// `pending` so the caller can keep them.
    pub async fn reembed(&self, records: Vec<ChunkRecord>) -> Reembedded {
        let results: Vec<Result<ChunkRecord, (ChunkRecord, EmbedError)>> = stream::iter(records)
            .map(|mut record| async move {
                match self.embedder.embed(&record.text).await {
                    Ok(embedding) => {
                        record.embedding = embedding;
                        Ok(record)
                    }
                    Err(error) => Err((record, error)),
                }
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut out = Reembedded::default();
        for result in results {
            match result {
                Ok(record) => out.restored.push(record),
                Err((record, error)) => {
                    warn!("could not re-embed {}: {}", record.id, error);
                    out.failures.push(ChunkFailure {
                        id: record.id.clone(),
                        error,
                    });
                    out.pending.push(record);
                }
            }
        }
        out
    }
}
