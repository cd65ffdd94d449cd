//! All backend logic independent of how the app is run.
//!
//! Documents are read and chunked, each chunk is embedded, and the resulting
//! records live in an in-memory [`VectorStore`] that is persisted through a
//! [`PersistenceAdapter`]. Queries are answered by ranking records by cosine
//! similarity and handing the best ones to a chat model as context.

pub mod app_data;
pub mod chunks;
pub mod config;
pub mod ingest;
pub mod kv;
pub mod merge;
pub mod model;
pub mod ollama;
pub mod persistence;
pub mod reader;
pub mod record;
pub mod retrieval;
pub mod similarity;
pub mod store;

pub use app_data::{app_data_dir, store_dir};
pub use chunks::{chunk_document, Chunk, DEFAULT_MAX_CHARS};
pub use config::{load_config, save_config, Config, ConfigError, RetryConfig};
pub use ingest::{chunk_id, ChunkFailure, IngestReport, Ingestor, Reembedded};
pub use kv::{is_valid_key, FileKv, KeyValueStore, KvError, MemoryKv};
pub use merge::{merge, merge_now, merge_paths, ImportSource, MalformedImportSource, MergeReport};
pub use model::{ChatTurn, EmbedError, Embedder, GenerateError, Generator, RetryPolicy, Role};
pub use ollama::{OllamaClient, OllamaError};
pub use persistence::{LoadSource, Loaded, PersistenceAdapter, PersistenceError, SaveOutcome};
pub use reader::{scan_documents, Document, DocumentReader, PlainTextReader, ReadError};
pub use record::{ChunkRecord, Metadata, MetadataFilter, MetadataValue, ValidationError};
pub use retrieval::{context_prompt, Answer, Conversation, RetrievalError, RetrievedChunk, Retriever};
pub use similarity::{cosine_similarity, rank_by_query, try_cosine_similarity, Scored, DEFAULT_TOP_K};
pub use store::{BatchReport, SharedStore, StoreStats, UpsertOutcome, VectorStore};

/// Returns a short status string. Used to verify the backend is wired up.
pub fn status() -> &'static str {
    "lectern-core ready"
}
