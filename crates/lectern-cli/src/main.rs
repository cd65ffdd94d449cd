//! CLI entry point for the Lectern backend.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lectern_core::config::config_path;
use lectern_core::persistence::export_to_path;
use lectern_core::record::SOURCE_FILE;
use lectern_core::{
    app_data_dir, load_config, merge_paths, save_config, scan_documents, status, store_dir, Answer,
    ChunkRecord, Config, Conversation, DocumentReader, Embedder, FileKv, Ingestor, KeyValueStore,
    MetadataFilter, MetadataValue, OllamaClient, PersistenceAdapter, PlainTextReader, Retriever,
    SaveOutcome, SharedStore, StoreStats, VectorStore,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lectern")]
#[command(about = "Lectern: a local document vector store with retrieval-augmented answers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show backend status and how many records are stored.
    Status,
    /// Show where Lectern stores its config and vector store.
    DataDir,
    /// Show or change settings.
    Config {
        /// Print the current configuration as TOML.
        #[arg(long)]
        show: bool,
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
    /// Read, chunk, and embed documents into the store.
    Ingest {
        /// Files or directories to ingest.
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,
    },
    /// Merge exported stores into one collection that replaces the current store.
    Merge {
        /// JSON exports, each an array of records.
        #[arg(value_name = "FILE", required = true)]
        files: Vec<PathBuf>,
        /// Also write the merged collection to this file.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Show the chunks most similar to a query.
    Query {
        text: String,
        #[arg(long)]
        top_k: Option<usize>,
    },
    /// Answer a question from the stored documents.
    Ask {
        question: String,
        #[arg(long)]
        top_k: Option<usize>,
    },
    /// Ask questions interactively, keeping earlier turns as context.
    Chat {
        #[arg(long)]
        top_k: Option<usize>,
    },
    /// List stored chunks.
    List {
        /// Only chunks from this source file.
        #[arg(long)]
        source: Option<String>,
    },
    /// Show store statistics.
    Stats,
    /// Remove one chunk by id.
    Remove { id: String },
    /// Write every record to a JSON file, including records awaiting embeddings.
    Export { file: PathBuf },
    /// Remove every record from the store.
    Clear,
    /// Delete the persisted store, including any reduced copy.
    Wipe,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Set one setting, e.g. `lectern config set top_k 5`.
    Set { key: String, value: String },
}

/// Loaded config, the hydrated store, and records still waiting for embeddings.
struct App<K> {
    config: Config,
    persistence: PersistenceAdapter<K>,
    store: SharedStore,
    /// Records loaded from a reduced payload that have no embeddings yet. Saving is
    /// refused while any remain, so the stored reduced copy keeps them.
    unembedded: Vec<ChunkRecord>,
}

impl App<FileKv> {
    fn open(config: Config) -> Result<Self> {
        let persistence = open_persistence(&config)?;
        Ok(Self::load(config, persistence))
    }
}

impl<K: KeyValueStore> App<K> {
    /// Hydrates the store without contacting the embedding service.
    fn load(config: Config, persistence: PersistenceAdapter<K>) -> Self {
        let mut store = VectorStore::new();
        let hydrated = persistence.hydrate(&mut store);
        if let Some(fault) = &hydrated.fault {
            eprintln!("Warning: stored data could not be read and was ignored: {}", fault);
        }
        if hydrated.malformed > 0 {
            warn!("{} stored element(s) were not records and were dropped", hydrated.malformed);
        }
        if !hydrated.report.rejected.is_empty() {
            warn!("{} stored record(s) were invalid and dropped", hydrated.report.rejected.len());
        }
        Self {
            config,
            persistence,
            store: SharedStore::new(store),
            unembedded: hydrated.pending_reembed,
        }
    }

    /// Re-embeds records loaded without embeddings and moves the restored ones into
    /// the store. Records that still fail stay in `unembedded`. Returns how many
    /// were restored.
    async fn restore_embeddings<E: Embedder>(&mut self, embedder: E) -> usize {
        if self.unembedded.is_empty() {
            return 0;
        }
        eprintln!(
            "Restoring embeddings for {} record(s) saved without them...",
            self.unembedded.len()
        );
        let pending = std::mem::take(&mut self.unembedded);
        let out = Ingestor::from_config(embedder, &self.config).reembed(pending).await;
        if !out.pending.is_empty() {
            eprintln!(
                "Warning: {} record(s) could not be re-embedded; they are kept and retried next time.",
                out.pending.len()
            );
        }
        self.unembedded = out.pending;
        let restored = out.restored.len();
        self.store.upsert_batch(out.restored).await;
        restored
    }

    /// Restores embeddings before a read that needs vectors, saving the result once
    /// nothing is left pending.
    async fn restore_and_persist<E: Embedder>(&mut self, embedder: E) -> Result<()> {
        if self.restore_embeddings(embedder).await > 0 && self.unembedded.is_empty() {
            print_save(self.flush().await?);
        }
        Ok(())
    }

    fn ensure_saveable(&self) -> Result<()> {
        if !self.unembedded.is_empty() {
            bail!(
                "{} record(s) still have no embeddings; nothing was saved, so the stored copy keeps them. \
                 Retry once the embedding service is reachable.",
                self.unembedded.len()
            );
        }
        Ok(())
    }

    /// Saves the store if it changed. Refused while records lack embeddings, since a
    /// save would drop them.
    async fn flush(&mut self) -> Result<Option<SaveOutcome>> {
        self.ensure_saveable()?;
        let mut guard = self.store.write().await;
        Ok(self.persistence.flush(&mut guard)?)
    }

    /// Removes `id` from the store or from the records awaiting embeddings.
    async fn remove(&mut self, id: &str) -> bool {
        let mut store = self.store.write().await;
        if store.remove(id).is_some() {
            return true;
        }
        match self.unembedded.iter().position(|r| r.id == id) {
            Some(pos) => {
                self.unembedded.remove(pos);
                store.mark_dirty();
                true
            }
            None => false,
        }
    }

    /// Drops every record, embedded or not.
    async fn clear(&mut self) -> usize {
        let mut store = self.store.write().await;
        let pending = self.unembedded.len();
        self.unembedded.clear();
        if pending > 0 {
            store.mark_dirty();
        }
        store.clear() + pending
    }

    /// Every loaded record, those awaiting embeddings last.
    async fn records(&self, filter: Option<&MetadataFilter>) -> Vec<ChunkRecord> {
        let store = self.store.read().await;
        let pending = self
            .unembedded
            .iter()
            .filter(|r| filter.map_or(true, |f| r.metadata.matches(f)));
        store.all(filter).into_iter().chain(pending).cloned().collect()
    }
}

fn open_persistence(config: &Config) -> Result<PersistenceAdapter<FileKv>> {
    let dir = store_dir().context("could not determine app data directory")?;
    let kv = FileKv::open(&dir)?.with_quota(config.storage_quota_bytes);
    Ok(PersistenceAdapter::new(kv, config.store_key.clone()))
}

fn print_save(outcome: Option<SaveOutcome>) {
    match outcome {
        None => println!("Nothing changed."),
        Some(SaveOutcome::Full { records, bytes }) => {
            println!("Saved {} record(s) ({} bytes).", records, bytes)
        }
        Some(SaveOutcome::Degraded { records, bytes, cause }) => println!(
            "Saved {} record(s) WITHOUT embeddings ({} bytes) because the full store did not fit: {}. \
             Embeddings are restored the next time a command needs them.",
            records, bytes, cause
        ),
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    let line = text.lines().next().unwrap_or("").trim();
    match line.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}...", &line[..end]),
        None => line.to_string(),
    }
}

fn read_documents(paths: &[PathBuf]) -> Vec<lectern_core::Document> {
    let reader = PlainTextReader;
    let mut docs = Vec::new();
    for root in paths {
        let files = match scan_documents(root) {
            Ok(files) => files,
            Err(e) => {
                eprintln!("Skipping {}: {}", root.display(), e);
                continue;
            }
        };
        for file in files {
            match reader.read(&file) {
                Ok(doc) => docs.push(doc),
                Err(e) => eprintln!("Skipping {}: {}", file.display(), e),
            }
        }
    }
    docs
}

fn run_config(show: bool, action: Option<ConfigAction>) -> Result<()> {
    let mut config = load_config();
    if let Some(ConfigAction::Set { key, value }) = action {
        config.set(&key, &value)?;
        save_config(&config)?;
        println!("Set {} = {}", key, value);
        return Ok(());
    }
    if show {
        print!("{}", toml::to_string_pretty(&config)?);
    } else {
        match config_path() {
            Some(p) => println!("{}", p.display()),
            None => bail!("could not determine app data directory"),
        }
    }
    Ok(())
}

fn source_filter(source: Option<String>) -> Option<MetadataFilter> {
    source.map(|s| MetadataFilter::from([(SOURCE_FILE.to_string(), MetadataValue::from(s))]))
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("could not create {}", parent.display()))?;
    }
    Ok(())
}

fn print_answer(answer: &Answer) {
    println!("{}", answer.text);
    if !answer.sources.is_empty() {
        println!();
        println!("Sources:");
        for s in &answer.sources {
            println!("  [{}] {:.3}", s.source, s.similarity_score);
        }
    }
}

async fn run_chat(top_k: Option<usize>) -> Result<()> {
    let mut app = App::open(load_config())?;
    let client = OllamaClient::from_config(&app.config)?;
    app.restore_and_persist(&client).await?;
    let retriever = Retriever::new(&client, app.store.clone()).with_top_k(app.config.top_k);
    let mut chat = Conversation::new();

    println!("Ask about your documents. An empty line or /exit quits, /reset forgets the conversation.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        match line.trim() {
            "" | "/exit" => break,
            "/reset" => {
                chat.clear();
                println!("Conversation cleared.");
            }
            question => match chat.ask(&retriever, &client, question, top_k).await {
                Ok(answer) => {
                    print_answer(&answer);
                    println!();
                }
                Err(e) => eprintln!("Error: {}", e),
            },
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Status) {
        Commands::Status => {
            println!("Lectern backend");
            println!("  core: {}", status());
            let app = App::open(load_config())?;
            println!("  records: {}", app.store.read().await.len());
            if !app.unembedded.is_empty() {
                println!("  awaiting embeddings: {}", app.unembedded.len());
            }
        }
        Commands::DataDir => match app_data_dir() {
            Some(p) => println!("{}", p.display()),
            None => bail!("could not determine app data directory"),
        },
        Commands::Config { show, action } => run_config(show, action)?,
        Commands::Ingest { paths } => {
            let mut app = App::open(load_config())?;
            let client = OllamaClient::from_config(&app.config)?;
            app.restore_embeddings(&client).await;
            app.ensure_saveable()?;
            let docs = read_documents(&paths);
            if docs.is_empty() {
                println!("No documents found.");
                print_save(app.flush().await?);
                return Ok(());
            }
            let report = Ingestor::from_config(&client, &app.config)
                .ingest(&docs, &app.store)
                .await;
            for doc in &report.documents {
                println!("  {}: {} chunk(s), {} failed", doc.name, doc.embedded, doc.failures.len());
            }
            println!(
                "Ingested {} document(s): {} new, {} replaced, {} rejected.",
                report.documents.len(),
                report.upsert.inserted,
                report.upsert.replaced,
                report.upsert.rejected.len()
            );
            print_save(app.flush().await?);
        }
        Commands::Merge { files, output } => {
            let mut app = App::open(load_config())?;
            let report = merge_paths(&files, chrono::Utc::now());
            for skipped in &report.skipped {
                eprintln!("{}", skipped);
            }
            for source in &report.sources {
                println!(
                    "  {}: {} record(s), {} invalid",
                    source.name,
                    source.accepted,
                    source.rejected.len()
                );
            }
            if let Some(path) = &output {
                ensure_parent(path)?;
                export_to_path(&report.records, path)?;
                println!("Wrote merged collection to {}", path.display());
            }
            println!(
                "Merged {} record(s) ({} duplicate(s) replaced).",
                report.records.len(),
                report.duplicates
            );
            // the merged collection replaces everything, pending records included
            app.clear().await;
            app.store.upsert_batch(report.records).await;
            print_save(app.flush().await?);
        }
        Commands::Query { text, top_k } => {
            let mut app = App::open(load_config())?;
            let client = OllamaClient::from_config(&app.config)?;
            app.restore_and_persist(&client).await?;
            let results = Retriever::new(&client, app.store.clone())
                .with_top_k(app.config.top_k)
                .retrieve(&text, top_k)
                .await?;
            if results.is_empty() {
                println!("No matching chunks.");
            }
            for (i, r) in results.iter().enumerate() {
                println!("{}. [{}] {:.3}  {}", i + 1, r.source, r.similarity_score, preview(&r.text, 80));
            }
        }
        Commands::Ask { question, top_k } => {
            let mut app = App::open(load_config())?;
            let client = OllamaClient::from_config(&app.config)?;
            app.restore_and_persist(&client).await?;
            let answer = Retriever::new(&client, app.store.clone())
                .with_top_k(app.config.top_k)
                .answer(&client, &[], &question, top_k)
                .await?;
            print_answer(&answer);
        }
        Commands::Chat { top_k } => run_chat(top_k).await?,
        Commands::List { source } => {
            let app = App::open(load_config())?;
            let filter = source_filter(source);
            let records = app.records(filter.as_ref()).await;
            println!("{} record(s)", records.len());
            for r in &records {
                let marker = if r.embedding.is_empty() { "  (no embedding)" } else { "" };
                println!("  {}  {}{}", r.id, preview(&r.text, 60), marker);
            }
        }
        Commands::Stats => {
            let app = App::open(load_config())?;
            let records = app.records(None).await;
            let stats = StoreStats::over(&records, &app.config.stats_field);
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Remove { id } => {
            let mut app = App::open(load_config())?;
            let client = OllamaClient::from_config(&app.config)?;
            app.restore_embeddings(&client).await;
            app.ensure_saveable()?;
            if !app.remove(&id).await {
                bail!("no record with id {}", id);
            }
            println!("Removed {}", id);
            print_save(app.flush().await?);
        }
        Commands::Export { file } => {
            let app = App::open(load_config())?;
            ensure_parent(&file)?;
            let records = app.records(None).await;
            export_to_path(&records, &file)?;
            println!("Exported {} record(s) to {}", records.len(), file.display());
        }
        Commands::Clear => {
            let mut app = App::open(load_config())?;
            let removed = app.clear().await;
            println!("Removed {} record(s).", removed);
            print_save(app.flush().await?);
        }
        Commands::Wipe => {
            open_persistence(&load_config())?.wipe()?;
            println!("Deleted the persisted store.");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use lectern_core::{EmbedError, LoadSource, MemoryKv};

    use super::*;

    /// Embeds everything except text mentioning "offline".
    struct PartialEmbedder;

    #[async_trait]
    impl Embedder for PartialEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
            if text.contains("offline") {
                return Err(EmbedError::EmptyVector);
            }
            Ok(vec![1.0, 0.0])
        }
    }

    /// An app whose store was last saved without embeddings.
    fn app_with_reduced_payload() -> App<MemoryKv> {
        let mut kv = MemoryKv::new();
        let payload = r#"[
            {"id": "r0", "text": "first chunk", "metadata": {"sourceFile": "a.txt", "wordCount": 2}},
            {"id": "r1", "text": "offline chunk", "metadata": {"sourceFile": "b.txt", "wordCount": 2}},
            {"id": "r2", "text": "third chunk", "metadata": {"sourceFile": "a.txt", "wordCount": 2}}
        ]"#;
        kv.put("store_reduced", payload.as_bytes()).unwrap();
        App::load(Config::default(), PersistenceAdapter::new(kv, "store"))
    }

    #[test]
    fn query_parses_top_k() {
        let cli = Cli::try_parse_from(["lectern", "query", "tax rules", "--top-k", "5"]).unwrap();
        match cli.command {
            Some(Commands::Query { text, top_k }) => {
                assert_eq!(text, "tax rules");
                assert_eq!(top_k, Some(5));
            }
            _ => panic!("expected query"),
        }
    }

    #[test]
    fn merge_requires_files() {
        assert!(Cli::try_parse_from(["lectern", "merge"]).is_err());
        let cli = Cli::try_parse_from(["lectern", "merge", "a.json", "b.json", "--output", "out.json"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Merge { files, output: Some(_) }) if files.len() == 2
        ));
    }

    #[test]
    fn config_set_parses() {
        let cli = Cli::try_parse_from(["lectern", "config", "set", "top_k", "7"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Config { action: Some(ConfigAction::Set { .. }), .. })
        ));
    }

    #[test]
    fn preview_cuts_on_char_boundary() {
        assert_eq!(preview("ééééé\nsecond", 3), "ééé...");
        assert_eq!(preview("short", 10), "short");
    }

    #[test]
    fn wipe_and_clear_take_no_arguments() {
        assert!(Cli::try_parse_from(["lectern", "wipe"]).is_ok());
        assert!(Cli::try_parse_from(["lectern", "clear", "extra"]).is_err());
    }

    #[test]
    fn chat_parses() {
        let cli = Cli::try_parse_from(["lectern", "chat", "--top-k", "2"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Chat { top_k: Some(2) })));
    }

    #[tokio::test]
    async fn loading_does_not_reembed() {
        let app = app_with_reduced_payload();
        assert!(app.store.read().await.is_empty());
        assert_eq!(app.unembedded.len(), 3);
    }

    #[tokio::test]
    async fn records_that_fail_reembedding_are_never_saved_away() {
        let mut app = app_with_reduced_payload();
        assert_eq!(app.restore_embeddings(&PartialEmbedder).await, 2);
        assert_eq!(app.unembedded.len(), 1);
        assert!(app.remove("r0").await);

        let err = app.flush().await.unwrap_err();
        assert!(err.to_string().contains("1 record(s) still have no embeddings"));

        let loaded = app.persistence.load();
        assert_eq!(loaded.source, LoadSource::Reduced);
        let ids: Vec<_> = loaded.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["r0", "r1", "r2"]);
    }

    #[tokio::test]
    async fn fully_restored_store_is_saved_with_embeddings() {
        let mut app = app_with_reduced_payload();
        assert!(app.remove("r1").await);
        app.restore_and_persist(&PartialEmbedder).await.unwrap();
        assert!(app.unembedded.is_empty());

        let loaded = app.persistence.load();
        assert_eq!(loaded.source, LoadSource::Full);
        assert_eq!(loaded.records.len(), 2);
        assert!(loaded.records.iter().all(|r| r.embedding == vec![1.0, 0.0]));
        assert!(!app.persistence.kv().contains("store_reduced"));
    }

    #[tokio::test]
    async fn listing_and_stats_include_records_awaiting_embeddings() {
        let mut app = app_with_reduced_payload();
        app.restore_embeddings(&PartialEmbedder).await;

        let all = app.records(None).await;
        let ids: Vec<_> = all.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["r0", "r2", "r1"]);
        assert_eq!(StoreStats::over(&all, "wordCount").total_documents, 3);

        let filter = source_filter(Some("b.txt".into()));
        let from_b = app.records(filter.as_ref()).await;
        assert_eq!(from_b.len(), 1);
        assert!(from_b[0].embedding.is_empty());
    }

    #[tokio::test]
    async fn clearing_drops_records_awaiting_embeddings() {
        let mut app = app_with_reduced_payload();
        assert_eq!(app.clear().await, 3);
        assert!(matches!(app.flush().await.unwrap(), Some(SaveOutcome::Full { records: 0, .. })));
        assert!(!app.persistence.kv().contains("store_reduced"));
        assert_eq!(app.persistence.load().records.len(), 0);
    }
}
