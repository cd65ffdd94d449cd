//! Query path: embed the question, rank the store, and package the best chunks as
//! grounding context for a chat model.

use std::fmt::Write as _;

use serde::Serialize;
use tracing::{debug, info};

use crate::model::{check_embedding, ChatTurn, EmbedError, Embedder, GenerateError, Generator};
use crate::record::Metadata;
use crate::similarity::DEFAULT_TOP_K;
use crate::store::SharedStore;

/// Source reported for chunks that carry no `sourceFile`.
pub const UNKNOWN_SOURCE: &str = "Unknown";

const CONTEXT_HEADER: &str = "Here is the relevant context:";
const GROUNDED_PROMPT: &str = "You are a helpful assistant. Answer the user's question using the \
context below. If the context does not contain the answer, say so.";
const PLAIN_PROMPT: &str = "You are a helpful assistant. No document context matched this \
question; answer from general knowledge and say that no documents were found.";

/// One retrieved chunk, shaped for display and for the generation prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievedChunk {
    pub id: String,
    pub text: String,
    pub source: String,
    pub similarity_score: f64,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<RetrievedChunk>,
}

pub struct Retriever<E> {
    embedder: E,
    store: SharedStore,
    top_k: usize,
}

impl<E: Embedder> Retriever<E> {
    pub fn new(embedder: E, store: SharedStore) -> Self {
        Self {
            embedder,
            store,
            top_k: DEFAULT_TOP_K,
        }
    }

    /// Default number of results when `retrieve` is called with `None`.
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Finds the chunks most similar to `query`.
    ///
    /// An empty result means nothing in the store is comparable; a failed embedding
    /// is an error, never an empty result.
    pub async fn retrieve(&self, query: &str, top_k: Option<usize>) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        let embedding = self
            .embedder
            .embed(query)
            .await
            .and_then(check_embedding)
            .map_err(RetrievalError::EmbeddingUnavailable)?;
        let top_k = top_k.unwrap_or(self.top_k);

        let results: Vec<RetrievedChunk> = self
            .store
            .rank(&embedding, top_k)
            .await
            .into_iter()
            .map(|ranked| RetrievedChunk {
                source: ranked
                    .record
                    .source()
                    .unwrap_or(UNKNOWN_SOURCE)
                    .to_string(),
                id: ranked.record.id,
                text: ranked.record.text,
                similarity_score: ranked.score,
                metadata: ranked.record.metadata,
            })
            .collect();
        debug!("retrieved {} chunk(s) for query", results.len());
        Ok(results)
    }

    /// Retrieves context for `question` and asks `generator` to answer it, continuing
    /// the conversation in `history`.
    pub async fn answer<G: Generator + ?Sized>(
        &self,
        generator: &G,
        history: &[ChatTurn],
        question: &str,
        top_k: Option<usize>,
    ) -> Result<Answer, RetrievalError> {
        let sources = self.retrieve(question, top_k).await?;
        let system_prompt = context_prompt(&sources);
        let mut messages = history.to_vec();
        messages.push(ChatTurn::user(question));
        let text = generator
            .complete(&messages, &system_prompt)
            .await
            .map_err(RetrievalError::Generation)?;
        info!("answered with {} source chunk(s)", sources.len());
        Ok(Answer { text, sources })
    }
}

/// A multi-turn chat over the store. Each successful answer appends the question
/// and the reply to the history sent with the next question.
#[derive(Debug, Default, Clone)]
pub struct Conversation {
    history: Vec<ChatTurn>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> &[ChatTurn] {
        &self.history
    }

    /// Answers `question` in the context of the earlier turns. A failed turn leaves
    /// the history untouched.
    pub async fn ask<E: Embedder, G: Generator + ?Sized>(
        &mut self,
        retriever: &Retriever<E>,
        generator: &G,
        question: &str,
        top_k: Option<usize>,
    ) -> Result<Answer, RetrievalError> {
        let answer = retriever.answer(generator, &self.history, question, top_k).await?;
        self.history.push(ChatTurn::user(question));
        self.history.push(ChatTurn::assistant(answer.text.clone()));
        Ok(answer)
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}

/// Renders retrieved chunks as the system prompt for the generation step.
pub fn context_prompt(results: &[RetrievedChunk]) -> String {
    if results.is_empty() {
        return PLAIN_PROMPT.to_string();
    }
    let mut prompt = format!("{GROUNDED_PROMPT}\n\n{CONTEXT_HEADER}");
    for r in results {
        let _ = write!(
            prompt,
            "\n\n[{}] (Similarity: {:.3}):\n{}",
            r.source, r.similarity_score, r.text
        );
    }
    prompt
}

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("could not embed query: {0}")]
    EmbeddingUnavailable(#[source] EmbedError),
    #[error("could not generate answer: {0}")]
    Generation(#[source] GenerateError),
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::model::RetryExhausted;
    use crate::record::ChunkRecord;
    use crate::store::VectorStore;

    struct FixedEmbedder(Vec<f32>);

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbedError> {
            Ok(self.0.clone())
        }
    }

    struct DownEmbedder;

    #[async_trait]
    impl Embedder for DownEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbedError> {
            Err(EmbedError::Unavailable(RetryExhausted {
                attempts: 3,
                last_error: "quota exceeded".into(),
            }))
        }
    }

    #[derive(Default)]
    struct RecordingGenerator {
        seen: Mutex<Option<(Vec<ChatTurn>, String)>>,
    }

    #[async_trait]
    impl Generator for RecordingGenerator {
        async fn complete(&self, messages: &[ChatTurn], system_prompt: &str) -> Result<String, GenerateError> {
            *self.seen.lock().unwrap() = Some((messages.to_vec(), system_prompt.to_string()));
            Ok("forty-two".into())
        }
    }

    fn store() -> SharedStore {
        let mut a = ChunkRecord::new("a", "alpha", vec![1.0, 0.0, 0.0, 0.0]);
        a.metadata.source_file = Some("a.pdf".into());
        let (store, _) = VectorStore::from_records(vec![
            a,
            ChunkRecord::new("b", "beta", vec![0.0, 1.0, 0.0, 0.0]),
            ChunkRecord::new("c", "gamma", vec![0.9, 0.1, 0.0, 0.0]),
        ]);
        SharedStore::new(store)
    }

    #[tokio::test]
    async fn retrieve_ranks_and_defaults_source() {
        let retriever = Retriever::new(FixedEmbedder(vec![1.0, 0.0, 0.0, 0.0]), store());
        let results = retriever.retrieve("anything", Some(2)).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].text, "alpha");
        assert_eq!(results[0].source, "a.pdf");
        assert_eq!(results[1].text, "gamma");
        assert_eq!(results[1].source, UNKNOWN_SOURCE);
        assert!((results[1].similarity_score - 0.994).abs() < 1e-3);
    }

    #[tokio::test]
    async fn retrieve_uses_default_top_k() {
        let retriever = Retriever::new(FixedEmbedder(vec![1.0, 0.0, 0.0, 0.0]), store()).with_top_k(1);
        assert_eq!(retriever.retrieve("q", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn embedding_failure_is_an_error_not_empty() {
        let retriever = Retriever::new(DownEmbedder, store());
        let err = retriever.retrieve("q", None).await.unwrap_err();
        assert!(matches!(err, RetrievalError::EmbeddingUnavailable(EmbedError::Unavailable(_))));

        let empty = Retriever::new(FixedEmbedder(vec![]), store());
        assert!(matches!(
            empty.retrieve("q", None).await,
            Err(RetrievalError::EmbeddingUnavailable(EmbedError::EmptyVector))
        ));
    }

    #[tokio::test]
    async fn no_comparable_records_is_empty_success() {
        let mismatched = Retriever::new(FixedEmbedder(vec![1.0, 0.0]), store());
        assert!(mismatched.retrieve("q", None).await.unwrap().is_empty());
        let empty_store = Retriever::new(FixedEmbedder(vec![1.0]), SharedStore::default());
        assert!(empty_store.retrieve("q", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn answer_passes_context_and_history() {
        let retriever = Retriever::new(FixedEmbedder(vec![1.0, 0.0, 0.0, 0.0]), store());
        let generator = RecordingGenerator::default();
        let history = vec![ChatTurn::user("hi"), ChatTurn::assistant("hello")];
        let answer = retriever
            .answer(&generator, &history, "what is alpha?", Some(1))
            .await
            .unwrap();
        assert_eq!(answer.text, "forty-two");
        assert_eq!(answer.sources.len(), 1);

        let (messages, prompt) = generator.seen.lock().unwrap().take().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2], ChatTurn::user("what is alpha?"));
        assert!(prompt.contains("Here is the relevant context:"));
        assert!(prompt.contains("[a.pdf] (Similarity: 1.000):\nalpha"));
    }

    #[test]
    fn context_prompt_without_results_is_plain() {
        assert!(!context_prompt(&[]).contains(CONTEXT_HEADER));
    }

    #[tokio::test]
    async fn conversation_carries_history_between_turns() {
        let retriever = Retriever::new(FixedEmbedder(vec![1.0, 0.0, 0.0, 0.0]), store());
        let generator = RecordingGenerator::default();
        let mut chat = Conversation::new();

        chat.ask(&retriever, &generator, "first?", None).await.unwrap();
        chat.ask(&retriever, &generator, "second?", None).await.unwrap();

        let (messages, _) = generator.seen.lock().unwrap().take().unwrap();
        assert_eq!(
            messages,
            vec![
                ChatTurn::user("first?"),
                ChatTurn::assistant("forty-two"),
                ChatTurn::user("second?"),
            ]
        );
        assert_eq!(chat.history().len(), 4);
    }

    #[tokio::test]
    async fn failed_turn_is_not_recorded() {
        let retriever = Retriever::new(DownEmbedder, store());
        let mut chat = Conversation::new();
        assert!(chat
            .ask(&retriever, &RecordingGenerator::default(), "q", None)
            .await
            .is_err());
        assert!(chat.history().is_empty());
    }
}
