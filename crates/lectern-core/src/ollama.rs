//! Ollama client for embeddings and chat completion. Wraps ollama-rs with a simple API
//! and applies a [`RetryPolicy`] around every request.

use async_trait::async_trait;
use ollama_rs::generation::chat::request::ChatMessageRequest;
use ollama_rs::generation::chat::ChatMessage;
use ollama_rs::generation::embeddings::request::{EmbeddingsInput, GenerateEmbeddingsRequest};
use ollama_rs::Ollama;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::model::{
    check_embedding, truncate_chars, ChatTurn, EmbedError, Embedder, GenerateError, Generator,
    RetryPolicy, Role,
};

pub const DEFAULT_EMBED_MODEL: &str = "nomic-embed-text";
pub const DEFAULT_CHAT_MODEL: &str = "llama3.2";
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
/// Text sent for embedding is cut to this many characters.
pub const DEFAULT_MAX_EMBED_CHARS: usize = 2048;

/// Thin wrapper around Ollama for embedding and completion.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    inner: Ollama,
    embed_model: String,
    chat_model: String,
    max_embed_chars: usize,
    retry: RetryPolicy,
}

impl OllamaClient {
    /// Create from URL string. Default: http://localhost:11434.
    pub fn from_url(url: &str) -> Result<Self, OllamaError> {
        let inner = Ollama::try_new(url).map_err(OllamaError::ParseUrl)?;
        Ok(Self {
            inner,
            embed_model: DEFAULT_EMBED_MODEL.to_string(),
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            max_embed_chars: DEFAULT_MAX_EMBED_CHARS,
            retry: RetryPolicy::default(),
        })
    }

    /// Create from the URL, models, truncation limit, and retry settings in `config`.
    pub fn from_config(config: &Config) -> Result<Self, OllamaError> {
        Ok(Self::from_url(&config.ollama_url)?
            .with_embed_model(&config.embed_model)
            .with_chat_model(&config.chat_model)
            .with_max_embed_chars(config.max_embed_chars)
            .with_retry(config.retry.policy()))
    }

    /// Set the embedding model (e.g. `nomic-embed-text`, `all-minilm`).
    pub fn with_embed_model(mut self, model: impl Into<String>) -> Self {
        self.embed_model = model.into();
        self
    }

    /// Set the chat model used by [`Generator::complete`].
    pub fn with_chat_model(mut self, model: impl Into<String>) -> Self {
        self.chat_model = model.into();
        self
    }

    pub fn with_max_embed_chars(mut self, max_chars: usize) -> Self {
        self.max_embed_chars = max_chars;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn embed_model(&self) -> &str {
        &self.embed_model
    }

    pub fn chat_model(&self) -> &str {
        &self.chat_model
    }
}

#[async_trait]
impl Embedder for OllamaClient {
    /// Embed a single string. Returns the embedding vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let text = truncate_chars(text.trim(), self.max_embed_chars);
        if text.is_empty() {
            return Err(EmbedError::EmptyInput);
        }
        let res = self
            .retry
            .run("embed", || {
                let req = GenerateEmbeddingsRequest::new(
                    self.embed_model.clone(),
                    EmbeddingsInput::Single(text.to_string()),
                );
                self.inner.generate_embeddings(req)
            })
            .await?;
        let embedding = check_embedding(res.embeddings.into_iter().next().unwrap_or_default())?;
        debug!("embedded {} chars into {} dimensions", text.len(), embedding.len());
        Ok(embedding)
    }
}

#[async_trait]
impl Generator for OllamaClient {
    async fn complete(&self, messages: &[ChatTurn], system_prompt: &str) -> Result<String, GenerateError> {
        let mut history = Vec::with_capacity(messages.len() + 1);
        history.push(ChatMessage::system(system_prompt.to_string()));
        history.extend(messages.iter().map(|turn| match turn.role {
            Role::User => ChatMessage::user(turn.content.clone()),
            Role::Assistant => ChatMessage::assistant(turn.content.clone()),
        }));
        let res = self
            .retry
            .run("chat", || {
                let req = ChatMessageRequest::new(self.chat_model.clone(), history.clone());
                self.inner.send_chat_messages(req)
            })
            .await?;
        let reply = res.message.content.trim().to_string();
        if reply.is_empty() {
            return Err(GenerateError::EmptyReply);
        }
        Ok(reply)
    }
}

#[derive(Debug, Error)]
pub enum OllamaError {
    #[error("invalid Ollama URL: {0}")]
    ParseUrl(#[from] url::ParseError),
}
