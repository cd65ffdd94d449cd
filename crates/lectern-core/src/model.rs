//! Interfaces to the external models: embedding and chat completion.
//!
//! Retries live in [`RetryPolicy`], which implementations hold and apply around
//! each remote call.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Produces an embedding vector for a piece of text.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;
}

/// Produces a reply to a conversation under a system prompt.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn complete(&self, messages: &[ChatTurn], system_prompt: &str) -> Result<String, GenerateError>;
}

#[async_trait]
impl<T: Embedder + ?Sized> Embedder for &T {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        (**self).embed(text).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Bounded retries with exponential backoff and an optional per-attempt timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_multiplier: u32,
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            backoff_multiplier: 2,
            attempt_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl RetryPolicy {
    /// One attempt, no waiting. Handy for tests and interactive use.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            backoff_multiplier: 1,
            attempt_timeout: None,
        }
    }

    /// Delay before attempt `attempt + 1`, counting attempts from 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor)
    }

    /// Runs `op` until it succeeds or the attempts run out.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, RetryExhausted>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            debug!("{} attempt {}/{}", label, attempt, attempts);
            let result = match self.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, op()).await {
                    Ok(r) => r.map_err(|e| e.to_string()),
                    Err(_) => Err(format!("timed out after {:?}", limit)),
                },
                None => op().await.map_err(|e| e.to_string()),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("{} failed on attempt {}/{}: {}", label, attempt, attempts, e);
                    last_error = e;
                }
            }
            if attempt < attempts {
                let delay = self.backoff(attempt);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
        Err(RetryExhausted {
            attempts,
            last_error,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("gave up after {attempts} attempt(s): {last_error}")]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last_error: String,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EmbedError {
    #[error("nothing to embed: input text is empty")]
    EmptyInput,
    #[error("embedding service returned an empty vector")]
    EmptyVector,
    #[error("embedding service returned non-finite values")]
    NonFinite,
    #[error("embedding service unavailable: {0}")]
    Unavailable(#[from] RetryExhausted),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GenerateError {
    #[error("generation service returned an empty reply")]
    EmptyReply,
    #[error("generation service unavailable: {0}")]
    Unavailable(#[from] RetryExhausted),
}

/// Checks a vector coming back from an embedder before it is trusted.
pub fn check_embedding(embedding: Vec<f32>) -> Result<Vec<f32>, EmbedError> {
    if embedding.is_empty() {
        return Err(EmbedError::EmptyVector);
    }
    if embedding.iter().any(|x| !x.is_finite()) {
        return Err(EmbedError::NonFinite);
    }
    Ok(embedding)
}

/// Cuts `text` to at most `max_chars` characters without splitting a character.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn quick(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            backoff_multiplier: 2,
            attempt_timeout: Some(Duration::from_millis(50)),
        }
    }

    #[test]
    fn backoff_grows_exponentially() {
        let p = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            backoff_multiplier: 3,
            ..RetryPolicy::default()
        };
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(300));
        assert_eq!(p.backoff(3), Duration::from_millis(900));
    }

    #[tokio::test]
    async fn run_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = quick(3)
            .run("test", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("flaky")
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let err = quick(2)
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("down")
            })
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 2);
        assert_eq!(err.last_error, "down");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn run_times_out_slow_attempts() {
        let err = quick(1)
            .run("test", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, String>(())
            })
            .await
            .unwrap_err();
        assert!(err.last_error.contains("timed out"));
    }

    #[test]
    fn check_embedding_rejects_degenerate_vectors() {
        assert_eq!(check_embedding(vec![]), Err(EmbedError::EmptyVector));
        assert_eq!(check_embedding(vec![f32::INFINITY]), Err(EmbedError::NonFinite));
        assert_eq!(check_embedding(vec![0.1]), Ok(vec![0.1]));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("abc", 0), "");
    }
}
