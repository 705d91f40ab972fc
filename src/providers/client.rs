use crate::errors::{ToolforgeError, ToolforgeResult};
use crate::keys::{retry_backoff, KeyPool};
use crate::providers::base::{ChunkReceiver, LlmProvider, ModelInfo};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Provider access wrapped with the key pool's rotation and retry policy.
///
/// Every call acquires a credential (paced by the pool), and overload-class
/// failures cool that credential down and rotate to the next one with
/// exponential backoff, up to two passes over the pool.
pub struct LlmClient {
    pool: Arc<KeyPool>,
    provider: Arc<dyn LlmProvider>,
    post_success_cooldown: Duration,
}

impl LlmClient {
    pub fn new(
        pool: Arc<KeyPool>,
        provider: Arc<dyn LlmProvider>,
        post_success_cooldown: Duration,
    ) -> Self {
        Self {
            pool,
            provider,
            post_success_cooldown,
        }
    }

    pub fn model(&self) -> &str {
        self.provider.model()
    }

    pub fn key_count(&self) -> usize {
        self.pool.len()
    }

    pub async fn generate(&self, prompt: &str) -> ToolforgeResult<String> {
        self.call_with_rotation(|credential| {
            let provider = self.provider.clone();
            let prompt = prompt.to_string();
            async move { provider.generate(&credential, &prompt).await }
        })
        .await
    }

    pub async fn generate_stream(&self, prompt: &str) -> ToolforgeResult<ChunkReceiver> {
        self.call_with_rotation(|credential| {
            let provider = self.provider.clone();
            let prompt = prompt.to_string();
            async move { provider.generate_stream(&credential, &prompt).await }
        })
        .await
    }

    pub async fn list_models(&self) -> ToolforgeResult<Vec<ModelInfo>> {
        self.call_with_rotation(|credential| {
            let provider = self.provider.clone();
            async move { provider.list_models(&credential).await }
        })
        .await
    }

    async fn call_with_rotation<T, F, Fut>(&self, mut call: F) -> ToolforgeResult<T>
    where
        F: FnMut(String) -> Fut,
        Fut: std::future::Future<Output = ToolforgeResult<T>>,
    {
        let max_attempts = self.pool.max_attempts();
        let mut last_err: Option<ToolforgeError> = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = retry_backoff(attempt - 1);
                info!("retrying LLM call in {:?} (attempt {attempt}/{max_attempts})", delay);
                tokio::time::sleep(delay).await;
            }

            let lease = self.pool.acquire().await;
            match call(lease.credential.clone()).await {
                Ok(value) => {
                    self.pool.note_success(lease.ordinal).await;
                    if !self.post_success_cooldown.is_zero() {
                        tokio::time::sleep(self.post_success_cooldown).await;
                    }
                    return Ok(value);
                }
                Err(err @ ToolforgeError::LlmTransient(_)) => {
                    warn!(
                        "credential {}/{} overloaded: {err}",
                        lease.ordinal,
                        self.pool.len()
                    );
                    self.pool.note_overloaded(lease.ordinal).await;
                    last_err = Some(err);
                }
                Err(other) => return Err(other),
            }
        }

        Err(ToolforgeError::LlmTransient(format!(
            "all {} API keys overloaded after {} attempts ({})",
            self.pool.len(),
            max_attempts,
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no error recorded".to_string())
        )))
    }
}
