use crate::errors::ToolforgeResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Chunks of a streamed completion, in order. The stream is finite and
/// non-restartable; the channel closing signals completion.
pub type ChunkReceiver = tokio::sync::mpsc::Receiver<ToolforgeResult<String>>;

/// A model advertised by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
}

/// A rate-limited content-generation oracle with transient failures.
///
/// Implementations classify provider errors: overload-class failures come
/// back as [`ToolforgeError::LlmTransient`](crate::errors::ToolforgeError)
/// so the caller can rotate credentials; everything else is `LlmFatal`.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate a full completion for `prompt` using `credential`.
    async fn generate(&self, credential: &str, prompt: &str) -> ToolforgeResult<String>;

    /// Generate a completion as a lazy sequence of text chunks.
    ///
    /// The default implementation degrades to a single-chunk stream backed
    /// by [`generate`](Self::generate).
    async fn generate_stream(
        &self,
        credential: &str,
        prompt: &str,
    ) -> ToolforgeResult<ChunkReceiver> {
        let text = self.generate(credential, prompt).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let _ = tx.send(Ok(text)).await;
        Ok(rx)
    }

    /// List models available to `credential`.
    async fn list_models(&self, _credential: &str) -> ToolforgeResult<Vec<ModelInfo>> {
        Ok(Vec::new())
    }

    /// Model identifier requests are issued against.
    fn model(&self) -> &str;
}
