use crate::errors::{ToolforgeError, ToolforgeResult};
use crate::keys::is_transient_message;
use crate::providers::base::{ChunkReceiver, LlmProvider, ModelInfo};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

const CONNECT_TIMEOUT_SECS: u64 = 30;
const REQUEST_TIMEOUT_SECS: u64 = 120;

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiProvider {
    model: String,
    base_url: String,
    client: Client,
}

impl GeminiProvider {
    pub fn new(model: String) -> Self {
        Self::with_base_url(model, BASE_URL.to_string())
    }

    pub fn with_base_url(model: String, base_url: String) -> Self {
        Self {
            model,
            base_url,
            client: Client::builder()
                .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    fn request_payload(prompt: &str) -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": [{"text": prompt}]
            }]
        })
    }

    /// Map a non-success HTTP response to the error taxonomy.
    async fn classify_error(resp: reqwest::Response) -> ToolforgeError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| {
                v["error"]["message"]
                    .as_str()
                    .map(|s| s.to_string())
            })
            .unwrap_or(body);
        let detail = format!("{} {}", status.as_u16(), message);

        if status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::SERVICE_UNAVAILABLE
            || is_transient_message(&detail)
        {
            ToolforgeError::LlmTransient(detail)
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            ToolforgeError::LlmFatal(format!("authentication rejected: {detail}"))
        } else {
            ToolforgeError::LlmFatal(detail)
        }
    }

    fn extract_text(json: &Value) -> Option<String> {
        let parts = json["candidates"]
            .as_array()?
            .first()?
            .get("content")?
            .get("parts")?
            .as_array()?;
        let text: String = parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect::<Vec<_>>()
            .join("");
        if text.is_empty() { None } else { Some(text) }
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    async fn generate(&self, credential: &str, prompt: &str) -> ToolforgeResult<String> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, credential
        );

        let resp = self
            .client
            .post(&url)
            .json(&Self::request_payload(prompt))
            .send()
            .await
            .map_err(|e| ToolforgeError::LlmTransient(format!("request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(Self::classify_error(resp).await);
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| ToolforgeError::LlmFatal(format!("malformed provider response: {e}")))?;

        Self::extract_text(&body)
            .ok_or_else(|| ToolforgeError::LlmFatal("no candidates in provider response".into()))
    }

    async fn generate_stream(
        &self,
        credential: &str,
        prompt: &str,
    ) -> ToolforgeResult<ChunkReceiver> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, self.model, credential
        );

        let resp = self
            .client
            .post(&url)
            .json(&Self::request_payload(prompt))
            .send()
            .await
            .map_err(|e| ToolforgeError::LlmTransient(format!("request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(Self::classify_error(resp).await);
        }

        let (tx, rx) = tokio::sync::mpsc::channel(32);
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut buffer = String::new();
            while let Some(item) = stream.next().await {
                let bytes = match item {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ToolforgeError::LlmTransient(format!(
                                "stream interrupted: {e}"
                            ))))
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                // SSE events are newline-delimited `data: {...}` records.
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data.is_empty() || data == "[DONE]" {
                        continue;
                    }
                    match serde_json::from_str::<Value>(data) {
                        Ok(event) => {
                            if let Some(text) = Self::extract_text(&event) {
                                if tx.send(Ok(text)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => debug!("skipping unparseable stream event: {e}"),
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn list_models(&self, credential: &str) -> ToolforgeResult<Vec<ModelInfo>> {
        let url = format!("{}/models?key={}", self.base_url, credential);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ToolforgeError::LlmTransient(format!("request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(Self::classify_error(resp).await);
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| ToolforgeError::LlmFatal(format!("malformed provider response: {e}")))?;

        let models: Vec<ModelInfo> = body["models"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| {
                        Some(ModelInfo {
                            name: m["name"].as_str()?.to_string(),
                            display_name: m["displayName"].as_str().unwrap_or_default().to_string(),
                            description: m["description"].as_str().unwrap_or_default().to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        if models.is_empty() {
            warn!("provider returned no models for this credential");
        }
        Ok(models)
    }

    fn model(&self) -> &str {
        &self.model
    }
}
