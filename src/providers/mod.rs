mod base;
mod client;
mod gemini;

pub use base::{ChunkReceiver, LlmProvider, ModelInfo};
pub use client::LlmClient;
pub use gemini::GeminiProvider;
