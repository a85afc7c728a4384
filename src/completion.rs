//! Chat-completion providers.
//!
//! [`CompletionProvider`] is the seam the answer pipeline calls through. The
//! real implementation speaks the OpenAI-compatible
//! `POST {url}/v1/chat/completions` protocol in both single-shot and
//! server-sent-events streaming modes. Any failure (transport, non-2xx
//! status, or a body that does not have the expected shape) is an `Err`; the
//! caller decides how to degrade.
//!
//! # Streaming wire format
//!
//! ```text
//! data: {"choices":[{"delta":{"content":"Hel"}}]}
//! data: {"choices":[{"delta":{"content":"lo"}}]}
//! data: [DONE]
//! ```
//!
//! Blank lines, comments, and `data:` payloads without content are skipped.

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::GenerationConfig;
use crate::embedding::{http_client, success_json};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Generate a full response.
    async fn complete(&self, messages: &[ChatMessage]) -> anyhow::Result<String>;

    /// Generate a response, sending content fragments to `tokens` as they
    /// arrive. Returns once the stream has ended.
    async fn complete_stream(
        &self,
        messages: &[ChatMessage],
        tokens: mpsc::Sender<String>,
    ) -> anyhow::Result<()>;
}

/// Build the provider named by `config.provider`.
pub fn create_completion_provider(
    config: &GenerationConfig,
) -> anyhow::Result<Arc<dyn CompletionProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledCompletion)),
        "openai" => Ok(Arc::new(OpenAICompatibleProvider::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

// ============ Disabled ============

/// Fails every request; answers degrade to the apology text.
pub struct DisabledCompletion;

#[async_trait]
impl CompletionProvider for DisabledCompletion {
    async fn complete(&self, _messages: &[ChatMessage]) -> anyhow::Result<String> {
        bail!("Completion provider is disabled")
    }

    async fn complete_stream(
        &self,
        _messages: &[ChatMessage],
        _tokens: mpsc::Sender<String>,
    ) -> anyhow::Result<()> {
        bail!("Completion provider is disabled")
    }
}

// ============ OpenAI-compatible ============

/// Chat completions against any OpenAI-compatible endpoint.
///
/// The bearer token is read from `COMPLETION_API_KEY`.
pub struct OpenAICompatibleProvider {
    client: reqwest::Client,
    model: String,
    url: String,
    temperature: f32,
    max_tokens: u32,
    api_key: Option<String>,
}

impl OpenAICompatibleProvider {
    pub fn new(config: &GenerationConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var("COMPLETION_API_KEY").ok();
        if api_key.is_none() {
            warn!("COMPLETION_API_KEY not set; answers will fall back to the apology text");
        }
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            model: config.model.clone(),
            url: config.url.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            api_key,
        })
    }

    async fn send(&self, messages: &[ChatMessage], stream: bool) -> anyhow::Result<reqwest::Response> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| anyhow!("COMPLETION_API_KEY not set"))?;

        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "stream": stream,
        });

        debug!(model = %self.model, stream, messages = messages.len(), "sending completion request");
        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.url.trim_end_matches('/')))
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await
            .context("Completion request failed")?;
        Ok(response)
    }
}

#[async_trait]
impl CompletionProvider for OpenAICompatibleProvider {
    async fn complete(&self, messages: &[ChatMessage]) -> anyhow::Result<String> {
        let response = self.send(messages, false).await?;
        let json = success_json(response, "Completion").await?;
        parse_completion_response(&json)
    }

    async fn complete_stream(
        &self,
        messages: &[ChatMessage],
        tokens: mpsc::Sender<String>,
    ) -> anyhow::Result<()> {
        let mut response = self.send(messages, true).await?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Completion API error {}: {}", status, body_text);
        }

        let mut pending: Vec<u8> = Vec::new();
        while let Some(chunk) = response.chunk().await.context("Completion stream interrupted")? {
            pending.extend_from_slice(&chunk);
            while let Some(newline) = pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = pending.drain(..=newline).collect();
                match parse_sse_line(&String::from_utf8_lossy(&line))? {
                    SseLine::Content(text) => {
                        if tokens.send(text).await.is_err() {
                            // receiver gone; nobody is listening anymore
                            return Ok(());
                        }
                    }
                    SseLine::Done => return Ok(()),
                    SseLine::Skip => {}
                }
            }
        }

        if let SseLine::Content(text) = parse_sse_line(&String::from_utf8_lossy(&pending))? {
            let _ = tokens.send(text).await;
        }
        Ok(())
    }
}

/// Extract `choices[0].message.content`.
fn parse_completion_response(json: &serde_json::Value) -> anyhow::Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(|c| c.to_string())
        .ok_or_else(|| anyhow!("Invalid completion response: missing choices[0].message.content"))
}

/// One decoded line of a server-sent-events stream.
#[derive(Debug, PartialEq)]
pub enum SseLine {
    Content(String),
    Done,
    Skip,
}

pub fn parse_sse_line(line: &str) -> anyhow::Result<SseLine> {
    let line = line.trim();
    let Some(payload) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
        return Ok(SseLine::Done);
    }
    if payload.is_empty() {
        return Ok(SseLine::Skip);
    }

    let json: serde_json::Value =
        serde_json::from_str(payload).context("Invalid completion stream payload")?;
    match json
        .pointer("/choices/0/delta/content")
        .and_then(|c| c.as_str())
    {
        Some(content) if !content.is_empty() => Ok(SseLine::Content(content.to_string())),
        _ => Ok(SseLine::Skip),
    }
}
