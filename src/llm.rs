//! Chat-model providers.
//!
//! One capability, [`ChatModel::stream`], implemented per provider and
//! selected once from `[llm]` by [`create_chat_model`]:
//!
//! | `provider` | Endpoint | Auth header |
//! |------------|----------|-------------|
//! | `openai` | `{api_base}/chat/completions` | `Authorization: Bearer $OPENAI_API_KEY` |
//! | `azure` | `{api_base}/openai/deployments/{model}/chat/completions` | `api-key: $AZURE_API_KEY` |
//! | `anthropic` | `{api_base}/v1/messages` | `x-api-key: $ANTHROPIC_API_KEY` |
//!
//! All three respond with server-sent events; [`SseDecoder`] reassembles
//! `data:` lines across network chunks and each provider maps its event
//! payload to text tokens.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};

use kb_assist_core::models::{Content, ImageData, ImageFormat, Message, Role};

use crate::config::{LlmConfig, LlmProviderKind};
use crate::http::{send_with_retry, ProviderError};

/// Text tokens in arrival order.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn name(&self) -> &str;
    async fn stream(&self, messages: &[Message]) -> Result<TokenStream>;
}

/// Drain a model's stream into one string.
pub async fn complete(model: &dyn ChatModel, messages: &[Message]) -> Result<String> {
    let mut stream = model.stream(messages).await?;
    let mut out = String::new();
    while let Some(token) = stream.next().await {
        out.push_str(&token?);
    }
    Ok(out)
}

pub fn create_chat_model(config: &LlmConfig) -> Result<Arc<dyn ChatModel>> {
    let var = config.provider.api_key_var();
    let api_key = std::env::var(var).map_err(|_| anyhow!("{} environment variable not set", var))?;
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;

    Ok(match config.provider {
        LlmProviderKind::OpenAi | LlmProviderKind::Azure => {
            Arc::new(OpenAiChat::new(client, api_key, config)?)
        }
        LlmProviderKind::Anthropic => Arc::new(AnthropicChat::new(client, api_key, config)),
    })
}

// ============ SSE ============

/// Incremental `text/event-stream` decoder yielding `data:` payloads.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Feed raw bytes; returns every payload completed by this chunk.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(data) = line.strip_prefix("data:") {
                out.push(data.strip_prefix(' ').unwrap_or(data).to_string());
            }
        }
        out
    }
}

/// Turn a response body into tokens using a per-provider event parser.
///
/// `parse` returns `None` for events that carry no text.
fn token_stream<S, E>(bytes: S, parse: fn(&str) -> Option<Result<String>>) -> TokenStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut decoder = SseDecoder::default();
    let events = bytes
        .map(move |chunk| match chunk {
            Ok(b) => decoder.push(&b).into_iter().map(Ok).collect::<Vec<_>>(),
            Err(e) => vec![Err(anyhow::Error::new(e).context("stream interrupted"))],
        })
        .flat_map(futures::stream::iter)
        .filter_map(move |event| {
            futures::future::ready(match event {
                Ok(data) if data.trim() == "[DONE]" => None,
                Ok(data) => parse(&data),
                Err(e) => Some(Err(e)),
            })
        });
    Box::pin(events)
}

fn image_base64(data: &ImageData) -> Result<String> {
    match data {
        ImageData::Base64(b64) => Ok(b64.clone()),
        ImageData::Path(path) => {
            let bytes =
                std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
            Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
    }
}

// ============ OpenAI / Azure ============

const OPENAI_DEFAULT_BASE: &str = "https://api.openai.com/v1";
const AZURE_DEFAULT_API_VERSION: &str = "2024-06-01";

pub struct OpenAiChat {
    client: reqwest::Client,
    api_key: String,
    url: String,
    azure: bool,
    model: String,
    temperature: f32,
    max_tokens: u32,
    max_retries: u32,
}

impl OpenAiChat {
    pub fn new(client: reqwest::Client, api_key: String, config: &LlmConfig) -> Result<Self> {
        let azure = config.provider == LlmProviderKind::Azure;
        let url = if azure {
            let base = config
                .api_base
                .as_deref()
                .ok_or_else(|| anyhow!("llm.api_base is required for Azure"))?;
            format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                base.trim_end_matches('/'),
                config.model,
                config
                    .api_version
                    .as_deref()
                    .unwrap_or(AZURE_DEFAULT_API_VERSION)
            )
        } else {
            format!(
                "{}/chat/completions",
                config
                    .api_base
                    .as_deref()
                    .unwrap_or(OPENAI_DEFAULT_BASE)
                    .trim_end_matches('/')
            )
        };
        Ok(Self {
            client,
            api_key,
            url,
            azure,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
        })
    }

    fn provider_label(&self) -> &'static str {
        if self.azure {
            "Azure OpenAI"
        } else {
            "OpenAI"
        }
    }

    fn build_body(&self, messages: &[Message]) -> Result<Value> {
        let messages = messages
            .iter()
            .map(openai_message)
            .collect::<Result<Vec<_>>>()?;
        let mut body = json!({
            "messages": messages,
            "stream": true,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });
        // Azure routes on the deployment in the URL.
        if !self.azure {
            body["model"] = json!(self.model);
        }
        Ok(body)
    }
}

fn openai_message(message: &Message) -> Result<Value> {
    let content = match &message.content {
        Content::Text { text } => json!(text),
        Content::Image { data, format } => json!([{
            "type": "image_url",
            "image_url": {
                "url": format!("data:{};base64,{}", format.mime_type(), image_base64(data)?),
            },
        }]),
    };
    Ok(json!({ "role": message.role.as_str(), "content": content }))
}

fn parse_openai_event(data: &str) -> Option<Result<String>> {
    let event: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return Some(Err(ProviderError::invalid("OpenAI", e.to_string()).into())),
    };
    if let Some(err) = event.get("error") {
        return Some(Err(anyhow!("OpenAI stream error: {}", err)));
    }
    event
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(|s| Ok(s.to_string()))
}

#[async_trait]
impl ChatModel for OpenAiChat {
    fn name(&self) -> &str {
        &self.model
    }

    async fn stream(&self, messages: &[Message]) -> Result<TokenStream> {
        let body = self.build_body(messages)?;
        let response = send_with_retry(self.provider_label(), self.max_retries, || {
            let request = self.client.post(&self.url).json(&body);
            if self.azure {
                request.header("api-key", &self.api_key)
            } else {
                request.bearer_auth(&self.api_key)
            }
        })
        .await?;
        Ok(token_stream(response.bytes_stream(), parse_openai_event))
    }
}

// ============ Anthropic ============

const ANTHROPIC_DEFAULT_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicChat {
    client: reqwest::Client,
    api_key: String,
    url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    max_retries: u32,
}

impl AnthropicChat {
    pub fn new(client: reqwest::Client, api_key: String, config: &LlmConfig) -> Self {
        let base = config
            .api_base
            .as_deref()
            .unwrap_or(ANTHROPIC_DEFAULT_BASE)
            .trim_end_matches('/');
        Self {
            client,
            api_key,
            url: format!("{}/v1/messages", base),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
        }
    }

    /// System messages go in the top-level `system` field.
    fn build_body(&self, messages: &[Message]) -> Result<Value> {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .filter_map(Message::as_text)
            .collect();
        let turns = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(anthropic_message)
            .collect::<Result<Vec<_>>>()?;

        let mut body = json!({
            "model": self.model,
            "messages": turns,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "stream": true,
        });
        if !system.is_empty() {
            body["system"] = json!(system.join("\n"));
        }
        Ok(body)
    }
}

fn anthropic_message(message: &Message) -> Result<Value> {
    let content = match &message.content {
        Content::Text { text } => json!(text),
        Content::Image { data, format } => json!([{
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": anthropic_media_type(*format)?,
                "data": image_base64(data)?,
            },
        }]),
    };
    Ok(json!({ "role": message.role.as_str(), "content": content }))
}

/// Anthropic accepts JPEG, PNG, GIF and WebP only.
fn anthropic_media_type(format: ImageFormat) -> Result<&'static str> {
    match format {
        ImageFormat::Bmp => bail!("Anthropic does not accept BMP images; convert to PNG first"),
        other => Ok(other.mime_type()),
    }
}

fn parse_anthropic_event(data: &str) -> Option<Result<String>> {
    let event: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return Some(Err(ProviderError::invalid("Anthropic", e.to_string()).into())),
    };
    match event.get("type").and_then(Value::as_str) {
        Some("content_block_delta") => event
            .pointer("/delta/text")
            .and_then(Value::as_str)
            .map(|s| Ok(s.to_string())),
        Some("error") => Some(Err(anyhow!(
            "Anthropic stream error: {}",
            event.get("error").cloned().unwrap_or(Value::Null)
        ))),
        _ => None,
    }
}

#[async_trait]
impl ChatModel for AnthropicChat {
    fn name(&self) -> &str {
        &self.model
    }

    async fn stream(&self, messages: &[Message]) -> Result<TokenStream> {
        let body = self.build_body(messages)?;
        let response = send_with_retry("Anthropic", self.max_retries, || {
            self.client
                .post(&self.url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body)
        })
        .await?;
        Ok(token_stream(response.bytes_stream(), parse_anthropic_event))
    }
}
