//! OpenAI-compatible chat completions backend.
//!
//! Works with any server exposing `POST /v1/chat/completions` (LM Studio,
//! vLLM, llama.cpp server). Streaming uses server-sent events: `data: {json}`
//! lines terminated by `data: [DONE]`.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use super::{GenerationParams, TextGenerator};
use crate::config::GenerationConfig;
use crate::error::RagError;

#[derive(Clone)]
pub struct OpenAiGenerator {
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: Client,
}

impl OpenAiGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self, RagError> {
        let api_key = match &config.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                RagError::Configuration(format!("{} environment variable not set", var))
            })?),
            None => None,
        };
        let client = Client::builder()
            .build()
            .map_err(|e| RagError::Configuration(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            client,
        })
    }

    fn request_body(&self, prompt: &str, params: &GenerationParams, stream: bool) -> Value {
        json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "stream": stream,
            "max_tokens": params.max_new_tokens,
            "temperature": params.temperature,
            "top_p": params.top_p,
            "top_k": params.top_k,
            "repetition_penalty": params.repetition_penalty,
        })
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut req = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let res = req.send().await?;
        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            bail!("chat completions error {}: {}", status, text);
        }
        Ok(res)
    }
}

#[async_trait]
impl TextGenerator for OpenAiGenerator {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String> {
        let res = self.post(&self.request_body(prompt, params, false)).await?;
        let payload: Value = res.json().await?;
        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("Invalid chat completions response: missing content"))
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<mpsc::Receiver<Result<String>>> {
        let res = self.post(&self.request_body(prompt, params, true)).await?;
        let (tx, rx) = mpsc::channel(32);
        let mut stream = res.bytes_stream();

        tokio::spawn(async move {
            let mut decoder = SseDecoder::default();
            while let Some(item) = stream.next().await {
                let bytes = match item {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(Err(e.into())).await;
                        return;
                    }
                };
                if !relay(&tx, decoder.push(&bytes)).await {
                    return;
                }
            }
            relay(&tx, decoder.finish()).await;
        });

        Ok(rx)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Delta(String),
    Done,
}

/// Incremental SSE line decoder.
///
/// Network chunks can split a line (or a multi-byte character) anywhere, so
/// bytes are buffered until a newline arrives.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            events.extend(decode_line(&line));
        }
        events
    }

    /// Decode whatever follows the last newline once the stream has ended.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest).into_iter().collect()
    }
}

fn decode_line(line: &[u8]) -> Option<SseEvent> {
    let line = String::from_utf8_lossy(line);
    let data = line.trim().strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }
    let json = serde_json::from_str::<Value>(data).ok()?;
    let content = json["choices"][0]["delta"]["content"].as_str()?;
    (!content.is_empty()).then(|| SseEvent::Delta(content.to_string()))
}

/// Forward decoded events. Returns `false` once the stream should stop,
/// either at `[DONE]` or because the receiver went away.
async fn relay(tx: &mpsc::Sender<anyhow::Result<String>>, events: Vec<SseEvent>) -> bool {
    for event in events {
        match event {
            SseEvent::Done => return false,
            SseEvent::Delta(content) => {
                if tx.send(Ok(content)).await.is_err() {
                    debug!("stream receiver dropped");
                    return false;
                }
            }
        }
    }
    true
}
