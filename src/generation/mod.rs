//! Text generation with deadlines, retries, and streaming.
//!
//! A [`TextGenerator`] backend is wrapped by [`Generator`], which owns the
//! timeout and retry policy. Callers never see backend errors: a finished
//! generation is always a [`Generated`] whose text is either the model's
//! answer or one of the canned messages below.
//!
//! # Timeouts
//!
//! Each backend call runs in a spawned task awaited under one overall
//! deadline. When the deadline passes the task is detached, not cancelled:
//! the model may keep working and its result is discarded.

pub mod openai;
pub mod prompt;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::GenerationConfig;
use crate::error::RagError;

pub const TIMEOUT_MESSAGE: &str = "抱歉，生成回答超时，请稍后重试。";
pub const FAILURE_MESSAGE: &str = "抱歉，生成回答时出现错误。";
pub const NO_ANSWER_MESSAGE: &str = "抱歉，我无法回答您的问题。建议您咨询专业医生获取准确信息。";
pub const EMPTY_CHAT_MESSAGE: &str = "请告诉我您的问题。";
pub const PIPELINE_ERROR_MESSAGE: &str = "抱歉，我无法处理您的问题。请稍后重试。";

/// True when `text` is one of the fixed fallback answers.
pub fn is_canned_response(text: &str) -> bool {
    [
        TIMEOUT_MESSAGE,
        FAILURE_MESSAGE,
        NO_ANSWER_MESSAGE,
        EMPTY_CHAT_MESSAGE,
        PIPELINE_ERROR_MESSAGE,
    ]
    .contains(&text)
}

/// Sampling parameters passed to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GenerationParams {
    pub max_new_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub repetition_penalty: f32,
}

impl GenerationParams {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            max_new_tokens: config.max_new_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
            top_k: config.top_k,
            repetition_penalty: config.repetition_penalty,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_new_tokens(mut self, max_new_tokens: u32) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self::from_config(&GenerationConfig::default())
    }
}

/// A text-generation capability: "given a prompt, return text or a stream
/// of text fragments".
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String>;

    /// Stream fragments in order. The default delivers the whole
    /// [`generate`](TextGenerator::generate) output as one fragment.
    async fn generate_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<mpsc::Receiver<Result<String>>> {
        let text = self.generate(prompt, params).await?;
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.send(Ok(text)).await;
        Ok(rx)
    }
}

/// Backend used when generation is switched off. Every call fails, so
/// answers come from the canned fallbacks.
pub struct DisabledGenerator;

#[async_trait]
impl TextGenerator for DisabledGenerator {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _prompt: &str, _params: &GenerationParams) -> Result<String> {
        bail!("Text generation is disabled")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationOutcome {
    Completed,
    TimedOut,
    Failed,
    /// No generation was attempted.
    Skipped,
}

/// A finished generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Generated {
    pub text: String,
    pub outcome: GenerationOutcome,
}

impl Generated {
    pub fn is_degraded(&self) -> bool {
        self.outcome != GenerationOutcome::Completed
    }
}

#[derive(Clone)]
pub struct Generator {
    backend: Arc<dyn TextGenerator>,
    defaults: GenerationParams,
    timeout: Duration,
    max_retries: u32,
    backoff: Duration,
}

impl Generator {
    /// Build the configured backend (`openai` or `disabled`).
    pub fn from_config(config: &GenerationConfig) -> Result<Self, RagError> {
        let backend: Arc<dyn TextGenerator> = match config.provider.as_str() {
            "openai" => Arc::new(openai::OpenAiGenerator::new(config)?),
            "disabled" => Arc::new(DisabledGenerator),
            other => {
                return Err(RagError::Configuration(format!(
                    "Unknown generation provider: '{}'",
                    other
                )))
            }
        };
        Ok(Self::new(backend, config))
    }

    pub fn new(backend: Arc<dyn TextGenerator>, config: &GenerationConfig) -> Self {
        Self {
            backend,
            defaults: GenerationParams::from_config(config),
            timeout: Duration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn defaults(&self) -> GenerationParams {
        self.defaults
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run the backend under the deadline, retrying failures with
    /// exponential backoff. Returns the trimmed model output.
    ///
    /// # Errors
    ///
    /// [`RagError::GenerationTimeout`] when the deadline passes (a zero
    /// timeout has already passed), [`RagError::GenerationFailure`] when
    /// every attempt failed.
    pub async fn try_generate(&self, prompt: &str, params: &GenerationParams) -> Result<String, RagError> {
        if self.timeout.is_zero() {
            return Err(RagError::GenerationTimeout(self.timeout));
        }
        let deadline = Instant::now() + self.timeout;
        let mut attempt: u32 = 0;

        loop {
            let backend = self.backend.clone();
            let prompt_owned = prompt.to_string();
            let p = *params;
            let handle = tokio::spawn(async move { backend.generate(&prompt_owned, &p).await });

            let failure = match tokio::time::timeout_at(deadline, handle).await {
                Err(_) => {
                    warn!(
                        timeout_secs = self.timeout.as_secs_f64(),
                        "generation deadline passed, backend task detached"
                    );
                    return Err(RagError::GenerationTimeout(self.timeout));
                }
                Ok(Ok(Ok(text))) => return Ok(text.trim().to_string()),
                Ok(Ok(Err(e))) => format!("{:#}", e),
                Ok(Err(join_err)) => join_err.to_string(),
            };

            attempt += 1;
            if attempt > self.max_retries {
                return Err(RagError::GenerationFailure(failure));
            }
            warn!(attempt, error = %failure, "generation attempt failed, retrying");

            let delay = self.backoff * (1u32 << (attempt - 1).min(5));
            tokio::time::sleep_until((Instant::now() + delay).min(deadline)).await;
            if Instant::now() >= deadline {
                return Err(RagError::GenerationTimeout(self.timeout));
            }
        }
    }

    /// Generate with fallbacks: a timeout yields [`TIMEOUT_MESSAGE`], a
    /// failure [`FAILURE_MESSAGE`], and empty output [`NO_ANSWER_MESSAGE`].
    pub async fn generate(&self, prompt: &str, params: &GenerationParams) -> Generated {
        match self.try_generate(prompt, params).await {
            Ok(text) if text.is_empty() => {
                warn!("model returned an empty answer");
                Generated {
                    text: NO_ANSWER_MESSAGE.to_string(),
                    outcome: GenerationOutcome::Failed,
                }
            }
            Ok(text) => Generated {
                text,
                outcome: GenerationOutcome::Completed,
            },
            Err(RagError::GenerationTimeout(_)) => Generated {
                text: TIMEOUT_MESSAGE.to_string(),
                outcome: GenerationOutcome::TimedOut,
            },
            Err(e) => {
                warn!(error = %e, "generation failed");
                Generated {
                    text: FAILURE_MESSAGE.to_string(),
                    outcome: GenerationOutcome::Failed,
                }
            }
        }
    }

    /// Relay backend fragments under the deadline.
    ///
    /// The receiver yields `Ok(fragment)` in order and ends either cleanly
    /// or with one terminal `Err` ([`RagError::GenerationTimeout`] or
    /// [`RagError::GenerationFailure`]). Dropping the receiver stops the
    /// relay.
    pub fn generate_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> mpsc::Receiver<Result<String, RagError>> {
        let (tx, rx) = mpsc::channel(32);
        let backend = self.backend.clone();
        let prompt = prompt.to_string();
        let params = *params;
        let timeout = self.timeout;

        tokio::spawn(async move {
            if timeout.is_zero() {
                let _ = tx.send(Err(RagError::GenerationTimeout(timeout))).await;
                return;
            }
            let deadline = Instant::now() + timeout;

            let mut upstream =
                match tokio::time::timeout_at(deadline, backend.generate_stream(&prompt, &params)).await {
                    Err(_) => {
                        let _ = tx.send(Err(RagError::GenerationTimeout(timeout))).await;
                        return;
                    }
                    Ok(Err(e)) => {
                        let _ = tx
                            .send(Err(RagError::GenerationFailure(format!("{:#}", e))))
                            .await;
                        return;
                    }
                    Ok(Ok(rx)) => rx,
                };

            loop {
                match tokio::time::timeout_at(deadline, upstream.recv()).await {
                    Err(_) => {
                        warn!("streaming deadline passed");
                        let _ = tx.send(Err(RagError::GenerationTimeout(timeout))).await;
                        return;
                    }
                    Ok(None) => return,
                    Ok(Some(Ok(fragment))) => {
                        if tx.send(Ok(fragment)).await.is_err() {
                            debug!("stream consumer went away");
                            return;
                        }
                    }
                    Ok(Some(Err(e))) => {
                        let _ = tx
                            .send(Err(RagError::GenerationFailure(format!("{:#}", e))))
                            .await;
                        return;
                    }
                }
            }
        });

        rx
    }
}
