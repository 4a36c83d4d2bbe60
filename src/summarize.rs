//! Condenses retrieved passages into a short digest for the answer prompt.

use tracing::{debug, warn};

use medrag_core::models::RetrievalResult;

use crate::config::SummarizationConfig;
use crate::generation::prompt::{summary_prompt, truncate_chars};
use crate::generation::{GenerationOutcome, Generator};

#[derive(Debug, Clone, PartialEq)]
pub struct Digest {
    pub text: String,
    /// True when the crude fallback digest was used.
    pub degraded: bool,
}

#[derive(Clone)]
pub struct Summarizer {
    generator: Generator,
    config: SummarizationConfig,
}

fn passage_title(result: &RetrievalResult, position: usize) -> String {
    result
        .entry
        .metadata
        .title
        .clone()
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| format!("文档{}", position + 1))
}

impl Summarizer {
    pub fn new(generator: Generator, config: SummarizationConfig) -> Self {
        Self { generator, config }
    }

    pub fn config(&self) -> &SummarizationConfig {
        &self.config
    }

    /// Summarize `passages` with respect to `question` in at most
    /// `max_length` characters. No passages yield an empty digest.
    pub async fn summarize(
        &self,
        passages: &[RetrievalResult],
        question: &str,
        max_length: usize,
    ) -> Digest {
        if passages.is_empty() {
            return Digest {
                text: String::new(),
                degraded: false,
            };
        }

        let combined = passages
            .iter()
            .enumerate()
            .map(|(i, r)| format!("【{}】{}", passage_title(r, i), r.entry.chunk.content))
            .collect::<Vec<_>>()
            .join("\n");
        let input = truncate_chars(&combined, self.config.max_input_chars);
        let prompt = summary_prompt(question, &input, max_length);

        let params = self
            .generator
            .defaults()
            .with_temperature(self.config.temperature)
            .with_max_new_tokens(self.config.max_new_tokens);
        let generated = self.generator.generate(&prompt, &params).await;

        if generated.outcome == GenerationOutcome::Completed && !generated.text.trim().is_empty() {
            let text = truncate_chars(generated.text.trim(), max_length);
            debug!(chars = text.chars().count(), "digest generated");
            return Digest {
                text,
                degraded: false,
            };
        }

        warn!(outcome = ?generated.outcome, "summary generation unavailable, using fallback digest");
        Digest {
            text: self.fallback_digest(passages, max_length),
            degraded: true,
        }
    }

    /// First passages as `【title】<prefix>...` lines.
    pub fn fallback_digest(&self, passages: &[RetrievalResult], max_length: usize) -> String {
        let lines: Vec<String> = passages
            .iter()
            .take(self.config.fallback_passages)
            .enumerate()
            .filter(|(_, r)| !r.entry.chunk.content.trim().is_empty())
            .map(|(i, r)| {
                format!(
                    "【{}】{}...",
                    passage_title(r, i),
                    truncate_chars(&r.entry.chunk.content, self.config.fallback_chars)
                )
            })
            .collect();
        truncate_chars(&lines.join("\n"), max_length)
    }
}
