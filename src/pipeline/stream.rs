//! Streaming query.
//!
//! [`Pipeline::query_stream`] runs the query in a spawned task and reports
//! progress as typed [`StreamEvent`]s over an `mpsc` channel:
//!
//! ```text
//! status ×5 → content … → documents → complete
//! ```
//!
//! Each `status` event is sent before the work of the stage it names, so
//! its `stage` is the one in progress. A retrieval failure ends the stream
//! with a single `error` event. The consumer may drop the receiver at any
//! point; the task notices on its next send and stops, which also drops
//! the generator's fragment relay.

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RagError;
use crate::generation::{GenerationOutcome, FAILURE_MESSAGE, NO_ANSWER_MESSAGE, TIMEOUT_MESSAGE};

use super::{advance, to_documents, Pipeline, QueryOptions, QueryStage, RetrievedDocument, StageTracker};

pub const STATUS_RECEIVED: &str = "正在处理您的问题...";
pub const STATUS_ANALYZING: &str = "正在分析问题...";
pub const STATUS_RETRIEVING: &str = "正在检索相关知识...";
pub const STATUS_ORGANIZING: &str = "正在整理检索到的内容...";
pub const STATUS_GENERATING: &str = "正在生成回答...";
pub const COMPLETE_MESSAGE: &str = "回答生成完成";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Status { stage: QueryStage, message: String },
    Content { content: String },
    Documents { documents: Vec<RetrievedDocument> },
    Complete { message: String, degraded: bool },
    Error { message: String },
}

impl StreamEvent {
    fn status(stage: QueryStage, message: &str) -> Self {
        Self::Status {
            stage,
            message: message.to_string(),
        }
    }

    fn content(text: &str) -> Self {
        Self::Content {
            content: text.to_string(),
        }
    }
}

type Sent = Result<(), SendError<StreamEvent>>;

impl Pipeline {
    /// Answer `question`, streaming progress and answer fragments.
    pub fn query_stream(&self, question: &str, options: QueryOptions) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(32);
        let pipeline = self.clone();
        let question = question.to_string();

        tokio::spawn(async move {
            if pipeline.run_stream(&question, &options, &tx).await.is_err() {
                debug!("stream consumer went away");
            }
        });
        rx
    }

    async fn run_stream(&self, question: &str, options: &QueryOptions, tx: &mpsc::Sender<StreamEvent>) -> Sent {
        let mut tracker = StageTracker::new(Uuid::new_v4().to_string());
        info!(chars = question.chars().count(), "streaming query received");
        tx.send(StreamEvent::status(QueryStage::Received, STATUS_RECEIVED)).await?;

        tx.send(StreamEvent::status(QueryStage::QueryEmbedded, STATUS_ANALYZING)).await?;
        let query_vec = self.embedder.embed(question).await;
        advance(&mut tracker, QueryStage::QueryEmbedded);

        tx.send(StreamEvent::status(QueryStage::Retrieved, STATUS_RETRIEVING)).await?;
        let retrieved = match self.retrieve(question, &query_vec, options).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "streaming query failed");
                tracker.fail();
                return tx
                    .send(StreamEvent::Error {
                        message: format!("查询出错：{}", e),
                    })
                    .await;
            }
        };
        advance(&mut tracker, QueryStage::Retrieved);

        tx.send(StreamEvent::status(QueryStage::ContextBuilt, STATUS_ORGANIZING)).await?;
        let (context, digest_degraded) = self.context_for(question, &retrieved).await;
        if !retrieved.is_empty() {
            advance(&mut tracker, QueryStage::Summarized);
        }
        advance(&mut tracker, QueryStage::ContextBuilt);

        let prompt = self.answer_prompt(question, options.response_type, &context);
        tx.send(StreamEvent::status(QueryStage::Generating, STATUS_GENERATING)).await?;
        advance(&mut tracker, QueryStage::Generating);

        let mut fragments = self.generator.generate_stream(&prompt, &self.generator.defaults());
        let mut outcome = GenerationOutcome::Completed;
        let mut delivered = false;
        while let Some(item) = fragments.recv().await {
            match item {
                Ok(fragment) if fragment.is_empty() => {}
                Ok(fragment) => {
                    delivered = true;
                    tx.send(StreamEvent::Content { content: fragment }).await?;
                }
                Err(RagError::GenerationTimeout(_)) => {
                    outcome = GenerationOutcome::TimedOut;
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "streaming generation failed");
                    outcome = GenerationOutcome::Failed;
                    break;
                }
            }
        }

        match outcome {
            GenerationOutcome::TimedOut => {
                tx.send(StreamEvent::content(TIMEOUT_MESSAGE)).await?;
            }
            GenerationOutcome::Failed if !delivered => {
                tx.send(StreamEvent::content(FAILURE_MESSAGE)).await?;
            }
            GenerationOutcome::Completed if !delivered => {
                outcome = GenerationOutcome::Failed;
                tx.send(StreamEvent::content(NO_ANSWER_MESSAGE)).await?;
            }
            _ => {}
        }
        advance(&mut tracker, QueryStage::Done);

        tx.send(StreamEvent::Documents {
            documents: to_documents(&retrieved),
        })
        .await?;

        let degraded =
            retrieved.is_empty() || digest_degraded || outcome != GenerationOutcome::Completed;
        info!(results = retrieved.len(), outcome = ?outcome, "streaming query answered");
        tx.send(StreamEvent::Complete {
            message: COMPLETE_MESSAGE.to_string(),
            degraded,
        })
        .await
    }
}
