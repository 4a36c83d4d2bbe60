//! Per-query stage tracking.

use serde::Serialize;
use std::fmt;
use tracing::debug;

/// Stages of one query, in the order they are reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStage {
    Received,
    QueryEmbedded,
    Retrieved,
    Summarized,
    ContextBuilt,
    Generating,
    Done,
    Failed,
}

impl QueryStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, QueryStage::Done | QueryStage::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QueryStage::Received => "received",
            QueryStage::QueryEmbedded => "query_embedded",
            QueryStage::Retrieved => "retrieved",
            QueryStage::Summarized => "summarized",
            QueryStage::ContextBuilt => "context_built",
            QueryStage::Generating => "generating",
            QueryStage::Done => "done",
            QueryStage::Failed => "failed",
        }
    }
}

impl fmt::Display for QueryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid stage transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: QueryStage,
    pub to: QueryStage,
}

/// Forward-only stage machine. Stages may be skipped (the no-context branch
/// goes from `retrieved` straight to `context_built`) but never revisited.
/// `failed` is reachable from any non-terminal stage.
#[derive(Debug)]
pub struct StageTracker {
    query_id: String,
    current: QueryStage,
}

impl StageTracker {
    pub fn new(query_id: impl Into<String>) -> Self {
        let query_id = query_id.into();
        debug!(query_id = %query_id, stage = %QueryStage::Received, "query stage");
        Self {
            query_id,
            current: QueryStage::Received,
        }
    }

    pub fn current(&self) -> QueryStage {
        self.current
    }

    pub fn advance(&mut self, next: QueryStage) -> Result<(), InvalidTransition> {
        if self.current.is_terminal() || next <= self.current {
            return Err(InvalidTransition {
                from: self.current,
                to: next,
            });
        }
        debug!(query_id = %self.query_id, from = %self.current, to = %next, "query stage");
        self.current = next;
        Ok(())
    }

    /// Move to `failed` unless already terminal.
    pub fn fail(&mut self) {
        if !self.current.is_terminal() {
            debug!(query_id = %self.query_id, from = %self.current, "query failed");
            self.current = QueryStage::Failed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_moves_and_skips() {
        let mut t = StageTracker::new("q");
        t.advance(QueryStage::QueryEmbedded).unwrap();
        t.advance(QueryStage::Retrieved).unwrap();
        t.advance(QueryStage::ContextBuilt).unwrap();
        t.advance(QueryStage::Generating).unwrap();
        t.advance(QueryStage::Done).unwrap();
        assert_eq!(t.current(), QueryStage::Done);
    }

    #[test]
    fn test_backward_and_repeat_rejected() {
        let mut t = StageTracker::new("q");
        t.advance(QueryStage::Retrieved).unwrap();
        let err = t.advance(QueryStage::QueryEmbedded).unwrap_err();
        assert_eq!(err.from, QueryStage::Retrieved);
        assert!(t.advance(QueryStage::Retrieved).is_err());
        assert_eq!(t.current(), QueryStage::Retrieved);
        assert_eq!(err.to_string(), "invalid stage transition retrieved -> query_embedded");
    }

    #[test]
    fn test_terminal_stages_are_final() {
        let mut t = StageTracker::new("q");
        t.advance(QueryStage::Generating).unwrap();
        t.fail();
        assert_eq!(t.current(), QueryStage::Failed);
        assert!(t.advance(QueryStage::Done).is_err());

        let mut done = StageTracker::new("q2");
        done.advance(QueryStage::Done).unwrap();
        done.fail();
        assert_eq!(done.current(), QueryStage::Done);
    }

    #[test]
    fn test_stage_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&QueryStage::ContextBuilt).unwrap(),
            "\"context_built\""
        );
    }
}
