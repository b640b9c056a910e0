// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The span record: one traced unit of work.
//!
//! A span is append-only while `status == Running` and immutable once
//! closed. Identity and start time are assigned at construction, never by
//! the caller, so ids are unique and start order is monotonic within a
//! process.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SpanError;
use crate::types::{ErrorInfo, LlmCall, SpanId, SpanStatus, SpanType, TraceId};

/// One recorded unit of agent work.
///
/// Spans are created by the tracer, accumulate inputs/outputs/LLM calls
/// while open, and are frozen by [`Span::close`]. The persisted JSON shape
/// of this struct is the interchange contract consumed by the
/// visualization layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub span_id: SpanId,
    pub trace_id: TraceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<SpanId>,
    pub name: String,
    pub span_type: SpanType,
    /// Producer label used by the trace-list filter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub inputs: HashMap<String, serde_json::Value>,
    pub outputs: HashMap<String, serde_json::Value>,
    pub llm_calls: Vec<LlmCall>,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub status: SpanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl Span {
    /// Create a new running span. Ids and start time are assigned here.
    pub(crate) fn new(
        name: &str,
        span_type: SpanType,
        trace_id: TraceId,
        parent_span_id: Option<SpanId>,
    ) -> Self {
        Self {
            span_id: SpanId::new(),
            trace_id,
            parent_span_id,
            name: name.to_string(),
            span_type,
            agent_id: None,
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            llm_calls: Vec::new(),
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            status: SpanStatus::Running,
            error: None,
        }
    }

    /// Whether the span has been closed.
    pub fn is_closed(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether this span has no parent.
    pub fn is_root(&self) -> bool {
        self.parent_span_id.is_none()
    }

    fn ensure_open(&self) -> Result<(), SpanError> {
        if self.is_closed() {
            Err(SpanError::InvalidState(self.span_id))
        } else {
            Ok(())
        }
    }

    /// Record an input value. Valid only while the span is running.
    pub fn record_input(
        &mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), SpanError> {
        self.ensure_open()?;
        self.inputs.insert(key.into(), value);
        Ok(())
    }

    /// Record an output value. Valid only while the span is running.
    pub fn record_output(
        &mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), SpanError> {
        self.ensure_open()?;
        self.outputs.insert(key.into(), value);
        Ok(())
    }

    /// Append an LLM invocation record. Valid only while the span is running.
    pub fn add_llm_call(&mut self, call: LlmCall) -> Result<(), SpanError> {
        self.ensure_open()?;
        self.llm_calls.push(call);
        Ok(())
    }

    /// Close the span, freezing the record.
    ///
    /// Sets `end_time` and `duration_ms`, transitions `status` to the given
    /// terminal value, and attaches `error` when present. A second close
    /// (or a non-terminal target status) fails with an invalid-state error.
    pub(crate) fn close(
        &mut self,
        status: SpanStatus,
        error: Option<ErrorInfo>,
    ) -> Result<(), SpanError> {
        self.ensure_open()?;
        if !status.is_terminal() {
            return Err(SpanError::InvalidState(self.span_id));
        }

        let now = Utc::now();
        self.status = status;
        self.end_time = Some(now);
        self.duration_ms = Some((now - self.start_time).num_milliseconds().max(0) as u64);
        if status == SpanStatus::Error {
            self.error = error;
        }
        Ok(())
    }

    /// Merge a map of output values just before close.
    pub(crate) fn merge_outputs(&mut self, outputs: HashMap<String, serde_json::Value>) {
        self.outputs.extend(outputs);
    }

    /// Total tokens across all recorded LLM calls.
    pub fn total_tokens(&self) -> u64 {
        self.llm_calls
            .iter()
            .map(|c| c.total_tokens() as u64)
            .sum()
    }

    /// Total cost in USD across all recorded LLM calls.
    pub fn total_cost_usd(&self) -> f64 {
        self.llm_calls.iter().filter_map(|c| c.cost_usd).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_span() -> Span {
        Span::new("step", SpanType::AgentDecision, TraceId::new(), None)
    }

    #[test]
    fn test_new_span_is_running_root() {
        let span = open_span();
        assert_eq!(span.status, SpanStatus::Running);
        assert!(span.is_root());
        assert!(!span.is_closed());
        assert!(span.end_time.is_none());
    }

    #[test]
    fn test_record_while_open() {
        let mut span = open_span();
        span.record_input("query", json!("list files")).unwrap();
        span.record_output("result", json!(["a.rs", "b.rs"])).unwrap();
        span.add_llm_call(LlmCall::new("gpt-4o", "p", "r")).unwrap();

        assert_eq!(span.inputs.len(), 1);
        assert_eq!(span.outputs.len(), 1);
        assert_eq!(span.llm_calls.len(), 1);
    }

    #[test]
    fn test_close_success() {
        let mut span = open_span();
        span.close(SpanStatus::Success, None).unwrap();

        assert_eq!(span.status, SpanStatus::Success);
        assert!(span.end_time.is_some());
        assert!(span.end_time.unwrap() >= span.start_time);
        assert!(span.duration_ms.is_some());
        assert!(span.error.is_none());
    }

    #[test]
    fn test_close_error_records_error() {
        let mut span = open_span();
        span.close(
            SpanStatus::Error,
            Some(ErrorInfo::new("Timeout", "tool timed out")),
        )
        .unwrap();

        assert_eq!(span.status, SpanStatus::Error);
        assert_eq!(span.error.as_ref().unwrap().message, "tool timed out");
    }

    #[test]
    fn test_double_close_fails() {
        let mut span = open_span();
        span.close(SpanStatus::Success, None).unwrap();

        let err = span.close(SpanStatus::Success, None).unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[test]
    fn test_mutate_after_close_fails() {
        let mut span = open_span();
        span.close(SpanStatus::Success, None).unwrap();

        assert!(span.record_input("k", json!(1)).unwrap_err().is_invalid_state());
        assert!(span.record_output("k", json!(1)).unwrap_err().is_invalid_state());
        assert!(span
            .add_llm_call(LlmCall::new("m", "p", "r"))
            .unwrap_err()
            .is_invalid_state());
    }

    #[test]
    fn test_close_rejects_running_status() {
        let mut span = open_span();
        let err = span.close(SpanStatus::Running, None).unwrap_err();
        assert!(err.is_invalid_state());
        // Span stays open after the rejected close.
        assert!(!span.is_closed());
    }

    #[test]
    fn test_token_and_cost_totals() {
        let mut span = open_span();
        span.add_llm_call(LlmCall::new("m", "p", "r").with_tokens(100, 20).with_cost_usd(0.01))
            .unwrap();
        span.add_llm_call(LlmCall::new("m", "p", "r").with_tokens(50, 10))
            .unwrap();

        assert_eq!(span.total_tokens(), 180);
        assert!((span.total_cost_usd() - 0.01).abs() < f64::EPSILON);
    }

    #[test]
    fn test_json_round_trip() {
        let mut span = Span::new("tool", SpanType::ToolCall, TraceId::new(), Some(SpanId::new()));
        span.agent_id = Some("researcher".to_string());
        span.record_input("path", json!("/tmp")).unwrap();
        span.add_llm_call(LlmCall::new("claude-sonnet-4", "p", "r").with_tokens(10, 5))
            .unwrap();
        span.close(SpanStatus::Success, None).unwrap();

        let json = serde_json::to_string(&span).unwrap();
        let parsed: Span = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.span_id, span.span_id);
        assert_eq!(parsed.trace_id, span.trace_id);
        assert_eq!(parsed.parent_span_id, span.parent_span_id);
        assert_eq!(parsed.agent_id.as_deref(), Some("researcher"));
        assert_eq!(parsed.llm_calls.len(), 1);
        assert_eq!(parsed.status, SpanStatus::Success);
    }
}
