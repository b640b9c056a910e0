// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Core type definitions shared across the tracer.
//!
//! Identifiers are UUIDv7 so they sort by creation time without a separate
//! sequence counter; storage backends rely on this for ordering.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unique identifier for a single span.
///
/// Generated at span-open time and never supplied by the caller.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanId(Uuid);

impl SpanId {
    /// Generate a new time-ordered span ID.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Create a span ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Get a short representation (first 8 characters).
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for SpanId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpanId({})", self.short())
    }
}

impl From<Uuid> for SpanId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<SpanId> for Uuid {
    fn from(id: SpanId) -> Self {
        id.0
    }
}

impl serde::Serialize for SpanId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for SpanId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Uuid::deserialize(deserializer).map(Self)
    }
}

/// Identifier shared by every span in one logical run.
///
/// Inherited from the active context, or newly generated for root spans.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(Uuid);

impl TraceId {
    /// Generate a new time-ordered trace ID.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Create a trace ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Get a short representation (first 8 characters).
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId({})", self.short())
    }
}

impl From<Uuid> for TraceId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Kind of work a span represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanType {
    /// An agent reasoning/decision step.
    AgentDecision,
    /// A tool invocation.
    ToolCall,
    /// A direct LLM invocation traced as its own span.
    LlmCall,
    /// A retrieval/search step.
    Retrieval,
    /// A planning step.
    Planning,
    /// Anything else.
    Custom,
}

impl SpanType {
    /// Stable string form used on the wire and in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentDecision => "agent_decision",
            Self::ToolCall => "tool_call",
            Self::LlmCall => "llm_call",
            Self::Retrieval => "retrieval",
            Self::Planning => "planning",
            Self::Custom => "custom",
        }
    }

    /// Parse the stable string form; unknown tags map to `Custom`.
    pub fn parse(s: &str) -> Self {
        match s {
            "agent_decision" => Self::AgentDecision,
            "tool_call" => Self::ToolCall,
            "llm_call" => Self::LlmCall,
            "retrieval" => Self::Retrieval,
            "planning" => Self::Planning,
            _ => Self::Custom,
        }
    }
}

/// Status of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    /// Span is open and may still be mutated.
    Running,
    /// Closed without error.
    Success,
    /// Closed with a recorded error.
    Error,
}

impl SpanStatus {
    /// Whether this status marks a closed span.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Stable string form used on the wire and in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    /// Parse the stable string form; unknown tags map to `Error`.
    pub fn parse(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "success" => Self::Success,
            _ => Self::Error,
        }
    }
}

/// One LLM invocation recorded inside a span.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCall {
    /// Model identifier (e.g., "claude-sonnet-4", "gpt-4o").
    pub model: String,
    /// Prompt sent to the model.
    pub prompt: String,
    /// Response received from the model.
    pub response: String,
    /// Number of tokens in the prompt.
    pub input_tokens: u32,
    /// Number of tokens in the completion.
    pub output_tokens: u32,
    /// Round-trip latency in milliseconds.
    pub latency_ms: u64,
    /// Cost in USD, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    /// When the call was recorded.
    pub recorded_at: DateTime<Utc>,
}

impl LlmCall {
    /// Create a record with the required fields; fill the rest with builders.
    pub fn new(
        model: impl Into<String>,
        prompt: impl Into<String>,
        response: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            response: response.into(),
            input_tokens: 0,
            output_tokens: 0,
            latency_ms: 0,
            cost_usd: None,
            recorded_at: Utc::now(),
        }
    }

    /// Set token counts.
    pub fn with_tokens(mut self, input: u32, output: u32) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    /// Set round-trip latency.
    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Set cost in USD.
    pub fn with_cost_usd(mut self, cost: f64) -> Self {
        self.cost_usd = Some(cost);
        self
    }

    /// Get total tokens (input + output).
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// Structured error captured on a failed span.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error kind; for captured Rust errors this is the error's type name.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Optional stack/backtrace text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorInfo {
    /// Create an error record.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Attach stack/backtrace text.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Capture an application error by type name and display message.
    pub fn capture<E: fmt::Display>(err: &E) -> Self {
        Self {
            kind: std::any::type_name::<E>().to_string(),
            message: err.to_string(),
            stack: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_id_unique() {
        let a = SpanId::new();
        let b = SpanId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_span_id_sorts_by_creation() {
        let ids: Vec<SpanId> = (0..32).map(|_| SpanId::new()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn test_span_id_short() {
        let id = SpanId::new();
        assert_eq!(id.short().len(), 8);
    }

    #[test]
    fn test_span_id_serde() {
        let id = SpanId::new();
        let json = serde_json::to_string(&id).unwrap();
        let parsed: SpanId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_trace_id_display() {
        let uuid = Uuid::parse_str("0190a1b2-0000-7000-8000-446655440000").unwrap();
        let id = TraceId::from_uuid(uuid);
        assert_eq!(id.to_string(), "0190a1b2-0000-7000-8000-446655440000");
    }

    #[test]
    fn test_span_type_round_trip() {
        for ty in [
            SpanType::AgentDecision,
            SpanType::ToolCall,
            SpanType::LlmCall,
            SpanType::Retrieval,
            SpanType::Planning,
            SpanType::Custom,
        ] {
            assert_eq!(SpanType::parse(ty.as_str()), ty);
        }
        assert_eq!(SpanType::parse("something_else"), SpanType::Custom);
    }

    #[test]
    fn test_span_status_terminal() {
        assert!(!SpanStatus::Running.is_terminal());
        assert!(SpanStatus::Success.is_terminal());
        assert!(SpanStatus::Error.is_terminal());
    }

    #[test]
    fn test_llm_call_builder() {
        let call = LlmCall::new("gpt-4o", "hello", "hi")
            .with_tokens(12, 3)
            .with_latency_ms(450)
            .with_cost_usd(0.0021);

        assert_eq!(call.total_tokens(), 15);
        assert_eq!(call.latency_ms, 450);
        assert_eq!(call.cost_usd, Some(0.0021));
    }

    #[test]
    fn test_error_info_capture() {
        let err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let info = ErrorInfo::capture(&err);
        assert!(info.kind.contains("Error"));
        assert_eq!(info.message, "boom");
        assert!(info.stack.is_none());
    }
}
