// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Query-side types: trace trees, summaries, filters, pagination.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::span::Span;
use crate::types::{SpanStatus, TraceId};

/// One span with its children nested beneath it.
///
/// The nested-`children` shape, not a flat span list, is the contract the
/// visualization layer renders from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanNode {
    #[serde(flatten)]
    pub span: Span,
    pub children: Vec<SpanNode>,
}

impl SpanNode {
    /// Leaf node around a single span.
    pub fn leaf(span: Span) -> Self {
        Self {
            span,
            children: Vec::new(),
        }
    }

    /// Number of spans in this subtree, including this one.
    pub fn span_count(&self) -> usize {
        1 + self.children.iter().map(SpanNode::span_count).sum::<usize>()
    }
}

/// A fully assembled trace: every span sharing one trace id.
///
/// `roots` holds the span(s) with no parent plus any orphans whose parent
/// was never recorded (synthetic roots).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceTree {
    pub trace_id: TraceId,
    pub roots: Vec<SpanNode>,
}

impl TraceTree {
    /// Total number of spans in the trace.
    pub fn span_count(&self) -> usize {
        self.roots.iter().map(SpanNode::span_count).sum()
    }

    /// Best-effort completion check: true once no span is still running.
    pub fn is_complete(&self) -> bool {
        fn walk(node: &SpanNode) -> bool {
            node.span.status.is_terminal() && node.children.iter().all(walk)
        }
        self.roots.iter().all(walk)
    }
}

/// Filter for [`TraceStore::list_traces`](super::TraceStore::list_traces).
#[derive(Debug, Clone, Default)]
pub struct TraceFilter {
    /// Only traces containing a span with this agent id.
    pub agent_id: Option<String>,
    /// Only traces that started at or after this instant.
    pub started_after: Option<DateTime<Utc>>,
    /// Only traces that started at or before this instant.
    pub started_before: Option<DateTime<Utc>>,
    /// Only traces with this derived status.
    pub status: Option<SpanStatus>,
}

impl TraceFilter {
    /// Filter by agent id.
    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Filter by trace start range (either bound optional).
    pub fn with_time_range(
        mut self,
        after: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
    ) -> Self {
        self.started_after = after;
        self.started_before = before;
        self
    }

    /// Filter by derived trace status.
    pub fn with_status(mut self, status: SpanStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// Pagination window for trace listings.
#[derive(Debug, Clone)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

impl Page {
    /// A window of `limit` entries starting at `offset`.
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: limit.max(1),
        }
    }
}

/// One row in a trace listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSummary {
    pub trace_id: TraceId,
    /// Name of the trace's earliest span.
    pub root_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Derived status: running while any span runs, error if any span
    /// errored, success otherwise.
    pub status: SpanStatus,
    pub started_at: DateTime<Utc>,
    /// Latest end time; `None` while any span is still running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub span_count: u64,
    pub llm_call_count: u64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
}

/// Derive a trace-level status from per-span counts.
pub(crate) fn derive_status(running: u64, errored: u64) -> SpanStatus {
    if running > 0 {
        SpanStatus::Running
    } else if errored > 0 {
        SpanStatus::Error
    } else {
        SpanStatus::Success
    }
}
