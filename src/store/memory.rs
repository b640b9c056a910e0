// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-memory trace store.
//!
//! Satisfies the same contract as the SQLite backend without touching
//! disk. Used in tests and by hosts that only need traces for the
//! lifetime of the process.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::span::Span;
use crate::types::{SpanId, SpanStatus, TraceId};

use super::tree::assemble_tree;
use super::types::{derive_status, Page, TraceFilter, TraceSummary, TraceTree};
use super::TraceStore;

/// Trace storage backed by a process-local map.
#[derive(Debug, Default)]
pub struct MemoryTraceStore {
    spans: RwLock<HashMap<SpanId, Span>>,
}

impl MemoryTraceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of spans currently held.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the store holds no spans.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<SpanId, Span>> {
        self.spans.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<SpanId, Span>> {
        self.spans.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl TraceStore for MemoryTraceStore {
    fn append(&self, span: &Span) -> Result<(), StoreError> {
        // Last write wins, matching the SQLite backend.
        self.write().insert(span.span_id, span.clone());
        Ok(())
    }

    fn get_trace(&self, trace_id: TraceId) -> Result<TraceTree, StoreError> {
        let spans: Vec<Span> = self
            .read()
            .values()
            .filter(|s| s.trace_id == trace_id)
            .cloned()
            .collect();

        if spans.is_empty() {
            return Err(StoreError::NotFound(trace_id));
        }
        Ok(assemble_tree(trace_id, spans))
    }

    fn list_traces(
        &self,
        filter: &TraceFilter,
        page: &Page,
    ) -> Result<Vec<TraceSummary>, StoreError> {
        let spans = self.read();

        let mut by_trace: HashMap<TraceId, Vec<&Span>> = HashMap::new();
        for span in spans.values() {
            by_trace.entry(span.trace_id).or_default().push(span);
        }

        let mut summaries: Vec<TraceSummary> = by_trace
            .into_iter()
            .filter_map(|(trace_id, members)| summarize(trace_id, &members))
            .filter(|summary| matches_filter(summary, filter))
            .collect();

        summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(summaries
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect())
    }

    fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut spans = self.write();

        let mut trace_start: HashMap<TraceId, DateTime<Utc>> = HashMap::new();
        for span in spans.values() {
            let entry = trace_start.entry(span.trace_id).or_insert(span.start_time);
            if span.start_time < *entry {
                *entry = span.start_time;
            }
        }

        let doomed: std::collections::HashSet<TraceId> = trace_start
            .into_iter()
            .filter(|(_, started)| *started < cutoff)
            .map(|(trace_id, _)| trace_id)
            .collect();

        let before = spans.len();
        spans.retain(|_, span| !doomed.contains(&span.trace_id));
        Ok((before - spans.len()) as u64)
    }
}

fn summarize(trace_id: TraceId, members: &[&Span]) -> Option<TraceSummary> {
    let earliest = members.iter().min_by_key(|s| s.start_time)?;
    let running = members
        .iter()
        .filter(|s| s.status == SpanStatus::Running)
        .count() as u64;
    let errored = members
        .iter()
        .filter(|s| s.status == SpanStatus::Error)
        .count() as u64;

    let ended_at = if running > 0 {
        None
    } else {
        members.iter().filter_map(|s| s.end_time).max()
    };

    Some(TraceSummary {
        trace_id,
        root_name: earliest.name.clone(),
        agent_id: members
            .iter()
            .filter_map(|s| s.agent_id.clone())
            .next(),
        status: derive_status(running, errored),
        started_at: earliest.start_time,
        ended_at,
        span_count: members.len() as u64,
        llm_call_count: members.iter().map(|s| s.llm_calls.len() as u64).sum(),
        total_tokens: members.iter().map(|s| s.total_tokens()).sum(),
        total_cost_usd: members.iter().map(|s| s.total_cost_usd()).sum(),
    })
}

fn matches_filter(summary: &TraceSummary, filter: &TraceFilter) -> bool {
    if let Some(agent) = &filter.agent_id {
        if summary.agent_id.as_deref() != Some(agent.as_str()) {
            return false;
        }
    }
    if let Some(after) = filter.started_after {
        if summary.started_at < after {
            return false;
        }
    }
    if let Some(before) = filter.started_before {
        if summary.started_at > before {
            return false;
        }
    }
    if let Some(status) = filter.status {
        if summary.status != status {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SpanType;

    fn closed_span(name: &str, trace_id: TraceId, parent: Option<SpanId>) -> Span {
        let mut span = Span::new(name, SpanType::ToolCall, trace_id, parent);
        span.close(SpanStatus::Success, None).unwrap();
        span
    }

    #[test]
    fn test_append_and_get() {
        let store = MemoryTraceStore::new();
        let trace_id = TraceId::new();
        let root = closed_span("root", trace_id, None);
        let child = closed_span("child", trace_id, Some(root.span_id));

        store.append(&root).unwrap();
        store.append(&child).unwrap();

        let tree = store.get_trace(trace_id).unwrap();
        assert_eq!(tree.roots.len(), 1);
        assert_eq!(tree.roots[0].children.len(), 1);
    }

    #[test]
    fn test_not_found() {
        let store = MemoryTraceStore::new();
        assert!(store.get_trace(TraceId::new()).unwrap_err().is_not_found());
    }

    #[test]
    fn test_idempotent_append() {
        let store = MemoryTraceStore::new();
        let trace_id = TraceId::new();
        let mut span = closed_span("first", trace_id, None);
        store.append(&span).unwrap();
        span.name = "second".to_string();
        store.append(&span).unwrap();

        assert_eq!(store.len(), 1);
        let tree = store.get_trace(trace_id).unwrap();
        assert_eq!(tree.roots[0].span.name, "second");
    }

    #[test]
    fn test_list_ordering_and_pagination() {
        let store = MemoryTraceStore::new();
        let mut ids = Vec::new();
        for i in 0..4 {
            let trace_id = TraceId::new();
            let mut span = closed_span(&format!("run-{}", i), trace_id, None);
            span.start_time = Utc::now() + chrono::Duration::milliseconds(i);
            store.append(&span).unwrap();
            ids.push(trace_id);
        }

        let all = store
            .list_traces(&TraceFilter::default(), &Page::default())
            .unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].trace_id, ids[3]);

        let paged = store
            .list_traces(&TraceFilter::default(), &Page::new(1, 2))
            .unwrap();
        assert_eq!(paged.len(), 2);
        assert_eq!(paged[0].trace_id, ids[2]);
    }

    #[test]
    fn test_delete_before() {
        let store = MemoryTraceStore::new();

        let old_trace = TraceId::new();
        let mut old = closed_span("old", old_trace, None);
        old.start_time = Utc::now() - chrono::Duration::days(10);
        store.append(&old).unwrap();

        let fresh_trace = TraceId::new();
        store.append(&closed_span("fresh", fresh_trace, None)).unwrap();

        let removed = store
            .delete_before(Utc::now() - chrono::Duration::days(1))
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_trace(old_trace).is_err());
        assert!(store.get_trace(fresh_trace).is_ok());
    }
}
