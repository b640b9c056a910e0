// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable span persistence and the query contract.
//!
//! Storage is pluggable behind the [`TraceStore`] trait: the exporter
//! writes batches of closed spans through it, and the visualization layer
//! reads assembled trace trees and paginated summaries back out. The
//! default backend is SQLite; an in-memory backend is provided for tests
//! and short-lived embedding.

mod memory;
mod sqlite;
mod tree;
mod types;

pub use memory::MemoryTraceStore;
pub use sqlite::{get_trace_directory, SqliteTraceStore};
pub use tree::assemble_tree;
pub use types::{Page, SpanNode, TraceFilter, TraceSummary, TraceTree};

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::span::Span;
use crate::types::TraceId;

/// Contract every storage backend must satisfy.
///
/// Implementations must be safe to call concurrently from the exporter's
/// batch path and query readers. `append` must be idempotent under retried
/// writes of the same `span_id`; the required resolution is deterministic
/// last-write-wins.
pub trait TraceStore: Send + Sync {
    /// Durably persist one closed span.
    fn append(&self, span: &Span) -> Result<(), StoreError>;

    /// Persist a batch of closed spans. The default implementation loops
    /// [`TraceStore::append`]; backends with transactions should override.
    fn append_batch(&self, spans: &[Span]) -> Result<(), StoreError> {
        for span in spans {
            self.append(span)?;
        }
        Ok(())
    }

    /// Return every span recorded for `trace_id`, assembled into a tree.
    ///
    /// Spans whose parent is missing (e.g., dropped under backpressure)
    /// appear as synthetic roots rather than failing assembly. Fails with
    /// [`StoreError::NotFound`] only when no spans exist for the id.
    fn get_trace(&self, trace_id: TraceId) -> Result<TraceTree, StoreError>;

    /// List trace summaries matching `filter`, newest trace first.
    fn list_traces(&self, filter: &TraceFilter, page: &Page)
        -> Result<Vec<TraceSummary>, StoreError>;

    /// Remove all traces whose root span started before `cutoff`.
    /// Returns the number of spans removed.
    fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}
