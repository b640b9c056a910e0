// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Spantrail - framework-agnostic execution tracing for AI agents.
//!
//! Spantrail records hierarchical spans for the steps an agent takes
//! (decisions, tool calls, LLM invocations), correlates them into trace
//! trees, persists them off the hot path, and serves them back to trace
//! viewers through a storage-agnostic query contract.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`types`] - Core type definitions (SpanId, TraceId, SpanType, LlmCall, ...)
//! - [`error`] - Error types and result aliases
//! - [`span`] - The span record: append-only while open, immutable once closed
//! - [`context`] - Per-context active-span stacks with copy-on-fork snapshots
//! - [`tracer`] - The tracing engine: start/end spans, scoped spans, global instance
//! - [`export`] - Bounded-queue batching exporter that never blocks producers
//! - [`store`] - Pluggable persistence (SQLite default) and the trace query API
//! - [`adapters`] - The callback seam framework shims build on
//! - [`retention`] - Age-based trace deletion
//! - [`config`] - Tracer configuration
//! - [`logging`] - Optional tracing-subscriber bootstrap
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use spantrail::config::TracerConfig;
//! use spantrail::store::SqliteTraceStore;
//! use spantrail::tracer::Tracer;
//! use spantrail::types::{LlmCall, SpanType};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = Arc::new(SqliteTraceStore::open(".")?);
//! let tracer = Tracer::new(store, TracerConfig::default());
//!
//! let mut span = tracer.start_span("plan_next_step", SpanType::AgentDecision);
//! tracer.record_llm_call(
//!     &mut span,
//!     LlmCall::new("claude-sonnet-4", "What next?", "Read the config.")
//!         .with_tokens(220, 18),
//! )?;
//! tracer.end_span_ok(&mut span)?;
//!
//! tracer.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod config;
pub mod context;
pub mod error;
pub mod export;
pub mod logging;
pub mod retention;
pub mod span;
pub mod store;
pub mod tracer;
pub mod types;

// Re-export commonly used types at crate root
pub use config::TracerConfig;
pub use context::{ContextSnapshot, TraceFutureExt};
pub use error::{ExportError, Result, SpanError, StoreError};
pub use span::Span;
pub use store::{
    MemoryTraceStore, Page, SpanNode, SqliteTraceStore, TraceFilter, TraceStore, TraceSummary,
    TraceTree,
};
pub use tracer::{global, init_global, SpanGuard, SpanHandle, Tracer};
pub use types::{ErrorInfo, LlmCall, SpanId, SpanStatus, SpanType, TraceId};

/// Spantrail version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
