// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the tracer.
//!
//! This module provides strongly-typed errors for the producer API, the
//! storage layer, and the export pipeline, using `thiserror` for ergonomic
//! error definitions and `anyhow` for error propagation.
//!
//! Producer-API errors ([`SpanError`]) are programming errors and propagate
//! synchronously to the caller. Storage and export errors are operational:
//! they are logged and counted but never surface to instrumented code.

use thiserror::Error;

use crate::types::{SpanId, TraceId};

/// Errors raised by the producer API (start/end/record operations).
#[derive(Error, Debug)]
pub enum SpanError {
    /// The span is already closed; mutation or a second close is not allowed.
    #[error("Invalid state: span {0} is closed")]
    InvalidState(SpanId),

    /// The span being closed is not the top of its context's active stack.
    #[error("Out-of-order close for span {found}: top of stack is {expected:?}")]
    Nesting {
        /// Span the caller attempted to close.
        found: SpanId,
        /// Current top of the active stack, if any.
        expected: Option<SpanId>,
    },
}

impl SpanError {
    /// Check if this is an invalid-state error (closed-span mutation, double close).
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState(_))
    }

    /// Check if this is a nesting error (out-of-order close).
    pub fn is_nesting(&self) -> bool {
        matches!(self, Self::Nesting { .. })
    }
}

/// Errors raised by trace store implementations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("No spans recorded for trace {0}")]
    NotFound(TraceId),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl StoreError {
    /// Check if this error means the trace simply does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if a retried write could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Io(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Errors raised by the export pipeline.
///
/// None of these ever reach instrumented code: `submit` absorbs capacity
/// failures into counters, and flush/shutdown errors go to whoever tears
/// the tracer down.
#[derive(Error, Debug)]
pub enum ExportError {
    /// The bounded queue was full and a span was dropped.
    #[error("Export queue at capacity; span dropped")]
    CapacityExceeded,

    /// The exporter has already shut down.
    #[error("Exporter is shut down")]
    Closed,

    /// A flush did not complete within its deadline.
    #[error("Flush timed out after {0}ms")]
    FlushTimeout(u64),
}

/// Result type alias using anyhow for flexible error handling.
pub type Result<T> = anyhow::Result<T>;
