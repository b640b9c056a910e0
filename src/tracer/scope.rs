// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Scoped spans: close-on-every-exit-path semantics.
//!
//! [`SpanGuard`] is the RAII form; [`Tracer::in_span`] and
//! [`Tracer::in_span_async`] wrap a unit of work, set status from its
//! result, and re-propagate application errors unchanged. This is the only
//! place application errors are translated into trace data, and the
//! translation never swallows or alters them.

use std::fmt;
use std::future::Future;

use tracing::error;

use crate::context::{self, ContextSnapshot, TraceFutureExt};
use crate::error::SpanError;
use crate::types::{ErrorInfo, LlmCall, SpanStatus, SpanType};

use super::{SpanHandle, Tracer};

/// RAII guard that ends its span on drop.
///
/// Prefer [`SpanGuard::finish_with_result`] (or `finish_ok`/`finish_error`)
/// to set the status explicitly; a guard dropped without finishing closes
/// with status success, or status error if the thread is panicking.
pub struct SpanGuard<'a> {
    tracer: &'a Tracer,
    handle: SpanHandle,
}

impl<'a> SpanGuard<'a> {
    pub(super) fn new(tracer: &'a Tracer, name: &str, span_type: SpanType) -> Self {
        Self {
            tracer,
            handle: tracer.start_span(name, span_type),
        }
    }

    /// Mutable access to the underlying handle.
    pub fn handle_mut(&mut self) -> &mut SpanHandle {
        &mut self.handle
    }

    /// Record an input value on the open span.
    pub fn record_input(
        &mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), SpanError> {
        self.handle.record_input(key, value)
    }

    /// Record an output value on the open span.
    pub fn record_output(
        &mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), SpanError> {
        self.handle.record_output(key, value)
    }

    /// Append an LLM invocation record to the open span.
    pub fn add_llm_call(&mut self, call: LlmCall) -> Result<(), SpanError> {
        self.handle.add_llm_call(call)
    }

    /// Close with status success.
    pub fn finish_ok(mut self) -> Result<(), SpanError> {
        self.tracer.end_span_ok(&mut self.handle)
    }

    /// Close with status error.
    pub fn finish_error(mut self, error: ErrorInfo) -> Result<(), SpanError> {
        self.tracer.end_span_error(&mut self.handle, error)
    }

    /// Close with a status derived from `result`.
    pub fn finish_with_result<T, E: fmt::Display>(
        self,
        result: &Result<T, E>,
    ) -> Result<(), SpanError> {
        match result {
            Ok(_) => self.finish_ok(),
            Err(e) => self.finish_error(ErrorInfo::capture(e)),
        }
    }
}

impl Drop for SpanGuard<'_> {
    fn drop(&mut self) {
        if self.handle.is_closed() {
            return;
        }
        let (status, error) = if std::thread::panicking() {
            (
                SpanStatus::Error,
                Some(ErrorInfo::new("panic", "span dropped during panic")),
            )
        } else {
            (SpanStatus::Success, None)
        };
        if let Err(err) = self.tracer.end_span(&mut self.handle, status, None, error) {
            error!(error = %err, "Failed to close span on drop");
        }
    }
}

impl Tracer {
    /// Run `f` inside a span, setting status from its result.
    ///
    /// On `Err`, the error is captured onto the span and the `Err` is
    /// returned to the caller unchanged; tracing never alters application
    /// control flow. A panic inside `f` still closes the span (with an
    /// error status) on unwind.
    pub fn in_span<T, E, F>(&self, name: &str, span_type: SpanType, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut SpanHandle) -> Result<T, E>,
        E: fmt::Display,
    {
        let mut guard = self.span(name, span_type);
        let result = f(guard.handle_mut());
        if let Err(err) = guard.finish_with_result(&result) {
            error!(error = %err, "Failed to close span");
        }
        result
    }

    /// Async form of [`Tracer::in_span`].
    ///
    /// The span's context rides with the returned future, so spans opened
    /// inside `f` keep their parentage even when the task migrates between
    /// runtime threads.
    pub async fn in_span_async<T, E, F, Fut>(
        &self,
        name: &str,
        span_type: SpanType,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut handle = self.start_span(name, span_type);
        // Detach the frame from this thread; it travels with the future
        // via the captured snapshot instead.
        let child_ctx = ContextSnapshot::capture();
        let _ = context::pop(handle.span_id());
        handle.attached = false;

        let result = f().with_trace_context(child_ctx).await;

        let end_result = match &result {
            Ok(_) => self.end_span_ok(&mut handle),
            Err(e) => self.end_span_error(&mut handle, ErrorInfo::capture(e)),
        };
        if let Err(err) = end_result {
            error!(error = %err, "Failed to close span");
        }
        result
    }
}
