// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The tracer core: opening and closing spans.
//!
//! One [`Tracer`] instance owns the export pipeline and (optionally) the
//! retention sweeper for a process. Construct it at startup, share it by
//! reference or install it with [`init_global`], and call
//! [`Tracer::shutdown`] on the way out so the final flush runs.
//!
//! `start_span`/`end_span` are synchronous and never perform I/O; all
//! persistence happens on the exporter's background task.

mod scope;

pub use scope::SpanGuard;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::OnceCell;

use crate::config::TracerConfig;
use crate::context::{self, ActiveSpan};
use crate::error::{ExportError, SpanError};
use crate::export::{BatchExporter, ExporterStatsSnapshot};
use crate::retention::RetentionTask;
use crate::span::Span;
use crate::store::TraceStore;
use crate::types::{ErrorInfo, LlmCall, SpanId, SpanStatus, SpanType, TraceId};

/// Handle to an open span.
///
/// The handle owns the span record between open and close. It is the only
/// way to mutate the record, and closing it (through the tracer) hands the
/// record off to the exporter.
pub struct SpanHandle {
    span_id: SpanId,
    trace_id: TraceId,
    /// Whether the span sits on this context's LIFO stack. Detached spans
    /// (explicit parentage) skip the stack and its nesting check.
    pub(crate) attached: bool,
    span: Option<Span>,
}

impl SpanHandle {
    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// Whether the span has already been closed through this handle.
    pub fn is_closed(&self) -> bool {
        self.span.is_none()
    }

    fn span_mut(&mut self) -> Result<&mut Span, SpanError> {
        self.span
            .as_mut()
            .ok_or(SpanError::InvalidState(self.span_id))
    }

    /// Record an input value. Valid only while the span is open.
    pub fn record_input(
        &mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), SpanError> {
        self.span_mut()?.record_input(key, value)
    }

    /// Record an output value. Valid only while the span is open.
    pub fn record_output(
        &mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), SpanError> {
        self.span_mut()?.record_output(key, value)
    }

    /// Append an LLM invocation record. Valid only while the span is open.
    pub fn add_llm_call(&mut self, call: LlmCall) -> Result<(), SpanError> {
        self.span_mut()?.add_llm_call(call)
    }
}

/// The tracing engine.
pub struct Tracer {
    store: Arc<dyn TraceStore>,
    exporter: BatchExporter,
    retention: Mutex<Option<RetentionTask>>,
    agent_id: Option<String>,
    shutdown_timeout: Duration,
}

impl Tracer {
    /// Create a tracer writing to `store`.
    ///
    /// Spawns the export consumer (and the retention sweeper when
    /// `config.retention_days` is set), so this must be called from within
    /// a tokio runtime.
    pub fn new(store: Arc<dyn TraceStore>, config: TracerConfig) -> Self {
        let exporter = BatchExporter::start(Arc::clone(&store), &config);
        let retention = config.retention_days.map(|days| {
            RetentionTask::start(Arc::clone(&store), days, config.retention_sweep_interval)
        });

        Self {
            store,
            exporter,
            retention: Mutex::new(retention),
            agent_id: config.agent_id,
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    /// The store this tracer writes to; the query API for trace viewers.
    pub fn store(&self) -> &Arc<dyn TraceStore> {
        &self.store
    }

    /// Open a span as a child of this context's innermost open span.
    ///
    /// A new trace id is generated when no span is active. The span is
    /// pushed onto the context stack and must be ended in LIFO order.
    pub fn start_span(&self, name: &str, span_type: SpanType) -> SpanHandle {
        self.start_span_with_inputs(name, span_type, HashMap::new())
    }

    /// [`Tracer::start_span`] with inputs captured at open time.
    pub fn start_span_with_inputs(
        &self,
        name: &str,
        span_type: SpanType,
        inputs: HashMap<String, serde_json::Value>,
    ) -> SpanHandle {
        let (trace_id, parent_span_id) = match context::current() {
            Some(active) => (active.trace_id, Some(active.span_id)),
            None => (TraceId::new(), None),
        };

        let mut span = Span::new(name, span_type, trace_id, parent_span_id);
        span.agent_id = self.agent_id.clone();
        span.inputs = inputs;

        context::push(ActiveSpan {
            span_id: span.span_id,
            trace_id,
        });

        SpanHandle {
            span_id: span.span_id,
            trace_id,
            attached: true,
            span: Some(span),
        }
    }

    /// Open a span with explicit parentage, bypassing the context stack.
    ///
    /// For producers whose events arrive on arbitrary threads (framework
    /// callback adapters). Detached spans are exempt from the LIFO nesting
    /// check and may be ended from any context.
    pub fn start_span_detached(
        &self,
        name: &str,
        span_type: SpanType,
        trace_id: TraceId,
        parent_span_id: Option<SpanId>,
    ) -> SpanHandle {
        let mut span = Span::new(name, span_type, trace_id, parent_span_id);
        span.agent_id = self.agent_id.clone();

        SpanHandle {
            span_id: span.span_id,
            trace_id,
            attached: false,
            span: Some(span),
        }
    }

    /// Close a span and submit it for export.
    ///
    /// Fails with an invalid-state error if the handle was already closed
    /// (or `status` is not terminal), and with a nesting error if the span
    /// is attached but not the top of this context's stack. On a nesting
    /// failure the span stays open and the stack is untouched.
    pub fn end_span(
        &self,
        handle: &mut SpanHandle,
        status: SpanStatus,
        outputs: Option<HashMap<String, serde_json::Value>>,
        error: Option<ErrorInfo>,
    ) -> Result<(), SpanError> {
        if handle.is_closed() || !status.is_terminal() {
            return Err(SpanError::InvalidState(handle.span_id));
        }
        if handle.attached {
            context::pop(handle.span_id)?;
        }

        let mut span = handle
            .span
            .take()
            .ok_or(SpanError::InvalidState(handle.span_id))?;
        if let Some(outputs) = outputs {
            span.merge_outputs(outputs);
        }
        span.close(status, error)?;
        self.exporter.submit(span);
        Ok(())
    }

    /// Close a span with status success and no outputs.
    pub fn end_span_ok(&self, handle: &mut SpanHandle) -> Result<(), SpanError> {
        self.end_span(handle, SpanStatus::Success, None, None)
    }

    /// Close a span with status error.
    pub fn end_span_error(
        &self,
        handle: &mut SpanHandle,
        error: ErrorInfo,
    ) -> Result<(), SpanError> {
        self.end_span(handle, SpanStatus::Error, None, Some(error))
    }

    /// Append an LLM invocation record to an open span.
    pub fn record_llm_call(
        &self,
        handle: &mut SpanHandle,
        call: LlmCall,
    ) -> Result<(), SpanError> {
        handle.add_llm_call(call)
    }

    /// Open a scoped span that closes itself on every exit path.
    pub fn span(&self, name: &str, span_type: SpanType) -> SpanGuard<'_> {
        SpanGuard::new(self, name, span_type)
    }

    /// Export pipeline counters.
    pub fn stats(&self) -> ExporterStatsSnapshot {
        self.exporter.stats()
    }

    /// Push everything currently queued through to the store.
    pub async fn flush(&self) -> Result<(), ExportError> {
        self.exporter.flush(self.shutdown_timeout).await
    }

    /// Stop the retention sweeper and shut the exporter down after a final
    /// bounded flush.
    pub async fn shutdown(&self) -> Result<(), ExportError> {
        let retention = self
            .retention
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = retention {
            task.stop();
        }
        self.exporter.shutdown(self.shutdown_timeout).await
    }
}

static GLOBAL_TRACER: OnceCell<Tracer> = OnceCell::new();

/// Install the process-wide tracer instance.
///
/// Returns `false` (and drops the new tracer's pipeline) if one was
/// already installed; the first installation wins.
pub fn init_global(tracer: Tracer) -> bool {
    GLOBAL_TRACER.set(tracer).is_ok()
}

/// The process-wide tracer, if one has been installed.
pub fn global() -> Option<&'static Tracer> {
    GLOBAL_TRACER.get()
}
