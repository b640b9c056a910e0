// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The seam framework adapters build on.
//!
//! Framework shims (LangChain-style callback handlers and the like)
//! translate their callback events into the producer API. They implement
//! [`StepCallbacks`] — or reuse [`CallbackAdapter`], which does the
//! run-id bookkeeping for any framework that reports start/end/llm events
//! keyed by a run identifier. Adapters hold no privilege over the core:
//! everything here goes through the same public producer API.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::tracer::{SpanHandle, Tracer};
use crate::types::{ErrorInfo, LlmCall, SpanType};

/// Capability set a framework adapter implements.
///
/// Implementations must never panic into the host framework; event
/// mismatches (unknown run ids, duplicate starts) are operational noise to
/// be logged, not surfaced.
pub trait StepCallbacks: Send + Sync {
    /// A framework step began.
    fn on_step_start(
        &self,
        run_id: &str,
        parent_run_id: Option<&str>,
        name: &str,
        span_type: SpanType,
        inputs: HashMap<String, serde_json::Value>,
    );

    /// A framework step finished, successfully or not.
    fn on_step_end(
        &self,
        run_id: &str,
        outputs: Option<HashMap<String, serde_json::Value>>,
        error: Option<ErrorInfo>,
    );

    /// The framework reported an LLM invocation inside a step.
    fn on_llm_call(&self, run_id: &str, call: LlmCall);
}

/// Generic translator from run-id-keyed callback events to spans.
///
/// Framework callbacks can arrive on any thread, so spans are opened
/// detached with parentage resolved through the run-id table rather than
/// the ambient context stack.
pub struct CallbackAdapter {
    tracer: Arc<Tracer>,
    open: Mutex<HashMap<String, SpanHandle>>,
}

impl CallbackAdapter {
    /// Create an adapter feeding the given tracer.
    pub fn new(tracer: Arc<Tracer>) -> Self {
        Self {
            tracer,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Number of steps currently open.
    pub fn open_steps(&self) -> usize {
        self.lock_open().len()
    }

    fn lock_open(&self) -> std::sync::MutexGuard<'_, HashMap<String, SpanHandle>> {
        self.open.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StepCallbacks for CallbackAdapter {
    fn on_step_start(
        &self,
        run_id: &str,
        parent_run_id: Option<&str>,
        name: &str,
        span_type: SpanType,
        inputs: HashMap<String, serde_json::Value>,
    ) {
        let mut open = self.lock_open();
        if open.contains_key(run_id) {
            warn!(run_id, "Duplicate step start; keeping the original span");
            return;
        }

        let parent = parent_run_id.and_then(|id| open.get(id));
        let (trace_id, parent_span_id) = match parent {
            Some(handle) => (handle.trace_id(), Some(handle.span_id())),
            None => (crate::types::TraceId::new(), None),
        };

        let mut handle = self
            .tracer
            .start_span_detached(name, span_type, trace_id, parent_span_id);
        for (key, value) in inputs {
            // Span just opened; recording cannot fail.
            let _ = handle.record_input(key, value);
        }
        open.insert(run_id.to_string(), handle);
    }

    fn on_step_end(
        &self,
        run_id: &str,
        outputs: Option<HashMap<String, serde_json::Value>>,
        error: Option<ErrorInfo>,
    ) {
        let handle = self.lock_open().remove(run_id);
        let Some(mut handle) = handle else {
            warn!(run_id, "Step end for unknown run id; ignoring");
            return;
        };

        let status = if error.is_some() {
            crate::types::SpanStatus::Error
        } else {
            crate::types::SpanStatus::Success
        };
        if let Err(err) = self.tracer.end_span(&mut handle, status, outputs, error) {
            warn!(run_id, error = %err, "Failed to close step span");
        }
    }

    fn on_llm_call(&self, run_id: &str, call: LlmCall) {
        let mut open = self.lock_open();
        let Some(handle) = open.get_mut(run_id) else {
            warn!(run_id, "LLM call for unknown run id; ignoring");
            return;
        };
        if let Err(err) = handle.add_llm_call(call) {
            warn!(run_id, error = %err, "Failed to record LLM call");
        }
    }
}
