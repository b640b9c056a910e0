// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Active-span context propagation.
//!
//! Each execution context (thread or task) carries its own stack of open
//! spans, used only to derive parentage. Child contexts inherit a snapshot
//! of the parent's stack at fork time and never share mutations with it,
//! so concurrent units of work under one root trace cannot corrupt each
//! other's nesting.
//!
//! Nesting is strictly LIFO: popping a span that is not the top of the
//! stack fails loudly rather than silently reordering.

use std::cell::RefCell;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::SpanError;
use crate::types::{SpanId, TraceId};

/// One open span on an execution context's stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveSpan {
    pub span_id: SpanId,
    pub trace_id: TraceId,
}

thread_local! {
    static ACTIVE_STACK: RefCell<Vec<ActiveSpan>> = const { RefCell::new(Vec::new()) };
}

/// Get the innermost open span in this execution context, if any.
pub fn current() -> Option<ActiveSpan> {
    ACTIVE_STACK.with(|stack| stack.borrow().last().copied())
}

/// Current nesting depth in this execution context.
pub fn depth() -> usize {
    ACTIVE_STACK.with(|stack| stack.borrow().len())
}

/// Push a newly opened span onto this context's stack.
pub(crate) fn push(frame: ActiveSpan) {
    ACTIVE_STACK.with(|stack| stack.borrow_mut().push(frame));
}

/// Pop `span_id` off this context's stack.
///
/// Fails with a nesting error if `span_id` is not the top of the stack;
/// the stack is left untouched in that case.
pub(crate) fn pop(span_id: SpanId) -> Result<ActiveSpan, SpanError> {
    ACTIVE_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        match stack.last().copied() {
            Some(top) if top.span_id == span_id => {
                stack.pop();
                Ok(top)
            }
            top => Err(SpanError::Nesting {
                found: span_id,
                expected: top.map(|f| f.span_id),
            }),
        }
    })
}

/// Replace this context's stack, returning the previous one.
pub(crate) fn swap(frames: Vec<ActiveSpan>) -> Vec<ActiveSpan> {
    ACTIVE_STACK.with(|stack| std::mem::replace(&mut *stack.borrow_mut(), frames))
}

/// A copy of an execution context's active-span stack, taken at fork time.
///
/// Attach a snapshot in a child thread or task to give spans opened there
/// the right parent. Mutations made under the snapshot stay in the child
/// context (copy-on-fork).
#[derive(Debug, Clone, Default)]
pub struct ContextSnapshot {
    frames: Vec<ActiveSpan>,
}

impl ContextSnapshot {
    /// Capture the current context's stack.
    pub fn capture() -> Self {
        Self {
            frames: ACTIVE_STACK.with(|stack| stack.borrow().clone()),
        }
    }

    /// Whether the snapshot holds no open spans.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The innermost span in the snapshot, if any.
    pub fn active(&self) -> Option<ActiveSpan> {
        self.frames.last().copied()
    }

    /// Install this snapshot in the current execution context.
    ///
    /// The returned guard restores the previous stack when dropped; keep it
    /// alive for the duration of the forked work.
    pub fn attach(&self) -> ContextGuard {
        let prior = swap(self.frames.clone());
        ContextGuard {
            prior: Some(prior),
            _not_send: PhantomData,
        }
    }
}

/// Guard restoring the context stack that was active before an attach.
pub struct ContextGuard {
    prior: Option<Vec<ActiveSpan>>,
    // Must be dropped on the thread that created it.
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(prior) = self.prior.take() {
            let _ = swap(prior);
        }
    }
}

/// Future combinator that carries a context snapshot across polls.
///
/// Tokio tasks migrate between worker threads, so a plain thread-local
/// stack would lose the active spans mid-task. This wrapper installs the
/// snapshot before every poll and saves the (possibly mutated) stack back
/// afterwards, so spans opened inside the future keep their parentage no
/// matter which thread polls it.
pub struct TracedFuture<F> {
    inner: Pin<Box<F>>,
    frames: Vec<ActiveSpan>,
}

impl<F: Future> Future for TracedFuture<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Safe to get_mut: the inner future is boxed, so Self is Unpin.
        let this = self.get_mut();
        let prior = swap(std::mem::take(&mut this.frames));
        let result = this.inner.as_mut().poll(cx);
        this.frames = swap(prior);
        result
    }
}

/// Extension methods for running futures under a trace context.
pub trait TraceFutureExt: Future + Sized {
    /// Run this future with the given snapshot as its active context.
    fn with_trace_context(self, snapshot: ContextSnapshot) -> TracedFuture<Self> {
        TracedFuture {
            inner: Box::pin(self),
            frames: snapshot.frames,
        }
    }

    /// Run this future with a snapshot of the caller's current context.
    fn in_current_context(self) -> TracedFuture<Self> {
        self.with_trace_context(ContextSnapshot::capture())
    }
}

impl<F: Future> TraceFutureExt for F {}
