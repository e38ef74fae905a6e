//! Executor handle
//!
//! A lightweight, cloneable handle to a [`Context`](crate::Context), safe to
//! send to other threads. Submissions from the thread currently running the
//! context take the uncontended local path (skipping the atomic queue
//! entirely); everything else goes through the remote queue and its wake
//! protocol.

use crate::context::ContextInner;
use crate::op::OperationResult;
use crate::thread_context;
use corq_sdk::Tag;
use std::sync::Arc;

/// Cloneable submission handle for an execution context.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<ContextInner>,
}

impl Executor {
    pub(crate) fn new(inner: Arc<ContextInner>) -> Self {
        Self { inner }
    }

    /// Queue `callable` for execution by the run loop. Never runs inline.
    ///
    /// If the context shuts down first, the callable is dropped without
    /// running. Submitting to an already shut-down context is a no-op.
    pub fn post<F>(&self, callable: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.submit_posted(callable, false);
    }

    /// Queue `callable`, hinting that it should not run ahead of already
    /// queued work. Equivalent to [`post`](Self::post) for this context.
    pub fn defer<F>(&self, callable: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.submit_posted(callable, false);
    }

    /// Run `callable` immediately when called from the thread currently
    /// running the context; otherwise queue it like [`post`](Self::post).
    pub fn dispatch<F>(&self, callable: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.submit_posted(callable, true);
    }

    /// Execute `callable` on the context, allowing inline execution from the
    /// running thread.
    pub fn execute<F>(&self, callable: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.submit_posted(callable, true);
    }

    /// Arm a tag-based operation.
    ///
    /// Allocates an operation record, passes its [`Tag`] to `init` (which
    /// typically starts a native call with the tag), and invokes
    /// `on_complete` with the final [`OperationResult`] once the tag
    /// surfaces through the completion queue, or with a shutdown result when
    /// the context is torn down first. Work is tracked for the operation's
    /// whole lifetime.
    pub fn initiate<I, F>(&self, init: I, on_complete: F)
    where
        I: FnOnce(Tag),
        F: FnOnce(OperationResult) + Send + 'static,
    {
        self.inner.submit_tag(init, on_complete);
    }

    /// Whether the calling thread is currently running this context.
    pub fn running_in_this_thread(&self) -> bool {
        thread_context::on_context_thread(&self.inner)
    }

    /// See [`Context::stop`](crate::Context::stop).
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// See [`Context::reset`](crate::Context::reset).
    pub fn reset(&self) {
        self.inner.reset();
    }

    /// See [`Context::is_stopped`](crate::Context::is_stopped).
    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    /// See [`Context::work_started`](crate::Context::work_started).
    pub fn work_started(&self) {
        self.inner.work_started();
    }

    /// See [`Context::work_finished`](crate::Context::work_finished).
    pub fn work_finished(&self) {
        self.inner.work_finished();
    }
}
