//! Corq runtime — completion-queue execution context
//!
//! Bridges a native RPC library's completion-queue model to executor-style
//! scheduling. One [`Context`] owns one provider queue (anything implementing
//! [`CompletionQueue`]) and multiplexes its `(tag, ok)` events with callables
//! posted through [`Executor`] handles into a single run loop.
//!
//! ```ignore
//! use corq_runtime::{Context, InProcessQueue};
//! use std::sync::Arc;
//!
//! let queue = Arc::new(InProcessQueue::new());
//! let context = Context::new(queue.clone());
//! let executor = context.executor();
//!
//! executor.post(|| println!("ran on the context"));
//! context.run();
//! ```
//!
//! Higher-level RPC wrappers build on one primitive: [`Executor::initiate`]
//! arms an operation whose completion handler runs when the provider surfaces
//! its tag. Everything else — run/poll/stop lifecycle, work counting,
//! shutdown draining — exists to make that primitive exactly-once.

#![warn(missing_docs)]

mod context;
mod executor;
mod op;
mod pool;
mod queue;
mod thread_context;

pub use context::{Context, ContextOptions};
pub use executor::Executor;
pub use op::OperationResult;

pub use corq_sdk::{
    CompletionEvent, CompletionQueue, Deadline, InProcessQueue, PollResult, QueueError,
    QueueResult, Tag,
};
