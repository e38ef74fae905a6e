//! Error types for queue providers

use crate::Tag;

/// Result type for provider-side queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Misuse of the provider side of a completion queue
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The queue has shut down; no further tags may be armed or completed.
    #[error("completion queue has shut down")]
    Shutdown,

    /// A tag was completed without having been armed first.
    #[error("tag {0:?} is not armed")]
    NotArmed(Tag),

    /// A tag was armed while a previous arming is still outstanding.
    #[error("tag {0:?} is already armed")]
    AlreadyArmed(Tag),
}
