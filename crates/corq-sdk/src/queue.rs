//! In-process completion queue
//!
//! The reference [`CompletionQueue`] provider. Producers arm tags and later
//! complete them; consumers block in `poll` with a deadline. Shutdown follows
//! the native-library contract: tags armed but not yet completed surface with
//! `ok = false`, and the queue reports closed once everything has drained.

use crate::error::{QueueError, QueueResult};
use crate::{CompletionEvent, CompletionQueue, Deadline, PollResult, Tag};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use std::time::Instant;

struct QueueState {
    /// Delivered events waiting for a consumer, oldest first.
    events: VecDeque<CompletionEvent>,

    /// Tags armed by producers that have not completed yet.
    armed: FxHashSet<Tag>,

    /// Set once by `shutdown`; producers are rejected afterwards.
    shut_down: bool,
}

/// A thread-safe, in-process completion queue.
///
/// Supports any number of producers and consumers. `poll` is a blocking
/// dequeue bounded by the caller's deadline; `complete` delivers events in
/// FIFO order relative to other completions.
pub struct InProcessQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl InProcessQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                events: VecDeque::new(),
                armed: FxHashSet::default(),
                shut_down: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Record that an operation has been armed with `tag`.
    ///
    /// Every armed tag is guaranteed to surface through `poll` exactly once:
    /// either via [`complete`](Self::complete) or, if the queue shuts down
    /// first, with `ok = false`.
    pub fn arm(&self, tag: Tag) -> QueueResult<()> {
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(QueueError::Shutdown);
        }
        if !state.armed.insert(tag) {
            return Err(QueueError::AlreadyArmed(tag));
        }
        Ok(())
    }

    /// Complete a previously armed tag, delivering `(tag, ok)` to a consumer.
    pub fn complete(&self, tag: Tag, ok: bool) -> QueueResult<()> {
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(QueueError::Shutdown);
        }
        if !state.armed.remove(&tag) {
            return Err(QueueError::NotArmed(tag));
        }
        state.events.push_back(CompletionEvent { tag, ok });
        self.ready.notify_one();
        Ok(())
    }

    /// Number of armed, not yet completed tags.
    pub fn armed_len(&self) -> usize {
        self.state.lock().armed.len()
    }
}

impl Default for InProcessQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionQueue for InProcessQueue {
    fn poll(&self, deadline: Deadline) -> PollResult {
        let mut state = self.state.lock();
        loop {
            if let Some(event) = state.events.pop_front() {
                return PollResult::Event(event);
            }
            if state.shut_down {
                return PollResult::Closed;
            }
            match deadline {
                Deadline::Immediate => return PollResult::Timeout,
                Deadline::Never => {
                    self.ready.wait(&mut state);
                }
                Deadline::At(when) => {
                    if Instant::now() >= when {
                        return PollResult::Timeout;
                    }
                    let _ = self.ready.wait_until(&mut state, when);
                }
            }
        }
    }

    fn alarm(&self, tag: Tag) {
        let mut state = self.state.lock();
        if state.shut_down {
            return;
        }
        state.events.push_back(CompletionEvent { tag, ok: true });
        self.ready.notify_one();
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        // Armed-but-incomplete operations surface failed before the queue
        // closes, so every consumer still observes them exactly once.
        let armed: Vec<Tag> = state.armed.drain().collect();
        for tag in armed {
            state.events.push_back(CompletionEvent { tag, ok: false });
        }
        self.ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_complete_delivers_in_order() {
        let queue = InProcessQueue::new();
        queue.arm(Tag::from_raw(1)).unwrap();
        queue.arm(Tag::from_raw(2)).unwrap();
        queue.complete(Tag::from_raw(1), true).unwrap();
        queue.complete(Tag::from_raw(2), false).unwrap();

        assert_eq!(
            queue.poll(Deadline::Immediate),
            PollResult::Event(CompletionEvent {
                tag: Tag::from_raw(1),
                ok: true
            })
        );
        assert_eq!(
            queue.poll(Deadline::Immediate),
            PollResult::Event(CompletionEvent {
                tag: Tag::from_raw(2),
                ok: false
            })
        );
        assert_eq!(queue.poll(Deadline::Immediate), PollResult::Timeout);
    }

    #[test]
    fn test_poll_respects_deadline() {
        let queue = InProcessQueue::new();
        let start = Instant::now();
        let result = queue.poll(Deadline::after(Duration::from_millis(50)));
        assert_eq!(result, PollResult::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_poll_wakes_on_complete() {
        let queue = Arc::new(InProcessQueue::new());
        queue.arm(Tag::from_raw(7)).unwrap();

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.complete(Tag::from_raw(7), true).unwrap();
            })
        };

        let result = queue.poll(Deadline::after(Duration::from_secs(5)));
        assert_eq!(
            result,
            PollResult::Event(CompletionEvent {
                tag: Tag::from_raw(7),
                ok: true
            })
        );
        producer.join().unwrap();
    }

    #[test]
    fn test_shutdown_surfaces_armed_tags_then_closes() {
        let queue = InProcessQueue::new();
        queue.arm(Tag::from_raw(3)).unwrap();
        queue.shutdown();

        match queue.poll(Deadline::Immediate) {
            PollResult::Event(event) => {
                assert_eq!(event.tag, Tag::from_raw(3));
                assert!(!event.ok);
            }
            other => panic!("expected armed tag to surface, got {:?}", other),
        }
        assert_eq!(queue.poll(Deadline::Immediate), PollResult::Closed);
        assert_eq!(queue.poll(Deadline::Never), PollResult::Closed);
    }

    #[test]
    fn test_producer_misuse_is_rejected() {
        let queue = InProcessQueue::new();
        assert_eq!(
            queue.complete(Tag::from_raw(9), true),
            Err(QueueError::NotArmed(Tag::from_raw(9)))
        );

        queue.arm(Tag::from_raw(9)).unwrap();
        assert_eq!(
            queue.arm(Tag::from_raw(9)),
            Err(QueueError::AlreadyArmed(Tag::from_raw(9)))
        );

        queue.shutdown();
        assert_eq!(queue.arm(Tag::from_raw(10)), Err(QueueError::Shutdown));
        assert_eq!(
            queue.complete(Tag::from_raw(9), true),
            Err(QueueError::Shutdown)
        );
    }

    #[test]
    fn test_alarm_delivers_ok_event() {
        let queue = InProcessQueue::new();
        queue.alarm(Tag::from_raw(0));
        assert_eq!(
            queue.poll(Deadline::Immediate),
            PollResult::Event(CompletionEvent {
                tag: Tag::from_raw(0),
                ok: true
            })
        );
    }
}
