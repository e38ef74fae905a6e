//! Execution context and run loop
//!
//! The context multiplexes two sources of ready work into one run loop: the
//! provider's completion queue, and callables posted through [`Executor`]
//! handles. Work arriving from the running thread lands on an uncontended
//! local queue; work from foreign threads goes through the atomic remote
//! queue, whose activation protocol decides when a wake alarm needs to be
//! pushed through the completion queue to interrupt a blocked poll.
//!
//! Termination is driven by the outstanding-work counter: the loop stops when
//! the counter reaches zero with nothing queued, or when [`Context::stop`] is
//! called. Dropping the context performs a final synchronous drain in which
//! every still-pending operation is completed with a shutdown result.

use crate::executor::Executor;
use crate::op::{self, Header, OperationResult};
use crate::pool::PoolResource;
use crate::queue::{AtomicOpQueue, OpQueue};
use crate::thread_context::{self, ThreadContext};
use corq_sdk::{CompletionQueue, Deadline, PollResult, Tag};
use log::{debug, trace};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Tag reserved for the wake alarm. Operation records are heap allocations,
/// so address zero can never collide with a real tag.
pub(crate) const WAKE_TAG: Tag = Tag::from_raw(0);

/// Construction options for [`Context`].
#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// Number of threads expected to call `run`-family methods concurrently.
    /// `1` selects single-threaded mode; `0` resolves to the number of CPUs.
    pub concurrency_hint: usize,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self { concurrency_hint: 1 }
    }
}

pub(crate) struct LocalState {
    pub(crate) queue: OpQueue,
    pub(crate) check_remote_work: bool,
}

pub(crate) struct ContextInner {
    outstanding_work: AtomicI64,
    stopped: AtomicBool,
    shutdown: AtomicBool,
    /// Multithreaded wake coalescing: true while an alarm is in flight.
    check_remote_work: AtomicBool,
    multithreaded: AtomicBool,
    queue: Arc<dyn CompletionQueue>,
    remote: AtomicOpQueue,
    /// Valid only while no thread is running; a running thread moves this
    /// state into its ThreadContext and hands it back on exit.
    pub(crate) local_state: Mutex<LocalState>,
    resources: Mutex<Vec<PoolResource>>,
}

struct DoOneResult {
    handled_event: bool,
    was_wake: bool,
    processed_local: bool,
}

struct EventOutcome {
    handled: bool,
    was_wake: bool,
}

/// Records one unit of work finished when dropped, so the bookkeeping runs
/// even if the completion handler panics or frees the operation.
pub(crate) struct WorkFinishedGuard<'a>(pub(crate) &'a ContextInner);

impl Drop for WorkFinishedGuard<'_> {
    fn drop(&mut self) {
        self.0.work_finished();
    }
}

/// Counts work started on construction and undoes it on drop unless released.
pub(crate) struct StartWorkGuard<'a> {
    context: &'a ContextInner,
    armed: bool,
}

impl<'a> StartWorkGuard<'a> {
    pub(crate) fn new(context: &'a ContextInner) -> Self {
        context.work_started();
        Self {
            context,
            armed: true,
        }
    }

    pub(crate) fn release(mut self) {
        self.armed = false;
    }
}

impl Drop for StartWorkGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.context.work_finished();
        }
    }
}

/// One drain pass over a snapshot of the local queue. Anything left
/// unprocessed when the pass is abandoned (a panicking handler) is spliced
/// back to the front of the local queue.
struct DrainPass<'t, 'a> {
    snapshot: OpQueue,
    tcx: &'t ThreadContext<'a>,
}

impl Drop for DrainPass<'_, '_> {
    fn drop(&mut self) {
        let remainder = std::mem::take(&mut self.snapshot);
        if !remainder.is_empty() {
            self.tcx.local.borrow_mut().prepend(remainder);
        }
    }
}

impl ContextInner {
    pub(crate) fn multithreaded(&self) -> bool {
        self.multithreaded.load(Ordering::Relaxed)
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub(crate) fn work_started(&self) {
        self.outstanding_work.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn work_finished(&self) {
        if self.outstanding_work.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.stop();
        }
    }

    pub(crate) fn stop(&self) {
        if !self.stopped.swap(true, Ordering::Relaxed)
            && !thread_context::on_context_thread(self)
            && self.remote.try_mark_active()
        {
            trace!("stop requested from foreign thread, waking poll");
            self.trigger_work_alarm();
        }
    }

    pub(crate) fn reset(&self) {
        self.stopped.store(false, Ordering::Relaxed);
    }

    /// Push the wake tag through the completion queue so a blocked poll
    /// re-checks the remote queue. In multithreaded mode at most one alarm is
    /// in flight at a time.
    pub(crate) fn trigger_work_alarm(&self) {
        if !self.multithreaded() || !self.check_remote_work.swap(true, Ordering::Relaxed) {
            self.queue.alarm(WAKE_TAG);
        }
    }

    pub(crate) fn add_operation(&self, op: NonNull<Header>) {
        thread_context::with_current(self, |tcx| match tcx {
            Some(tcx) => tcx.local.borrow_mut().push_back(op),
            None => self.add_remote_operation(op),
        })
    }

    pub(crate) fn add_remote_operation(&self, op: NonNull<Header>) {
        if self.remote.enqueue(op) {
            self.trigger_work_alarm();
        }
    }

    /// Move every operation of `queue` to the remote queue. Returns true if
    /// any enqueue found the remote queue inactive.
    pub(crate) fn move_queue_to_remote(&self, mut queue: OpQueue) -> bool {
        let mut activated = false;
        while let Some(op) = queue.pop_front() {
            if self.remote.enqueue(op) {
                activated = true;
            }
        }
        activated
    }

    fn move_remote_to_local(&self, tcx: &ThreadContext<'_>) -> bool {
        let transferred = self.remote.try_mark_inactive_or_dequeue_all();
        if transferred.is_empty() {
            return false;
        }
        tcx.local.borrow_mut().append(transferred);
        true
    }

    /// Complete everything in the current local-queue snapshot. Operations
    /// pushed back during the pass are left for the next one.
    fn process_local_queue(&self, tcx: &ThreadContext<'_>, invoke_handlers: bool) -> bool {
        let result = if invoke_handlers {
            OperationResult::Ok
        } else {
            OperationResult::ShutdownNotOk
        };
        let mut processed = false;
        let mut pass = DrainPass {
            snapshot: tcx.local.take(),
            tcx,
        };
        while let Some(op) = pass.snapshot.pop_front() {
            processed = true;
            let _work = WorkFinishedGuard(self);
            // SAFETY: queued operations stay valid until completed, and each
            // is completed exactly once
            unsafe {
                Header::complete(op, result, self);
            }
        }
        processed
    }

    fn handle_next_event(
        &self,
        tcx: &ThreadContext<'_>,
        deadline: Deadline,
        invoke_handlers: bool,
    ) -> EventOutcome {
        match self.queue.poll(deadline) {
            PollResult::Event(event) => {
                if event.tag == WAKE_TAG {
                    if self.multithreaded() {
                        if self.check_remote_work.swap(false, Ordering::Relaxed) {
                            tcx.check_remote_work.set(true);
                        }
                    } else {
                        tcx.check_remote_work.set(true);
                    }
                    EventOutcome {
                        handled: true,
                        was_wake: true,
                    }
                } else {
                    let result = OperationResult::from_event(event.ok, invoke_handlers);
                    self.process_tag(event.tag, result);
                    EventOutcome {
                        handled: true,
                        was_wake: false,
                    }
                }
            }
            PollResult::Timeout | PollResult::Closed => EventOutcome {
                handled: false,
                was_wake: false,
            },
        }
    }

    fn process_tag(&self, tag: Tag, result: OperationResult) {
        if let Some(op) = Header::from_tag(tag) {
            let _work = WorkFinishedGuard(self);
            // SAFETY: the provider surfaces each armed tag exactly once, and
            // tags originate from live operation records
            unsafe {
                Header::complete(op, result, self);
            }
        }
    }

    fn do_one(
        &self,
        tcx: &ThreadContext<'_>,
        deadline: Deadline,
        invoke_handlers: bool,
        stop: &dyn Fn() -> bool,
    ) -> DoOneResult {
        let mut check_remote = tcx.check_remote_work.get();
        if self.multithreaded() {
            let mut previous = tcx.local.take();
            if check_remote {
                self.move_remote_to_local(tcx);
            }
            // Keep one unit of work from each source and share the rest out,
            // so sibling runner threads are never starved by one hot thread.
            let mut kept = OpQueue::default();
            if let Some(op) = previous.pop_front() {
                kept.push_back(op);
            }
            if let Some(op) = tcx.local.borrow_mut().pop_front() {
                kept.push_back(op);
            }
            tcx.local.borrow_mut().append(previous);
            if !tcx.local.borrow().is_empty() {
                let _ = self.move_queue_to_remote(tcx.local.take());
                self.trigger_work_alarm();
            }
            check_remote = false;
            tcx.check_remote_work.set(false);
            *tcx.local.borrow_mut() = kept;
        } else {
            if check_remote {
                check_remote = self.move_remote_to_local(tcx);
            }
            tcx.check_remote_work.set(check_remote);
        }
        let processed_local = self.process_local_queue(tcx, invoke_handlers);
        let more_pending = check_remote || !tcx.local.borrow().is_empty();
        if !more_pending && stop() {
            return DoOneResult {
                handled_event: false,
                was_wake: false,
                processed_local,
            };
        }
        // Stay responsive: only block in the queue when nothing else is ready.
        let poll_deadline = if more_pending {
            Deadline::Immediate
        } else {
            deadline
        };
        let event = self.handle_next_event(tcx, poll_deadline, invoke_handlers);
        DoOneResult {
            handled_event: event.handled,
            was_wake: event.was_wake,
            processed_local,
        }
    }

    fn run_loop(
        &self,
        tcx: &ThreadContext<'_>,
        deadline: Deadline,
        completion_queue_only: bool,
        stop: &dyn Fn() -> bool,
    ) -> bool {
        let mut processed = false;
        loop {
            if stop() {
                break;
            }
            let result = if completion_queue_only {
                let event = self.handle_next_event(tcx, deadline, true);
                DoOneResult {
                    handled_event: event.handled,
                    was_wake: event.was_wake,
                    processed_local: false,
                }
            } else {
                self.do_one(tcx, deadline, true, stop)
            };
            processed = processed
                || if completion_queue_only {
                    result.handled_event && !result.was_wake
                } else {
                    result.handled_event || result.processed_local
                };
            if !result.handled_event && !result.processed_local {
                break;
            }
        }
        processed
    }

    fn process_work(
        &self,
        deadline: Deadline,
        completion_queue_only: bool,
        stop: &dyn Fn() -> bool,
    ) -> bool {
        // Reentrant call from inside a completion handler: keep using the
        // thread context that is already installed.
        let reentrant = thread_context::with_current(self, |tcx| {
            tcx.map(|tcx| self.run_loop(tcx, deadline, completion_queue_only, stop))
        });
        if let Some(processed) = reentrant {
            return processed;
        }
        if self.outstanding_work.load(Ordering::Relaxed) == 0 {
            self.stopped.store(true, Ordering::Relaxed);
            return false;
        }
        self.reset();
        let tcx = ThreadContext::new(self);
        let _installed = tcx.install();
        self.run_loop(&tcx, deadline, completion_queue_only, stop)
    }

    pub(crate) fn acquire_resource(&self) -> PoolResource {
        self.resources.lock().pop().unwrap_or_default()
    }

    pub(crate) fn release_resource(&self, resource: PoolResource) {
        self.resources.lock().push(resource);
    }

    /// Final synchronous drain: complete everything still queued or armed
    /// with a shutdown result, never invoking the queue's blocking wait.
    fn drain(&self) {
        debug!("draining context at shutdown");
        self.multithreaded.store(false, Ordering::Relaxed);
        let tcx = ThreadContext::new(self);
        let _installed = tcx.install();
        let _ = self.remote.try_mark_active();
        self.move_remote_to_local(&tcx);
        self.process_local_queue(&tcx, false);
        while self.handle_next_event(&tcx, Deadline::Never, false).handled {}
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        // Anything a producer slipped in after the final drain still gets its
        // shutdown completion; nothing may leak or dangle.
        let mut leftover = self.remote.try_mark_inactive_or_dequeue_all();
        leftover.append(std::mem::take(&mut self.local_state.get_mut().queue));
        while let Some(op) = leftover.pop_front() {
            // SAFETY: these operations were queued and never completed
            unsafe {
                Header::complete(op, OperationResult::ShutdownNotOk, self);
            }
        }
    }
}

/// The execution context.
///
/// Owns the completion queue handle and every queue of pending work. Run
/// methods take `&self`: in multithreaded mode several threads may call them
/// concurrently. The context must outlive all operations submitted to it;
/// dropping it completes anything still pending with a shutdown result.
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Create a single-threaded context over the given completion queue.
    pub fn new(queue: Arc<dyn CompletionQueue>) -> Self {
        Self::with_options(queue, ContextOptions::default())
    }

    /// Create a context with explicit options.
    pub fn with_options(queue: Arc<dyn CompletionQueue>, options: ContextOptions) -> Self {
        let hint = if options.concurrency_hint == 0 {
            num_cpus::get()
        } else {
            options.concurrency_hint
        };
        debug!("creating context, concurrency hint {hint}");
        let resources = (0..hint).map(|_| PoolResource::new()).collect();
        Self {
            inner: Arc::new(ContextInner {
                outstanding_work: AtomicI64::new(0),
                stopped: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                check_remote_work: AtomicBool::new(false),
                multithreaded: AtomicBool::new(hint > 1),
                queue,
                remote: AtomicOpQueue::new(false),
                local_state: Mutex::new(LocalState {
                    queue: OpQueue::default(),
                    check_remote_work: false,
                }),
                resources: Mutex::new(resources),
            }),
        }
    }

    /// Run until the outstanding-work counter reaches zero or the context is
    /// stopped. Returns whether any completion was processed.
    pub fn run(&self) -> bool {
        let inner = &*self.inner;
        inner.process_work(Deadline::Never, false, &|| inner.is_stopped())
    }

    /// Like [`run`](Self::run), but return at `deadline` even if work remains.
    pub fn run_until(&self, deadline: Instant) -> bool {
        let inner = &*self.inner;
        inner.process_work(Deadline::At(deadline), false, &|| inner.is_stopped())
    }

    /// Like [`run_until`](Self::run_until) with a relative timeout.
    pub fn run_for(&self, timeout: Duration) -> bool {
        self.run_until(Instant::now() + timeout)
    }

    /// Run while `condition` returns true and the context is not stopped.
    ///
    /// The condition should only change as a result of work performed on this
    /// context; it is re-evaluated after every completion.
    pub fn run_while<F>(&self, condition: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let inner = &*self.inner;
        let condition = RefCell::new(condition);
        inner.process_work(Deadline::Never, false, &|| {
            inner.is_stopped() || !(*condition.borrow_mut())()
        })
    }

    /// Process everything that is already ready, without blocking.
    pub fn poll(&self) -> bool {
        let inner = &*self.inner;
        inner.process_work(Deadline::Immediate, false, &|| inner.is_stopped())
    }

    /// Run, driving only the completion queue: queued callables are left
    /// untouched. Useful for threads dedicated to queue turnover.
    pub fn run_completion_queue(&self) -> bool {
        let inner = &*self.inner;
        inner.process_work(Deadline::Never, true, &|| inner.is_stopped())
    }

    /// Non-blocking variant of [`run_completion_queue`](Self::run_completion_queue).
    pub fn poll_completion_queue(&self) -> bool {
        let inner = &*self.inner;
        inner.process_work(Deadline::Immediate, true, &|| inner.is_stopped())
    }

    /// Signal the run loop to return as soon as possible. Pending work is
    /// neither drained nor invalidated. Thread-safe.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Clear the stopped flag so the context can run again.
    pub fn reset(&self) {
        self.inner.reset();
    }

    /// Whether the run loop has stopped (out of work, or [`stop`](Self::stop)).
    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    /// Count one unit of outstanding work. Every independently armed
    /// operation must be bracketed by this and [`work_finished`](Self::work_finished).
    pub fn work_started(&self) {
        self.inner.work_started();
    }

    /// Count one unit of outstanding work finished.
    pub fn work_finished(&self) {
        self.inner.work_finished();
    }

    /// A cheap, cloneable submission handle to this context.
    pub fn executor(&self) -> Executor {
        Executor::new(self.inner.clone())
    }

    /// The completion queue this context drives.
    ///
    /// Do not poll it directly; that would race the run loop.
    pub fn completion_queue(&self) -> Arc<dyn CompletionQueue> {
        self.inner.queue.clone()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.inner.stop();
        self.inner.shutdown.store(true, Ordering::Relaxed);
        self.inner.queue.shutdown();
        self.inner.drain();
    }
}

// Submission helpers shared with the executor.
impl ContextInner {
    pub(crate) fn submit_posted<F>(&self, callable: F, inline_allowed: bool)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shutdown() {
            return;
        }
        if inline_allowed && thread_context::on_context_thread(self) {
            callable();
            return;
        }
        let work = StartWorkGuard::new(self);
        let rejected = thread_context::with_current(self, |tcx| match tcx {
            Some(tcx) => {
                let op = tcx.with_resource(|resource| op::allocate_posted_local(callable, resource));
                tcx.local.borrow_mut().push_back(op);
                None
            }
            None => Some(callable),
        });
        if let Some(callable) = rejected {
            self.add_remote_operation(op::allocate_posted(callable));
        }
        work.release();
    }

    pub(crate) fn submit_tag<I, F>(&self, init: I, on_complete: F)
    where
        I: FnOnce(Tag),
        F: FnOnce(OperationResult) + Send + 'static,
    {
        if self.is_shutdown() {
            on_complete(OperationResult::ShutdownNotOk);
            return;
        }
        let work = StartWorkGuard::new(self);
        let op = op::allocate_tag(on_complete);
        let arm = op::ArmGuard::<F>::new(op);
        init(Header::tag(op));
        arm.release();
        work.release();
    }
}
