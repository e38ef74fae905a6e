//! Thread-local run state
//!
//! A [`ThreadContext`] exists for the duration of one run/poll call on one
//! thread: it borrows the context's local work queue (single-threaded mode),
//! carries the sticky check-remote-work flag, and leases a scratch allocator
//! from the context's pool. A raw pointer to it is installed in a
//! thread-local cell so that same-thread submissions can take the
//! uncontended local path.
//!
//! Installation is guarded: the guard's drop runs on every exit from the run
//! loop, including unwinding, and merges whatever work is still queued back
//! out so nothing is stranded on a dead stack frame.

use crate::context::ContextInner;
use crate::pool::PoolResource;
use crate::queue::OpQueue;
use std::alloc::Layout;
use std::cell::{Cell, RefCell};
use std::ptr::{self, NonNull};

pub(crate) struct ThreadContext<'a> {
    pub(crate) context: &'a ContextInner,
    pub(crate) local: RefCell<OpQueue>,
    pub(crate) check_remote_work: Cell<bool>,
    resource: RefCell<PoolResource>,
}

thread_local! {
    static CURRENT: Cell<*const ThreadContext<'static>> = const { Cell::new(ptr::null()) };
}

impl<'a> ThreadContext<'a> {
    pub(crate) fn new(context: &'a ContextInner) -> Self {
        // In single-threaded mode the context's queue is owned by whichever
        // thread is running; multithreaded runners start empty and share
        // through the remote queue.
        let (local, check_remote_work) = if context.multithreaded() {
            (OpQueue::default(), false)
        } else {
            let mut state = context.local_state.lock();
            (
                std::mem::take(&mut state.queue),
                std::mem::replace(&mut state.check_remote_work, false),
            )
        };
        Self {
            context,
            local: RefCell::new(local),
            check_remote_work: Cell::new(check_remote_work),
            resource: RefCell::new(context.acquire_resource()),
        }
    }

    /// Make this the current thread context until the guard drops.
    pub(crate) fn install(&self) -> InstalledGuard<'_, 'a> {
        let erased = self as *const ThreadContext<'a> as *const ThreadContext<'static>;
        let previous = CURRENT.with(|current| current.replace(erased));
        InstalledGuard {
            tcx: self,
            previous,
        }
    }

    pub(crate) fn with_resource<R>(&self, f: impl FnOnce(&mut PoolResource) -> R) -> R {
        f(&mut self.resource.borrow_mut())
    }
}

pub(crate) struct InstalledGuard<'t, 'a> {
    tcx: &'t ThreadContext<'a>,
    previous: *const ThreadContext<'static>,
}

impl Drop for InstalledGuard<'_, '_> {
    fn drop(&mut self) {
        let tcx = self.tcx;
        let context = tcx.context;
        if context.multithreaded() {
            let had_local_work = !tcx.local.borrow().is_empty();
            let _ = context.move_queue_to_remote(tcx.local.take());
            if had_local_work || tcx.check_remote_work.get() || context.is_stopped() {
                context.trigger_work_alarm();
            }
        } else {
            let mut state = context.local_state.lock();
            state.queue.append(tcx.local.take());
            state.check_remote_work |= tcx.check_remote_work.get();
        }
        context.release_resource(tcx.resource.take());
        CURRENT.with(|current| current.set(self.previous));
    }
}

/// Run `f` with the thread context currently installed for `context` on this
/// thread, or `None` when this thread is not running it.
pub(crate) fn with_current<R>(
    context: &ContextInner,
    f: impl FnOnce(Option<&ThreadContext<'_>>) -> R,
) -> R {
    CURRENT.with(|current| {
        let installed = current.get();
        if installed.is_null() {
            return f(None);
        }
        // SAFETY: the pointer was installed by a live InstalledGuard on this
        // thread, and the ThreadContext it refers to outlives that guard.
        let tcx = unsafe { &*installed };
        if ptr::eq(tcx.context, context) {
            f(Some(tcx))
        } else {
            f(None)
        }
    })
}

pub(crate) fn on_context_thread(context: &ContextInner) -> bool {
    with_current(context, |tcx| tcx.is_some())
}

/// Return a pool-served block to the current thread's leased resource, or to
/// the system when no run loop is active on this thread.
///
/// # Safety
///
/// `block` must be a live pool-served allocation of `layout`.
pub(crate) unsafe fn release_pooled(block: NonNull<u8>, layout: Layout) {
    let installed = CURRENT.with(|current| current.get());
    if installed.is_null() {
        PoolResource::deallocate_global(block, layout);
    } else {
        // SAFETY: see with_current
        (*installed).resource.borrow_mut().deallocate(block, layout);
    }
}
