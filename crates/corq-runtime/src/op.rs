//! Type-erased operation records
//!
//! Every unit of pending work is an [`Header`]-prefixed record: a completion
//! function pointer plus an intrusive link for queue membership. The header
//! address doubles as the [`Tag`] handed to the completion queue, so a
//! surfaced event leads straight back to its operation without any lookup.
//!
//! Records are created when work is submitted and destroyed by their own
//! completion function, which runs exactly once: it moves the user callable
//! out, releases the storage, then invokes the callable (or drops it when the
//! context is draining).

use crate::context::ContextInner;
use crate::pool::PoolResource;
use crate::thread_context;
use corq_sdk::Tag;
use std::alloc::Layout;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ptr::{self, NonNull};

/// Outcome delivered to an operation's completion function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationResult {
    /// The operation succeeded.
    Ok,

    /// The operation failed or was cancelled; the context is still live.
    NotOk,

    /// The context is shutting down; the underlying operation had succeeded.
    ShutdownOk,

    /// The context is shutting down; the operation never completed live.
    ShutdownNotOk,
}

impl OperationResult {
    /// Whether the operation succeeded while the context was live.
    pub fn is_ok(self) -> bool {
        self == OperationResult::Ok
    }

    /// Whether this completion was delivered as part of context shutdown.
    pub fn is_shutdown(self) -> bool {
        matches!(
            self,
            OperationResult::ShutdownOk | OperationResult::ShutdownNotOk
        )
    }

    pub(crate) fn from_event(ok: bool, invoke_handlers: bool) -> Self {
        match (invoke_handlers, ok) {
            (true, true) => OperationResult::Ok,
            (true, false) => OperationResult::NotOk,
            (false, true) => OperationResult::ShutdownOk,
            (false, false) => OperationResult::ShutdownNotOk,
        }
    }
}

pub(crate) type CompleteFn = unsafe fn(NonNull<Header>, OperationResult, &ContextInner);

/// Common prefix of every operation record.
///
/// `next` is only touched while the operation sits in a queue; `complete` is
/// read exactly once, when the operation is dispatched.
pub(crate) struct Header {
    complete: CompleteFn,
    pub(crate) next: *mut Header,
}

impl Header {
    pub(crate) fn new(complete: CompleteFn) -> Self {
        Self {
            complete,
            next: ptr::null_mut(),
        }
    }

    /// Dispatch the operation. Consumes the record: the pointer must not be
    /// used again afterwards.
    ///
    /// # Safety
    ///
    /// `op` must point to a live operation record that has not been completed.
    pub(crate) unsafe fn complete(
        op: NonNull<Header>,
        result: OperationResult,
        context: &ContextInner,
    ) {
        let complete = op.as_ref().complete;
        complete(op, result, context);
    }

    pub(crate) fn tag(op: NonNull<Header>) -> Tag {
        Tag::from_raw(op.as_ptr() as usize)
    }

    pub(crate) fn from_tag(tag: Tag) -> Option<NonNull<Header>> {
        NonNull::new(tag.as_raw() as *mut Header)
    }
}

// ============================================================================
// Posted operations (no-argument callables from the executor)
// ============================================================================

#[repr(C)]
struct PostedOp<F> {
    header: Header,
    callable: ManuallyDrop<F>,
}

/// Allocate a posted operation on the global heap.
pub(crate) fn allocate_posted<F>(callable: F) -> NonNull<Header>
where
    F: FnOnce(),
{
    let boxed = Box::new(PostedOp {
        header: Header::new(complete_posted::<F>),
        callable: ManuallyDrop::new(callable),
    });
    NonNull::from(Box::leak(boxed)).cast()
}

/// Allocate a posted operation from the running thread's pool resource,
/// falling back to the global heap for layouts the pool does not serve.
pub(crate) fn allocate_posted_local<F>(callable: F, resource: &mut PoolResource) -> NonNull<Header>
where
    F: FnOnce(),
{
    let layout = Layout::new::<PostedOp<F>>();
    if !PoolResource::fits(layout) {
        return allocate_posted(callable);
    }
    let block = resource.allocate(layout).cast::<PostedOp<F>>();
    // SAFETY: the block is fresh, properly sized and aligned for PostedOp<F>
    unsafe {
        block.as_ptr().write(PostedOp {
            header: Header::new(complete_posted_pooled::<F>),
            callable: ManuallyDrop::new(callable),
        });
    }
    block.cast()
}

unsafe fn complete_posted<F>(op: NonNull<Header>, result: OperationResult, _context: &ContextInner)
where
    F: FnOnce(),
{
    let mut boxed: Box<PostedOp<F>> = Box::from_raw(op.cast::<PostedOp<F>>().as_ptr());
    let callable = ManuallyDrop::take(&mut boxed.callable);
    drop(boxed);
    if !result.is_shutdown() {
        callable();
    }
}

unsafe fn complete_posted_pooled<F>(
    op: NonNull<Header>,
    result: OperationResult,
    _context: &ContextInner,
) where
    F: FnOnce(),
{
    let record = op.cast::<PostedOp<F>>();
    let callable = ManuallyDrop::take(&mut (*record.as_ptr()).callable);
    thread_context::release_pooled(op.cast(), Layout::new::<PostedOp<F>>());
    if !result.is_shutdown() {
        callable();
    }
}

// ============================================================================
// Tag operations (handlers armed against the completion queue)
// ============================================================================

#[repr(C)]
struct TagOp<F> {
    header: Header,
    handler: ManuallyDrop<F>,
}

/// Allocate a tag operation. Its handler always observes the final
/// [`OperationResult`], including shutdown completions.
pub(crate) fn allocate_tag<F>(handler: F) -> NonNull<Header>
where
    F: FnOnce(OperationResult),
{
    let boxed = Box::new(TagOp {
        header: Header::new(complete_tag::<F>),
        handler: ManuallyDrop::new(handler),
    });
    NonNull::from(Box::leak(boxed)).cast()
}

unsafe fn complete_tag<F>(op: NonNull<Header>, result: OperationResult, _context: &ContextInner)
where
    F: FnOnce(OperationResult),
{
    let mut boxed: Box<TagOp<F>> = Box::from_raw(op.cast::<TagOp<F>>().as_ptr());
    let handler = ManuallyDrop::take(&mut boxed.handler);
    drop(boxed);
    handler(result);
}

/// Frees a tag operation that was never armed, dropping its handler without
/// invoking it. Used when the initiation function panics.
pub(crate) struct ArmGuard<F> {
    op: NonNull<Header>,
    armed: bool,
    _handler: PhantomData<F>,
}

impl<F> ArmGuard<F> {
    pub(crate) fn new(op: NonNull<Header>) -> Self {
        Self {
            op,
            armed: true,
            _handler: PhantomData,
        }
    }

    pub(crate) fn release(mut self) {
        self.armed = false;
    }
}

impl<F> Drop for ArmGuard<F> {
    fn drop(&mut self) {
        if self.armed {
            // SAFETY: the guard owns the record until release(); the record
            // was allocated by allocate_tag::<F>
            unsafe {
                let mut boxed: Box<TagOp<F>> = Box::from_raw(self.op.cast::<TagOp<F>>().as_ptr());
                ManuallyDrop::drop(&mut boxed.handler);
            }
        }
    }
}
