//! Per-thread scratch allocator
//!
//! Operation records submitted from the running thread are small and
//! short-lived, so each thread context leases a [`PoolResource`] from the
//! execution context for the duration of a run call. Freed blocks are cached
//! in per-size-class freelists and handed out again without touching the
//! global allocator.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Largest alignment the pool serves.
const MAX_ALIGN: usize = 16;

/// Power-of-two block sizes; anything larger goes to the global allocator.
const CLASS_SIZES: [usize; 5] = [64, 128, 256, 512, 1024];

/// Blocks cached per class before surplus is returned to the system.
const MAX_CACHED_PER_CLASS: usize = 64;

pub(crate) struct PoolResource {
    classes: [Vec<NonNull<u8>>; CLASS_SIZES.len()],
}

// Cached blocks are raw memory owned by the resource.
unsafe impl Send for PoolResource {}

impl PoolResource {
    pub(crate) fn new() -> Self {
        Self {
            classes: std::array::from_fn(|_| Vec::new()),
        }
    }

    /// Whether the pool serves this layout at all.
    pub(crate) fn fits(layout: Layout) -> bool {
        layout.size() > 0
            && layout.size() <= CLASS_SIZES[CLASS_SIZES.len() - 1]
            && layout.align() <= MAX_ALIGN
    }

    fn class_of(size: usize) -> usize {
        CLASS_SIZES
            .iter()
            .position(|&class_size| size <= class_size)
            .unwrap()
    }

    fn block_layout(class: usize) -> Layout {
        Layout::from_size_align(CLASS_SIZES[class], MAX_ALIGN).unwrap()
    }

    /// Allocate a block serving `layout`. The caller must free it with
    /// [`deallocate`](Self::deallocate) or [`deallocate_global`](Self::deallocate_global)
    /// using the same layout.
    pub(crate) fn allocate(&mut self, layout: Layout) -> NonNull<u8> {
        debug_assert!(Self::fits(layout));
        let class = Self::class_of(layout.size());
        if let Some(block) = self.classes[class].pop() {
            return block;
        }
        let block_layout = Self::block_layout(class);
        // SAFETY: block_layout has non-zero size
        let block = unsafe { alloc::alloc(block_layout) };
        NonNull::new(block).unwrap_or_else(|| alloc::handle_alloc_error(block_layout))
    }

    pub(crate) fn deallocate(&mut self, block: NonNull<u8>, layout: Layout) {
        let class = Self::class_of(layout.size());
        let cache = &mut self.classes[class];
        if cache.len() < MAX_CACHED_PER_CLASS {
            cache.push(block);
        } else {
            // SAFETY: the block was allocated with this class layout
            unsafe {
                alloc::dealloc(block.as_ptr(), Self::block_layout(class));
            }
        }
    }

    /// Free a pool-served block when no resource is at hand.
    ///
    /// # Safety
    ///
    /// `block` must have been returned by [`allocate`](Self::allocate) for an
    /// equivalent layout.
    pub(crate) unsafe fn deallocate_global(block: NonNull<u8>, layout: Layout) {
        let class = Self::class_of(layout.size());
        alloc::dealloc(block.as_ptr(), Self::block_layout(class));
    }
}

impl Default for PoolResource {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PoolResource {
    fn drop(&mut self) {
        for (class, cache) in self.classes.iter_mut().enumerate() {
            for block in cache.drain(..) {
                // SAFETY: every cached block was allocated with its class layout
                unsafe {
                    alloc::dealloc(block.as_ptr(), Self::block_layout(class));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_release_reuses_block() {
        let mut resource = PoolResource::new();
        let layout = Layout::from_size_align(48, 8).unwrap();

        let first = resource.allocate(layout);
        resource.deallocate(first, layout);
        let second = resource.allocate(layout);
        // The freed block comes back rather than a fresh allocation.
        assert_eq!(first, second);
        resource.deallocate(second, layout);
    }

    #[test]
    fn test_different_sizes_share_a_class() {
        let mut resource = PoolResource::new();
        let small = Layout::from_size_align(40, 8).unwrap();
        let larger = Layout::from_size_align(60, 16).unwrap();

        let block = resource.allocate(small);
        resource.deallocate(block, small);
        // 40 and 60 both round up to the 64-byte class.
        let reused = resource.allocate(larger);
        assert_eq!(block, reused);
        resource.deallocate(reused, larger);
    }

    #[test]
    fn test_fits_bounds() {
        assert!(PoolResource::fits(Layout::from_size_align(1, 1).unwrap()));
        assert!(PoolResource::fits(
            Layout::from_size_align(1024, 16).unwrap()
        ));
        assert!(!PoolResource::fits(
            Layout::from_size_align(1025, 8).unwrap()
        ));
        assert!(!PoolResource::fits(
            Layout::from_size_align(64, 32).unwrap()
        ));
    }
}
