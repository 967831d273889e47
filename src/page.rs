use alloc::alloc::{alloc, dealloc};
use core::alloc::Layout;
use core::ptr::NonNull;

use crate::error::Error;

/// Size, in bytes, of every slab page. A fixed compile-time constant: the
/// address→slab resolver relies on every page sharing this size and
/// alignment to mask a buffer pointer back down to its owning page base.
pub const PAGE_SIZE: usize = 4096;

/// The single capability a [`crate::Cache`] needs from its environment:
/// page-sized, page-aligned memory.
///
/// # Safety
/// Implementors must return regions that are exactly [`PAGE_SIZE`] bytes,
/// aligned to [`PAGE_SIZE`], writable for their entire lifetime until
/// passed back to [`PageProvider::page_free`], and not aliased by any
/// other live region.
pub unsafe trait PageProvider {
    /// Acquires one page-sized, page-aligned region.
    fn page_alloc(&self) -> Result<NonNull<u8>, Error>;

    /// Releases a region previously returned by [`PageProvider::page_alloc`]
    /// on `self`.
    ///
    /// # Safety
    /// `page` must have been returned by this provider's `page_alloc` and
    /// not already freed.
    unsafe fn page_free(&self, page: NonNull<u8>);
}

fn page_layout() -> Layout {
    // SAFETY: PAGE_SIZE is a nonzero power of two.
    unsafe { Layout::from_size_align_unchecked(PAGE_SIZE, PAGE_SIZE) }
}

/// The default, hosted [`PageProvider`]: pages come from the global
/// allocator. Suitable for `std` use and for tests; a kernel embedding this
/// crate supplies its own provider over its physical page allocator
/// instead (see [`crate::Cache::create_in`]).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPageProvider;

// SAFETY: `alloc`/`dealloc` with a PAGE_SIZE-aligned, PAGE_SIZE-sized
// layout produce and consume exactly the regions PageProvider requires.
unsafe impl PageProvider for SystemPageProvider {
    fn page_alloc(&self) -> Result<NonNull<u8>, Error> {
        // SAFETY: page_layout() is a valid, nonzero-size layout.
        let ptr = unsafe { alloc(page_layout()) };
        NonNull::new(ptr).ok_or_else(|| {
            log::warn!("objcache: system page provider is out of memory");
            Error::OutOfMemory
        })
    }

    unsafe fn page_free(&self, page: NonNull<u8>) {
        // SAFETY: caller guarantees `page` came from `page_alloc` on this
        // provider and has not already been freed.
        unsafe { dealloc(page.as_ptr(), page_layout()) };
    }
}
