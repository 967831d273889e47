use core::ptr::NonNull;

use bitvec::order::Lsb0;
use bitvec::view::BitView;

use crate::layout::CacheLayout;
use crate::page::PAGE_SIZE;

/// Number of `u64` words backing the constructed-state bitmap.
/// Sized for the worst case: the smallest possible `buffer_stride`
/// (`size = 1`, `align = 0`) at `PAGE_SIZE = 4096`.
const BITMAP_WORDS: usize = 8;
const BITMAP_BITS: usize = BITMAP_WORDS * 64;

const _ASSERT_BITMAP_CAPACITY_COVERS_WORST_CASE: () = {
    let min_stride = 1 + crate::layout::LINK_WORD_SIZE;
    let available = PAGE_SIZE - core::mem::size_of::<SlabControl>();
    assert!(available / min_stride <= BITMAP_BITS);
};

/// Per-slab metadata record: reference count, free-list head, ring links,
/// and the constructed-state bitmap. Lives at a fixed offset
/// (`CacheLayout::slabctl_offset`) inside every slab page of a cache.
///
/// `next`/`prev` are never null: a lone slab self-loops (its own ring of
/// one).
#[repr(C)]
pub(crate) struct SlabControl {
    pub(crate) ref_count: u32,
    pub(crate) free: *mut u8,
    pub(crate) next: *mut SlabControl,
    pub(crate) prev: *mut SlabControl,
    pub(crate) constructed: [u64; BITMAP_WORDS],
}

impl SlabControl {
    pub(crate) fn is_constructed(&self, idx: usize) -> bool {
        self.constructed.view_bits::<Lsb0>()[idx]
    }

    pub(crate) fn set_constructed(&mut self, idx: usize) {
        self.constructed.view_bits_mut::<Lsb0>().set(idx, true);
    }
}

/// Reads the free-list link word stored at `bufctl`.
///
/// # Safety
/// `bufctl` must point to a valid, initialized link word within a slab
/// buffer of this cache.
#[inline]
pub(crate) unsafe fn read_link(bufctl: NonNull<u8>) -> *mut u8 {
    // SAFETY: caller guarantees `bufctl` is a valid link word. The word is
    // not generally pointer-aligned (it sits at buffer offset `size`), so
    // an unaligned access is required.
    unsafe { bufctl.as_ptr().cast::<*mut u8>().read_unaligned() }
}

/// Writes `next` into the free-list link word stored at `bufctl`.
///
/// # Safety
/// `bufctl` must point to valid, writable space for a link word within a
/// slab buffer of this cache.
#[inline]
pub(crate) unsafe fn write_link(bufctl: NonNull<u8>, next: *mut u8) {
    // SAFETY: see `read_link`.
    unsafe { bufctl.as_ptr().cast::<*mut u8>().write_unaligned(next) };
}

/// Address of buffer `idx`'s bufctl link word, given the page base.
#[inline]
pub(crate) fn bufctl_at(page: NonNull<u8>, layout: &CacheLayout, idx: usize) -> NonNull<u8> {
    // SAFETY: idx < buffers_per_slab keeps this within the page.
    unsafe { page.byte_add(idx * layout.buffer_stride + layout.size) }
}

/// Address of buffer `idx`'s object region, given the page base.
#[inline]
pub(crate) fn buffer_at(page: NonNull<u8>, layout: &CacheLayout, idx: usize) -> NonNull<u8> {
    // SAFETY: idx < buffers_per_slab keeps this within the page.
    unsafe { page.byte_add(idx * layout.buffer_stride) }
}

/// Formats a freshly obtained page into a slab: threads the free list
/// through every buffer's bufctl and initializes the slab control record.
/// The new slab is a self-looped ring of one; callers splice it into an
/// existing ring with [`crate::ring::insert_after`] when needed.
///
/// # Safety
/// `page` must be a live, exclusively owned, [`PAGE_SIZE`]-aligned region
/// of at least `PAGE_SIZE` bytes.
pub(crate) unsafe fn format(page: NonNull<u8>, layout: &CacheLayout) -> NonNull<SlabControl> {
    let n = layout.buffers_per_slab;
    for i in 0..n {
        let bufctl = bufctl_at(page, layout, i);
        let next = if i + 1 == n {
            core::ptr::null_mut()
        } else {
            bufctl_at(page, layout, i + 1).as_ptr()
        };
        // SAFETY: bufctl is within the page, freshly owned and writable.
        unsafe { write_link(bufctl, next) };
    }

    let slabctl_ptr = unsafe { page.byte_add(layout.slabctl_offset) }.cast::<SlabControl>();
    let first_bufctl = bufctl_at(page, layout, 0).as_ptr();
    // SAFETY: slabctl_ptr is within the page (checked by CacheLayout) and
    // suitably aligned (CacheLayout::compute asserts this).
    unsafe {
        slabctl_ptr.as_ptr().write(SlabControl {
            ref_count: 0,
            free: first_bufctl,
            next: slabctl_ptr.as_ptr(),
            prev: slabctl_ptr.as_ptr(),
            constructed: [0u64; BITMAP_WORDS],
        });
    }
    slabctl_ptr
}

/// Recovers the page base owning `slab`'s control record.
#[inline]
pub(crate) fn page_of(slab: NonNull<SlabControl>, slabctl_offset: usize) -> NonNull<u8> {
    // SAFETY: every slab control record lives at `slabctl_offset` bytes
    // into its page, by construction.
    unsafe { slab.cast::<u8>().byte_sub(slabctl_offset) }
}

/// Address→slab resolver: recovers the enclosing slab's control record
/// from a pointer into one of its buffers, by masking the page base out
/// of the pointer's low bits.
///
/// # Safety
/// `obj` must be a pointer previously returned by `alloc` on a cache with
/// this `slabctl_offset`, and not yet freed.
pub(crate) unsafe fn resolve(obj: NonNull<u8>, slabctl_offset: usize) -> NonNull<SlabControl> {
    let page_base = (obj.as_ptr() as usize) & !(PAGE_SIZE - 1);
    let slabctl_addr = page_base + slabctl_offset;
    // SAFETY: page_base is nonzero (no slab is ever placed at the null
    // page) since it is derived from a valid, non-null `obj`.
    unsafe { NonNull::new_unchecked(slabctl_addr as *mut SlabControl) }
}

/// Index of `obj`'s buffer within its slab, given the slab's page base.
#[inline]
pub(crate) fn buffer_index(obj: NonNull<u8>, page_base: NonNull<u8>, buffer_stride: usize) -> usize {
    let offset = obj.as_ptr() as usize - page_base.as_ptr() as usize;
    offset / buffer_stride
}
