use alloc::boxed::Box;
use core::ptr::NonNull;

use crate::error::Error;
use crate::layout::CacheLayout;
use crate::page::{PageProvider, SystemPageProvider};
use crate::ring;
use crate::slab::{self, SlabControl};

/// Runs once per buffer, the first time it is handed out by `alloc`.
/// Receives a pointer to the start of the `size`-byte object region.
pub type Constructor = fn(NonNull<u8>, usize);
/// Runs once per ever-constructed buffer, during `Cache::destroy`/`Drop`.
pub type Destructor = fn(NonNull<u8>, usize);

/// Diagnostic snapshot returned by [`Cache::info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheInfo {
    /// `size_of::<Cache<P>>()` for the caller's page provider type.
    pub cache_struct_size: usize,
    /// Bytes left over at the end of each page after the last buffer.
    pub unused_tail: usize,
    /// `size_of::<SlabControl>()`.
    pub slab_control_size: usize,
    /// Bytes occupied by one buffer, object plus bufctl link word.
    pub buffer_stride: usize,
    /// Buffers packed into one slab.
    pub buffers_per_slab: usize,
    /// Number of slabs currently owned by this cache.
    pub slab_count: usize,
}

/// A handle identifying one kind of object: a slab-based allocator for
/// fixed-size buffers of `size` bytes aligned to `align`, backed by pages
/// from `P`.
///
/// Not `Send`/`Sync`: all operations on one `Cache` must be serialized by
/// the caller. Distinct `Cache`s are independent.
pub struct Cache<P: PageProvider> {
    name: Box<str>,
    ctor: Option<Constructor>,
    dtor: Option<Destructor>,
    current: Option<NonNull<SlabControl>>,
    layout: CacheLayout,
    slab_count: usize,
    page_provider: P,
}

impl<P: PageProvider> core::fmt::Debug for Cache<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.name)
            .field("slab_count", &self.slab_count)
            .finish_non_exhaustive()
    }
}

impl Cache<SystemPageProvider> {
    /// Creates a cache backed by the system's global allocator for pages.
    ///
    /// `align == 0` means "no alignment requirement beyond `size +
    /// sizeof(link_word)`". Fails with [`Error::InvalidArgument`] if
    /// `size == 0` or `align` is nonzero and not a power of two, and with
    /// [`Error::ObjectTooLarge`] if not even one buffer fits in a page.
    pub fn create(
        name: &str,
        size: usize,
        align: usize,
        ctor: Option<Constructor>,
        dtor: Option<Destructor>,
    ) -> Result<Self, Error> {
        Self::create_in(name, size, align, ctor, dtor, SystemPageProvider)
    }
}

impl<P: PageProvider> Cache<P> {
    /// Like [`Cache::create`], backed by a caller-supplied [`PageProvider`]
    /// — the hook an embedding kernel uses to route slab pages through its
    /// own physical page allocator instead of the global allocator.
    pub fn create_in(
        name: &str,
        size: usize,
        align: usize,
        ctor: Option<Constructor>,
        dtor: Option<Destructor>,
        page_provider: P,
    ) -> Result<Self, Error> {
        let layout = CacheLayout::compute(size, align)?;
        log::trace!(
            "objcache: created cache {name:?} (size={size}, align={align}, buffers_per_slab={})",
            layout.buffers_per_slab
        );
        Ok(Self {
            name: name.into(),
            ctor,
            dtor,
            current: None,
            layout,
            slab_count: 0,
            page_provider,
        })
    }

    /// The cache's display name.
    pub fn name(&self) -> &str { &self.name }

    /// Allocates one object.
    ///
    /// Never partially updates the ring on failure: if the page provider
    /// runs out of memory, the cache is left exactly as it was before the
    /// call.
    pub fn alloc(&mut self) -> Result<NonNull<u8>, Error> {
        let mut slab = match self.current {
            Some(slab) => slab,
            None => self.create_slab()?,
        };

        // SAFETY: slab is a live control record owned by this cache.
        if unsafe { (*slab.as_ptr()).free.is_null() } {
            // SAFETY: slab belongs to this cache's ring.
            slab = match unsafe { ring::scan_for_allocatable(slab) } {
                Some(found) => found,
                None => self.create_slab()?,
            };
        }

        // SAFETY: slab has a nonempty free list (either it did already, or
        // scan/create_slab found/made one).
        let (obj, idx) = unsafe {
            let ctl = slab.as_ptr();
            let bufctl = NonNull::new_unchecked((*ctl).free);
            debug_assert!(!bufctl.as_ptr().is_null());

            (*ctl).free = slab::read_link(bufctl);
            (*ctl).ref_count += 1;

            let obj = bufctl.byte_sub(self.layout.size);
            let page_base = slab::page_of(slab, self.layout.slabctl_offset);
            let idx = slab::buffer_index(obj, page_base, self.layout.buffer_stride);
            (obj, idx)
        };

        // SAFETY: slab is exclusively owned by this cache while `&mut
        // self` is held.
        let slab_ref = unsafe { slab.as_mut() };
        if !slab_ref.is_constructed(idx) {
            if let Some(ctor) = self.ctor {
                ctor(obj, self.layout.size);
            }
            slab_ref.set_constructed(idx);
        }

        self.current = Some(slab);
        Ok(obj)
    }

    /// Returns `obj` to its slab's free list and rebalances the ring to
    /// preserve the empty→partial→complete ordering invariant. The
    /// destructor is not run here; it runs only in [`Cache::destroy`]/on
    /// drop.
    ///
    /// # Safety
    /// `obj` must have been returned by a prior `alloc` on this cache and
    /// not yet freed. Passing any other pointer is undefined behavior; this
    /// is a caller contract, not a checked precondition.
    pub unsafe fn free(&mut self, obj: NonNull<u8>) {
        unsafe {
            let slab = slab::resolve(obj, self.layout.slabctl_offset);
            let ctl = slab.as_ptr();

            let bufctl = obj.byte_add(self.layout.size);
            let prev_head = (*ctl).free;
            slab::write_link(bufctl, prev_head);
            (*ctl).free = bufctl.as_ptr();
            (*ctl).ref_count -= 1;

            self.current = Some(slab);

            if (*ctl).next == ctl {
                // Only one slab exists; nothing to rebalance.
                return;
            }

            if (*ctl).ref_count == 0 {
                // This slab just became fully free ("complete"); it must
                // move to the tail of the ring, after the last partial slab.
                let mut cur = (*ctl).next;
                while (*cur).ref_count > 0 {
                    cur = (*cur).next;
                }
                let partial_tail = NonNull::new_unchecked((*cur).prev);
                ring::insert_after(partial_tail, slab);
                return;
            }

            if !(*(*ctl).next).free.is_null() {
                // Next slab already has free buffers (partial or complete):
                // this slab is already correctly positioned at the head of
                // the partial region.
                return;
            }

            // This slab just transitioned out of the fully-allocated
            // ("empty") region into "partial", but its successor is still
            // fully allocated. Walk forward over the run of empty slabs to
            // find the empty/partial boundary, then splice this slab in
            // right after the last empty slab. The loop must advance while
            // the node is still empty, not stop at the first one — a run of
            // more than one empty successor would otherwise leave this slab
            // spliced in one position too early.
            let mut cur = (*ctl).next;
            while (*cur).free.is_null() {
                cur = (*cur).next;
            }
            let last_empty = NonNull::new_unchecked((*cur).prev);
            ring::insert_after(last_empty, slab);
        }
    }

    /// Diagnostic snapshot. Never fails.
    pub fn info(&self) -> CacheInfo {
        CacheInfo {
            cache_struct_size: core::mem::size_of::<Self>(),
            unused_tail: self.layout.unused_tail,
            slab_control_size: core::mem::size_of::<SlabControl>(),
            buffer_stride: self.layout.buffer_stride,
            buffers_per_slab: self.layout.buffers_per_slab,
            slab_count: self.slab_count,
        }
    }

    /// Releases every slab: runs `dtor` over every buffer that was ever
    /// constructed, then frees every page. Equivalent to dropping the
    /// cache; provided as an explicit, named entry point for callers who
    /// want the release to read as intentional at the call site.
    pub fn destroy(self) {}

    /// Creates one new slab, splices it into the ring next to the current
    /// slab (or starts a fresh ring if this is the first slab), and makes
    /// it current.
    fn create_slab(&mut self) -> Result<NonNull<SlabControl>, Error> {
        let page = self.page_provider.page_alloc()?;
        // SAFETY: page is a freshly allocated, exclusively owned,
        // PAGE_SIZE-aligned region.
        let slab = unsafe { slab::format(page, &self.layout) };
        if let Some(cur) = self.current {
            // SAFETY: cur belongs to this cache's ring; slab is a fresh,
            // self-looped singleton.
            unsafe { ring::insert_after(cur, slab) };
        }
        self.slab_count += 1;
        self.current = Some(slab);
        log::trace!("objcache: cache {:?} grew to {} slab(s)", self.name, self.slab_count);
        Ok(slab)
    }

    /// Runs `dtor` over every constructed buffer of `slab`, then releases
    /// its page.
    ///
    /// # Safety
    /// `slab` must not be accessed (by this cache or any other reference)
    /// after this call returns.
    unsafe fn destroy_one_slab(&mut self, slab: NonNull<SlabControl>) {
        unsafe {
            if let Some(dtor) = self.dtor {
                let page_base = slab::page_of(slab, self.layout.slabctl_offset);
                let slab_ref = slab.as_ref();
                for idx in 0..self.layout.buffers_per_slab {
                    if slab_ref.is_constructed(idx) {
                        let buf = slab::buffer_at(page_base, &self.layout, idx);
                        dtor(buf, self.layout.size);
                    }
                }
            }
            let page_base = slab::page_of(slab, self.layout.slabctl_offset);
            self.page_provider.page_free(page_base);
        }
    }
}

impl<P: PageProvider> Drop for Cache<P> {
    fn drop(&mut self) {
        let Some(start) = self.current else { return };
        log::trace!("objcache: dropping cache {:?} ({} slab(s))", self.name, self.slab_count);

        let mut slab = start.as_ptr();
        loop {
            // SAFETY: slab is a live control record; read `next` before
            // destroying `slab` so we never touch freed memory.
            let next = unsafe { (*slab).next };
            // SAFETY: slab has not yet been destroyed this pass.
            unsafe { self.destroy_one_slab(NonNull::new_unchecked(slab)) };
            if next == start.as_ptr() {
                break;
            }
            slab = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use proptest::prelude::*;

    use super::*;

    #[repr(C)]
    struct Point { x: i32, y: i32 }

    fn init_point(ptr: NonNull<u8>, size: usize) {
        debug_assert_eq!(size, core::mem::size_of::<Point>());
        // SAFETY: ptr points to `size` freshly reserved, writable bytes.
        unsafe { ptr.cast::<Point>().write(Point { x: 33, y: 22 }) };
    }

    #[test]
    fn first_alloc_allocates_exactly_one_slab() {
        let mut cache = Cache::create("points", core::mem::size_of::<Point>(), 0, Some(init_point), None).unwrap();
        let p = cache.alloc().unwrap();
        assert_eq!(cache.info().slab_count, 1);
        // SAFETY: p was just allocated and constructed by init_point.
        let point = unsafe { p.cast::<Point>().as_ref() };
        assert_eq!((point.x, point.y), (33, 22));
    }

    #[test]
    fn free_then_alloc_returns_the_same_pointer() {
        let mut cache = Cache::create("ints", 8, 0, None, None).unwrap();
        let p = cache.alloc().unwrap();
        unsafe { cache.free(p) };
        let q = cache.alloc().unwrap();
        assert_eq!(p, q);
    }

    #[test]
    fn allocating_n_plus_one_grows_to_two_slabs() {
        let mut cache = Cache::create("bytes", 12, 0, None, None).unwrap();
        let n = cache.info().buffers_per_slab;
        let mut ptrs = alloc::vec::Vec::new();
        for _ in 0..n {
            ptrs.push(cache.alloc().unwrap());
        }
        assert_eq!(cache.info().slab_count, 1);
        ptrs.push(cache.alloc().unwrap());
        assert_eq!(cache.info().slab_count, 2);
    }

    #[test]
    fn constructor_runs_exactly_once_per_buffer() {
        static COUNT: AtomicUsize = AtomicUsize::new(0);
        fn ctor(ptr: NonNull<u8>, size: usize) {
            COUNT.fetch_add(1, Ordering::SeqCst);
            // SAFETY: ptr/size describe a freshly reserved buffer.
            unsafe { ptr.as_ptr().write_bytes(0u8, size) };
        }

        let mut cache = Cache::create("tracked", 16, 0, Some(ctor), None).unwrap();
        let n = cache.info().buffers_per_slab;

        let mut ptrs = alloc::vec::Vec::with_capacity(n);
        for _ in 0..n {
            ptrs.push(cache.alloc().unwrap());
        }
        assert_eq!(COUNT.load(Ordering::SeqCst), n);

        let fiftieth = ptrs[49];
        unsafe { cache.free(fiftieth) };
        let reallocated = cache.alloc().unwrap();

        assert_eq!(reallocated, fiftieth);
        assert_eq!(COUNT.load(Ordering::SeqCst), n, "reallocating a freed buffer must not re-run the constructor");
    }

    #[test]
    fn destructor_runs_only_for_constructed_buffers_and_only_on_destroy() {
        static DESTROYED: AtomicUsize = AtomicUsize::new(0);
        fn dtor(_ptr: NonNull<u8>, _size: usize) {
            DESTROYED.fetch_add(1, Ordering::SeqCst);
        }

        let mut cache = Cache::create("dtor", 8, 0, None, Some(dtor)).unwrap();
        let a = cache.alloc().unwrap();
        let _b = cache.alloc().unwrap();
        unsafe { cache.free(a) };
        assert_eq!(DESTROYED.load(Ordering::SeqCst), 0, "free must never invoke the destructor");

        cache.destroy();
        assert_eq!(DESTROYED.load(Ordering::SeqCst), 2, "destroy must run dtor once per ever-constructed buffer");
    }

    #[test]
    fn freeing_every_object_in_turn_reorders_the_ring_but_keeps_it_allocatable() {
        let mut cache = Cache::create("reorder", 12, 0, None, None).unwrap();
        let n = cache.info().buffers_per_slab;

        let mut ptrs = alloc::vec::Vec::with_capacity(n * 3 + 1);
        for _ in 0..(n * 3 + 1) {
            ptrs.push(cache.alloc().unwrap());
        }
        assert_eq!(cache.info().slab_count, 4);

        // Freeing the very first allocated pointer (in the first slab)
        // should make that slab partial and hand it straight back out.
        let first = ptrs[0];
        unsafe { cache.free(first) };
        let reused = cache.alloc().unwrap();
        assert_eq!(reused, first);
        assert_eq!(cache.info().slab_count, 4, "freeing and reallocating must not create a new slab");
    }

    #[test]
    fn info_reports_consistent_layout() {
        let cache = Cache::create("info", 12, 0, None, None).unwrap();
        let info = cache.info();
        assert_eq!(info.buffer_stride, 20);
        assert_eq!(info.slab_count, 0);
        assert_eq!(info.slab_control_size, core::mem::size_of::<SlabControl>());
    }

    #[test]
    fn invalid_arguments_are_rejected() {
        assert_eq!(Cache::create("zero", 0, 0, None, None).unwrap_err(), Error::InvalidArgument);
        assert_eq!(Cache::create("bad-align", 8, 3, None, None).unwrap_err(), Error::InvalidArgument);
    }

    #[test]
    fn object_too_large_is_rejected() {
        assert_eq!(
            Cache::create("huge", crate::page::PAGE_SIZE, 0, None, None).unwrap_err(),
            Error::ObjectTooLarge
        );
    }

    /// Category rank for the ring-ordering invariant (a forward traversal
    /// must match `E*P*C*` cyclically): empty (full, no free buffers) <
    /// partial < complete (fully free).
    fn slab_rank(ctl: &SlabControl, n: usize) -> u8 {
        let ref_count = ctl.ref_count as usize;
        if ref_count == n {
            0
        } else if ref_count == 0 {
            2
        } else {
            1
        }
    }

    /// Walks the ring starting at `start` and returns each slab's rank in
    /// traversal order. Only usable while every slab is reachable from
    /// `start`, which holds for every `Cache` whose ring is non-empty.
    fn ring_ranks(start: NonNull<SlabControl>, n: usize) -> alloc::vec::Vec<u8> {
        let mut ranks = alloc::vec::Vec::new();
        // SAFETY: start belongs to a live, well-formed ring.
        unsafe {
            let mut cur = start.as_ptr();
            loop {
                ranks.push(slab_rank(&*cur, n));
                cur = (*cur).next;
                if cur == start.as_ptr() {
                    break;
                }
            }
        }
        ranks
    }

    /// A cyclic sequence of ranks matches `E*P*C*` (up to rotation) iff
    /// there is at most one point where the rank decreases when stepping
    /// forward — the single wrap-around from the last `C` back to the
    /// first `E`.
    fn is_cyclically_nondecreasing(ranks: &[u8]) -> bool {
        let len = ranks.len();
        if len <= 1 {
            return true;
        }
        let descents = (0..len).filter(|&i| ranks[i] > ranks[(i + 1) % len]).count();
        descents <= 1
    }

    #[derive(Clone, Copy, Debug)]
    enum Op {
        Alloc,
        Free,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![3 => Just(Op::Alloc), 2 => Just(Op::Free)]
    }

    proptest! {
        // Ring-ordering invariant: after every alloc/free, a forward
        // traversal of the ring must match `E*P*C*` cyclically. This needs
        // crate-internal access to `SlabControl`, so it lives here rather
        // than in the black-box integration tests.
        #[test]
        fn ring_stays_ordered_empty_partial_complete(
            ops in proptest::collection::vec(op_strategy(), 1..300)
        ) {
            let mut cache = Cache::create("ring-order", 24, 0, None, None).unwrap();
            let mut live: alloc::vec::Vec<NonNull<u8>> = alloc::vec::Vec::new();

            for op in ops {
                match op {
                    Op::Alloc => live.push(cache.alloc().unwrap()),
                    Op::Free => {
                        if let Some(p) = live.pop() {
                            // SAFETY: p was returned by alloc above and
                            // removed from `live`, so it is freed once.
                            unsafe { cache.free(p) };
                        }
                    }
                }

                if let Some(start) = cache.current {
                    let n = cache.layout.buffers_per_slab;
                    let ranks = ring_ranks(start, n);
                    prop_assert!(
                        is_cyclically_nondecreasing(&ranks),
                        "ring ranks not E*P*C* cyclically: {:?}",
                        ranks
                    );
                }
            }

            for p in live {
                // SAFETY: p was returned by alloc above and not yet freed.
                unsafe { cache.free(p) };
            }
        }
    }
}
