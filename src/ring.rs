use core::ptr::NonNull;

use crate::slab::SlabControl;

/// Unlinks `v` from wherever it currently sits, then splices it in as the
/// successor of `u`. Used both to place a freshly created slab next to the
/// current one, and by `Cache::free`'s rebalance to preserve the
/// empty→partial→complete ordering invariant.
///
/// # Safety
/// `u` and `v` must be control records belonging to the same cache's ring
/// (or `v` may be a freshly formatted, self-looped singleton).
pub(crate) unsafe fn insert_after(u: NonNull<SlabControl>, v: NonNull<SlabControl>) {
    unsafe {
        let u = u.as_ptr();
        let v = v.as_ptr();

        let v_prev = (*v).prev;
        let v_next = (*v).next;
        (*v_prev).next = v_next;
        (*v_next).prev = v_prev;

        let u_next = (*u).next;
        (*v).next = u_next;
        (*v).prev = u;
        (*u_next).prev = v;
        (*u).next = v;
    }
}

/// Walks `next` from `start->next` looking for a slab with a nonempty free
/// list, wrapping back to `start` without finding one if every slab in the
/// ring is full.
///
/// # Safety
/// `start` must be a control record belonging to a well-formed ring.
pub(crate) unsafe fn scan_for_allocatable(start: NonNull<SlabControl>) -> Option<NonNull<SlabControl>> {
    unsafe {
        let mut cur = (*start.as_ptr()).next;
        while cur != start.as_ptr() {
            if !(*cur).free.is_null() {
                return Some(NonNull::new_unchecked(cur));
            }
            cur = (*cur).next;
        }
        None
    }
}
