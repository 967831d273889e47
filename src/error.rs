/// Errors surfaced by [`crate::Cache`].
///
/// `Cache::free` and `Cache::info` never fail: their preconditions (a valid
/// pointer previously returned by `alloc`, a live cache) are caller-checked.
/// Passing a pointer that did not come from this cache's `alloc` is a
/// caller bug and is undefined behavior, not an error return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display, derive_more::Error)]
pub enum Error {
    /// The page provider could not produce another page.
    #[display("page provider is out of memory")]
    OutOfMemory,
    /// `size`/`align` do not leave room for even one buffer per page.
    #[display("object of requested size/align cannot fit in a single page")]
    ObjectTooLarge,
    /// `size == 0`, or `align != 0` and not a power of two.
    #[display("invalid cache arguments")]
    InvalidArgument,
}
