//! Fixed machine-level constants shared by every subsystem.

/// Size, in bytes, of a cache line on the architectures this crate targets.
pub(crate) const CACHE_LINE: usize = 64;

/// Number of bits needed to index a thread handle.
pub(crate) const MAX_THREAD_BITS: u32 = 6;

/// Maximum number of concurrently live [`Handle`](crate::handle::Handle)s.
///
/// Fixed at compile time rather than made configurable: every per-handle
/// array (epoch entries, pin buffers) is sized to this bound up front.
pub(crate) const MAX_THREADS: usize = 1 << MAX_THREAD_BITS;

/// Capacity of the epoch trigger ring.
pub(crate) const MAX_TRIGGERS: usize = 256;

const _: () = assert!(MAX_THREADS == 64, "MAX_THREADS must stay in sync with MAX_THREAD_BITS");
