//! Thread-affinity tokens and their allocator.

use crate::sync::atomic::AtomicBool;
use crate::sync::atomic::AtomicU32;
use crate::sync::atomic::Ordering;

use crate::machine::MAX_THREADS;

/// A thread-affinity token identifying one slot of a [`Domain`](crate::domain::Domain).
///
/// A `Handle` is not `Clone`; exactly one thread may hold it at a time and
/// every call made with it must be non-concurrent with any other call made
/// with the same `Handle`. Release it with
/// [`Domain::release_handle`](crate::domain::Domain::release_handle) when done.
#[derive(Debug)]
pub struct Handle {
  id: u32,
}

impl Handle {
  pub(crate) fn new(id: u32) -> Self {
    Self { id }
  }

  #[inline]
  pub(crate) fn id(&self) -> u32 {
    self.id
  }
}

/// Claims and releases [`Handle`] slots.
///
/// Slots are tracked with one atomic flag per thread rather than a free
/// list: handles are acquired and released rarely compared to the table
/// operations they guard, so a linear probe is in no way a bottleneck.
#[derive(Debug)]
pub(crate) struct HandleAllocator {
  next: AtomicU32,
  used: [AtomicBool; MAX_THREADS],
}

impl HandleAllocator {
  pub(crate) fn new() -> Self {
    Self {
      next: AtomicU32::new(0),
      used: [const { AtomicBool::new(false) }; MAX_THREADS],
    }
  }

  /// Claims a free slot.
  ///
  /// # Panics
  ///
  /// Panics if more than [`MAX_THREADS`] handles are live simultaneously.
  pub(crate) fn acquire(&self) -> Handle {
    let start: u32 = self.next.fetch_add(1, Ordering::Relaxed);

    for probe in 0..(2 * MAX_THREADS as u32) {
      let id: u32 = (start.wrapping_add(probe)) % MAX_THREADS as u32;

      if self.used[id as usize]
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
        .is_ok()
      {
        return Handle::new(id);
      }
    }

    panic!("too many thread handles: at most {MAX_THREADS} may be live at once");
  }

  pub(crate) fn release(&self, handle: Handle) {
    self.used[handle.id() as usize].store(false, Ordering::Release);
  }
}
