//! Per-thread pin buffers: the allocator that hands out [`Location`] tokens
//! and keeps the pointers behind them alive until [`unpin`](PinRegistry::unpin).

use core::cell::UnsafeCell;
use core::ptr;
use crate::sync::atomic::AtomicPtr;
use crate::sync::atomic::Ordering;

use crate::location::Location;
use crate::machine::MAX_THREADS;
use crate::padded::CachePadded;

const INITIAL_BITS: u32 = 4;

/// A growable, power-of-two-sized array of raw pointer slots.
struct Slots {
  mask: u32,
  ptrs: Box<[AtomicPtr<()>]>,
}

impl Slots {
  fn with_bits(bits: u32) -> Self {
    let len: usize = 1usize << bits;
    let ptrs: Box<[AtomicPtr<()>]> = (0..len).map(|_| AtomicPtr::new(ptr::null_mut())).collect();

    Self {
      mask: (len - 1) as u32,
      ptrs,
    }
  }

  fn len(&self) -> usize {
    self.ptrs.len()
  }
}

struct UnpinnedNode {
  next: *mut UnpinnedNode,
  loc: Location,
}

/// A single handle's pin buffer.
///
/// `slots`, `start`, and `free` are mutated only by the owning handle;
/// `unpinned` may be pushed to by any thread and is drained only by the
/// owner on its next [`pin`](Self::pin) call.
pub(crate) struct PinBuffer {
  slots: AtomicPtr<Slots>,
  start: UnsafeCell<u32>,
  free: UnsafeCell<u32>,
  unpinned: AtomicPtr<UnpinnedNode>,
}

// SAFETY: `slots` is read/written through atomics; `start`/`free` are
// mutated only by the single owning handle, matching the cross-thread
// contract documented on the struct.
unsafe impl Sync for PinBuffer {}
// SAFETY: ownership of the raw `Slots`/`UnpinnedNode` allocations transfers
// cleanly; nothing here is thread-local.
unsafe impl Send for PinBuffer {}

impl PinBuffer {
  fn new() -> Self {
    let slots: Box<Slots> = Box::new(Slots::with_bits(INITIAL_BITS));

    Self {
      slots: AtomicPtr::new(Box::into_raw(slots)),
      start: UnsafeCell::new(0),
      free: UnsafeCell::new(1 << INITIAL_BITS),
      unpinned: AtomicPtr::new(ptr::null_mut()),
    }
  }

  fn current_slots(&self) -> &Slots {
    // SAFETY: `slots` always points at a live, leaked `Slots` allocation;
    // grows publish a new pointer with `Release` before the old one could
    // be dropped (it never is — see `grow`).
    unsafe { &*self.slots.load(Ordering::Acquire) }
  }

  /// Drains the cross-thread deferred-unpin stack. Owner-only.
  fn drain_unpinned(&self) {
    let mut head: *mut UnpinnedNode = self.unpinned.swap(ptr::null_mut(), Ordering::AcqRel);

    while !head.is_null() {
      // SAFETY: nodes are pushed via `Box::into_raw` in `push_unpinned` and
      // only ever reclaimed here, once, after being unlinked from the stack.
      let node: Box<UnpinnedNode> = unsafe { Box::from_raw(head) };
      head = node.next;

      self.free_slot(node.loc);
    }
  }

  /// Nils out the slot for `loc` and returns it to the free count.
  /// Owner-only.
  fn free_slot(&self, loc: Location) {
    let slots: &Slots = self.current_slots();
    let index: usize = loc.index() as usize & slots.mask as usize;

    slots.ptrs[index].store(ptr::null_mut(), Ordering::Release);

    // SAFETY: owner-only access, as documented on the struct.
    unsafe { *self.free.get() += 1 };
  }

  /// Doubles the buffer's capacity. Owner-only.
  fn grow(&self) {
    let old: &Slots = self.current_slots();
    let old_len: usize = old.len();
    let new_bits: u32 = (old_len * 2).trailing_zeros();
    let grown: Box<Slots> = Box::new(Slots::with_bits(new_bits));

    for (i, slot) in old.ptrs.iter().enumerate() {
      grown.ptrs[i].store(slot.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    let added: u32 = (grown.len() - old_len) as u32;

    // Old slots are intentionally leaked rather than freed: a concurrent
    // cross-thread `read` may still be mid-dereference through the pointer
    // this swap is about to replace, and there is no epoch deferral wired
    // to a bare grow (the buffer has no handle on hand to `bump_with`).
    // Growth is logarithmic in the buffer's lifetime, so this is bounded.
    self.slots.store(Box::into_raw(grown), Ordering::Release);

    // SAFETY: owner-only access.
    unsafe { *self.free.get() += added };
  }

  /// Pins `ptr`, returning the [`Location`] (sans owner id) that resolves
  /// to it until `unpin`.
  fn pin(&self, id: u32, ptr: *mut ()) -> Location {
    self.drain_unpinned();

    // SAFETY: owner-only access.
    if unsafe { *self.free.get() } == 0 {
      self.grow();
    }

    let slots: &Slots = self.current_slots();
    // SAFETY: owner-only access.
    let start: u32 = unsafe { *self.start.get() };

    let mut cursor: u32 = start & slots.mask;

    loop {
      if slots.ptrs[cursor as usize].load(Ordering::Relaxed).is_null() {
        slots.ptrs[cursor as usize].store(ptr, Ordering::Release);

        // SAFETY: owner-only access.
        unsafe {
          *self.free.get() -= 1;
          *self.start.get() = cursor.wrapping_add(1);
        }

        return Location::new(id, cursor as u64);
      }

      cursor = cursor.wrapping_add(1) & slots.mask;
    }
  }

  /// Unpins a slot owned by this buffer, from the owning thread.
  fn unpin_local(&self, loc: Location) {
    self.free_slot(loc);
  }

  /// Defers the unpin of a slot owned by this buffer, from another thread.
  fn push_unpinned(&self, loc: Location) {
    let node: *mut UnpinnedNode = Box::into_raw(Box::new(UnpinnedNode {
      next: ptr::null_mut(),
      loc,
    }));

    loop {
      let head: *mut UnpinnedNode = self.unpinned.load(Ordering::Acquire);

      // SAFETY: `node` was just allocated and is not yet shared.
      unsafe { (*node).next = head };

      if self
        .unpinned
        .compare_exchange(head, node, Ordering::AcqRel, Ordering::Relaxed)
        .is_ok()
      {
        return;
      }
    }
  }

  fn read(&self, loc: Location) -> *mut () {
    let slots: &Slots = self.current_slots();
    let index: usize = loc.index() as usize & slots.mask as usize;

    slots.ptrs[index].load(Ordering::Acquire)
  }
}

impl Drop for PinBuffer {
  fn drop(&mut self) {
    // Drain any deferred unpins so their boxed nodes don't leak.
    self.drain_unpinned();

    let slots: *mut Slots = self.slots.load(Ordering::Acquire);

    if !slots.is_null() {
      // SAFETY: no other reference to this buffer's current slots can
      // exist once the buffer itself is being dropped.
      drop(unsafe { Box::from_raw(slots) });
    }
  }
}

/// Owns one [`PinBuffer`] per possible handle id.
pub(crate) struct PinRegistry {
  buffers: Box<[CachePadded<PinBuffer>; MAX_THREADS]>,
}

impl PinRegistry {
  pub(crate) fn new() -> Self {
    Self {
      buffers: Box::new(core::array::from_fn(|_| CachePadded::new(PinBuffer::new()))),
    }
  }

  /// Pins `ptr` on behalf of `id`, returning a token that resolves to it
  /// until [`unpin`](Self::unpin). Not safe to call concurrently with
  /// another call using the same `id`.
  pub(crate) fn pin(&self, id: u32, ptr: *mut ()) -> Location {
    self.buffers[id as usize].pin(id, ptr)
  }

  /// Releases the token `loc`, owned by handle `loc.id()`. May be called
  /// from any thread.
  pub(crate) fn unpin(&self, caller_id: u32, loc: Location) {
    let owner: &PinBuffer = &self.buffers[loc.id() as usize];

    if caller_id == loc.id() {
      owner.unpin_local(loc);
    } else {
      owner.push_unpinned(loc);
    }
  }

  /// Resolves `loc` to the pointer it was pinned with. Safe from any
  /// thread, as long as it does not race with `unpin` of the same `loc`.
  pub(crate) fn read(&self, loc: Location) -> *mut () {
    self.buffers[loc.id() as usize].read(loc)
  }
}

impl core::fmt::Debug for PinRegistry {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("PinRegistry").field("handles", &MAX_THREADS).finish()
  }
}
