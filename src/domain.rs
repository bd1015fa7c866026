//! The owned, constructible bundle of epoch state, pin buffers, and handle
//! allocation that [`Table`](crate::table::Table) is built on.

use crate::epoch::Epoch;
use crate::handle::Handle;
use crate::handle::HandleAllocator;
use crate::location::Location;
use crate::pin::PinRegistry;

/// Owns the epoch manager, per-handle pin buffers, and handle allocator
/// shared by every [`Table`](crate::table::Table) built on top of it.
///
/// A `Domain` replaces what would otherwise be process-wide global state
/// with a single constructible, `Send + Sync` value that callers share
/// behind an `Arc`. This makes the reclamation machinery testable in
/// isolation — a fresh `Domain` per test — without cross-test bleed.
///
/// ```
/// use faster_core::Domain;
///
/// let domain = Domain::new();
/// let handle = domain.acquire_handle();
/// domain.release_handle(handle);
/// ```
pub struct Domain {
  epoch: Epoch,
  pins: PinRegistry,
  handles: HandleAllocator,
}

impl Domain {
  /// Constructs a fresh epoch/pin/handle substrate.
  pub fn new() -> Self {
    Self {
      epoch: Epoch::new(),
      pins: PinRegistry::new(),
      handles: HandleAllocator::new(),
    }
  }

  /// Claims a thread handle.
  ///
  /// # Panics
  ///
  /// Panics if more handles are live than this crate's fixed thread limit.
  pub fn acquire_handle(&self) -> Handle {
    self.handles.acquire()
  }

  /// Releases a thread handle.
  pub fn release_handle(&self, handle: Handle) {
    self.handles.release(handle);
  }

  pub(crate) fn protect(&self, handle: &Handle) -> u64 {
    self.epoch.protect(handle)
  }

  pub(crate) fn unprotect(&self, handle: &Handle) {
    self.epoch.unprotect(handle);
  }

  pub(crate) fn protect_and_drain(&self, handle: &Handle) -> u64 {
    self.epoch.protect_and_drain(handle)
  }

  /// Advances the global epoch, draining any triggers that are now safe.
  pub fn bump(&self) -> u64 {
    self.epoch.bump()
  }

  /// Schedules `action` to run once every handle has advanced past the
  /// epoch in effect when this call began.
  pub fn bump_with(&self, handle: &Handle, action: Box<dyn FnOnce() + Send>) {
    self.epoch.bump_with(handle, action);
  }

  pub(crate) fn pin(&self, handle: &Handle, ptr: *mut ()) -> Location {
    self.pins.pin(handle.id(), ptr)
  }

  pub(crate) fn unpin(&self, handle: &Handle, loc: Location) {
    self.pins.unpin(handle.id(), loc);
  }

  /// Same as [`unpin`](Self::unpin), taking a bare handle id.
  ///
  /// Used by deferred reclamation actions, which outlive the borrow of
  /// any particular `&Handle` but are only ever run while the `Domain`
  /// that scheduled them is still alive (see `bucket::delete_from_chain`).
  pub(crate) fn unpin_by_id(&self, caller_id: u32, loc: Location) {
    self.pins.unpin(caller_id, loc);
  }

  pub(crate) fn read(&self, loc: Location) -> *mut () {
    self.pins.read(loc)
  }
}

impl Default for Domain {
  fn default() -> Self {
    Self::new()
  }
}

impl core::fmt::Debug for Domain {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Domain").field("epoch", &self.epoch).field("pins", &self.pins).finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn acquire_release_roundtrip() {
    let domain: Domain = Domain::new();
    let handle = domain.acquire_handle();
    domain.release_handle(handle);
  }

  #[test]
  fn pin_read_unpin_roundtrip() {
    let domain: Domain = Domain::new();
    let handle = domain.acquire_handle();

    let mut value: u64 = 42;
    let ptr: *mut () = core::ptr::addr_of_mut!(value).cast();

    let loc: Location = domain.pin(&handle, ptr);
    assert_eq!(domain.read(loc), ptr);

    domain.unpin(&handle, loc);
    domain.release_handle(handle);
  }

  #[test]
  #[should_panic(expected = "too many thread handles")]
  fn acquire_past_limit_panics() {
    let domain: Domain = Domain::new();
    let mut handles = Vec::new();

    for _ in 0..crate::machine::MAX_THREADS + 1 {
      handles.push(domain.acquire_handle());
    }
  }
}
