//! Global epoch tracking and deferred-action triggers.
//!
//! Ported from the epoch manager of the FASTER-style store this crate is
//! modeled on: a monotonic epoch counter, one entry per live handle
//! recording the epoch it last protected, and a fixed ring of deferred
//! actions ("triggers") that run once no handle can still observe the
//! epoch they were scheduled at.

use core::cell::UnsafeCell;
use crate::sync::atomic::AtomicU32;
use crate::sync::atomic::AtomicU64;
use crate::sync::atomic::Ordering;
use std::time::Duration;

use crate::handle::Handle;
use crate::machine::MAX_THREADS;
use crate::machine::MAX_TRIGGERS;
use crate::padded::CachePadded;

/// Epoch value meaning "this trigger slot holds no action."
const FREE: u64 = u64::MAX;

/// Epoch value meaning "this trigger slot is being mutated; do not touch."
const LOCKED: u64 = u64::MAX - 1;

/// How many full scans of the trigger ring to attempt before warning.
const SLOWDOWN_THRESHOLD: u32 = 500;

type Action = Box<dyn FnOnce() + Send>;

/// Per-handle record of the last epoch that handle protected.
///
/// `local == 0` means the handle is not currently in a protected region.
struct Entry {
  local: AtomicU64,
  /// Reserved for recovery-phase bookkeeping in the system this crate's
  /// algorithms are modeled on; unused here (checkpointing is out of scope).
  #[allow(dead_code)]
  phase: AtomicU32,
}

impl Entry {
  const fn new() -> Self {
    Self {
      local: AtomicU64::new(0),
      phase: AtomicU32::new(0),
    }
  }
}

/// One slot of the deferred-action ring.
///
/// The `epoch` field doubles as a spinlock: claiming a slot means CASing
/// its epoch to [`LOCKED`], which serializes access to the non-atomic
/// `action` cell against every other thread trying to claim or run it.
struct Trigger {
  epoch: AtomicU64,
  action: UnsafeCell<Option<Action>>,
}

impl Trigger {
  const fn new() -> Self {
    Self {
      epoch: AtomicU64::new(FREE),
      action: UnsafeCell::new(None),
    }
  }
}

// SAFETY: `action` is only ever read or written while this slot's `epoch`
// has been CAS'd to `LOCKED` by the accessing thread, which gives that
// thread exclusive access to the cell until it publishes a new epoch.
unsafe impl Sync for Trigger {}

/// Owns the global epoch counter, per-handle protection state, and the
/// deferred-action ring.
pub(crate) struct Epoch {
  current: AtomicU64,
  safe: AtomicU64,
  entries: Box<[CachePadded<Entry>; MAX_THREADS]>,
  triggers: Box<[Trigger; MAX_TRIGGERS]>,
  trigger_count: AtomicU64,
}

impl Epoch {
  pub(crate) fn new() -> Self {
    Self {
      current: AtomicU64::new(1),
      safe: AtomicU64::new(0),
      entries: Box::new([const { CachePadded::new(Entry::new()) }; MAX_THREADS]),
      triggers: Box::new([const { Trigger::new() }; MAX_TRIGGERS]),
      trigger_count: AtomicU64::new(0),
    }
  }

  /// Enters a protected region, returning the epoch observed.
  pub(crate) fn protect(&self, handle: &Handle) -> u64 {
    let epoch: u64 = self.current.load(Ordering::Acquire);
    self.entries[handle.id() as usize].local.store(epoch, Ordering::Release);
    epoch
  }

  /// Exits a protected region.
  pub(crate) fn unprotect(&self, handle: &Handle) {
    self.entries[handle.id() as usize].local.store(0, Ordering::Release);
  }

  /// [`Self::protect`], additionally draining triggers if any are pending.
  pub(crate) fn protect_and_drain(&self, handle: &Handle) -> u64 {
    let epoch: u64 = self.protect(handle);

    if self.trigger_count.load(Ordering::Acquire) > 0 {
      self.drain(epoch);
    }

    epoch
  }

  /// Advances the global epoch, draining triggers if any are pending.
  pub(crate) fn bump(&self) -> u64 {
    let epoch: u64 = self.current.fetch_add(1, Ordering::AcqRel) + 1;

    if self.trigger_count.load(Ordering::Acquire) > 0 {
      self.drain(epoch);
    }

    epoch
  }

  /// Schedules `action` to run once every handle has advanced past the
  /// epoch in effect when this call began.
  pub(crate) fn bump_with(&self, handle: &Handle, action: Action) {
    let prior: u64 = self.bump() - 1;
    let mut failures: u32 = 0;

    loop {
      for slot in self.triggers.iter() {
        if slot
          .epoch
          .compare_exchange(FREE, LOCKED, Ordering::AcqRel, Ordering::Relaxed)
          .is_ok()
        {
          // SAFETY: this thread holds the `LOCKED` sentinel exclusively.
          unsafe { *slot.action.get() = Some(action) };
          slot.epoch.store(prior, Ordering::Release);
          self.trigger_count.fetch_add(1, Ordering::AcqRel);
          return;
        }
      }

      let safe: u64 = self.safe.load(Ordering::Acquire);

      for slot in self.triggers.iter() {
        let candidate: u64 = slot.epoch.load(Ordering::Acquire);

        if candidate == FREE || candidate == LOCKED || candidate > safe {
          continue;
        }

        if slot
          .epoch
          .compare_exchange(candidate, LOCKED, Ordering::AcqRel, Ordering::Relaxed)
          .is_ok()
        {
          // SAFETY: this thread holds the `LOCKED` sentinel exclusively.
          let old: Option<Action> = unsafe { (*slot.action.get()).take() };
          // SAFETY: same as above.
          unsafe { *slot.action.get() = Some(action) };
          slot.epoch.store(prior, Ordering::Release);

          if let Some(old) = old {
            old();
          }

          return;
        }
      }

      failures += 1;

      if failures >= SLOWDOWN_THRESHOLD {
        eprintln!("Slowdown: Unable to add trigger to epoch");
        std::thread::sleep(Duration::from_secs(1));
        failures = 0;
      }
    }
  }

  /// Recomputes the safe epoch as `min(hint, every live handle's local epoch) - 1`.
  fn compute_safe(&self, hint: u64) -> u64 {
    let mut min: u64 = hint;

    for entry in self.entries.iter() {
      let local: u64 = entry.local.load(Ordering::Acquire);

      if local != 0 && local < min {
        min = local;
      }
    }

    let new_safe: u64 = min.saturating_sub(1);
    self.safe.fetch_max(new_safe, Ordering::AcqRel);
    self.safe.load(Ordering::Acquire)
  }

  /// Refreshes the safe epoch and runs every trigger whose epoch is now safe.
  pub(crate) fn drain(&self, hint: u64) {
    let safe: u64 = self.compute_safe(hint);

    for slot in self.triggers.iter() {
      let epoch: u64 = slot.epoch.load(Ordering::Acquire);

      if epoch == FREE || epoch == LOCKED || epoch > safe {
        continue;
      }

      if slot
        .epoch
        .compare_exchange(epoch, LOCKED, Ordering::AcqRel, Ordering::Relaxed)
        .is_ok()
      {
        // SAFETY: this thread holds the `LOCKED` sentinel exclusively.
        let action: Option<Action> = unsafe { (*slot.action.get()).take() };
        slot.epoch.store(FREE, Ordering::Release);
        self.trigger_count.fetch_sub(1, Ordering::AcqRel);

        if let Some(action) = action {
          action();
        }
      }
    }
  }
}

impl core::fmt::Debug for Epoch {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Epoch")
      .field("current", &self.current.load(Ordering::Relaxed))
      .field("safe", &self.safe.load(Ordering::Relaxed))
      .field("pending_triggers", &self.trigger_count.load(Ordering::Relaxed))
      .finish()
  }
}
