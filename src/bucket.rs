//! Cache-line buckets and the lock-free insert/lookup/delete algorithms
//! that operate on a bucket's overflow chain.

use core::ptr;
use crate::sync::atomic::AtomicPtr;
use crate::sync::atomic::Ordering;

use crate::domain::Domain;
use crate::handle::Handle;
use crate::location::AtomicLocation;
use crate::location::Location;
use crate::machine::CACHE_LINE;
use crate::record::Record;
use crate::tag::Tag;

/// Entries per [`Bucket`]. Fixed so a bucket plus its overflow pointer
/// fits exactly one cache line.
pub(crate) const ENTRIES_PER_BUCKET: usize = 7;

/// One cache line: seven [`Location`] entries plus a pointer to the next
/// bucket in this index's overflow chain.
#[repr(C, align(64))]
pub(crate) struct Bucket {
  entries: [AtomicLocation; ENTRIES_PER_BUCKET],
  overflow: AtomicPtr<Bucket>,
}

const _: () = assert!(core::mem::size_of::<Bucket>() == CACHE_LINE, "Bucket must fit one cache line");

impl Bucket {
  pub(crate) fn zeroed() -> Self {
    Self {
      entries: core::array::from_fn(|_| AtomicLocation::new(Location::NIL)),
      overflow: AtomicPtr::new(ptr::null_mut()),
    }
  }

  /// Exposes the raw overflow pointer so the owning `Table` can walk and
  /// free the chain on drop.
  pub(crate) fn overflow_for_drop(&self) -> &AtomicPtr<Bucket> {
    &self.overflow
  }

  /// Walks this bucket's overflow chain, calling `f` with each node and
  /// stopping early if `f` returns `Some`.
  ///
  /// Every bucket reached this way shares the lifetime of `self`: buckets
  /// are never freed while the table that owns them is alive, so tying
  /// `'a` through the whole chain (not just the head) is sound.
  fn walk<'a, T>(&'a self, mut f: impl FnMut(&'a Bucket) -> Option<T>) -> Option<T> {
    let mut current: *const Bucket = self;

    loop {
      // SAFETY: `current` always points at a live bucket: `self` on the
      // first iteration, or a pointer previously installed by a
      // successful overflow CAS (which this struct never frees).
      let bucket: &'a Bucket = unsafe { &*current };

      if let Some(out) = f(bucket) {
        return Some(out);
      }

      let next: *mut Bucket = bucket.overflow.load(Ordering::Acquire);

      if next.is_null() {
        return None;
      }

      current = next;
    }
  }
}

fn tag_of(loc: Location) -> Tag {
  Tag::from_bits(loc.extra())
}

fn chain_tag(ex: u16) -> Tag {
  Tag::from_hash(ex as u64)
}

fn record_at(domain: &Domain, loc: Location) -> Record {
  Record::from_ptr(domain.read(loc))
}

/// Looks up `key` within the `(bucket, ex)` chain starting at `head`.
///
/// Returns `Some(value)` on a hit, `None` on a miss. As soon as an entry
/// with a matching `ex` tag is found, the search commits to that entry's
/// record chain: per the table's invariants at most one such chain exists
/// across the whole overflow list, so a miss there is a miss everywhere.
pub(crate) fn lookup(domain: &Domain, head: &Bucket, ex: u16, key: &[u8]) -> Option<&'static [u8]> {
  head.walk(|bucket| {
    for entry in &bucket.entries {
      let loc: Location = entry.load(Ordering::Acquire);

      if loc.is_nil() || tag_of(loc).tentative() || tag_of(loc).hash() != ex {
        continue;
      }

      let mut rec: Record = record_at(domain, loc);

      loop {
        if rec.key() == key {
          return Some(Some(rec.value()));
        }

        let next: Location = rec.next().load(Ordering::Acquire);

        if next.is_nil() {
          return Some(None);
        }

        rec = record_at(domain, next);
      }
    }

    None
  })
  .flatten()
}

/// Outcome of [`insert`].
pub(crate) enum Inserted {
  /// The key was not present; `loc` (the caller's freshly-pinned record)
  /// is now published.
  New,
  /// The key was already present; the caller's freshly-pinned record was
  /// never published and should be unpinned and freed.
  AlreadyPresent,
}

/// Inserts `new_loc` (a pinned, not-yet-visible [`Record`]) into the chain
/// starting at `head`, allocating an overflow bucket when every entry in
/// the chain is occupied by a different tag.
pub(crate) fn insert(domain: &Domain, head: &Bucket, new_loc: Location, ex: u16, key: &[u8]) -> Inserted {
  loop {
    // Phase 1: does a chain for this `ex` already exist? If so, walk it
    // looking for the key; if present, we're done (idempotent insert). If
    // the chain exists but the key is absent, prepend to it.
    let existing: Option<AttachPoint<'_>> = head.walk(|bucket| {
      for entry in &bucket.entries {
        let loc: Location = entry.load(Ordering::Acquire);

        if loc.is_nil() || tag_of(loc).tentative() || tag_of(loc).hash() != ex {
          continue;
        }

        return Some(AttachPoint { entry, head_loc: loc });
      }

      None
    });

    if let Some(attach) = existing {
      if chain_contains(domain, attach.head_loc, key) {
        return Inserted::AlreadyPresent;
      }

      // Prepend: the new record is not yet visible to any reader, so a
      // plain store into its `next` is sufficient; only the entry CAS
      // publishes it.
      record_at(domain, new_loc).next().store(attach.head_loc, Ordering::Release);

      let published: Location = new_loc.with_extra(chain_tag(ex).into_bits());

      if attach
        .entry
        .compare_exchange(attach.head_loc, published, Ordering::AcqRel, Ordering::Relaxed)
        .is_ok()
      {
        return Inserted::New;
      }

      // Lost the race to another writer touching this entry; restart.
      continue;
    }

    // Phase 2: no chain for this `ex` anywhere in the chain. Claim a nil
    // entry tentatively, verify no concurrent writer claimed the same
    // `ex` elsewhere in the meantime, then publish.
    let tentative_tag: Tag = chain_tag(ex).with_tentative();
    let tentative_loc: Location = new_loc.with_extra(tentative_tag.into_bits());

    let claimed: Option<&AtomicLocation> = head.walk(|bucket| {
      for entry in &bucket.entries {
        if entry
          .compare_exchange(Location::NIL, tentative_loc, Ordering::AcqRel, Ordering::Relaxed)
          .is_ok()
        {
          // SAFETY: `entry` outlives this function: it belongs to a
          // bucket this `Table` never frees while live.
          let entry: &'static AtomicLocation = unsafe { &*(entry as *const AtomicLocation) };
          return Some(entry);
        }
      }

      None
    });

    if let Some(entry) = claimed {
      let collided: bool = head
        .walk(|bucket| {
          for candidate in &bucket.entries {
            if core::ptr::eq(candidate, entry) {
              continue;
            }

            let loc: Location = candidate.load(Ordering::Acquire);

            if !loc.is_nil() && tag_of(loc).hash() == ex {
              return Some(());
            }
          }

          None
        })
        .is_some();

      if collided {
        // A concurrent writer claimed (tentatively or not) the same `ex`
        // elsewhere first; release our claim and retry from scratch.
        entry.store(Location::NIL, Ordering::Release);
        continue;
      }

      let published: Location = new_loc.with_extra(chain_tag(ex).into_bits());
      entry.store(published, Ordering::Release);
      return Inserted::New;
    }

    // Phase 3: chain is full. Install a new overflow bucket and retry.
    let tail: *const Bucket = find_tail(head);
    let fresh: Box<Bucket> = Box::new(Bucket::zeroed());
    let fresh_ptr: *mut Bucket = Box::into_raw(fresh);

    // SAFETY: `tail` is a live bucket per `walk`'s invariant.
    let overflow: &AtomicPtr<Bucket> = unsafe { &(*tail).overflow };

    if overflow
      .compare_exchange(ptr::null_mut(), fresh_ptr, Ordering::AcqRel, Ordering::Relaxed)
      .is_err()
    {
      // Someone else installed an overflow bucket first; drop ours and
      // retry against the now-longer chain.
      // SAFETY: `fresh_ptr` was never published, so we still own it.
      drop(unsafe { Box::from_raw(fresh_ptr) });
    }
  }
}

struct AttachPoint<'a> {
  entry: &'a AtomicLocation,
  head_loc: Location,
}

fn chain_contains(domain: &Domain, head_loc: Location, key: &[u8]) -> bool {
  let mut rec: Record = record_at(domain, head_loc);

  loop {
    if rec.key() == key {
      return true;
    }

    let next: Location = rec.next().load(Ordering::Acquire);

    if next.is_nil() {
      return false;
    }

    rec = record_at(domain, next);
  }
}

fn find_tail(head: &Bucket) -> *const Bucket {
  let mut current: *const Bucket = head;

  loop {
    // SAFETY: see `Bucket::walk`.
    let bucket: &Bucket = unsafe { &*current };
    let next: *mut Bucket = bucket.overflow.load(Ordering::Acquire);

    if next.is_null() {
      return current;
    }

    current = next;
  }
}

/// Removes `key` from the `(bucket, ex)` chain starting at `head`.
///
/// On success, schedules the removed record's pin to be released once no
/// reader can still observe it, via `domain.bump_with`.
pub(crate) fn delete(domain: &Domain, handle: &Handle, head: &Bucket, ex: u16, key: &[u8]) -> bool {
  loop {
    let attach: Option<AttachPoint<'_>> = head.walk(|bucket| {
      for entry in &bucket.entries {
        let loc: Location = entry.load(Ordering::Acquire);

        if loc.is_nil() || tag_of(loc).tentative() || tag_of(loc).hash() != ex {
          continue;
        }

        // SAFETY: outlives this function; see `insert`.
        let entry: &'static AtomicLocation = unsafe { &*(entry as *const AtomicLocation) };
        return Some(AttachPoint { entry, head_loc: loc });
      }

      None
    });

    let Some(attach) = attach else {
      return false;
    };

    match delete_from_chain(domain, handle, attach.entry, attach.head_loc, ex, key) {
      DeleteOutcome::NotFound => return false,
      DeleteOutcome::Deleted => return true,
      DeleteOutcome::Retry => continue,
    }
  }
}

enum DeleteOutcome {
  NotFound,
  Deleted,
  Retry,
}

/// Walks one `(bucket, ex)` chain looking for `key`, and if found, marks
/// and splices it out (Harris-style: mark the victim's own successor
/// pointer first, then CAS the predecessor past it, restoring the mark on
/// a failed splice and letting the caller retry).
fn delete_from_chain(
  domain: &Domain,
  handle: &Handle,
  entry: &'static AtomicLocation,
  head_loc: Location,
  ex: u16,
  key: &[u8],
) -> DeleteOutcome {
  // `pred` is either the bucket entry (when removing the head record) or
  // the previous record's `next` cell (when removing an interior record).
  enum Pred {
    Entry(&'static AtomicLocation),
    Next(Record),
  }

  let mut pred: Pred = Pred::Entry(entry);
  let mut pred_loc: Location = head_loc;
  let mut victim: Record = record_at(domain, head_loc);

  loop {
    if victim.key() != key {
      let next: Location = victim.next().load(Ordering::Acquire);

      if next.is_nil() {
        return DeleteOutcome::NotFound;
      }

      pred = Pred::Next(victim);
      pred_loc = next;
      victim = record_at(domain, next);
      continue;
    }

    let succ: Location = victim.next().load(Ordering::Acquire);

    if tag_of(succ).deleting() {
      // Another thread is already removing this node; let it finish.
      return DeleteOutcome::Retry;
    }

    let marked: Location = succ.with_extra(tag_of(succ).with_delete().into_bits());

    if victim
      .next()
      .compare_exchange(succ, marked, Ordering::AcqRel, Ordering::Relaxed)
      .is_err()
    {
      return DeleteOutcome::Retry;
    }

    let unmarked_succ: Location = if succ.is_nil() {
      Location::NIL
    } else {
      succ.with_extra(chain_tag(ex).into_bits())
    };

    let spliced: bool = match pred {
      Pred::Entry(entry) => entry
        .compare_exchange(pred_loc, unmarked_succ, Ordering::AcqRel, Ordering::Relaxed)
        .is_ok(),
      Pred::Next(prev_rec) => prev_rec
        .next()
        .compare_exchange(pred_loc, unmarked_succ, Ordering::AcqRel, Ordering::Relaxed)
        .is_ok(),
    };

    if !spliced {
      // Restore the mark so no other delete mistakes this node for
      // free, and let the caller re-scan: the chain shape changed.
      let _ = victim.next().compare_exchange(marked, succ, Ordering::AcqRel, Ordering::Relaxed);
      return DeleteOutcome::Retry;
    }

    let victim_loc: Location = pred_loc;
    let handle_id: u32 = handle.id();
    let domain_ptr: *const Domain = domain as *const Domain;

    domain.bump_with(
      handle,
      Box::new(move || {
        // SAFETY: this action only ever runs synchronously from within a
        // `&self` call on the very `Epoch`/`Domain` that scheduled it
        // (`Epoch::bump`/`drain`/`protect_and_drain`), which cannot happen
        // after that `Domain` has been dropped. `domain_ptr` is therefore
        // valid for the lifetime of this closure.
        let domain: &Domain = unsafe { &*domain_ptr };

        domain.unpin_by_id(handle_id, victim_loc);
        // SAFETY: the epoch trigger guarantees no reader can still
        // reach `victim` through the table by the time this runs.
        unsafe { victim.dealloc() };
      }),
    );

    return DeleteOutcome::Deleted;
  }
}
