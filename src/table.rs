//! The public, hash-keyed concurrent table.

use core::hash::BuildHasher;
use crate::sync::atomic::AtomicPtr;
use crate::sync::atomic::AtomicU64;
use crate::sync::atomic::Ordering;
use std::collections::hash_map::RandomState;

use crate::bucket::Bucket;
use crate::bucket::Inserted;
use crate::domain::Domain;
use crate::handle::Handle;
use crate::record::Record;

/// How many operations pass between an implicit [`Domain::protect`] and a
/// [`Domain::protect_and_drain`], amortizing the cost of scanning the
/// trigger ring across many calls.
const DRAIN_INTERVAL: u64 = 512;

/// A fixed-size lock-free hash table, keyed by raw bytes.
///
/// Every operation takes the [`Domain`] and [`Handle`] it should run
/// under; the table itself owns only bucket structure, not any
/// reclamation state. Hashing is injectable via `S: BuildHasher`,
/// defaulting to the same [`RandomState`] `std::collections::HashMap`
/// uses.
///
/// ```
/// use faster_core::{Domain, Table};
///
/// let domain = Domain::new();
/// let handle = domain.acquire_handle();
/// let table: Table = Table::new(4);
///
/// assert!(table.insert(&domain, &handle, b"a", b"1"));
/// assert_eq!(table.lookup(&domain, &handle, b"a").as_deref(), Some(&b"1"[..]));
/// assert!(table.delete(&domain, &handle, b"a"));
/// assert_eq!(table.lookup(&domain, &handle, b"a"), None);
/// ```
pub struct Table<S = RandomState> {
  buckets: Box<[Bucket]>,
  mask: u64,
  bits: u32,
  ops: AtomicU64,
  hasher: S,
}

impl Table<RandomState> {
  /// Builds a table with `2^bits` buckets, clamped to `[0, 32]`.
  pub fn new(bits: u32) -> Self {
    Self::with_hasher(bits, RandomState::new())
  }
}

impl Default for Table<RandomState> {
  fn default() -> Self {
    Self::new(16)
  }
}

impl<S> Table<S>
where
  S: BuildHasher,
{
  /// Builds a table with `2^bits` buckets and a custom hasher.
  pub fn with_hasher(bits: u32, hasher: S) -> Self {
    let bits: u32 = bits.clamp(0, 32);
    let count: usize = 1usize << bits;

    Self {
      buckets: (0..count).map(|_| Bucket::zeroed()).collect(),
      mask: (count as u64) - 1,
      bits,
      ops: AtomicU64::new(0),
      hasher,
    }
  }

  /// Number of buckets (`2^bits`), not the number of stored entries.
  pub fn buckets(&self) -> usize {
    self.buckets.len()
  }

  fn hash_key(&self, key: &[u8]) -> u64 {
    self.hasher.hash_one(key)
  }

  fn bucket_for(&self, hash: u64) -> (&Bucket, u16) {
    let index: u64 = (hash >> 14) & self.mask;
    let ex: u16 = (hash & 0x3FFF) as u16;

    (&self.buckets[index as usize], ex)
  }

  fn protect(&self, domain: &Domain, handle: &Handle) {
    let calls: u64 = self.ops.fetch_add(1, Ordering::Relaxed) + 1;

    if calls % DRAIN_INTERVAL == 0 {
      domain.protect_and_drain(handle);
    } else {
      domain.protect(handle);
    }
  }

  /// Inserts `key` → `value`. Returns `true` if a new entry was created,
  /// `false` if `key` was already present (the insert is idempotent; the
  /// caller's values are dropped without being published).
  pub fn insert(&self, domain: &Domain, handle: &Handle, key: &[u8], value: &[u8]) -> bool {
    self.protect(domain, handle);

    let hash: u64 = self.hash_key(key);
    let (bucket, ex) = self.bucket_for(hash);

    let record: Record = Record::alloc(key, value);
    let loc = domain.pin(handle, record.as_ptr());

    let inserted: bool = match crate::bucket::insert(domain, bucket, loc, ex, key) {
      Inserted::New => true,
      Inserted::AlreadyPresent => {
        domain.unpin(handle, loc);
        // SAFETY: `record` was never published to any entry, so no
        // reader can hold a reference to it.
        unsafe { record.dealloc() };
        false
      }
    };

    domain.unprotect(handle);
    inserted
  }

  /// Looks up `key`, returning a copy of its value on a hit.
  pub fn lookup(&self, domain: &Domain, handle: &Handle, key: &[u8]) -> Option<Vec<u8>> {
    self.protect(domain, handle);

    let hash: u64 = self.hash_key(key);
    let (bucket, ex) = self.bucket_for(hash);
    let result: Option<Vec<u8>> = crate::bucket::lookup(domain, bucket, ex, key).map(<[u8]>::to_vec);

    domain.unprotect(handle);
    result
  }

  /// Removes `key`. Returns `true` if it was present.
  pub fn delete(&self, domain: &Domain, handle: &Handle, key: &[u8]) -> bool {
    self.protect(domain, handle);

    let hash: u64 = self.hash_key(key);
    let (bucket, ex) = self.bucket_for(hash);
    let deleted: bool = crate::bucket::delete(domain, handle, bucket, ex, key);

    domain.unprotect(handle);
    deleted
  }
}

impl<S> Drop for Table<S> {
  fn drop(&mut self) {
    // Frees the overflow buckets this table allocated (leaked via
    // `Box::into_raw` so concurrent readers could keep walking them).
    // Records still referenced by surviving entries are intentionally
    // left alone: resolving a `Location` to its pointer requires the
    // originating `Domain`, which a `Table` never owns a reference to.
    // Callers that need every record freed should `delete` each key
    // before dropping the table.
    for bucket in self.buckets.iter() {
      let mut next: *mut Bucket = bucket.overflow_for_drop().swap(core::ptr::null_mut(), Ordering::AcqRel);

      while !next.is_null() {
        // SAFETY: `next` was installed by a successful CAS in
        // `bucket::insert` and is never observed again once swapped out
        // here.
        let owned: Box<Bucket> = unsafe { Box::from_raw(next) };
        next = owned.overflow_for_drop().swap(core::ptr::null_mut(), Ordering::AcqRel);
      }
    }
  }
}

impl<S> core::fmt::Debug for Table<S> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Table")
      .field("bits", &self.bits)
      .field("buckets", &self.buckets.len())
      .field("ops", &self.ops.load(Ordering::Relaxed))
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn setup() -> (Domain, Handle) {
    let domain: Domain = Domain::new();
    let handle: Handle = domain.acquire_handle();
    (domain, handle)
  }

  #[test]
  fn insert_lookup_delete_single_thread() {
    let (domain, handle) = setup();
    let table: Table = Table::new(4);

    assert!(table.insert(&domain, &handle, b"a", b"1"));
    assert_eq!(table.lookup(&domain, &handle, b"a").as_deref(), Some(&b"1"[..]));
    assert!(table.delete(&domain, &handle, b"a"));
    assert_eq!(table.lookup(&domain, &handle, b"a"), None);
    assert!(!table.delete(&domain, &handle, b"a"));
  }

  #[test]
  fn insert_is_idempotent() {
    let (domain, handle) = setup();
    let table: Table = Table::new(4);

    assert!(table.insert(&domain, &handle, b"k", b"first"));
    assert!(!table.insert(&domain, &handle, b"k", b"second"));
    assert_eq!(table.lookup(&domain, &handle, b"k").as_deref(), Some(&b"first"[..]));
  }

  #[test]
  fn bucket_overflow_with_many_keys() {
    let (domain, handle) = setup();
    let table: Table = Table::new(1);

    let keys: Vec<String> = (0..64).map(|i| format!("key-{i}")).collect();

    for key in &keys {
      assert!(table.insert(&domain, &handle, key.as_bytes(), b"v"));
    }

    for key in &keys {
      assert_eq!(table.lookup(&domain, &handle, key.as_bytes()).as_deref(), Some(&b"v"[..]));
    }
  }

  #[test]
  fn tag_collision_both_keys_retrievable() {
    let (domain, handle) = setup();
    let table: Table = Table::new(8);

    // Distinct full hashes that may legitimately collide in practice are
    // hard to force deterministically against `RandomState`; instead we
    // exercise the same code path by inserting enough distinct keys into
    // a small table that multiple `(bucket, ex)` collisions are forced,
    // and check every key survives.
    let keys: Vec<String> = (0..500).map(|i| format!("tag-{i}")).collect();

    for key in &keys {
      table.insert(&domain, &handle, key.as_bytes(), key.as_bytes());
    }

    for key in &keys {
      assert_eq!(table.lookup(&domain, &handle, key.as_bytes()).as_deref(), Some(key.as_bytes()));
    }
  }
}
