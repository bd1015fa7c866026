use core::hash::BuildHasher;
use core::hash::Hasher;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use crate::domain::Domain;
use crate::table::Table;

fn setup() -> (Domain, crate::handle::Handle) {
  let domain: Domain = Domain::new();
  let handle = domain.acquire_handle();
  (domain, handle)
}

/// Scenario: single-thread insert/lookup/delete.
#[test]
fn single_thread_basic() {
  let (domain, handle) = setup();
  let table: Table = Table::new(4);

  assert!(table.insert(&domain, &handle, b"a", b"1"));
  assert_eq!(table.lookup(&domain, &handle, b"a").as_deref(), Some(&b"1"[..]));
  assert!(table.delete(&domain, &handle, b"a"));
  assert_eq!(table.lookup(&domain, &handle, b"a"), None);
}

/// Scenario: a deferred action does not run until the epoch it was
/// scheduled under is certified safe, which requires no handle to still
/// be protecting an older epoch and at least one further bump.
#[test]
fn reclamation_runs_only_after_bumps() {
  let (domain, handle) = setup();

  let flag: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
  let flag_clone: Arc<AtomicBool> = Arc::clone(&flag);

  domain.bump_with(&handle, Box::new(move || flag_clone.store(true, Ordering::SeqCst)));
  assert!(!flag.load(Ordering::SeqCst), "finalizer must not run immediately");

  domain.bump();
  domain.bump();

  assert!(flag.load(Ordering::SeqCst), "finalizer should run once the scheduling epoch is safe");
}

/// Scenario: trigger-ring saturation — scheduling more triggers than the
/// ring has free slots must not deadlock; old triggers get stolen and run
/// as epochs advance.
#[test]
fn trigger_saturation_completes() {
  let (domain, handle) = setup();
  let completed: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));

  for _ in 0..300 {
    let completed: Arc<AtomicBool> = Arc::clone(&completed);
    domain.bump_with(&handle, Box::new(move || completed.store(true, Ordering::Relaxed)));
  }

  domain.bump();
  assert!(completed.load(Ordering::Relaxed));
}

struct FixedHash(u64);

impl Hasher for FixedHash {
  fn finish(&self) -> u64 {
    self.0
  }

  fn write(&mut self, _bytes: &[u8]) {}
}

/// Always hashes to the same value, forcing every key into the same
/// `(bucket, ex)` slot regardless of content.
#[derive(Clone, Copy)]
struct CollidingHasher;

impl BuildHasher for CollidingHasher {
  type Hasher = FixedHash;

  fn build_hasher(&self) -> Self::Hasher {
    FixedHash(0)
  }
}

/// Scenario: two distinct keys that collide on both bucket index and tag
/// must both be retrievable — the tentative-publish protocol must chain
/// them under one entry rather than let either claim an independent slot.
#[test]
fn tag_collision_both_keys_survive() {
  let domain: Domain = Domain::new();
  let handle = domain.acquire_handle();
  let table: Table<CollidingHasher> = Table::with_hasher(4, CollidingHasher);

  assert!(table.insert(&domain, &handle, b"first", b"1"));
  assert!(table.insert(&domain, &handle, b"second", b"2"));

  assert_eq!(table.lookup(&domain, &handle, b"first").as_deref(), Some(&b"1"[..]));
  assert_eq!(table.lookup(&domain, &handle, b"second").as_deref(), Some(&b"2"[..]));

  assert!(table.delete(&domain, &handle, b"first"));
  assert_eq!(table.lookup(&domain, &handle, b"first"), None);
  assert_eq!(table.lookup(&domain, &handle, b"second").as_deref(), Some(&b"2"[..]));
}

/// Scenario: bucket overflow — with `bits = 0` every key lands in the
/// single bucket, forcing overflow-bucket allocation past 7 distinct tags.
#[test]
fn overflow_bucket_allocated_past_seven_entries() {
  let (domain, handle) = setup();
  let table: Table = Table::new(0);

  let keys: Vec<String> = (0..20).map(|i| format!("k{i}")).collect();

  for key in &keys {
    assert!(table.insert(&domain, &handle, key.as_bytes(), b"v"));
  }

  for key in &keys {
    assert_eq!(table.lookup(&domain, &handle, key.as_bytes()).as_deref(), Some(&b"v"[..]));
  }
}
