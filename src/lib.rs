//! A lock-free, cache-line-aware concurrent hash table with epoch-based
//! memory reclamation.
//!
//! `faster-core` provides the concurrency substrate of a FASTER-style
//! in-memory key-value store: a [`Domain`] (epoch tracking, per-thread pin
//! buffers, and handle allocation) and a [`Table`] built on top of it (a
//! fixed-size, hash-keyed, lock-free bucket array).
//!
//! # Overview
//!
//! Callers acquire a [`Handle`] once per worker thread from a shared
//! [`Domain`], then use it for every [`Table`] operation. Records removed
//! from the table are not freed immediately: they are reclaimed once the
//! epoch system certifies that no other handle can still observe them.
//!
//! # Usage
//!
//! ```
//! use faster_core::{Domain, Table};
//!
//! let domain = Domain::new();
//! let handle = domain.acquire_handle();
//!
//! let table: Table = Table::new(16);
//!
//! table.insert(&domain, &handle, b"hello", b"world");
//! assert_eq!(table.lookup(&domain, &handle, b"hello").as_deref(), Some(&b"world"[..]));
//!
//! assert!(table.delete(&domain, &handle, b"hello"));
//! assert!(!table.delete(&domain, &handle, b"hello"));
//! ```
//!
//! # Configuration
//!
//! A [`Table`]'s bucket count is fixed at construction: `2^bits` buckets,
//! `bits` clamped to `[0, 32]`. Hashing is injectable through the
//! standard [`BuildHasher`](core::hash::BuildHasher) trait:
//!
//! ```
//! use faster_core::Table;
//! use std::collections::hash_map::RandomState;
//!
//! let table: Table<RandomState> = Table::with_hasher(10, RandomState::new());
//! assert_eq!(table.buckets(), 1 << 10);
//! ```
//!
//! # Concurrency
//!
//! All [`Table`] operations are lock-free and safe to call concurrently
//! from multiple threads, each with its own [`Handle`]:
//!
//! ```no_run
//! use faster_core::{Domain, Table};
//! use std::sync::Arc;
//! use std::thread;
//!
//! let domain = Arc::new(Domain::new());
//! let table = Arc::new(Table::new(16));
//!
//! let handles: Vec<_> = (0..4)
//!   .map(|worker| {
//!     let domain = Arc::clone(&domain);
//!     let table = Arc::clone(&table);
//!     thread::spawn(move || {
//!       let handle = domain.acquire_handle();
//!       for i in 0..100 {
//!         let key = format!("{worker}-{i}");
//!         table.insert(&domain, &handle, key.as_bytes(), b"v");
//!       }
//!       domain.release_handle(handle);
//!     })
//!   })
//!   .collect();
//!
//! for handle in handles {
//!   handle.join().unwrap();
//! }
//! ```
//!
//! ## Memory Reclamation
//!
//! Removed records are reclaimed through a hand-rolled epoch mechanism
//! (see [`Domain`]), not delegated to an external crate: the epoch
//! manager, per-thread pin buffers, and the table's tentative/deletion
//! protocol are this crate's reason for existing.
//!
//! # Thread Limits
//!
//! At most a fixed number of [`Handle`]s may be live at once.
//! [`Domain::acquire_handle`] panics past that limit.

mod bucket;
mod domain;
mod epoch;
mod handle;
mod location;
mod machine;
mod padded;
mod pin;
mod record;
mod table;
mod tag;

#[cfg(all(test, not(any(loom, shuttle))))]
mod tests;

pub use self::domain::Domain;
pub use self::handle::Handle;
pub use self::table::Table;

mod alloc {
  #[cfg(loom)]
  mod exports {
    pub(crate) use ::loom::alloc::alloc;
    pub(crate) use ::loom::alloc::dealloc;
    pub(crate) use ::std::alloc::handle_alloc_error;
  }

  #[cfg(not(loom))]
  mod exports {
    pub(crate) use ::std::alloc::alloc;
    pub(crate) use ::std::alloc::dealloc;
    pub(crate) use ::std::alloc::handle_alloc_error;
  }

  pub(crate) use self::exports::*;
}

mod sync {
  #[cfg(all(loom, shuttle))]
  compile_error!("cannot use loom and shuttle at once");

  #[cfg(not(any(loom, shuttle)))]
  mod exports {
    pub(crate) mod atomic {
      pub(crate) use ::core::sync::atomic::AtomicBool;
      pub(crate) use ::core::sync::atomic::AtomicPtr;
      pub(crate) use ::core::sync::atomic::AtomicU32;
      pub(crate) use ::core::sync::atomic::AtomicU64;
      pub(crate) use ::core::sync::atomic::Ordering;
    }
  }

  #[cfg(loom)]
  mod exports {
    pub(crate) mod atomic {
      pub(crate) use ::loom::sync::atomic::AtomicBool;
      pub(crate) use ::loom::sync::atomic::AtomicPtr;
      pub(crate) use ::loom::sync::atomic::AtomicU32;
      pub(crate) use ::loom::sync::atomic::AtomicU64;
      pub(crate) use ::loom::sync::atomic::Ordering;
    }
  }

  #[cfg(shuttle)]
  mod exports {
    pub(crate) mod atomic {
      pub(crate) use ::shuttle::sync::atomic::AtomicBool;
      pub(crate) use ::shuttle::sync::atomic::AtomicPtr;
      pub(crate) use ::shuttle::sync::atomic::AtomicU32;
      pub(crate) use ::shuttle::sync::atomic::AtomicU64;
      pub(crate) use ::shuttle::sync::atomic::Ordering;
    }
  }

  #[allow(unused_imports)]
  pub(crate) use self::exports::*;
}
