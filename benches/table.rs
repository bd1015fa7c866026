use divan::Bencher;
use divan::bench;
use divan::bench_group;
use divan::black_box;

use faster_core::Domain;
use faster_core::Table;

const OPS: &[usize] = &[1 << 4, 1 << 6, 1 << 8, 1 << 10, 1 << 12, 1 << 14];

const THREADS: &[usize] = &[0, 1, 4, 8];

fn key_for(index: usize) -> Vec<u8> {
  format!("key-{index}").into_bytes()
}

#[bench_group(name = "ReadSeq", skip_ext_time, threads = THREADS)]
mod read_seq {
  use super::bench;
  use super::*;

  #[bench(args = OPS)]
  fn bench_read_seq(bencher: Bencher<'_, '_>, ops: usize) {
    let domain: Domain = Domain::new();
    let table: Table = Table::new(16);
    let handle = domain.acquire_handle();

    let keys: Vec<Vec<u8>> = (0..ops).map(super::key_for).collect();

    for key in &keys {
      table.insert(&domain, &handle, key, b"v");
    }

    bencher.counter(ops).bench(|| {
      for key in keys.iter() {
        let found: Option<Vec<u8>> = black_box(table.lookup(&domain, &handle, key));
        _ = black_box(found.unwrap());
      }
    });
  }
}

#[bench_group(name = "ReadHot", skip_ext_time, threads = THREADS)]
mod read_hot {
  use super::bench;
  use super::*;

  #[bench(args = OPS)]
  fn bench_read_hot(bencher: Bencher<'_, '_>, ops: usize) {
    let domain: Domain = Domain::new();
    let table: Table = Table::new(16);
    let handle = domain.acquire_handle();

    table.insert(&domain, &handle, b"hot", b"value");

    bencher.counter(ops).bench(|| {
      for _ in 0..ops {
        let found: Option<Vec<u8>> = black_box(table.lookup(&domain, &handle, black_box(b"hot")));
        _ = black_box(found.unwrap());
      }
    });
  }
}

#[bench_group(name = "InsertSeq", skip_ext_time)]
mod insert_seq {
  use super::bench;
  use super::*;

  #[bench(args = OPS)]
  fn bench_insert_seq(bencher: Bencher<'_, '_>, ops: usize) {
    let keys: Vec<Vec<u8>> = (0..ops).map(super::key_for).collect();

    bencher
      .counter(ops)
      .with_inputs(|| (Domain::new(), Table::new(16)))
      .bench_local_refs(|(domain, table): &mut (Domain, Table)| {
        let handle = domain.acquire_handle();

        for key in keys.iter() {
          let inserted: bool = black_box(table.insert(domain, &handle, key, b"v"));
          _ = black_box(inserted);
        }

        domain.release_handle(handle);
      });
  }
}

#[bench_group(name = "Churn", skip_ext_time)]
mod churn {
  use super::bench;
  use super::*;

  #[bench(args = OPS)]
  fn bench_churn(bencher: Bencher<'_, '_>, ops: usize) {
    let keys: Vec<Vec<u8>> = (0..ops).map(super::key_for).collect();

    bencher
      .counter(ops)
      .with_inputs(|| (Domain::new(), Table::new(16)))
      .bench_local_refs(|(domain, table): &mut (Domain, Table)| {
        let handle = domain.acquire_handle();

        for key in keys.iter() {
          let inserted: bool = black_box(table.insert(domain, &handle, key, b"v"));
          _ = black_box(inserted);
          let removed: bool = black_box(table.delete(domain, &handle, key));
          _ = black_box(removed);
        }

        domain.release_handle(handle);
      });
  }
}

fn main() {
  divan::main();
}
