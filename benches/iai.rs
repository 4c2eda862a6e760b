// (c) Copyright 2025 Helsing GmbH. All rights reserved.
#![cfg_attr(not(target_os = "linux"), allow(dead_code, unused_imports))]

use iai_callgrind::{library_benchmark, library_benchmark_group, main};
use std::hint::black_box;
use tmem::{Hamt, TVar, atomically, retry};

fn setup_vars(n: u64) -> Vec<TVar<u64>> {
    tmem::enable_determinism();
    (0..n).map(TVar::new).collect()
}

#[library_benchmark]
#[bench::single(setup_vars(1))]
#[bench::wide(setup_vars(64))]
fn tvar_modify(vars: Vec<TVar<u64>>) {
    let vars = black_box(vars);
    atomically(|tx| {
        for v in &vars {
            v.modify(tx, |n| n + 1)?;
        }
        Ok(())
    })
    .unwrap();
    black_box(vars);
}

#[library_benchmark]
#[bench::wide(setup_vars(64))]
fn tvar_read(vars: Vec<TVar<u64>>) {
    let vars = black_box(vars);
    let sum = atomically(|tx| Ok(vars.iter().map(|v| v.read(tx)).sum::<u64>())).unwrap();
    black_box(sum);
}

#[library_benchmark]
#[bench::single(setup_vars(1))]
fn or_else_fallback(vars: Vec<TVar<u64>>) {
    let vars = black_box(vars);
    atomically(|tx| {
        tx.or_else(
            |tx| {
                vars[0].modify(tx, |n| n + 1)?;
                retry()
            },
            |tx| vars[0].modify(tx, |n| n + 2),
        )
    })
    .unwrap();
    black_box(vars);
}

fn setup_trie(n: u64) -> Hamt<(u64, u64)> {
    tmem::enable_determinism();

    let trie = Hamt::new();
    atomically(|tx| {
        for k in 0..n {
            let hash = trie.hash_of(&k);
            trie.alter(tx, hash, |(key, _)| *key == k, |_| Some((k, k)));
        }
        Ok(())
    })
    .unwrap();
    trie
}

#[library_benchmark]
#[bench::medium(setup_trie(1024))]
fn hamt_lookup(trie: Hamt<(u64, u64)>) {
    let trie = black_box(trie);
    let hash = trie.hash_of(&512u64);
    let found = atomically(|tx| Ok(trie.lookup(tx, hash, |(k, _)| *k == 512))).unwrap();
    black_box(found);
}

#[library_benchmark]
#[bench::medium(setup_trie(1024))]
fn hamt_insert(trie: Hamt<(u64, u64)>) {
    let trie = black_box(trie);
    let hash = trie.hash_of(&4096u64);
    let written = atomically(|tx| {
        Ok(trie.alter(tx, hash, |(k, _)| *k == 4096, |_| Some((4096, 0))))
    })
    .unwrap();
    black_box(written);
}

#[library_benchmark]
#[bench::medium(setup_trie(1024))]
fn hamt_remove(trie: Hamt<(u64, u64)>) {
    let trie = black_box(trie);
    let hash = trie.hash_of(&128u64);
    let written = atomically(|tx| Ok(trie.alter(tx, hash, |(k, _)| *k == 128, |_| None))).unwrap();
    black_box(written);
}

library_benchmark_group!(
    name = tvars;
    benchmarks = tvar_modify, tvar_read, or_else_fallback
);
library_benchmark_group!(
    name = tries;
    benchmarks = hamt_lookup, hamt_insert, hamt_remove
);

#[cfg(target_os = "linux")]
main!(library_benchmark_groups = tvars, tries);

#[cfg(not(target_os = "linux"))]
fn main() {}
