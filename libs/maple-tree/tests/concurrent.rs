//! Readers racing one writer. These tests only make claims the RCU
//! contract actually gives: readers see either a published pre-image or
//! post-image value, never garbage, and never crash.

mod common;

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use maple_tree::{MapleTree, TreeFlags};

use crate::common::value;

fn rcu_tree() -> MapleTree<u8> {
    MapleTree::new_with(TreeFlags::new().with(TreeFlags::USE_RCU, true))
}

#[test]
fn point_reads_race_point_writes() {
    let tree = Arc::new(rcu_tree());
    let stop = Arc::new(AtomicBool::new(false));
    const KEY: usize = 12345;
    const VALUES: usize = 32;

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let tree = Arc::clone(&tree);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut observed = 0usize;
                while !stop.load(Ordering::Relaxed) {
                    match tree.load(KEY) {
                        None => {}
                        Some(ptr) => {
                            let tag = ptr.as_ptr() as usize >> 8;
                            assert!(
                                (1..=VALUES).contains(&tag),
                                "reader observed a value never stored: {tag:#x}"
                            );
                            observed += 1;
                        }
                    }
                }
                observed
            })
        })
        .collect();

    for round in 0..2000usize {
        let v = round % VALUES + 1;
        tree.store_range(KEY, KEY, value!(v)).unwrap();
        if round % 7 == 0 {
            tree.erase(KEY);
        }
    }
    stop.store(true, Ordering::Relaxed);
    for handle in readers {
        handle.join().unwrap();
    }
}

#[test]
fn structural_churn_under_readers() {
    let tree = Arc::new(rcu_tree());
    let stop = Arc::new(AtomicBool::new(false));
    const SLOTS: usize = 128;

    // Seed every even slot so readers always have something to find.
    for i in 0..SLOTS {
        tree.store_range(i * 2 * 10, i * 2 * 10 + 9, value!(1)).unwrap();
    }

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let tree = Arc::clone(&tree);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    for i in (0..SLOTS).step_by(17) {
                        if let Some(ptr) = tree.load(i * 2 * 10 + 5) {
                            let tag = ptr.as_ptr() as usize >> 8;
                            assert!(tag >= 1 && tag <= 3, "garbage value {tag:#x}");
                        }
                    }
                    // Iteration must never yield out-of-order or overlapping
                    // ranges, even while the tree is rebuilt underneath it.
                    let mut prev_end = None::<usize>;
                    for (range, _) in tree.iter() {
                        if let Some(prev) = prev_end {
                            assert!(*range.start() > prev, "iteration went backwards");
                        }
                        prev_end = Some(*range.end());
                    }
                }
            })
        })
        .collect();

    // Writer: churn the odd slots to force splits and rebalances, and
    // rewrite even slots between known values.
    for round in 0..100usize {
        for i in 0..SLOTS {
            let base = (i * 2 + 1) * 10;
            if round % 2 == 0 {
                tree.store_range(base, base + 9, value!(2)).unwrap();
            } else {
                tree.erase(base);
            }
        }
        let v = round % 3 + 1;
        for i in (0..SLOTS).step_by(3) {
            tree.store_range(i * 2 * 10, i * 2 * 10 + 9, value!(v)).unwrap();
        }
    }

    stop.store(true, Ordering::Relaxed);
    for handle in readers {
        handle.join().unwrap();
    }

    // With the writer quiet the tree must validate cleanly.
    tree.assert_valid();
}

#[test]
fn synchronize_frees_retired_nodes() {
    let mut tree = rcu_tree();
    for i in 0..500usize {
        tree.store_range(i * 10, i * 10 + 5, value!(i % 250 + 1)).unwrap();
    }
    for i in 0..500usize {
        tree.erase(i * 10);
    }
    assert!(tree.is_empty());
    // Exclusive access is the grace period; this drains the graveyard.
    tree.synchronize();
    tree.assert_valid();
}

#[test]
fn values_round_trip_untouched() {
    // The tree hands back the exact pointer it was given.
    let tree: MapleTree<u32> =
        MapleTree::new_with(TreeFlags::new().with(TreeFlags::USE_RCU, true));
    let boxed = Box::new(42u32);
    let ptr = NonNull::from(Box::leak(boxed));
    tree.store_range(7, 9, Some(ptr)).unwrap();
    let got = tree.load(8).unwrap();
    assert_eq!(got, ptr);
    // Safety: the pointer came from Box::leak above and was only copied.
    let boxed = unsafe { Box::from_raw(got.as_ptr()) };
    assert_eq!(*boxed, 42);
    tree.erase(7);
}
