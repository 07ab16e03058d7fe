mod common;

use maple_tree::{Error, MapleTree, TreeFlags};

use crate::common::value;

fn alloc_tree() -> MapleTree<u8> {
    MapleTree::new_with(TreeFlags::new().with(TreeFlags::ALLOC_RANGE, true))
}

#[test]
fn lowest_and_highest_fit() {
    let tree = alloc_tree();
    tree.store_range(0, 9, value!(1)).unwrap();
    tree.store_range(20, 29, value!(2)).unwrap();
    tree.store_range(50, 59, value!(3)).unwrap();
    tree.assert_valid();

    assert_eq!(tree.alloc(0, 100, 10, value!(4)), Ok(10));
    assert_eq!(tree.load(10), value!(4));
    assert_eq!(tree.load(19), value!(4));
    tree.assert_valid();

    assert_eq!(tree.alloc_rev(0, 100, 10, value!(5)), Ok(91));
    assert_eq!(tree.load(91), value!(5));
    assert_eq!(tree.load(100), value!(5));
    tree.assert_valid();
}

#[test]
fn highest_fit_between_entries() {
    let tree = alloc_tree();
    tree.store_range(0, 9, value!(1)).unwrap();
    tree.store_range(20, 29, value!(2)).unwrap();
    tree.store_range(50, 59, value!(3)).unwrap();

    // The window stops at 70, so the highest 10-wide fit starts at 61.
    assert_eq!(tree.alloc_rev(0, 70, 10, value!(4)), Ok(61));
    tree.assert_valid();
}

#[test]
fn no_fit_is_busy() {
    let tree = alloc_tree();
    tree.store_range(0, 99, value!(1)).unwrap();
    assert_eq!(tree.alloc(0, 99, 1, value!(2)), Err(Error::Busy));
    assert_eq!(tree.alloc(10, 50, 5, value!(2)), Err(Error::Busy));
    assert_eq!(tree.alloc_rev(0, 99, 1, value!(2)), Err(Error::Busy));

    // A window narrower than the request can never fit.
    assert_eq!(tree.alloc(200, 204, 10, value!(2)), Err(Error::Busy));
}

#[test]
fn alloc_needs_allocation_mode() {
    let tree: MapleTree<u8> = MapleTree::new();
    assert_eq!(tree.alloc(0, 100, 1, value!(1)), Err(Error::InvalidArgument));
    assert_eq!(
        tree.alloc_rev(0, 100, 1, value!(1)),
        Err(Error::InvalidArgument)
    );
}

#[test]
fn degenerate_requests() {
    let tree = alloc_tree();
    assert_eq!(tree.alloc(0, 100, 0, value!(1)), Err(Error::InvalidArgument));
    assert_eq!(tree.alloc(50, 40, 1, value!(1)), Err(Error::InvalidArgument));
}

#[test]
fn empty_tree_fits_anywhere() {
    let tree = alloc_tree();
    assert_eq!(tree.alloc(100, 200, 10, value!(1)), Ok(100));
    assert_eq!(tree.load(100), value!(1));
    assert_eq!(tree.load(109), value!(1));
    assert_eq!(tree.load(110), None);
    tree.assert_valid();
}

#[test]
fn fills_the_window_exactly() {
    let tree = alloc_tree();
    let mut next = 0usize;
    // Repeated lowest-fit allocation packs the window densely.
    while let Ok(index) = tree.alloc(0, 255, 16, value!(7)) {
        assert_eq!(index, next);
        next += 16;
        tree.assert_valid();
    }
    assert_eq!(next, 256);
    assert_eq!(tree.alloc(0, 255, 1, value!(7)), Err(Error::Busy));
}

#[test]
fn gap_index_survives_deep_trees() {
    let tree = alloc_tree();
    for i in 0..200usize {
        tree.store_range(i * 20, i * 20 + 9, value!(i % 200 + 1)).unwrap();
    }
    assert!(tree.height() >= 2);
    tree.assert_valid();

    // Every hole is 10 wide; a request for 11 must skip them all and land
    // after the data.
    assert_eq!(tree.alloc(0, usize::MAX - 1, 11, value!(201)), Ok(200 * 20 - 10));
    tree.assert_valid();

    // A request for 10 lands in the first hole.
    assert_eq!(tree.alloc(0, usize::MAX - 1, 10, value!(202)), Ok(10));
    tree.assert_valid();
}

#[test]
fn erase_reopens_gaps() {
    let tree = alloc_tree();
    for i in 0..20usize {
        tree.store_range(i * 10, i * 10 + 9, value!(i + 1)).unwrap();
    }
    assert_eq!(tree.alloc(0, 199, 10, value!(30)), Err(Error::Busy));

    assert_eq!(tree.erase(75), value!(8));
    tree.assert_valid();
    assert_eq!(tree.alloc(0, 199, 10, value!(30)), Ok(70));
    tree.assert_valid();
}
