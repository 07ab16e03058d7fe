mod common;

use maple_tree::MapleTree;

use crate::common::value;

#[test]
fn yields_every_range_in_order() {
    let tree: MapleTree<u8> = MapleTree::new();
    for i in 0..300usize {
        tree.store_range(i * 7, i * 7 + 2, value!(i % 250 + 1)).unwrap();
    }
    assert!(tree.height() >= 2);

    let mut expected = 0usize;
    for (range, ptr) in tree.iter() {
        assert_eq!(*range.start(), expected * 7);
        assert_eq!(*range.end(), expected * 7 + 2);
        assert_eq!(Some(ptr), value!(expected % 250 + 1));
        expected += 1;
    }
    assert_eq!(expected, 300);
}

#[test]
fn bounded_range_iteration() {
    let tree: MapleTree<u8> = MapleTree::new();
    for i in 0..50usize {
        tree.store_range(i * 10, i * 10 + 4, value!(i + 1)).unwrap();
    }

    // [95, 200] clips to the ranges intersecting it; [90, 94] starts before
    // the window but does not intersect it.
    let hits: Vec<_> = tree.range(95, 204).map(|(range, _)| range).collect();
    assert_eq!(hits, vec![100..=104, 110..=114, 120..=124, 130..=134, 140..=144, 150..=154, 160..=164, 170..=174, 180..=184, 190..=194, 200..=204]);
}

#[test]
fn range_hits_an_entry_straddling_the_bound() {
    let tree: MapleTree<u8> = MapleTree::new();
    tree.store_range(0, 99, value!(1)).unwrap();
    tree.store_range(200, 299, value!(2)).unwrap();

    let hits: Vec<_> = tree.range(50, 250).map(|(range, _)| range).collect();
    assert_eq!(hits, vec![0..=99, 200..=299]);
}

#[test]
fn cursor_walks_both_directions() {
    let tree: MapleTree<u8> = MapleTree::new();
    for i in 1..=10usize {
        tree.store_range(i * 100, i * 100 + 50, value!(i)).unwrap();
    }

    let mut cursor = tree.cursor(0);
    let (range, _) = cursor.find_next(usize::MAX).unwrap();
    assert_eq!(range, 100..=150);
    let (range, _) = cursor.find_next(usize::MAX).unwrap();
    assert_eq!(range, 200..=250);

    let mut cursor = tree.cursor(575);
    let (range, _) = cursor.find_prev(0).unwrap();
    assert_eq!(range, 500..=550);
    let (range, _) = cursor.find_prev(0).unwrap();
    assert_eq!(range, 400..=450);
}

#[test]
fn cursor_bound_stops_early() {
    let tree: MapleTree<u8> = MapleTree::new();
    tree.store_range(100, 150, value!(1)).unwrap();
    tree.store_range(300, 350, value!(2)).unwrap();

    let mut cursor = tree.cursor(0);
    assert!(cursor.find_next(99).is_none());
    // The same cursor picks up where it stopped once the bound widens.
    let (range, _) = cursor.find_next(usize::MAX).unwrap();
    assert_eq!(range, 100..=150);
    assert!(cursor.find_next(200).is_none());
    let (range, _) = cursor.find_next(usize::MAX).unwrap();
    assert_eq!(range, 300..=350);
    assert!(cursor.find_next(usize::MAX).is_none());
}

#[test]
fn pause_and_resume() {
    let tree: MapleTree<u8> = MapleTree::new();
    for i in 0..20usize {
        tree.store_range(i * 10, i * 10 + 5, value!(i + 1)).unwrap();
    }

    let mut cursor = tree.cursor(0);
    for _ in 0..5 {
        cursor.find_next(usize::MAX).unwrap();
    }
    cursor.pause();
    assert_eq!(cursor.last(), 45);

    // Mutations while paused are fine; the cursor re-enters at last + 1.
    tree.store_range(41, 43, value!(99)).unwrap();
    let (range, _) = cursor.find_next(usize::MAX).unwrap();
    assert_eq!(range, 50..=55);
}

#[test]
fn singleton_root_iterates_once() {
    let tree: MapleTree<u8> = MapleTree::new();
    tree.store_range(0, 0, value!(1)).unwrap();

    let entries: Vec<_> = tree.iter().collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, 0..=0);

    let mut cursor = tree.cursor(10);
    let (range, _) = cursor.find_prev(0).unwrap();
    assert_eq!(range, 0..=0);
    assert!(cursor.find_prev(0).is_none());
}

#[test]
fn empty_tree_iterates_nothing() {
    let tree: MapleTree<u8> = MapleTree::new();
    assert_eq!(tree.iter().count(), 0);
    let mut cursor = tree.cursor(0);
    assert!(cursor.find_next(usize::MAX).is_none());
    let mut cursor = tree.cursor(usize::MAX);
    assert!(cursor.find_prev(0).is_none());
}
