//! # A range-keyed B-tree with lock-free readers.
//!
//! `MapleTree` maps inclusive ranges of `usize` keys to opaque pointers.
//! One node holds many contiguous ranges: boundaries ("pivots") and value
//! slots live side by side in a 256-byte block, so point lookup, range
//! store, erase and in-order iteration all touch very few cache lines.
//! Ranges are disjoint; the space between stored ranges implicitly holds
//! the absent value.
//!
//! Readers run concurrently with one writer. Writers never mutate a node
//! that readers can see (apart from a handful of single-word commits):
//! they build a replacement subtree off to the side and publish it with one
//! pointer store, then mark the replaced nodes dead. A reader that trips
//! over a dead node restarts its walk from the root. Replaced nodes stay
//! allocated until the tree is provably quiescent — see
//! [`MapleTree::synchronize`].
//!
//! In allocation mode ([`TreeFlags::ALLOC_RANGE`]) every internal slot also
//! tracks the largest absent run in its subtree, which makes
//! [`MapleTree::alloc`] and [`MapleTree::alloc_rev`] find the lowest or
//! highest fit for a request without scanning the keyspace.
//!
//! ## Concurrency contract
//!
//! - All operations take `&self`; writers serialize on an internal mutex.
//! - With [`TreeFlags::USE_RCU`] set, readers are lock-free and always see
//!   either the pre-image or the post-image of a write.
//! - Without it, writers may rewrite nodes in place and free replaced nodes
//!   eagerly; readers must then be serialized against writers externally.
//!   Racing anyway is memory-safe but may observe mixed states.
//!
//! ## Example
//!
//! ```rust
//! use core::ptr::NonNull;
//! use maple_tree::MapleTree;
//!
//! static A: u32 = 1;
//! static B: u32 = 2;
//!
//! let tree: MapleTree<u32> = MapleTree::new();
//! tree.store_range(10, 19, Some(NonNull::from(&A))).unwrap();
//! tree.store_range(20, 29, Some(NonNull::from(&B))).unwrap();
//!
//! assert_eq!(tree.load(15), Some(NonNull::from(&A)));
//! assert_eq!(tree.load(25), Some(NonNull::from(&B)));
//! assert_eq!(tree.load(30), None);
//!
//! let ranges: Vec<_> = tree.iter().map(|(range, _)| range).collect();
//! assert_eq!(ranges, vec![10..=19, 20..=29]);
//! ```

mod bignode;
mod entry;
mod error;
mod gap;
mod iter;
mod node;
mod rebuild;
mod walk;
mod write;

use core::fmt;
use core::marker::PhantomData;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;

pub use crate::error::Error;
pub use crate::iter::{Cursor, Iter};

use crate::entry::Entry;
use crate::gap::child_max_gap;
use crate::node::{Node, NodeCache, NodeType, node_ref};
use crate::walk::Walker;

mycelium_bitfield::bitfield! {
    /// Behavior flags of a [`MapleTree`], fixed at construction.
    #[derive(Default, PartialEq, Eq)]
    pub struct TreeFlags<u32> {
        /// Track per-subtree gaps so [`MapleTree::alloc`] and
        /// [`MapleTree::alloc_rev`] can search free space.
        pub const ALLOC_RANGE: bool;
        /// Keep replaced nodes allocated until a quiescent point so readers
        /// may run lock-free alongside the writer.
        pub const USE_RCU: bool;
        /// Current tree height. Maintained by writes; setting it at
        /// construction has no effect.
        pub const HEIGHT = 5;
    }
}

/// An ordered map from disjoint inclusive `usize` ranges to opaque
/// pointers. See the [crate docs](crate) for the full contract.
///
/// The tree never dereferences the stored pointers; they are returned to
/// the caller exactly as stored.
pub struct MapleTree<T> {
    /// Either absent, a single direct entry covering `[0, 0]`, or an
    /// encoded pointer to the root node.
    root: AtomicUsize,
    flags: AtomicU32,
    writer: Mutex<()>,
    /// Replaced nodes wait here until a quiescent point proves no reader
    /// can still observe them.
    graveyard: Mutex<Vec<NonNull<Node>>>,
    _marker: PhantomData<*mut T>,
}

// Safety: the tree stores caller pointers without ever dereferencing them;
// all shared internal state is atomics or lock-protected.
unsafe impl<T: Send> Send for MapleTree<T> {}
// Safety: as above; handing out copies of `NonNull<T>` from several threads
// is bounded by the same contract as sharing `&T`.
unsafe impl<T: Sync> Sync for MapleTree<T> {}

impl<T> MapleTree<T> {
    /// An empty tree with default flags.
    pub fn new() -> Self {
        Self::new_with(TreeFlags::new())
    }

    /// An empty tree with the given flags.
    pub fn new_with(flags: TreeFlags) -> Self {
        let flags = flags.with(TreeFlags::HEIGHT, 0);
        Self {
            root: AtomicUsize::new(0),
            flags: AtomicU32::new(flags.0),
            writer: Mutex::new(()),
            graveyard: Mutex::new(Vec::new()),
            _marker: PhantomData,
        }
    }

    /// The value covering `index`, or `None` for an absent key.
    pub fn load(&self, index: usize) -> Option<NonNull<T>> {
        let mut wk = Walker::new(self, index, index);
        loop {
            match wk.load_entry() {
                Ok((entry, _, _)) => return entry.value(),
                Err(_) => wk.reset(),
            }
        }
    }

    /// Stores `value` over `[first, last]`, replacing anything there.
    /// Storing `None` erases the range.
    pub fn store_range(
        &self,
        first: usize,
        last: usize,
        value: Option<NonNull<T>>,
    ) -> Result<(), Error> {
        if first > last {
            return Err(Error::InvalidArgument);
        }
        let entry = Entry::from_value(value)?;
        let mut wk = Walker::new(self, first, last);
        let mut guard = Some(self.writer.lock());
        loop {
            match write::store(&mut wk, entry) {
                Err(_) if wk.err() == Some(Error::OutOfMemory) && wk.node_request > 0 => {
                    // Refill the reserve with the lock dropped, then retry
                    // from scratch.
                    drop(guard.take());
                    let request = wk.node_request;
                    wk.node_request = 0;
                    wk.prealloc(request)?;
                    wk.index = first;
                    wk.last = last;
                    guard = Some(self.writer.lock());
                }
                result => return result,
            }
        }
    }

    /// Stores `value` over `[first, last]`, failing with
    /// [`Error::AlreadyExists`] if any part of the range is occupied.
    pub fn insert_range(
        &self,
        first: usize,
        last: usize,
        value: Option<NonNull<T>>,
    ) -> Result<(), Error> {
        if first > last {
            return Err(Error::InvalidArgument);
        }
        let entry = Entry::from_value(value)?;
        let mut wk = Walker::new(self, first, last);
        let mut guard = Some(self.writer.lock());
        loop {
            if self.range_occupied(first, last) {
                return Err(Error::AlreadyExists);
            }
            match write::store(&mut wk, entry) {
                Err(_) if wk.err() == Some(Error::OutOfMemory) && wk.node_request > 0 => {
                    drop(guard.take());
                    let request = wk.node_request;
                    wk.node_request = 0;
                    wk.prealloc(request)?;
                    wk.index = first;
                    wk.last = last;
                    guard = Some(self.writer.lock());
                }
                result => return result,
            }
        }
    }

    /// Erases the range covering `index` and returns its value, or `None`
    /// if the key was absent.
    pub fn erase(&self, index: usize) -> Option<NonNull<T>> {
        let mut guard = Some(self.writer.lock());
        let mut wk = Walker::new(self, index, index);
        let (entry, r_min, r_max) = wk
            .load_entry()
            .expect("tree mutated under the writer lock");
        if entry.is_null() {
            return None;
        }
        wk.index = r_min;
        wk.last = r_max;
        loop {
            match write::store(&mut wk, Entry::NULL) {
                Ok(()) => return entry.value(),
                Err(_) if wk.err() == Some(Error::OutOfMemory) && wk.node_request > 0 => {
                    drop(guard.take());
                    let request = wk.node_request;
                    wk.node_request = 0;
                    wk.prealloc(request)
                        .expect("node allocation failed in blocking context");
                    wk.index = r_min;
                    wk.last = r_max;
                    guard = Some(self.writer.lock());
                }
                Err(err) => unreachable!("erase cannot fail structurally: {err}"),
            }
        }
    }

    /// Finds the lowest absent run of `size` keys inside `[min, max]`,
    /// stores `value` there and returns its first index.
    ///
    /// Requires [`TreeFlags::ALLOC_RANGE`].
    pub fn alloc(
        &self,
        min: usize,
        max: usize,
        size: usize,
        value: Option<NonNull<T>>,
    ) -> Result<usize, Error> {
        self.alloc_impl(min, max, size, value, false)
    }

    /// Mirror of [`MapleTree::alloc`]: the highest fit instead of the
    /// lowest.
    pub fn alloc_rev(
        &self,
        min: usize,
        max: usize,
        size: usize,
        value: Option<NonNull<T>>,
    ) -> Result<usize, Error> {
        self.alloc_impl(min, max, size, value, true)
    }

    fn alloc_impl(
        &self,
        min: usize,
        max: usize,
        size: usize,
        value: Option<NonNull<T>>,
        reverse: bool,
    ) -> Result<usize, Error> {
        if !self.alloc_mode() || size == 0 || min > max {
            return Err(Error::InvalidArgument);
        }
        let entry = Entry::from_value(value)?;
        let mut wk = Walker::new(self, min, max);
        let mut guard = Some(self.writer.lock());
        loop {
            let index = if reverse {
                gap::empty_area_rev(&mut wk, min, max, size)?
            } else {
                gap::empty_area(&mut wk, min, max, size)?
            };
            wk.index = index;
            wk.last = index + size - 1;
            match write::store(&mut wk, entry) {
                Ok(()) => return Ok(index),
                Err(_) if wk.err() == Some(Error::OutOfMemory) && wk.node_request > 0 => {
                    // Re-run the search after refilling: the lock was
                    // dropped, so the fit may have moved.
                    drop(guard.take());
                    let request = wk.node_request;
                    wk.node_request = 0;
                    wk.prealloc(request)?;
                    guard = Some(self.writer.lock());
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// A cursor positioned at `index`.
    pub fn cursor(&self, index: usize) -> Cursor<'_, T> {
        Cursor::new(Walker::new(self, index, index))
    }

    /// Iterates every stored range in ascending key order.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter::new(self.cursor(0), usize::MAX)
    }

    /// Iterates the stored ranges intersecting `[first, last]`.
    pub fn range(&self, first: usize, last: usize) -> Iter<'_, T> {
        Iter::new(self.cursor(first), last)
    }

    /// `true` when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.root_entry().is_null()
    }

    /// Number of node levels; 0 for an empty or single-direct-entry tree.
    pub fn height(&self) -> usize {
        TreeFlags(self.flags.load(Ordering::Acquire)).get(TreeFlags::HEIGHT) as usize
    }

    /// Erases everything and reclaims every node immediately (the `&mut`
    /// receiver proves quiescence).
    pub fn clear(&mut self) {
        let root = self.root_entry();
        if root.is_node() {
            let guard = self.writer.lock();
            rebuild::retire_subtree(self, root.safe());
            drop(guard);
        }
        self.publish_root(Entry::NULL, 0);
        self.synchronize();
    }

    /// Frees every node retired since the last quiescent point. Exclusive
    /// access is the grace period: no reader can overlap this call.
    pub fn synchronize(&mut self) {
        let mut graveyard = self.graveyard.lock();
        for node in graveyard.drain(..) {
            // Safety: `&mut self` proves no reader still observes retired
            // nodes, and retired nodes are unreachable from the tree.
            unsafe { NodeCache::free(node) };
        }
    }

    // === crate-internal plumbing ===

    #[inline]
    pub(crate) fn root_entry(&self) -> Entry {
        Entry(self.root.load(Ordering::Acquire))
    }

    /// Publishes a new root word and records the new height.
    pub(crate) fn publish_root(&self, entry: Entry, height: usize) {
        self.root.store(entry.0, Ordering::Release);
        let height = u32::try_from(height).expect("tree height exceeds the flags field");
        let flags = TreeFlags(self.flags.load(Ordering::Relaxed));
        self.flags
            .store(flags.with(TreeFlags::HEIGHT, height).0, Ordering::Release);
    }

    #[inline]
    pub(crate) fn alloc_mode(&self) -> bool {
        TreeFlags(self.flags.load(Ordering::Relaxed)).get(TreeFlags::ALLOC_RANGE)
    }

    #[inline]
    pub(crate) fn rcu_mode(&self) -> bool {
        TreeFlags(self.flags.load(Ordering::Relaxed)).get(TreeFlags::USE_RCU)
    }

    /// Takes ownership of a node that just became unreachable.
    pub(crate) fn retire(&self, node: NonNull<Node>) {
        if self.rcu_mode() {
            self.graveyard.lock().push(node);
        } else {
            // Safety: outside reader-visible mode callers serialize readers
            // against writers, so nothing can still observe the node.
            unsafe { NodeCache::free(node) };
        }
    }

    /// `true` if any key in `[first, last]` holds a value. Writer lock must
    /// be held.
    fn range_occupied(&self, first: usize, last: usize) -> bool {
        let mut wk = Walker::new(self, first, first);
        wk.find_next(last)
            .expect("tree mutated under the writer lock")
            .is_some()
    }

    // === validation ===

    /// Walks the whole tree and asserts every structural invariant: pivot
    /// continuity and order, slot minimums, parent back-references, uniform
    /// leaf depth and (in allocation mode) gap correctness.
    pub fn assert_valid(&self) {
        let root = self.root_entry();
        if !root.is_node() {
            // Empty or a single direct entry covering [0, 0].
            assert_eq!(self.height(), 0);
            return;
        }
        assert!(root.is_root(), "root word missing its root marker");
        let height = self.height();
        assert!(height >= 1);
        self.check_node(root.safe(), None, 0, usize::MAX, 1, height);
    }

    fn check_node(
        &self,
        entry: Entry,
        parent: Option<(NonNull<Node>, usize)>,
        min: usize,
        max: usize,
        depth: usize,
        height: usize,
    ) {
        let ty = entry.node_type();
        // Safety: validation runs on reachable nodes of a quiescent tree.
        let node = unsafe { node_ref(entry) };
        // Safety: `entry` is a node entry.
        let ptr = unsafe { entry.node_ptr() };

        match parent {
            Some((p, slot)) => {
                assert_eq!(node.parent_node(), Some(p), "parent back-reference");
                assert_eq!(node.parent_slot(), slot, "parent slot");
            }
            None => assert!(node.is_root_node(), "root node without root parent"),
        }
        assert!(!node.is_dead(ptr), "reachable node marked dead");

        if ty.is_leaf() {
            assert_eq!(depth, height, "leaf at the wrong depth");
        } else {
            assert!(depth < height, "internal node at leaf depth");
        }

        let end = node.data_end(ty, max);
        if parent.is_some() {
            assert!(
                end + 1 >= ty.min_slots(),
                "non-root node below minimum occupancy"
            );
        }

        let mut expected = min;
        for offset in 0..=end {
            let (r_min, r_max) = node.slot_range(ty, offset, end, min, max);
            assert_eq!(r_min, expected, "pivot continuity");
            assert!(r_min <= r_max, "inverted slot range");
            assert!(r_max <= max, "slot range escapes the node");

            let child = node.slot(ty, offset);
            if ty.is_leaf() {
                assert!(!child.is_node(), "node entry in a leaf slot");
                if offset > 0 && child.is_null() {
                    assert!(
                        !node.slot(ty, offset - 1).is_null(),
                        "adjacent absent slots"
                    );
                }
            } else {
                assert!(child.is_node(), "missing child");
                if ty == NodeType::Arange64 {
                    assert_eq!(
                        node.gap(ty, offset),
                        child_max_gap(child, r_min, r_max),
                        "stale gap entry"
                    );
                }
                self.check_node(child, Some((ptr, offset)), r_min, r_max, depth + 1, height);
            }

            if offset < end {
                expected = r_max + 1;
            } else {
                assert_eq!(r_max, max, "last slot stops short of the node max");
            }
        }
    }
}

impl<T> Default for MapleTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for MapleTree<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<T> fmt::Debug for MapleTree<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (range, value) in self.iter() {
            map.entry(&range, &value.as_ptr());
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(v: usize) -> Option<NonNull<u8>> {
        // Aligned, never dereferenced.
        NonNull::new((v << 8) as *mut u8)
    }

    #[test]
    fn smoke() {
        let tree: MapleTree<u8> = MapleTree::new();
        tree.store_range(0, 0, value(1)).unwrap();
        assert_eq!(tree.load(0), value(1));
        assert_eq!(tree.load(1), None);
        tree.assert_valid();

        tree.store_range(10, 20, value(2)).unwrap();
        assert_eq!(tree.load(0), value(1));
        assert_eq!(tree.load(9), None);
        assert_eq!(tree.load(15), value(2));
        assert_eq!(tree.load(21), None);
        tree.assert_valid();

        assert_eq!(tree.erase(15), value(2));
        assert_eq!(tree.load(15), None);
        assert_eq!(tree.load(0), value(1));
        tree.assert_valid();
    }

    #[test]
    fn overlapping_stores_clip() {
        let tree: MapleTree<u8> = MapleTree::new();
        tree.store_range(10, 20, value(1)).unwrap();
        tree.store_range(15, 25, value(2)).unwrap();
        assert_eq!(tree.load(9), None);
        assert_eq!(tree.load(10), value(1));
        assert_eq!(tree.load(14), value(1));
        assert_eq!(tree.load(15), value(2));
        assert_eq!(tree.load(25), value(2));
        assert_eq!(tree.load(26), None);
        tree.assert_valid();
    }

    #[test]
    fn fill_one_leaf_and_split() {
        let tree: MapleTree<u8> = MapleTree::new();
        // One-wide ranges with one-wide holes force one slot per range.
        for i in 0..64usize {
            tree.store_range(i * 2, i * 2, value(i + 1)).unwrap();
            tree.assert_valid();
        }
        for i in 0..64usize {
            assert_eq!(tree.load(i * 2), value(i + 1));
            assert_eq!(tree.load(i * 2 + 1), None);
        }
        assert!(tree.height() >= 2);
    }
}
