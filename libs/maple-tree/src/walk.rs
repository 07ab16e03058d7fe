//! The walker: a cursor through the tree plus the descent and ascent
//! primitives every operation is built from.
//!
//! A walker tracks the target range `[index, last]`, the node it currently
//! stands on (or a state sentinel), the implied `[min, max]` bounds of that
//! node, the slot offset within it, and a reserve of pre-allocated nodes for
//! the write pipeline.
//!
//! The node word state machine:
//!
//! - `START` — never descended; any mutation or retry resets to this.
//! - `ROOT` — the tree root holds a single direct entry covering `[0, 0]`.
//! - `NONE` — the walk finished without a match (empty tree, or past the
//!   data during iteration).
//! - `ERROR(e)` — the last operation failed; decoded at the public boundary.
//! - a node entry — standing on a live node.
//!
//! Readers share the tree with one concurrent writer. Every descent loads
//! the child slot and then re-checks that the node it was loaded from is
//! still alive; observing a dead node aborts the walk with [`Retry`] and the
//! caller restarts from the root.

use core::ptr::NonNull;

use smallvec::SmallVec;

use crate::entry::Entry;
use crate::node::{Node, NodeCache, NodeType, node_ref};
use crate::{Error, MapleTree};

/// A concurrent writer replaced the subtree under this walk; restart from
/// the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Retry;

/// Mutable cursor state shared by reads, writes and iteration.
pub(crate) struct Walker<'t, T> {
    pub(crate) tree: &'t MapleTree<T>,
    /// Low end of the target range.
    pub(crate) index: usize,
    /// High end of the target range.
    pub(crate) last: usize,
    /// Current node, or a state sentinel.
    pub(crate) node: Entry,
    /// Implied lower bound of the current node.
    pub(crate) min: usize,
    /// Implied upper bound of the current node.
    pub(crate) max: usize,
    /// Slot offset within the current node.
    pub(crate) offset: usize,
    /// Offset of the last live slot of the current node.
    pub(crate) end: usize,
    /// Levels descended from the root so far.
    pub(crate) depth: usize,
    /// Pre-allocated nodes available to the write pipeline.
    pub(crate) reserve: SmallVec<[NonNull<Node>; 8]>,
    /// Nodes the last failed attempt asked for; drives the blocking retry.
    pub(crate) node_request: usize,
}

impl<'t, T> Walker<'t, T> {
    pub(crate) fn new(tree: &'t MapleTree<T>, index: usize, last: usize) -> Self {
        Self {
            tree,
            index,
            last,
            node: Entry::START,
            min: 0,
            max: usize::MAX,
            offset: 0,
            end: 0,
            depth: 0,
            reserve: SmallVec::new(),
            node_request: 0,
        }
    }

    /// Re-seeds the walker at the root, keeping the target range and the
    /// node reserve.
    #[inline]
    pub(crate) fn reset(&mut self) {
        self.node = Entry::START;
        self.min = 0;
        self.max = usize::MAX;
        self.offset = 0;
        self.end = 0;
        self.depth = 0;
    }

    #[inline]
    pub(crate) fn is_start(&self) -> bool {
        self.node == Entry::START
    }

    #[inline]
    pub(crate) fn is_none(&self) -> bool {
        self.node == Entry::NONE
    }

    #[inline]
    pub(crate) fn is_root_entry(&self) -> bool {
        self.node == Entry::ROOT
    }

    #[inline]
    pub(crate) fn is_paused(&self) -> bool {
        self.node == Entry::PAUSE
    }

    /// Standing on a live node (as opposed to a state sentinel).
    #[inline]
    pub(crate) fn is_active(&self) -> bool {
        self.node.is_node()
    }

    #[inline]
    pub(crate) fn set_err(&mut self, err: Error) {
        self.node = Entry::mk_err(err);
    }

    #[inline]
    pub(crate) fn err(&self) -> Option<Error> {
        self.node.as_err()
    }

    /// Layout of the current node.
    #[inline]
    pub(crate) fn typ(&self) -> NodeType {
        debug_assert!(self.is_active());
        self.node.node_type()
    }

    /// Offset of the last live slot of the current node. Dense nodes have no
    /// pivots; their live width is the node's key span.
    #[inline]
    pub(crate) fn node_end(&self) -> usize {
        let ty = self.typ();
        if ty == NodeType::Dense {
            (self.max - self.min).min(ty.slots() - 1)
        } else {
            self.cur().data_end(ty, self.max)
        }
    }

    /// Borrows the current node.
    #[inline]
    pub(crate) fn cur(&self) -> &'t Node {
        debug_assert!(self.is_active());
        // Safety: walkers hold a borrow of the tree, and retired nodes stay
        // allocated until the tree is quiescent, so a node entry observed
        // during this walk stays dereferenceable.
        unsafe { node_ref(self.node) }
    }

    /// Resolves the `START` state against the root word.
    ///
    /// Afterwards the walker is in `NONE` (empty tree), `ROOT` (singleton
    /// direct entry) or stands on the root node. Returns the raw root word.
    pub(crate) fn start(&mut self) -> Entry {
        debug_assert!(self.is_start());
        let root = self.tree.root_entry();
        self.min = 0;
        self.max = usize::MAX;
        self.offset = 0;
        self.depth = 0;
        if root.is_node() {
            self.node = root.safe();
            self.end = self.node_end();
        } else if root.is_null() {
            self.node = Entry::NONE;
        } else {
            // A single direct entry covering [0, 0].
            self.node = Entry::ROOT;
        }
        root
    }

    /// One step down: choose the slot whose pivot interval contains `index`
    /// and load its child.
    ///
    /// Fails with [`Retry`] when the node died under the walk or the chosen
    /// slot no longer holds a child where the pivot structure requires one.
    pub(crate) fn descend(&mut self) -> Result<(), Retry> {
        debug_assert!(self.is_active() && !self.typ().is_leaf());
        let ty = self.typ();
        let node = self.cur();
        let end = self.end;

        let mut offset = 0;
        while offset < end && node.pivot(ty, offset) < self.index {
            offset += 1;
        }
        self.descend_at(offset)
    }

    /// Descends into the child at `offset` of the current node.
    pub(crate) fn descend_at(&mut self, offset: usize) -> Result<(), Retry> {
        debug_assert!(self.is_active() && !self.typ().is_leaf());
        let ty = self.typ();
        let node = self.cur();
        let (r_min, r_max) = node.slot_range(ty, offset, self.end, self.min, self.max);
        let child = node.slot(ty, offset);

        // Re-check liveness after reading the slot: a dead node's payload is
        // about to be reclaimed and must not be trusted.
        // Safety: `self.node` is a node entry (checked above).
        if node.is_dead(unsafe { self.node.node_ptr() }) {
            return Err(Retry);
        }
        if !child.is_node() {
            // The pivot structure promises a child here; a concurrent writer
            // has replaced this subtree.
            return Err(Retry);
        }

        self.offset = offset;
        self.node = child;
        self.min = r_min;
        self.max = r_max;
        self.depth += 1;
        self.end = self.node_end();
        Ok(())
    }

    /// Descends from the current node to the leaf whose range contains
    /// `index`.
    pub(crate) fn walk_to_leaf(&mut self) -> Result<(), Retry> {
        debug_assert!(self.is_active());
        while !self.typ().is_leaf() {
            self.descend()?;
        }
        Ok(())
    }

    /// Positions the walker on the slot containing `index` within the
    /// current leaf and returns the slot's content and semantic range.
    pub(crate) fn leaf_entry(&mut self) -> (Entry, usize, usize) {
        debug_assert!(self.typ().is_leaf());
        let ty = self.typ();
        let node = self.cur();

        if ty == NodeType::Dense {
            let offset = self.index - self.min;
            self.offset = offset;
            let at = self.min + offset;
            return (node.slot(ty, offset), at, at);
        }

        let end = self.end;
        let mut offset = 0;
        while offset < end && node.pivot(ty, offset) < self.index {
            offset += 1;
        }
        self.offset = offset;
        let (r_min, r_max) = node.slot_range(ty, offset, end, self.min, self.max);
        (node.slot(ty, offset), r_min, r_max)
    }

    /// Full point walk: resolves the root, descends, and returns the content
    /// entry at `index` together with its semantic range.
    pub(crate) fn load_entry(&mut self) -> Result<(Entry, usize, usize), Retry> {
        if self.is_start() {
            self.start();
        }
        if self.is_none() {
            return Ok((Entry::NULL, 0, usize::MAX));
        }
        if self.is_root_entry() {
            return if self.index == 0 {
                Ok((self.tree.root_entry(), 0, 0))
            } else {
                Ok((Entry::NULL, 1, usize::MAX))
            };
        }
        self.walk_to_leaf()?;
        let (entry, r_min, r_max) = self.leaf_entry();
        // The leaf could have died between the last descent and the slot
        // read.
        // Safety: standing on a node entry.
        if self.cur().is_dead(unsafe { self.node.node_ptr() }) {
            return Err(Retry);
        }
        Ok((entry, r_min, r_max))
    }

    /// One step up, recomputing `[min, max]` from the ancestors.
    ///
    /// Returns `true` without moving when the walker already stands on the
    /// root node.
    pub(crate) fn ascend(&mut self) -> Result<bool, Retry> {
        debug_assert!(self.is_active());
        let node = self.cur();
        if node.is_root_node() {
            return Ok(true);
        }
        // Safety: standing on a node entry.
        if node.is_dead(unsafe { self.node.node_ptr() }) {
            return Err(Retry);
        }

        let alloc_mode = self.tree.alloc_mode();
        let p_ptr = node
            .parent_node()
            .expect("non-root node without parent link");
        let p_ty = node.parent_type(alloc_mode);
        let p_slot = node.parent_slot();
        let p_entry = Entry::mk_node(p_ptr, p_ty);

        let mut min = 0;
        let mut max = usize::MAX;
        let mut set_min = false;
        let mut set_max = false;

        // Climb until both bounds are pinned by stored pivots or the root
        // caps them.
        let mut a_entry = p_entry;
        let mut a_slot = p_slot;
        loop {
            // Safety: parent links of live nodes reference live nodes; dead
            // ancestors are caught below.
            let a_node = unsafe { node_ref(a_entry) };
            let a_ty = a_entry.node_type();
            if !set_min && a_slot > 0 {
                min = a_node.pivot(a_ty, a_slot - 1) + 1;
                set_min = true;
            }
            if !set_max {
                if let Some(bound) = live_bound(a_node, a_ty, a_slot) {
                    max = bound;
                    set_max = true;
                }
            }
            if set_min && set_max {
                break;
            }
            if a_node.is_root_node() {
                break;
            }
            // Safety: `a_entry` is a node entry by construction.
            if a_node.is_dead(unsafe { a_entry.node_ptr() }) {
                return Err(Retry);
            }
            let up = a_node
                .parent_node()
                .expect("non-root node without parent link");
            a_slot = a_node.parent_slot();
            a_entry = Entry::mk_node(up, a_node.parent_type(alloc_mode));
        }

        // Safety: `p_entry` is a node entry by construction.
        let p_node = unsafe { node_ref(p_entry) };
        if p_node.is_dead(p_ptr) {
            return Err(Retry);
        }

        self.node = p_entry;
        self.offset = p_slot;
        self.min = min;
        self.max = max;
        self.depth = self.depth.saturating_sub(1);
        self.end = self.node_end();
        Ok(false)
    }

    // === node reserve ===

    /// Takes a zeroed node, preferring the reserve.
    pub(crate) fn node_alloc(&mut self) -> Result<NonNull<Node>, Error> {
        if let Some(node) = self.reserve.pop() {
            return Ok(node);
        }
        NodeCache::alloc()
    }

    /// Tops the reserve up to `count` nodes.
    pub(crate) fn prealloc(&mut self, count: usize) -> Result<(), Error> {
        while self.reserve.len() < count {
            let node = NodeCache::alloc()?;
            self.reserve.push(node);
        }
        Ok(())
    }

    /// Returns a dirtied, unpublished node to the reserve.
    ///
    /// # Safety
    ///
    /// `node` must be unreachable from the tree.
    pub(crate) unsafe fn reclaim_unpublished(&mut self, node: NonNull<Node>) {
        // Safety: ensured by caller.
        unsafe { NodeCache::rezero(node) };
        self.reserve.push(node);
    }
}

impl<T> Drop for Walker<'_, T> {
    fn drop(&mut self) {
        for node in self.reserve.drain(..) {
            // Safety: reserve nodes were never linked into the tree.
            unsafe { NodeCache::free(node) };
        }
    }
}

/// Upper bound of `slot` in `node` if it can be read off the node itself,
/// `None` when the bound is the node's own (unknown here) max.
///
/// A zero pivot at offset 0 is live only when the node holds more than one
/// slot; anywhere else a zero pivot marks the unused tail.
pub(crate) fn live_bound(node: &Node, ty: NodeType, slot: usize) -> Option<usize> {
    if slot >= ty.pivots() {
        return None;
    }
    let pivot = node.pivot(ty, slot);
    if pivot != 0 {
        return Some(pivot);
    }
    if slot == 0 && (node.pivot(ty, ty.pivots() - 1) != 0 || node.meta_end(ty) > 0) {
        return Some(0);
    }
    None
}
