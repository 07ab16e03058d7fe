//! Node layout, parent encoding and the node cache.
//!
//! Every node is one 256-byte block: a parent word followed by a payload of
//! machine words that each layout variant carves up differently. All payload
//! words are atomics because readers walk nodes while a writer publishes
//! replacements; a published node's payload is immutable apart from the
//! append path, which only ever writes words beyond the live end.
//!
//! Common invariants:
//! - Stored pivots are non-decreasing; a zero pivot at offset > 0 marks the
//!   unused tail of the node.
//! - The live slots of a node tile its implied `[min, max]` range exactly.
//!   The last live slot's upper bound is either its stored pivot or, for the
//!   final slot, the node's `max`.
//! - A node is attached by writing an encoded pointer into a parent slot (or
//!   the tree's root word) only after its payload and parent word are final.
//! - A node whose parent word points at the node itself is dead; readers
//!   that observe a dead node restart from the root.

use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::Error;
use crate::entry::{Entry, NODE_MASK};

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        /// Slots in a dense node, which is all payload.
        pub(crate) const SLOTS_DENSE: usize = 31;
        /// Slots in the 64-bit-pivot range variants (leaf and internal).
        pub(crate) const SLOTS_R64: usize = 16;
        /// Slots in the allocation-mode internal variant.
        pub(crate) const SLOTS_A64: usize = 10;
    } else {
        pub(crate) const SLOTS_DENSE: usize = 63;
        pub(crate) const SLOTS_R64: usize = 32;
        pub(crate) const SLOTS_A64: usize = 21;
    }
}

/// Capacity of the staging buffer a write assembles its post-image in: wide
/// enough for two full nodes plus the two boundary fragments.
pub(crate) const BIG_SLOTS: usize = 2 * SLOTS_R64 + 2;

const PARENT_ROOT: usize = 0x01;
const PARENT_NOT_RANGE16: usize = 0x02;
const PARENT_NOT_RANGE32: usize = 0x04;
const PARENT_RANGE64: usize = PARENT_NOT_RANGE16 | PARENT_NOT_RANGE32;
const PARENT_SLOT_SHIFT: usize = 3;
const PARENT_SLOT_MASK: usize = 0xF8;
const PARENT_16B_SLOT_SHIFT: usize = 2;
const PARENT_16B_SLOT_MASK: usize = 0xFC;

/// Layout variants. The discriminant is stored in bits 3-6 of an encoded
/// node pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub(crate) enum NodeType {
    /// Leaf holding one value per key offset from the node's `min`. Read
    /// support only; the write pipeline never produces one.
    Dense = 0,
    /// Leaf with word pivots.
    Leaf64 = 1,
    /// Internal with word pivots.
    Range64 = 2,
    /// Internal with word pivots and per-slot gap tracking.
    Arange64 = 3,
}

impl NodeType {
    #[inline]
    pub(crate) const fn from_bits(bits: usize) -> Self {
        match bits {
            0 => NodeType::Dense,
            1 => NodeType::Leaf64,
            2 => NodeType::Range64,
            3 => NodeType::Arange64,
            _ => panic!("corrupt node type bits"),
        }
    }

    #[inline]
    pub(crate) const fn is_leaf(self) -> bool {
        matches!(self, NodeType::Dense | NodeType::Leaf64)
    }

    #[inline]
    pub(crate) const fn slots(self) -> usize {
        match self {
            NodeType::Dense => SLOTS_DENSE,
            NodeType::Leaf64 | NodeType::Range64 => SLOTS_R64,
            NodeType::Arange64 => SLOTS_A64,
        }
    }

    #[inline]
    pub(crate) const fn pivots(self) -> usize {
        match self {
            NodeType::Dense => 0,
            _ => self.slots() - 1,
        }
    }

    /// Fewest live slots a non-root node of this variant may hold. Chosen so
    /// that merging three deficient nodes into two is always legal.
    #[inline]
    pub(crate) const fn min_slots(self) -> usize {
        match self {
            NodeType::Dense => SLOTS_DENSE / 2,
            NodeType::Leaf64 | NodeType::Range64 => SLOTS_R64 / 2 - 2,
            NodeType::Arange64 => SLOTS_A64 / 2 - 1,
        }
    }

    /// Word index of the slot array within the payload.
    #[inline]
    const fn slot_base(self) -> usize {
        self.pivots()
    }

    /// Word index of the gap array within the payload.
    #[inline]
    const fn gap_base(self) -> usize {
        debug_assert!(matches!(self, NodeType::Arange64));
        2 * SLOTS_A64 - 1
    }

    /// Word index of the end-metadata word. It occupies payload space that is
    /// provably unused whenever the metadata is consulted: the last slot of a
    /// range node (only read when the final stored pivot is zero, i.e. the
    /// tail is unused), or the word past an allocation node's gap array.
    #[inline]
    const fn meta_base(self) -> usize {
        match self {
            NodeType::Dense => panic!("dense nodes carry no metadata"),
            NodeType::Leaf64 | NodeType::Range64 => self.slot_base() + self.slots() - 1,
            NodeType::Arange64 => self.gap_base() + SLOTS_A64,
        }
    }
}

/// Number of payload words after the parent word.
const PAYLOAD_WORDS: usize = SLOTS_DENSE;

/// One tree node. Variant-agnostic storage; all interpretation goes through
/// the [`NodeType`]-taking accessors.
#[repr(C, align(256))]
pub(crate) struct Node {
    parent: AtomicUsize,
    words: [AtomicUsize; PAYLOAD_WORDS],
}

const _: () = {
    assert!(size_of::<Node>() == 256);
    // The widest variants must fit the payload exactly.
    assert!(NodeType::Range64.slot_base() + SLOTS_R64 == PAYLOAD_WORDS);
    assert!(NodeType::Arange64.meta_base() < PAYLOAD_WORDS);
    // Tag bits of an encoded pointer must fit below the node alignment.
    assert!(align_of::<Node>() > NODE_MASK);
};

impl Node {
    // === pivots ===

    /// Loads the pivot at `offset`.
    #[inline]
    pub(crate) fn pivot(&self, ty: NodeType, offset: usize) -> usize {
        debug_assert!(offset < ty.pivots());
        self.words[offset].load(Ordering::Acquire)
    }

    /// Upper bound of the slot at `offset` in a node whose last live slot is
    /// `end` and whose implied upper bound is `max`.
    #[inline]
    pub(crate) fn bound(&self, ty: NodeType, offset: usize, end: usize, max: usize) -> usize {
        debug_assert!(offset <= end);
        if offset == end {
            max
        } else {
            self.pivot(ty, offset)
        }
    }

    #[inline]
    pub(crate) fn set_pivot(&self, ty: NodeType, offset: usize, pivot: usize) {
        debug_assert!(offset < ty.pivots());
        self.words[offset].store(pivot, Ordering::Release);
    }

    // === slots ===

    #[inline]
    pub(crate) fn slot(&self, ty: NodeType, offset: usize) -> Entry {
        debug_assert!(offset < ty.slots());
        Entry(self.words[ty.slot_base() + offset].load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_slot(&self, ty: NodeType, offset: usize, entry: Entry) {
        debug_assert!(offset < ty.slots());
        self.words[ty.slot_base() + offset].store(entry.0, Ordering::Release);
    }

    // === gaps (allocation-mode internal nodes) ===

    #[inline]
    pub(crate) fn gap(&self, ty: NodeType, offset: usize) -> usize {
        debug_assert!(offset < SLOTS_A64);
        self.words[ty.gap_base() + offset].load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_gap(&self, ty: NodeType, offset: usize, gap: usize) {
        debug_assert!(offset < SLOTS_A64);
        self.words[ty.gap_base() + offset].store(gap, Ordering::Release);
    }

    /// Largest gap recorded for any slot of an allocation-mode internal
    /// node. Unused slots carry a zero gap, so the scan needs no bound.
    pub(crate) fn max_gap(&self, ty: NodeType) -> usize {
        debug_assert!(ty == NodeType::Arange64);
        let mut max = 0;
        for offset in 0..SLOTS_A64 {
            max = max.max(self.gap(ty, offset));
        }
        max
    }

    // === occupancy ===

    /// Offset of the last live slot. `max` is the node's implied upper bound.
    ///
    /// The final stored pivot disambiguates: non-zero means the data runs
    /// into the last one or two slots, zero means the tail is unused and the
    /// metadata word holds the end. A stored zero pivot inside live data can
    /// only occur at offset 0 (an entry ending at key 0), which the metadata
    /// word also covers.
    pub(crate) fn data_end(&self, ty: NodeType, max: usize) -> usize {
        if ty == NodeType::Dense {
            return ty.slots() - 1;
        }
        let last = ty.pivots() - 1;
        let pivot = self.pivot(ty, last);
        if pivot != 0 {
            return if pivot == max { last } else { last + 1 };
        }
        self.meta_end(ty)
    }

    #[inline]
    pub(crate) fn meta_end(&self, ty: NodeType) -> usize {
        self.words[ty.meta_base()].load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_meta_end(&self, ty: NodeType, end: usize) {
        debug_assert!(end < ty.slots());
        self.words[ty.meta_base()].store(end, Ordering::Release);
    }

    /// Semantic range `[r_min, r_max]` of the slot at `offset` within a node
    /// bounded by `[min, max]` whose last live slot is `end`.
    #[inline]
    pub(crate) fn slot_range(
        &self,
        ty: NodeType,
        offset: usize,
        end: usize,
        min: usize,
        max: usize,
    ) -> (usize, usize) {
        let r_min = if offset == 0 {
            min
        } else {
            self.pivot(ty, offset - 1) + 1
        };
        (r_min, self.bound(ty, offset, end, max))
    }

    // === parent encoding ===

    /// Links this node under `parent` at `slot`.
    ///
    /// The slot index is packed into the low byte: the wide-pivot families
    /// keep it at bits 3 and up, the 16-bit-pivot family (unused by the
    /// current variants, kept for the encoding's sake) at bits 2 and up.
    #[inline]
    pub(crate) fn set_parent(&self, parent: NonNull<Node>, slot: usize) {
        let addr = parent.as_ptr() as usize;
        debug_assert_eq!(addr & NODE_MASK, 0);
        debug_assert!(slot << PARENT_SLOT_SHIFT <= PARENT_SLOT_MASK);
        let word = addr | (slot << PARENT_SLOT_SHIFT) | PARENT_RANGE64;
        self.parent.store(word, Ordering::Release);
    }

    /// Marks this node as the tree root: its parent word names the tree
    /// handle rather than a node.
    #[inline]
    pub(crate) fn set_parent_root(&self) {
        self.parent.store(PARENT_ROOT, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_root_node(&self) -> bool {
        self.parent.load(Ordering::Acquire) & PARENT_ROOT != 0
    }

    /// Slot index this node occupies inside its parent.
    #[inline]
    pub(crate) fn parent_slot(&self) -> usize {
        let word = self.parent.load(Ordering::Acquire);
        debug_assert_eq!(word & PARENT_ROOT, 0);
        if word & PARENT_NOT_RANGE16 == 0 {
            (word & PARENT_16B_SLOT_MASK) >> PARENT_16B_SLOT_SHIFT
        } else {
            (word & PARENT_SLOT_MASK) >> PARENT_SLOT_SHIFT
        }
    }

    /// The parent node, or `None` for the root.
    #[inline]
    pub(crate) fn parent_node(&self) -> Option<NonNull<Node>> {
        let word = self.parent.load(Ordering::Acquire);
        if word & PARENT_ROOT != 0 {
            return None;
        }
        NonNull::new((word & !NODE_MASK) as *mut Node)
    }

    /// Layout of the parent node, reconstructed from the family bits of the
    /// parent word plus the tree's allocation-mode flag (the full variant
    /// tag does not fit the encoding).
    #[inline]
    pub(crate) fn parent_type(&self, alloc_mode: bool) -> NodeType {
        let word = self.parent.load(Ordering::Acquire);
        debug_assert_eq!(word & PARENT_ROOT, 0);
        match word & PARENT_RANGE64 {
            PARENT_RANGE64 if alloc_mode => NodeType::Arange64,
            PARENT_RANGE64 => NodeType::Range64,
            // The 16- and 32-bit pivot families are never linked.
            _ => unreachable!("parent word with unlinked variant family"),
        }
    }

    /// Marks this node dead. Must happen only after its replacement is
    /// reachable.
    #[inline]
    pub(crate) fn mark_dead(&self, own: NonNull<Node>) {
        self.parent.store(own.as_ptr() as usize, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_dead(&self, own: NonNull<Node>) -> bool {
        self.parent.load(Ordering::Acquire) == own.as_ptr() as usize
    }
}

/// Borrows a node out of an encoded pointer.
///
/// # Safety
///
/// `entry` must be a node entry referencing a node that stays allocated for
/// `'a`. Walks tie `'a` to a borrow of the tree; the graveyard keeps retired
/// nodes allocated until the tree is quiescent.
#[inline]
pub(crate) unsafe fn node_ref<'a>(entry: Entry) -> &'a Node {
    // Safety: ensured by caller.
    unsafe { entry.node_ptr().as_ref() }
}

/// Source of zeroed nodes and sink for dead ones.
///
/// The contract mirrors what the surrounding system provides: zeroed
/// allocation, plus bulk free of nodes that no reader can still observe.
pub(crate) struct NodeCache;

impl NodeCache {
    pub(crate) fn alloc() -> Result<NonNull<Node>, Error> {
        let layout = Layout::new::<Node>();
        // Safety: `Node` has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr.cast()).ok_or(Error::OutOfMemory)
    }

    /// Returns a node to the allocator.
    ///
    /// # Safety
    ///
    /// `node` must come from [`NodeCache::alloc`] and must be unreachable
    /// from any tree and any running reader.
    pub(crate) unsafe fn free(node: NonNull<Node>) {
        let layout = Layout::new::<Node>();
        // Safety: allocated by `alloc` with this layout; caller guarantees
        // exclusivity.
        unsafe { std::alloc::dealloc(node.as_ptr().cast(), layout) };
    }

    /// Scrubs a dirtied node back to its freshly-allocated state so it can
    /// re-enter a walker's reserve.
    ///
    /// # Safety
    ///
    /// `node` must be unreachable from any tree and any running reader.
    pub(crate) unsafe fn rezero(node: NonNull<Node>) {
        // Safety: exclusivity guaranteed by the caller; `Node` is plain
        // atomics so overwriting with zeroes yields a valid value.
        unsafe { node.as_ptr().write_bytes(0, 1) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> NonNull<Node> {
        NodeCache::alloc().unwrap()
    }

    #[test]
    fn parent_round_trip() {
        let parent = fresh();
        let child = fresh();
        // Safety: freshly allocated, exclusively owned.
        let node = unsafe { child.as_ref() };
        node.set_parent(parent, 9);
        assert_eq!(node.parent_slot(), 9);
        assert_eq!(node.parent_node(), Some(parent));
        assert_eq!(node.parent_type(false), NodeType::Range64);
        assert_eq!(node.parent_type(true), NodeType::Arange64);
        assert!(!node.is_root_node());
        assert!(!node.is_dead(child));

        node.mark_dead(child);
        assert!(node.is_dead(child));

        // Safety: never linked anywhere.
        unsafe {
            NodeCache::free(parent);
            NodeCache::free(child);
        }
    }

    #[test]
    fn data_end_scan() {
        let ptr = fresh();
        // Safety: freshly allocated, exclusively owned.
        let node = unsafe { ptr.as_ref() };
        let ty = NodeType::Leaf64;

        // Fresh node: metadata word reads zero, a single live slot.
        assert_eq!(node.data_end(ty, usize::MAX), 0);

        // Two live slots, recorded in the metadata word because the stored
        // pivot tail is all zeroes.
        node.set_pivot(ty, 0, 10);
        node.set_slot(ty, 0, Entry(0x1000));
        node.set_slot(ty, 1, Entry(0x2000));
        node.set_meta_end(ty, 1);
        assert_eq!(node.data_end(ty, usize::MAX), 1);

        // An entry ending at key zero relies on the metadata word too.
        node.set_pivot(ty, 0, 0);
        assert_eq!(node.data_end(ty, usize::MAX), 1);

        // A non-zero final pivot overrides the metadata word.
        let last = ty.pivots() - 1;
        node.set_pivot(ty, last, 500);
        assert_eq!(node.data_end(ty, 500), last);
        assert_eq!(node.data_end(ty, usize::MAX), last + 1);

        // Safety: never linked anywhere.
        unsafe { NodeCache::free(ptr) };
    }

    #[test]
    fn slot_ranges() {
        let ptr = fresh();
        // Safety: freshly allocated, exclusively owned.
        let node = unsafe { ptr.as_ref() };
        let ty = NodeType::Leaf64;
        node.set_pivot(ty, 0, 99);
        node.set_pivot(ty, 1, 200);

        assert_eq!(node.slot_range(ty, 0, 2, 50, 1000), (50, 99));
        assert_eq!(node.slot_range(ty, 1, 2, 50, 1000), (100, 200));
        assert_eq!(node.slot_range(ty, 2, 2, 50, 1000), (201, 1000));

        // Safety: never linked anywhere.
        unsafe { NodeCache::free(ptr) };
    }
}
