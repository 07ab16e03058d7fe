//! The staging buffer a write assembles its post-image in.
//!
//! A [`BigNode`] is an over-sized scratch node: wide enough to hold the
//! merged contents of two full nodes plus the up-to-three slots a store can
//! emit at its boundaries. It lives on the writer's stack, accumulates the
//! post-image of one level of the tree, and is then chopped into one, two or
//! three freshly allocated nodes.
//!
//! Pushes into a leaf-typed buffer coalesce adjacent absent slots, which is
//! what merges a stored absent range with its absent neighbors.

use crate::entry::Entry;
use crate::node::{BIG_SLOTS, Node, NodeType};

pub(crate) struct BigNode {
    pub(crate) pivot: [usize; BIG_SLOTS],
    pub(crate) slot: [Entry; BIG_SLOTS],
    /// Number of used slots.
    pub(crate) len: usize,
    /// Variant the payload will be chopped into.
    pub(crate) ty: NodeType,
    /// Lower bound of the keyspace this payload tiles.
    pub(crate) min: usize,
}

impl BigNode {
    pub(crate) fn new(ty: NodeType, min: usize) -> Self {
        Self {
            pivot: [0; BIG_SLOTS],
            slot: [Entry::NULL; BIG_SLOTS],
            len: 0,
            ty,
            min,
        }
    }

    /// Upper bound of the payload so far.
    #[inline]
    pub(crate) fn last_pivot(&self) -> usize {
        debug_assert!(self.len > 0);
        self.pivot[self.len - 1]
    }

    /// Appends one slot ending at `pivot`. Adjacent absent slots of a leaf
    /// payload are merged into one.
    pub(crate) fn push(&mut self, entry: Entry, pivot: usize) {
        debug_assert!(self.len == 0 || pivot > self.last_pivot());
        if self.ty.is_leaf() && self.len > 0 && entry.is_null() && self.slot[self.len - 1].is_null()
        {
            self.pivot[self.len - 1] = pivot;
            return;
        }
        self.pivot[self.len] = pivot;
        self.slot[self.len] = entry;
        self.len += 1;
    }

    /// Appends the slots `from..=to` of `node`, a live node whose last live
    /// slot is `end` and whose bounds are `[_, max]`.
    pub(crate) fn copy_node(
        &mut self,
        node: &Node,
        ty: NodeType,
        from: usize,
        to: usize,
        end: usize,
        max: usize,
    ) {
        debug_assert!(to <= end);
        for offset in from..=to {
            self.push(node.slot(ty, offset), node.bound(ty, offset, end, max));
        }
    }

    /// Lower bound of the slot at `offset`.
    #[inline]
    pub(crate) fn slot_min(&self, offset: usize) -> usize {
        if offset == 0 {
            self.min
        } else {
            self.pivot[offset - 1] + 1
        }
    }
}
