//! The subtree rebuild engine behind every structural write.
//!
//! Node split, underflow rebalance (sibling and cousin) and spanning stores
//! are all the same loop: a staging buffer holds the post-image of one level
//! between a left and a right spine position, gets chopped into one, two or
//! three fresh nodes, and those become payload for the next level up, merged
//! with the untouched siblings on both sides. The loop ends by splicing a
//! single replacement node into the surviving parent slot, or by publishing
//! a new root.
//!
//! Publication protocol: the replacement subtree is fully initialized before
//! the one `Release` store that makes it reachable. Parent words of *kept*
//! children still point at the old nodes at that moment; the adoption pass
//! fixes them immediately after the swap, and only then are the replaced
//! nodes marked dead and retired. A reader overtaken by this sequence either
//! sees a consistent pre-image or trips over a dead marker and restarts.

use core::ptr::NonNull;

use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::bignode::BigNode;
use crate::entry::Entry;
use crate::gap::{child_max_gap, update_gaps};
use crate::node::{Node, NodeType, node_ref};
use crate::walk::{Walker, live_bound};
use crate::{Error, MapleTree};

/// A position at one level of the tree, light enough to carry two of per
/// rebuild.
#[derive(Clone, Copy)]
pub(crate) struct Spot {
    pub(crate) node: Entry,
    pub(crate) min: usize,
    pub(crate) max: usize,
    pub(crate) end: usize,
    pub(crate) depth: usize,
}

impl Spot {
    pub(crate) fn of<T>(wk: &Walker<'_, T>) -> Self {
        debug_assert!(wk.is_active());
        Self {
            node: wk.node,
            min: wk.min,
            max: wk.max,
            end: wk.end,
            depth: wk.depth,
        }
    }
}

/// The ordered set of nodes this write unlinks: `free` holds replaced spine
/// nodes, `destroy` holds whole subtrees that fell inside the stored range.
#[derive(Default)]
pub(crate) struct Topiary {
    free: SmallVec<[Entry; 16]>,
    destroy: SmallVec<[Entry; 8]>,
}

impl Topiary {
    fn flush<T>(self, tree: &MapleTree<T>) {
        for &entry in &self.free {
            // Safety: entries pushed here were live when collected and stay
            // allocated until retired below.
            let node = unsafe { node_ref(entry) };
            // Safety: `entry` is a node entry.
            let ptr = unsafe { entry.node_ptr() };
            node.mark_dead(ptr);
            tree.retire(ptr);
        }
        for &entry in &self.destroy {
            // Demoted spines inside a doomed subtree were already retired
            // flat, and their surviving children live on in the replacement;
            // the sweep must treat them as boundaries.
            retire_subtree_filtered(tree, entry, &self.free);
        }
    }
}

/// Marks every node under `entry` (inclusive) dead and retires it.
pub(crate) fn retire_subtree<T>(tree: &MapleTree<T>, entry: Entry) {
    retire_subtree_filtered(tree, entry, &[]);
}

fn retire_subtree_filtered<T>(tree: &MapleTree<T>, entry: Entry, skip: &[Entry]) {
    if !entry.is_node() || skip.contains(&entry) {
        return;
    }
    let mut stack: SmallVec<[Entry; 32]> = SmallVec::new();
    stack.push(entry);
    while let Some(entry) = stack.pop() {
        let ty = entry.node_type();
        // Safety: subtrees handed to this function stay allocated until the
        // retire below.
        let node = unsafe { node_ref(entry) };
        if !ty.is_leaf() {
            // Unused slots of live nodes are zero or small metadata words,
            // never node entries, so a full scan is safe.
            for offset in 0..ty.slots() {
                let child = node.slot(ty, offset);
                if child.is_node() && !skip.contains(&child) {
                    stack.push(child);
                }
            }
        }
        // Safety: `entry` is a node entry.
        let ptr = unsafe { entry.node_ptr() };
        node.mark_dead(ptr);
        tree.retire(ptr);
    }
}

/// One freshly materialized node.
#[derive(Clone, Copy)]
pub(crate) struct Part {
    ptr: NonNull<Node>,
    pub(crate) entry: Entry,
    min: usize,
    max: usize,
}

/// Writer-side ascent: the parent spot of `spot` plus the child's slot in
/// it. The writer lock keeps parent links stable, so no retry is needed.
fn ascend_spot<T>(tree: &MapleTree<T>, spot: Spot) -> (Spot, usize) {
    let alloc_mode = tree.alloc_mode();
    // Safety: writer lock held, `spot.node` is live.
    let node = unsafe { node_ref(spot.node) };
    let p_ptr = node
        .parent_node()
        .expect("ascended past the root during a rebuild");
    let p_ty = node.parent_type(alloc_mode);
    let p_slot = node.parent_slot();
    let p_entry = Entry::mk_node(p_ptr, p_ty);

    let mut min = 0;
    let mut max = usize::MAX;
    let mut set_min = false;
    let mut set_max = false;
    let mut a_entry = p_entry;
    let mut a_slot = p_slot;
    loop {
        // Safety: parent links of live nodes reference live nodes.
        let a_node = unsafe { node_ref(a_entry) };
        let a_ty = a_entry.node_type();
        if !set_min && a_slot > 0 {
            min = a_node.pivot(a_ty, a_slot - 1) + 1;
            set_min = true;
        }
        if !set_max && let Some(bound) = live_bound(a_node, a_ty, a_slot) {
            max = bound;
            set_max = true;
        }
        if (set_min && set_max) || a_node.is_root_node() {
            break;
        }
        let up = a_node
            .parent_node()
            .expect("non-root node without parent link");
        a_slot = a_node.parent_slot();
        a_entry = Entry::mk_node(up, a_node.parent_type(alloc_mode));
    }

    // Safety: as above.
    let p_node = unsafe { node_ref(p_entry) };
    let end = p_node.data_end(p_ty, max);
    (
        Spot {
            node: p_entry,
            min,
            max,
            end,
            depth: spot.depth.saturating_sub(1),
        },
        p_slot,
    )
}

/// Walks from the root to the node at `depth` whose range contains `key`.
fn spot_at<T>(tree: &MapleTree<T>, key: usize, depth: usize) -> Spot {
    let root = tree.root_entry();
    debug_assert!(root.is_node());
    let mut spot = Spot {
        node: root.safe(),
        min: 0,
        max: usize::MAX,
        end: 0,
        depth: 0,
    };
    // Safety: writer lock held.
    spot.end = unsafe { node_ref(spot.node) }.data_end(spot.node.node_type(), spot.max);
    while spot.depth < depth {
        let ty = spot.node.node_type();
        // Safety: writer lock held.
        let node = unsafe { node_ref(spot.node) };
        let mut offset = 0;
        while offset < spot.end && node.pivot(ty, offset) < key {
            offset += 1;
        }
        let (r_min, r_max) = node.slot_range(ty, offset, spot.end, spot.min, spot.max);
        let child = node.slot(ty, offset);
        debug_assert!(child.is_node());
        spot.node = child;
        spot.min = r_min;
        spot.max = r_max;
        spot.depth += 1;
        // Safety: writer lock held.
        spot.end = unsafe { node_ref(child) }.data_end(child.node_type(), r_max);
    }
    spot
}

/// Splits the staging payload into 1-3 part lengths, keeping every part
/// within `[min_slots, slots]`, shifting boundaries off absent slots, and
/// keeping the first leaf part dense in keyspace.
fn split_bounds(b: &BigNode) -> SmallVec<[usize; 3]> {
    let slots = b.ty.slots();
    let min_slots = b.ty.min_slots();
    let len = b.len;
    let mut bounds: SmallVec<[usize; 3]> = SmallVec::new();

    if len <= slots {
        bounds.push(len);
        return bounds;
    }

    if len < 2 * slots {
        let mut split = len / 2;
        if b.ty.is_leaf() {
            // Keep the left node dense in keyspace, not just in population,
            // unless that would leave the right side deficient.
            while split < slots
                && len - (split + 1) >= min_slots
                && b.pivot[split - 1] - b.min < slots - 1
            {
                split += 1;
            }
        }
        split = shift_off_null(b, split, min_slots, slots);
        bounds.push(split);
        bounds.push(len);
        return bounds;
    }

    // Middle-node case: three outputs.
    let first = shift_off_null(b, len / 3, min_slots, slots);
    let second = shift_off_null(b, first + (len - first) / 2, min_slots, slots);
    bounds.push(first);
    bounds.push(second);
    bounds.push(len);
    bounds
}

/// Moves a split boundary off an absent slot. Adjacent absent slots never
/// survive staging, so one step suffices; prefer the step that keeps both
/// sides legal.
fn shift_off_null(b: &BigNode, split: usize, min_slots: usize, slots: usize) -> usize {
    if !b.slot[split - 1].is_null() {
        return split;
    }
    if split < slots && b.len - (split + 1) >= min_slots {
        split + 1
    } else {
        debug_assert!(split - 1 >= min_slots);
        split - 1
    }
}

/// Writes the staged slots `start..stop` into a fresh node.
fn materialize<T>(
    wk: &mut Walker<'_, T>,
    b: &BigNode,
    start: usize,
    stop: usize,
    built: &mut SmallVec<[NonNull<Node>; 8]>,
) -> Result<Part, Error> {
    let ty = b.ty;
    let len = stop - start;
    debug_assert!(len > 0 && len <= ty.slots());
    let ptr = wk.node_alloc()?;
    built.push(ptr);
    // Safety: fresh node, unpublished, exclusively ours.
    let node = unsafe { ptr.as_ref() };

    let min = b.slot_min(start);
    let max = b.pivot[stop - 1];
    for j in 0..len {
        node.set_slot(ty, j, b.slot[start + j]);
        if j < len - 1 {
            node.set_pivot(ty, j, b.pivot[start + j]);
        }
    }
    if len < ty.slots() {
        node.set_meta_end(ty, len - 1);
    }
    if ty == NodeType::Arange64 {
        for j in 0..len {
            let child = b.slot[start + j];
            node.set_gap(ty, j, child_max_gap(child, b.slot_min(start + j), b.pivot[start + j]));
        }
    }

    Ok(Part {
        ptr,
        entry: Entry::mk_node(ptr, ty),
        min,
        max,
    })
}

fn chop<T>(
    wk: &mut Walker<'_, T>,
    b: &BigNode,
    built: &mut SmallVec<[NonNull<Node>; 8]>,
) -> Result<SmallVec<[Part; 3]>, Error> {
    let bounds = split_bounds(b);
    let mut parts = SmallVec::new();
    let mut start = 0;
    for &stop in &bounds {
        parts.push(materialize(wk, b, start, stop, built)?);
        start = stop;
    }
    Ok(parts)
}

/// Re-points the children of every fresh internal node at it. Runs after
/// publication; fresh children are rewritten with the value they already
/// hold, kept children move off their replaced parents.
fn adopt_children(new_internals: &[Part]) {
    for part in new_internals {
        let ty = part.entry.node_type();
        // Safety: fresh nodes stay allocated; we built them this operation.
        let node = unsafe { part.ptr.as_ref() };
        for offset in 0..ty.slots() {
            let child = node.slot(ty, offset);
            if child.is_node() {
                // Safety: children of a published internal node are live.
                unsafe { node_ref(child) }.set_parent(part.ptr, offset);
            }
        }
    }
}

/// Pulls the same-level neighbor of the staged span into the payload so a
/// deficient post-image can be redistributed. The neighbor is found by key
/// through the root, which reaches cousins as well as siblings.
fn absorb_neighbor<T>(
    tree: &MapleTree<T>,
    l: &mut Spot,
    r: &mut Spot,
    b: &mut BigNode,
    topiary: &mut Topiary,
) {
    let converged = l.node == r.node;
    if b.min > 0 {
        let n = spot_at(tree, b.min - 1, l.depth);
        // Safety: writer lock held.
        let n_node = unsafe { node_ref(n.node) };
        let mut merged = BigNode::new(b.ty, n.min);
        merged.copy_node(n_node, n.node.node_type(), 0, n.end, n.end, n.max);
        for offset in 0..b.len {
            merged.push(b.slot[offset], b.pivot[offset]);
        }
        trace!(min = n.min, max = n.max, "absorbing left neighbor");
        if !converged {
            // The old left spine now lies strictly inside the staged span.
            // Its surviving children are in the payload, so it dies flat,
            // and the middle sweep above it must not descend into it.
            topiary.free.push(l.node);
        }
        *b = merged;
        *l = n;
    } else if r.max < usize::MAX {
        let n = spot_at(tree, r.max + 1, r.depth);
        // Safety: writer lock held.
        let n_node = unsafe { node_ref(n.node) };
        b.copy_node(n_node, n.node.node_type(), 0, n.end, n.end, n.max);
        trace!(min = n.min, max = n.max, "absorbing right neighbor");
        if !converged {
            topiary.free.push(r.node);
        }
        *r = n;
    } else {
        // A deficient non-root level with no neighbor violates the fill
        // invariant of the pre-image.
        unreachable!("deficient level with no neighbor to rebalance against");
    }
}

/// Materializes a staged payload as the tree's first real leaf and
/// publishes it over a root that held no node.
pub(crate) fn plant_root<T>(wk: &mut Walker<'_, T>, b: &BigNode) -> Result<(), Error> {
    debug_assert!(b.ty.is_leaf() && b.len <= b.ty.slots());
    let mut built: SmallVec<[NonNull<Node>; 8]> = SmallVec::new();
    match materialize(wk, b, 0, b.len, &mut built) {
        Ok(part) => {
            // Safety: fresh node, unpublished until the root store below.
            unsafe { part.ptr.as_ref() }.set_parent_root();
            wk.tree.publish_root(part.entry.mk_root(), 1);
            debug!("planted root leaf");
            Ok(())
        }
        Err(err) => {
            for ptr in built.drain(..) {
                // Safety: built nodes are unreachable from the tree.
                unsafe { wk.reclaim_unpublished(ptr) };
            }
            Err(err)
        }
    }
}

/// Replaces everything from `l` to `r` (one node when they are equal) with
/// the staged payload, propagating splits, rebalances and height changes to
/// the root, then publishes with a single pointer swap.
pub(crate) fn rebuild<T>(
    wk: &mut Walker<'_, T>,
    l: Spot,
    r: Spot,
    bnode: BigNode,
) -> Result<(), Error> {
    let mut built: SmallVec<[NonNull<Node>; 8]> = SmallVec::new();
    let result = rebuild_inner(wk, l, r, bnode, &mut built);
    if result.is_err() {
        // All-or-nothing: nothing was published, so every node built for
        // this attempt goes back to the reserve.
        for ptr in built.drain(..) {
            // Safety: built nodes are unreachable from the tree.
            unsafe { wk.reclaim_unpublished(ptr) };
        }
    }
    result
}

fn rebuild_inner<T>(
    wk: &mut Walker<'_, T>,
    mut l: Spot,
    mut r: Spot,
    mut bnode: BigNode,
    built: &mut SmallVec<[NonNull<Node>; 8]>,
) -> Result<(), Error> {
    let tree = wk.tree;
    let alloc_mode = tree.alloc_mode();
    let internal_ty = if alloc_mode {
        NodeType::Arange64
    } else {
        NodeType::Range64
    };
    let mut topiary = Topiary::default();
    let mut new_internals: SmallVec<[Part; 8]> = SmallVec::new();
    // Parts of the level below the one being staged. Their parent words
    // must be final before publication; kept children are adopted after it.
    let mut prev_parts: SmallVec<[Part; 3]> = SmallVec::new();
    let mut levels = 1usize;

    loop {
        let converged = l.node == r.node;
        // Safety: writer lock held; spine nodes are live until retired.
        let l_node = unsafe { node_ref(l.node) };
        let root_level = l_node.is_root_node();

        if converged && root_level {
            // Collapses that skip materializing this level.
            if !bnode.ty.is_leaf() && bnode.len == 1 {
                let child = bnode.slot[0];
                // Safety: the child is a fresh part or a kept live node.
                unsafe { node_ref(child) }.set_parent_root();
                topiary.free.push(l.node);
                tree.publish_root(child.mk_root(), levels - 1);
                adopt_children(&new_internals);
                topiary.flush(tree);
                debug!(height = levels - 1, "root collapsed into single child");
                return Ok(());
            }
            if bnode.ty.is_leaf() && bnode.len == 1 && bnode.slot[0].is_null() {
                topiary.free.push(l.node);
                tree.publish_root(Entry::NULL, 0);
                topiary.flush(tree);
                debug!("tree emptied");
                return Ok(());
            }
        }

        // A deficient payload borrows a same-level neighbor before it is
        // materialized. Spans already covering the whole keyspace have no
        // neighbor; they keep ascending and resolve at the root, which may
        // legally be under-filled.
        if bnode.len < bnode.ty.min_slots()
            && !(converged && root_level)
            && (bnode.min > 0 || r.max < usize::MAX)
        {
            absorb_neighbor(tree, &mut l, &mut r, &mut bnode, &mut topiary);
            continue;
        }

        let parts = chop(wk, &bnode, built)?;
        if !bnode.ty.is_leaf() {
            // Fresh children point at their fresh parents before anything
            // here becomes reachable.
            for part in &parts {
                let ty = part.entry.node_type();
                // Safety: fresh node, unpublished.
                let node = unsafe { part.ptr.as_ref() };
                for offset in 0..ty.slots() {
                    let child = node.slot(ty, offset);
                    if prev_parts.iter().any(|p| p.entry == child) {
                        // Safety: `child` is one of this write's fresh nodes.
                        unsafe { node_ref(child) }.set_parent(part.ptr, offset);
                    }
                }
            }
            new_internals.extend(parts.iter().copied());
        }

        if converged && root_level {
            let (root_entry, height) = if parts.len() == 1 {
                let part = parts[0];
                // Safety: fresh node, unpublished.
                unsafe { part.ptr.as_ref() }.set_parent_root();
                (part.entry.mk_root(), levels)
            } else {
                // The tree grows: a new root spans the split pieces.
                let root_ptr = wk.node_alloc()?;
                built.push(root_ptr);
                // Safety: fresh node, unpublished.
                let root_node = unsafe { root_ptr.as_ref() };
                for (j, part) in parts.iter().enumerate() {
                    root_node.set_slot(internal_ty, j, part.entry);
                    if j < parts.len() - 1 {
                        root_node.set_pivot(internal_ty, j, part.max);
                    }
                    if internal_ty == NodeType::Arange64 {
                        root_node.set_gap(
                            internal_ty,
                            j,
                            child_max_gap(part.entry, part.min, part.max),
                        );
                    }
                    // Safety: fresh node, unpublished.
                    unsafe { part.ptr.as_ref() }.set_parent(root_ptr, j);
                }
                root_node.set_meta_end(internal_ty, parts.len() - 1);
                root_node.set_parent_root();
                let root_part = Part {
                    ptr: root_ptr,
                    entry: Entry::mk_node(root_ptr, internal_ty),
                    min: 0,
                    max: usize::MAX,
                };
                new_internals.push(root_part);
                (root_part.entry.mk_root(), levels + 1)
            };
            topiary.free.push(l.node);
            tree.publish_root(root_entry, height);
            adopt_children(&new_internals);
            topiary.flush(tree);
            debug!(height, parts = parts.len(), "rebuilt through the root");
            return Ok(());
        }

        if converged && parts.len() == 1 {
            let part = parts[0];
            debug_assert!(part.min == l.min && part.max == l.max);
            // Safety: writer lock held; the parent outlives the splice.
            let p_ptr = l_node
                .parent_node()
                .expect("non-root node without parent link");
            let p_ty = l_node.parent_type(alloc_mode);
            let p_slot = l_node.parent_slot();
            // Safety: fresh node, unpublished until the slot store below.
            unsafe { part.ptr.as_ref() }.set_parent(p_ptr, p_slot);
            // Safety: parent links of live nodes reference live nodes.
            let p_node = unsafe { p_ptr.as_ref() };
            p_node.set_slot(p_ty, p_slot, part.entry);
            topiary.free.push(l.node);
            adopt_children(&new_internals);
            topiary.flush(tree);
            if alloc_mode {
                update_gaps(tree, part.entry, child_max_gap(part.entry, part.min, part.max));
            }
            trace!(levels, "spliced replacement subtree");
            return Ok(());
        }

        // Ascend one level: the parts plus both sides' untouched siblings
        // become the next payload.
        let (lp, l_slot) = ascend_spot(tree, l);
        let (rp, r_slot) = if converged {
            (lp, l_slot)
        } else {
            ascend_spot(tree, r)
        };
        let p_ty = lp.node.node_type();
        // Safety: writer lock held.
        let lp_node = unsafe { node_ref(lp.node) };
        // Safety: writer lock held.
        let rp_node = unsafe { node_ref(rp.node) };

        let mut nb = BigNode::new(internal_ty, lp.min);
        if l_slot > 0 {
            nb.copy_node(lp_node, p_ty, 0, l_slot - 1, lp.end, lp.max);
        }
        for part in &parts {
            nb.push(part.entry, part.max);
        }
        // Everything strictly between the spines fell inside the stored
        // range. Former spines demoted by a neighbor absorption are already
        // on the flat dead list; their surviving children live on in the
        // payload, so the sweep must not descend into them.
        let mut doomed = |entry: Entry| {
            if !topiary.free.contains(&entry) {
                topiary.destroy.push(entry);
            }
        };
        if lp.node == rp.node {
            for offset in l_slot + 1..r_slot {
                doomed(lp_node.slot(p_ty, offset));
            }
        } else {
            for offset in l_slot + 1..=lp.end {
                doomed(lp_node.slot(p_ty, offset));
            }
            for offset in 0..r_slot {
                doomed(rp_node.slot(p_ty, offset));
            }
        }
        if r_slot < rp.end {
            nb.copy_node(rp_node, p_ty, r_slot + 1, rp.end, rp.end, rp.max);
        }

        topiary.free.push(l.node);
        if !converged {
            topiary.free.push(r.node);
        }
        l = lp;
        r = rp;
        bnode = nb;
        prev_parts = parts;
        levels += 1;
    }
}
