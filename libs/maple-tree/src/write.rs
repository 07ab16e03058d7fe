//! The range-store pipeline.
//!
//! A store resolves the root cases first (empty tree, single direct entry,
//! whole-range erase), then walks to the leaf containing the low end of the
//! target range. Writes contained in that leaf commit through one of:
//!
//! - **exact slot store** — the range matches an existing slot; one word
//!   swap, always reader-safe.
//! - **append** — the staged image only adds slots past the live end; new
//!   words are written first and the single pivot store that exposes them
//!   goes last.
//! - **in-place rewrite** — the staged image fits and the tree is not in
//!   reader-visible mode.
//! - **rebuild** — everything else goes through the staging buffer and the
//!   subtree engine, which also covers splits and rebalances.
//!
//! Writes that cross leaf boundaries stage both edge leaves and hand the
//! payload to the same engine.
//!
//! Absent stores are normalized up front: the target range is widened over
//! adjacent absent ranges (also across leaf boundaries) so no two absent
//! slots ever end up adjacent.

use tracing::trace;

use crate::Error;
use crate::bignode::BigNode;
use crate::entry::Entry;
use crate::gap::{leaf_max_gap, update_gaps};
use crate::node::NodeType;
use crate::rebuild::{Spot, plant_root, rebuild, retire_subtree};
use crate::walk::Walker;

/// Stores `entry` over the walker's `[index, last]`, replacing whatever the
/// range holds.
///
/// A failure is also parked in the walker's node word, which is how the
/// internal state machine propagates errors.
pub(crate) fn store<T>(wk: &mut Walker<'_, T>, entry: Entry) -> Result<(), Error> {
    let result = store_inner(wk, entry);
    if let Err(err) = result {
        wk.set_err(err);
    }
    result
}

fn store_inner<T>(wk: &mut Walker<'_, T>, entry: Entry) -> Result<(), Error> {
    debug_assert!(wk.index <= wk.last);
    let tree = wk.tree;
    wk.reset();
    let root = wk.start();

    // Erasing everything empties the tree outright. The old nodes die only
    // after the root store publishes their absence.
    if entry.is_null() && wk.index == 0 && wk.last == usize::MAX {
        tree.publish_root(Entry::NULL, 0);
        if root.is_node() {
            retire_subtree(tree, root.safe());
        }
        return Ok(());
    }

    if wk.is_none() {
        if entry.is_null() {
            return Ok(());
        }
        if wk.index == 0 && wk.last == 0 {
            tree.publish_root(entry, 0);
            return Ok(());
        }
        return root_expand(wk, entry, Entry::NULL);
    }

    if wk.is_root_entry() {
        if wk.index == 0 && wk.last == 0 {
            tree.publish_root(entry, 0);
            return Ok(());
        }
        if entry.is_null() {
            // The only occupied key is 0; an absent store either erases it
            // or changes nothing.
            if wk.index == 0 {
                tree.publish_root(Entry::NULL, 0);
            }
            return Ok(());
        }
        let keep = if wk.index == 0 { Entry::NULL } else { root };
        return root_expand(wk, entry, keep);
    }

    // Budget the worst case up front so the structural path never blocks on
    // the allocator while the tree is mid-rewrite.
    let request = 3 * (tree.height() + 2) + 1;
    if wk.prealloc(request).is_err() {
        wk.node_request = request;
        return Err(Error::OutOfMemory);
    }

    if entry.is_null() {
        extend_null(wk);
        // Widening can reveal that the store erases the last entry.
        if wk.index == 0 && wk.last == usize::MAX {
            tree.publish_root(Entry::NULL, 0);
            retire_subtree(tree, root.safe());
            return Ok(());
        }
    }

    wk.walk_to_leaf().expect("tree mutated under the writer lock");
    let (content, r_min, r_max) = wk.leaf_entry();

    if wk.last > wk.max {
        return spanning_store(wk, entry);
    }

    let ty = wk.typ();
    let node = wk.cur();

    if entry.is_null() {
        // Erase of an already-absent span is a no-op.
        let mut off = wk.offset;
        let all_null = loop {
            if !node.slot(ty, off).is_null() {
                break false;
            }
            if node.bound(ty, off, wk.end, wk.max) >= wk.last {
                break true;
            }
            off += 1;
        };
        if all_null {
            return Ok(());
        }
    }

    // Exact fit: replace one slot word in place. Absent neighbors cannot
    // occur here thanks to the normalization above.
    if r_min == wk.index && r_max == wk.last {
        node.set_slot(ty, wk.offset, entry);
        trace!(index = wk.index, last = wk.last, "exact slot store");
        leaf_gap_changed(wk);
        return Ok(());
    }

    if try_append(wk, entry, content, r_min, r_max) {
        trace!(index = wk.index, last = wk.last, "appended in place");
        leaf_gap_changed(wk);
        return Ok(());
    }

    let b = leaf_post_image(wk, entry);

    // Outside reader-visible mode a fitting image may rewrite the node in
    // place instead of republishing.
    if !tree.rcu_mode()
        && b.len <= ty.slots()
        && (b.len >= ty.min_slots() || node.is_root_node())
    {
        reuse_node(wk, &b);
        trace!(index = wk.index, last = wk.last, len = b.len, "rewrote node in place");
        leaf_gap_changed(wk);
        return Ok(());
    }

    let spot = Spot::of(wk);
    rebuild(wk, spot, spot, b)
}

/// Widens an absent store over the absent ranges bordering it, including
/// ones that live in neighboring leaves.
fn extend_null<T>(wk: &mut Walker<'_, T>) {
    let tree = wk.tree;
    while wk.index > 0 {
        let mut probe = Walker::new(tree, wk.index - 1, wk.index - 1);
        let (entry, r_min, _) = probe
            .load_entry()
            .expect("tree mutated under the writer lock");
        if !entry.is_null() {
            break;
        }
        wk.index = r_min;
    }
    while wk.last < usize::MAX {
        let mut probe = Walker::new(tree, wk.last + 1, wk.last + 1);
        let (entry, _, r_max) = probe
            .load_entry()
            .expect("tree mutated under the writer lock");
        if !entry.is_null() {
            break;
        }
        wk.last = r_max;
    }
}

/// First store into an empty or single-entry tree: build the first real
/// leaf. `keep` carries the previous direct root entry when it survives.
fn root_expand<T>(wk: &mut Walker<'_, T>, entry: Entry, keep: Entry) -> Result<(), Error> {
    let ty = NodeType::Leaf64;
    let mut b = BigNode::new(ty, 0);
    let mut covered = 0usize;
    if !keep.is_null() {
        b.push(keep, 0);
        covered = 1;
    }
    if wk.index > covered {
        b.push(Entry::NULL, wk.index - 1);
    }
    b.push(entry, wk.last);
    if wk.last < usize::MAX {
        b.push(Entry::NULL, usize::MAX);
    }
    plant_root(wk, &b)
}

/// Append fast path: the target begins inside the last live slot and ends
/// at the node bound, so the post-image only adds slots past the live end.
///
/// Write order makes this reader-safe: the slots and pivots beyond the live
/// end are invisible until the final store shrinks the old tail pivot.
fn try_append<T>(wk: &mut Walker<'_, T>, entry: Entry, content: Entry, r_min: usize, r_max: usize) -> bool {
    let ty = wk.typ();
    if ty == NodeType::Dense || wk.offset != wk.end {
        return false;
    }
    if wk.index <= r_min {
        // The old slot would need rewriting in place, which readers could
        // observe half-done.
        return false;
    }
    let tail = usize::from(r_max > wk.last);
    let new_end = wk.end + 1 + tail;
    if new_end >= ty.slots() {
        return false;
    }
    // Never leave two absent slots adjacent.
    if entry.is_null() && content.is_null() {
        return false;
    }

    let node = wk.cur();
    let end = wk.end;
    node.set_slot(ty, end + 1, entry);
    if tail == 1 {
        node.set_slot(ty, end + 2, content);
        node.set_pivot(ty, end + 1, wk.last);
    }
    if new_end < ty.slots() - 1 {
        node.set_meta_end(ty, new_end);
    }
    // Publication: everything beyond `end` becomes visible here.
    node.set_pivot(ty, end, wk.index - 1);
    wk.end = new_end;
    wk.offset = end + 1;
    true
}

/// Builds the post-image of the current leaf with `entry` stored over
/// `[index, last]`.
fn leaf_post_image<T>(wk: &Walker<'_, T>, entry: Entry) -> BigNode {
    let ty = wk.typ();
    let node = wk.cur();
    let mut b = BigNode::new(ty, wk.min);

    for off in 0..wk.offset {
        b.push(node.slot(ty, off), node.bound(ty, off, wk.end, wk.max));
    }
    let (r_min, _) = node.slot_range(ty, wk.offset, wk.end, wk.min, wk.max);
    if r_min < wk.index {
        b.push(node.slot(ty, wk.offset), wk.index - 1);
    }
    b.push(entry, wk.last);

    let mut off_end = wk.offset;
    while off_end < wk.end && node.bound(ty, off_end, wk.end, wk.max) < wk.last {
        off_end += 1;
    }
    let end_bound = node.bound(ty, off_end, wk.end, wk.max);
    if end_bound > wk.last {
        b.push(node.slot(ty, off_end), end_bound);
    }
    if off_end < wk.end {
        b.copy_node(node, ty, off_end + 1, wk.end, wk.end, wk.max);
    }
    b
}

/// Rewrites the current node from the staged image. Only legal outside
/// reader-visible mode.
fn reuse_node<T>(wk: &mut Walker<'_, T>, b: &BigNode) {
    let ty = wk.typ();
    let node = wk.cur();
    for j in 0..b.len {
        node.set_slot(ty, j, b.slot[j]);
        if j < b.len - 1 {
            node.set_pivot(ty, j, b.pivot[j]);
        }
    }
    for j in b.len.saturating_sub(1)..ty.pivots() {
        node.set_pivot(ty, j, 0);
    }
    for j in b.len..ty.slots() {
        node.set_slot(ty, j, Entry::NULL);
    }
    if b.len < ty.slots() {
        node.set_meta_end(ty, b.len - 1);
    }
    wk.end = b.len - 1;
}

/// Recomputes the leaf's largest absent run and pushes the change up the
/// gap index.
fn leaf_gap_changed<T>(wk: &Walker<'_, T>) {
    if !wk.tree.alloc_mode() {
        return;
    }
    let gap = leaf_max_gap(wk.cur(), wk.typ(), wk.end, wk.min, wk.max);
    update_gaps(wk.tree, wk.node, gap);
}

/// A store whose range crosses leaf boundaries: stage both edge leaves and
/// let the subtree engine rebuild everything in between.
fn spanning_store<T>(wk: &mut Walker<'_, T>, entry: Entry) -> Result<(), Error> {
    let tree = wk.tree;
    let mut r_wk = Walker::new(tree, wk.last, wk.last);
    r_wk.start();
    r_wk.walk_to_leaf().expect("tree mutated under the writer lock");
    r_wk.leaf_entry();

    let l = Spot::of(wk);
    let r = Spot::of(&r_wk);
    trace!(
        index = wk.index,
        last = wk.last,
        l_max = l.max,
        r_min = r.min,
        "spanning store"
    );

    let ty = wk.typ();
    let l_node = wk.cur();
    let mut b = BigNode::new(ty, l.min);
    for off in 0..wk.offset {
        b.push(l_node.slot(ty, off), l_node.bound(ty, off, l.end, l.max));
    }
    let (lr_min, _) = l_node.slot_range(ty, wk.offset, l.end, l.min, l.max);
    if lr_min < wk.index {
        b.push(l_node.slot(ty, wk.offset), wk.index - 1);
    }
    b.push(entry, wk.last);

    let r_ty = r_wk.typ();
    let r_node = r_wk.cur();
    let (_, rr_max) = r_node.slot_range(r_ty, r_wk.offset, r.end, r.min, r.max);
    if rr_max > wk.last {
        b.push(r_node.slot(r_ty, r_wk.offset), rr_max);
    }
    if r_wk.offset < r.end {
        b.copy_node(r_node, r_ty, r_wk.offset + 1, r.end, r.end, r.max);
    }

    rebuild(wk, l, r, b)
}
