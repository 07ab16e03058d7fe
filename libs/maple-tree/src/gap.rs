//! Gap tracking and empty-area search.
//!
//! In allocation mode every internal slot carries the size of the largest
//! absent run anywhere in its subtree. The index is maintained lazily: a
//! write that changes a leaf's largest gap walks up through the parent
//! links, rewriting one gap word per level, and stops at the first ancestor
//! whose own maximum does not change.
//!
//! The searches descend guided by those gaps: a subtree whose recorded gap
//! is smaller than the request cannot contain a fit and is skipped whole.
//! All of this runs under the writer lock; readers never consult gaps.

use tracing::trace;

use crate::entry::Entry;
use crate::node::{Node, NodeType, node_ref};
use crate::walk::Walker;
use crate::{Error, MapleTree};

/// Largest absent run inside a leaf spanning `[min, max]` whose last live
/// slot is `end`.
pub(crate) fn leaf_max_gap(node: &Node, ty: NodeType, end: usize, min: usize, max: usize) -> usize {
    debug_assert!(ty.is_leaf());
    if ty == NodeType::Dense {
        let mut best = 0usize;
        let mut run = 0usize;
        for offset in 0..=end {
            if node.slot(ty, offset).is_null() {
                run += 1;
                best = best.max(run);
            } else {
                run = 0;
            }
        }
        return best;
    }

    let mut best = 0usize;
    let mut run_start: Option<usize> = None;
    for offset in 0..=end {
        let (r_min, r_max) = node.slot_range(ty, offset, end, min, max);
        if node.slot(ty, offset).is_null() {
            let start = *run_start.get_or_insert(r_min);
            best = best.max((r_max - start).saturating_add(1));
        } else {
            run_start = None;
        }
    }
    best
}

/// Largest absent run in the subtree under `child`, which spans
/// `[min, max]`.
pub(crate) fn child_max_gap(child: Entry, min: usize, max: usize) -> usize {
    // Safety: called under the writer lock on entries reachable from the
    // tree or from an unpublished replacement subtree; both stay allocated.
    let node = unsafe { node_ref(child) };
    let ty = child.node_type();
    if ty.is_leaf() {
        let end = if ty == NodeType::Dense {
            (max - min).min(ty.slots() - 1)
        } else {
            node.data_end(ty, max)
        };
        leaf_max_gap(node, ty, end, min, max)
    } else {
        node.max_gap(ty)
    }
}

/// Propagates a changed subtree gap from `entry` (whose largest gap is now
/// `new_gap`) up towards the root, stopping at the first ancestor whose own
/// maximum is unaffected.
pub(crate) fn update_gaps<T>(tree: &MapleTree<T>, mut entry: Entry, mut new_gap: usize) {
    if !tree.alloc_mode() {
        return;
    }
    loop {
        // Safety: writer lock held; the chain of parent links is stable.
        let node = unsafe { node_ref(entry) };
        let Some(p_ptr) = node.parent_node() else {
            return;
        };
        let p_ty = node.parent_type(true);
        let slot = node.parent_slot();
        // Safety: parent links of live nodes reference live nodes.
        let parent = unsafe { p_ptr.as_ref() };
        if parent.gap(p_ty, slot) == new_gap {
            return;
        }
        let old_max = parent.max_gap(p_ty);
        parent.set_gap(p_ty, slot, new_gap);
        let p_max = parent.max_gap(p_ty);
        if p_max == old_max {
            return;
        }
        entry = Entry::mk_node(p_ptr, p_ty);
        new_gap = p_max;
    }
}

/// Lowest index where an absent run of `size` keys fits inside
/// `[min, max]`.
pub(crate) fn empty_area<T>(
    wk: &mut Walker<'_, T>,
    min: usize,
    max: usize,
    size: usize,
) -> Result<usize, Error> {
    debug_assert!(size > 0 && min <= max);
    if (max - min).saturating_add(1) < size {
        return Err(Error::Busy);
    }

    wk.reset();
    wk.index = min;
    wk.last = max;
    wk.start();
    if wk.is_none() {
        return Ok(min);
    }
    if wk.is_root_entry() {
        // Only [0, 0] is occupied.
        let lo = min.max(1);
        return fit_forward(lo, max, size).ok_or(Error::Busy);
    }

    let mut offset = 0;
    loop {
        let ty = wk.typ();
        let node = wk.cur();
        if ty.is_leaf() {
            for off in offset..=wk.end {
                let (r_min, r_max) = node.slot_range(ty, off, wk.end, wk.min, wk.max);
                if r_min > max {
                    return Err(Error::Busy);
                }
                if node.slot(ty, off).is_null()
                    && let Some(index) = fit_forward(r_min.max(min), r_max.min(max), size)
                {
                    trace!(index, size, "forward gap search hit");
                    return Ok(index);
                }
            }
        } else {
            let mut descend = None;
            for off in offset..=wk.end {
                let (r_min, r_max) = node.slot_range(ty, off, wk.end, wk.min, wk.max);
                if r_min > max {
                    return Err(Error::Busy);
                }
                if r_max >= min && node.gap(ty, off) >= size {
                    descend = Some(off);
                    break;
                }
            }
            if let Some(off) = descend {
                wk.descend_at(off)
                    .expect("tree mutated under the writer lock");
                offset = 0;
                continue;
            }
        }

        // This node is exhausted; resume at the next sibling subtree.
        loop {
            if wk.cur().is_root_node() {
                return Err(Error::Busy);
            }
            wk.ascend().expect("tree mutated under the writer lock");
            if wk.offset < wk.end {
                offset = wk.offset + 1;
                break;
            }
        }
    }
}

/// Highest index where an absent run of `size` keys fits inside
/// `[min, max]`.
pub(crate) fn empty_area_rev<T>(
    wk: &mut Walker<'_, T>,
    min: usize,
    max: usize,
    size: usize,
) -> Result<usize, Error> {
    debug_assert!(size > 0 && min <= max);
    if (max - min).saturating_add(1) < size {
        return Err(Error::Busy);
    }

    wk.reset();
    wk.index = min;
    wk.last = max;
    wk.start();
    if wk.is_none() {
        return Ok(max - size + 1);
    }
    if wk.is_root_entry() {
        let lo = min.max(1);
        return fit_reverse(lo, max, size).ok_or(Error::Busy);
    }

    let mut offset = None::<usize>;
    loop {
        let ty = wk.typ();
        let node = wk.cur();
        let start = offset.unwrap_or(wk.end);
        if ty.is_leaf() {
            let mut off = start;
            loop {
                let (r_min, r_max) = node.slot_range(ty, off, wk.end, wk.min, wk.max);
                if r_max < min {
                    return Err(Error::Busy);
                }
                if node.slot(ty, off).is_null()
                    && let Some(index) = fit_reverse(r_min.max(min), r_max.min(max), size)
                {
                    trace!(index, size, "reverse gap search hit");
                    return Ok(index);
                }
                if off == 0 {
                    break;
                }
                off -= 1;
            }
        } else {
            let mut descend = None;
            let mut off = start;
            loop {
                let (r_min, r_max) = node.slot_range(ty, off, wk.end, wk.min, wk.max);
                if r_max < min {
                    return Err(Error::Busy);
                }
                if r_min <= max && node.gap(ty, off) >= size {
                    descend = Some(off);
                    break;
                }
                if off == 0 {
                    break;
                }
                off -= 1;
            }
            if let Some(off) = descend {
                wk.descend_at(off)
                    .expect("tree mutated under the writer lock");
                offset = None;
                continue;
            }
        }

        loop {
            if wk.cur().is_root_node() {
                return Err(Error::Busy);
            }
            wk.ascend().expect("tree mutated under the writer lock");
            if wk.offset > 0 {
                offset = Some(wk.offset - 1);
                break;
            }
        }
    }
}

/// Lowest start of a `size`-wide run inside the absent span `[lo, hi]`.
fn fit_forward(lo: usize, hi: usize, size: usize) -> Option<usize> {
    if hi >= lo && (hi - lo).saturating_add(1) >= size {
        Some(lo)
    } else {
        None
    }
}

/// Highest start of a `size`-wide run inside the absent span `[lo, hi]`.
fn fit_reverse(lo: usize, hi: usize, size: usize) -> Option<usize> {
    if hi >= lo && (hi - lo).saturating_add(1) >= size {
        Some(hi - size + 1)
    } else {
        None
    }
}
