//! Iteration: in-order traversal at the intra-node and inter-node level,
//! plus the public cursor and iterator types.
//!
//! Inter-node advance works through parent back-references: ascend while the
//! current node is exhausted, step to the next sibling slot, then descend
//! along the edge to the next leaf. Every hop re-checks for dead nodes; a
//! reader that trips over a concurrent replacement restarts past the last
//! range it yielded.

use core::iter::FusedIterator;
use core::ops::RangeInclusive;
use core::ptr::NonNull;

use crate::entry::Entry;
use crate::node::NodeType;
use crate::walk::{Retry, Walker};

impl<T> Walker<'_, T> {
    /// Content and semantic range of the slot at `offset` of the current
    /// leaf, with a liveness re-check.
    pub(crate) fn entry_at(&self, offset: usize) -> Result<(Entry, usize, usize), Retry> {
        let ty = self.typ();
        let node = self.cur();
        let (entry, r_min, r_max) = if ty == NodeType::Dense {
            let at = self.min + offset;
            (node.slot(ty, offset), at, at)
        } else {
            let (r_min, r_max) = node.slot_range(ty, offset, self.end, self.min, self.max);
            (node.slot(ty, offset), r_min, r_max)
        };
        // Safety: standing on a node entry.
        if node.is_dead(unsafe { self.node.node_ptr() }) {
            return Err(Retry);
        }
        Ok((entry, r_min, r_max))
    }

    /// Moves to the first slot of the next leaf. Returns `false` (and parks
    /// the walker on `NONE`) when the current leaf is the last one.
    fn next_node(&mut self) -> Result<bool, Retry> {
        loop {
            if self.cur().is_root_node() {
                self.node = Entry::NONE;
                return Ok(false);
            }
            self.ascend()?;
            if self.offset < self.end {
                break;
            }
        }
        let offset = self.offset + 1;
        self.descend_at(offset)?;
        while !self.typ().is_leaf() {
            self.descend_at(0)?;
        }
        self.offset = 0;
        Ok(true)
    }

    /// Moves to the last slot of the previous leaf. Returns `false` (and
    /// parks the walker on `NONE`) when the current leaf is the first one.
    fn prev_node(&mut self) -> Result<bool, Retry> {
        loop {
            if self.cur().is_root_node() {
                self.node = Entry::NONE;
                return Ok(false);
            }
            self.ascend()?;
            if self.offset > 0 {
                break;
            }
        }
        let offset = self.offset - 1;
        self.descend_at(offset)?;
        while !self.typ().is_leaf() {
            self.descend_at(self.end)?;
        }
        self.offset = self.end;
        Ok(true)
    }

    /// Advances to the next live entry whose range starts at or below
    /// `bound`. On success the walker's `[index, last]` becomes the entry's
    /// range.
    ///
    /// When the next entry starts past `bound` the walker parks itself in
    /// the paused state just before it, so a later call with a wider bound
    /// re-examines that entry instead of skipping it.
    pub(crate) fn next_entry(&mut self, bound: usize) -> Result<Option<Entry>, Retry> {
        debug_assert!(self.is_active() && self.typ().is_leaf());
        loop {
            if self.offset + 1 > self.end {
                if self.max >= bound {
                    return Ok(None);
                }
                if !self.next_node()? {
                    return Ok(None);
                }
            } else {
                self.offset += 1;
            }
            let (entry, r_min, r_max) = self.entry_at(self.offset)?;
            if r_min > bound {
                self.node = Entry::PAUSE;
                self.last = r_min - 1;
                return Ok(None);
            }
            if !entry.is_null() {
                self.index = r_min;
                self.last = r_max;
                return Ok(Some(entry));
            }
        }
    }

    /// Mirror of [`Walker::next_entry`]: steps to the previous live entry
    /// whose range ends at or above `bound`.
    pub(crate) fn prev_entry(&mut self, bound: usize) -> Result<Option<Entry>, Retry> {
        debug_assert!(self.is_active() && self.typ().is_leaf());
        loop {
            if self.offset == 0 {
                if self.min <= bound {
                    return Ok(None);
                }
                if !self.prev_node()? {
                    return Ok(None);
                }
            } else {
                self.offset -= 1;
            }
            let (entry, r_min, r_max) = self.entry_at(self.offset)?;
            if r_max < bound {
                self.node = Entry::PAUSE;
                self.index = r_max + 1;
                return Ok(None);
            }
            if !entry.is_null() {
                self.index = r_min;
                self.last = r_max;
                return Ok(Some(entry));
            }
        }
    }

    /// Finds the first live entry in `[self.index, max]`: the entry covering
    /// `index` if there is one, otherwise the next one up to `max`.
    pub(crate) fn find_next(&mut self, max: usize) -> Result<Option<Entry>, Retry> {
        if self.is_paused() {
            if self.last == usize::MAX {
                self.node = Entry::NONE;
                return Ok(None);
            }
            self.index = self.last + 1;
            self.reset();
        }
        if self.is_root_entry() || self.is_none() {
            // A previous call exhausted the tree (or found only the direct
            // root entry, which a walk visits exactly once).
            self.node = Entry::NONE;
            return Ok(None);
        }
        if self.index > max {
            return Ok(None);
        }
        if self.is_start() {
            let (entry, r_min, r_max) = self.load_entry()?;
            if self.is_none() {
                return Ok(None);
            }
            if self.is_root_entry() {
                return if self.index == 0 && !entry.is_null() {
                    self.index = 0;
                    self.last = 0;
                    Ok(Some(entry))
                } else {
                    self.node = Entry::NONE;
                    Ok(None)
                };
            }
            if r_min > max {
                self.node = Entry::PAUSE;
                self.last = r_min - 1;
                return Ok(None);
            }
            if !entry.is_null() {
                self.index = r_min;
                self.last = r_max;
                return Ok(Some(entry));
            }
        }
        self.next_entry(max)
    }

    /// Finds the last live entry in `[min, self.index]`: the entry covering
    /// `index` if there is one, otherwise the previous one down to `min`.
    pub(crate) fn find_prev(&mut self, min: usize) -> Result<Option<Entry>, Retry> {
        if self.is_paused() {
            if self.index == 0 {
                self.node = Entry::NONE;
                return Ok(None);
            }
            let target = self.index - 1;
            self.index = target;
            self.last = target;
            self.reset();
        }
        if self.is_root_entry() || self.is_none() {
            self.node = Entry::NONE;
            return Ok(None);
        }
        if self.index < min {
            return Ok(None);
        }
        if self.is_start() {
            let (entry, r_min, r_max) = self.load_entry()?;
            if self.is_none() {
                return Ok(None);
            }
            if self.is_root_entry() {
                // The direct root entry covers [0, 0], which satisfies any
                // lower bound; searches that started past it step back to it.
                self.index = 0;
                self.last = 0;
                return Ok(Some(self.tree.root_entry()));
            }
            if r_max < min {
                self.node = Entry::PAUSE;
                self.index = r_max + 1;
                return Ok(None);
            }
            if !entry.is_null() {
                self.index = r_min;
                self.last = r_max;
                return Ok(Some(entry));
            }
        }
        self.prev_entry(min)
    }
}

/// A re-positionable reader over the entries of a tree.
///
/// A cursor survives concurrent replacement of the subtree it stands on: it
/// restarts past the last range it yielded. [`Cursor::pause`] parks it
/// explicitly so it can be kept across batches of work; the next call
/// re-enters the tree one key past the last result.
pub struct Cursor<'t, T> {
    walker: Walker<'t, T>,
    origin: usize,
    yielded_max: Option<usize>,
    yielded_min: Option<usize>,
}

impl<'t, T> Cursor<'t, T> {
    pub(crate) fn new(walker: Walker<'t, T>) -> Self {
        let origin = walker.index;
        Self {
            walker,
            origin,
            yielded_max: None,
            yielded_min: None,
        }
    }

    /// Low key of the last range yielded.
    #[inline]
    pub fn index(&self) -> usize {
        self.walker.index
    }

    /// High key of the last range yielded.
    #[inline]
    pub fn last(&self) -> usize {
        self.walker.last
    }

    /// Returns the next entry at or after the cursor position, bounded by
    /// `max`.
    pub fn find_next(&mut self, max: usize) -> Option<(RangeInclusive<usize>, NonNull<T>)> {
        loop {
            match self.walker.find_next(max) {
                Ok(Some(entry)) => {
                    self.yielded_max = Some(self.walker.last);
                    let range = self.walker.index..=self.walker.last;
                    return Some((range, entry.value().expect("live entries are non-null")));
                }
                Ok(None) => return None,
                Err(Retry) => {
                    let resume = match self.yielded_max {
                        Some(usize::MAX) => return None,
                        Some(done) => done + 1,
                        None => self.origin,
                    };
                    self.walker.index = resume;
                    self.walker.last = resume;
                    self.walker.reset();
                }
            }
        }
    }

    /// Returns the previous entry at or before the cursor position, bounded
    /// below by `min`.
    pub fn find_prev(&mut self, min: usize) -> Option<(RangeInclusive<usize>, NonNull<T>)> {
        loop {
            match self.walker.find_prev(min) {
                Ok(Some(entry)) => {
                    self.yielded_min = Some(self.walker.index);
                    let range = self.walker.index..=self.walker.last;
                    return Some((range, entry.value().expect("live entries are non-null")));
                }
                Ok(None) => return None,
                Err(Retry) => {
                    let resume = match self.yielded_min {
                        Some(0) => return None,
                        Some(done) => done - 1,
                        None => self.origin,
                    };
                    self.walker.index = resume;
                    self.walker.last = resume;
                    self.walker.reset();
                }
            }
        }
    }

    /// Saves the position and lets go of the tree structure. The next search
    /// re-enters one key past the last yielded range.
    pub fn pause(&mut self) {
        self.walker.node = Entry::PAUSE;
    }
}

/// Iterator over `(range, value)` pairs in ascending key order.
///
/// This type is returned by [`MapleTree::iter`](crate::MapleTree::iter) and
/// [`MapleTree::range`](crate::MapleTree::range).
pub struct Iter<'t, T> {
    cursor: Cursor<'t, T>,
    max: usize,
}

impl<'t, T> Iter<'t, T> {
    pub(crate) fn new(cursor: Cursor<'t, T>, max: usize) -> Self {
        Self { cursor, max }
    }
}

impl<T> Iterator for Iter<'_, T> {
    type Item = (RangeInclusive<usize>, NonNull<T>);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.cursor.find_next(self.max)
    }
}

impl<T> FusedIterator for Iter<'_, T> {}
