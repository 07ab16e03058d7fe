//! Encoded slot words.
//!
//! Every word stored in a tree slot (and the root word of the tree handle) is
//! an [`Entry`]. The low two bits discriminate the encoding:
//!
//! - `..00` / `..x1` — an opaque caller value. The tree never interprets it
//!   beyond the reserved-range check below. The all-zero word is the absent
//!   value.
//! - `..10` — an internal word. Internal words below [`RESERVED_RANGE`] are
//!   sentinels owned by the tree (walker states, encoded errors); internal
//!   words at or above it are encoded node pointers.
//!
//! Encoded node pointers carry the node's layout in bits 3-6 and a root
//! marker in bit 2; node addresses are 256-byte aligned so the low byte is
//! always recoverable.
//!
//! Walker state sentinels (`START`, `ROOT`, `NONE`, `PAUSE`) use the `..01`
//! pattern so they can never be confused with a node pointer. They only ever
//! appear in a walker's node word, never in a slot.

use core::fmt;
use core::ptr::NonNull;

use crate::Error;
use crate::node::{Node, NodeType};

/// Values below this that carry the internal bit pattern are sentinels and
/// may never be stored by callers.
pub(crate) const RESERVED_RANGE: usize = 4096;

const INTERNAL_BITS: usize = 0b10;
const INTERNAL_MASK: usize = 0b11;

/// Mask covering all tag bits of an encoded node pointer.
pub(crate) const NODE_MASK: usize = 255;

const NODE_TYPE_SHIFT: usize = 3;
const NODE_TYPE_MASK: usize = 0xF;
const NODE_ROOT: usize = 0x04;

/// One slot word. See the module docs for the encoding.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Entry(pub(crate) usize);

impl Entry {
    /// The absent value.
    pub(crate) const NULL: Self = Self(0);

    /// Walker has not yet descended from the root.
    pub(crate) const START: Self = Self(0x01);
    /// The tree root holds a single direct entry, not a node.
    pub(crate) const ROOT: Self = Self(0x05);
    /// The walk finished without finding a node to stand on.
    pub(crate) const NONE: Self = Self(0x09);
    /// Iteration was paused; the walk re-enters at `last + 1`.
    pub(crate) const PAUSE: Self = Self(0x11);

    #[inline]
    pub(crate) const fn mk_internal(v: usize) -> Self {
        Self((v << 2) | INTERNAL_BITS)
    }

    #[inline]
    pub(crate) const fn is_internal(self) -> bool {
        self.0 & INTERNAL_MASK == INTERNAL_BITS
    }

    #[inline]
    pub(crate) const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` for caller words the tree refuses to store: anything
    /// carrying the internal bit pattern collides with a sentinel (below
    /// [`RESERVED_RANGE`]) or with an encoded node pointer (above it).
    #[inline]
    pub(crate) const fn is_reserved(self) -> bool {
        self.0 & INTERNAL_MASK == INTERNAL_BITS
    }

    /// Returns `true` if this word is one of the walker state sentinels.
    #[inline]
    pub(crate) const fn is_state(self) -> bool {
        self.0 & INTERNAL_MASK == 0b01 && self.0 < RESERVED_RANGE
    }

    // === encoded node pointers ===

    #[inline]
    pub(crate) fn mk_node(node: NonNull<Node>, ty: NodeType) -> Self {
        let addr = node.as_ptr() as usize;
        debug_assert_eq!(addr & NODE_MASK, 0);
        Self(addr | ((ty as usize) << NODE_TYPE_SHIFT) | INTERNAL_BITS)
    }

    #[inline]
    pub(crate) const fn is_node(self) -> bool {
        self.is_internal() && self.0 >= RESERVED_RANGE
    }

    /// Recovers the node address from an encoded node pointer.
    ///
    /// # Safety
    ///
    /// `self` must satisfy [`Entry::is_node`].
    #[inline]
    pub(crate) unsafe fn node_ptr(self) -> NonNull<Node> {
        debug_assert!(self.is_node());
        // Safety: node entries are built from non-null 256-byte aligned
        // addresses, so masking the tag byte yields the original pointer.
        unsafe { NonNull::new_unchecked((self.0 & !NODE_MASK) as *mut Node) }
    }

    #[inline]
    pub(crate) const fn node_type(self) -> NodeType {
        NodeType::from_bits((self.0 >> NODE_TYPE_SHIFT) & NODE_TYPE_MASK)
    }

    /// Marks an encoded node pointer as the tree root.
    #[inline]
    pub(crate) const fn mk_root(self) -> Self {
        Self(self.0 | NODE_ROOT)
    }

    #[inline]
    pub(crate) const fn is_root(self) -> bool {
        self.0 & NODE_ROOT != 0
    }

    /// Strips the root marker so the word compares equal to the entry stored
    /// in a parent slot.
    #[inline]
    pub(crate) const fn safe(self) -> Self {
        Self(self.0 & !NODE_ROOT)
    }

    // === encoded errors ===

    #[inline]
    pub(crate) const fn mk_err(err: Error) -> Self {
        Self::mk_internal(err.code())
    }

    #[inline]
    pub(crate) const fn as_err(self) -> Option<Error> {
        if self.is_internal() && self.0 < RESERVED_RANGE {
            Error::from_code(self.0 >> 2)
        } else {
            None
        }
    }

    // === caller values ===

    /// Encodes a caller value, rejecting words that collide with the internal
    /// encoding.
    #[inline]
    pub(crate) fn from_value<T>(value: Option<NonNull<T>>) -> Result<Self, Error> {
        let entry = match value {
            Some(ptr) => Self(ptr.as_ptr() as usize),
            None => Self::NULL,
        };
        if entry.is_reserved() {
            return Err(Error::InvalidArgument);
        }
        Ok(entry)
    }

    /// Decodes a leaf slot back into the caller's pointer.
    #[inline]
    pub(crate) fn value<T>(self) -> Option<NonNull<T>> {
        debug_assert!(!self.is_node());
        NonNull::new(self.0 as *mut T)
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("Entry::NULL")
        } else if *self == Self::START {
            f.write_str("Entry::START")
        } else if *self == Self::ROOT {
            f.write_str("Entry::ROOT")
        } else if *self == Self::NONE {
            f.write_str("Entry::NONE")
        } else if *self == Self::PAUSE {
            f.write_str("Entry::PAUSE")
        } else if let Some(err) = self.as_err() {
            write!(f, "Entry::Err({err:?})")
        } else if self.is_node() {
            write!(
                f,
                "Entry::Node({:#x}, {:?}{})",
                self.0 & !NODE_MASK,
                self.node_type(),
                if self.is_root() { ", root" } else { "" }
            )
        } else {
            write!(f, "Entry::Value({:#x})", self.0)
        }
    }
}
