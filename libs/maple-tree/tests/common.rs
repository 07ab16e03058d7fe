#![allow(unused)]

/// Builds an opaque, well-aligned test pointer from a small tag. The trees
/// under test never dereference stored values.
macro_rules! value {
    ($raw:expr) => {{ ::core::ptr::NonNull::new(((($raw) as usize) << 8) as *mut u8) }};
}
pub(crate) use value;
