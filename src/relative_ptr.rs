//! Position independent pointers into shared memory segments.
//!
//! A [`RelativePtr`] packs a segment id and an offset into a single `u64`:
//!
//! ```text
//!  63                                        16 15            0
//! ┌────────────────────────────────────────────┬───────────────┐
//! │ offset (48 bits)                           │ id (16 bits)  │
//! └────────────────────────────────────────────┴───────────────┘
//! ```
//!
//! All bits set is the logical null. The largest id and the largest offset
//! are reserved so that no valid pointer can alias the null value. Turning
//! a `RelativePtr` into a local address is the job of
//! [`SegmentRegistry`](crate::segment::SegmentRegistry).

use std::fmt;

use crate::config::{OFFSET_BITS, SEGMENT_ID_BITS};

pub type SegmentId = u16;

pub const ID_RANGE: u64 = (1u64 << SEGMENT_ID_BITS) - 1;
pub const OFFSET_RANGE: u64 = (1u64 << OFFSET_BITS) - 1;

pub const NULL_POINTER_ID: SegmentId = ID_RANGE as SegmentId;
pub const NULL_POINTER_OFFSET: u64 = OFFSET_RANGE;

pub const MAX_VALID_ID: SegmentId = NULL_POINTER_ID - 1;
pub const MAX_VALID_OFFSET: u64 = NULL_POINTER_OFFSET - 1;

const LOGICAL_NULL: u64 = u64::MAX;

const _: () = assert!(SEGMENT_ID_BITS == SegmentId::BITS);

#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelativePtr(u64);

impl RelativePtr {
    pub const NULL: RelativePtr = RelativePtr(LOGICAL_NULL);

    /// # Panics
    ///
    /// Panics if `id` or `offset` do not fit their bit ranges.
    pub fn new(id: SegmentId, offset: u64) -> Self {
        match Self::try_new(id, offset) {
            Some(ptr) => ptr,
            None => panic!(
                "relative pointer out of range: id {id} (max {MAX_VALID_ID}), \
                 offset {offset:#x} (max {MAX_VALID_OFFSET:#x})"
            ),
        }
    }

    pub fn try_new(id: SegmentId, offset: u64) -> Option<Self> {
        if id > MAX_VALID_ID || offset > MAX_VALID_OFFSET {
            return None;
        }
        Some(Self(u64::from(id) | (offset << SEGMENT_ID_BITS)))
    }

    /// Reinterprets a raw word, e.g. one read back from a queue slot.
    /// Any bit pattern is accepted; resolution decides whether it points
    /// anywhere useful.
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn to_bits(self) -> u64 {
        self.0
    }

    pub const fn id(self) -> SegmentId {
        (self.0 & ID_RANGE) as SegmentId
    }

    pub const fn offset(self) -> u64 {
        self.0 >> SEGMENT_ID_BITS
    }

    pub const fn is_logical_null(self) -> bool {
        self.0 == LOGICAL_NULL
    }

    pub fn reset(&mut self) {
        self.0 = LOGICAL_NULL;
    }
}

impl Default for RelativePtr {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Debug for RelativePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_logical_null() {
            return f.write_str("RelativePtr(null)");
        }
        f.debug_struct("RelativePtr")
            .field("id", &self.id())
            .field("offset", &format_args!("{:#x}", self.offset()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_id_low_and_offset_high() {
        let ptr = RelativePtr::new(3, 0x1000);
        assert_eq!(ptr.id(), 3);
        assert_eq!(ptr.offset(), 0x1000);
        assert_eq!(ptr.to_bits(), 3 | (0x1000 << 16));
        assert!(!ptr.is_logical_null());
    }

    #[test]
    fn largest_valid_values_are_not_null() {
        let ptr = RelativePtr::new(MAX_VALID_ID, MAX_VALID_OFFSET);
        assert!(!ptr.is_logical_null());
        assert_eq!(ptr.id(), MAX_VALID_ID);
        assert_eq!(ptr.offset(), MAX_VALID_OFFSET);
    }

    #[test]
    fn default_and_reset_are_null() {
        assert!(RelativePtr::default().is_logical_null());
        let mut ptr = RelativePtr::new(0, 0);
        ptr.reset();
        assert!(ptr.is_logical_null());
        assert_eq!(ptr.id(), NULL_POINTER_ID);
        assert_eq!(ptr.offset(), NULL_POINTER_OFFSET);
    }

    #[test]
    fn try_new_rejects_reserved_values() {
        assert!(RelativePtr::try_new(NULL_POINTER_ID, 0).is_none());
        assert!(RelativePtr::try_new(0, NULL_POINTER_OFFSET).is_none());
        assert!(RelativePtr::try_new(0, 1 << 50).is_none());
    }

    #[test]
    #[should_panic(expected = "relative pointer out of range")]
    fn new_panics_on_offset_overflow() {
        let _ = RelativePtr::new(1, OFFSET_RANGE + 1);
    }

    #[test]
    #[should_panic(expected = "relative pointer out of range")]
    fn new_panics_on_reserved_id() {
        let _ = RelativePtr::new(NULL_POINTER_ID, 8);
    }
}
