//! One-word, shared-memory safe form of a chunk group handle.
//!
//! A [`PortableChunkGroup`] is what travels through shared queues. It is a
//! plain `Copy` value the size of a `u64` and aligned to its size, so a slot
//! holding one is always written and read in a single access. Copying it
//! never touches the reference counter; only the explicit conversions to and
//! from [`SharedChunkGroup`] do.
//!
//! A process can die halfway through writing a slot with non-atomic
//! stores. Whatever bit pattern is left behind still decodes: either to the
//! logical null or to a pointer the registry refuses to resolve if it is out
//! of range.

use std::mem::{align_of, needs_drop, size_of};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::chunk::{ChunkHeader, ChunkRecord};
use crate::chunk_group::ChunkGroup;
use crate::relative_ptr::RelativePtr;
use crate::segment::SegmentRegistry;
use crate::shared::SharedChunkGroup;

#[repr(C, align(8))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PortableChunkGroup {
    group: RelativePtr,
}

const fn assert_copy<T: Copy>() {}

const _: () = assert!(
    size_of::<PortableChunkGroup>() <= size_of::<u64>(),
    "a portable chunk group must fit one machine word"
);
const _: () = assert!(
    size_of::<PortableChunkGroup>() == align_of::<PortableChunkGroup>(),
    "a portable chunk group must never straddle its natural alignment"
);
const _: () = assert!(!needs_drop::<PortableChunkGroup>());
const _: () = assert_copy::<PortableChunkGroup>();

impl PortableChunkGroup {
    pub const NULL: PortableChunkGroup = PortableChunkGroup {
        group: RelativePtr::NULL,
    };

    /// Encodes `group` without touching its counter.
    ///
    /// # Panics
    ///
    /// Panics if `group` is not inside a segment registered in `registry`.
    pub fn from_descriptor(registry: &SegmentRegistry, group: NonNull<ChunkGroup>) -> Self {
        match registry.to_relative(group.as_ptr()) {
            Some(group) => Self { group },
            None => panic!(
                "chunk group {:p} is outside every registered segment",
                group.as_ptr()
            ),
        }
    }

    /// Moves the handle's reference into portable form. The counter is not
    /// changed; [`release_to_shared`](Self::release_to_shared) is the inverse.
    pub fn from_shared(mut shared: SharedChunkGroup) -> Self {
        let Some(registry) = shared.registry().cloned() else {
            return Self::NULL;
        };
        match shared.release() {
            Some(group) => Self::from_descriptor(&registry, group),
            None => Self::NULL,
        }
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self {
            group: RelativePtr::from_bits(bits),
        }
    }

    pub const fn to_bits(self) -> u64 {
        self.group.to_bits()
    }

    pub fn relative_ptr(&self) -> RelativePtr {
        self.group
    }

    pub fn is_logical_null(&self) -> bool {
        self.group.is_logical_null()
    }

    /// The descriptor this value points at, if it resolves.
    pub fn group(&self, registry: &SegmentRegistry) -> Option<NonNull<ChunkGroup>> {
        registry.resolve::<ChunkGroup>(self.group)
    }

    /// Like [`group`](Self::group), but only for a descriptor its group
    /// pool currently has handed out.
    fn live_group(&self, registry: &SegmentRegistry) -> Option<NonNull<ChunkGroup>> {
        let group = self.group(registry)?;
        // SAFETY: resolve checked bounds and alignment for a ChunkGroup.
        unsafe { ChunkGroup::is_live(group, registry) }.then_some(group)
    }

    /// Turns the carried reference back into a handle without incrementing,
    /// and resets `self` to null.
    pub fn release_to_shared(&mut self, registry: &Arc<SegmentRegistry>) -> SharedChunkGroup {
        if self.is_logical_null() {
            return SharedChunkGroup::default();
        }
        let ptr = self.group;
        self.group.reset();
        match (Self { group: ptr }).live_group(registry) {
            // SAFETY: the reference carried by this value moves into the handle.
            Some(group) => unsafe { SharedChunkGroup::from_raw(Arc::clone(registry), group) },
            None => {
                log::error!("dropping chunk group {ptr:?}: not a live descriptor");
                SharedChunkGroup::default()
            }
        }
    }

    /// A new handle with its own reference; `self` is left as is.
    pub fn clone_to_shared(&self, registry: &Arc<SegmentRegistry>) -> SharedChunkGroup {
        let Some(group) = self.live_group(registry) else {
            return SharedChunkGroup::default();
        };
        // SAFETY: a non-null portable value stands for a live reference, so
        // the group is alive while we take another one.
        unsafe {
            group.as_ref().increment_ref();
            SharedChunkGroup::from_raw(Arc::clone(registry), group)
        }
    }

    /// `true` if the group's counter is 1 at the moment of the call. Racy;
    /// `false` for null.
    pub fn has_no_other_owners(&self, registry: &SegmentRegistry) -> bool {
        self.live_group(registry)
            .is_some_and(|group| unsafe { group.as_ref() }.ref_count() == 1)
    }

    pub fn add_record(&self, registry: &SegmentRegistry, record: ChunkRecord) -> bool {
        self.live_group(registry)
            .is_some_and(|group| unsafe { group.as_ref() }.add_record(record))
    }

    pub fn chunk_header(&self, registry: &SegmentRegistry) -> Option<NonNull<ChunkHeader>> {
        let group = self.live_group(registry)?;
        unsafe { group.as_ref() }
            .first_record()?
            .header_ptr(registry)
    }

    pub fn chunk_headers(&self, registry: &SegmentRegistry) -> Vec<NonNull<ChunkHeader>> {
        let Some(group) = self.live_group(registry) else {
            return Vec::new();
        };
        unsafe { group.as_ref() }
            .records()
            .filter_map(|record| record.header_ptr(registry))
            .collect()
    }
}

impl From<SharedChunkGroup> for PortableChunkGroup {
    fn from(shared: SharedChunkGroup) -> Self {
        Self::from_shared(shared)
    }
}

/// A queue slot holding a [`PortableChunkGroup`] as one atomic word.
#[repr(transparent)]
#[derive(Debug)]
pub struct ChunkGroupSlot(AtomicU64);

impl ChunkGroupSlot {
    pub const fn new() -> Self {
        Self(AtomicU64::new(PortableChunkGroup::NULL.to_bits()))
    }

    pub fn load(&self) -> PortableChunkGroup {
        PortableChunkGroup::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, group: PortableChunkGroup) {
        self.0.store(group.to_bits(), Ordering::Release);
    }

    /// Empties the slot, returning what it held.
    pub fn take(&self) -> PortableChunkGroup {
        PortableChunkGroup::from_bits(
            self.0
                .swap(PortableChunkGroup::NULL.to_bits(), Ordering::AcqRel),
        )
    }
}

impl Default for ChunkGroupSlot {
    fn default() -> Self {
        Self::new()
    }
}
