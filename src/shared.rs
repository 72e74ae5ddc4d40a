//! Process-local owning handle to a chunk group.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::chunk::{ChunkHeader, ChunkRecord};
use crate::chunk_group::ChunkGroup;
use crate::segment::SegmentRegistry;

struct Holding {
    registry: Arc<SegmentRegistry>,
    group: NonNull<ChunkGroup>,
}

/// Owns one reference to a [`ChunkGroup`].
///
/// Cloning takes another reference, dropping gives one back, and the drop
/// that takes the counter to zero frees every chunk of the group and then the
/// descriptor. Moving a handle (including `std::mem::take`) transfers the
/// reference without touching the counter.
///
/// A handle may be sent to another thread but not shared: a thread that
/// needs the group holds its own clone.
#[derive(Default)]
pub struct SharedChunkGroup {
    holding: Option<Holding>,
}

// SAFETY: the descriptor lives in shared memory and its counter is atomic;
// the handle itself is only ever used from the thread that owns it.
unsafe impl Send for SharedChunkGroup {}

impl SharedChunkGroup {
    /// Wraps `group`, taking over one reference the caller already owns.
    /// The counter is not incremented.
    ///
    /// # Safety
    ///
    /// `group` must point to a live chunk group inside a segment registered in
    /// `registry`, and the caller must own a reference that nothing else will
    /// give back.
    pub unsafe fn from_raw(registry: Arc<SegmentRegistry>, group: NonNull<ChunkGroup>) -> Self {
        Self {
            holding: Some(Holding { registry, group }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.holding.is_none()
    }

    pub fn group(&self) -> Option<&ChunkGroup> {
        // SAFETY: the reference held by this handle keeps the group alive.
        self.holding
            .as_ref()
            .map(|holding| unsafe { holding.group.as_ref() })
    }

    pub fn as_ptr(&self) -> Option<NonNull<ChunkGroup>> {
        self.holding.as_ref().map(|holding| holding.group)
    }

    pub fn registry(&self) -> Option<&Arc<SegmentRegistry>> {
        self.holding.as_ref().map(|holding| &holding.registry)
    }

    /// Gives up the handle's reference to the caller without decrementing.
    /// The handle is empty afterwards.
    pub fn release(&mut self) -> Option<NonNull<ChunkGroup>> {
        self.holding.take().map(|holding| holding.group)
    }

    /// Current reference count, 0 for an empty handle.
    pub fn use_count(&self) -> u64 {
        self.group().map_or(0, ChunkGroup::ref_count)
    }

    pub fn is_unique(&self) -> bool {
        self.use_count() == 1
    }

    /// Adds a chunk to the group; see [`ChunkGroup::add_record`] for the
    /// behaviour on a full group. `false` for an empty handle.
    pub fn add_record(&self, record: ChunkRecord) -> bool {
        self.group().is_some_and(|group| group.add_record(record))
    }

    pub fn first_record(&self) -> Option<ChunkRecord> {
        self.group()?.first_record()
    }

    pub fn len(&self) -> usize {
        self.group().map_or(0, ChunkGroup::len)
    }

    fn header_ptr(&self, index: usize) -> Option<NonNull<ChunkHeader>> {
        let holding = self.holding.as_ref()?;
        let record = self.group()?.record(index)?;
        record.header_ptr(&holding.registry)
    }

    /// Header of the first chunk.
    pub fn chunk_header(&self) -> Option<&ChunkHeader> {
        // SAFETY: the chunk belongs to a group this handle keeps alive.
        self.header_ptr(0).map(|header| unsafe { &*header.as_ptr() })
    }

    /// Headers of all chunks, in insertion order. Empty for an empty handle
    /// or a group without records.
    pub fn chunk_headers(&self) -> Vec<&ChunkHeader> {
        (0..self.len())
            .filter_map(|index| self.header_ptr(index))
            .map(|header| unsafe { &*header.as_ptr() })
            .collect()
    }

    /// Start of the first chunk's user payload.
    pub fn user_payload(&self) -> Option<NonNull<u8>> {
        self.payload_ptr(0).map(|(ptr, _)| ptr)
    }

    fn payload_ptr(&self, index: usize) -> Option<(NonNull<u8>, usize)> {
        let header = self.header_ptr(index)?;
        // SAFETY: header_ptr resolved inside a registered segment and the
        // group keeps the chunk allocated.
        let fields = unsafe { header.as_ref() };
        let end = (fields.user_payload_offset as usize)
            .checked_add(fields.user_payload_size as usize)?;
        if end > fields.chunk_size as usize {
            return None;
        }
        let ptr = unsafe { ChunkHeader::user_payload(header) };
        Some((ptr, fields.user_payload_size as usize))
    }

    pub fn payload(&self, index: usize) -> Option<&[u8]> {
        let (ptr, len) = self.payload_ptr(index)?;
        Some(unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) })
    }

    /// Writable payload, only while this handle is the sole owner of the
    /// group. Portable copies made with
    /// [`PortableChunkGroup::from_descriptor`](crate::portable::PortableChunkGroup::from_descriptor)
    /// do not count as owners.
    pub fn payload_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        if !self.is_unique() {
            return None;
        }
        let (ptr, len) = self.payload_ptr(index)?;
        Some(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), len) })
    }

    /// Whether `ptr` is the first chunk's user payload.
    pub fn points_to_payload(&self, ptr: *const u8) -> bool {
        match self.user_payload() {
            Some(payload) => std::ptr::eq(payload.as_ptr(), ptr),
            None => ptr.is_null(),
        }
    }
}

impl Clone for SharedChunkGroup {
    fn clone(&self) -> Self {
        let holding = self.holding.as_ref().map(|holding| {
            // SAFETY: our own reference keeps the group alive.
            unsafe { holding.group.as_ref() }.increment_ref();
            Holding {
                registry: Arc::clone(&holding.registry),
                group: holding.group,
            }
        });
        Self { holding }
    }
}

impl Drop for SharedChunkGroup {
    fn drop(&mut self) {
        let Some(holding) = self.holding.take() else {
            return;
        };
        // SAFETY: we own one reference. Only the decrement that observed the
        // transition to zero reaches destroy.
        unsafe {
            if holding.group.as_ref().decrement_ref() {
                ChunkGroup::destroy(holding.group, &holding.registry);
            }
        }
    }
}

impl PartialEq for SharedChunkGroup {
    fn eq(&self, other: &Self) -> bool {
        self.as_ptr() == other.as_ptr()
    }
}

impl Eq for SharedChunkGroup {}

impl fmt::Debug for SharedChunkGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.group() {
            None => f.write_str("SharedChunkGroup(empty)"),
            Some(group) => f
                .debug_struct("SharedChunkGroup")
                .field("group", &self.as_ptr())
                .field("ref_count", &group.ref_count())
                .field("chunks", &group.len())
                .finish(),
        }
    }
}
