//! Chunk header and the record that ties an allocated chunk to its pool.

use std::mem::size_of;
use std::ptr::NonNull;

use crate::config::CHUNK_MEMORY_ALIGNMENT;
use crate::mem_pool::MemPool;
use crate::relative_ptr::{RelativePtr, SegmentId};
use crate::segment::SegmentRegistry;

/// Header at the start of every chunk. The user payload follows at
/// `user_payload_offset`.
#[repr(C, align(8))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub chunk_size: u32,
    pub user_payload_size: u32,
    pub user_payload_offset: u32,
    pub segment_id: SegmentId,
    _pad: u16,
}

pub const USER_PAYLOAD_OFFSET: usize = size_of::<ChunkHeader>().div_ceil(CHUNK_MEMORY_ALIGNMENT)
    * CHUNK_MEMORY_ALIGNMENT;

const _: () = assert!(std::mem::align_of::<ChunkHeader>() <= CHUNK_MEMORY_ALIGNMENT);

impl ChunkHeader {
    pub fn new(chunk_size: u32, user_payload_size: u32, segment_id: SegmentId) -> Self {
        Self {
            chunk_size,
            user_payload_size,
            user_payload_offset: USER_PAYLOAD_OFFSET as u32,
            segment_id,
            _pad: 0,
        }
    }

    /// Largest payload a chunk of `chunk_size` bytes can carry.
    pub fn max_payload(chunk_size: u32) -> u32 {
        chunk_size.saturating_sub(USER_PAYLOAD_OFFSET as u32)
    }

    /// # Safety
    ///
    /// `header` must point to a header inside a live chunk.
    pub(crate) unsafe fn user_payload(header: NonNull<ChunkHeader>) -> NonNull<u8> {
        let offset = header.as_ref().user_payload_offset as usize;
        NonNull::new_unchecked(header.as_ptr().cast::<u8>().add(offset))
    }
}

/// Management record for one allocated chunk: where its header is and which
/// pool takes it back. Exactly one record exists per allocated chunk; once a
/// record has been added to a chunk group the group owns the chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRecord {
    chunk_header: RelativePtr,
    mempool: RelativePtr,
}

impl ChunkRecord {
    pub fn new(chunk_header: RelativePtr, mempool: RelativePtr) -> Self {
        Self {
            chunk_header,
            mempool,
        }
    }

    pub fn chunk_header(&self) -> RelativePtr {
        self.chunk_header
    }

    pub fn mempool(&self) -> RelativePtr {
        self.mempool
    }

    pub fn header_ptr(&self, registry: &SegmentRegistry) -> Option<NonNull<ChunkHeader>> {
        registry.resolve::<ChunkHeader>(self.chunk_header)
    }

    /// Returns the chunk to its pool. `false` when either pointer does not
    /// resolve or the pool refuses the chunk; the chunk is leaked then and
    /// left for orphan cleanup.
    pub fn free(&self, registry: &SegmentRegistry) -> bool {
        let Some(pool) = MemPool::resolve(registry, self.mempool) else {
            log::error!(
                "cannot resolve owning pool {:?} of chunk {:?}",
                self.mempool,
                self.chunk_header
            );
            return false;
        };
        let Some(header) = self.header_ptr(registry) else {
            log::error!("cannot resolve chunk header {:?}", self.chunk_header);
            return false;
        };
        pool.free(header.cast())
    }
}
