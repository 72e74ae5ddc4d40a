//! Segment layout and the per-segment memory manager.
//!
//! ```text
//! ┌──────────────────────────────────────┐ offset 0
//! │ SegmentHeader (magic, version,       │
//! │ init_state, pool directory)          │
//! ├──────────────────────────────────────┤
//! │ MemPool 0 (smallest chunks)          │
//! │ MemPool 1                            │
//! │ ...                                  │
//! ├──────────────────────────────────────┤
//! │ group pool (ChunkGroup sized chunks) │
//! └──────────────────────────────────────┘
//! ```
//!
//! `init_state` goes 0 -> 1 -> 2. Everything else in the header is written
//! while it is 1 and published by the Release store of 2, so a process that
//! observes 2 with Acquire sees a fully formatted segment.

use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::chunk::{ChunkHeader, ChunkRecord};
use crate::chunk_group::{ChunkGroup, CHUNK_GROUP_SIZE};
use crate::config::{
    SegmentConfig, CHUNK_MEMORY_ALIGNMENT, MAX_CHUNKS_PER_GROUP, MAX_POOLS_PER_SEGMENT,
};
use crate::mem_pool::{MemPool, MemPoolHeader};
use crate::relative_ptr::SegmentId;
use crate::segment::{Segment, SegmentRegistry};
use crate::shared::SharedChunkGroup;
use crate::{Error, Result};

pub const SEGMENT_MAGIC: u32 = 0x5348_4D43; // 'SHMC'
pub const SEGMENT_VERSION: u32 = 1;

const INIT_IN_PROGRESS: u32 = 1;
const INIT_DONE: u32 = 2;

#[repr(C, align(64))]
pub struct SegmentHeader {
    magic: AtomicU32,
    version: AtomicU32,
    init_state: AtomicU32,
    pool_count: u32,
    segment_size: u64,
    group_pool_offset: u64,
    pool_offsets: [u64; MAX_POOLS_PER_SEGMENT],
}

/// Chunk size of the group pool.
pub const GROUP_CHUNK_SIZE: u32 =
    (CHUNK_GROUP_SIZE.div_ceil(CHUNK_MEMORY_ALIGNMENT) * CHUNK_MEMORY_ALIGNMENT) as u32;

pub(crate) fn required_size(config: &SegmentConfig) -> usize {
    let pools: usize = config
        .pools
        .iter()
        .map(|pool| MemPool::footprint(pool.chunk_size, pool.chunk_count))
        .sum();
    size_of::<SegmentHeader>() + pools + MemPool::footprint(GROUP_CHUNK_SIZE, config.group_count)
}

/// Lays out `config` in `segment`. Must run before any other process
/// attaches; an already formatted segment is overwritten.
pub fn format_segment(segment: &mut Segment, config: &SegmentConfig) -> Result<()> {
    config.validate()?;
    let required = required_size(config);
    if segment.len() < required {
        return Err(Error::InvalidConfig(format!(
            "segment {} has {} bytes, layout needs {}",
            segment.id(),
            segment.len(),
            required
        )));
    }

    let base = segment.base();
    let header = base.cast::<SegmentHeader>();
    // SAFETY: `&mut Segment` gives exclusive access in this process, the
    // base is 64-byte aligned and the layout fits, as checked above.
    unsafe {
        header.as_ptr().write(SegmentHeader {
            magic: AtomicU32::new(0),
            version: AtomicU32::new(0),
            init_state: AtomicU32::new(INIT_IN_PROGRESS),
            pool_count: config.pools.len() as u32,
            segment_size: segment.len() as u64,
            group_pool_offset: 0,
            pool_offsets: [0; MAX_POOLS_PER_SEGMENT],
        });
        let header = &mut *header.as_ptr();

        let mut offset = size_of::<SegmentHeader>();
        for (slot, pool) in config.pools.iter().enumerate() {
            MemPool::format(
                NonNull::new_unchecked(base.as_ptr().add(offset)),
                pool.chunk_size,
                pool.chunk_count,
            );
            header.pool_offsets[slot] = offset as u64;
            offset += MemPool::footprint(pool.chunk_size, pool.chunk_count);
        }
        MemPool::format(
            NonNull::new_unchecked(base.as_ptr().add(offset)),
            GROUP_CHUNK_SIZE,
            config.group_count,
        );
        header.group_pool_offset = offset as u64;

        header.magic.store(SEGMENT_MAGIC, Ordering::Relaxed);
        header.version.store(SEGMENT_VERSION, Ordering::Relaxed);
        header.init_state.store(INIT_DONE, Ordering::Release);
    }

    log::info!(
        "formatted segment {}: {} chunk pools, {} chunk groups, {} of {} bytes used",
        segment.id(),
        config.pools.len(),
        config.group_count,
        required,
        segment.len()
    );
    Ok(())
}

/// Allocation front end for one formatted segment.
pub struct MemoryManager {
    registry: Arc<SegmentRegistry>,
    segment_id: SegmentId,
    header: NonNull<SegmentHeader>,
}

// SAFETY: the header is immutable after formatting and the pools only use
// atomics; the registry keeps the segment mapped.
unsafe impl Send for MemoryManager {}
unsafe impl Sync for MemoryManager {}

impl MemoryManager {
    pub fn open(registry: Arc<SegmentRegistry>, segment_id: SegmentId) -> Result<Self> {
        let segment = registry
            .segment(segment_id)
            .ok_or(Error::SegmentNotFound(segment_id))?;
        if segment.len() < size_of::<SegmentHeader>() {
            return Err(Error::Corrupt("segment smaller than its header"));
        }
        let header_ptr = segment.base().cast::<SegmentHeader>();
        // SAFETY: aligned, in bounds, and only atomics are read before the
        // init handshake completes.
        let header = unsafe { header_ptr.as_ref() };
        if header.init_state.load(Ordering::Acquire) != INIT_DONE {
            return Err(Error::Corrupt("segment is not formatted"));
        }
        if header.magic.load(Ordering::Relaxed) != SEGMENT_MAGIC {
            return Err(Error::Corrupt("segment magic mismatch"));
        }
        let version = header.version.load(Ordering::Relaxed);
        if version != SEGMENT_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        if header.pool_count as usize > MAX_POOLS_PER_SEGMENT {
            return Err(Error::Corrupt("segment pool count out of range"));
        }
        let offsets = header.pool_offsets[..header.pool_count as usize]
            .iter()
            .chain(std::iter::once(&header.group_pool_offset));
        for &offset in offsets {
            let fits = (offset as usize)
                .checked_add(size_of::<MemPoolHeader>())
                .is_some_and(|end| end <= segment.len());
            if !fits || offset as usize % 64 != 0 {
                return Err(Error::Corrupt("pool offset out of range"));
            }
            // SAFETY: offset checked against the segment bounds above.
            let pool = unsafe { pool_at(header_ptr, offset) };
            if pool.is_none() {
                return Err(Error::Corrupt("pool magic mismatch"));
            }
        }

        Ok(Self {
            registry,
            segment_id,
            header: header_ptr,
        })
    }

    pub fn registry(&self) -> &Arc<SegmentRegistry> {
        &self.registry
    }

    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    fn header(&self) -> &SegmentHeader {
        unsafe { self.header.as_ref() }
    }

    /// Chunk pools in ascending chunk size order.
    pub fn pools(&self) -> Vec<MemPool<'_>> {
        let header = self.header();
        header.pool_offsets[..header.pool_count as usize]
            .iter()
            // SAFETY: offsets were validated in `open`.
            .filter_map(|&offset| unsafe { pool_at(self.header, offset) })
            .collect()
    }

    pub fn group_pool(&self) -> Option<MemPool<'_>> {
        unsafe { pool_at(self.header, self.header().group_pool_offset) }
    }

    /// Allocates a chunk from the smallest pool whose chunks hold
    /// `payload_size` bytes. There is no fallback to larger pools.
    pub fn get_chunk(&self, payload_size: u32) -> Result<ChunkRecord> {
        let pool = self
            .pools()
            .into_iter()
            .find(|pool| ChunkHeader::max_payload(pool.chunk_size()) >= payload_size)
            .ok_or(Error::NoPoolForSize(payload_size))?;
        let chunk = pool.allocate().ok_or(Error::PoolExhausted {
            chunk_size: pool.chunk_size(),
        })?;
        // SAFETY: freshly allocated, aligned to CHUNK_MEMORY_ALIGNMENT and
        // exclusively ours until published.
        unsafe {
            chunk.cast::<ChunkHeader>().as_ptr().write(ChunkHeader::new(
                pool.chunk_size(),
                payload_size,
                self.segment_id,
            ));
        }

        let chunk_header = self.registry.to_relative(chunk.as_ptr());
        let mempool = self.registry.to_relative(pool.header_ptr().as_ptr());
        match (chunk_header, mempool) {
            (Some(chunk_header), Some(mempool)) => Ok(ChunkRecord::new(chunk_header, mempool)),
            _ => {
                pool.free(chunk);
                Err(Error::Corrupt("chunk outside every registered segment"))
            }
        }
    }

    /// Returns a chunk that was never added to a group.
    pub fn free_chunk(&self, record: ChunkRecord) -> bool {
        record.free(&self.registry)
    }

    /// A fresh, empty group holding one reference.
    pub fn new_group(&self) -> Result<SharedChunkGroup> {
        let pool = self.group_pool().ok_or(Error::Corrupt("group pool missing"))?;
        let slot = pool.allocate().ok_or(Error::GroupPoolExhausted)?;
        let group_pool = self
            .registry
            .to_relative(pool.header_ptr().as_ptr())
            .ok_or(Error::Corrupt("group pool outside every registered segment"))?;
        // SAFETY: the slot is ours, GROUP_CHUNK_SIZE >= size_of::<ChunkGroup>()
        // and chunks satisfy ChunkGroup's alignment. The single reference
        // created by emplace moves into the handle.
        unsafe {
            let group = ChunkGroup::emplace(slot, group_pool);
            Ok(SharedChunkGroup::from_raw(Arc::clone(&self.registry), group))
        }
    }

    /// Allocates one chunk per entry of `payload_sizes` and groups them.
    /// On failure every chunk allocated so far is returned.
    pub fn loan(&self, payload_sizes: &[u32]) -> Result<SharedChunkGroup> {
        if payload_sizes.len() > MAX_CHUNKS_PER_GROUP {
            return Err(Error::TooManyChunks {
                requested: payload_sizes.len(),
                max: MAX_CHUNKS_PER_GROUP,
            });
        }
        let group = self.new_group()?;
        for &size in payload_sizes {
            let record = self.get_chunk(size)?;
            group.add_record(record);
        }
        Ok(group)
    }
}

/// # Safety
///
/// `header` must be the base of a formatted segment and `offset` in bounds.
unsafe fn pool_at<'a>(header: NonNull<SegmentHeader>, offset: u64) -> Option<MemPool<'a>> {
    let pool = NonNull::new_unchecked(header.as_ptr().cast::<u8>().add(offset as usize));
    MemPool::attach(pool.cast())
}
