//! Fixed-size chunk pool living inside a shared memory segment.
//!
//! ```text
//! ┌──────────────────────────────┐ <- header (64 bytes)
//! │ magic │ chunk_size │ count   │
//! │ links_offset │ chunks_offset │
//! │ free_head (generation|index) │
//! │ used │ min_free │ rejected   │
//! ├──────────────────────────────┤ <- header + links_offset
//! │ links: [AtomicU32; count]    │
//! ├──────────────────────────────┤ <- header + chunks_offset
//! │ chunk 0 │ chunk 1 │ ...      │
//! └──────────────────────────────┘
//! ```
//!
//! The free list is an index based Treiber stack. The head packs a
//! generation counter with the index of the top chunk so a stale CAS cannot
//! succeed after the same index was popped and pushed again. While a chunk
//! is handed out its link holds `IN_USE`, which lets `free` reject double
//! frees and lets the cleanup side enumerate chunks that are still out.
//!
//! Offsets are relative to the header, so any process can allocate and free
//! no matter where it mapped the segment.

use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::config::CHUNK_MEMORY_ALIGNMENT;
use crate::relative_ptr::RelativePtr;
use crate::segment::{Segment, SegmentRegistry};

pub const MEMPOOL_MAGIC: u32 = 0x4D50_4F4C; // 'MPOL'

const EMPTY: u32 = u32::MAX;
const IN_USE: u32 = u32::MAX - 1;

#[repr(C, align(64))]
pub struct MemPoolHeader {
    magic: u32,
    chunk_size: u32,
    chunk_count: u32,
    _pad0: u32,
    links_offset: u64,
    chunks_offset: u64,
    free_head: AtomicU64,
    used_chunks: AtomicU32,
    min_free: AtomicU32,
    rejected_frees: AtomicU32,
    _pad1: [u8; 12],
}

const _: () = assert!(size_of::<MemPoolHeader>() == 64);

fn pack(generation: u32, index: u32) -> u64 {
    (u64::from(generation) << 32) | u64::from(index)
}

fn unpack(head: u64) -> (u32, u32) {
    ((head >> 32) as u32, head as u32)
}

fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemPoolStats {
    pub chunk_size: u32,
    pub chunk_count: u32,
    pub used_chunks: u32,
    pub min_free: u32,
    pub rejected_frees: u32,
}

/// Process-local view of a pool. Cheap to copy; borrows the segment it
/// lives in.
#[derive(Clone, Copy)]
pub struct MemPool<'a> {
    header: NonNull<MemPoolHeader>,
    _segment: PhantomData<&'a Segment>,
}

// SAFETY: all mutable pool state is atomic; the rest is written once at
// format time.
unsafe impl Send for MemPool<'_> {}
unsafe impl Sync for MemPool<'_> {}

impl<'a> MemPool<'a> {
    /// Bytes a pool of `chunk_count` chunks of `chunk_size` bytes occupies,
    /// header included. Always a multiple of 64.
    pub fn footprint(chunk_size: u32, chunk_count: u32) -> usize {
        let links = align_up(chunk_count as usize * size_of::<AtomicU32>(), 64);
        align_up(
            size_of::<MemPoolHeader>() + links + chunk_size as usize * chunk_count as usize,
            64,
        )
    }

    /// Writes an empty pool at `at`.
    ///
    /// # Safety
    ///
    /// `at` must be 64-byte aligned, point to at least
    /// `footprint(chunk_size, chunk_count)` writable bytes, and nobody else may
    /// access that memory until formatting returns.
    pub(crate) unsafe fn format(at: NonNull<u8>, chunk_size: u32, chunk_count: u32) -> Self {
        debug_assert_eq!(chunk_size as usize % CHUNK_MEMORY_ALIGNMENT, 0);
        let links_offset = size_of::<MemPoolHeader>();
        let chunks_offset =
            links_offset + align_up(chunk_count as usize * size_of::<AtomicU32>(), 64);
        let first = if chunk_count == 0 { EMPTY } else { 0 };

        let header = at.cast::<MemPoolHeader>();
        header.as_ptr().write(MemPoolHeader {
            magic: MEMPOOL_MAGIC,
            chunk_size,
            chunk_count,
            _pad0: 0,
            links_offset: links_offset as u64,
            chunks_offset: chunks_offset as u64,
            free_head: AtomicU64::new(pack(0, first)),
            used_chunks: AtomicU32::new(0),
            min_free: AtomicU32::new(chunk_count),
            rejected_frees: AtomicU32::new(0),
            _pad1: [0u8; 12],
        });

        let links = at.as_ptr().add(links_offset).cast::<AtomicU32>();
        for index in 0..chunk_count {
            let next = if index + 1 == chunk_count { EMPTY } else { index + 1 };
            links.add(index as usize).write(AtomicU32::new(next));
        }

        Self {
            header,
            _segment: PhantomData,
        }
    }

    /// Attaches to a formatted pool, or `None` if `header` does not carry the
    /// pool magic.
    ///
    /// # Safety
    ///
    /// `header` must point into a segment that outlives `'a` with at least
    /// `size_of::<MemPoolHeader>()` readable bytes.
    pub(crate) unsafe fn attach(header: NonNull<MemPoolHeader>) -> Option<Self> {
        if header.as_ref().magic != MEMPOOL_MAGIC {
            return None;
        }
        Some(Self {
            header,
            _segment: PhantomData,
        })
    }

    /// Resolves a pool through the registry. `None` for null, dangling, or
    /// non-pool pointers.
    pub fn resolve(registry: &'a SegmentRegistry, ptr: RelativePtr) -> Option<Self> {
        let header = registry.resolve::<MemPoolHeader>(ptr)?;
        // SAFETY: resolve checked bounds and alignment inside a registered
        // segment, which lives as long as the registry borrow.
        unsafe { Self::attach(header) }
    }

    pub fn header_ptr(&self) -> NonNull<MemPoolHeader> {
        self.header
    }

    fn header(&self) -> &MemPoolHeader {
        unsafe { self.header.as_ref() }
    }

    pub fn chunk_size(&self) -> u32 {
        self.header().chunk_size
    }

    pub fn chunk_count(&self) -> u32 {
        self.header().chunk_count
    }

    pub fn used_chunks(&self) -> u32 {
        self.header().used_chunks.load(Ordering::Relaxed)
    }

    pub fn free_chunks(&self) -> u32 {
        self.chunk_count().saturating_sub(self.used_chunks())
    }

    pub fn stats(&self) -> MemPoolStats {
        let header = self.header();
        MemPoolStats {
            chunk_size: header.chunk_size,
            chunk_count: header.chunk_count,
            used_chunks: header.used_chunks.load(Ordering::Relaxed),
            min_free: header.min_free.load(Ordering::Relaxed),
            rejected_frees: header.rejected_frees.load(Ordering::Relaxed),
        }
    }

    fn link(&self, index: u32) -> &AtomicU32 {
        debug_assert!(index < self.chunk_count());
        unsafe {
            &*self
                .header
                .as_ptr()
                .cast::<u8>()
                .add(self.header().links_offset as usize)
                .cast::<AtomicU32>()
                .add(index as usize)
        }
    }

    fn chunks_base(&self) -> *mut u8 {
        unsafe {
            self.header
                .as_ptr()
                .cast::<u8>()
                .add(self.header().chunks_offset as usize)
        }
    }

    fn chunk_ptr(&self, index: u32) -> NonNull<u8> {
        let offset = index as usize * self.chunk_size() as usize;
        unsafe { NonNull::new_unchecked(self.chunks_base().add(offset)) }
    }

    fn index_of(&self, chunk: NonNull<u8>) -> Option<u32> {
        let base = self.chunks_base() as usize;
        let addr = chunk.as_ptr() as usize;
        let chunk_size = self.chunk_size() as usize;
        let delta = addr.checked_sub(base)?;
        if delta % chunk_size != 0 {
            return None;
        }
        let index = delta / chunk_size;
        (index < self.chunk_count() as usize).then_some(index as u32)
    }

    pub fn contains(&self, chunk: NonNull<u8>) -> bool {
        self.index_of(chunk).is_some()
    }

    /// Pops a chunk off the free list, or `None` when the pool is exhausted.
    pub fn allocate(&self) -> Option<NonNull<u8>> {
        let header = self.header();
        let mut head = header.free_head.load(Ordering::Acquire);
        loop {
            let (generation, index) = unpack(head);
            if index == EMPTY {
                return None;
            }
            if index >= header.chunk_count {
                log::error!("pool free list head {index} out of range, treating pool as exhausted");
                return None;
            }
            let next = self.link(index).load(Ordering::Relaxed);
            match header.free_head.compare_exchange_weak(
                head,
                pack(generation.wrapping_add(1), next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.link(index).store(IN_USE, Ordering::Release);
                    let used = header.used_chunks.fetch_add(1, Ordering::Relaxed) + 1;
                    header
                        .min_free
                        .fetch_min(header.chunk_count.saturating_sub(used), Ordering::Relaxed);
                    return Some(self.chunk_ptr(index));
                }
                Err(current) => {
                    head = current;
                    std::hint::spin_loop();
                }
            }
        }
    }

    /// Pushes a chunk back. Returns `false`, and leaves the pool untouched,
    /// if `chunk` is not a chunk of this pool or is not currently allocated.
    pub fn free(&self, chunk: NonNull<u8>) -> bool {
        let header = self.header();
        let Some(index) = self.index_of(chunk) else {
            header.rejected_frees.fetch_add(1, Ordering::Relaxed);
            log::error!(
                "rejected free of {:p}: not a chunk of pool with {} byte chunks",
                chunk.as_ptr(),
                header.chunk_size
            );
            return false;
        };
        if self
            .link(index)
            .compare_exchange(IN_USE, EMPTY, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            header.rejected_frees.fetch_add(1, Ordering::Relaxed);
            log::error!("rejected double free of chunk {index} (chunk size {})", header.chunk_size);
            return false;
        }

        // Accounted before the push so a chunk is never counted twice once
        // another thread can pop it.
        header.used_chunks.fetch_sub(1, Ordering::Relaxed);
        let mut head = header.free_head.load(Ordering::Relaxed);
        loop {
            let (generation, top) = unpack(head);
            self.link(index).store(top, Ordering::Relaxed);
            match header.free_head.compare_exchange_weak(
                head,
                pack(generation.wrapping_add(1), index),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => {
                    head = current;
                    std::hint::spin_loop();
                }
            }
        }
        true
    }

    pub fn is_allocated(&self, chunk: NonNull<u8>) -> bool {
        self.index_of(chunk)
            .is_some_and(|index| self.link(index).load(Ordering::Acquire) == IN_USE)
    }

    /// Chunks currently handed out. A snapshot; concurrent allocations and
    /// frees may or may not be reflected.
    pub fn allocated(&self) -> Vec<NonNull<u8>> {
        (0..self.chunk_count())
            .filter(|&index| self.link(index).load(Ordering::Acquire) == IN_USE)
            .map(|index| self.chunk_ptr(index))
            .collect()
    }
}
