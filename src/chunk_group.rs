//! Chunk group descriptor: up to [`MAX_CHUNKS_PER_GROUP`] chunk records
//! sharing one reference counter.
//!
//! The descriptor lives in shared memory, allocated from the segment's group
//! pool, and is reachable from every process holding a handle to it. Records
//! are stored inline as relative pointers so the descriptor means the same
//! thing wherever the segment is mapped.

use std::mem::{align_of, size_of};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::chunk::ChunkRecord;
use crate::config::{CHUNK_MEMORY_ALIGNMENT, MAX_CHUNKS_PER_GROUP};
use crate::mem_pool::MemPool;
use crate::relative_ptr::RelativePtr;
use crate::segment::SegmentRegistry;

#[repr(C)]
struct RecordSlot {
    chunk_header: AtomicU64,
    mempool: AtomicU64,
}

impl RecordSlot {
    const fn null() -> Self {
        Self {
            chunk_header: AtomicU64::new(RelativePtr::NULL.to_bits()),
            mempool: AtomicU64::new(RelativePtr::NULL.to_bits()),
        }
    }

    fn load(&self) -> ChunkRecord {
        ChunkRecord::new(
            RelativePtr::from_bits(self.chunk_header.load(Ordering::Relaxed)),
            RelativePtr::from_bits(self.mempool.load(Ordering::Relaxed)),
        )
    }

    fn store(&self, record: ChunkRecord) {
        self.chunk_header
            .store(record.chunk_header().to_bits(), Ordering::Relaxed);
        self.mempool.store(record.mempool().to_bits(), Ordering::Relaxed);
    }
}

const NULL_SLOT: RecordSlot = RecordSlot::null();

#[repr(C)]
pub struct ChunkGroup {
    ref_count: AtomicU64,
    len: AtomicU32,
    _pad: u32,
    records: [RecordSlot; MAX_CHUNKS_PER_GROUP],
    group_pool: RelativePtr,
}

const _: () = assert!(
    align_of::<ChunkGroup>() <= CHUNK_MEMORY_ALIGNMENT,
    "chunk groups are carved from pool chunks and cannot need more alignment than they provide"
);

pub const CHUNK_GROUP_SIZE: usize = size_of::<ChunkGroup>();

impl ChunkGroup {
    /// A group with one reference, held by the creator, and no records.
    pub fn new(group_pool: RelativePtr) -> Self {
        Self {
            ref_count: AtomicU64::new(1),
            len: AtomicU32::new(0),
            _pad: 0,
            records: [NULL_SLOT; MAX_CHUNKS_PER_GROUP],
            group_pool,
        }
    }

    /// Constructs a group in place.
    ///
    /// # Safety
    ///
    /// `at` must be valid for writes of a `ChunkGroup`, suitably aligned, and
    /// not yet visible to any other thread or process.
    pub(crate) unsafe fn emplace(at: NonNull<u8>, group_pool: RelativePtr) -> NonNull<ChunkGroup> {
        let group = at.cast::<ChunkGroup>();
        group.as_ptr().write(ChunkGroup::new(group_pool));
        group
    }

    pub fn group_pool(&self) -> RelativePtr {
        self.group_pool
    }

    /// Snapshot of the counter. Stale as soon as it is returned when other
    /// holders exist.
    pub fn ref_count(&self) -> u64 {
        self.ref_count.load(Ordering::Relaxed)
    }

    // Counter ops are Relaxed. Payload visibility comes from the queue
    // hand-off that delivers the handle.
    pub fn increment_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns `true` for the decrement that took the counter to zero.
    pub fn decrement_ref(&self) -> bool {
        self.ref_count.fetch_sub(1, Ordering::Relaxed) == 1
    }

    pub fn len(&self) -> usize {
        (self.len.load(Ordering::Acquire) as usize).min(MAX_CHUNKS_PER_GROUP)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == MAX_CHUNKS_PER_GROUP
    }

    /// Appends a record. When the group is already full every record is
    /// dropped from the group and `false` is returned; the chunks those
    /// records referred to are no longer tracked by the group.
    ///
    /// Not synchronised against other writers: records are added by the
    /// producer before the group is published.
    pub fn add_record(&self, record: ChunkRecord) -> bool {
        let len = self.len();
        if len >= MAX_CHUNKS_PER_GROUP {
            self.clear();
            return false;
        }
        self.records[len].store(record);
        self.len.store(len as u32 + 1, Ordering::Release);
        true
    }

    pub fn clear(&self) {
        self.len.store(0, Ordering::Release);
        for slot in &self.records {
            slot.store(ChunkRecord::new(RelativePtr::NULL, RelativePtr::NULL));
        }
    }

    pub fn record(&self, index: usize) -> Option<ChunkRecord> {
        (index < self.len()).then(|| self.records[index].load())
    }

    pub fn first_record(&self) -> Option<ChunkRecord> {
        self.record(0)
    }

    /// Records in insertion order.
    pub fn records(&self) -> impl Iterator<Item = ChunkRecord> + '_ {
        self.records[..self.len()].iter().map(RecordSlot::load)
    }

    /// Whether `group` is a descriptor currently handed out by its group
    /// pool. A stale or stray pointer into the segment answers `false`.
    ///
    /// # Safety
    ///
    /// `group` must have been produced by [`SegmentRegistry::resolve`], so a
    /// `ChunkGroup` worth of bytes is readable behind it.
    pub(crate) unsafe fn is_live(group: NonNull<ChunkGroup>, registry: &SegmentRegistry) -> bool {
        let group_pool = group.as_ref().group_pool;
        MemPool::resolve(registry, group_pool).is_some_and(|pool| {
            pool.chunk_size() as usize >= CHUNK_GROUP_SIZE && pool.is_allocated(group.cast())
        })
    }

    /// Frees every chunk of the group, in insertion order, then the
    /// descriptor itself.
    ///
    /// # Safety
    ///
    /// Must run exactly once per group, by the holder that observed the
    /// counter reach zero (or by cleanup after all holders are gone). `group`
    /// is dangling afterwards.
    pub(crate) unsafe fn destroy(group: NonNull<ChunkGroup>, registry: &SegmentRegistry) {
        let this = group.as_ref();
        for record in this.records() {
            record.free(registry);
        }
        this.clear();

        let group_pool = this.group_pool;
        match MemPool::resolve(registry, group_pool) {
            Some(pool) => {
                pool.free(group.cast());
            }
            None => log::error!(
                "cannot resolve group pool {group_pool:?}, leaking chunk group {:p}",
                group.as_ptr()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: u64) -> ChunkRecord {
        ChunkRecord::new(RelativePtr::new(1, n * 64), RelativePtr::new(1, 0))
    }

    #[test]
    fn starts_with_one_reference_and_no_records() {
        let group = ChunkGroup::new(RelativePtr::NULL);
        assert_eq!(group.ref_count(), 1);
        assert!(group.is_empty());
        assert!(group.first_record().is_none());
        assert_eq!(group.records().count(), 0);
    }

    #[test]
    fn last_decrement_is_reported_once() {
        for increments in 0..5 {
            let group = ChunkGroup::new(RelativePtr::NULL);
            for _ in 0..increments {
                group.increment_ref();
            }
            let last: Vec<bool> = (0..=increments).map(|_| group.decrement_ref()).collect();
            assert_eq!(last.iter().filter(|&&is_last| is_last).count(), 1);
            assert_eq!(last.last(), Some(&true));
            assert_eq!(group.ref_count(), 0);
        }
    }

    #[test]
    fn records_keep_insertion_order() {
        let group = ChunkGroup::new(RelativePtr::NULL);
        assert!(group.add_record(record(1)));
        assert!(group.add_record(record(2)));
        assert_eq!(group.first_record(), Some(record(1)));
        assert_eq!(group.records().collect::<Vec<_>>(), vec![record(1), record(2)]);
        assert_eq!(group.record(1), Some(record(2)));
        assert_eq!(group.record(2), None);
    }

    #[test]
    fn adding_to_a_full_group_clears_it() {
        let group = ChunkGroup::new(RelativePtr::NULL);
        for n in 0..MAX_CHUNKS_PER_GROUP as u64 {
            assert!(group.add_record(record(n)));
        }
        assert!(group.is_full());

        assert!(!group.add_record(record(99)));
        assert!(group.is_empty());
        assert_eq!(group.records().count(), 0);

        assert!(group.add_record(record(7)));
        assert_eq!(group.first_record(), Some(record(7)));
    }
}
