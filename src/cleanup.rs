//! Hooks for the process-lifecycle side: find what is still allocated in a
//! segment and release it after its holders are known to be dead.
//!
//! None of this takes part in the normal reference protocol. Enumeration is
//! a snapshot and forced release ignores the counter, so both are meant for
//! a segment whose users have stopped.

use std::collections::HashSet;

use crate::chunk::ChunkRecord;
use crate::chunk_group::ChunkGroup;
use crate::layout::MemoryManager;
use crate::portable::PortableChunkGroup;
use crate::segment::SegmentRegistry;

/// Every chunk group currently allocated from the segment's group pool.
pub fn live_groups(manager: &MemoryManager) -> Vec<PortableChunkGroup> {
    let Some(pool) = manager.group_pool() else {
        return Vec::new();
    };
    pool.allocated()
        .into_iter()
        .map(|slot| PortableChunkGroup::from_descriptor(manager.registry(), slot.cast()))
        .collect()
}

/// Allocated chunks that no live group refers to, e.g. chunks a dead
/// producer took but never grouped, or chunks dropped by an overflowing
/// group.
pub fn untracked_chunks(manager: &MemoryManager) -> Vec<ChunkRecord> {
    let registry = manager.registry();
    let tracked: HashSet<u64> = live_groups(manager)
        .iter()
        .filter_map(|group| group.group(registry))
        .flat_map(|group| unsafe { group.as_ref() }.records().collect::<Vec<_>>())
        .map(|record| record.chunk_header().to_bits())
        .collect();

    let mut untracked = Vec::new();
    for pool in manager.pools() {
        let Some(mempool) = registry.to_relative(pool.header_ptr().as_ptr()) else {
            continue;
        };
        for chunk in pool.allocated() {
            let Some(header) = registry.to_relative(chunk.as_ptr()) else {
                continue;
            };
            if !tracked.contains(&header.to_bits()) {
                untracked.push(ChunkRecord::new(header, mempool));
            }
        }
    }
    untracked
}

/// Frees every chunk of `group` and the descriptor, whatever its counter
/// says. Returns `false` if `group` does not resolve to an allocated
/// descriptor.
///
/// # Safety
///
/// No process may still use a handle to this group, and nothing else may
/// release it concurrently.
pub unsafe fn force_release(registry: &SegmentRegistry, group: PortableChunkGroup) -> bool {
    let Some(ptr) = group.group(registry) else {
        return false;
    };
    if !ChunkGroup::is_live(ptr, registry) {
        return false;
    }
    let descriptor: &ChunkGroup = ptr.as_ref();
    log::warn!(
        "force releasing chunk group {:?} with {} chunks and {} outstanding references",
        group.relative_ptr(),
        descriptor.len(),
        descriptor.ref_count()
    );
    ChunkGroup::destroy(ptr, registry);
    true
}
