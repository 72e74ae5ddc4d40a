#![allow(dead_code)]

use std::sync::Arc;

use shm_chunk::{
    format_segment, MemPoolConfig, MemoryManager, Segment, SegmentConfig, SegmentRegistry,
};

pub const SEGMENT_ID: u16 = 1;

pub fn small_config() -> SegmentConfig {
    SegmentConfig {
        pools: vec![MemPoolConfig::new(64, 8), MemPoolConfig::new(512, 4)],
        group_count: 4,
    }
}

pub fn heap_manager(config: &SegmentConfig) -> MemoryManager {
    let mut segment = Segment::heap(SEGMENT_ID, config.required_size()).expect("segment");
    format_segment(&mut segment, config).expect("format");
    let mut registry = SegmentRegistry::new();
    registry.register(segment).expect("register");
    MemoryManager::open(Arc::new(registry), SEGMENT_ID).expect("open manager")
}

/// (used chunks per pool, used groups)
pub fn occupancy(manager: &MemoryManager) -> (Vec<u32>, u32) {
    let chunks = manager.pools().iter().map(|pool| pool.used_chunks()).collect();
    let groups = manager.group_pool().expect("group pool").used_chunks();
    (chunks, groups)
}

pub fn rejected_frees(manager: &MemoryManager) -> u32 {
    manager
        .pools()
        .iter()
        .chain(manager.group_pool().iter())
        .map(|pool| pool.stats().rejected_frees)
        .sum()
}
