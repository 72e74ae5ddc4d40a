use std::sync::Arc;

use shm_chunk::{
    format_segment, ChunkGroupSlot, ChunkHeader, MemoryManager, PortableChunkGroup, Segment,
    SegmentConfig, SegmentRegistry,
};
use tempfile::tempdir;

const SEGMENT_ID: u16 = 7;

#[test]
fn group_published_in_one_mapping_is_freed_from_another() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("chunks.shm");
    let config = SegmentConfig::default();

    let mut segment =
        Segment::create_file(SEGMENT_ID, &path, config.required_size()).expect("create segment");
    format_segment(&mut segment, &config).expect("format");
    let mut producer_registry = SegmentRegistry::new();
    producer_registry.register(segment).expect("register producer");
    let producer_registry = Arc::new(producer_registry);

    let mut consumer_registry = SegmentRegistry::new();
    consumer_registry
        .register(Segment::open_file(SEGMENT_ID, &path).expect("open segment"))
        .expect("register consumer");
    let consumer_registry = Arc::new(consumer_registry);

    let producer_base = producer_registry.segment(SEGMENT_ID).expect("producer").base();
    let consumer_base = consumer_registry.segment(SEGMENT_ID).expect("consumer").base();
    assert_ne!(producer_base, consumer_base);

    let producer =
        MemoryManager::open(Arc::clone(&producer_registry), SEGMENT_ID).expect("producer");
    let consumer =
        MemoryManager::open(Arc::clone(&consumer_registry), SEGMENT_ID).expect("consumer");

    let mut group = producer.loan(&[5, 600]).expect("loan");
    group.payload_mut(0).expect("payload").copy_from_slice(b"hello");
    group.payload_mut(1).expect("payload").fill(0xAB);

    let slot = ChunkGroupSlot::new();
    slot.store(PortableChunkGroup::from(group));

    let received = slot.take().release_to_shared(&consumer_registry);
    assert_eq!(received.use_count(), 1);
    assert_eq!(received.payload(0), Some(&b"hello"[..]));
    assert!(received.payload(1).expect("second").iter().all(|&b| b == 0xAB));

    let header = received.chunk_header().expect("header") as *const ChunkHeader as usize;
    let consumer_segment = consumer_registry.segment(SEGMENT_ID).expect("consumer");
    assert!(consumer_segment.contains(header));
    assert!(!producer_registry.segment(SEGMENT_ID).expect("producer").contains(header));

    assert_eq!(producer.pools().iter().map(|p| p.used_chunks()).sum::<u32>(), 2);
    drop(received);
    assert!(producer.pools().iter().all(|pool| pool.used_chunks() == 0));
    assert_eq!(consumer.group_pool().expect("groups").used_chunks(), 0);
}

#[test]
fn reopened_segment_keeps_its_layout() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("layout.shm");
    let config = SegmentConfig::default();
    {
        let mut segment =
            Segment::create_file(SEGMENT_ID, &path, config.required_size()).expect("create");
        format_segment(&mut segment, &config).expect("format");
        segment.sync().expect("sync");
    }

    let mut registry = SegmentRegistry::new();
    registry
        .register(Segment::open_file(SEGMENT_ID, &path).expect("open"))
        .expect("register");
    let manager = MemoryManager::open(Arc::new(registry), SEGMENT_ID).expect("manager");
    let sizes: Vec<_> = manager.pools().iter().map(|pool| pool.chunk_size()).collect();
    let expected: Vec<_> = config.pools.iter().map(|pool| pool.chunk_size).collect();
    assert_eq!(sizes, expected);
    assert_eq!(
        manager.group_pool().expect("groups").chunk_count(),
        config.group_count
    );
}
