mod common;

use common::{heap_manager, occupancy, rejected_frees, small_config};
use shm_chunk::SharedChunkGroup;

#[test]
fn last_holder_returns_every_chunk() {
    let manager = heap_manager(&small_config());
    let before = occupancy(&manager);

    let first = manager.get_chunk(32).expect("first chunk");
    let second = manager.get_chunk(400).expect("second chunk");
    let a = manager.new_group().expect("group");
    assert!(a.add_record(first));
    assert!(a.add_record(second));
    assert_eq!(a.use_count(), 1);
    assert_eq!(occupancy(&manager), (vec![1, 1], 1));

    let b = a.clone();
    assert_eq!(b.use_count(), 2);
    assert_eq!(a, b);

    drop(a);
    assert_eq!(b.use_count(), 1);
    assert_eq!(occupancy(&manager), (vec![1, 1], 1));

    drop(b);
    assert_eq!(occupancy(&manager), before);
    assert_eq!(rejected_frees(&manager), 0);
}

#[test]
fn payloads_are_written_by_the_sole_owner() {
    let manager = heap_manager(&small_config());
    let mut group = manager.loan(&[5, 300]).expect("loan");

    group.payload_mut(0).expect("first payload").copy_from_slice(b"hello");
    group.payload_mut(1).expect("second payload").fill(7);

    let reader = group.clone();
    assert!(group.payload_mut(0).is_none(), "shared groups are read-only");
    assert_eq!(reader.payload(0), Some(&b"hello"[..]));
    assert!(reader.payload(1).expect("second").iter().all(|&b| b == 7));
    assert!(reader.payload(2).is_none());

    let headers = reader.chunk_headers();
    assert_eq!(headers.len(), 2);
    assert_eq!(headers[0].user_payload_size, 5);
    assert_eq!(headers[0].chunk_size, 64);
    assert_eq!(headers[1].chunk_size, 512);
    assert_eq!(reader.chunk_header(), Some(headers[0]));

    let payload = reader.user_payload().expect("payload").as_ptr();
    assert!(reader.points_to_payload(payload));
    assert!(!reader.points_to_payload(std::ptr::null()));
}

#[test]
fn empty_handle_accessors() {
    let manager = heap_manager(&small_config());
    let empty = SharedChunkGroup::default();
    assert!(empty.is_empty());
    assert_eq!(empty.use_count(), 0);
    assert!(empty.chunk_header().is_none());
    assert!(empty.chunk_headers().is_empty());
    assert!(empty.user_payload().is_none());
    assert!(empty.first_record().is_none());
    assert!(empty.points_to_payload(std::ptr::null()));
    assert!(!empty.add_record(manager.get_chunk(8).expect("chunk")));
    assert_eq!(empty.clone(), SharedChunkGroup::default());

    let group = manager.new_group().expect("group");
    assert!(!group.is_empty());
    assert!(group.chunk_header().is_none());
    assert!(group.chunk_headers().is_empty());
    assert!(group.user_payload().is_none());
}

#[test]
fn moves_and_assignments_keep_count_balanced() {
    let manager = heap_manager(&small_config());
    let mut a = manager.loan(&[8]).expect("loan a");
    let other = manager.loan(&[8]).expect("loan other");

    // Move: no counter change, source becomes empty.
    let b = std::mem::take(&mut a);
    assert!(a.is_empty());
    assert_eq!(b.use_count(), 1);

    // Copy-assign over a holding handle gives its old group back first.
    let mut c = other;
    assert_eq!(c.use_count(), 1);
    assert_eq!(occupancy(&manager).1, 2);
    c = b.clone();
    assert_eq!(occupancy(&manager), (vec![1, 0], 1));
    assert_eq!(c.use_count(), 2);

    // Move-assign over a holding handle does the same without an increment.
    let mut d = manager.loan(&[8]).expect("loan d");
    assert_eq!(d.use_count(), 1);
    d = c;
    assert_eq!(d.use_count(), 2);
    assert_eq!(occupancy(&manager), (vec![1, 0], 1));

    drop(b);
    drop(d);
    assert_eq!(occupancy(&manager), (vec![0, 0], 0));
}

#[test]
fn release_hands_the_reference_to_the_caller() {
    let manager = heap_manager(&small_config());
    let mut group = manager.loan(&[8, 8]).expect("loan");
    let registry = group.registry().cloned().expect("registry");

    let raw = group.release().expect("raw group");
    assert!(group.is_empty());
    drop(group);
    assert_eq!(occupancy(&manager), (vec![2, 0], 1));

    let restored = unsafe { SharedChunkGroup::from_raw(registry, raw) };
    assert_eq!(restored.use_count(), 1);
    assert_eq!(restored.len(), 2);
    drop(restored);
    assert_eq!(occupancy(&manager), (vec![0, 0], 0));
}

#[test]
fn overflowing_group_forgets_its_records() {
    let manager = heap_manager(&small_config());
    let group = manager.loan(&[8, 8, 8]).expect("loan");
    let extra = manager.get_chunk(8).expect("extra");

    assert!(!group.add_record(extra));
    assert_eq!(group.len(), 0);
    assert!(group.chunk_header().is_none());

    drop(group);
    // The cleared chunks and the rejected one are still out.
    assert_eq!(occupancy(&manager), (vec![4, 0], 0));
}
