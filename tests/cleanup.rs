mod common;

use common::{heap_manager, occupancy, rejected_frees, small_config};
use shm_chunk::cleanup::{force_release, live_groups, untracked_chunks};
use shm_chunk::PortableChunkGroup;

#[test]
fn live_groups_lists_every_allocated_descriptor() {
    let manager = heap_manager(&small_config());
    let registry = manager.registry();
    assert!(live_groups(&manager).is_empty());

    let a = manager.loan(&[8]).expect("a");
    let b = manager.loan(&[8, 100]).expect("b");
    let mut live = live_groups(&manager);
    let mut expected = vec![
        PortableChunkGroup::from_descriptor(registry, a.as_ptr().expect("a")),
        PortableChunkGroup::from_descriptor(registry, b.as_ptr().expect("b")),
    ];
    live.sort_by_key(|group| group.to_bits());
    expected.sort_by_key(|group| group.to_bits());
    assert_eq!(live, expected);

    // Listing does not take references.
    assert!(a.is_unique());
    assert!(b.is_unique());
    drop((a, b));
    assert!(live_groups(&manager).is_empty());
}

#[test]
fn force_release_reclaims_an_abandoned_group() {
    let manager = heap_manager(&small_config());
    let registry = manager.registry();

    let group = manager.loan(&[8, 8, 300]).expect("loan");
    let held_elsewhere = group.clone();
    // The holders die without giving their references back.
    let abandoned = PortableChunkGroup::from(group);
    std::mem::forget(held_elsewhere);
    assert_eq!(occupancy(&manager), (vec![2, 1], 1));

    assert!(unsafe { force_release(registry, abandoned) });
    assert_eq!(occupancy(&manager), (vec![0, 0], 0));
    assert!(!unsafe { force_release(registry, abandoned) });
    assert!(!unsafe { force_release(registry, PortableChunkGroup::NULL) });
    assert_eq!(rejected_frees(&manager), 0);
}

#[test]
fn untracked_chunks_finds_ungrouped_and_forgotten_chunks() {
    let manager = heap_manager(&small_config());

    let grouped = manager.loan(&[8]).expect("grouped");
    let loose = manager.get_chunk(200).expect("loose");
    assert_eq!(untracked_chunks(&manager), vec![loose]);

    let overflowing = manager.loan(&[8, 8, 8]).expect("full");
    assert!(!overflowing.add_record(manager.get_chunk(8).expect("fourth")));
    assert_eq!(overflowing.len(), 0);

    let untracked = untracked_chunks(&manager);
    assert_eq!(untracked.len(), 5);
    assert!(untracked.contains(&loose));
    for record in untracked {
        assert!(manager.free_chunk(record));
    }

    drop(overflowing);
    drop(grouped);
    assert_eq!(occupancy(&manager), (vec![0, 0], 0));
}
