//! Concurrency and accounting properties of the mount coordinator.

use std::sync::{Arc, Barrier};
use std::thread;
use uvmhost_core::{
    CoreError, HostConfig, LayerSet, MountCoordinator, MountedRoot, ReadOnlyBacking, UnmountScope,
};
use uvmhost_vm::SimulatedEngine;

fn coordinator(backing: ReadOnlyBacking, capacity: usize) -> (Arc<SimulatedEngine>, Arc<MountCoordinator>) {
    let engine = Arc::new(SimulatedEngine::new());
    let config = HostConfig::builder().read_only_backing(backing).build().unwrap();
    let mounts = Arc::new(MountCoordinator::new(engine.clone(), &config));
    mounts.register_host("uvm", capacity).unwrap();
    (engine, mounts)
}

fn layers(paths: &[&str]) -> LayerSet {
    LayerSet::new(paths.iter().copied()).unwrap()
}

/// K concurrent mounts of one pair allocate once and count K references
#[test]
fn test_concurrent_mounts_allocate_once() {
    const K: usize = 16;

    for backing in [ReadOnlyBacking::SharedFolder, ReadOnlyBacking::BusSlot] {
        let (engine, mounts) = coordinator(backing, 64);
        let set = layers(&["/base", "/app", "/s1"]);
        let barrier = Arc::new(Barrier::new(K));

        let handles: Vec<_> = (0..K)
            .map(|_| {
                let mounts = mounts.clone();
                let set = set.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    mounts.mount("uvm", &set).unwrap()
                })
            })
            .collect();
        let roots: Vec<MountedRoot> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(roots.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(mounts.ref_count("uvm", &set), K);
        assert_eq!(engine.attachments("uvm").len(), 3);
        let expected_slots = match backing {
            ReadOnlyBacking::SharedFolder => 1,
            ReadOnlyBacking::BusSlot => 3,
        };
        assert_eq!(mounts.slots_in_use("uvm"), Some(expected_slots));
    }
}

/// Unmount(All) drops every reference and frees the slots once
#[test]
fn test_unmount_all_releases_once() {
    let (engine, mounts) = coordinator(ReadOnlyBacking::BusSlot, 8);
    let set = layers(&["/base", "/s1"]);
    for _ in 0..5 {
        mounts.mount("uvm", &set).unwrap();
    }
    assert_eq!(mounts.ref_count("uvm", &set), 5);

    mounts.unmount("uvm", &set, UnmountScope::All).unwrap();
    assert_eq!(mounts.ref_count("uvm", &set), 0);
    assert_eq!(mounts.slots_in_use("uvm"), Some(0));
    assert!(engine.attachments("uvm").is_empty());

    // Already gone
    mounts.unmount("uvm", &set, UnmountScope::All).unwrap();
    mounts.unmount("uvm", &set, UnmountScope::ThisContainer).unwrap();
    assert_eq!(mounts.slots_in_use("uvm"), Some(0));
}

/// The (N+1)-th concurrent distinct mount fails and leaves accounting alone
#[test]
fn test_capacity_under_concurrency() {
    const N: usize = 8;
    let (_engine, mounts) = coordinator(ReadOnlyBacking::SharedFolder, N);
    let barrier = Arc::new(Barrier::new(N + 1));

    let handles: Vec<_> = (0..=N)
        .map(|i| {
            let mounts = mounts.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let scratch = format!("/scratch/{}", i);
                let set = layers(&["/base", scratch.as_str()]);
                barrier.wait();
                mounts.mount("uvm", &set)
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let ok = results.iter().filter(|r| r.is_ok()).count();
    let full = results
        .iter()
        .filter(|r| matches!(r, Err(CoreError::CapacityExceeded { capacity: N, .. })))
        .count();
    assert_eq!(ok, N);
    assert_eq!(full, 1);

    let snapshot = mounts.snapshot("uvm").unwrap();
    assert_eq!(snapshot.slots_in_use, N);
    assert_eq!(snapshot.records, N);
    assert_eq!(snapshot.shares, 1);
}

/// Racing mount/unmount pairs on one record end with nothing allocated
#[test]
fn test_mount_unmount_race() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 50;
    let (engine, mounts) = coordinator(ReadOnlyBacking::BusSlot, 4);
    let set = layers(&["/base", "/s1"]);
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let mounts = mounts.clone();
            let set = set.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..ROUNDS {
                    let root = mounts.mount("uvm", &set).unwrap();
                    assert_eq!(root.layers.len(), 2);
                    assert!(mounts.slots_in_use("uvm").unwrap() <= 2);
                    mounts.unmount("uvm", &set, UnmountScope::ThisContainer).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(mounts.ref_count("uvm", &set), 0);
    assert_eq!(mounts.slots_in_use("uvm"), Some(0));
    assert!(engine.attachments("uvm").is_empty());
}

/// A failed third attach leaves the bus exactly as before
#[test]
fn test_partial_mount_rolls_back() {
    for backing in [ReadOnlyBacking::SharedFolder, ReadOnlyBacking::BusSlot] {
        let (engine, mounts) = coordinator(backing, 8);
        let existing = layers(&["/base", "/s0"]);
        mounts.mount("uvm", &existing).unwrap();
        let before = mounts.snapshot("uvm").unwrap();
        let attached_before = engine.attachments("uvm");

        engine.fail_attach_of("/s1");
        let set = layers(&["/base", "/app", "/s1"]);
        assert!(mounts.mount("uvm", &set).is_err());

        assert_eq!(mounts.snapshot("uvm").unwrap(), before);
        assert_eq!(engine.attachments("uvm"), attached_before);
        assert_eq!(mounts.ref_count("uvm", &set), 0);
    }
}

/// Unmount(All) followed by Mount yields a fresh record
#[test]
fn test_remount() {
    let (_engine, mounts) = coordinator(ReadOnlyBacking::SharedFolder, 8);
    let set = layers(&["/base", "/s1"]);

    let first = mounts.mount("uvm", &set).unwrap();
    mounts.mount("uvm", &set).unwrap();
    mounts.unmount("uvm", &set, UnmountScope::All).unwrap();

    let second = mounts.mount("uvm", &set).unwrap();
    assert_ne!(first.root_path, second.root_path);
    assert_eq!(mounts.ref_count("uvm", &set), 1);
    assert_eq!(mounts.slots_in_use("uvm"), Some(1));
}

/// Buses of different hosting VMs are accounted independently
#[test]
fn test_hosts_are_independent() {
    let (_engine, mounts) = coordinator(ReadOnlyBacking::SharedFolder, 1);
    mounts.register_host("other", 1).unwrap();
    let set = layers(&["/base", "/s1"]);

    mounts.mount("uvm", &set).unwrap();
    mounts.mount("other", &set).unwrap();
    assert!(matches!(
        mounts.mount("uvm", &layers(&["/s2"])),
        Err(CoreError::CapacityExceeded { .. })
    ));

    mounts.unmount("other", &set, UnmountScope::All).unwrap();
    assert_eq!(mounts.ref_count("uvm", &set), 1);
    assert_eq!(mounts.slots_in_use("other"), Some(0));
}
