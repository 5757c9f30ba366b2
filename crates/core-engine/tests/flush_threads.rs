//! Multi-thread flush acknowledgement through the engine surface.

mod common;
use common::*;

use core_engine::{BlockHandle, BuildRegions};

#[test]
fn shared_flush_waits_for_every_thread() {
    let env = env("");
    let t1 = env.engine.attach_thread();
    let t2 = env.engine.attach_thread();
    let t3 = env.engine.attach_thread();

    env.mem.map(0x10000, 0x11000, rx());
    let mut vmlist = BuildRegions::new();
    env.engine
        .check_thread_vm_area(&t1, 0x10100, 0x10100, &mut vmlist, true, true)
        .unwrap();
    env.engine
        .vm_area_add_fragment(&t1, BlockHandle(5), 0x10100, true, &vmlist)
        .unwrap();

    // Unmap without caller-side synch: the shared block is unlinked now
    // but freed only after every thread passes a safe point.
    env.engine
        .app_memory_deallocation(&t1, 0x10000, 0x1000, false);
    assert!(env.blocks.unlinked.lock().unwrap().contains(&5));
    assert!(env.blocks.freed.lock().unwrap().is_empty());

    assert_eq!(env.engine.thread_safe_point(&t1), 0);
    assert_eq!(env.engine.thread_safe_point(&t2), 0);
    assert!(env.blocks.freed.lock().unwrap().is_empty());
    assert_eq!(env.engine.thread_safe_point(&t3), 1);
    assert!(env.blocks.freed.lock().unwrap().contains(&5));
}

#[test]
fn individually_removed_shared_blocks_take_the_lazy_path() {
    let env = env("[thresholds]\nlazy_deletion_max_pending = 2\n");
    let t1 = env.engine.attach_thread();
    let t2 = env.engine.attach_thread();

    env.mem.map(0x20000, 0x21000, rx());
    for i in 0..3u64 {
        let pc = 0x20000 + i * 0x100;
        let mut vmlist = BuildRegions::new();
        env.engine
            .check_thread_vm_area(&t1, pc, pc, &mut vmlist, true, true)
            .unwrap();
        env.engine
            .vm_area_add_fragment(&t1, BlockHandle(30 + i), pc, true, &vmlist)
            .unwrap();
    }

    // The first two removals sit on the lazy list; the third pushes it
    // over budget and promotes everything into one pending entry.
    assert!(env.engine.vm_area_remove_fragment(&t1, BlockHandle(30)));
    assert!(env.engine.vm_area_remove_fragment(&t1, BlockHandle(31)));
    assert!(env.blocks.freed.lock().unwrap().is_empty());
    assert!(env.engine.vm_area_remove_fragment(&t1, BlockHandle(32)));

    assert_eq!(env.engine.thread_safe_point(&t1), 0);
    let freed = env.engine.thread_safe_point(&t2);
    assert_eq!(freed, 3, "promoted entry freed after both threads ack");

    let freed_log = env.blocks.freed.lock().unwrap().clone();
    assert!(freed_log.contains(&30) && freed_log.contains(&31) && freed_log.contains(&32));
}

#[test]
fn detach_acknowledges_and_frees_private_blocks() {
    let env = env("");
    let t1 = env.engine.attach_thread();
    let t2 = env.engine.attach_thread();

    env.mem.map(0x30000, 0x31000, rx());
    // Private block for t2.
    let mut vmlist = BuildRegions::new();
    env.engine
        .check_thread_vm_area(&t2, 0x30000, 0x30000, &mut vmlist, false, true)
        .unwrap();
    env.engine
        .vm_area_add_fragment(&t2, BlockHandle(9), 0x30000, false, &vmlist)
        .unwrap();
    // Shared block awaiting both threads.
    let mut vmlist = BuildRegions::new();
    env.engine
        .check_thread_vm_area(&t1, 0x30200, 0x30200, &mut vmlist, true, true)
        .unwrap();
    env.engine
        .vm_area_add_fragment(&t1, BlockHandle(8), 0x30200, true, &vmlist)
        .unwrap();
    env.engine.app_memory_flush(&t1, 0x30200, 0x100);

    assert_eq!(env.engine.thread_count(), 2);
    env.engine.detach_thread(t2);
    assert_eq!(env.engine.thread_count(), 1);
    // t2's private block is gone and its detach acknowledged the shared
    // flush entry; t1's ack releases it fully.
    assert!(env.blocks.freed.lock().unwrap().contains(&9));
    env.engine.thread_safe_point(&t1);
    assert!(env.blocks.freed.lock().unwrap().contains(&8));
}

#[test]
fn reset_recommended_after_pending_churn() {
    let env = env("[thresholds]\nreset_every_nth_pending = 2\n");
    let t1 = env.engine.attach_thread();
    env.mem.map(0x50000, 0x52000, rx());

    for i in 0..2u64 {
        let pc = 0x50000 + i * 0x1000;
        let mut vmlist = BuildRegions::new();
        env.engine
            .check_thread_vm_area(&t1, pc, pc, &mut vmlist, true, true)
            .unwrap();
        env.engine
            .vm_area_add_fragment(&t1, BlockHandle(60 + i), pc, true, &vmlist)
            .unwrap();
        assert!(!env.engine.reset_recommended());
        env.engine.app_memory_flush(&t1, pc, 0x1000);
    }
    assert!(env.engine.reset_recommended());
    env.engine.reset();
    assert!(!env.engine.reset_recommended());
    assert!(env.engine.catalog_snapshot().is_empty());
}

#[test]
fn allsynched_flush_frees_immediately() {
    let env = env("");
    let t1 = env.engine.attach_thread();
    env.mem.map(0x40000, 0x41000, rx());
    let mut vmlist = BuildRegions::new();
    env.engine
        .check_thread_vm_area(&t1, 0x40000, 0x40000, &mut vmlist, true, true)
        .unwrap();
    env.engine
        .vm_area_add_fragment(&t1, BlockHandle(11), 0x40000, true, &vmlist)
        .unwrap();

    env.engine.flush_all_synched(0x40000, 0x41000);
    assert!(env.blocks.freed.lock().unwrap().contains(&11));
}
