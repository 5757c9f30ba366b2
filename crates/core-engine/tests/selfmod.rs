//! Self-modifying code lifecycle: writable page, deferred read-only
//! downgrade on first build, sandbox conversion on a self-write fault.

mod common;
use common::*;

use core_engine::{BlockHandle, BuildRegions};
use core_interval::{FragFlags, PageProt, VmFlags};

#[test]
fn selfmod_page_lifecycle() {
    let env = env("");
    let ctx = env.engine.attach_thread();

    // App allocates one RWX page and writes two bytes of code into it.
    env.mem.map(0x4000, 0x5000, RWX);
    let added = env
        .engine
        .app_memory_allocation(&ctx, 0x4000, 0x1000, RWX, false);
    assert!(!added, "writable alloc is remembered, not yet catalogued");
    env.mem.write_bytes(0x4000, &[0xcd, 0x80]);

    // First execution: admitted through the remembered region and
    // catalogued writable with the read-only downgrade deferred.
    let mut vmlist = BuildRegions::new();
    let ok = env
        .engine
        .check_thread_vm_area(&ctx, 0x4000, 0x4000, &mut vmlist, false, true)
        .unwrap();
    assert_eq!(ok.stop_pc, 0x5000);
    let (vm, frag) = env.engine.classify(0x4000).unwrap();
    assert!(vm.contains(VmFlags::WRITABLE | VmFlags::DELAY_READ_ONLY));
    assert!(!frag.contains(FragFlags::SELFMOD_SANDBOXED));
    assert!(
        env.mem.protect_calls.lock().unwrap().is_empty(),
        "no protection work before the block commits"
    );

    // Build commit lowers the page to read-execute.
    env.engine
        .vm_area_add_fragment(&ctx, BlockHandle(1), 0x4000, false, &vmlist)
        .unwrap();
    let (vm, _) = env.engine.classify(0x4000).unwrap();
    assert!(vm.contains(VmFlags::MADE_READ_ONLY));
    assert!(!vm.contains(VmFlags::DELAY_READ_ONLY));
    let last = env.mem.protect_calls.lock().unwrap().last().copied().unwrap();
    assert_eq!(last, (0x4000, 0x5000, PageProt::READ | PageProt::EXEC));

    // The app writes over its own code: the writer's source overlaps the
    // target page, so the page converts to the selfmod sandbox.
    let resume = env
        .engine
        .handle_modified_code(&ctx, 0x9999_0000, 0x4000, 0x4001, 1, Some(BlockHandle(1)));
    assert_eq!(resume, None, "write is retried after the conversion");
    let (vm, frag) = env.engine.classify(0x4001).unwrap();
    assert!(frag.contains(FragFlags::SELFMOD_SANDBOXED));
    assert!(!vm.contains(VmFlags::MADE_READ_ONLY));
    assert!(
        env.blocks.freed.lock().unwrap().contains(&1),
        "stale cached block flushed"
    );
    assert!(
        env.mem.current_prot(0x4000).unwrap().is_writable(),
        "subsequent writes raise no fault"
    );

    // Subsequent executions build sandboxed blocks.
    let mut vmlist = BuildRegions::new();
    let ok = env
        .engine
        .check_thread_vm_area(&ctx, 0x4000, 0x4000, &mut vmlist, false, true)
        .unwrap();
    assert!(ok.frag_flags.contains(FragFlags::SELFMOD_SANDBOXED));
    assert!(env.engine.check_invariants());
}

#[test]
fn repeated_sandbox_trips_convert_back() {
    let env = env("[thresholds]\nsandbox2ro = 3\n");
    let ctx = env.engine.attach_thread();
    env.mem.map(0x4000, 0x5000, RWX);
    env.engine
        .app_memory_allocation(&ctx, 0x4000, 0x1000, RWX, false);

    let mut vmlist = BuildRegions::new();
    env.engine
        .check_thread_vm_area(&ctx, 0x4000, 0x4000, &mut vmlist, false, true)
        .unwrap();
    env.engine
        .vm_area_add_fragment(&ctx, BlockHandle(1), 0x4000, false, &vmlist)
        .unwrap();
    env.engine
        .handle_modified_code(&ctx, 0, 0x4000, 0x4001, 1, Some(BlockHandle(1)));
    let (_, frag) = env.engine.classify(0x4000).unwrap();
    assert!(frag.contains(FragFlags::SELFMOD_SANDBOXED));

    // Guard trips under the threshold leave the sandbox in place.
    assert!(!env.engine.selfmod_check_tripped(&ctx, 0x4000));
    assert!(!env.engine.selfmod_check_tripped(&ctx, 0x4000));
    // The third trip crosses sandbox2ro: back to page protection.
    assert!(env.engine.selfmod_check_tripped(&ctx, 0x4000));
    let (vm, frag) = env.engine.classify(0x4000).unwrap();
    assert!(!frag.contains(FragFlags::SELFMOD_SANDBOXED));
    assert!(vm.contains(VmFlags::MADE_READ_ONLY));
    assert!(!env.mem.current_prot(0x4000).unwrap().is_writable());
}

/// A page repeatedly written by code elsewhere cycles through Case B
/// (carve out, restore writability, re-admit on next execution) until the
/// written counter crosses the threshold; from then on the region is
/// created sandboxed instead of read-only.
#[test]
fn write_threshold_creates_sandboxed_areas() {
    let env = env("[thresholds]\nro2sandbox = 2\n");
    let ctx = env.engine.attach_thread();
    // The generator code lives on its own page.
    env.mem.map(0x20000, 0x21000, rx());
    let mut wlist = BuildRegions::new();
    env.engine
        .check_thread_vm_area(&ctx, 0x20000, 0x20000, &mut wlist, false, true)
        .unwrap();
    let writer = BlockHandle(99);
    env.engine
        .vm_area_add_fragment(&ctx, writer, 0x20000, false, &wlist)
        .unwrap();

    env.mem.map(0x8000, 0x9000, RWX);
    env.engine
        .app_memory_allocation(&ctx, 0x8000, 0x1000, RWX, false);

    for round in 0..2u64 {
        let mut vmlist = BuildRegions::new();
        env.engine
            .check_thread_vm_area(&ctx, 0x8000, 0x8000, &mut vmlist, false, true)
            .unwrap();
        let handle = BlockHandle(10 + round);
        env.engine
            .vm_area_add_fragment(&ctx, handle, 0x8000, false, &vmlist)
            .unwrap();
        // The writer's source does not overlap the target page: Case B.
        env.engine
            .handle_modified_code(&ctx, 0, 0x20000, 0x8004, 1, Some(writer));
        assert!(
            env.engine.classify(0x8004).is_none(),
            "target page carved out of the catalog"
        );
        assert!(env.mem.current_prot(0x8004).unwrap().is_writable());
    }

    // Third admission: the written counter is at the threshold, so the
    // area is created sandboxed rather than read-only.
    let mut vmlist = BuildRegions::new();
    let ok = env
        .engine
        .check_thread_vm_area(&ctx, 0x8000, 0x8000, &mut vmlist, false, true)
        .unwrap();
    assert!(ok.frag_flags.contains(FragFlags::SELFMOD_SANDBOXED));
    let (vm, frag) = env.engine.classify(0x8000).unwrap();
    assert!(frag.contains(FragFlags::SELFMOD_SANDBOXED));
    assert!(!vm.contains(VmFlags::DELAY_READ_ONLY));
}
