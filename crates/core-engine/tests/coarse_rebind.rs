//! Coarse-grain persisted unit across a loader IAT patch window.

mod common;
use common::*;

use core_engine::{CoarseUnitId, ProtDecision};
use core_interval::{FragFlags, VmFlags};

const TEXT_START: u64 = 0x40_0000;
const TEXT_END: u64 = 0x50_0000;
const IAT_START: u64 = 0x40_1000;
const IAT_END: u64 = 0x40_2000;

fn setup(env: &TestEnv) -> core_engine::ThreadContext {
    let ctx = env.engine.attach_thread();
    env.mem.map(TEXT_START, TEXT_END, rx());
    env.modules.add_text(TEXT_START, TEXT_END, "app.dll");
    env.engine
        .declare_coarse_region(TEXT_START, TEXT_END, Some(CoarseUnitId(77)))
        .unwrap();
    assert!(
        env.engine
            .aux()
            .register_iat(IAT_START, IAT_END, "app.dll".into())
    );
    ctx
}

#[test]
fn clean_rebind_keeps_persisted_unit() {
    let env = env("");
    let ctx = setup(&env);
    let (vm, frag) = env.engine.classify(TEXT_START).unwrap();
    assert!(vm.contains(VmFlags::PERSISTED_CACHE));
    assert!(frag.contains(FragFlags::COARSE_GRAIN));

    // Loader opens the IAT for patching: bytes are stashed, nothing is
    // flushed, the area and its unit stay.
    let d = env
        .engine
        .app_memory_protection_change(&ctx, IAT_START, IAT_END - IAT_START, rw(), true);
    assert_eq!(d, ProtDecision::ApplyChange);
    assert!(env.blocks.unlinked.lock().unwrap().is_empty());
    assert!(env.coarse.freed.lock().unwrap().is_empty());
    let (vm, frag) = env.engine.classify(IAT_START).unwrap();
    assert!(frag.contains(FragFlags::COARSE_GRAIN), "area kept");
    assert!(vm.contains(VmFlags::PERSISTED_CACHE));

    // Restore to read-executable with identical bytes: the persisted
    // unit remains valid.
    let d = env
        .engine
        .app_memory_protection_change(&ctx, IAT_START, IAT_END - IAT_START, rx(), true);
    assert_eq!(d, ProtDecision::ApplyChange);
    assert!(env.coarse.freed.lock().unwrap().is_empty());
    assert!(env.coarse.reset.lock().unwrap().is_empty());
    let (vm, _) = env.engine.classify(TEXT_START).unwrap();
    assert!(vm.contains(VmFlags::PERSISTED_CACHE));
}

#[test]
fn dirty_rebind_drops_unit() {
    let env = env("");
    let ctx = setup(&env);

    let d = env
        .engine
        .app_memory_protection_change(&ctx, IAT_START, IAT_END - IAT_START, rw(), true);
    assert_eq!(d, ProtDecision::ApplyChange);

    // The loader writes different import targets this time.
    env.mem.write_bytes(IAT_START + 8, &[0xde, 0xad, 0xbe, 0xef]);

    let d = env
        .engine
        .app_memory_protection_change(&ctx, IAT_START, IAT_END - IAT_START, rx(), true);
    assert_eq!(d, ProtDecision::ApplyChange);
    // Stale persisted unit reset and freed, replaced by a fresh one.
    assert!(env.coarse.reset.lock().unwrap().contains(&77));
    assert!(env.coarse.freed.lock().unwrap().contains(&77));
    assert!(!env.coarse.allocated.lock().unwrap().is_empty());
    let (vm, frag) = env.engine.classify(TEXT_START).unwrap();
    assert!(!vm.contains(VmFlags::PERSISTED_CACHE));
    assert!(frag.contains(FragFlags::COARSE_GRAIN), "area stays coarse");
}

#[test]
fn invalid_unit_replaced_on_next_build() {
    let env = env("");
    let ctx = setup(&env);

    // Open the patch window and never restore: the unit is left marked
    // invalid, so the next build query replaces it.
    env.engine
        .app_memory_protection_change(&ctx, IAT_START, IAT_END - IAT_START, rw(), true);
    let mut vmlist = core_engine::BuildRegions::new();
    env.engine
        .check_thread_vm_area(&ctx, TEXT_START, TEXT_START, &mut vmlist, false, true)
        .unwrap();
    assert!(env.coarse.freed.lock().unwrap().contains(&77));
    let (vm, _) = env.engine.classify(TEXT_START).unwrap();
    assert!(!vm.contains(VmFlags::PERSISTED_CACHE));
}
