#![allow(dead_code)] // Shared across the scenario tests; each binary uses a subset.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use core_engine::{
    BlockHandle, BlockOps, CoarseUnitId, CoarseUnitOps, Collaborators, Engine, ModuleIndex,
    OsRegion, PageProtector,
};
use core_interval::{AppAddr, PageProt};
use core_policy::{InstrSniffer, SniffedInstr};

pub const RWX: PageProt = PageProt::all();

pub fn rx() -> PageProt {
    PageProt::READ | PageProt::EXEC
}

pub fn rw() -> PageProt {
    PageProt::READ | PageProt::WRITE
}

/// Fake OS memory: regions with protection, sparse byte contents, and a
/// record of every protection call the engine makes.
#[derive(Default)]
pub struct FakeMemory {
    regions: Mutex<Vec<OsRegion>>,
    bytes: Mutex<HashMap<AppAddr, u8>>,
    pub protect_calls: Mutex<Vec<(AppAddr, AppAddr, PageProt)>>,
}

impl FakeMemory {
    pub fn map(&self, start: AppAddr, end: AppAddr, prot: PageProt) {
        let mut regions = self.regions.lock().unwrap();
        regions.push(OsRegion { start, end, prot });
        regions.sort_by_key(|r| r.start);
    }

    pub fn write_bytes(&self, addr: AppAddr, data: &[u8]) {
        let mut bytes = self.bytes.lock().unwrap();
        for (i, b) in data.iter().enumerate() {
            bytes.insert(addr + i as u64, *b);
        }
    }

    pub fn current_prot(&self, addr: AppAddr) -> Option<PageProt> {
        self.query(addr).map(|r| r.prot)
    }
}

impl PageProtector for FakeMemory {
    fn query(&self, addr: AppAddr) -> Option<OsRegion> {
        self.regions
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.start <= addr && addr < r.end)
            .copied()
    }

    fn protect(&self, start: AppAddr, end: AppAddr, prot: PageProt) -> anyhow::Result<()> {
        self.protect_calls.lock().unwrap().push((start, end, prot));
        let mut regions = self.regions.lock().unwrap();
        let mut next = Vec::new();
        for r in regions.drain(..) {
            if r.end <= start || end <= r.start {
                next.push(r);
                continue;
            }
            if r.start < start {
                next.push(OsRegion {
                    start: r.start,
                    end: start,
                    prot: r.prot,
                });
            }
            next.push(OsRegion {
                start: r.start.max(start),
                end: r.end.min(end),
                prot,
            });
            if r.end > end {
                next.push(OsRegion {
                    start: end,
                    end: r.end,
                    prot: r.prot,
                });
            }
        }
        next.sort_by_key(|r| r.start);
        *regions = next;
        Ok(())
    }

    fn read_memory(&self, addr: AppAddr, len: usize) -> Option<Vec<u8>> {
        let regions = self.regions.lock().unwrap();
        if !regions
            .iter()
            .any(|r| r.start <= addr && addr + len as u64 <= r.end)
        {
            return None;
        }
        let bytes = self.bytes.lock().unwrap();
        Some(
            (0..len as u64)
                .map(|i| bytes.get(&(addr + i)).copied().unwrap_or(0x90))
                .collect(),
        )
    }
}

/// Records every block operation the engine requests.
#[derive(Default)]
pub struct FakeBlocks {
    pub unlinked: Mutex<Vec<u64>>,
    pub freed: Mutex<Vec<u64>>,
    pub incoming_unlinked: Mutex<Vec<u64>>,
}

impl BlockOps for FakeBlocks {
    fn unlink_block(&self, block: BlockHandle) {
        self.unlinked.lock().unwrap().push(block.0);
    }
    fn free_block(&self, block: BlockHandle) {
        self.freed.lock().unwrap().push(block.0);
    }
    fn unlink_incoming(&self, block: BlockHandle) {
        self.incoming_unlinked.lock().unwrap().push(block.0);
    }
}

/// Allocates unit ids and records frees and resets.
#[derive(Default)]
pub struct FakeCoarse {
    next: AtomicU64,
    pub allocated: Mutex<Vec<u64>>,
    pub freed: Mutex<Vec<u64>>,
    pub reset: Mutex<Vec<u64>>,
}

impl CoarseUnitOps for FakeCoarse {
    fn alloc(&self, _start: AppAddr, _end: AppAddr) -> CoarseUnitId {
        let id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        self.allocated.lock().unwrap().push(id);
        CoarseUnitId(id)
    }
    fn free(&self, unit: CoarseUnitId) {
        self.freed.lock().unwrap().push(unit.0);
    }
    fn reset(&self, unit: CoarseUnitId) {
        self.reset.lock().unwrap().push(unit.0);
    }
    fn is_frozen(&self, _unit: CoarseUnitId) -> bool {
        false
    }
    fn is_persisted(&self, _unit: CoarseUnitId) -> bool {
        false
    }
}

/// Module layout described by plain range lists.
#[derive(Default)]
pub struct FakeModules {
    pub texts: Mutex<Vec<(AppAddr, AppAddr, String)>>,
    pub sections: Mutex<Vec<(AppAddr, AppAddr)>>,
    pub iats: Mutex<Vec<(AppAddr, AppAddr)>>,
    pub stacks: Mutex<Vec<(AppAddr, AppAddr)>>,
}

impl FakeModules {
    pub fn add_text(&self, start: AppAddr, end: AppAddr, name: &str) {
        self.texts.lock().unwrap().push((start, end, name.into()));
        self.sections.lock().unwrap().push((start, end));
    }

    pub fn add_stack(&self, start: AppAddr, end: AppAddr) {
        self.stacks.lock().unwrap().push((start, end));
    }
}

impl ModuleIndex for FakeModules {
    fn module_name(&self, addr: AppAddr) -> Option<String> {
        self.texts
            .lock()
            .unwrap()
            .iter()
            .find(|(s, e, _)| *s <= addr && addr < *e)
            .map(|(_, _, n)| n.clone())
    }
    fn module_bounds(&self, addr: AppAddr) -> Option<(AppAddr, AppAddr)> {
        self.sections
            .lock()
            .unwrap()
            .iter()
            .find(|(s, e)| *s <= addr && addr < *e)
            .copied()
    }
    fn in_text(&self, addr: AppAddr) -> bool {
        self.texts
            .lock()
            .unwrap()
            .iter()
            .any(|(s, e, _)| *s <= addr && addr < *e)
    }
    fn in_any_section(&self, addr: AppAddr) -> bool {
        self.sections
            .lock()
            .unwrap()
            .iter()
            .any(|(s, e)| *s <= addr && addr < *e)
    }
    fn iat_bounds(&self, addr: AppAddr) -> Option<(AppAddr, AppAddr)> {
        self.iats
            .lock()
            .unwrap()
            .iter()
            .find(|(s, e)| *s <= addr && addr < *e)
            .copied()
    }
    fn on_thread_stack(&self, addr: AppAddr) -> bool {
        self.stacks
            .lock()
            .unwrap()
            .iter()
            .any(|(s, e)| *s <= addr && addr < *e)
    }
}

/// Decoder that never matches; the trampoline templates stay cold.
pub struct NullSniffer;

impl InstrSniffer for NullSniffer {
    fn sniff(&self, _bytes: &[u8], _pc: AppAddr) -> Option<SniffedInstr> {
        None
    }
}

pub struct TestEnv {
    pub engine: Engine,
    pub mem: Arc<FakeMemory>,
    pub blocks: Arc<FakeBlocks>,
    pub coarse: Arc<FakeCoarse>,
    pub modules: Arc<FakeModules>,
}

/// Build an engine over the fakes with options parsed from `toml_src`.
pub fn env(toml_src: &str) -> TestEnv {
    let file: core_config::OptionsFile = toml::from_str(toml_src).expect("test options parse");
    let mut options = core_config::Options { raw: None, file };
    options.apply();

    let mem = Arc::new(FakeMemory::default());
    let blocks = Arc::new(FakeBlocks::default());
    let coarse = Arc::new(FakeCoarse::default());
    let modules = Arc::new(FakeModules::default());
    let engine = Engine::new(
        options,
        Collaborators {
            protector: mem.clone(),
            coarse: coarse.clone(),
            blocks: blocks.clone(),
            modules: modules.clone(),
            sniffer: Arc::new(NullSniffer),
        },
    );
    TestEnv {
        engine,
        mem,
        blocks,
        coarse,
        modules,
    }
}
