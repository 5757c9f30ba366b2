//! Vigil entrypoint: replay a memory-event script against the engine.
//!
//! The replayer stands in for the translator and OS observers: it feeds
//! allocation, execution, write-fault, protection-change, and unmap
//! events from a line-oriented script into a freshly constructed engine
//! and prints the resulting catalog and view state. Useful as an
//! end-to-end smoke surface and for reproducing consistency scenarios
//! from the field.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

use core_engine::{
    BlockHandle, BlockOps, BuildRegions, CoarseUnitId, CoarseUnitOps, Collaborators, Engine,
    EngineError, ModuleIndex, OsRegion, PageProtector, ThreadContext,
};
use core_interval::{AppAddr, PageProt};
use core_policy::{InstrSniffer, SniffedInstr};

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "vigil", version, about = "Executable-memory manager replayer")]
struct Args {
    /// Memory-event script to replay.
    pub script: PathBuf,
    /// Optional option-file path (overrides discovery of `vigil.toml`).
    #[arg(long = "config")]
    pub config: Option<PathBuf>,
}

fn configure_logging() -> Result<WorkerGuard> {
    let log_dir = Path::new(".");
    let log_path = log_dir.join("vigil.log");
    if log_path.exists() {
        let _ = std::fs::remove_file(&log_path);
    }
    let file_appender = tracing_appender::rolling::never(log_dir, "vigil.log");
    let (nb_writer, guard) = tracing_appender::non_blocking(file_appender);
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(nb_writer)
        .with_ansi(false)
        .init();
    Ok(guard)
}

fn install_panic_hook() {
    let default = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        error!(target: "runtime", info = %panic_info, "panic");
        default(panic_info);
    }));
}

// ---- replay collaborators ------------------------------------------------

/// Scripted OS memory: regions with protection and sparse byte contents.
#[derive(Default)]
struct ReplayMemory {
    regions: Mutex<Vec<OsRegion>>,
    bytes: Mutex<HashMap<AppAddr, u8>>,
}

impl ReplayMemory {
    fn map(&self, start: AppAddr, end: AppAddr, prot: PageProt) {
        let mut regions = self.regions.lock().unwrap();
        regions.retain(|r| r.end <= start || end <= r.start);
        regions.push(OsRegion { start, end, prot });
        regions.sort_by_key(|r| r.start);
    }

    fn unmap(&self, start: AppAddr, end: AppAddr) {
        self.regions
            .lock()
            .unwrap()
            .retain(|r| r.end <= start || end <= r.start);
    }

    fn poke(&self, addr: AppAddr, data: &[u8]) {
        let mut bytes = self.bytes.lock().unwrap();
        for (i, b) in data.iter().enumerate() {
            bytes.insert(addr + i as u64, *b);
        }
    }
}

impl PageProtector for ReplayMemory {
    fn query(&self, addr: AppAddr) -> Option<OsRegion> {
        self.regions
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.start <= addr && addr < r.end)
            .copied()
    }

    fn protect(&self, start: AppAddr, end: AppAddr, prot: PageProt) -> Result<()> {
        info!(
            target: "replay.os",
            start = format_args!("{start:#x}"),
            end = format_args!("{end:#x}"),
            ?prot,
            "protect"
        );
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

/// The replayer has no real code cache; block operations just log.
struct ReplayBlocks;

impl BlockOps for ReplayBlocks {
    fn unlink_block(&self, block: BlockHandle) {
        info!(target: "replay.cache", block = block.0, "unlink");
    }
    fn free_block(&self, block: BlockHandle) {
        info!(target: "replay.cache", block = block.0, "free");
    }
    fn unlink_incoming(&self, block: BlockHandle) {
        info!(target: "replay.cache", block = block.0, "unlink incoming");
    }
}

#[derive(Default)]
struct ReplayCoarse {
    next: AtomicU64,
}

impl CoarseUnitOps for ReplayCoarse {
    fn alloc(&self, _start: AppAddr, _end: AppAddr) -> CoarseUnitId {
        CoarseUnitId(self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }
    fn free(&self, unit: CoarseUnitId) {
        info!(target: "replay.coarse", unit = unit.0, "free");
    }
    fn reset(&self, unit: CoarseUnitId) {
        info!(target: "replay.coarse", unit = unit.0, "reset");
    }
    fn is_frozen(&self, _unit: CoarseUnitId) -> bool {
        false
    }
    fn is_persisted(&self, _unit: CoarseUnitId) -> bool {
        false
    }
}

/// No module index in the replayer; everything is anonymous memory.
struct ReplayModules;

impl ModuleIndex for ReplayModules {
    fn module_name(&self, _addr: AppAddr) -> Option<String> {
        None
    }
    fn module_bounds(&self, _addr: AppAddr) -> Option<(AppAddr, AppAddr)> {
        None
    }
    fn in_text(&self, _addr: AppAddr) -> bool {
        false
    }
    fn in_any_section(&self, _addr: AppAddr) -> bool {
        false
    }
    fn iat_bounds(&self, _addr: AppAddr) -> Option<(AppAddr, AppAddr)> {
        None
    }
}

struct ReplaySniffer;

impl InstrSniffer for ReplaySniffer {
    fn sniff(&self, _bytes: &[u8], _pc: AppAddr) -> Option<SniffedInstr> {
        None
    }
}

// ---- script replay -------------------------------------------------------

struct Replayer {
    engine: Engine,
    ctx: ThreadContext,
    mem: Arc<ReplayMemory>,
    next_block: u64,
    blocks_by_tag: HashMap<AppAddr, BlockHandle>,
}

fn parse_addr(s: &str) -> Result<AppAddr> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).with_context(|| format!("bad address `{s}`"))
    } else {
        s.parse().with_context(|| format!("bad address `{s}`"))
    }
}

fn parse_prot(s: &str) -> Result<PageProt> {
    let mut prot = PageProt::empty();
    for c in s.chars() {
        match c {
            'r' => prot |= PageProt::READ,
            'w' => prot |= PageProt::WRITE,
            'x' => prot |= PageProt::EXEC,
            '-' => {}
            c => bail!("bad protection flag `{c}`"),
        }
    }
    Ok(prot)
}

impl Replayer {
    fn new(options: core_config::Options) -> Self {
        let mem = Arc::new(ReplayMemory::default());
        let engine = Engine::new(
            options,
            Collaborators {
                protector: mem.clone(),
                coarse: Arc::new(ReplayCoarse::default()),
                blocks: Arc::new(ReplayBlocks),
                modules: Arc::new(ReplayModules),
                sniffer: Arc::new(ReplaySniffer),
            },
        );
        let ctx = engine.attach_thread();
        Self {
            engine,
            ctx,
            mem,
            next_block: 0,
            blocks_by_tag: HashMap::new(),
        }
    }

    fn run_line(&mut self, line_no: usize, line: &str) -> Result<()> {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            return Ok(());
        }
        let words: Vec<&str> = line.split_whitespace().collect();
        let ctx = || format!("line {line_no}: `{line}`");
        match words.as_slice() {
            ["map", start, end, prot] => {
                self.mem
                    .map(parse_addr(start)?, parse_addr(end)?, parse_prot(prot)?);
            }
            ["alloc", base, size, prot, rest @ ..] => {
                let base = parse_addr(base)?;
                let size = parse_addr(size)?;
                let prot = parse_prot(prot)?;
                let is_image = rest.contains(&"image");
                self.mem.map(base, base + size, prot);
                let added = self
                    .engine
                    .app_memory_allocation(&self.ctx, base, size, prot, is_image);
                println!("alloc {base:#x}+{size:#x} catalogued={added}");
            }
            ["exec", pc] => self.exec(parse_addr(pc)?),
            ["write", target, len, "from", tag] => {
                let target = parse_addr(target)?;
                let len = parse_addr(len)?;
                let tag = parse_addr(tag)?;
                let block = self.blocks_by_tag.get(&tag).copied();
                let resume = self
                    .engine
                    .handle_modified_code(&self.ctx, 0, tag, target, len, block);
                println!("write fault at {target:#x} handled, resume={resume:x?}");
            }
            ["poke", addr, byte] => {
                let b = u8::try_from(parse_addr(byte)?).context("byte out of range")?;
                self.mem.poke(parse_addr(addr)?, &[b]);
            }
            ["prot", base, size, prot, rest @ ..] => {
                let base = parse_addr(base)?;
                let size = parse_addr(size)?;
                let new_prot = parse_prot(prot)?;
                let is_image = rest.contains(&"image");
                let decision = self.engine.app_memory_protection_change(
                    &self.ctx, base, size, new_prot, is_image,
                );
                println!("prot {base:#x}+{size:#x} -> {decision:?}");
                if decision == core_engine::ProtDecision::ApplyChange {
                    let _ = self.mem.protect(base, base + size, new_prot);
                }
            }
            ["dealloc", base, size] => {
                let base = parse_addr(base)?;
                let size = parse_addr(size)?;
                self.engine
                    .app_memory_deallocation(&self.ctx, base, size, false);
                self.mem.unmap(base, base + size);
            }
            ["flushicache", base, size] => {
                self.engine
                    .app_memory_flush(&self.ctx, parse_addr(base)?, parse_addr(size)?);
            }
            ["safepoint"] => {
                let freed = self.engine.thread_safe_point(&self.ctx);
                println!("safepoint: {freed} blocks freed");
            }
            ["dump"] => print!("{}", self.engine.dump()),
            _ => bail!("unrecognized event at {}", ctx()),
        }
        Ok(())
    }

    fn exec(&mut self, pc: AppAddr) {
        let mut vmlist = BuildRegions::new();
        match self
            .engine
            .check_thread_vm_area(&self.ctx, pc, pc, &mut vmlist, false, true)
        {
            Ok(ok) => {
                self.next_block += 1;
                let handle = BlockHandle(self.next_block);
                match self
                    .engine
                    .vm_area_add_fragment(&self.ctx, handle, pc, false, &vmlist)
                {
                    Ok(()) => {
                        self.blocks_by_tag.insert(pc, handle);
                        println!(
                            "exec {pc:#x}: block {} built, stop={:#x}, flags={:?}",
                            handle.0, ok.stop_pc, ok.frag_flags
                        );
                    }
                    Err(e) => println!("exec {pc:#x}: commit failed: {e}"),
                }
            }
            Err(EngineError::Denied(v)) => {
                warn!(target: "replay", pc = format_args!("{pc:#x}"), %v, "origin denied");
                println!("exec {pc:#x}: DENIED {v} -> {:?}", v.action);
            }
            Err(e) => println!("exec {pc:#x}: {e}"),
        }
    }
}

fn main() -> Result<()> {
    let _log_guard = configure_logging()?;
    install_panic_hook();
    let args = Args::parse();

    let options = core_config::load_from(args.config.clone())?;
    info!(
        target: "runtime",
        script = %args.script.display(),
        config_override = args.config.is_some(),
        "startup"
    );

    let script = std::fs::read_to_string(&args.script)
        .with_context(|| format!("reading {}", args.script.display()))?;
    let mut replayer = Replayer::new(options);
    for (i, line) in script.lines().enumerate() {
        replayer.run_line(i + 1, line)?;
    }

    println!("--- final state ---");
    print!("{}", replayer.engine.dump());
    println!(
        "flushtime={} threads={}",
        replayer.engine.flushtime(),
        replayer.engine.thread_count()
    );
    Ok(())
}
