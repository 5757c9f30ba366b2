//! Executable-memory manager core.
//!
//! Tracks every range of application memory from which translated code
//! has been or may be generated and enforces cache consistency with the
//! underlying pages: detecting, preventing, or sandboxing every mutation
//! of source bytes and flushing exactly the affected cached code.
//!
//! There is no global state: an [`Engine`] value owns the executable
//! catalog, the shared view, the flush lists, the auxiliary vectors, and
//! the policy gate; observing threads attach for a [`ThreadContext`]
//! carrying their private view and flush watermark. All collaborator
//! concerns (page protection syscalls, coarse unit storage, block
//! unlinking, module queries, instruction decoding) come in through the
//! traits in [`collab`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use core_config::Options;
use core_interval::{AppAddr, FragFlags, PageProt, VectorError, VmFlags};
use core_policy::{InstrSniffer, OriginDecision, OriginQuery, OriginRequest, PolicyGate, Violation};
use thiserror::Error;
use tracing::{debug, info, trace};

pub mod auxiliary;
pub mod catalog;
pub mod coarse;
pub mod collab;
mod fault;
pub mod flush;
pub mod fragment;
pub mod locks;
pub mod stats;
pub mod views;

pub use auxiliary::AuxVectors;
pub use catalog::{ExecCatalog, ExecPayload, WrittenCounts};
pub use coarse::{CoarseHandle, CoarseUnit};
pub use collab::{
    BlockHandle, BlockOps, CoarseUnitId, CoarseUnitOps, ModuleIndex, OsRegion, PageProtector,
    ProtDecision,
};
pub use flush::FlushState;
pub use locks::{LockRank, RankedMutex, RankedRwLock};
pub use views::View;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Vector(#[from] VectorError),
    /// The policy gate refused the region; the translator unwinds the
    /// partial build and enforces the carried action.
    #[error(transparent)]
    Denied(#[from] Violation),
    /// Decoding reached unmapped memory; the embedder forges an
    /// execution-from-unreadable exception to the app.
    #[error("unreadable code at {addr:#x} (xfer: {xfer})")]
    UnreadableCode { addr: AppAddr, xfer: bool },
    #[error("fragment index rejected the block")]
    FragmentIndex,
}

/// External capabilities handed to the engine at construction.
pub struct Collaborators {
    pub protector: Arc<dyn PageProtector>,
    pub coarse: Arc<dyn CoarseUnitOps>,
    pub blocks: Arc<dyn BlockOps>,
    pub modules: Arc<dyn ModuleIndex>,
    pub sniffer: Arc<dyn InstrSniffer>,
}

/// Per-thread engine state. Shared with the registry so flush
/// acknowledgement can see every live watermark.
pub struct ThreadData {
    pub(crate) id: u32,
    pub(crate) view: RankedRwLock<View>,
    pub(crate) last_seen_flushtime: AtomicU64,
}

/// Handle held by one observing thread.
pub struct ThreadContext {
    pub(crate) data: Arc<ThreadData>,
}

impl ThreadContext {
    pub fn id(&self) -> u32 {
        self.data.id
    }

    pub fn last_seen_flushtime(&self) -> u64 {
        self.data.last_seen_flushtime.load(Ordering::Acquire)
    }
}

/// Accumulates the area memberships of a block under construction: one
/// entry per source area, tracking the pc range actually covered.
#[derive(Debug, Default)]
pub struct BuildRegions {
    entries: Vec<BuildEntry>,
}

#[derive(Debug, Clone, Copy)]
struct BuildEntry {
    area_start: AppAddr,
    area_end: AppAddr,
    pc_min: AppAddr,
    pc_max: AppAddr,
}

impl BuildRegions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn note(&mut self, area_start: AppAddr, area_end: AppAddr, pc: AppAddr) {
        self.note_range(area_start, area_end, pc, pc + 1);
    }

    fn note_range(
        &mut self,
        area_start: AppAddr,
        area_end: AppAddr,
        pc_min: AppAddr,
        pc_max: AppAddr,
    ) {
        debug_assert!(area_start <= pc_min && pc_min < area_end);
        if let Some(e) = self
            .entries
            .iter_mut()
            .find(|e| e.area_start == area_start)
        {
            e.pc_min = e.pc_min.min(pc_min);
            e.pc_max = e.pc_max.max(pc_max);
            return;
        }
        self.entries.push(BuildEntry {
            area_start,
            area_end,
            pc_min,
            pc_max,
        });
    }

    /// Per-area source pc ranges, as stored on the fragment nodes.
    fn regions(&self) -> Vec<(AppAddr, AppAddr)> {
        self.entries.iter().map(|e| (e.pc_min, e.pc_max)).collect()
    }

    fn area_starts(&self) -> impl Iterator<Item = AppAddr> + '_ {
        self.entries.iter().map(|e| e.area_start)
    }
}

/// Result of a successful build-time area check.
#[derive(Debug, Clone, Copy)]
pub struct CheckOk {
    pub area_start: AppAddr,
    pub area_end: AppAddr,
    /// Translation must stop at this address (area boundary).
    pub stop_pc: AppAddr,
    /// Flags the caller accrues onto the block under construction.
    pub frag_flags: FragFlags,
}

pub struct Engine {
    pub(crate) options: Arc<Options>,
    pub(crate) gate: PolicyGate,
    pub(crate) catalog: RankedRwLock<ExecCatalog>,
    pub(crate) shared_view: RankedRwLock<View>,
    pub(crate) flush: FlushState,
    pub(crate) aux: AuxVectors,
    pub(crate) threads: RankedMutex<Vec<Arc<ThreadData>>>,
    pub(crate) protector: Arc<dyn PageProtector>,
    pub(crate) coarse_ops: Arc<dyn CoarseUnitOps>,
    pub(crate) block_ops: Arc<dyn BlockOps>,
    pub(crate) modules: Arc<dyn ModuleIndex>,
    /// Single-slot record of the most recently unmapped module.
    pub(crate) last_unload: std::sync::Mutex<Option<(AppAddr, AppAddr)>>,
    next_thread_id: AtomicU32,
}

/// Forwards the gate's environment queries onto the module collaborator.
pub(crate) struct ModuleQueryAdapter<'a> {
    pub(crate) modules: &'a dyn ModuleIndex,
}

impl OriginQuery for ModuleQueryAdapter<'_> {
    fn module_name(&self, addr: AppAddr) -> Option<String> {
        self.modules.module_name(addr)
    }
    fn in_module_text(&self, addr: AppAddr) -> bool {
        self.modules.in_text(addr)
    }
    fn in_module(&self, addr: AppAddr) -> bool {
        self.modules.in_any_section(addr)
    }
    fn is_vsyscall(&self, addr: AppAddr) -> bool {
        self.modules.is_vsyscall(addr)
    }
    fn on_thread_stack(&self, addr: AppAddr) -> bool {
        self.modules.on_thread_stack(addr)
    }
    fn is_driver_address(&self, addr: AppAddr) -> bool {
        self.modules.is_driver_address(addr)
    }
}

impl Engine {
    pub fn new(options: Options, collab: Collaborators) -> Self {
        let options = Arc::new(options);
        let gate = PolicyGate::new(options.clone(), collab.sniffer);
        let page_size = options.page_size();
        let initial = options.file.thresholds.vmarea_initial_size as usize;
        let increment = options.file.thresholds.vmarea_increment_size as usize;
        let mut catalog = ExecCatalog::new(page_size);
        catalog.vector.reserve_policy(initial, increment);
        let mut shared_view = View::new("shared-view", true);
        shared_view.vector.reserve_policy(initial, increment);
        info!(target: "engine", page_size, "engine constructed");
        Self {
            options,
            gate,
            catalog: RankedRwLock::new(LockRank::ExecutableAreas, catalog),
            shared_view: RankedRwLock::new(LockRank::SharedViewAreas, shared_view),
            flush: FlushState::new(),
            aux: AuxVectors::new(),
            threads: RankedMutex::new(LockRank::ThreadInitExit, Vec::new()),
            protector: collab.protector,
            coarse_ops: collab.coarse,
            block_ops: collab.blocks,
            modules: collab.modules,
            last_unload: std::sync::Mutex::new(None),
            next_thread_id: AtomicU32::new(0),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn gate(&self) -> &PolicyGate {
        &self.gate
    }

    pub fn aux(&self) -> &AuxVectors {
        &self.aux
    }

    pub fn flushtime(&self) -> u64 {
        self.flush.flushtime()
    }

    pub(crate) fn page_size(&self) -> u64 {
        self.options.page_size()
    }

    pub(crate) fn page_start(&self, addr: AppAddr) -> AppAddr {
        addr & !(self.page_size() - 1)
    }

    pub(crate) fn page_end_inclusive(&self, addr: AppAddr) -> AppAddr {
        self.page_start(addr) + self.page_size()
    }

    // ---- thread lifecycle --------------------------------------------

    pub fn attach_thread(&self) -> ThreadContext {
        let id = self.next_thread_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut threads = self.threads.lock();
        let mut view = View::new("thread-view", false);
        view.vector.reserve_policy(
            self.options.file.thresholds.vmarea_initial_size as usize,
            self.options.file.thresholds.vmarea_increment_size as usize,
        );
        let data = Arc::new(ThreadData {
            id,
            view: RankedRwLock::new(LockRank::ThreadViewAreas, view),
            last_seen_flushtime: AtomicU64::new(self.flush.flushtime()),
        });
        threads.push(data.clone());
        debug!(target: "engine", thread = id, "thread attached");
        ThreadContext { data }
    }

    /// Detach a thread: acknowledge outstanding flushes on its behalf and
    /// free its private blocks.
    pub fn detach_thread(&self, ctx: ThreadContext) {
        self.flush
            .thread_check_flushtime(&ctx.data.last_seen_flushtime, &*self.block_ops);
        let drained = ctx.data.view.write().drain_region(0, AppAddr::MAX);
        for b in drained {
            self.block_ops.unlink_block(b);
            self.block_ops.free_block(b);
        }
        let mut threads = self.threads.lock();
        threads.retain(|t| t.id != ctx.data.id);
        debug!(target: "engine", thread = ctx.data.id, "thread detached");
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Safe-point hook between cache exits: acknowledge pending flushes
    /// and promote the lazy list when it is over budget. Returns blocks
    /// freed by this call.
    pub fn thread_safe_point(&self, ctx: &ThreadContext) -> usize {
        let freed = self
            .flush
            .thread_check_flushtime(&ctx.data.last_seen_flushtime, &*self.block_ops);
        let max = self.options.file.thresholds.lazy_deletion_max_pending as usize;
        self.flush
            .maybe_promote_lazy(max, self.thread_count() as u32);
        freed
    }

    // ---- translator API ----------------------------------------------

    /// Called before translating each piece of a block: is execution from
    /// `pc` permitted, and where must translation stop? Accumulates the
    /// area membership in `vmlist`. A brand-new region consults the
    /// policy gate and is classified into the catalog.
    pub fn check_thread_vm_area(
        &self,
        ctx: &ThreadContext,
        pc: AppAddr,
        tag: AppAddr,
        vmlist: &mut BuildRegions,
        shared: bool,
        is_xfer: bool,
    ) -> Result<CheckOk, EngineError> {
        // Fast path: the requesting view already holds the area.
        {
            let view = if shared {
                self.shared_view.read()
            } else {
                ctx.data.view.read()
            };
            if let Some((s, e, _vm, frag)) = view.lookup_bounds(pc) {
                drop(view);
                vmlist.note(s, e, pc);
                return Ok(CheckOk {
                    area_start: s,
                    area_end: e,
                    stop_pc: e,
                    frag_flags: frag,
                });
            }
        }

        let (a_start, a_end, a_vm, a_frag, copy_to_shared) =
            self.consult_catalog(ctx.data.id, pc, tag, is_xfer)?;

        // The shared-view copy deferred from catalog insert time runs
        // here, outside the catalog lock, to respect the lock order.
        if copy_to_shared {
            self.shared_view
                .write()
                .ensure_area(a_start, a_end, a_vm, a_frag);
        }
        {
            let mut view = if shared {
                self.shared_view.write()
            } else {
                ctx.data.view.write()
            };
            view.ensure_area(a_start, a_end, a_vm, a_frag);
            view.note_decode_page(self.page_start(pc));
        }
        vmlist.note(a_start, a_end, pc);
        Ok(CheckOk {
            area_start: a_start,
            area_end: a_end,
            stop_pc: a_end,
            frag_flags: a_frag
                & (FragFlags::SELFMOD_SANDBOXED | FragFlags::COARSE_GRAIN | FragFlags::DYNGEN),
        })
    }

    /// Catalog half of the build-time check: find or admit the area
    /// containing `pc` and perform the first-build lazy work.
    fn consult_catalog(
        &self,
        thread: u32,
        pc: AppAddr,
        tag: AppAddr,
        is_xfer: bool,
    ) -> Result<(AppAddr, AppAddr, VmFlags, FragFlags, bool), EngineError> {
        let mut cat = self.catalog.write();
        // Pattern-matched trampoline bytes are re-verified on every fresh
        // encounter; stale bytes evict the area and re-judge from scratch.
        if let Some(area) = cat.lookup(pc)
            && area.vm_flags.contains(VmFlags::PATTERN_REVERIFY)
        {
            let (s, e) = (area.start, area.end);
            let bytes = self
                .protector
                .read_memory(s, (e - s).min(16) as usize)
                .unwrap_or_default();
            let still = {
                let known = |addr: AppAddr| cat.lookup(addr).is_some();
                self.gate.reverify_pattern(&bytes, s, &known)
            };
            if !still {
                debug!(
                    target: "engine",
                    start = format_args!("{s:#x}"),
                    "trampoline bytes changed, re-judging region"
                );
                cat.remove_region(s, e, None, &*self.coarse_ops);
            }
        }
        if let Some(area) = cat.lookup_mut(pc) {
            let copy_to_shared = area
                .vm_flags
                .contains(VmFlags::ADD_TO_SHARED_ON_FIRST_QUERY);
            area.vm_flags
                .remove(VmFlags::ADD_TO_SHARED_ON_FIRST_QUERY);
            area.vm_flags.insert(VmFlags::EXECUTED_FROM);
            // A coarse unit left invalid by a dirty rebind is replaced
            // before any new code is built over it.
            if let Some(ref mut handle) = area.data.coarse
                && handle.any_code_invalid()
            {
                let (us, ue) = (handle.primary.start, handle.primary.end);
                handle.drop_and_replace(&*self.coarse_ops, us, ue);
                area.vm_flags.remove(VmFlags::PERSISTED_CACHE);
            }
            return Ok((
                area.start,
                area.end,
                area.vm_flags,
                area.frag_flags,
                copy_to_shared,
            ));
        }

        // Brand-new region: the policy gate decides admission.
        let Some(region) = self.protector.query(pc) else {
            return Err(EngineError::UnreadableCode {
                addr: pc,
                xfer: is_xfer,
            });
        };
        let bytes = self.protector.read_memory(pc, 16).unwrap_or_default();
        let req = OriginRequest {
            target: pc,
            source_pc: tag,
            region_start: region.start,
            region_end: region.end,
            prot: region.prot,
            target_bytes: &bytes,
            thread: Some(thread),
        };
        let adapter = ModuleQueryAdapter {
            modules: self.modules.as_ref(),
        };
        let decision = {
            let known = |addr: AppAddr| cat.lookup(addr).is_some();
            self.gate.check_origin(&req, &adapter, &known)
        };
        let admitted = match decision {
            OriginDecision::Deny(v) => return Err(EngineError::Denied(v)),
            OriginDecision::Admit(a) => a,
        };
        let mut vm = admitted.vm_flags;
        let mut frag = admitted.frag_flags;
        if vm.contains(VmFlags::WRITABLE) && !frag.contains(FragFlags::SELFMOD_SANDBOXED) {
            // Writable code: either sandbox straight away (the page has
            // crossed the write threshold before) or defer the read-only
            // downgrade to the first build commit.
            if cat.written_count(pc) >= self.options.file.thresholds.ro2sandbox {
                frag.insert(FragFlags::SELFMOD_SANDBOXED);
                stats::SANDBOX_CONVERSIONS.fetch_add(1, Ordering::Relaxed);
            } else {
                vm.insert(VmFlags::DELAY_READ_ONLY);
            }
        }
        cat.add_region(admitted.start, admitted.end, vm, frag, &*self.coarse_ops, None)?;
        let area = cat.lookup_mut(pc).expect("area admitted above");
        area.vm_flags.insert(VmFlags::EXECUTED_FROM);
        trace!(
            target: "engine",
            pc = format_args!("{pc:#x}"),
            reason = admitted.reason,
            "new region admitted and catalogued"
        );
        Ok((area.start, area.end, area.vm_flags, area.frag_flags, false))
    }

    /// Commit a built block into the fragment index, then run the
    /// commit-time consistency work: first build from a delayed
    /// read-only area downgrades the pages, and coarse areas are handed
    /// their writable unit.
    pub fn vm_area_add_fragment(
        &self,
        ctx: &ThreadContext,
        handle: BlockHandle,
        tag: AppAddr,
        shared: bool,
        vmlist: &BuildRegions,
    ) -> Result<(), EngineError> {
        let regions = vmlist.regions();
        {
            let mut view = if shared {
                self.shared_view.write()
            } else {
                ctx.data.view.write()
            };
            if !view.add_block(handle, tag, &regions) {
                return Err(EngineError::FragmentIndex);
            }
        }

        let mut to_protect: Vec<(AppAddr, AppAddr)> = Vec::new();
        {
            let mut cat = self.catalog.write();
            for s in vmlist.area_starts() {
                let Some(area) = cat.lookup_mut(s) else {
                    continue;
                };
                area.vm_flags.insert(VmFlags::EXECUTED_FROM);
                if area.vm_flags.contains(VmFlags::DELAY_READ_ONLY)
                    && !area.frag_flags.contains(FragFlags::SELFMOD_SANDBOXED)
                {
                    area.vm_flags.remove(VmFlags::DELAY_READ_ONLY);
                    area.vm_flags.insert(VmFlags::MADE_READ_ONLY);
                    to_protect.push((area.start, area.end));
                }
                if area.frag_flags.contains(FragFlags::COARSE_GRAIN)
                    && let Some(ref mut h) = area.data.coarse
                {
                    let _ = h.writable_unit(&*self.coarse_ops);
                }
            }
        }
        for (s, e) in to_protect {
            let ps = self.page_start(s);
            let pe = self.page_end_inclusive(e - 1);
            let _ = self
                .protector
                .protect(ps, pe, PageProt::READ | PageProt::EXEC);
            stats::RO_DOWNGRADES.fetch_add(1, Ordering::Relaxed);
            debug!(
                target: "engine",
                start = format_args!("{ps:#x}"),
                end = format_args!("{pe:#x}"),
                "delayed read-only downgrade applied"
            );
        }
        Ok(())
    }

    /// Withdraw a block from the fragment index (failed build or block
    /// retirement). Shared blocks removed outside a region flush take the
    /// lazy deletion path.
    pub fn vm_area_remove_fragment(&self, ctx: &ThreadContext, handle: BlockHandle) -> bool {
        if ctx.data.view.write().remove_block(handle) {
            return true;
        }
        if self.shared_view.write().remove_block(handle) {
            self.flush.lazy_add(handle, &*self.block_ops);
            let max = self.options.file.thresholds.lazy_deletion_max_pending as usize;
            self.flush
                .maybe_promote_lazy(max, self.thread_count() as u32);
            return true;
        }
        false
    }

    /// Seed a trace's area membership from the block it extends.
    pub fn vm_area_add_to_list(
        &self,
        ctx: &ThreadContext,
        _tag: AppAddr,
        vmlist: &mut BuildRegions,
        base_block: BlockHandle,
        shared: bool,
    ) -> bool {
        let view = if shared {
            self.shared_view.read()
        } else {
            ctx.data.view.read()
        };
        let Some((_base_tag, regions)) = view.block_regions(base_block) else {
            return false;
        };
        for (s, e) in regions {
            let Some((a_s, a_e, _, _)) = view.lookup_bounds(s) else {
                return false;
            };
            vmlist.note_range(a_s, a_e, s, e);
        }
        true
    }

    /// Retire the private block tagged `pc` without flushing its cache
    /// storage: incoming links are detached and the index entry removed.
    pub fn vm_area_unlink_incoming(&self, ctx: &ThreadContext, pc: AppAddr) -> bool {
        let mut view = ctx.data.view.write();
        let Some(handle) = view.arena().find_by_tag(pc) else {
            return false;
        };
        self.block_ops.unlink_incoming(handle);
        view.remove_block(handle)
    }

    /// Relocate a block between the thread and shared views when its
    /// sharedness was misjudged at build time. Both view locks are held
    /// across the move; destination areas missing from the target view
    /// are re-synthesised from the catalog.
    pub fn vm_area_migrate_fragment(
        &self,
        ctx: &ThreadContext,
        handle: BlockHandle,
        to_shared: bool,
    ) -> bool {
        let mut thread_view = ctx.data.view.write();
        let mut shared_view = self.shared_view.write();
        let (src, dst): (&mut View, &mut View) = if to_shared {
            (&mut thread_view, &mut shared_view)
        } else {
            (&mut shared_view, &mut thread_view)
        };
        views::migrate_block(src, dst, handle, |addr| {
            self.catalog
                .read()
                .lookup(addr)
                .map(|a| (a.start, a.end, a.vm_flags, a.frag_flags))
        })
    }

    // ---- flush entry points ------------------------------------------

    /// Flush all cached code sourced from `[start, end)`: two-phase for
    /// the shared view, immediate for the triggering thread's private
    /// view.
    pub(crate) fn flush_region(&self, ctx: Option<&ThreadContext>, start: AppAddr, end: AppAddr) {
        let threads = self.thread_count() as u32;
        let _ = self.flush.flush_shared_start(
            &self.shared_view,
            start,
            end,
            threads,
            &*self.block_ops,
        );
        if let Some(ctx) = ctx {
            let drained = ctx.data.view.write().drain_region(start, end);
            if !drained.is_empty() {
                for b in drained {
                    self.block_ops.unlink_block(b);
                    self.block_ops.free_block(b);
                }
                stats::FLUSHES_PRIVATE.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Heavyweight flush for module unload and engine reset: the caller
    /// has quiesced every observed thread; delete everything in one pass
    /// without reference counts.
    pub fn flush_all_synched(&self, start: AppAddr, end: AppAddr) {
        let thread_views: Vec<Arc<ThreadData>> = self.threads.lock().clone();
        for t in thread_views {
            let drained = t.view.write().drain_region(start, end);
            for b in drained {
                self.block_ops.unlink_block(b);
                self.block_ops.free_block(b);
            }
        }
        {
            let mut view = self.shared_view.write();
            let drained = view.drain_region(start, end);
            for b in drained {
                self.block_ops.unlink_block(b);
                self.block_ops.free_block(b);
            }
        }
        self.flush.flush_all_synched(&*self.block_ops);
        info!(
            target: "flush",
            start = format_args!("{start:#x}"),
            end = format_args!("{end:#x}"),
            "allsynched flush"
        );
    }

    /// Has the pending-deletion churn crossed the every-Nth-pending reset
    /// threshold? The embedder quiesces threads and calls [`Engine::reset`]
    /// when convenient.
    pub fn reset_recommended(&self) -> bool {
        let every = self.options.file.thresholds.reset_every_nth_pending;
        every > 0 && self.flush.entries_since_reset() >= every as u64
    }

    /// Full reset: allsynched flush of everything plus catalog teardown.
    pub fn reset(&self) {
        self.flush_all_synched(0, AppAddr::MAX);
        let mut cat = self.catalog.write();
        let coarse_ops = &*self.coarse_ops;
        loop {
            let Some((s, e)) = cat.vector.iter().next().map(|a| (a.start, a.end)) else {
                break;
            };
            cat.remove_region(s, e, Some(&*self.protector), coarse_ops);
        }
        self.flush.note_reset();
    }

    /// Declare a module range as coarse-grain, optionally adopting a unit
    /// the coarse collaborator loaded from a persisted file.
    pub fn declare_coarse_region(
        &self,
        start: AppAddr,
        end: AppAddr,
        persisted: Option<CoarseUnitId>,
    ) -> Result<(), EngineError> {
        let mut cat = self.catalog.write();
        cat.add_region(
            start,
            end,
            VmFlags::UNMODIFIED_IMAGE,
            FragFlags::COARSE_GRAIN,
            &*self.coarse_ops,
            persisted,
        )?;
        info!(
            target: "engine",
            start = format_args!("{start:#x}"),
            end = format_args!("{end:#x}"),
            persisted = persisted.is_some(),
            "coarse region declared"
        );
        Ok(())
    }

    // ---- introspection ----------------------------------------------

    /// The consistency classification of `addr`, if catalogued.
    pub fn classify(&self, addr: AppAddr) -> Option<(VmFlags, FragFlags)> {
        self.catalog
            .read()
            .lookup(addr)
            .map(|a| (a.vm_flags, a.frag_flags))
    }

    /// Catalog contents as `(start, end, vm, frag)` tuples.
    pub fn catalog_snapshot(&self) -> Vec<(AppAddr, AppAddr, VmFlags, FragFlags)> {
        self.catalog
            .read()
            .vector
            .iter()
            .map(|a| (a.start, a.end, a.vm_flags, a.frag_flags))
            .collect()
    }


    /// Human-readable dump of the catalog and both view layers.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.catalog.read().vector.dump());
        out.push_str(&self.shared_view.read().vector.dump());
        for t in self.threads.lock().iter() {
            out.push_str(&t.view.read().vector.dump());
        }
        out
    }

    /// Debug invariants across the catalog and every view.
    pub fn check_invariants(&self) -> bool {
        self.catalog.read().vector.is_sorted_disjoint()
            && self.shared_view.read().check_invariants()
            && self
                .threads
                .lock()
                .iter()
                .all(|t| t.view.read().check_invariants())
    }
}
