//! Write-fault and protection-change handling.
//!
//! A write fault against code we protected read-only either converts the
//! target pages to the self-modifying sandbox (the writer's own source
//! overlaps the target) or carves the target pages out of the catalog
//! (ordinary data writes into a partly-code region). Intercepted
//! protection-change syscalls are classified before dispatch: the engine
//! never leaves a range both executable and writable, stashes
//! import-table bytes across loader patch windows instead of flushing,
//! and remembers writable+executable grants as future-executable regions.

use std::sync::atomic::Ordering;

use core_config::HandleModify;
use core_interval::{AppAddr, FragFlags, PageProt, VmFlags};
use tracing::{debug, error, info, warn};

use crate::collab::{BlockHandle, ProtDecision};
use crate::stats;
use crate::{Engine, ThreadContext};

impl Engine {
    /// Handle a faulting write into tracked code. Returns the app address
    /// at which to resume, or `None` meaning "retry the write now that
    /// engine state has been updated" (the common outcome).
    pub fn handle_modified_code(
        &self,
        ctx: &ThreadContext,
        _writer_cache_pc: AppAddr,
        writer_app_pc: AppAddr,
        target: AppAddr,
        write_len: u64,
        block: Option<BlockHandle>,
    ) -> Option<AppAddr> {
        stats::WRITE_FAULTS_HANDLED.fetch_add(1, Ordering::Relaxed);
        // Writes into ranges we pretend are writable, or whose writes are
        // emulated, never change engine state: the embedder nops or
        // single-steps the write and resumes at the writer.
        if self.aux.is_pretend_writable(target)
            || self.aux.emulate_write.read().lookup(target).is_some()
        {
            return Some(writer_app_pc);
        }
        // A fault racing an unmap by one instruction: the target page was
        // this thread's current decode page when the unload began. Retry
        // rather than reclassify a range that is going away.
        if self.unload_in_progress(target)
            && ctx
                .data
                .view
                .read()
                .decode_page_valid(self.page_start(target))
        {
            return None;
        }
        let span_start = self.page_start(target);
        let span_end = self.page_end_inclusive(target + write_len.saturating_sub(1));

        // Race reconciliation up front: another thread may have already
        // converted or removed the target while this fault was in flight.
        let (area_start, area_end) = {
            let cat = self.catalog.read();
            match cat.lookup(target) {
                None => {
                    debug!(
                        target: "fault",
                        target = format_args!("{target:#x}"),
                        "fault target no longer catalogued, retrying write"
                    );
                    return None;
                }
                Some(a) if a.frag_flags.contains(FragFlags::SELFMOD_SANDBOXED) => {
                    // Already sandboxed: the other thread won the race.
                    return None;
                }
                Some(a) => (a.start, a.end),
            }
        };

        // Writer overlap: does the faulting block's source span reach the
        // target's pages? Bounds come from the fragment index.
        let writer_span = block
            .and_then(|h| {
                let span = ctx.data.view.read().block_span(h);
                span.or_else(|| self.shared_view.read().block_span(h))
            })
            .unwrap_or((writer_app_pc, writer_app_pc + 1));
        let writer_lo = self.page_start(writer_span.0);
        let writer_hi = self.page_end_inclusive(writer_span.1.saturating_sub(1));
        let selfmod = writer_lo < span_end && span_start < writer_hi;

        // Bookkeeping: every distinct code-producing write counts toward
        // the read-only-to-sandbox threshold.
        let written = self.catalog.write().record_write(target);

        if selfmod {
            // Case A: flush the target pages, convert them to the
            // sandbox, and give the app its write permission back.
            self.flush_region(Some(ctx), span_start, span_end);
            let mut reclaimed = Vec::new();
            {
                let mut cat = self.catalog.write();
                cat.vector.reflag_range(span_start, span_end, |area| {
                    area.vm_flags
                        .remove(VmFlags::MADE_READ_ONLY | VmFlags::DELAY_READ_ONLY);
                    area.frag_flags.insert(FragFlags::SELFMOD_SANDBOXED);
                    if let Some(h) = area.data.coarse.take() {
                        // Sandboxed code is built fine-grained.
                        area.frag_flags.remove(FragFlags::COARSE_GRAIN);
                        area.vm_flags.remove(VmFlags::PERSISTED_CACHE);
                        reclaimed.push(h);
                    }
                });
            }
            for h in reclaimed {
                h.free_all(&*self.coarse_ops);
            }
            let _ = self.protector.protect(
                span_start,
                span_end,
                PageProt::READ | PageProt::WRITE | PageProt::EXEC,
            );
            stats::SANDBOX_CONVERSIONS.fetch_add(1, Ordering::Relaxed);
            info!(
                target: "fault",
                start = format_args!("{span_start:#x}"),
                end = format_args!("{span_end:#x}"),
                written,
                "self-modifying write: pages sandboxed"
            );
        } else {
            // Case B: the writer is ordinary code elsewhere. Only the
            // target's pages leave the catalog and become writable; the
            // rest of the area stays read-only and executable.
            let clip_start = span_start.max(area_start);
            let clip_end = span_end.min(area_end);
            self.flush_region(Some(ctx), clip_start, clip_end);
            self.catalog
                .write()
                .remove_region(clip_start, clip_end, None, &*self.coarse_ops);
            let _ = self.protector.protect(
                span_start,
                span_end,
                PageProt::READ | PageProt::WRITE | PageProt::EXEC,
            );
            info!(
                target: "fault",
                start = format_args!("{clip_start:#x}"),
                end = format_args!("{clip_end:#x}"),
                written,
                "write to non-code pages of a code region: pages uncatalogued"
            );
        }
        None
    }

    /// Called when a sandboxed block's self-write guard trips. Once the
    /// trip count crosses the sandbox-to-read-only threshold the page is
    /// flushed and converted back to page-protection consistency.
    pub fn selfmod_check_tripped(&self, ctx: &ThreadContext, pc: AppAddr) -> bool {
        let trips = self.catalog.write().record_selfmod_exec(pc);
        if trips < self.options.file.thresholds.sandbox2ro {
            return false;
        }
        let ps = self.page_start(pc);
        let pe = self.page_end_inclusive(pc);
        self.flush_region(Some(ctx), ps, pe);
        {
            let mut cat = self.catalog.write();
            cat.vector.reflag_range(ps, pe, |area| {
                area.frag_flags.remove(FragFlags::SELFMOD_SANDBOXED);
                area.vm_flags.insert(VmFlags::MADE_READ_ONLY);
            });
            cat.reset_selfmod_execs(pc);
        }
        let _ = self
            .protector
            .protect(ps, pe, PageProt::READ | PageProt::EXEC);
        stats::UNSANDBOX_CONVERSIONS.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "fault",
            page = format_args!("{ps:#x}"),
            trips,
            "sandbox trips over threshold: page back to read-only"
        );
        true
    }

    /// Classify an intercepted protection-change syscall before it is
    /// dispatched to the OS.
    pub fn app_memory_protection_change(
        &self,
        ctx: &ThreadContext,
        base: AppAddr,
        size: u64,
        new_prot: PageProt,
        is_image: bool,
    ) -> ProtDecision {
        let end = base + size;
        let overlaps_exec = self.catalog.read().overlap(base, end);

        if new_prot.is_writable() {
            // Writes aimed at protected tool or loader memory first.
            if let Some(decision) = self.check_protected_targets(base, end, overlaps_exec) {
                return decision;
            }
            if overlaps_exec {
                // Loader IAT patch window: stash the bytes, keep the
                // area and its persisted unit, and skip the flush.
                if is_image && self.aux.is_iat_exact(base, end) {
                    if let Some(bytes) = self.protector.read_memory(base, size as usize) {
                        self.aux.stash_iat(base, bytes);
                        let mut cat = self.catalog.write();
                        if let Some(area) = cat.lookup_mut(base)
                            && let Some(ref mut h) = area.data.coarse
                        {
                            h.mark_code_invalid();
                        }
                        stats::IAT_STASHES.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            target: "fault",
                            base = format_args!("{base:#x}"),
                            "IAT patch window opened, bytes stashed"
                        );
                        return ProtDecision::ApplyChange;
                    }
                }
                // Never leave code both executable and writable: flush
                // the intersection and drop the classification.
                self.flush_region(Some(ctx), base, end);
                self.catalog
                    .write()
                    .remove_region(base, end, None, &*self.coarse_ops);
            }
            if new_prot.is_executable() {
                // Remembered, not yet admitted: the next actual execution
                // attempt re-runs the gate.
                self.gate.add_future_region(base, end, false);
            } else {
                // Writable without execute is still "going
                // non-executable" for any remembered entry.
                self.gate.remove_future_region(base, end);
            }
            return ProtDecision::ApplyChange;
        }

        if new_prot.is_executable() {
            // Going read-executable.
            if is_image && let Some(stash) = self.aux.take_iat_stash(base) {
                return self.finish_iat_rebind(ctx, base, size, stash);
            }
            if overlaps_exec {
                // The app made its own code read-only; engine-applied
                // conversions are no longer needed on these pages.
                let mut cat = self.catalog.write();
                cat.vector.reflag_range(base, end, |area| {
                    area.vm_flags.remove(
                        VmFlags::WRITABLE | VmFlags::DELAY_READ_ONLY | VmFlags::MADE_READ_ONLY,
                    );
                });
                return ProtDecision::ApplyChange;
            }
            // Executable over data: consult the gate now so legitimate
            // regions are catalogued as originally-read-only code.
            let bytes = self.protector.read_memory(base, 16).unwrap_or_default();
            let req = core_policy::OriginRequest {
                target: base,
                source_pc: base,
                region_start: base,
                region_end: end,
                prot: new_prot,
                target_bytes: &bytes,
                thread: Some(ctx.data.id),
            };
            let adapter = crate::ModuleQueryAdapter {
                modules: self.modules.as_ref(),
            };
            let decision = {
                let cat = self.catalog.read();
                let known = |addr: AppAddr| cat.lookup(addr).is_some();
                // A probe: an mprotect is not an execution attempt, so it
                // must not consume detect-mode slots or once-only entries.
                self.gate.check_origin_probe(&req, &adapter, &known)
            };
            if let core_policy::OriginDecision::Admit(adm) = decision {
                let _ = self.catalog.write().add_region(
                    adm.start,
                    adm.end,
                    adm.vm_flags,
                    adm.frag_flags,
                    &*self.coarse_ops,
                    None,
                );
            }
            return ProtDecision::ApplyChange;
        }

        // Going non-executable: drop the classification and any future
        // entry covering the range.
        if overlaps_exec {
            self.flush_region(Some(ctx), base, end);
            self.catalog
                .write()
                .remove_region(base, end, None, &*self.coarse_ops);
        }
        self.gate.remove_future_region(base, end);
        ProtDecision::ApplyChange
    }

    /// Dispositions for writes aimed at the host's own heap areas or the
    /// tamper-resistant system library.
    fn check_protected_targets(
        &self,
        base: AppAddr,
        end: AppAddr,
        overlaps_exec: bool,
    ) -> Option<ProtDecision> {
        let syslib = self.aux.in_tamper_resistant(base, end);
        let own = overlaps_exec
            && self
                .catalog
                .read()
                .lookup(base)
                .is_some_and(|a| a.vm_flags.contains(VmFlags::HOST_HEAP));
        if !syslib && !own {
            if self.aux.patch_proof.overlap(base, end) {
                self.aux.note_pretend_writable(base, end);
                return Some(ProtDecision::PretendSuccess);
            }
            return None;
        }
        let disposition = if syslib {
            self.options.file.modify.syslib
        } else {
            self.options.file.modify.own
        };
        match disposition {
            HandleModify::Off | HandleModify::Allow => None,
            HandleModify::Nop => {
                self.aux.note_pretend_writable(base, end);
                warn!(
                    target: "fault",
                    base = format_args!("{base:#x}"),
                    syslib,
                    "protected memory made pretend-writable"
                );
                Some(ProtDecision::PretendSuccess)
            }
            HandleModify::Fail => Some(ProtDecision::FailSyscall),
            HandleModify::Halt => {
                error!(
                    target: "fault",
                    base = format_args!("{base:#x}"),
                    syslib,
                    "protected memory modification configured as fatal"
                );
                Some(ProtDecision::FailSyscall)
            }
        }
    }

    /// The restore-to-executable half of the IAT patch heuristic: compare
    /// the stashed bytes with the current ones; equal means the persisted
    /// unit is still valid, unequal means it is dropped and replaced.
    fn finish_iat_rebind(
        &self,
        ctx: &ThreadContext,
        base: AppAddr,
        size: u64,
        stash: Vec<u8>,
    ) -> ProtDecision {
        let current = self
            .protector
            .read_memory(base, size as usize)
            .unwrap_or_default();
        let mut dirty_range = None;
        {
            let mut cat = self.catalog.write();
            if let Some(area) = cat.lookup_mut(base) {
                let (a_start, a_end) = (area.start, area.end);
                if let Some(ref mut h) = area.data.coarse {
                    let in_bounds = h.primary.start >= a_start && h.primary.end <= a_end;
                    if current == stash && in_bounds {
                        h.clear_code_invalid();
                        stats::IAT_REBINDS_CLEAN.fetch_add(1, Ordering::Relaxed);
                        info!(
                            target: "fault",
                            base = format_args!("{base:#x}"),
                            "IAT bytes unchanged, persisted unit kept"
                        );
                    } else {
                        h.drop_and_replace(&*self.coarse_ops, a_start, a_end);
                        area.vm_flags.remove(VmFlags::PERSISTED_CACHE);
                        dirty_range = Some((a_start, a_end));
                        stats::IAT_REBINDS_DIRTY.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        if let Some((s, e)) = dirty_range {
            // Stale persisted code: schedule the flush now that the
            // catalog lock is released.
            self.flush_region(Some(ctx), s, e);
            warn!(
                target: "fault",
                base = format_args!("{base:#x}"),
                "IAT bytes changed across patch window, unit dropped"
            );
        }
        ProtDecision::ApplyChange
    }

    /// Observe a fresh mapping. Returns whether the range was catalogued.
    pub fn app_memory_allocation(
        &self,
        _ctx: &ThreadContext,
        base: AppAddr,
        size: u64,
        prot: PageProt,
        is_image: bool,
    ) -> bool {
        let end = base + size;
        if !prot.is_executable() {
            return false;
        }
        if is_image {
            let vm = if prot.is_writable() {
                VmFlags::WRITABLE | VmFlags::DELAY_READ_ONLY
            } else {
                VmFlags::UNMODIFIED_IMAGE
            };
            let ok = self
                .catalog
                .write()
                .add_region(base, end, vm, FragFlags::empty(), &*self.coarse_ops, None)
                .is_ok();
            debug!(
                target: "fault",
                base = format_args!("{base:#x}"),
                size,
                "image mapping catalogued"
            );
            return ok;
        }
        if self.options.file.exec.if_alloc {
            let vm = if prot.is_writable() {
                VmFlags::WRITABLE | VmFlags::DELAY_READ_ONLY
            } else {
                VmFlags::empty()
            };
            return self
                .catalog
                .write()
                .add_region(base, end, vm, FragFlags::empty(), &*self.coarse_ops, None)
                .is_ok();
        }
        if prot.is_writable() {
            // Executable+writable allocation: pre-approve, admit on the
            // first actual execution.
            self.gate.add_future_region(base, end, false);
        }
        false
    }

    /// Observe an unmapping. `own_synch` tells us the caller already
    /// quiesced the other threads, enabling the immediate flush variant.
    pub fn app_memory_deallocation(
        &self,
        ctx: &ThreadContext,
        base: AppAddr,
        size: u64,
        own_synch: bool,
    ) {
        let end = base + size;
        if own_synch {
            self.flush_all_synched(base, end);
        } else {
            self.flush_region(Some(ctx), base, end);
        }
        {
            let mut cat = self.catalog.write();
            cat.remove_region(base, end, None, &*self.coarse_ops);
            cat.clear_written(base, end);
        }
        self.gate.remove_future_region(base, end);
        self.aux.forget_range(base, end);
        *self
            .last_unload
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some((base, end));
        debug!(
            target: "fault",
            base = format_args!("{base:#x}"),
            size,
            "deallocation observed"
        );
    }

    /// Explicit icache-flush syscall: the app declares the range holds
    /// new code. Cached blocks are flushed so they rebuild from the
    /// current bytes; the classification stays.
    pub fn app_memory_flush(&self, ctx: &ThreadContext, base: AppAddr, size: u64) {
        let end = base + size;
        let _ = self.aux.app_flushed.add(
            base,
            end,
            VmFlags::empty(),
            FragFlags::empty(),
            (),
        );
        // A range the app explicitly flushes is JIT-managed from here on:
        // consistency comes from these notifications, not from faults.
        {
            let mut cat = self.catalog.write();
            if cat.overlap(base, end) {
                let mut reclaimed = Vec::new();
                cat.vector.reflag_range(base, end, |area| {
                    area.vm_flags.insert(VmFlags::JIT_MANAGED);
                    // JIT-managed code is built fine-grained.
                    if let Some(h) = area.data.coarse.take() {
                        reclaimed.push(h);
                    }
                    area.frag_flags.remove(FragFlags::COARSE_GRAIN);
                    area.vm_flags.remove(VmFlags::PERSISTED_CACHE);
                });
                // Split pieces outside the range keep their unit; clamp it
                // to the new bounds.
                for area in cat.vector.iter_mut() {
                    let (s, e) = (area.start, area.end);
                    if let Some(ref mut h) = area.data.coarse {
                        h.rebase(s, e);
                    }
                }
                for h in reclaimed {
                    h.free_all(&*self.coarse_ops);
                }
            }
        }
        self.flush_region(Some(ctx), base, end);
        debug!(
            target: "fault",
            base = format_args!("{base:#x}"),
            size,
            "app icache flush"
        );
    }

    pub fn mark_unload_start(&self, base: AppAddr, size: u64) {
        *self
            .last_unload
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some((base, base + size));
    }

    pub fn mark_unload_end(&self, base: AppAddr) {
        let mut slot = self.last_unload.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(*slot, Some((s, _)) if s == base) {
            *slot = None;
        }
    }

    /// Is an unload of the range containing `addr` in progress? Used to
    /// tolerate decode faults racing an unmap.
    pub fn unload_in_progress(&self, addr: AppAddr) -> bool {
        matches!(
            *self.last_unload.lock().unwrap_or_else(|e| e.into_inner()),
            Some((s, e)) if s <= addr && addr < e
        )
    }
}
