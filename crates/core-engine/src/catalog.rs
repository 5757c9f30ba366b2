//! Executable-areas catalog.
//!
//! The authoritative classification of every app byte that has been
//! executed or declared executable. Each area carries one consistency
//! class: originally read-only code needs no action; originally writable
//! code is downgraded to read-only once a block is built from it, so
//! writes fault; self-modifying regions stay writable and every block
//! built from them carries self-write guards. Coarse-grain areas
//! additionally own a chain of bulk-translation units.
//!
//! Written-area counters live beside the catalog: one record per page,
//! never merged, driving the read-only-to-sandbox and sandbox-to-read-only
//! threshold conversions.

use core_interval::{
    AppAddr, Area, FragFlags, IntervalVector, PageProt, PayloadOps, RemoveEvent, VectorPolicy,
    VmFlags,
};
use std::sync::atomic::Ordering;
use tracing::{debug, info};

use crate::coarse::CoarseHandle;
use crate::collab::{CoarseUnitOps, PageProtector};
use crate::stats;

/// Catalog payload: the coarse unit chain, when the area is coarse.
#[derive(Debug, Default)]
pub struct ExecPayload {
    pub coarse: Option<CoarseHandle>,
}

struct CatalogOps;

impl PayloadOps<ExecPayload> for CatalogOps {
    fn split(&self, _data: &mut ExecPayload, _at: AppAddr) -> ExecPayload {
        // The tail of a split coarse area loses its coarse standing; the
        // unit chain stays with the head.
        ExecPayload::default()
    }

    fn should_merge(&self, kept: &ExecPayload, absorbed: &ExecPayload) -> bool {
        // Two live unit chains cannot be combined; such areas stay
        // adjacent.
        !(kept.coarse.is_some() && absorbed.coarse.is_some())
    }

    fn merge(&self, kept: &mut ExecPayload, absorbed: ExecPayload) {
        if kept.coarse.is_none() {
            kept.coarse = absorbed.coarse;
        } else {
            debug_assert!(absorbed.coarse.is_none());
        }
    }

    fn free(&self, data: ExecPayload) {
        debug_assert!(
            data.coarse.is_none(),
            "coarse handle must be reclaimed before area deletion"
        );
    }
}

/// Per-page write/selfmod counters. Never merged, so each page keeps
/// independent counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WrittenCounts {
    pub written_count: u32,
    pub selfmod_execs: u32,
}

pub struct ExecCatalog {
    pub vector: IntervalVector<ExecPayload>,
    written: IntervalVector<WrittenCounts>,
    page_size: u64,
}

impl ExecCatalog {
    pub fn new(page_size: u64) -> Self {
        Self {
            vector: IntervalVector::with_ops(
                VectorPolicy::SHARED,
                "executable-areas",
                Box::new(CatalogOps),
            ),
            written: IntervalVector::new(
                VectorPolicy::SHARED | VectorPolicy::NEVER_MERGE_ADJACENT,
                "written-areas",
            ),
            page_size,
        }
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn page_start(&self, addr: AppAddr) -> AppAddr {
        addr & !(self.page_size - 1)
    }

    pub fn page_end(&self, addr: AppAddr) -> AppAddr {
        self.page_start(addr) + self.page_size
    }

    pub fn lookup(&self, addr: AppAddr) -> Option<&Area<ExecPayload>> {
        self.vector.lookup(addr)
    }

    pub fn lookup_mut(&mut self, addr: AppAddr) -> Option<&mut Area<ExecPayload>> {
        self.vector.lookup_mut(addr)
    }

    pub fn overlap(&self, start: AppAddr, end: AppAddr) -> bool {
        self.vector.overlap(start, end)
    }

    /// Insert a classified region. Coarse regions are given a fresh unit
    /// when the covering area does not already own one; `adopt` instead
    /// installs a unit the collaborator loaded from a persisted file.
    pub fn add_region(
        &mut self,
        start: AppAddr,
        end: AppAddr,
        vm_flags: VmFlags,
        frag_flags: FragFlags,
        coarse_ops: &dyn CoarseUnitOps,
        adopt: Option<crate::collab::CoarseUnitId>,
    ) -> Result<(), core_interval::VectorError> {
        self.vector
            .add(start, end, vm_flags, frag_flags, ExecPayload::default())?;
        stats::CATALOG_ADDS.fetch_add(1, Ordering::Relaxed);
        if frag_flags.contains(FragFlags::COARSE_GRAIN)
            && let Some(area) = self.vector.lookup_mut(start)
            && area.data.coarse.is_none()
        {
            let (a_start, a_end) = (area.start, area.end);
            area.data.coarse = Some(match adopt {
                Some(id) => {
                    area.vm_flags.insert(VmFlags::PERSISTED_CACHE);
                    CoarseHandle::adopt_persisted(id, start, end)
                }
                None => CoarseHandle::fresh(coarse_ops, a_start, a_end),
            });
        }
        info!(
            target: "catalog",
            start = format_args!("{start:#x}"),
            end = format_args!("{end:#x}"),
            ?vm_flags,
            ?frag_flags,
            "region catalogued"
        );
        Ok(())
    }

    /// Remove `[start, end)`. Deleted areas the engine had protected
    /// read-only get their writability restored when `restore` is given;
    /// coarse handles are reclaimed and rebased as the bounds change.
    pub fn remove_region(
        &mut self,
        start: AppAddr,
        end: AppAddr,
        restore: Option<&dyn PageProtector>,
        coarse_ops: &dyn CoarseUnitOps,
    ) -> bool {
        let removed = self
            .vector
            .remove_with(start, end, |ev| match ev {
                RemoveEvent::Deleted(area) => {
                    if let Some(handle) = area.data.coarse.take() {
                        handle.free_all(coarse_ops);
                    }
                    if area.vm_flags.contains(VmFlags::MADE_READ_ONLY)
                        && let Some(protector) = restore
                    {
                        let _ = protector.protect(
                            area.start,
                            area.end,
                            PageProt::READ | PageProt::WRITE | PageProt::EXEC,
                        );
                    }
                }
                RemoveEvent::ClippedLeft { area, .. }
                | RemoveEvent::ClippedRight { area, .. } => {
                    let (s, e) = (area.start, area.end);
                    if let Some(ref mut handle) = area.data.coarse {
                        handle.rebase(s, e);
                    }
                }
                RemoveEvent::SplitTail { head, tail } => {
                    // Strip coarse standing from the split tail; the unit
                    // chain stays with the head, clamped to its bounds.
                    tail.frag_flags.remove(FragFlags::COARSE_GRAIN);
                    tail.vm_flags.remove(VmFlags::PERSISTED_CACHE);
                    let (s, e) = (head.start, head.end);
                    if let Some(ref mut handle) = head.data.coarse {
                        handle.rebase(s, e);
                    }
                }
            })
            .unwrap_or(false);
        if removed {
            stats::CATALOG_REMOVES.fetch_add(1, Ordering::Relaxed);
            debug!(
                target: "catalog",
                start = format_args!("{start:#x}"),
                end = format_args!("{end:#x}"),
                "region removed"
            );
        }
        removed
    }

    // ---- written-area counters ---------------------------------------

    /// Record one code-producing write at `addr`, creating the page
    /// record when absent. Returns the updated count.
    pub fn record_write(&mut self, addr: AppAddr) -> u32 {
        let (ps, pe) = (self.page_start(addr), self.page_end(addr));
        if self.written.lookup(addr).is_none() {
            let _ = self.written.add(
                ps,
                pe,
                VmFlags::empty(),
                FragFlags::empty(),
                WrittenCounts::default(),
            );
        }
        let rec = self
            .written
            .lookup_mut(addr)
            .expect("written record just ensured");
        rec.data.written_count += 1;
        rec.data.written_count
    }

    /// Record one sandbox self-write trip at `addr`.
    pub fn record_selfmod_exec(&mut self, addr: AppAddr) -> u32 {
        let (ps, pe) = (self.page_start(addr), self.page_end(addr));
        if self.written.lookup(addr).is_none() {
            let _ = self.written.add(
                ps,
                pe,
                VmFlags::empty(),
                FragFlags::empty(),
                WrittenCounts::default(),
            );
        }
        let rec = self
            .written
            .lookup_mut(addr)
            .expect("written record just ensured");
        rec.data.selfmod_execs += 1;
        rec.data.selfmod_execs
    }

    pub fn written_count(&self, addr: AppAddr) -> u32 {
        self.written
            .lookup_data(addr)
            .map(|c| c.written_count)
            .unwrap_or(0)
    }

    /// Reset the selfmod counter after a sandbox-to-read-only conversion.
    pub fn reset_selfmod_execs(&mut self, addr: AppAddr) {
        if let Some(rec) = self.written.lookup_mut(addr) {
            rec.data.selfmod_execs = 0;
        }
    }

    /// Drop counter records for an unmapped range.
    pub fn clear_written(&mut self, start: AppAddr, end: AppAddr) {
        let _ = self.written.remove(start, end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::CoarseUnitId;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU64;

    #[derive(Default)]
    struct FakeCoarse {
        next: AtomicU64,
        freed: Mutex<Vec<u64>>,
    }

    impl CoarseUnitOps for FakeCoarse {
        fn alloc(&self, _s: AppAddr, _e: AppAddr) -> CoarseUnitId {
            CoarseUnitId(self.next.fetch_add(1, Ordering::Relaxed) + 1)
        }
        fn free(&self, unit: CoarseUnitId) {
            self.freed.lock().unwrap().push(unit.0);
        }
        fn reset(&self, _unit: CoarseUnitId) {}
        fn is_frozen(&self, _unit: CoarseUnitId) -> bool {
            false
        }
        fn is_persisted(&self, _unit: CoarseUnitId) -> bool {
            false
        }
    }

    #[derive(Default)]
    struct RecordingProtector {
        calls: Mutex<Vec<(AppAddr, AppAddr, PageProt)>>,
    }

    impl PageProtector for RecordingProtector {
        fn query(&self, _addr: AppAddr) -> Option<crate::collab::OsRegion> {
            None
        }
        fn protect(&self, start: AppAddr, end: AppAddr, prot: PageProt) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push((start, end, prot));
            Ok(())
        }
        fn read_memory(&self, _addr: AppAddr, _len: usize) -> Option<Vec<u8>> {
            None
        }
    }

    #[test]
    fn coarse_region_gets_unit() {
        let ops = FakeCoarse::default();
        let mut cat = ExecCatalog::new(4096);
        cat.add_region(
            0x10000,
            0x20000,
            VmFlags::empty(),
            FragFlags::COARSE_GRAIN,
            &ops,
            None,
        )
        .unwrap();
        let area = cat.lookup(0x10000).unwrap();
        let handle = area.data.coarse.as_ref().unwrap();
        assert_eq!((handle.primary.start, handle.primary.end), (0x10000, 0x20000));
    }

    #[test]
    fn split_strips_coarse_from_tail() {
        let ops = FakeCoarse::default();
        let mut cat = ExecCatalog::new(4096);
        cat.add_region(
            0x10000,
            0x20000,
            VmFlags::empty(),
            FragFlags::COARSE_GRAIN,
            &ops,
            None,
        )
        .unwrap();
        assert!(cat.remove_region(0x14000, 0x15000, None, &ops));
        let head = cat.lookup(0x10000).unwrap();
        assert!(head.frag_flags.contains(FragFlags::COARSE_GRAIN));
        let h = head.data.coarse.as_ref().unwrap();
        assert_eq!(h.primary.end, 0x14000, "unit clamped to the head");
        let tail = cat.lookup(0x15000).unwrap();
        assert!(!tail.frag_flags.contains(FragFlags::COARSE_GRAIN));
        assert!(tail.data.coarse.is_none());
        assert!(ops.freed.lock().unwrap().is_empty());
    }

    #[test]
    fn delete_reclaims_unit_and_restores_protection() {
        let ops = FakeCoarse::default();
        let prot = RecordingProtector::default();
        let mut cat = ExecCatalog::new(4096);
        cat.add_region(
            0x10000,
            0x12000,
            VmFlags::WRITABLE | VmFlags::MADE_READ_ONLY,
            FragFlags::COARSE_GRAIN,
            &ops,
            None,
        )
        .unwrap();
        assert!(cat.remove_region(0x10000, 0x12000, Some(&prot), &ops));
        assert_eq!(ops.freed.lock().unwrap().len(), 1);
        let calls = prot.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, 0x10000);
        assert!(calls[0].2.is_writable());
    }

    #[test]
    fn written_counters_are_per_page() {
        let mut cat = ExecCatalog::new(4096);
        assert_eq!(cat.record_write(0x1000), 1);
        assert_eq!(cat.record_write(0x1004), 2);
        assert_eq!(cat.record_write(0x2000), 1, "next page counts separately");
        assert_eq!(cat.written_count(0x1fff), 2);
        assert_eq!(cat.written_count(0x3000), 0);
        assert_eq!(cat.record_selfmod_exec(0x1000), 1);
        cat.reset_selfmod_execs(0x1000);
        assert_eq!(cat.record_selfmod_exec(0x1000), 1);
    }
}
