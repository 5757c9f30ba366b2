//! Per-thread and shared area views.
//!
//! A view caches the catalog areas a context has built code from, and
//! anchors the fragment lists linking every block back to its source
//! areas. The shared view holds thread-shared blocks; each observing
//! thread additionally owns a private view of the same shape. Areas are
//! copied in from the catalog on first encounter; the `last_area` and
//! `last_decode_page` shortcuts are cleared on any mutation that could
//! invalidate them.

use std::sync::{Arc, Mutex, MutexGuard};

use core_interval::{AppAddr, FragFlags, IntervalVector, PayloadOps, VectorPolicy, VmFlags};
use tracing::{debug, trace};

use crate::collab::BlockHandle;
use crate::fragment::{FragmentArena, NodeId};

/// Payload of a view area: the head of its fragment list.
#[derive(Debug, Default)]
pub struct ViewPayload {
    pub head: Option<NodeId>,
}

/// Payload callbacks for fragment-list vectors: splitting partitions the
/// list by node pc, merging splices end-to-end and deduplicates blocks
/// that now hold two nodes inside the merged bounds.
struct ViewOps {
    arena: Arc<Mutex<FragmentArena>>,
}

impl ViewOps {
    fn arena(&self) -> MutexGuard<'_, FragmentArena> {
        self.arena.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PayloadOps<ViewPayload> for ViewOps {
    fn split(&self, data: &mut ViewPayload, at: AppAddr) -> ViewPayload {
        let mut arena = self.arena();
        let mut tail = None;
        for id in arena.list_nodes(data.head) {
            if arena.node(id).pc_start >= at {
                arena.unlink(&mut data.head, id);
                arena.append(&mut tail, id);
            }
        }
        ViewPayload { head: tail }
    }

    fn merge(&self, kept: &mut ViewPayload, absorbed: ViewPayload) {
        let mut arena = self.arena();
        arena.splice(&mut kept.head, absorbed.head);
        arena.cleanup_after_merge(&mut kept.head);
    }

    fn free(&self, data: ViewPayload) {
        debug_assert!(
            data.head.is_none(),
            "view areas are drained before removal"
        );
    }
}

/// One context's projection of the catalog.
pub struct View {
    pub vector: IntervalVector<ViewPayload>,
    arena: Arc<Mutex<FragmentArena>>,
    /// Point-of-reference shortcut for repeated queries.
    last_area: Option<(AppAddr, AppAddr)>,
    /// Tolerates a single-instruction fault race near an unmap.
    last_decode_page: Option<(AppAddr, bool)>,
    name: &'static str,
}

impl View {
    pub fn new(name: &'static str, shared: bool) -> Self {
        let arena = Arc::new(Mutex::new(FragmentArena::new()));
        let mut policy = VectorPolicy::FRAGMENT_LIST;
        if shared {
            policy |= VectorPolicy::SHARED;
        }
        let vector = IntervalVector::with_ops(
            policy,
            name,
            Box::new(ViewOps {
                arena: arena.clone(),
            }),
        );
        Self {
            vector,
            arena,
            last_area: None,
            last_decode_page: None,
            name,
        }
    }

    pub fn arena(&self) -> MutexGuard<'_, FragmentArena> {
        self.arena.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    // ---- caches ------------------------------------------------------

    pub fn clear_caches(&mut self) {
        self.last_area = None;
        self.last_decode_page = None;
    }

    pub fn cache_hit(&self, addr: AppAddr) -> bool {
        matches!(self.last_area, Some((s, e)) if s <= addr && addr < e)
    }

    pub fn note_decode_page(&mut self, page: AppAddr) {
        self.last_decode_page = Some((page, true));
    }

    /// Was `page` the most recent decode page and still valid? Used to
    /// tolerate a fault racing an unmap by one instruction.
    pub fn decode_page_valid(&self, page: AppAddr) -> bool {
        matches!(self.last_decode_page, Some((p, true)) if p == page)
    }

    // ---- area management ---------------------------------------------

    /// Copy a catalog area into this view (first encounter). Idempotent.
    pub fn ensure_area(
        &mut self,
        start: AppAddr,
        end: AppAddr,
        vm_flags: VmFlags,
        frag_flags: FragFlags,
    ) -> bool {
        if let Some(a) = self.vector.lookup(start)
            && a.end >= end
        {
            self.last_area = Some((a.start, a.end));
            return false;
        }
        let ok = self
            .vector
            .add(start, end, vm_flags, frag_flags, ViewPayload::default())
            .is_ok();
        if ok {
            self.last_area = Some((start, end));
            trace!(
                target: "view",
                view = self.name,
                start = format_args!("{start:#x}"),
                end = format_args!("{end:#x}"),
                "area copied into view"
            );
        }
        ok
    }

    pub fn lookup_bounds(&self, addr: AppAddr) -> Option<(AppAddr, AppAddr, VmFlags, FragFlags)> {
        self.vector
            .lookup(addr)
            .map(|a| (a.start, a.end, a.vm_flags, a.frag_flags))
    }

    // ---- fragment index ----------------------------------------------

    /// Commit a built block: one node per source region, the head node on
    /// the region containing `tag`. Every region must already have a view
    /// area (placed by the build-time checks).
    pub fn add_block(
        &mut self,
        handle: BlockHandle,
        tag: AppAddr,
        regions: &[(AppAddr, AppAddr)],
    ) -> bool {
        let mut resolved: Vec<(AppAddr, AppAddr, *mut Option<NodeId>)> =
            Vec::with_capacity(regions.len());
        for &(s, e) in regions {
            let Some(area) = self.vector.lookup_mut(s) else {
                debug_assert!(false, "block region has no view area");
                return false;
            };
            debug_assert!(area.contains(s));
            resolved.push((s, e, &mut area.data.head as *mut _));
        }
        // The raw pointers reference distinct area payloads and stay valid
        // because the vector is not restructured until they are consumed.
        let mut arena = self.arena.lock().unwrap_or_else(|e| e.into_inner());
        let created = arena.add_block(
            handle,
            tag,
            resolved
                .into_iter()
                .map(|(s, e, p)| (s, e, unsafe { &mut *p })),
        );
        created.is_some()
    }

    /// Withdraw a block (failed build or retirement), restoring every
    /// per-area list it was linked on.
    pub fn remove_block(&mut self, handle: BlockHandle) -> bool {
        let vector = &mut self.vector as *mut IntervalVector<ViewPayload>;
        let mut arena = self.arena.lock().unwrap_or_else(|e| e.into_inner());
        arena.remove_block(handle, |pc| {
            // Safe under &mut self: the closure only reaches distinct
            // area payloads while the arena lock serializes node surgery.
            let area = unsafe { (*vector).lookup_mut(pc) }
                .expect("fragment node pc inside a view area");
            &mut area.data.head as *mut _
        })
    }

    pub fn contains_block(&self, handle: BlockHandle) -> bool {
        self.arena().head_of(handle).is_some()
    }

    /// Min/max source bounds over every node of the block.
    pub fn block_span(&self, handle: BlockHandle) -> Option<(AppAddr, AppAddr)> {
        self.arena().source_span(handle)
    }

    /// Regions (per-area source bounds) and tag of a live block.
    pub fn block_regions(&self, handle: BlockHandle) -> Option<(AppAddr, Vec<(AppAddr, AppAddr)>)> {
        let arena = self.arena();
        let nodes = arena.block_nodes(handle);
        if nodes.is_empty() {
            return None;
        }
        let mut tag = 0;
        let mut regions = Vec::with_capacity(nodes.len());
        for id in nodes {
            let n = arena.node(id);
            if let crate::fragment::NodeKind::Head { tag: t, .. } = n.kind {
                tag = t;
            }
            regions.push((n.pc_start, n.pc_end));
        }
        Some((tag, regions))
    }

    /// Flush phase 1 over this view: mark every overlapping area as on
    /// the delete queue, drain its fragment list (unlinking spanning
    /// blocks from their other areas too), and detach the areas. Returns
    /// the drained block handles.
    pub fn drain_region(&mut self, start: AppAddr, end: AppAddr) -> Vec<BlockHandle> {
        self.clear_caches();
        // Split at the flush bounds first so only the covered pieces are
        // detached; blocks anchored outside the range survive. View
        // bounds stay a refinement of catalog bounds, which the caller
        // splits the same way.
        self.vector.split_at(start);
        self.vector.split_at(end);
        let affected: Vec<(AppAddr, AppAddr)> = self
            .vector
            .iter()
            .filter(|a| a.overlaps(start, end))
            .map(|a| (a.start, a.end))
            .collect();
        let mut drained = Vec::new();
        for (a_start, a_end) in affected {
            let mut head = {
                let area = self
                    .vector
                    .lookup_mut(a_start)
                    .expect("affected area present");
                area.vm_flags.insert(VmFlags::ON_DELETE_QUEUE);
                area.data.head.take()
            };
            {
                let vector = &mut self.vector as *mut IntervalVector<ViewPayload>;
                let mut arena = self.arena.lock().unwrap_or_else(|e| e.into_inner());
                let blocks = arena.drain_list(&mut head, |pc| {
                    let area = unsafe { (*vector).lookup_mut(pc) }
                        .expect("spanning node pc inside a view area");
                    &mut area.data.head as *mut _
                });
                drained.extend(blocks);
            }
            let _ = self.vector.remove(a_start, a_end);
        }
        if !drained.is_empty() {
            debug!(
                target: "view",
                view = self.name,
                start = format_args!("{start:#x}"),
                end = format_args!("{end:#x}"),
                blocks = drained.len(),
                "region drained"
            );
        }
        drained
    }

    /// Debug invariants over every area list in the view.
    pub fn check_invariants(&self) -> bool {
        let arena = self.arena();
        self.vector
            .iter()
            .all(|a| arena.check_list(a.data.head, a.start, a.end))
    }
}

/// Relocate a block between views (a block first thought shared turns out
/// private, or vice versa). Both views' locks are held by the caller; the
/// destination synthesises missing areas through `assign_area`, which
/// re-runs the catalog area assignment.
pub fn migrate_block(
    src: &mut View,
    dst: &mut View,
    handle: BlockHandle,
    mut assign_area: impl FnMut(AppAddr) -> Option<(AppAddr, AppAddr, VmFlags, FragFlags)>,
) -> bool {
    let Some((tag, regions)) = src.block_regions(handle) else {
        return false;
    };
    if !src.remove_block(handle) {
        return false;
    }
    for &(s, _) in &regions {
        if dst.vector.lookup(s).is_none() {
            let Some((a_start, a_end, vm, frag)) = assign_area(s) else {
                debug_assert!(false, "no catalog area for migrating block region");
                return false;
            };
            dst.ensure_area(a_start, a_end, vm, frag);
        }
    }
    let ok = dst.add_block(handle, tag, &regions);
    debug!(
        target: "view",
        from = src.name,
        to = dst.name,
        block = handle.0,
        ok,
        "block migrated"
    );
    ok
}
