//! Sorted, merging interval vector over application addresses.
//!
//! The vector owns a set of non-overlapping half-open areas `[start, end)`,
//! each carrying flag sets and one client payload. Inserts resolve overlap
//! against existing areas (old properties win on conflict), merge compatible
//! neighbours through per-vector payload callbacks, and removals split
//! partially covered areas. Every catalog and bookkeeping list in the engine
//! is an instance of this container configured by [`VectorPolicy`].

use std::fmt;

use thiserror::Error;
use tracing::{debug, error, trace};

mod flags;
pub mod shared;

pub use flags::{FragFlags, PageProt, VectorPolicy, VmFlags};
pub use shared::SharedVector;

/// An address in the observed process's address space.
pub type AppAddr = u64;

/// One tracked range with its flags and client payload.
#[derive(Debug)]
pub struct Area<T> {
    pub start: AppAddr,
    pub end: AppAddr,
    pub vm_flags: VmFlags,
    pub frag_flags: FragFlags,
    pub data: T,
}

impl<T> Area<T> {
    pub fn contains(&self, addr: AppAddr) -> bool {
        self.start <= addr && addr < self.end
    }

    pub fn overlaps(&self, start: AppAddr, end: AppAddr) -> bool {
        self.start < end && start < self.end
    }
}

/// Per-vector payload callbacks. The engine supplies an implementation per
/// vector; the clone-based [`CloneOps`] covers plain-data payloads.
pub trait PayloadOps<T>: Send + Sync {
    /// Produce the payload for the piece of an area starting at `at` when
    /// the area is split there. May mutate the head payload.
    fn split(&self, data: &mut T, at: AppAddr) -> T;

    /// Gate merging of two equal-flag areas by payload equivalence.
    fn should_merge(&self, _kept: &T, _absorbed: &T) -> bool {
        true
    }

    /// Combine `absorbed` into `kept` when two areas merge.
    fn merge(&self, _kept: &mut T, absorbed: T) {
        self.free(absorbed);
    }

    /// Release a payload on area deletion.
    fn free(&self, _data: T) {}
}

/// Default callbacks: split clones, merge keeps the left payload.
pub struct CloneOps;

impl<T: Clone + Send + Sync> PayloadOps<T> for CloneOps {
    fn split(&self, data: &mut T, _at: AppAddr) -> T {
        data.clone()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VectorError {
    #[error("empty range {start:#x}..{end:#x}")]
    EmptyRange { start: AppAddr, end: AppAddr },
    #[error("range {start:#x}..0 wraps the address space")]
    Wraparound { start: AppAddr },
    #[error("overlapping insert {start:#x}..{end:#x} on never-overlap vector `{name}`")]
    Overlap {
        name: &'static str,
        start: AppAddr,
        end: AppAddr,
    },
}

/// Sorted non-overlapping area vector with per-vector merge policy.
pub struct IntervalVector<T> {
    areas: Vec<Area<T>>,
    policy: VectorPolicy,
    ops: Box<dyn PayloadOps<T>>,
    name: &'static str,
    /// Extra capacity reserved when the backing array fills; 0 leaves
    /// growth to the allocator.
    growth: usize,
}

/// Classification of one slice of an incoming range against the vector.
enum Piece {
    /// Sub-range covered by no existing area; becomes a fresh area.
    Gap { s: AppAddr, e: AppAddr },
    /// Sub-range covered by an equal-flag area; payloads merge.
    Absorb { s: AppAddr },
    /// Sub-range covered by a mismatched area; the old area wins.
    Drop,
}

/// Callback context for [`IntervalVector::remove_with`].
pub enum RemoveEvent<'a, T> {
    /// Area fully covered by the removal, about to be freed.
    Deleted(&'a mut Area<T>),
    /// Removal clipped the area's left edge; `start` already advanced.
    ClippedLeft {
        area: &'a mut Area<T>,
        old_start: AppAddr,
    },
    /// Removal clipped the area's right edge; `end` already retracted.
    ClippedRight {
        area: &'a mut Area<T>,
        old_end: AppAddr,
    },
    /// Removal fell strictly inside one area; `tail` is the split-off
    /// piece about to be reinserted after `head`.
    SplitTail {
        head: &'a mut Area<T>,
        tail: &'a mut Area<T>,
    },
}

impl<T: Clone + Send + Sync + 'static> IntervalVector<T> {
    /// Vector with clone-based payload callbacks.
    pub fn new(policy: VectorPolicy, name: &'static str) -> Self {
        Self::with_ops(policy, name, Box::new(CloneOps))
    }
}

impl<T> IntervalVector<T> {
    pub fn with_ops(
        policy: VectorPolicy,
        name: &'static str,
        ops: Box<dyn PayloadOps<T>>,
    ) -> Self {
        Self {
            areas: Vec::new(),
            policy,
            ops,
            name,
            growth: 0,
        }
    }

    /// Size the backing array: `initial` slots up front, growing by
    /// `increment` slots whenever it fills.
    pub fn reserve_policy(&mut self, initial: usize, increment: usize) {
        self.growth = increment;
        if self.areas.capacity() < initial {
            self.areas.reserve(initial - self.areas.capacity());
        }
    }

    fn grow_for_insert(&mut self) {
        if self.growth > 0 && self.areas.len() == self.areas.capacity() {
            self.areas.reserve(self.growth);
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn policy(&self) -> VectorPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.areas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Area<T>> {
        self.areas.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Area<T>> {
        self.areas.iter_mut()
    }

    fn check_range(&self, start: AppAddr, end: AppAddr) -> Result<(), VectorError> {
        if end == 0 && start != 0 {
            return Err(VectorError::Wraparound { start });
        }
        if start >= end {
            return Err(VectorError::EmptyRange { start, end });
        }
        Ok(())
    }

    /// Index of the first area whose `end` exceeds `addr`.
    fn first_end_above(&self, addr: AppAddr) -> usize {
        self.areas.partition_point(|a| a.end <= addr)
    }

    fn lookup_idx(&self, addr: AppAddr) -> Option<usize> {
        let i = self.areas.partition_point(|a| a.start <= addr);
        if i > 0 && self.areas[i - 1].end > addr {
            Some(i - 1)
        } else {
            None
        }
    }

    /// Point query.
    pub fn lookup(&self, addr: AppAddr) -> Option<&Area<T>> {
        self.lookup_idx(addr).map(|i| &self.areas[i])
    }

    pub fn lookup_mut(&mut self, addr: AppAddr) -> Option<&mut Area<T>> {
        self.lookup_idx(addr).map(|i| &mut self.areas[i])
    }

    pub fn lookup_data(&self, addr: AppAddr) -> Option<&T> {
        self.lookup(addr).map(|a| &a.data)
    }

    /// Range query: does any area intersect `[start, end)`?
    pub fn overlap(&self, start: AppAddr, end: AppAddr) -> bool {
        if start >= end {
            return false;
        }
        let i = self.first_end_above(start);
        i < self.areas.len() && self.areas[i].start < end
    }

    /// Neighbour query: the last area starting at or before `addr` and the
    /// first area starting strictly after it.
    pub fn lookup_prev_next(&self, addr: AppAddr) -> (Option<&Area<T>>, Option<&Area<T>>) {
        let i = self.areas.partition_point(|a| a.start <= addr);
        let prev = if i > 0 { Some(&self.areas[i - 1]) } else { None };
        let next = self.areas.get(i);
        (prev, next)
    }

    /// Replace the payload of an exact-bounds area. Returns false when no
    /// area has exactly `[start, end)`.
    pub fn modify_payload(&mut self, start: AppAddr, end: AppAddr, new_data: T) -> bool {
        if let Some(i) = self.lookup_idx(start)
            && self.areas[i].start == start
            && self.areas[i].end == end
        {
            let old = std::mem::replace(&mut self.areas[i].data, new_data);
            self.ops.free(old);
            return true;
        }
        false
    }

    /// Insert `[start, end)`, resolving overlap against existing areas.
    ///
    /// Flag drift (`MOVED_FROM_FUTURE`, `ONCE_ONLY`) erodes off overlapped
    /// areas; equal-flag overlap merges payloads; mismatched overlap clips
    /// the incoming range (the old area's properties win). Fresh pieces
    /// coalesce with equal-flag neighbours when the policy permits.
    pub fn add(
        &mut self,
        start: AppAddr,
        end: AppAddr,
        vm_flags: VmFlags,
        frag_flags: FragFlags,
        mut data: T,
    ) -> Result<(), VectorError> {
        self.check_range(start, end)?;
        debug_assert!(vm_flags.is_consistent(), "inconsistent vm flags on add");

        // Pass 1: classify the incoming range slice by slice.
        let mut pieces: Vec<Piece> = Vec::new();
        let mut s = start;
        let mut i = self.first_end_above(start);
        while s < end {
            if i >= self.areas.len() || self.areas[i].start >= end {
                pieces.push(Piece::Gap { s, e: end });
                break;
            }
            let a_start = self.areas[i].start;
            if s < a_start {
                pieces.push(Piece::Gap { s, e: a_start });
                s = a_start;
                continue;
            }
            // Overlap with areas[i].
            if self.policy.contains(VectorPolicy::NEVER_OVERLAP) {
                error!(
                    target: "vector",
                    name = self.name,
                    start = format_args!("{start:#x}"),
                    end = format_args!("{end:#x}"),
                    "overlapping insert on never-overlap vector"
                );
                self.ops.free(data);
                return Err(VectorError::Overlap {
                    name: self.name,
                    start,
                    end,
                });
            }
            self.erode_flags(i, vm_flags);
            self.check_forbidden(i, vm_flags, frag_flags);
            let a = &self.areas[i];
            let a_end = a.end;
            if a.vm_flags == vm_flags
                && a.frag_flags == frag_flags
                && !self.policy.contains(VectorPolicy::NEVER_MERGE)
                && self.ops.should_merge(&a.data, &data)
            {
                pieces.push(Piece::Absorb { s });
            } else {
                trace!(
                    target: "vector",
                    name = self.name,
                    s = format_args!("{s:#x}"),
                    e = format_args!("{:#x}", a_end.min(end)),
                    "incoming range clipped by mismatched area"
                );
                pieces.push(Piece::Drop);
            }
            s = a_end;
            i += 1;
        }

        // Entirely swallowed by mismatched areas: the new range is dropped.
        if !pieces
            .iter()
            .any(|p| matches!(p, Piece::Gap { .. } | Piece::Absorb { .. }))
        {
            self.ops.free(data);
            return Ok(());
        }

        // Derive one payload per placed piece; the first takes `data`.
        let mut payloads: std::collections::VecDeque<T> = std::collections::VecDeque::new();
        let mut first = true;
        for p in &pieces {
            let piece_start = match p {
                Piece::Gap { s, .. } | Piece::Absorb { s } => *s,
                Piece::Drop { .. } => continue,
            };
            if first {
                first = false;
            } else {
                payloads.push_back(self.ops.split(&mut data, piece_start));
            }
        }
        payloads.push_front(data);

        // Pass 2: place pieces left to right. A gap piece prefers extending
        // an equal-flag neighbouring area (the old area absorbs the new
        // range and its payload survives) over inserting a fresh area.
        for p in &pieces {
            match *p {
                Piece::Drop { .. } => {}
                Piece::Gap { s, e } => {
                    let payload = payloads.pop_front().expect("payload per placed piece");
                    let at = self.areas.partition_point(|a| a.start < s);
                    let can_extend = !self
                        .policy
                        .intersects(VectorPolicy::NEVER_MERGE | VectorPolicy::NEVER_MERGE_ADJACENT);
                    let extend_left = can_extend
                        && at > 0
                        && self.areas[at - 1].end == s
                        && self.areas[at - 1].vm_flags == vm_flags
                        && self.areas[at - 1].frag_flags == frag_flags
                        && self.ops.should_merge(&self.areas[at - 1].data, &payload);
                    if extend_left {
                        self.areas[at - 1].end = e;
                        self.ops.merge(&mut self.areas[at - 1].data, payload);
                        continue;
                    }
                    let extend_right = can_extend
                        && at < self.areas.len()
                        && self.areas[at].start == e
                        && self.areas[at].vm_flags == vm_flags
                        && self.areas[at].frag_flags == frag_flags
                        && self.ops.should_merge(&self.areas[at].data, &payload);
                    if extend_right {
                        self.areas[at].start = s;
                        self.ops.merge(&mut self.areas[at].data, payload);
                        continue;
                    }
                    self.grow_for_insert();
                    self.areas.insert(
                        at,
                        Area {
                            start: s,
                            end: e,
                            vm_flags,
                            frag_flags,
                            data: payload,
                        },
                    );
                }
                Piece::Absorb { s } => {
                    let payload = payloads.pop_front().expect("payload per placed piece");
                    let idx = self.lookup_idx(s).expect("absorbing area present");
                    self.ops.merge(&mut self.areas[idx].data, payload);
                }
            }
        }

        self.coalesce_range(start, end);
        debug!(
            target: "vector",
            name = self.name,
            start = format_args!("{start:#x}"),
            end = format_args!("{end:#x}"),
            len = self.areas.len(),
            "add"
        );
        debug_assert!(self.is_sorted_disjoint());
        Ok(())
    }

    /// Drift tolerated from new to old: these bits erode off the existing
    /// area when the incoming range lacks them.
    fn erode_flags(&mut self, idx: usize, incoming: VmFlags) {
        let a = &mut self.areas[idx];
        for bit in [VmFlags::MOVED_FROM_FUTURE, VmFlags::ONCE_ONLY] {
            if a.vm_flags.contains(bit) && !incoming.contains(bit) {
                a.vm_flags.remove(bit);
                trace!(
                    target: "vector",
                    name = self.name,
                    start = format_args!("{:#x}", a.start),
                    ?bit,
                    "flag eroded by overlapping insert"
                );
            }
        }
    }

    /// Combinations that indicate an engine bug, not app behavior. Logged
    /// and tolerated in release; the mismatch path then clips the insert.
    fn check_forbidden(&self, idx: usize, vm: VmFlags, frag: FragFlags) {
        let a = &self.areas[idx];
        let bad = (vm.contains(VmFlags::UNMODIFIED_IMAGE)
            && !a.vm_flags.contains(VmFlags::UNMODIFIED_IMAGE))
            || (vm.contains(VmFlags::WRITABLE) && !a.vm_flags.contains(VmFlags::WRITABLE))
            || (frag.contains(FragFlags::COARSE_GRAIN)
                != a.frag_flags.contains(FragFlags::COARSE_GRAIN))
            || (a.frag_flags.contains(FragFlags::SELFMOD_SANDBOXED)
                && !frag.contains(FragFlags::SELFMOD_SANDBOXED));
        if bad {
            error!(
                target: "vector",
                name = self.name,
                area_start = format_args!("{:#x}", a.start),
                old_vm = ?a.vm_flags,
                new_vm = ?vm,
                old_frag = ?a.frag_flags,
                new_frag = ?frag,
                "forbidden flag combination on overlapping insert"
            );
        }
    }

    /// Merge equal-flag adjacent areas in the neighbourhood of `[start, end)`.
    fn coalesce_range(&mut self, start: AppAddr, end: AppAddr) {
        if self
            .policy
            .intersects(VectorPolicy::NEVER_MERGE | VectorPolicy::NEVER_MERGE_ADJACENT)
        {
            return;
        }
        let mut i = self.first_end_above(start).saturating_sub(1);
        while i + 1 < self.areas.len() {
            if self.areas[i].start > end {
                break;
            }
            let (a, b) = (&self.areas[i], &self.areas[i + 1]);
            if a.end == b.start
                && a.vm_flags == b.vm_flags
                && a.frag_flags == b.frag_flags
                && self.ops.should_merge(&a.data, &b.data)
            {
                let absorbed = self.areas.remove(i + 1);
                let kept = &mut self.areas[i];
                kept.end = absorbed.end;
                self.ops.merge(&mut kept.data, absorbed.data);
            } else {
                i += 1;
            }
        }
    }

    /// Clear `[start, end)`. Returns whether any area was touched.
    pub fn remove(&mut self, start: AppAddr, end: AppAddr) -> Result<bool, VectorError> {
        self.remove_with(start, end, |_| {})
    }

    /// Clear `[start, end)`, reporting each structural change to `on_event`
    /// before it is committed (deleted payloads are freed after the call).
    pub fn remove_with(
        &mut self,
        start: AppAddr,
        end: AppAddr,
        mut on_event: impl FnMut(RemoveEvent<'_, T>),
    ) -> Result<bool, VectorError> {
        self.check_range(start, end)?;
        let mut touched = false;
        let mut i = self.first_end_above(start);
        while i < self.areas.len() && self.areas[i].start < end {
            touched = true;
            let (a_start, a_end) = (self.areas[i].start, self.areas[i].end);
            if start <= a_start && a_end <= end {
                // Entirely inside the removal.
                on_event(RemoveEvent::Deleted(&mut self.areas[i]));
                let dead = self.areas.remove(i);
                self.ops.free(dead.data);
                continue; // same index now holds the next area
            }
            if a_start < start && end < a_end {
                // Removal strictly inside one area: split into two.
                let tail_data = self.ops.split(&mut self.areas[i].data, end);
                let head = &mut self.areas[i];
                head.end = start;
                let mut tail = Area {
                    start: end,
                    end: a_end,
                    vm_flags: head.vm_flags,
                    frag_flags: head.frag_flags,
                    data: tail_data,
                };
                on_event(RemoveEvent::SplitTail {
                    head,
                    tail: &mut tail,
                });
                self.grow_for_insert();
                self.areas.insert(i + 1, tail);
                break; // nothing further can overlap
            }
            if a_start < start {
                // Clip the right of areas[i].
                let area = &mut self.areas[i];
                area.end = start;
                on_event(RemoveEvent::ClippedRight {
                    area,
                    old_end: a_end,
                });
                i += 1;
                continue;
            }
            // Clip the left of areas[i].
            let area = &mut self.areas[i];
            area.start = end;
            on_event(RemoveEvent::ClippedLeft {
                area,
                old_start: a_start,
            });
            break;
        }
        if touched {
            debug!(
                target: "vector",
                name = self.name,
                start = format_args!("{start:#x}"),
                end = format_args!("{end:#x}"),
                len = self.areas.len(),
                "remove"
            );
        }
        debug_assert!(self.is_sorted_disjoint());
        Ok(touched)
    }

    /// Ensure an area boundary exists at `addr`, splitting the containing
    /// area when `addr` falls strictly inside one. Returns whether a split
    /// occurred. Both pieces keep the original flags; the tail payload
    /// comes from the split callback.
    pub fn split_at(&mut self, addr: AppAddr) -> bool {
        let Some(i) = self.lookup_idx(addr) else {
            return false;
        };
        if self.areas[i].start == addr {
            return false;
        }
        let tail_data = self.ops.split(&mut self.areas[i].data, addr);
        let old_end = self.areas[i].end;
        self.areas[i].end = addr;
        let (vm_flags, frag_flags) = (self.areas[i].vm_flags, self.areas[i].frag_flags);
        self.grow_for_insert();
        self.areas.insert(
            i + 1,
            Area {
                start: addr,
                end: old_end,
                vm_flags,
                frag_flags,
                data: tail_data,
            },
        );
        true
    }

    /// Apply `f` to the portion of the vector covered by `[start, end)`,
    /// splitting edge areas first so the mutation lands exactly on the
    /// range. Newly equal neighbours re-coalesce afterwards when the
    /// policy permits.
    pub fn reflag_range(
        &mut self,
        start: AppAddr,
        end: AppAddr,
        mut f: impl FnMut(&mut Area<T>),
    ) {
        self.split_at(start);
        self.split_at(end);
        let mut i = self.first_end_above(start);
        while i < self.areas.len() && self.areas[i].start < end {
            debug_assert!(start <= self.areas[i].start && self.areas[i].end <= end);
            f(&mut self.areas[i]);
            i += 1;
        }
        self.coalesce_range(start, end);
        debug_assert!(self.is_sorted_disjoint());
    }

    /// Debug invariant: sorted by start, non-overlapping.
    pub fn is_sorted_disjoint(&self) -> bool {
        self.areas.windows(2).all(|w| w[0].end <= w[1].start)
            && self.areas.iter().all(|a| a.start < a.end)
    }

    /// Human-readable dump of ranges and flags.
    pub fn dump(&self) -> String {
        use fmt::Write as _;
        let mut out = String::new();
        let _ = writeln!(out, "vector `{}` ({} areas)", self.name, self.areas.len());
        for a in &self.areas {
            let _ = writeln!(
                out,
                "  {:#014x}..{:#014x} vm={:?} frag={:?}",
                a.start, a.end, a.vm_flags, a.frag_flags
            );
        }
        out
    }
}

impl<T> fmt::Debug for IntervalVector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntervalVector")
            .field("name", &self.name)
            .field("len", &self.areas.len())
            .field("policy", &self.policy)
            .finish()
    }
}
