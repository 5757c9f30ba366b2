//! Coarse unit bookkeeping.
//!
//! An area with coarse-grain code owns at most two chained unit records:
//! a primary, possibly frozen or loaded from a persisted file, and an
//! optional secondary that is always non-frozen and receives newly built
//! blocks. The engine never looks inside a unit; it allocates, chains,
//! invalidates, and frees units through the coarse collaborator and
//! tracks only the persistence flags and the sub-range each unit covers.

use core_interval::AppAddr;
use tracing::debug;

use crate::collab::{CoarseUnitId, CoarseUnitOps};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoarseUnit {
    pub id: CoarseUnitId,
    /// Range covered within the enclosing area; a sub-interval, possibly
    /// equal to the area bounds.
    pub start: AppAddr,
    pub end: AppAddr,
    /// Bytes came from a persisted file.
    pub persisted: bool,
    /// Frozen units accept no new blocks.
    pub frozen: bool,
    /// Bytes on disk no longer match source; set across a writable
    /// window, cleared when the rebind check passes.
    pub code_invalid: bool,
}

/// The unit chain owned by one coarse area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoarseHandle {
    pub primary: CoarseUnit,
    /// Always non-frozen; chained on first build when the primary cannot
    /// accept blocks.
    pub secondary: Option<CoarseUnit>,
}

impl CoarseHandle {
    /// Allocate a fresh non-frozen unit for a new coarse area.
    pub fn fresh(ops: &dyn CoarseUnitOps, start: AppAddr, end: AppAddr) -> Self {
        let id = ops.alloc(start, end);
        Self {
            primary: CoarseUnit {
                id,
                start,
                end,
                persisted: false,
                frozen: false,
                code_invalid: false,
            },
            secondary: None,
        }
    }

    /// Adopt a unit the collaborator loaded from disk.
    pub fn adopt_persisted(id: CoarseUnitId, start: AppAddr, end: AppAddr) -> Self {
        Self {
            primary: CoarseUnit {
                id,
                start,
                end,
                persisted: true,
                frozen: true,
                code_invalid: false,
            },
            secondary: None,
        }
    }

    /// The unit that accepts new blocks. A frozen primary never stands
    /// alone: the non-frozen secondary is chained here on first build.
    pub fn writable_unit(&mut self, ops: &dyn CoarseUnitOps) -> CoarseUnitId {
        if !self.primary.frozen && !ops.is_frozen(self.primary.id) {
            return self.primary.id;
        }
        if let Some(ref s) = self.secondary {
            return s.id;
        }
        let id = ops.alloc(self.primary.start, self.primary.end);
        debug!(
            target: "catalog",
            primary = self.primary.id.0,
            secondary = id.0,
            "secondary coarse unit chained"
        );
        self.secondary = Some(CoarseUnit {
            id,
            start: self.primary.start,
            end: self.primary.end,
            persisted: false,
            frozen: false,
            code_invalid: false,
        });
        id
    }

    pub fn mark_code_invalid(&mut self) {
        if self.primary.persisted {
            self.primary.code_invalid = true;
        }
        if let Some(ref mut s) = self.secondary
            && s.persisted
        {
            s.code_invalid = true;
        }
    }

    pub fn clear_code_invalid(&mut self) {
        self.primary.code_invalid = false;
        if let Some(ref mut s) = self.secondary {
            s.code_invalid = false;
        }
    }

    pub fn any_code_invalid(&self) -> bool {
        self.primary.code_invalid
            || self.secondary.as_ref().is_some_and(|s| s.code_invalid)
    }

    /// Exact-bounds check used by the rebind path. A rebased module makes
    /// the bounds mismatch and the unit is discarded rather than
    /// translated.
    pub fn covers_exactly(&self, start: AppAddr, end: AppAddr) -> bool {
        self.primary.start == start && self.primary.end == end
    }

    /// Discard the chain and replace it with one fresh non-persisted
    /// unit. Used when a dirty rebind drops persisted code.
    pub fn drop_and_replace(&mut self, ops: &dyn CoarseUnitOps, start: AppAddr, end: AppAddr) {
        ops.reset(self.primary.id);
        ops.free(self.primary.id);
        if let Some(s) = self.secondary.take() {
            ops.reset(s.id);
            ops.free(s.id);
        }
        *self = Self::fresh(ops, start, end);
    }

    /// Clamp unit ranges after the enclosing area was clipped.
    pub fn rebase(&mut self, area_start: AppAddr, area_end: AppAddr) {
        let clamp = |u: &mut CoarseUnit| {
            u.start = u.start.max(area_start);
            u.end = u.end.min(area_end);
            if u.start > u.end {
                u.start = u.end;
            }
        };
        clamp(&mut self.primary);
        if let Some(ref mut s) = self.secondary {
            clamp(s);
        }
    }

    /// Release every unit reference. Consumes the handle.
    pub fn free_all(self, ops: &dyn CoarseUnitOps) {
        ops.free(self.primary.id);
        if let Some(s) = self.secondary {
            ops.free(s.id);
        }
    }
}
