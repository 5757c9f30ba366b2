//! Auxiliary tracking vectors.
//!
//! Small bookkeeping lists sharing the interval-vector machinery but
//! configured differently: silently-nopped writable ranges, ranges whose
//! writes are emulated, the single tamper-resistant system library pair,
//! patch-proof modules, per-module import-table bounds, app-requested
//! icache flush ranges, and the stashed pre-change IAT bytes keyed by
//! table start.

use std::collections::HashMap;
use std::sync::Mutex;

use core_interval::{AppAddr, FragFlags, IntervalVector, SharedVector, VectorPolicy, VmFlags};

pub struct AuxVectors {
    /// Ranges the app believes it made writable; we reported success
    /// without changing protection and nop the writes.
    pub pretend_writable: SharedVector<()>,
    /// Ranges whose writes are single-stepped and emulated.
    pub emulate_write: SharedVector<()>,
    /// Modules for which every write-to-code attempt is blocked.
    pub patch_proof: SharedVector<String>,
    /// Exact import-table bounds per loaded module.
    pub iat: SharedVector<String>,
    /// Ranges the app asked the hardware to treat as new code.
    pub app_flushed: SharedVector<()>,
    /// The OS-loaded system library whose modification is always
    /// suspicious. A single pair, not a vector.
    tamper_resistant: Mutex<Option<(AppAddr, AppAddr)>>,
    /// Stashed pre-change IAT bytes, keyed by table start.
    iat_stash: Mutex<HashMap<AppAddr, Vec<u8>>>,
}

impl Default for AuxVectors {
    fn default() -> Self {
        Self::new()
    }
}

impl AuxVectors {
    pub fn new() -> Self {
        Self {
            pretend_writable: SharedVector::new(IntervalVector::new(
                VectorPolicy::SHARED,
                "pretend-writable",
            )),
            emulate_write: SharedVector::new(IntervalVector::new(
                VectorPolicy::SHARED,
                "emulate-write",
            )),
            patch_proof: SharedVector::new(IntervalVector::new(
                VectorPolicy::SHARED | VectorPolicy::NEVER_MERGE,
                "patch-proof",
            )),
            iat: SharedVector::new(IntervalVector::new(
                VectorPolicy::SHARED | VectorPolicy::NEVER_OVERLAP | VectorPolicy::NEVER_MERGE,
                "iat",
            )),
            app_flushed: SharedVector::new(IntervalVector::new(
                VectorPolicy::SHARED,
                "app-flushed",
            )),
            tamper_resistant: Mutex::new(None),
            iat_stash: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_tamper_resistant(&self, start: AppAddr, end: AppAddr) {
        *self
            .tamper_resistant
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some((start, end));
    }

    pub fn in_tamper_resistant(&self, start: AppAddr, end: AppAddr) -> bool {
        matches!(
            *self
                .tamper_resistant
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
            Some((s, e)) if s < end && start < e
        )
    }

    pub fn note_pretend_writable(&self, start: AppAddr, end: AppAddr) {
        let _ = self
            .pretend_writable
            .add(start, end, VmFlags::empty(), FragFlags::empty(), ());
    }

    pub fn is_pretend_writable(&self, addr: AppAddr) -> bool {
        self.pretend_writable.read().lookup(addr).is_some()
    }

    pub fn register_iat(&self, start: AppAddr, end: AppAddr, module: String) -> bool {
        self.iat
            .add(start, end, VmFlags::empty(), FragFlags::empty(), module)
            .is_ok()
    }

    /// Exact-bounds check used by the IAT-patch heuristic.
    pub fn is_iat_exact(&self, start: AppAddr, end: AppAddr) -> bool {
        let guard = self.iat.read();
        matches!(guard.lookup(start), Some(a) if a.start == start && a.end == end)
    }

    pub fn stash_iat(&self, start: AppAddr, bytes: Vec<u8>) {
        self.iat_stash
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(start, bytes);
    }

    pub fn take_iat_stash(&self, start: AppAddr) -> Option<Vec<u8>> {
        self.iat_stash
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&start)
    }

    /// Drop every record overlapping an unmapped range.
    pub fn forget_range(&self, start: AppAddr, end: AppAddr) {
        let _ = self.pretend_writable.remove(start, end);
        let _ = self.emulate_write.remove(start, end);
        let _ = self.patch_proof.remove(start, end);
        let _ = self.iat.remove(start, end);
        let _ = self.app_flushed.remove(start, end);
        self.iat_stash
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|&k, _| k < start || k >= end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tamper_resistant_single_pair() {
        let aux = AuxVectors::new();
        assert!(!aux.in_tamper_resistant(0x1000, 0x2000));
        aux.set_tamper_resistant(0x7000_0000, 0x7100_0000);
        assert!(aux.in_tamper_resistant(0x7000_1000, 0x7000_2000));
        assert!(!aux.in_tamper_resistant(0x6000_0000, 0x7000_0000));
    }

    #[test]
    fn iat_exact_bounds_only() {
        let aux = AuxVectors::new();
        assert!(aux.register_iat(0x1000, 0x1200, "app.dll".into()));
        assert!(aux.is_iat_exact(0x1000, 0x1200));
        assert!(!aux.is_iat_exact(0x1000, 0x1100));
        assert!(!aux.is_iat_exact(0x1100, 0x1200));
        // Overlapping registration is a caller bug and is rejected.
        assert!(!aux.register_iat(0x1100, 0x1300, "other.dll".into()));
    }

    #[test]
    fn stash_round_trip() {
        let aux = AuxVectors::new();
        aux.stash_iat(0x1000, vec![1, 2, 3]);
        assert_eq!(aux.take_iat_stash(0x1000), Some(vec![1, 2, 3]));
        assert_eq!(aux.take_iat_stash(0x1000), None);
    }

    #[test]
    fn forget_range_clears_everything() {
        let aux = AuxVectors::new();
        aux.note_pretend_writable(0x1000, 0x2000);
        assert!(aux.register_iat(0x1400, 0x1600, "m.dll".into()));
        aux.stash_iat(0x1400, vec![9]);
        aux.forget_range(0x0, 0x10000);
        assert!(!aux.is_pretend_writable(0x1800));
        assert!(!aux.is_iat_exact(0x1400, 0x1600));
        assert_eq!(aux.take_iat_stash(0x1400), None);
    }
}
