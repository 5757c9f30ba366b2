//! Engine telemetry counters.
//!
//! Simple atomic counters (no locking, fetch_add relaxed). Inspectable in
//! unit tests and periodically logged by embedders; not a metrics system.

use std::sync::atomic::AtomicU64;

pub static CATALOG_ADDS: AtomicU64 = AtomicU64::new(0);
pub static CATALOG_REMOVES: AtomicU64 = AtomicU64::new(0);
pub static FLUSHES_PRIVATE: AtomicU64 = AtomicU64::new(0);
pub static FLUSHES_SHARED: AtomicU64 = AtomicU64::new(0);
pub static FLUSHES_ALLSYNCH: AtomicU64 = AtomicU64::new(0);
pub static PENDING_ENTRIES_FREED: AtomicU64 = AtomicU64::new(0);
pub static LAZY_PROMOTIONS: AtomicU64 = AtomicU64::new(0);
pub static RO_DOWNGRADES: AtomicU64 = AtomicU64::new(0); // delayed RO applied
pub static SANDBOX_CONVERSIONS: AtomicU64 = AtomicU64::new(0); // RO -> sandbox
pub static UNSANDBOX_CONVERSIONS: AtomicU64 = AtomicU64::new(0); // sandbox -> RO
pub static WRITE_FAULTS_HANDLED: AtomicU64 = AtomicU64::new(0);
pub static IAT_STASHES: AtomicU64 = AtomicU64::new(0);
pub static IAT_REBINDS_CLEAN: AtomicU64 = AtomicU64::new(0);
pub static IAT_REBINDS_DIRTY: AtomicU64 = AtomicU64::new(0);
