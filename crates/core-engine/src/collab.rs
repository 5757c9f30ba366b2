//! Collaborator seams.
//!
//! The engine never performs page-protection syscalls, owns no translated
//! code storage, and never parses module images; those concerns are
//! supplied by the embedder through the traits here. Everything the engine
//! consumes from them is read-mostly and narrow on purpose.

use core_interval::{AppAddr, PageProt};

/// Opaque handle to one translated code block, issued by the translator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHandle(pub u64);

/// Opaque handle to a coarse code unit, issued by the coarse collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoarseUnitId(pub u64);

/// One OS-level memory region as reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsRegion {
    pub start: AppAddr,
    pub end: AppAddr,
    pub prot: PageProt,
}

/// Page-protection syscalls and app memory access.
pub trait PageProtector: Send + Sync {
    /// The OS region containing `addr`, if mapped.
    fn query(&self, addr: AppAddr) -> Option<OsRegion>;

    /// Change protection of `[start, end)`. Page-aligned by the caller.
    fn protect(&self, start: AppAddr, end: AppAddr, prot: PageProt) -> anyhow::Result<()>;

    /// Read app memory, as much as is mapped.
    fn read_memory(&self, addr: AppAddr, len: usize) -> Option<Vec<u8>>;
}

/// Bulk-translation unit storage. The engine chains, invalidates, and
/// frees units but never looks inside them.
pub trait CoarseUnitOps: Send + Sync {
    fn alloc(&self, start: AppAddr, end: AppAddr) -> CoarseUnitId;

    /// Drop one reference; the unit is freed when the collaborator's own
    /// count reaches zero.
    fn free(&self, unit: CoarseUnitId);

    /// Discard the unit's contents (blocks, hashtables). The handle stays
    /// valid.
    fn reset(&self, unit: CoarseUnitId);

    fn is_frozen(&self, unit: CoarseUnitId) -> bool;

    fn is_persisted(&self, unit: CoarseUnitId) -> bool;
}

/// Operations on individual translated blocks, supplied by the translator.
pub trait BlockOps: Send + Sync {
    /// Remove the block from dispatch tables and detach it from the block
    /// chain. After this no thread can newly enter the block.
    fn unlink_block(&self, block: BlockHandle);

    /// Release the block's cache storage. The flush engine calls this
    /// strictly in flush timestamp order.
    fn free_block(&self, block: BlockHandle);

    /// Detach only incoming direct links (private block retirement).
    fn unlink_incoming(&self, block: BlockHandle);
}

/// Loaded-module queries.
pub trait ModuleIndex: Send + Sync {
    fn module_name(&self, addr: AppAddr) -> Option<String>;

    fn module_bounds(&self, addr: AppAddr) -> Option<(AppAddr, AppAddr)>;

    /// Is `addr` inside the text section of a loaded module?
    fn in_text(&self, addr: AppAddr) -> bool;

    /// Is `addr` inside any section of a loaded module?
    fn in_any_section(&self, addr: AppAddr) -> bool;

    /// Import-address-table bounds of the module containing `addr`.
    fn iat_bounds(&self, addr: AppAddr) -> Option<(AppAddr, AppAddr)>;

    fn is_vsyscall(&self, _addr: AppAddr) -> bool {
        false
    }

    fn on_thread_stack(&self, _addr: AppAddr) -> bool {
        false
    }

    fn is_driver_address(&self, _addr: AppAddr) -> bool {
        false
    }
}

/// Verdict for an intercepted protection-change syscall, decided before
/// the syscall is dispatched to the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtDecision {
    /// Let the change through unmodified.
    ApplyChange,
    /// Fail the syscall back to the app.
    FailSyscall,
    /// Skip the syscall but report success to the app.
    PretendSuccess,
    /// Apply, but with this protection instead of the requested one.
    ApplyToSubsetOnly { prot: PageProt },
}
