//! Flag vocabulary shared by every interval vector in the engine.
//!
//! `VmFlags` describe properties of the tracked app range itself,
//! `FragFlags` describe how code built from the range is generated, and
//! `VectorPolicy` selects per-vector container behavior at construction.

use bitflags::bitflags;

bitflags! {
    /// Properties of an application address range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VmFlags: u32 {
        /// The app currently has write permission on the range.
        const WRITABLE = 1 << 0;
        /// Range backs an image section that has never been written.
        const UNMODIFIED_IMAGE = 1 << 1;
        /// Area has been detached onto a pending-deletion list.
        const ON_DELETE_QUEUE = 1 << 2;
        /// Area was promoted out of the future-executable list.
        const MOVED_FROM_FUTURE = 1 << 3;
        /// Range belongs to the host tool's own heap.
        const HOST_HEAP = 1 << 4;
        /// Entry is consumed on first use.
        const ONCE_ONLY = 1 << 5;
        /// The engine downgraded the range's protection to read-only.
        const MADE_READ_ONLY = 1 << 6;
        /// Writable code range whose read-only downgrade is deferred
        /// until the first block is built from it.
        const DELAY_READ_ONLY = 1 << 7;
        /// Pattern-matched trampoline bytes; re-verify on next encounter.
        const PATTERN_REVERIFY = 1 << 8;
        /// Range lies in driver-owned address space.
        const DRIVER_ADDRESS = 1 << 9;
        /// Coarse code for the range was loaded from a persisted unit.
        const PERSISTED_CACHE = 1 << 10;
        /// At least one block has been built from this range.
        const EXECUTED_FROM = 1 << 11;
        /// Copy into the shared view lazily on the first catalog query
        /// rather than at insert time.
        const ADD_TO_SHARED_ON_FIRST_QUERY = 1 << 12;
        /// Range is managed by a cooperating JIT that reports flushes.
        const JIT_MANAGED = 1 << 13;
    }
}

bitflags! {
    /// How translated code built from a range is generated.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FragFlags: u32 {
        /// Emitted blocks carry self-write guards; range stays writable.
        const SELFMOD_SANDBOXED = 1 << 0;
        /// Blocks are built in bulk into a (possibly persisted) coarse unit.
        const COARSE_GRAIN = 1 << 1;
        /// Range holds dynamically generated code.
        const DYNGEN = 1 << 2;
    }
}

bitflags! {
    /// Per-vector container behavior, fixed at construction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VectorPolicy: u32 {
        /// Vector is shared between threads and carries its own rw-lock.
        const SHARED = 1 << 0;
        /// Never merge areas, overlapping or adjacent.
        const NEVER_MERGE = 1 << 1;
        /// Merge on compatible overlap but never on mere adjacency.
        const NEVER_MERGE_ADJACENT = 1 << 2;
        /// Overlapping insert is a caller bug; fail instead of resolving.
        const NEVER_OVERLAP = 1 << 3;
        /// Payloads are fragment-list heads with splice-on-merge semantics.
        const FRAGMENT_LIST = 1 << 4;
        /// Callers hold external serialization; skip internal locking.
        const NO_LOCK = 1 << 5;
    }
}

bitflags! {
    /// OS page protection as observed or requested by the app. Protection
    /// transitions are what drive area flag transitions, so the vocabulary
    /// lives next to the flags it feeds.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PageProt: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl PageProt {
    pub fn is_rx(self) -> bool {
        self.contains(PageProt::READ | PageProt::EXEC) && !self.contains(PageProt::WRITE)
    }

    pub fn is_writable(self) -> bool {
        self.contains(PageProt::WRITE)
    }

    pub fn is_executable(self) -> bool {
        self.contains(PageProt::EXEC)
    }
}

impl VmFlags {
    /// Intra-set consistency: the read-only conversions only make sense on
    /// a range the app mapped writable.
    pub fn is_consistent(self) -> bool {
        if self.intersects(VmFlags::MADE_READ_ONLY | VmFlags::DELAY_READ_ONLY) {
            self.contains(VmFlags::WRITABLE)
        } else {
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn made_read_only_requires_writable() {
        assert!(!VmFlags::MADE_READ_ONLY.is_consistent());
        assert!((VmFlags::MADE_READ_ONLY | VmFlags::WRITABLE).is_consistent());
        assert!(!VmFlags::DELAY_READ_ONLY.is_consistent());
        assert!(VmFlags::empty().is_consistent());
    }
}
