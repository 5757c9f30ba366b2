//! Flush engine.
//!
//! Three variants in increasing heaviness: a private flush frees a
//! thread's own blocks immediately; a shared flush unlinks under the
//! shared view's write lock and parks the blocks on a pending-deletion
//! list until every observed thread has passed a safe point; individual
//! shared blocks retired outside a region flush queue on a lazy list that
//! is periodically promoted into one pending entry.
//!
//! Pending entries are freed strictly in timestamp order because the
//! cache allocator relies on that ordering: only the oldest entry is ever
//! popped, even when a newer entry's count reaches zero first.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use core_interval::AppAddr;
use tracing::{debug, info};

use crate::collab::{BlockHandle, BlockOps};
use crate::locks::{LockRank, RankedMutex, RankedRwLock};
use crate::stats;
use crate::views::View;

/// One chain of unlinked blocks awaiting acknowledgement.
#[derive(Debug)]
pub struct PendingEntry {
    pub blocks: Vec<BlockHandle>,
    /// Threads that have not yet passed a safe point since phase 1.
    pub refcount: u32,
    pub timestamp: u64,
}

pub struct FlushState {
    /// `flushtime_global`; writes serialized with producer operations on
    /// both lists.
    flushtime: RankedMutex<u64>,
    /// Front holds the newest entry; the back (lowest timestamp) frees
    /// first.
    pending: RankedMutex<VecDeque<PendingEntry>>,
    /// Individually retired shared blocks, each stamped flushtime+1.
    lazy: RankedMutex<Vec<(BlockHandle, u64)>>,
    /// Single-producer guard for lazy promotion.
    promoting: AtomicBool,
    /// Pending entries created since the last full reset; drives the
    /// every-Nth-pending reset recommendation.
    entries_created: AtomicU64,
}

impl Default for FlushState {
    fn default() -> Self {
        Self::new()
    }
}

impl FlushState {
    pub fn new() -> Self {
        Self {
            flushtime: RankedMutex::new(LockRank::SharedCacheFlush, 0),
            pending: RankedMutex::new(LockRank::SharedDelete, VecDeque::new()),
            lazy: RankedMutex::new(LockRank::LazyDelete, Vec::new()),
            promoting: AtomicBool::new(false),
            entries_created: AtomicU64::new(0),
        }
    }

    pub fn entries_since_reset(&self) -> u64 {
        self.entries_created.load(Ordering::Relaxed)
    }

    pub fn note_reset(&self) {
        self.entries_created.store(0, Ordering::Relaxed);
    }

    pub fn flushtime(&self) -> u64 {
        *self.flushtime.lock()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn lazy_len(&self) -> usize {
        self.lazy.lock().len()
    }

    /// Phase 1 of a shared flush: under the view write lock, unlink every
    /// block sourced from `[start, end)` and move the set onto the
    /// pending list stamped with the next flushtime. Returns the stamp,
    /// or `None` when the region held no blocks.
    pub fn flush_shared_start(
        &self,
        view: &RankedRwLock<View>,
        start: AppAddr,
        end: AppAddr,
        threads_to_ack: u32,
        block_ops: &dyn BlockOps,
    ) -> Option<u64> {
        let mut ft = self.flushtime.lock();
        let mut pending = self.pending.lock();
        let mut view = view.write();
        let drained = view.drain_region(start, end);
        if drained.is_empty() {
            return None;
        }
        for b in &drained {
            block_ops.unlink_block(*b);
        }
        *ft += 1;
        let timestamp = *ft;
        info!(
            target: "flush",
            start = format_args!("{start:#x}"),
            end = format_args!("{end:#x}"),
            blocks = drained.len(),
            timestamp,
            threads_to_ack,
            "shared flush started"
        );
        pending.push_front(PendingEntry {
            blocks: drained,
            refcount: threads_to_ack,
            timestamp,
        });
        self.entries_created.fetch_add(1, Ordering::Relaxed);
        stats::FLUSHES_SHARED.fetch_add(1, Ordering::Relaxed);
        Some(timestamp)
    }

    /// Phase 2, run by each thread at a safe point between cache exits:
    /// acknowledge every entry newer than the thread's watermark, then
    /// free acknowledged entries from the oldest end. Returns the number
    /// of blocks freed by this call.
    pub fn thread_check_flushtime(
        &self,
        last_seen: &AtomicU64,
        block_ops: &dyn BlockOps,
    ) -> usize {
        let mut pending = self.pending.lock();
        let seen = last_seen.load(Ordering::Acquire);
        let mut max_ts = seen;
        // Newest first; stop at the first already-acknowledged entry
        // (everything behind it is older and already counted).
        for entry in pending.iter_mut() {
            if seen >= entry.timestamp {
                break;
            }
            debug_assert!(entry.refcount > 0, "more acks than counted threads");
            entry.refcount -= 1;
            max_ts = max_ts.max(entry.timestamp);
        }
        last_seen.store(max_ts, Ordering::Release);

        let mut freed = 0;
        while let Some(back) = pending.back() {
            if back.refcount != 0 {
                break;
            }
            let entry = pending.pop_back().expect("checked non-empty");
            debug!(
                target: "flush",
                timestamp = entry.timestamp,
                blocks = entry.blocks.len(),
                "pending entry freed"
            );
            for b in entry.blocks {
                block_ops.free_block(b);
                freed += 1;
            }
            stats::PENDING_ENTRIES_FREED.fetch_add(1, Ordering::Relaxed);
        }
        freed
    }

    /// Queue one individually retired shared block.
    pub fn lazy_add(&self, block: BlockHandle, block_ops: &dyn BlockOps) {
        block_ops.unlink_block(block);
        let stamp = *self.flushtime.lock() + 1;
        self.lazy.lock().push((block, stamp));
    }

    /// Promote the whole lazy list into a single pending entry once it
    /// exceeds `max_pending`. The single-producer flag keeps concurrent
    /// noticers from double-promoting. Returns whether promotion ran.
    pub fn maybe_promote_lazy(&self, max_pending: usize, threads_to_ack: u32) -> bool {
        if self.lazy.lock().len() <= max_pending {
            return false;
        }
        if self.promoting.swap(true, Ordering::AcqRel) {
            return false;
        }
        let promoted = {
            let mut ft = self.flushtime.lock();
            let mut pending = self.pending.lock();
            let mut lazy = self.lazy.lock();
            if lazy.len() > max_pending {
                *ft += 1;
                let timestamp = *ft;
                let blocks: Vec<BlockHandle> = lazy.drain(..).map(|(b, _)| b).collect();
                info!(
                    target: "flush",
                    blocks = blocks.len(),
                    timestamp,
                    "lazy list promoted"
                );
                pending.push_front(PendingEntry {
                    blocks,
                    refcount: threads_to_ack,
                    timestamp,
                });
                self.entries_created.fetch_add(1, Ordering::Relaxed);
                stats::LAZY_PROMOTIONS.fetch_add(1, Ordering::Relaxed);
                true
            } else {
                false
            }
        };
        self.promoting.store(false, Ordering::Release);
        promoted
    }

    /// Allsynched teardown: with every observed thread quiesced by the
    /// caller, free all parked blocks immediately, oldest entries first.
    pub fn flush_all_synched(&self, block_ops: &dyn BlockOps) -> usize {
        let _ft = self.flushtime.lock();
        let mut pending = self.pending.lock();
        let mut lazy = self.lazy.lock();
        let mut freed = 0;
        while let Some(entry) = pending.pop_back() {
            for b in entry.blocks {
                block_ops.free_block(b);
                freed += 1;
            }
        }
        for (b, _) in lazy.drain(..) {
            block_ops.free_block(b);
            freed += 1;
        }
        stats::FLUSHES_ALLSYNCH.fetch_add(1, Ordering::Relaxed);
        freed
    }
}
