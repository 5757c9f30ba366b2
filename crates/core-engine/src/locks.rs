//! Rank-ordered lock wrappers.
//!
//! Cross-vector invariants are protected by a fixed set of named locks.
//! Their acquisition order is a partial order baked into [`LockRank`]:
//! a thread may only acquire a lock ranked strictly above everything it
//! already holds. Debug builds check the order at runtime; release builds
//! compile the checks away. Recursion is permitted only on the host-heap
//! rank and is bounded at 4, matching the catalog-grows-the-catalog
//! re-entry depth observed in practice.

use std::cell::RefCell;
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquisition order: lower ranks first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockRank {
    AllThreadsSynch,
    ThreadInitExit,
    SharedCacheFlush,
    ChangeLinking,
    SharedDelete,
    LazyDelete,
    ThreadViewAreas,
    SharedViewAreas,
    ExecutableAreas,
    CoarseInfo,
    SpecialHeap,
    HostHeap,
}

pub const HOST_HEAP_MAX_RECURSION: usize = 4;

thread_local! {
    static HELD: RefCell<Vec<LockRank>> = const { RefCell::new(Vec::new()) };
}

fn push_rank(rank: LockRank) {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        if cfg!(debug_assertions)
            && let Some(&top) = held.last()
        {
            if rank == LockRank::HostHeap && top == LockRank::HostHeap {
                let depth = held.iter().filter(|&&r| r == LockRank::HostHeap).count();
                debug_assert!(
                    depth < HOST_HEAP_MAX_RECURSION,
                    "host heap lock recursion exceeded {HOST_HEAP_MAX_RECURSION}"
                );
            } else {
                debug_assert!(
                    rank > top,
                    "lock rank violation: acquiring {rank:?} while holding {top:?}"
                );
            }
        }
        held.push(rank);
    });
}

fn pop_rank(rank: LockRank) {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        // Guards drop in reverse acquisition order in well-formed code,
        // but out-of-order drops are legal; remove the matching entry.
        if let Some(pos) = held.iter().rposition(|&r| r == rank) {
            held.remove(pos);
        }
    });
}

/// Mutex tagged with a [`LockRank`].
pub struct RankedMutex<T> {
    rank: LockRank,
    inner: Mutex<T>,
}

pub struct RankedMutexGuard<'a, T> {
    rank: LockRank,
    guard: MutexGuard<'a, T>,
}

impl<T> RankedMutex<T> {
    pub fn new(rank: LockRank, value: T) -> Self {
        Self {
            rank,
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> RankedMutexGuard<'_, T> {
        push_rank(self.rank);
        RankedMutexGuard {
            rank: self.rank,
            guard: self.inner.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }
}

impl<T> std::ops::Deref for RankedMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> std::ops::DerefMut for RankedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for RankedMutexGuard<'_, T> {
    fn drop(&mut self) {
        pop_rank(self.rank);
    }
}

/// Reader/writer lock tagged with a [`LockRank`].
pub struct RankedRwLock<T> {
    rank: LockRank,
    inner: RwLock<T>,
}

pub struct RankedReadGuard<'a, T> {
    rank: LockRank,
    guard: RwLockReadGuard<'a, T>,
}

pub struct RankedWriteGuard<'a, T> {
    rank: LockRank,
    guard: RwLockWriteGuard<'a, T>,
}

impl<T> RankedRwLock<T> {
    pub fn new(rank: LockRank, value: T) -> Self {
        Self {
            rank,
            inner: RwLock::new(value),
        }
    }

    pub fn read(&self) -> RankedReadGuard<'_, T> {
        push_rank(self.rank);
        RankedReadGuard {
            rank: self.rank,
            guard: self.inner.read().unwrap_or_else(|e| e.into_inner()),
        }
    }

    pub fn write(&self) -> RankedWriteGuard<'_, T> {
        push_rank(self.rank);
        RankedWriteGuard {
            rank: self.rank,
            guard: self.inner.write().unwrap_or_else(|e| e.into_inner()),
        }
    }
}

impl<T> std::ops::Deref for RankedReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> Drop for RankedReadGuard<'_, T> {
    fn drop(&mut self) {
        pop_rank(self.rank);
    }
}

impl<T> std::ops::Deref for RankedWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> std::ops::DerefMut for RankedWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for RankedWriteGuard<'_, T> {
    fn drop(&mut self) {
        pop_rank(self.rank);
    }
}
