//! Reader/writer-locked wrapper for vectors shared between threads.
//!
//! Mutations take the write lock; queries take the read lock. Iteration
//! holds the read guard for the iterator's lifetime, so the iterating
//! thread must not mutate the vector until the iterator is dropped.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{AppAddr, FragFlags, IntervalVector, VectorError, VmFlags};

pub struct SharedVector<T> {
    inner: RwLock<IntervalVector<T>>,
}

impl<T> SharedVector<T> {
    pub fn new(vector: IntervalVector<T>) -> Self {
        Self {
            inner: RwLock::new(vector),
        }
    }

    /// Read guard over the underlying vector.
    pub fn read(&self) -> RwLockReadGuard<'_, IntervalVector<T>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Write guard over the underlying vector.
    pub fn write(&self) -> RwLockWriteGuard<'_, IntervalVector<T>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(
        &self,
        start: AppAddr,
        end: AppAddr,
        vm_flags: VmFlags,
        frag_flags: FragFlags,
        data: T,
    ) -> Result<(), VectorError> {
        self.write().add(start, end, vm_flags, frag_flags, data)
    }

    pub fn remove(&self, start: AppAddr, end: AppAddr) -> Result<bool, VectorError> {
        self.write().remove(start, end)
    }

    pub fn overlap(&self, start: AppAddr, end: AppAddr) -> bool {
        self.read().overlap(start, end)
    }

    pub fn modify_payload(&self, start: AppAddr, end: AppAddr, data: T) -> bool {
        self.write().modify_payload(start, end, data)
    }

    /// Cursor over `(start, end, payload)` triples, holding the read lock.
    pub fn iterate(&self) -> SharedIter<'_, T> {
        SharedIter {
            guard: self.read(),
            idx: 0,
        }
    }
}

impl<T: Clone> SharedVector<T> {
    /// Point query returning a payload copy (payloads are cheap handles).
    pub fn lookup_data(&self, addr: AppAddr) -> Option<T> {
        self.read().lookup_data(addr).cloned()
    }
}

/// Read-locked cursor. Not a `std::iter::Iterator`: items borrow from the
/// held guard, so this lends instead.
pub struct SharedIter<'a, T> {
    guard: RwLockReadGuard<'a, IntervalVector<T>>,
    idx: usize,
}

impl<T> SharedIter<'_, T> {
    pub fn has_next(&self) -> bool {
        self.idx < self.guard.len()
    }

    pub fn peek(&self) -> Option<(AppAddr, AppAddr, &T)> {
        self.guard
            .iter()
            .nth(self.idx)
            .map(|a| (a.start, a.end, &a.data))
    }

    pub fn next(&mut self) -> Option<(AppAddr, AppAddr, &T)> {
        let item = self
            .guard
            .iter()
            .nth(self.idx)
            .map(|a| (a.start, a.end, &a.data));
        if item.is_some() {
            self.idx += 1;
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VectorPolicy;

    #[test]
    fn shared_add_lookup_iterate() {
        let shared = SharedVector::new(IntervalVector::<u32>::new(
            VectorPolicy::SHARED,
            "shared-test",
        ));
        shared
            .add(0x1000, 0x2000, VmFlags::empty(), FragFlags::empty(), 11)
            .unwrap();
        shared
            .add(0x4000, 0x5000, VmFlags::empty(), FragFlags::empty(), 22)
            .unwrap();
        assert_eq!(shared.lookup_data(0x1800), Some(11));
        assert!(shared.overlap(0x4800, 0x6000));

        let mut it = shared.iterate();
        let mut seen = Vec::new();
        while let Some((s, e, d)) = it.next() {
            seen.push((s, e, *d));
        }
        assert_eq!(seen, vec![(0x1000, 0x2000, 11), (0x4000, 0x5000, 22)]);
        drop(it);

        assert!(shared.remove(0x1000, 0x2000).unwrap());
        assert_eq!(shared.lookup_data(0x1800), None);
    }

    #[test]
    fn concurrent_readers() {
        let shared = std::sync::Arc::new(SharedVector::new(IntervalVector::<u32>::new(
            VectorPolicy::SHARED,
            "mt",
        )));
        for i in 0..64u64 {
            shared
                .add(
                    i * 0x1000,
                    i * 0x1000 + 0x800,
                    VmFlags::empty(),
                    FragFlags::empty(),
                    i as u32,
                )
                .unwrap();
        }
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let s = shared.clone();
                std::thread::spawn(move || {
                    for i in 0..64u64 {
                        assert_eq!(s.lookup_data(i * 0x1000), Some(i as u32));
                        assert!(!s.overlap(i * 0x1000 + 0x800, (i + 1) * 0x1000));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
