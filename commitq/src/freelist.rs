// Copyright (C) 2025 Category Labs, Inc.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Lock-free free-list over a fixed arena of entries.
//!
//! Entries and link nodes are parallel arrays addressed by the same index;
//! the head carries a generation counter packed into the same atomic word
//! so a stale compare-and-swap on a recycled index cannot succeed (the ABA
//! problem).

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};

use crossbeam::utils::CachePadded;

use crate::sync::{AtomicU32, AtomicU64, Ordering};

/// Link value marking the end of the list.
pub const NIL_INDEX: u32 = u32::MAX;

#[inline]
fn pack(generation: u32, index: u32) -> u64 {
    ((generation as u64) << 32) | index as u64
}

#[inline]
fn unpack(head: u64) -> (u32, u32) {
    ((head >> 32) as u32, head as u32)
}

/// Fixed pool of `T` with lock-free O(1) acquire and release, safe to use
/// from signal-handler context.
///
/// A given entry is either on the free list or checked out to exactly one
/// [`Lease`]; the structure performs no ownership tracking beyond the list
/// itself, so an index reconstructed with [`FreeList::lease_from_index`]
/// must come from [`Lease::into_index`] on the same list.
pub struct FreeList<T> {
    head: CachePadded<AtomicU64>,
    links: Box<[AtomicU32]>,
    entries: Box<[UnsafeCell<T>]>,
}

unsafe impl<T: Send> Send for FreeList<T> {}
unsafe impl<T: Send> Sync for FreeList<T> {}

impl<T> FreeList<T> {
    /// Build a pool of `count` entries, each initialized by `init`. All
    /// allocation happens here; steady-state operation is allocation-free.
    pub fn new(count: usize, mut init: impl FnMut() -> T) -> Self {
        assert!(count > 0, "free list must hold at least one entry");
        assert!(
            count < NIL_INDEX as usize,
            "free list index space exhausted"
        );

        let entries: Box<[UnsafeCell<T>]> =
            (0..count).map(|_| UnsafeCell::new(init())).collect();
        let links: Box<[AtomicU32]> = (0..count)
            .map(|i| {
                let next = if i + 1 < count { (i + 1) as u32 } else { NIL_INDEX };
                AtomicU32::new(next)
            })
            .collect();

        FreeList {
            head: CachePadded::new(AtomicU64::new(pack(0, 0))),
            links,
            entries,
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Check out an entry, or `None` if the list is exhausted. The
    /// drop-or-spin policy on exhaustion belongs to the caller.
    pub fn acquire(&self) -> Option<Lease<'_, T>> {
        let mut observed = self.head.load(Ordering::Acquire);
        loop {
            let (generation, index) = unpack(observed);
            if index == NIL_INDEX {
                return None;
            }
            let next = self.links[index as usize].load(Ordering::Relaxed);
            let desired = pack(generation.wrapping_add(1), next);
            match self.head.compare_exchange_weak(
                observed,
                desired,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(Lease { list: self, index }),
                Err(head) => observed = head,
            }
        }
    }

    fn release(&self, index: u32) {
        debug_assert!((index as usize) < self.links.len());
        let mut observed = self.head.load(Ordering::Relaxed);
        loop {
            let (generation, head_index) = unpack(observed);
            self.links[index as usize].store(head_index, Ordering::Relaxed);
            let desired = pack(generation.wrapping_add(1), index);
            match self.head.compare_exchange_weak(
                observed,
                desired,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(head) => observed = head,
            }
        }
    }

    /// Reconstruct a lease from a bare index, typically after the index
    /// traveled through a commit queue.
    ///
    /// # Safety
    ///
    /// `index` must have come from [`Lease::into_index`] on this list and
    /// must not have been reconstructed already; otherwise two live owners
    /// would alias the same entry.
    pub unsafe fn lease_from_index(&self, index: u32) -> Lease<'_, T> {
        debug_assert!((index as usize) < self.entries.len());
        Lease { list: self, index }
    }
}

/// Exclusive checkout of one pool entry; returns it to the list on drop.
pub struct Lease<'a, T> {
    list: &'a FreeList<T>,
    index: u32,
}

impl<'a, T> Lease<'a, T> {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Give up the RAII return and hand the bare index to the caller, who
    /// becomes responsible for releasing it via
    /// [`FreeList::lease_from_index`].
    pub fn into_index(self) -> u32 {
        let index = self.index;
        std::mem::forget(self);
        index
    }
}

impl<'a, T> Deref for Lease<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // The list invariant guarantees at most one live lease per index.
        unsafe { &*self.list.entries[self.index as usize].get() }
    }
}

impl<'a, T> DerefMut for Lease<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.list.entries[self.index as usize].get() }
    }
}

impl<'a, T> Drop for Lease<'a, T> {
    fn drop(&mut self) {
        self.list.release(self.index);
    }
}
