// Copyright (c) 2023 the Hearth contributors.
// SPDX-License-Identifier: AGPL-3.0-or-later
//
// This file is part of Hearth.
//
// Hearth is free software: you can redistribute it and/or modify it under the
// terms of the GNU Affero General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Hearth is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with Hearth. If not, see <https://www.gnu.org/licenses/>.

//! A fixed-bucket, reference-counted map from [Handle] to an embedded entry.
//!
//! Entries are inserted with a starting refcount of one, representing the
//! table's own membership reference. `get` hands out additional references,
//! `remove` releases the table's reference (and unlinks immediately if that
//! was the only one outstanding), and `release` is the only other path that
//! can observe a transition to zero, at which point the slot is unlinked and
//! the caller is told so exactly once.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{VmciError, VmciResult};
use crate::handle::Handle;

const DEFAULT_BUCKET_COUNT: usize = 256;

fn mix(x: u32) -> u32 {
    // A cheap avalanche mix, not cryptographic; only used to spread handles
    // across buckets.
    let mut x = x;
    x ^= x >> 16;
    x = x.wrapping_mul(0x7feb_352d);
    x ^= x >> 15;
    x = x.wrapping_mul(0x846c_a68b);
    x ^= x >> 16;
    x
}

fn bucket_hash(handle: Handle) -> u32 {
    mix(handle.context) ^ mix(handle.resource)
}

/// One slot in a [HashTable]'s bucket chain.
///
/// `removed` tombstones the slot once a caller unlinks it; the slot stays in
/// its bucket, invisible to `get` and blocking a fresh `add`, until whichever
/// decrement drains the last reference physically unlinks it.
pub struct Slot<T> {
    pub handle: Handle,
    refcount: AtomicUsize,
    removed: AtomicBool,
    pub value: T,
}

impl<T> Slot<T> {
    /// True once this slot has been logically removed, independent of
    /// whether it has actually died (hit a zero refcount) yet.
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }
}

/// The outcome of a [HashTable::release] call.
#[derive(Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Other references remain live.
    Alive,
    /// This was the release that drained the last reference; the slot has
    /// been unlinked from the table and the caller owns finalization.
    Dead,
}

/// A fixed-size-bucket hash table keyed by [Handle], internally synchronized
/// with a single lock.
pub struct HashTable<T> {
    buckets: Mutex<Vec<Vec<Arc<Slot<T>>>>>,
}

impl<T> Default for HashTable<T> {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKET_COUNT)
    }
}

impl<T> HashTable<T> {
    /// Creates a table with the given fixed bucket count.
    pub fn new(bucket_count: usize) -> Self {
        let bucket_count = bucket_count.max(1);
        Self {
            buckets: Mutex::new((0..bucket_count).map(|_| Vec::new()).collect()),
        }
    }

    fn index_for(bucket_count: usize, handle: Handle) -> usize {
        (bucket_hash(handle) as usize) % bucket_count
    }

    /// Inserts `value` under `handle` with a starting refcount of one.
    ///
    /// Fails with [VmciError::DuplicateEntry] if any slot for this handle is
    /// still present, whether or not it has been logically removed.
    pub fn add(&self, handle: Handle, value: T) -> VmciResult<()> {
        let mut buckets = self.buckets.lock();
        let idx = Self::index_for(buckets.len(), handle);
        if buckets[idx].iter().any(|s| s.handle == handle) {
            return Err(VmciError::DuplicateEntry);
        }
        buckets[idx].push(Arc::new(Slot {
            handle,
            refcount: AtomicUsize::new(1),
            removed: AtomicBool::new(false),
            value,
        }));
        Ok(())
    }

    /// Looks up `handle`, incrementing its refcount on success.
    ///
    /// Returns `None` if no live (non-removed) entry exists.
    pub fn get(&self, handle: Handle) -> Option<Arc<Slot<T>>> {
        let buckets = self.buckets.lock();
        let idx = Self::index_for(buckets.len(), handle);
        let slot = buckets[idx]
            .iter()
            .find(|s| s.handle == handle && !s.is_removed())?;
        slot.refcount.fetch_add(1, Ordering::AcqRel);
        Some(slot.clone())
    }

    /// Batch version of [Self::get], locking the table once for the whole
    /// list to amortise lock cost.
    pub fn get_entries(&self, handles: &[Handle]) -> Vec<Option<Arc<Slot<T>>>> {
        let buckets = self.buckets.lock();
        handles
            .iter()
            .map(|&handle| {
                let idx = Self::index_for(buckets.len(), handle);
                let slot = buckets[idx]
                    .iter()
                    .find(|s| s.handle == handle && !s.is_removed())?;
                slot.refcount.fetch_add(1, Ordering::AcqRel);
                Some(slot.clone())
            })
            .collect()
    }

    /// Looks up two handles under a single lock acquisition, as used by
    /// `ResourceTable::get_pair`.
    pub fn get_pair(&self, a: Handle, b: Handle) -> (Option<Arc<Slot<T>>>, Option<Arc<Slot<T>>>) {
        let mut results = self.get_entries(&[a, b]).into_iter();
        (results.next().flatten(), results.next().flatten())
    }

    /// Logically removes `handle`: no further `get` will find it, and a
    /// fresh `add` for the same handle fails until the slot actually dies.
    ///
    /// This also releases the reference that `add` implicitly holds on
    /// behalf of the table, so it can itself observe the dead transition if
    /// no other reference was outstanding. Returns `None` if no live entry
    /// was found.
    pub fn remove(&self, handle: Handle) -> Option<ReleaseOutcome> {
        let mut buckets = self.buckets.lock();
        let idx = Self::index_for(buckets.len(), handle);
        let pos = buckets[idx]
            .iter()
            .position(|s| s.handle == handle && !s.is_removed())?;
        buckets[idx][pos].removed.store(true, Ordering::Release);
        let prev = buckets[idx][pos].refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev >= 1, "refcount underflow");
        if prev == 1 {
            buckets[idx].remove(pos);
            Some(ReleaseOutcome::Dead)
        } else {
            Some(ReleaseOutcome::Alive)
        }
    }

    /// Releases one reference to `slot`.
    ///
    /// Returns [ReleaseOutcome::Dead] exactly to the caller whose release
    /// drains the refcount to zero; at that point the slot is unlinked from
    /// its bucket.
    pub fn release(&self, slot: &Arc<Slot<T>>) -> ReleaseOutcome {
        let prev = slot.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev >= 1, "refcount underflow");
        if prev == 1 {
            let mut buckets = self.buckets.lock();
            let idx = Self::index_for(buckets.len(), slot.handle);
            if let Some(pos) = buckets[idx].iter().position(|s| Arc::ptr_eq(s, slot)) {
                buckets[idx].remove(pos);
            }
            ReleaseOutcome::Dead
        } else {
            ReleaseOutcome::Alive
        }
    }

    /// Batch version of [Self::release].
    pub fn release_entries(&self, slots: &[Arc<Slot<T>>]) -> Vec<ReleaseOutcome> {
        // Individually correct; a single lock acquisition per distinct
        // bucket would add bookkeeping for a marginal win on small batches,
        // so we keep this straightforward and call through release().
        slots.iter().map(|slot| self.release(slot)).collect()
    }
}
