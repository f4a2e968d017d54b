// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A fixed-capacity object pool with a lock-free freelist.
//!
//! Slots are allocated once at construction and handed out by index. The pool
//! never grows: running out of slots is a resource limit the caller must
//! handle, which keeps allocation out of the scheduler's hot path.
//!
//! The freelist is a Treiber stack threaded through a side array of `next`
//! indices. Its head packs a 32-bit tag next to the 32-bit slot index so a
//! slot that is popped and pushed back between a competitor's load and CAS
//! cannot be mistaken for an unchanged head.

use crossbeam_utils::Backoff;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Marks the end of the freelist.
const NIL: u32 = u32::MAX;

#[inline]
fn pack(tag: u32, index: u32) -> u64 {
    ((tag as u64) << 32) | index as u64
}

#[inline]
fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

/// A fixed-capacity, thread-safe pool of `T`.
///
/// `T` is shared by reference between threads; slots that need mutation wrap
/// their state in a lock or atomics.
pub struct Pool<T> {
    slots: Box<[T]>,
    next: Box<[AtomicU32]>,
    in_use: Box<[AtomicBool]>,
    head: AtomicU64,
    available: AtomicUsize,
}

impl<T> Pool<T> {
    /// Creates a pool of `capacity` slots, building each one with `init`.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` does not fit the 32-bit index space.
    pub fn new_with(capacity: usize, mut init: impl FnMut(usize) -> T) -> Self {
        assert!(
            capacity < NIL as usize,
            "pool capacity {capacity} exceeds the 32-bit index space"
        );

        let slots: Box<[T]> = (0..capacity).map(&mut init).collect();
        let next: Box<[AtomicU32]> = (0..capacity)
            .map(|i| {
                let following = i + 1;
                AtomicU32::new(if following < capacity {
                    following as u32
                } else {
                    NIL
                })
            })
            .collect();
        let in_use: Box<[AtomicBool]> = (0..capacity).map(|_| AtomicBool::new(false)).collect();
        let first = if capacity == 0 { NIL } else { 0 };

        Self {
            slots,
            next,
            in_use,
            head: AtomicU64::new(pack(0, first)),
            available: AtomicUsize::new(capacity),
        }
    }

    /// Pops a free slot, or returns `None` when the pool is exhausted.
    ///
    /// Never blocks.
    pub fn get(&self) -> Option<u32> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let (tag, index) = unpack(head);
            if index == NIL {
                return None;
            }
            let next = self.next[index as usize].load(Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                pack(tag.wrapping_add(1), next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let was_in_use = self.in_use[index as usize].swap(true, Ordering::AcqRel);
                    debug_assert!(!was_in_use, "pool slot {index} handed out twice");
                    self.available.fetch_sub(1, Ordering::Relaxed);
                    return Some(index);
                }
                Err(actual) => head = actual,
            }
        }
    }

    /// Spins on [`get`](Self::get) until a slot frees up.
    ///
    /// Only suitable where exhaustion is known to be transient.
    pub fn get_wait(&self) -> u32 {
        let backoff = Backoff::new();
        loop {
            if let Some(index) = self.get() {
                return index;
            }
            backoff.snooze();
        }
    }

    /// Returns a slot to the freelist.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range or is not currently handed out.
    pub fn put(&self, index: u32) {
        let was_in_use = self.in_use[index as usize].swap(false, Ordering::AcqRel);
        assert!(was_in_use, "pool slot {index} returned while already free");

        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let (tag, first) = unpack(head);
            self.next[index as usize].store(first, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                pack(tag.wrapping_add(1), index),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.available.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(actual) => head = actual,
            }
        }
    }

    /// Returns the slot at `index`, whether or not it is handed out.
    #[inline]
    pub fn slot(&self, index: u32) -> &T {
        &self.slots[index as usize]
    }

    /// Returns the slot at `index` if it is in range.
    #[inline]
    pub fn try_slot(&self, index: u32) -> Option<&T> {
        self.slots.get(index as usize)
    }

    /// Returns `true` if the slot is currently handed out.
    pub fn is_in_use(&self, index: u32) -> bool {
        self.in_use
            .get(index as usize)
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of free slots. Approximate while other threads use the pool.
    pub fn available(&self) -> usize {
        self.available.load(Ordering::Relaxed)
    }
}

impl<T: Default> Pool<T> {
    /// Creates a pool of `capacity` default-initialized slots.
    pub fn new(capacity: usize) -> Self {
        Self::new_with(capacity, |_| T::default())
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}
