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

//! Batch completion tracking and the wait/wake protocol.
//!
//! A [`WaitGroup`] counts the jobs of one batch that have not finished yet and
//! keeps the jobs that are parked waiting for that count to reach zero.
//!
//! The counter decrement, the "reached zero" check and the drain of the parked
//! list all happen under the group's lock, and so does parking. A job parking
//! concurrently with the last completion therefore either lands in the list
//! before the drain, or sees the count at zero and is re-queued on the spot.

use crate::job::JobId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

const NULL_INDEX: u32 = u32::MAX;

/// The count a batch has to reach before its waiters are released.
pub(crate) const COMPLETE: i32 = 0;

/// Caller-side handle to a submitted batch.
///
/// Handles are plain values; the group they name stays alive until it is
/// released with [`Scheduler::release`](crate::Scheduler::release) or by
/// `wait(handle, true)`. The default handle is null and waiting on it panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitGroupHandle {
    index: u32,
    generation: u32,
}

impl Default for WaitGroupHandle {
    fn default() -> Self {
        Self {
            index: NULL_INDEX,
            generation: 0,
        }
    }
}

impl WaitGroupHandle {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Returns `true` for the default, never-submitted handle.
    pub fn is_null(&self) -> bool {
        self.index == NULL_INDEX
    }

    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }
}

/// Completion record for one batch.
#[derive(Debug, Default)]
pub(crate) struct WaitGroup {
    outstanding: AtomicI32,
    /// Bumped on release so stale handles can be told apart.
    generation: AtomicU32,
    parked: Mutex<Vec<JobId>>,
}

impl WaitGroup {
    /// Arms the group for a batch of `count` jobs and returns its generation.
    pub(crate) fn open(&self, count: i32) -> u32 {
        let parked = self.parked.lock();
        debug_assert!(parked.is_empty(), "wait group reopened with parked jobs");
        self.outstanding.store(count, Ordering::Release);
        self.generation.load(Ordering::Acquire)
    }

    /// Closes the group so its slot can be reused, invalidating old handles.
    ///
    /// # Panics
    ///
    /// Panics if jobs of the batch are still outstanding or parked on it.
    pub(crate) fn retire(&self) {
        let parked = self.parked.lock();
        let outstanding = self.outstanding.load(Ordering::Acquire);
        assert!(
            outstanding <= COMPLETE && parked.is_empty(),
            "wait group released with {outstanding} jobs outstanding and {} parked",
            parked.len()
        );
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn outstanding(&self) -> i32 {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Lock-free check whether the outstanding count has come down to `value`.
    ///
    /// The count only ever decreases, so once this returns `true` it stays
    /// `true` until the group is reopened.
    pub(crate) fn poll(&self, value: i32) -> bool {
        self.outstanding() <= value
    }

    /// Records one finished job. When that was the last one, every parked job
    /// is handed to `wake` before the lock is released.
    ///
    /// Returns the number of jobs woken.
    pub(crate) fn complete_one(&self, mut wake: impl FnMut(JobId)) -> usize {
        let mut parked = self.parked.lock();
        let remaining = self.outstanding.fetch_sub(1, Ordering::AcqRel) - 1;
        assert!(
            remaining >= COMPLETE,
            "wait group completed more jobs than were submitted"
        );
        if remaining != COMPLETE {
            return 0;
        }
        let woken = parked.len();
        for job in parked.drain(..) {
            wake(job);
        }
        woken
    }

    /// Parks `job` until the group completes.
    ///
    /// If the group has already completed, `job` goes straight to `requeue`
    /// instead and `false` is returned.
    pub(crate) fn park_on(&self, job: JobId, requeue: impl FnOnce(JobId)) -> bool {
        let mut parked = self.parked.lock();
        if self.outstanding.load(Ordering::Acquire) <= COMPLETE {
            requeue(job);
            return false;
        }
        parked.push(job);
        true
    }

    #[cfg(test)]
    pub(crate) fn parked_len(&self) -> usize {
        self.parked.lock().len()
    }
}
