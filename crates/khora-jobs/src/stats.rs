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

//! Scheduler activity counters and the snapshot exposed to telemetry.

use std::sync::atomic::{AtomicU64, Ordering};

// --- Live Counters ---

/// Relaxed counters bumped by the scheduler as it runs.
#[derive(Debug, Default)]
pub(crate) struct SchedulerCounters {
    pub(crate) submitted: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) panicked: AtomicU64,
    pub(crate) yields: AtomicU64,
    pub(crate) waits: AtomicU64,
    pub(crate) wakes: AtomicU64,
    pub(crate) coroutine_stalls: AtomicU64,
}

impl SchedulerCounters {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }
}

// --- Data Structures for Reporting ---

/// A point-in-time view of scheduler activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    // --- Lifetime Counters ---
    /// Jobs accepted by `submit`.
    pub jobs_submitted: u64,
    /// Jobs that ran to completion (including the ones that panicked).
    pub jobs_completed: u64,
    /// Jobs whose function panicked.
    pub jobs_panicked: u64,
    /// Cooperative yields.
    pub yields: u64,
    /// Times a job was parked on a wait group.
    pub waits: u64,
    /// Parked jobs released by a completing batch.
    pub wakes: u64,
    /// Times a fresh job went back to its queue because no coroutine was free.
    pub coroutine_stalls: u64,

    // --- Current State ---
    /// Jobs waiting in the worker queue.
    pub pending_worker_jobs: usize,
    /// Jobs waiting in the main queue.
    pub pending_main_jobs: usize,
    /// Free job records.
    pub free_jobs: usize,
    /// Free coroutines.
    pub free_coroutines: usize,
    /// Free wait groups.
    pub free_wait_groups: usize,
}

impl SchedulerStats {
    pub(crate) fn read_counters(counters: &SchedulerCounters) -> Self {
        Self {
            jobs_submitted: counters.submitted.load(Ordering::Relaxed),
            jobs_completed: counters.completed.load(Ordering::Relaxed),
            jobs_panicked: counters.panicked.load(Ordering::Relaxed),
            yields: counters.yields.load(Ordering::Relaxed),
            waits: counters.waits.load(Ordering::Relaxed),
            wakes: counters.wakes.load(Ordering::Relaxed),
            coroutine_stalls: counters.coroutine_stalls.load(Ordering::Relaxed),
            ..Default::default()
        }
    }

    /// Jobs submitted but not finished yet.
    pub fn jobs_in_flight(&self) -> u64 {
        self.jobs_submitted.saturating_sub(self.jobs_completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reads_counters() {
        let counters = SchedulerCounters::default();
        SchedulerCounters::add(&counters.submitted, 5);
        SchedulerCounters::bump(&counters.completed);
        SchedulerCounters::bump(&counters.yields);

        let stats = SchedulerStats::read_counters(&counters);
        assert_eq!(stats.jobs_submitted, 5);
        assert_eq!(stats.jobs_completed, 1);
        assert_eq!(stats.yields, 1);
        assert_eq!(stats.jobs_in_flight(), 4);
    }
}
