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

//! Per-category FIFO of pending jobs.

use crate::job::{JobId, JobType};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A FIFO of job records waiting to run.
///
/// The lock is held for a single push or pop. The length is mirrored in an
/// atomic so idle workers can check for work without locking.
///
/// Entries pushed with [`push_flushing`](Self::push_flushing) belong to jobs
/// suspended inside `flush`. They are counted apart so a flushing job does not
/// wait on other flushing jobs.
#[derive(Debug)]
pub(crate) struct WorkQueue {
    kind: JobType,
    state: Mutex<QueueState>,
    len: AtomicUsize,
}

#[derive(Debug)]
struct QueueState {
    jobs: VecDeque<(JobId, bool)>,
    flushing: usize,
}

impl WorkQueue {
    /// Creates an empty queue with room for `capacity` jobs.
    ///
    /// A queue never holds more entries than the job pool has records, so
    /// sizing it to the pool keeps pushes allocation-free.
    pub(crate) fn new(kind: JobType, capacity: usize) -> Self {
        Self {
            kind,
            state: Mutex::new(QueueState {
                jobs: VecDeque::with_capacity(capacity),
                flushing: 0,
            }),
            len: AtomicUsize::new(0),
        }
    }

    pub(crate) fn kind(&self) -> JobType {
        self.kind
    }

    /// Appends a job at the back.
    pub(crate) fn push(&self, job: JobId) {
        self.push_entry(job, false);
    }

    /// Appends a job that suspended inside `flush`.
    pub(crate) fn push_flushing(&self, job: JobId) {
        self.push_entry(job, true);
    }

    fn push_entry(&self, job: JobId, flushing: bool) {
        let mut state = self.state.lock();
        state.jobs.push_back((job, flushing));
        state.flushing += usize::from(flushing);
        self.len.store(state.jobs.len(), Ordering::Release);
    }

    /// Takes the job at the front, if any.
    pub(crate) fn pop(&self) -> Option<JobId> {
        if self.is_empty() {
            return None;
        }
        let mut state = self.state.lock();
        let (job, flushing) = state.jobs.pop_front()?;
        state.flushing -= usize::from(flushing);
        self.len.store(state.jobs.len(), Ordering::Release);
        Some(job)
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if every queued job is itself waiting in `flush`.
    pub(crate) fn is_flushed(&self) -> bool {
        let state = self.state.lock();
        state.jobs.len() == state.flushing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = WorkQueue::new(JobType::Worker, 4);
        for id in 0..4 {
            queue.push(JobId(id));
        }
        assert_eq!(queue.len(), 4);
        for id in 0..4 {
            assert_eq!(queue.pop(), Some(JobId(id)));
        }
        assert!(queue.pop().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_flushed_ignores_flushing_entries() {
        let queue = WorkQueue::new(JobType::Worker, 4);
        assert!(queue.is_flushed());

        queue.push_flushing(JobId(1));
        assert!(queue.is_flushed(), "only a flushing job is queued");
        assert!(!queue.is_empty());

        queue.push(JobId(2));
        assert!(!queue.is_flushed());

        assert_eq!(queue.pop(), Some(JobId(1)));
        assert!(!queue.is_flushed());
        assert_eq!(queue.pop(), Some(JobId(2)));
        assert!(queue.is_flushed());
    }

    #[test]
    fn test_concurrent_push_pop_loses_nothing() {
        let queue = Arc::new(WorkQueue::new(JobType::Main, 1024));
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..250 {
                        queue.push(JobId(p * 250 + i));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let mut seen = vec![false; 1000];
        while let Some(JobId(id)) = queue.pop() {
            assert!(!seen[id as usize], "job {id} popped twice");
            seen[id as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
        assert_eq!(queue.kind(), JobType::Main);
    }
}
