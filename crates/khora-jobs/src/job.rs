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

//! Job descriptors supplied by callers and the records the scheduler keeps for them.

use crate::wait_group::WaitGroupHandle;

/// The entry point of a job. Receives the descriptor's opaque `data` pointer.
pub type JobFn = fn(*mut ());

/// Classifies which work queue a job is eligible to run from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobType {
    /// Runs on any worker thread.
    Worker,
    /// Runs only on the thread that initialised the scheduler, which owns the
    /// OS message pump and the rendering context.
    Main,
}

impl JobType {
    /// Number of job types, i.e. number of work queues.
    pub const COUNT: usize = 2;

    /// Every job type, in queue index order.
    pub const ALL: [JobType; Self::COUNT] = [JobType::Worker, JobType::Main];

    /// The index of this type's work queue.
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            JobType::Worker => 0,
            JobType::Main => 1,
        }
    }
}

/// A unit of work handed to [`Scheduler::submit`](crate::Scheduler::submit).
///
/// The scheduler never dereferences `data`; it is passed back verbatim to
/// `func`. Keeping whatever it points to alive until the batch completes is
/// the submitter's responsibility.
#[derive(Debug, Clone, Copy)]
pub struct JobDescriptor {
    /// The function to run.
    pub func: JobFn,
    /// Opaque argument for `func`.
    pub data: *mut (),
    /// Which queue the job is pushed onto.
    pub kind: JobType,
}

impl JobDescriptor {
    /// Creates a descriptor from its parts.
    pub fn new(func: JobFn, data: *mut (), kind: JobType) -> Self {
        Self { func, data, kind }
    }

    /// Creates a descriptor whose `data` points at `value`.
    ///
    /// `func` reads it back with `unsafe { &*(data as *const T) }`.
    pub fn from_ref<T>(func: JobFn, value: &T, kind: JobType) -> Self {
        Self::new(func, value as *const T as *mut (), kind)
    }
}

/// Index of a job record in the scheduler's job pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct JobId(pub(crate) u32);

/// The opaque job argument, carried across threads.
#[derive(Debug, Clone, Copy)]
pub(crate) struct JobData(*mut ());

// SAFETY: the scheduler only moves the pointer between threads and hands it
// back to the job function; it never reads through it.
unsafe impl Send for JobData {}

impl JobData {
    #[inline]
    pub(crate) fn as_ptr(self) -> *mut () {
        self.0
    }
}

/// Why a job's coroutine handed control back without finishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Suspension {
    /// Cooperative yield: re-queue right away.
    Reschedule,
    /// Blocked until the wait group reaches its target.
    Wait(WaitGroupHandle),
    /// Yielded from `flush`: re-queue right away, marked as flushing.
    Flush,
}

/// The scheduler's bookkeeping for one submitted job.
#[derive(Debug)]
pub(crate) struct JobRecord {
    pub(crate) func: JobFn,
    pub(crate) data: JobData,
    pub(crate) kind: JobType,
    /// Assigned the first time the job runs, kept until it finishes.
    pub(crate) coroutine: Option<u32>,
    /// The batch this job belongs to.
    pub(crate) group: WaitGroupHandle,
    /// Set by the job right before it suspends.
    pub(crate) suspension: Option<Suspension>,
}

fn unbound(_: *mut ()) {}

impl Default for JobRecord {
    fn default() -> Self {
        Self {
            func: unbound,
            data: JobData(std::ptr::null_mut()),
            kind: JobType::Worker,
            coroutine: None,
            group: WaitGroupHandle::default(),
            suspension: None,
        }
    }
}

impl JobRecord {
    /// Binds a freshly allocated record to a descriptor and its batch.
    pub(crate) fn bind(&mut self, descriptor: &JobDescriptor, group: WaitGroupHandle) {
        self.func = descriptor.func;
        self.data = JobData(descriptor.data);
        self.kind = descriptor.kind;
        self.coroutine = None;
        self.group = group;
        self.suspension = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: *mut ()) {}

    #[test]
    fn test_job_type_indices_are_dense() {
        for (position, kind) in JobType::ALL.iter().enumerate() {
            assert_eq!(kind.index(), position);
        }
    }

    #[test]
    fn test_bind_resets_previous_state() {
        let mut record = JobRecord {
            coroutine: Some(3),
            suspension: Some(Suspension::Reschedule),
            ..Default::default()
        };
        let value = 7u32;
        let descriptor = JobDescriptor::from_ref(noop, &value, JobType::Main);

        record.bind(&descriptor, WaitGroupHandle::default());

        assert_eq!(record.kind, JobType::Main);
        assert_eq!(record.coroutine, None);
        assert_eq!(record.suspension, None);
        assert_eq!(record.data.as_ptr() as *const u32, &value as *const u32);
    }
}
