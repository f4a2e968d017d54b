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

//! The job scheduler: submission, the per-worker scheduling loop, and the
//! cooperative operations jobs use to yield and wait.
//!
//! Each worker thread pulls job records from the work queues and resumes their
//! coroutine. When control comes back, the loop looks at how the job left:
//!
//! - **Finished**: the coroutine and the record go back to their pools and the
//!   job's wait group is told one more job is done.
//! - **Suspended by `yield_now`**: the job goes to the back of its queue.
//! - **Suspended by `wait`**: the job is parked on the wait group. It keeps its
//!   coroutine, since its stack holds the state it resumes with.
//!
//! Parking happens in the loop, after the coroutine has switched out. A wake-up
//! can therefore never hand a still-running coroutine to another worker.
//!
//! Worker 0 is the thread that called [`Scheduler::init`]. It has no loop of its
//! own; it runs jobs whenever it pumps, either explicitly through
//! [`Scheduler::pump`] or while spinning in [`Scheduler::wait_spin`]. It is the
//! only worker that takes [`JobType::Main`] jobs.

use crate::config::SchedulerConfig;
use crate::coroutine::{panic_message, Abandoned, Coroutine, CoroutineState, Entry, ThreadFiber};
use crate::error::{PoolKind, SchedulerError, SchedulerResult};
use crate::job::{JobDescriptor, JobId, JobRecord, JobType, Suspension};
use crate::pool::Pool;
use crate::queue::WorkQueue;
use crate::registry::{ThreadRegistry, MAIN_WORKER};
use crate::stats::{SchedulerCounters, SchedulerStats};
use crate::wait_group::{WaitGroup, WaitGroupHandle, COMPLETE};
use crossbeam_utils::Backoff;
use parking_lot::Mutex;
use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

/// What the calling coroutine is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct JobContext {
    scheduler: u64,
    job: JobId,
    coroutine: u32,
}

thread_local! {
    static CURRENT_JOB: Cell<Option<JobContext>> = const { Cell::new(None) };
}

/// Outcome of one scheduling step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// A job was resumed.
    Ran,
    /// Jobs are queued, but every one of them is waiting for a coroutine.
    Stalled,
    /// The queues this worker serves are empty.
    Idle,
}

/// Finish callback of every job coroutine.
fn leave_job() {
    CURRENT_JOB.with(|current| current.set(None));
}

// --- Shared State ---

/// State shared by the scheduler handle, the worker threads and running jobs.
struct Shared {
    id: u64,
    config: SchedulerConfig,
    jobs: Pool<Mutex<JobRecord>>,
    coroutines: Pool<ThreadFiber>,
    groups: Pool<WaitGroup>,
    queues: [WorkQueue; JobType::COUNT],
    registry: ThreadRegistry,
    counters: SchedulerCounters,
    shutdown: AtomicBool,
}

impl Shared {
    fn new(config: SchedulerConfig) -> Self {
        let id = NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            id,
            jobs: Pool::new(config.max_jobs),
            coroutines: Pool::new_with(config.max_coroutines, |index| {
                ThreadFiber::new(format!("khora-fiber-{id}-{index}"))
            }),
            groups: Pool::new(config.max_wait_groups),
            queues: JobType::ALL.map(|kind| WorkQueue::new(kind, config.max_jobs)),
            registry: ThreadRegistry::new(config.max_workers),
            counters: SchedulerCounters::default(),
            shutdown: AtomicBool::new(false),
            config,
        }
    }

    #[inline]
    fn queue(&self, kind: JobType) -> &WorkQueue {
        &self.queues[kind.index()]
    }

    /// Resolves a caller handle, panicking on null or stale handles.
    fn group(&self, handle: WaitGroupHandle) -> &WaitGroup {
        assert!(!handle.is_null(), "cannot use a null WaitGroupHandle");
        let Some(group) = self.groups.try_slot(handle.index()) else {
            panic!("{handle:?} does not belong to this scheduler");
        };
        assert!(
            self.groups.is_in_use(handle.index()) && group.generation() == handle.generation(),
            "{handle:?} refers to a wait group that was already released"
        );
        group
    }

    fn requeue(&self, job: JobId) {
        let kind = self.jobs.slot(job.0).lock().kind;
        let queue = self.queue(kind);
        queue.push(job);
        log::trace!("Job {} queued on the {:?} queue.", job.0, queue.kind());
    }

    fn requeue_flushing(&self, job: JobId) {
        let kind = self.jobs.slot(job.0).lock().kind;
        self.queue(kind).push_flushing(job);
    }

    /// Runs one scheduling step for `worker`.
    ///
    /// Worker 0 serves the `Main` queue first. A job that cannot get a
    /// coroutine goes to the back of its queue and the walk moves on, at most
    /// once around each queue.
    fn run_next(self: &Arc<Self>, worker: usize) -> Step {
        let kinds: &[JobType] = if worker == MAIN_WORKER {
            &[JobType::Main, JobType::Worker]
        } else {
            &[JobType::Worker]
        };

        let mut step = Step::Idle;
        for &kind in kinds {
            let queue = self.queue(kind);
            for _ in 0..queue.len() {
                let Some(job) = queue.pop() else {
                    break;
                };
                if self.execute(job) {
                    return Step::Ran;
                }
                step = Step::Stalled;
            }
        }
        step
    }

    fn execute(self: &Arc<Self>, job: JobId) -> bool {
        let assigned = self.jobs.slot(job.0).lock().coroutine;
        let coroutine = match assigned {
            Some(index) => index,
            None => match self.start(job) {
                Some(index) => index,
                None => return false,
            },
        };

        let fiber = self.coroutines.slot(coroutine);
        fiber.resume();
        match fiber.state() {
            CoroutineState::Finished => self.finish(job, coroutine),
            CoroutineState::Suspended => self.suspended(job),
            state => unreachable!("coroutine '{}' handed control back while {state:?}", fiber.name()),
        }
        true
    }

    /// Binds a free coroutine to a job that has never run.
    ///
    /// Does not block when the coroutine pool is empty: the job goes back to
    /// its queue so the jobs holding coroutines get a chance to finish.
    fn start(self: &Arc<Self>, job: JobId) -> Option<u32> {
        let Some(index) = self.coroutines.get() else {
            SchedulerCounters::bump(&self.counters.coroutine_stalls);
            self.requeue(job);
            return None;
        };

        let fiber = self.coroutines.slot(index);
        if let Err(err) = fiber.prepare(self.job_entry(job, index), Some(Box::new(leave_job))) {
            log::error!("Failed to prepare a coroutine for job {}: {err}", job.0);
            self.coroutines.put(index);
            self.requeue(job);
            return None;
        }
        self.jobs.slot(job.0).lock().coroutine = Some(index);
        Some(index)
    }

    /// The body of a job's coroutine.
    ///
    /// Holds the shared state weakly: a job left suspended when the scheduler
    /// goes away must not keep it alive.
    fn job_entry(self: &Arc<Self>, job: JobId, coroutine: u32) -> Entry {
        let shared = Arc::downgrade(self);
        Box::new(move || {
            let Some((func, data, scheduler)) = shared.upgrade().map(|shared| {
                let record = shared.jobs.slot(job.0).lock();
                (record.func, record.data, shared.id)
            }) else {
                return;
            };
            CURRENT_JOB.with(|current| {
                current.set(Some(JobContext {
                    scheduler,
                    job,
                    coroutine,
                }))
            });

            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| func(data.as_ptr()))) {
                if payload.is::<Abandoned>() {
                    panic::resume_unwind(payload);
                }
                log::error!(
                    "Job {} panicked: {}",
                    job.0,
                    panic_message(payload.as_ref())
                );
                if let Some(shared) = Weak::upgrade(&shared) {
                    SchedulerCounters::bump(&shared.counters.panicked);
                }
            }
        })
    }

    fn finish(&self, job: JobId, coroutine: u32) {
        let group = {
            let mut record = self.jobs.slot(job.0).lock();
            record.coroutine = None;
            record.suspension = None;
            record.group
        };
        self.coroutines.put(coroutine);
        self.jobs.put(job.0);
        SchedulerCounters::bump(&self.counters.completed);

        let woken = self
            .groups
            .slot(group.index())
            .complete_one(|waiter| self.requeue(waiter));
        if woken > 0 {
            SchedulerCounters::add(&self.counters.wakes, woken as u64);
            log::trace!(
                "Wait group {} completed, woke {woken} jobs.",
                group.index()
            );
        }
    }

    fn suspended(&self, job: JobId) {
        let suspension = self.jobs.slot(job.0).lock().suspension.take();
        match suspension {
            Some(Suspension::Reschedule) => self.requeue(job),
            Some(Suspension::Flush) => self.requeue_flushing(job),
            Some(Suspension::Wait(handle)) => {
                let parked = self
                    .groups
                    .slot(handle.index())
                    .park_on(job, |ready| self.requeue(ready));
                if parked {
                    SchedulerCounters::bump(&self.counters.waits);
                    log::trace!("Job {} parked on wait group {}.", job.0, handle.index());
                }
            }
            None => {
                log::warn!("Job {} suspended without a reason; rescheduling it.", job.0);
                self.requeue(job);
            }
        }
    }
}

/// Scheduling loop of workers 1..N.
fn worker_main(shared: Arc<Shared>, index: usize) {
    if let Err(err) = shared.registry.register_current(index) {
        log::error!("Worker {index} could not register: {err}");
        return;
    }
    log::debug!("Worker {index} started.");

    let backoff = Backoff::new();
    let idle_sleep = Duration::from_micros(shared.config.idle_sleep_us);
    while !shared.shutdown.load(Ordering::Acquire) {
        match shared.run_next(index) {
            Step::Ran => backoff.reset(),
            // Coroutines are held by jobs running elsewhere; retry soon.
            Step::Stalled => backoff.snooze(),
            Step::Idle if backoff.is_completed() => thread::sleep(idle_sleep),
            Step::Idle => backoff.snooze(),
        }
    }

    shared.registry.unregister_current();
    log::debug!("Worker {index} stopped.");
}

// --- Public API ---

/// A fiber-based job scheduler.
///
/// There is no global instance: subsystems that submit work receive a
/// reference to the scheduler they should use, so several schedulers can live
/// side by side.
///
/// Operations that suspend the caller (`wait`, `yield_now`, `flush`) may only
/// be called from inside a job running on this scheduler and panic otherwise.
/// Code that is not a job blocks with [`wait_spin`](Self::wait_spin).
pub struct Scheduler {
    shared: Arc<Shared>,
    /// The native context of the thread that called `init` (worker 0).
    host: ThreadFiber,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Starts a scheduler.
    ///
    /// The calling thread becomes worker 0 and `num_workers - 1` worker
    /// threads are spawned.
    ///
    /// # Errors
    ///
    /// Fails on an invalid configuration (including `num_workers` above
    /// `max_workers`) or if a worker thread cannot be spawned.
    pub fn init(config: SchedulerConfig) -> SchedulerResult<Self> {
        config.validate()?;

        let shared = Arc::new(Shared::new(config));
        shared.registry.register_current(MAIN_WORKER)?;
        let scheduler = Self {
            shared,
            host: ThreadFiber::convert_current_thread(),
            workers: Mutex::new(Vec::new()),
        };
        scheduler.spawn_workers()?;

        let config = &scheduler.shared.config;
        log::info!(
            "Job scheduler {} started: {} workers, {} jobs, {} coroutines, {} wait groups.",
            scheduler.shared.id,
            config.num_workers,
            config.max_jobs,
            config.max_coroutines,
            config.max_wait_groups
        );
        Ok(scheduler)
    }

    fn spawn_workers(&self) -> SchedulerResult<()> {
        let mut workers = self.workers.lock();
        for index in 1..self.shared.config.num_workers {
            let shared = Arc::clone(&self.shared);
            let name = format!("khora-worker-{index}");
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_main(shared, index))
                .map_err(|source| SchedulerError::Spawn { name, source })?;
            workers.push(handle);
        }
        Ok(())
    }

    /// Submits a batch of jobs and returns the handle tracking its completion.
    ///
    /// Either every job of the batch is queued or none is.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::PoolExhausted`] if there are not enough free job
    ///   records or wait groups. It is also returned when called from inside a
    ///   job while every coroutine is taken: the caller would otherwise park on
    ///   a batch that has no coroutine to run on.
    /// - [`SchedulerError::ShutDown`] after [`shutdown`](Self::shutdown).
    pub fn submit(&self, jobs: &[JobDescriptor]) -> SchedulerResult<WaitGroupHandle> {
        let shared = &self.shared;
        if shared.shutdown.load(Ordering::Acquire) {
            return Err(SchedulerError::ShutDown);
        }
        if jobs.len() > shared.jobs.capacity() {
            return Err(SchedulerError::PoolExhausted {
                pool: PoolKind::Job,
                capacity: shared.jobs.capacity(),
            });
        }
        if !jobs.is_empty() && self.in_job() && shared.coroutines.available() == 0 {
            return Err(SchedulerError::PoolExhausted {
                pool: PoolKind::Coroutine,
                capacity: shared.coroutines.capacity(),
            });
        }

        let group_index = shared
            .groups
            .get()
            .ok_or(SchedulerError::PoolExhausted {
                pool: PoolKind::WaitGroup,
                capacity: shared.groups.capacity(),
            })?;

        let mut ids = Vec::with_capacity(jobs.len());
        for _ in jobs {
            match shared.jobs.get() {
                Some(index) => ids.push(JobId(index)),
                None => {
                    for JobId(index) in ids {
                        shared.jobs.put(index);
                    }
                    shared.groups.put(group_index);
                    return Err(SchedulerError::PoolExhausted {
                        pool: PoolKind::Job,
                        capacity: shared.jobs.capacity(),
                    });
                }
            }
        }

        // Capacities are validated to fit an `i32`.
        let generation = shared.groups.slot(group_index).open(jobs.len() as i32);
        let handle = WaitGroupHandle::new(group_index, generation);
        for (id, descriptor) in ids.iter().zip(jobs) {
            shared.jobs.slot(id.0).lock().bind(descriptor, handle);
        }
        SchedulerCounters::add(&shared.counters.submitted, jobs.len() as u64);
        for (id, descriptor) in ids.iter().zip(jobs) {
            shared.queue(descriptor.kind).push(*id);
        }

        log::trace!(
            "Submitted {} jobs under wait group {group_index}.",
            jobs.len()
        );
        Ok(handle)
    }

    /// Suspends the calling job until every job of the batch has finished.
    ///
    /// The caller's coroutine stays bound to it while parked. With
    /// `free_after`, the wait group is released once the wait is over.
    ///
    /// # Panics
    ///
    /// Panics outside a job of this scheduler, or on a null or released handle.
    pub fn wait(&self, handle: WaitGroupHandle, free_after: bool) {
        let context = self.current_job("wait");
        let group = self.shared.group(handle);
        if !group.poll(COMPLETE) {
            self.suspend_job(context, Suspension::Wait(handle));
        }
        debug_assert!(group.poll(COMPLETE), "job woken before its wait group completed");

        if free_after {
            self.release(handle);
        }
    }

    /// Spins until at most `value` jobs of the batch are outstanding.
    ///
    /// Usable from anywhere. Inside a job every iteration yields; on the thread
    /// that called `init` every iteration pumps one scheduling step, which is
    /// what runs [`JobType::Main`] jobs; on other threads it backs off.
    ///
    /// # Panics
    ///
    /// Panics on a null or released handle.
    pub fn wait_spin(&self, handle: WaitGroupHandle, value: i32) {
        let group = self.shared.group(handle);
        let in_job = self.in_job();
        let pumps = !in_job && self.host.is_current();
        let backoff = Backoff::new();

        while !group.poll(value) {
            if in_job {
                self.yield_now();
            } else if pumps && self.shared.run_next(MAIN_WORKER) == Step::Ran {
                backoff.reset();
            } else {
                backoff.snooze();
            }
        }
    }

    /// Suspends the calling job and puts it at the back of its queue.
    ///
    /// # Panics
    ///
    /// Panics outside a job of this scheduler.
    pub fn yield_now(&self) {
        let context = self.current_job("yield_now");
        SchedulerCounters::bump(&self.shared.counters.yields);
        self.suspend_job(context, Suspension::Reschedule);
    }

    /// Yields until the queue of `kind` has been seen empty once.
    ///
    /// Jobs that are themselves yielding inside `flush` do not count, so
    /// several jobs can flush the same queue without waiting on each other.
    ///
    /// # Panics
    ///
    /// Panics outside a job of this scheduler.
    pub fn flush(&self, kind: JobType) {
        let context = self.current_job("flush");
        while !self.shared.queue(kind).is_flushed() {
            SchedulerCounters::bump(&self.shared.counters.yields);
            self.suspend_job(context, Suspension::Flush);
        }
    }

    /// Lock-free check whether at most `value` jobs of the batch are outstanding.
    pub fn poll(&self, handle: WaitGroupHandle, value: i32) -> bool {
        self.shared.group(handle).poll(value)
    }

    /// Returns `true` once every job of the batch has finished.
    pub fn is_complete(&self, handle: WaitGroupHandle) -> bool {
        self.poll(handle, COMPLETE)
    }

    /// Returns a completed batch's wait group to the pool.
    ///
    /// # Panics
    ///
    /// Panics if the batch still has outstanding jobs, or if the handle is
    /// null or already released.
    pub fn release(&self, handle: WaitGroupHandle) {
        self.shared.group(handle).retire();
        self.shared.groups.put(handle.index());
    }

    /// Runs one scheduling step on the thread that called `init`.
    ///
    /// Takes a [`JobType::Main`] job first, then a [`JobType::Worker`] one.
    /// Returns `false` once both queues are empty, so `while scheduler.pump() {}`
    /// drains them. Jobs waiting for a coroutine still count as work.
    ///
    /// # Panics
    ///
    /// Panics on any other thread, or from inside a job.
    pub fn pump(&self) -> bool {
        assert!(
            self.host.is_current() && !self.in_job(),
            "`pump` must be called by the thread that initialised the scheduler, outside of any job"
        );
        self.shared.run_next(MAIN_WORKER) != Step::Idle
    }

    /// Stops the worker threads. Called automatically on drop.
    ///
    /// Jobs still queued or parked are abandoned. Once the scheduler is
    /// dropped, the stacks of suspended jobs are unwound and every coroutine
    /// thread exits.
    ///
    /// # Panics
    ///
    /// Panics if called from inside a job.
    pub fn shutdown(&self) {
        assert!(!self.in_job(), "a job cannot shut down its own scheduler");
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                log::error!("A worker thread panicked.");
            }
        }
        if let Some(thread) = self.host.thread_id() {
            self.shared.registry.unregister(thread);
        }

        let unfinished = self.stats().jobs_in_flight();
        if unfinished > 0 {
            log::warn!(
                "Job scheduler {} shut down with {unfinished} unfinished jobs.",
                self.shared.id
            );
        }
        log::info!("Job scheduler {} shut down.", self.shared.id);
    }

    /// Returns `true` if the calling code is a job running on this scheduler.
    pub fn in_job(&self) -> bool {
        CURRENT_JOB
            .with(Cell::get)
            .is_some_and(|context| context.scheduler == self.shared.id)
    }

    /// The worker index of the calling thread, if it is one of this
    /// scheduler's workers. Jobs run on their own coroutine threads and get
    /// `None`.
    pub fn worker_index(&self) -> Option<usize> {
        self.shared.registry.current()
    }

    /// Number of worker threads, including the main one.
    pub fn num_workers(&self) -> usize {
        self.shared.config.num_workers
    }

    /// The configuration this scheduler was started with.
    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Number of jobs waiting in the queue of `kind`.
    pub fn pending(&self, kind: JobType) -> usize {
        self.shared.queue(kind).len()
    }

    /// Takes a snapshot of the scheduler's counters and pool usage.
    pub fn stats(&self) -> SchedulerStats {
        let shared = &self.shared;
        SchedulerStats {
            pending_worker_jobs: shared.queue(JobType::Worker).len(),
            pending_main_jobs: shared.queue(JobType::Main).len(),
            free_jobs: shared.jobs.available(),
            free_coroutines: shared.coroutines.available(),
            free_wait_groups: shared.groups.available(),
            ..SchedulerStats::read_counters(&shared.counters)
        }
    }

    /// Records why the calling job leaves, then switches back to its worker.
    fn suspend_job(&self, context: JobContext, reason: Suspension) {
        self.shared.jobs.slot(context.job.0).lock().suspension = Some(reason);
        self.shared.coroutines.slot(context.coroutine).suspend();
    }

    fn current_job(&self, operation: &str) -> JobContext {
        match CURRENT_JOB.with(Cell::get) {
            Some(context) if context.scheduler == self.shared.id => context,
            _ => panic!("`{operation}` must be called from inside a job running on this scheduler"),
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.shared.id)
            .field("num_workers", &self.shared.config.num_workers)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.shared.shutdown.load(Ordering::Acquire) {
            self.shutdown();
        }
    }
}
