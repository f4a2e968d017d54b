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

//! # Khora Jobs
//!
//! Fiber-based cooperative job scheduler used by the engine's subsystems
//! (asset loading, render submission, ...) to fan work out across a fixed pool
//! of worker threads.
//!
//! Work is submitted in batches of [`JobDescriptor`]s. Each batch is tracked by
//! a wait group, and a job can cooperatively block on another batch without
//! tying up its worker thread: the job's coroutine is parked and the worker
//! moves on to other work until the batch completes.
//!
//! ```rust,ignore
//! use khora_jobs::{JobDescriptor, JobType, Scheduler, SchedulerConfig};
//!
//! fn load_chunk(data: *mut ()) { /* ... */ }
//!
//! let scheduler = Scheduler::init(SchedulerConfig::default().with_workers(4))?;
//! let batch = scheduler.submit(&[JobDescriptor::new(load_chunk, ptr, JobType::Worker)])?;
//! scheduler.wait_spin(batch, 0);
//! scheduler.release(batch);
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod coroutine;
pub mod error;
pub mod job;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod stats;
pub mod wait_group;

pub use config::SchedulerConfig;
pub use coroutine::{Coroutine, CoroutineState, ThreadFiber};
pub use error::{PoolKind, SchedulerError, SchedulerResult};
pub use job::{JobDescriptor, JobFn, JobType};
pub use scheduler::Scheduler;
pub use stats::SchedulerStats;
pub use wait_group::WaitGroupHandle;
