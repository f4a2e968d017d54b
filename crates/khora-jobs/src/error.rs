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

//! Error types returned by the job scheduler.
//!
//! Only runtime conditions are reported through [`SchedulerError`]. Structural
//! misuse (waiting outside a job, using a released handle, ...) panics instead.

use std::fmt;
use thiserror::Error;

/// Identifies one of the scheduler's fixed-capacity pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// The pool of job records, sized by `max_jobs`.
    Job,
    /// The pool of wait groups, sized by `max_wait_groups`.
    WaitGroup,
    /// The pool of coroutines, sized by `max_coroutines`.
    Coroutine,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKind::Job => write!(f, "job"),
            PoolKind::WaitGroup => write!(f, "wait group"),
            PoolKind::Coroutine => write!(f, "coroutine"),
        }
    }
}

/// An error raised by the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A fixed-capacity pool had no free slot left.
    ///
    /// This is a resource limit, not a bug: the caller may retry the batch
    /// later or back off.
    #[error("{pool} pool exhausted (capacity {capacity})")]
    PoolExhausted {
        /// The pool that ran dry.
        pool: PoolKind,
        /// The fixed capacity of that pool.
        capacity: usize,
    },
    /// More worker threads were requested than the scheduler supports.
    #[error("requested {requested} worker threads but at most {max} are supported")]
    TooManyWorkers {
        /// The number of workers requested.
        requested: usize,
        /// The configured upper bound.
        max: usize,
    },
    /// The configuration is unusable (zero workers, zero capacities, ...).
    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),
    /// The OS refused to spawn a worker or coroutine thread.
    #[error("failed to spawn thread '{name}': {source}")]
    Spawn {
        /// The name of the thread that could not be spawned.
        name: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The scheduler was shut down and accepts no more work.
    #[error("the scheduler has been shut down")]
    ShutDown,
}

/// A specialized `Result` type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_exhausted_message_names_pool() {
        let err = SchedulerError::PoolExhausted {
            pool: PoolKind::WaitGroup,
            capacity: 16,
        };
        assert_eq!(err.to_string(), "wait group pool exhausted (capacity 16)");
    }

    #[test]
    fn test_spawn_error_exposes_source() {
        use std::error::Error;

        let err = SchedulerError::Spawn {
            name: "khora-worker-1".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "no threads left"),
        };
        assert!(err.source().is_some());
        assert!(err.to_string().contains("khora-worker-1"));
    }
}
