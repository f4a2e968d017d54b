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

//! Runtime configuration for the job scheduler.

use crate::error::{SchedulerError, SchedulerResult};
use serde::{Deserialize, Serialize};
use std::thread;

/// Default upper bound on worker threads.
pub const DEFAULT_MAX_WORKERS: usize = 64;
/// Default number of job records available at once.
pub const DEFAULT_MAX_JOBS: usize = 4096;
/// Default number of coroutines available at once.
pub const DEFAULT_MAX_COROUTINES: usize = 256;
/// Default number of live wait groups.
pub const DEFAULT_MAX_WAIT_GROUPS: usize = 1024;

/// Batch sizes are counted in an `i32`.
const MAX_POOL_CAPACITY: usize = i32::MAX as usize;

/// Configuration for the [`Scheduler`](crate::Scheduler).
///
/// All capacities are fixed for the lifetime of a scheduler; pools never grow.
/// Missing fields fall back to their defaults when deserialized, so engine
/// config files only need to name what they override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of worker threads, including the thread that calls `init`.
    pub num_workers: usize,
    /// Upper bound accepted for `num_workers`.
    pub max_workers: usize,
    /// Maximum number of jobs submitted but not yet finished.
    pub max_jobs: usize,
    /// Maximum number of coroutines (running, yielded or parked jobs).
    pub max_coroutines: usize,
    /// Maximum number of wait groups alive at once.
    pub max_wait_groups: usize,
    /// How long an idle worker sleeps once its spin backoff is exhausted.
    pub idle_sleep_us: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let cores = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            num_workers: cores.min(DEFAULT_MAX_WORKERS),
            max_workers: DEFAULT_MAX_WORKERS,
            max_jobs: DEFAULT_MAX_JOBS,
            max_coroutines: DEFAULT_MAX_COROUTINES,
            max_wait_groups: DEFAULT_MAX_WAIT_GROUPS,
            idle_sleep_us: 100,
        }
    }
}

impl SchedulerConfig {
    /// Returns this configuration with `num_workers` replaced.
    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Returns this configuration with the three pool capacities replaced.
    pub fn with_capacities(
        mut self,
        max_jobs: usize,
        max_coroutines: usize,
        max_wait_groups: usize,
    ) -> Self {
        self.max_jobs = max_jobs;
        self.max_coroutines = max_coroutines;
        self.max_wait_groups = max_wait_groups;
        self
    }

    /// Checks that the configuration can be used to build a scheduler.
    ///
    /// Asking for more workers than `max_workers` is an error rather than a
    /// silent truncation.
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.num_workers == 0 {
            return Err(SchedulerError::InvalidConfig(
                "num_workers must be at least 1".to_string(),
            ));
        }
        if self.num_workers > self.max_workers {
            return Err(SchedulerError::TooManyWorkers {
                requested: self.num_workers,
                max: self.max_workers,
            });
        }
        for (name, value) in [
            ("max_jobs", self.max_jobs),
            ("max_coroutines", self.max_coroutines),
            ("max_wait_groups", self.max_wait_groups),
        ] {
            if value == 0 || value > MAX_POOL_CAPACITY {
                return Err(SchedulerError::InvalidConfig(format!(
                    "{name} must be between 1 and {MAX_POOL_CAPACITY}, got {value}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SchedulerConfig::default();
        assert!(config.num_workers >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_too_many_workers_is_rejected() {
        let config = SchedulerConfig {
            num_workers: 9,
            max_workers: 8,
            ..Default::default()
        };
        match config.validate() {
            Err(SchedulerError::TooManyWorkers { requested, max }) => {
                assert_eq!(requested, 9);
                assert_eq!(max, 8);
            }
            other => panic!("expected TooManyWorkers, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_workers_and_zero_capacity_are_rejected() {
        let zero_workers = SchedulerConfig::default().with_workers(0);
        assert!(matches!(
            zero_workers.validate(),
            Err(SchedulerError::InvalidConfig(_))
        ));

        let zero_jobs = SchedulerConfig::default().with_capacities(0, 8, 8);
        assert!(matches!(
            zero_jobs.validate(),
            Err(SchedulerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_partial_config_deserializes_with_defaults() {
        let config: SchedulerConfig =
            serde_json::from_str(r#"{ "num_workers": 2, "max_coroutines": 32 }"#)
                .expect("partial config should deserialize");
        assert_eq!(config.num_workers, 2);
        assert_eq!(config.max_coroutines, 32);
        assert_eq!(config.max_jobs, DEFAULT_MAX_JOBS);
        assert_eq!(config.max_wait_groups, DEFAULT_MAX_WAIT_GROUPS);
    }
}
