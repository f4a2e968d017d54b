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

//! Maps OS threads to worker indices.

use crate::error::{SchedulerError, SchedulerResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::thread::{self, ThreadId};

/// Worker index of the thread that initialised the scheduler.
pub const MAIN_WORKER: usize = 0;

/// Records which OS thread runs which worker loop.
///
/// Coroutine backing threads are not registered: a job does not belong to a
/// worker, it is only borrowed by whichever worker resumed it.
#[derive(Debug)]
pub struct ThreadRegistry {
    capacity: usize,
    workers: RwLock<HashMap<ThreadId, usize>>,
}

impl ThreadRegistry {
    /// Creates a registry accepting worker indices below `capacity`.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            workers: RwLock::new(HashMap::with_capacity(capacity)),
        }
    }

    /// Registers the calling thread as worker `index`.
    pub fn register_current(&self, index: usize) -> SchedulerResult<()> {
        self.register(thread::current().id(), index)
    }

    /// Registers `thread` as worker `index`.
    ///
    /// Fails if the index is beyond capacity or already taken by another thread.
    pub fn register(&self, thread: ThreadId, index: usize) -> SchedulerResult<()> {
        if index >= self.capacity {
            return Err(SchedulerError::TooManyWorkers {
                requested: index + 1,
                max: self.capacity,
            });
        }

        let mut workers = self.workers.write();
        if let Some((other, _)) = workers
            .iter()
            .find(|(other, taken)| **taken == index && **other != thread)
        {
            return Err(SchedulerError::InvalidConfig(format!(
                "worker index {index} is already registered to {other:?}"
            )));
        }
        workers.insert(thread, index);
        log::trace!("Registered {thread:?} as worker {index}.");
        Ok(())
    }

    /// Removes the calling thread from the registry.
    pub fn unregister_current(&self) {
        self.unregister(thread::current().id());
    }

    /// Removes `thread` from the registry.
    pub fn unregister(&self, thread: ThreadId) {
        self.workers.write().remove(&thread);
    }

    /// The worker index of `thread`, if it runs a worker loop.
    pub fn index_of(&self, thread: ThreadId) -> Option<usize> {
        self.workers.read().get(&thread).copied()
    }

    /// The worker index of the calling thread.
    pub fn current(&self) -> Option<usize> {
        self.index_of(thread::current().id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry = ThreadRegistry::new(2);
        registry.register_current(MAIN_WORKER).unwrap();
        assert_eq!(registry.current(), Some(MAIN_WORKER));

        let other = thread::spawn(|| thread::current().id()).join().unwrap();
        registry.register(other, 1).unwrap();
        assert_eq!(registry.index_of(other), Some(1));

        registry.unregister(other);
        assert_eq!(registry.index_of(other), None);
    }

    #[test]
    fn test_index_beyond_capacity_is_rejected() {
        let registry = ThreadRegistry::new(1);
        assert!(matches!(
            registry.register_current(1),
            Err(SchedulerError::TooManyWorkers { requested: 2, max: 1 })
        ));
        assert_eq!(registry.current(), None);
    }

    #[test]
    fn test_index_cannot_be_claimed_twice() {
        let registry = ThreadRegistry::new(4);
        registry.register_current(2).unwrap();
        let other = thread::spawn(|| thread::current().id()).join().unwrap();
        assert!(registry.register(other, 2).is_err());
        // Re-registering the same thread under the same index is harmless.
        assert!(registry.register_current(2).is_ok());
    }

    #[test]
    fn test_unregistered_thread_has_no_index() {
        let registry = ThreadRegistry::new(1);
        registry.register_current(MAIN_WORKER).unwrap();
        let seen = thread::scope(|scope| {
            scope
                .spawn(|| registry.current())
                .join()
                .unwrap()
        });
        assert_eq!(seen, None);
    }
}
