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

//! Stackful coroutines.
//!
//! [`Coroutine`] is the contract the scheduler relies on: a body that can be
//! suspended at any depth of its call stack and later resumed, possibly from a
//! different worker thread, with every local intact.
//!
//! [`ThreadFiber`] implements it by giving each coroutine its own OS thread and
//! passing a baton back and forth so that exactly one side runs at a time. The
//! thread outlives any single body: once a body finishes the thread goes idle
//! and the next [`prepare`](Coroutine::prepare) reuses it.
//!
//! Dropping a [`ThreadFiber`] whose body is suspended unwinds that body, so
//! its locals are dropped and the backing thread exits.

use crate::error::{SchedulerError, SchedulerResult};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

/// The body of a coroutine.
pub type Entry = Box<dyn FnOnce() + Send + 'static>;

/// Runs on the coroutine right after its body returns.
pub type FinishCallback = Box<dyn FnOnce() + Send + 'static>;

/// Lifecycle of a coroutine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoroutineState {
    /// Never prepared.
    Init,
    /// Currently executing on some thread.
    Running,
    /// Holds a body that is ready to start or continue.
    Suspended,
    /// Its body has returned; ready to be prepared again.
    Finished,
}

/// A resumable, stackful execution context.
///
/// `resume` and `suspend` are the only switch points. A coroutine is driven by
/// one resumer at a time and `suspend` may only be called from inside its own
/// body.
pub trait Coroutine: Send + Sync {
    /// Returns a context standing for the calling OS thread itself.
    ///
    /// It starts out `Running` and hosts the thread's scheduling loop; it can
    /// neither be prepared nor switched into.
    fn convert_current_thread() -> Self
    where
        Self: Sized;

    /// The current state.
    fn state(&self) -> CoroutineState;

    /// Binds a fresh body: `Init`/`Finished` → `Suspended`.
    fn prepare(&self, entry: Entry, on_finish: Option<FinishCallback>) -> SchedulerResult<()>;

    /// Switches into the coroutine until it suspends or finishes:
    /// `Suspended` → `Running`.
    fn resume(&self);

    /// Switches back to the resumer: `Running` → `Suspended`.
    fn suspend(&self);
}

/// Unwind payload raised inside a suspended body when its fiber is dropped.
pub(crate) struct Abandoned;

/// Whose turn it is to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Turn {
    Resumer,
    Fiber,
}

struct FiberSlot {
    state: CoroutineState,
    turn: Turn,
    entry: Option<Entry>,
    on_finish: Option<FinishCallback>,
    owner: Option<ThreadId>,
    exit: bool,
}

struct Baton {
    slot: Mutex<FiberSlot>,
    turn_changed: Condvar,
}

thread_local! {
    /// Name of the fiber whose backing thread this is.
    static FIBER_NAME: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// A [`Coroutine`] backed by a dedicated, reusable OS thread.
pub struct ThreadFiber {
    name: String,
    native: bool,
    baton: Arc<Baton>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadFiber {
    /// Creates an idle coroutine. Its backing thread is spawned on first use.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_state(name.into(), false, CoroutineState::Init, None)
    }

    fn with_state(
        name: String,
        native: bool,
        state: CoroutineState,
        owner: Option<ThreadId>,
    ) -> Self {
        Self {
            name,
            native,
            baton: Arc::new(Baton {
                slot: Mutex::new(FiberSlot {
                    state,
                    turn: Turn::Resumer,
                    entry: None,
                    on_finish: None,
                    owner,
                    exit: false,
                }),
                turn_changed: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    /// The name given at construction (also the backing thread's name).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` for a context made by
    /// [`convert_current_thread`](Coroutine::convert_current_thread).
    pub fn is_native(&self) -> bool {
        self.native
    }

    /// Returns `true` if the calling thread is the one this context runs on.
    pub fn is_current(&self) -> bool {
        self.baton.slot.lock().owner == Some(thread::current().id())
    }

    /// The OS thread this context runs on, once known.
    ///
    /// Set at construction for a converted thread, and when the backing
    /// thread starts for a regular coroutine.
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.baton.slot.lock().owner
    }

    /// Name of the fiber the calling thread backs, if any.
    pub fn current_name() -> Option<String> {
        FIBER_NAME.with(|name| name.borrow().clone())
    }

    fn ensure_thread(&self) -> SchedulerResult<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }

        let baton = Arc::clone(&self.baton);
        let name = self.name.clone();
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || fiber_main(name, baton))
            .map_err(|source| SchedulerError::Spawn {
                name: self.name.clone(),
                source,
            })?;
        *thread = Some(handle);
        Ok(())
    }
}

impl Coroutine for ThreadFiber {
    fn convert_current_thread() -> Self {
        let current = thread::current();
        let name = current
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{:?}", current.id()));
        Self::with_state(name, true, CoroutineState::Running, Some(current.id()))
    }

    fn state(&self) -> CoroutineState {
        self.baton.slot.lock().state
    }

    fn prepare(&self, entry: Entry, on_finish: Option<FinishCallback>) -> SchedulerResult<()> {
        assert!(!self.native, "cannot prepare native context '{}'", self.name);
        self.ensure_thread()?;

        let mut slot = self.baton.slot.lock();
        assert!(
            matches!(slot.state, CoroutineState::Init | CoroutineState::Finished),
            "cannot prepare coroutine '{}' while it is {:?}",
            self.name,
            slot.state
        );
        slot.entry = Some(entry);
        slot.on_finish = on_finish;
        slot.state = CoroutineState::Suspended;
        Ok(())
    }

    fn resume(&self) {
        assert!(!self.native, "cannot resume native context '{}'", self.name);

        let mut slot = self.baton.slot.lock();
        assert_eq!(
            slot.state,
            CoroutineState::Suspended,
            "cannot resume coroutine '{}'",
            self.name
        );
        slot.state = CoroutineState::Running;
        slot.turn = Turn::Fiber;
        self.baton.turn_changed.notify_all();
        while slot.turn == Turn::Fiber {
            self.baton.turn_changed.wait(&mut slot);
        }
    }

    fn suspend(&self) {
        let mut slot = self.baton.slot.lock();
        assert!(
            !self.native && slot.owner == Some(thread::current().id()),
            "coroutine '{}' can only be suspended from inside its own body",
            self.name
        );
        assert_eq!(
            slot.state,
            CoroutineState::Running,
            "cannot suspend coroutine '{}'",
            self.name
        );
        slot.state = CoroutineState::Suspended;
        slot.turn = Turn::Resumer;
        self.baton.turn_changed.notify_all();
        while slot.turn == Turn::Resumer && !slot.exit {
            self.baton.turn_changed.wait(&mut slot);
        }
        if slot.turn == Turn::Resumer {
            // Dropped while suspended: nobody will resume this body.
            drop(slot);
            panic::resume_unwind(Box::new(Abandoned));
        }
    }
}

impl fmt::Debug for ThreadFiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadFiber")
            .field("name", &self.name)
            .field("native", &self.native)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for ThreadFiber {
    fn drop(&mut self) {
        let Some(handle) = self.thread.get_mut().take() else {
            return;
        };

        let mid_body = {
            let mut slot = self.baton.slot.lock();
            slot.exit = true;
            self.baton.turn_changed.notify_all();
            slot.state == CoroutineState::Suspended && slot.entry.is_none()
        };
        if mid_body {
            log::debug!("Coroutine '{}' dropped while suspended; unwinding its body.", self.name);
        }

        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            log::error!("Coroutine thread '{}' panicked.", self.name);
        }
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

/// Body of a coroutine's backing thread: wait for a turn, run the bound
/// entry to completion, hand the baton back, repeat.
fn fiber_main(name: String, baton: Arc<Baton>) {
    FIBER_NAME.with(|slot| *slot.borrow_mut() = Some(name.clone()));
    baton.slot.lock().owner = Some(thread::current().id());

    loop {
        let (entry, on_finish) = {
            let mut slot = baton.slot.lock();
            while slot.turn != Turn::Fiber && !slot.exit {
                baton.turn_changed.wait(&mut slot);
            }
            if slot.exit {
                break;
            }
            (slot.entry.take(), slot.on_finish.take())
        };

        match entry {
            Some(entry) => {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry)) {
                    if !payload.is::<Abandoned>() {
                        log::error!(
                            "Coroutine '{name}' body panicked: {}",
                            panic_message(payload.as_ref())
                        );
                    }
                }
            }
            None => log::error!("Coroutine '{name}' resumed without a body."),
        }
        if let Some(on_finish) = on_finish {
            on_finish();
        }

        let mut slot = baton.slot.lock();
        slot.state = CoroutineState::Finished;
        slot.turn = Turn::Resumer;
        baton.turn_changed.notify_all();
    }

    log::trace!("Coroutine thread '{name}' exiting.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_suspend_and_resume_preserve_locals() {
        let fiber = Arc::new(ThreadFiber::new("test-fiber"));
        let trace = Arc::new(Mutex::new(Vec::new()));

        let body = {
            let fiber = Arc::clone(&fiber);
            let trace = Arc::clone(&trace);
            move || {
                let mut local = 1;
                trace.lock().push(local);
                fiber.suspend();
                local += 1;
                trace.lock().push(local);
                fiber.suspend();
                local += 1;
                trace.lock().push(local);
            }
        };

        assert_eq!(fiber.state(), CoroutineState::Init);
        fiber.prepare(Box::new(body), None).unwrap();
        assert_eq!(fiber.state(), CoroutineState::Suspended);

        fiber.resume();
        assert_eq!(fiber.state(), CoroutineState::Suspended);
        assert_eq!(*trace.lock(), vec![1]);

        fiber.resume();
        assert_eq!(*trace.lock(), vec![1, 2]);

        fiber.resume();
        assert_eq!(fiber.state(), CoroutineState::Finished);
        assert_eq!(*trace.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_finished_fiber_can_be_prepared_again() {
        let fiber = ThreadFiber::new("reused-fiber");
        let runs = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let runs = Arc::clone(&runs);
            let finished = Arc::clone(&finished);
            fiber
                .prepare(
                    Box::new(move || {
                        runs.fetch_add(1, Ordering::SeqCst);
                    }),
                    Some(Box::new(move || {
                        finished.fetch_add(1, Ordering::SeqCst);
                    })),
                )
                .unwrap();
            fiber.resume();
            assert_eq!(fiber.state(), CoroutineState::Finished);
        }

        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_panicking_body_still_finishes() {
        let fiber = ThreadFiber::new("panicking-fiber");
        fiber
            .prepare(Box::new(|| panic!("boom")), None)
            .unwrap();
        fiber.resume();
        assert_eq!(fiber.state(), CoroutineState::Finished);
    }

    #[test]
    fn test_resume_from_another_thread() {
        let fiber = Arc::new(ThreadFiber::new("migrating-fiber"));
        let body = {
            let fiber = Arc::clone(&fiber);
            move || {
                assert_eq!(ThreadFiber::current_name().as_deref(), Some("migrating-fiber"));
                fiber.suspend();
            }
        };
        fiber.prepare(Box::new(body), None).unwrap();
        fiber.resume();
        assert_eq!(fiber.state(), CoroutineState::Suspended);

        let resumer = Arc::clone(&fiber);
        thread::spawn(move || resumer.resume()).join().unwrap();
        assert_eq!(fiber.state(), CoroutineState::Finished);
    }

    #[test]
    fn test_dropping_a_suspended_fiber_unwinds_its_body() {
        struct SetOnDrop(Arc<AtomicUsize>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let fiber = Box::new(ThreadFiber::new("abandoned-fiber"));
        let dropped = Arc::new(AtomicUsize::new(0));
        let reached_end = Arc::new(AtomicUsize::new(0));

        // The body must not own the fiber, or dropping it would be impossible.
        let fiber_addr = &*fiber as *const ThreadFiber as usize;
        let body = {
            let dropped = Arc::clone(&dropped);
            let reached_end = Arc::clone(&reached_end);
            move || {
                let _guard = SetOnDrop(dropped);
                let fiber = unsafe { &*(fiber_addr as *const ThreadFiber) };
                fiber.suspend();
                reached_end.fetch_add(1, Ordering::SeqCst);
            }
        };
        fiber.prepare(Box::new(body), None).unwrap();
        fiber.resume();
        assert_eq!(fiber.state(), CoroutineState::Suspended);
        assert_eq!(dropped.load(Ordering::SeqCst), 0);

        drop(fiber);
        assert_eq!(dropped.load(Ordering::SeqCst), 1, "body locals must be dropped");
        assert_eq!(reached_end.load(Ordering::SeqCst), 0, "body must not run past the suspend");
    }

    #[test]
    fn test_converted_thread_is_running_and_current() {
        let native = ThreadFiber::convert_current_thread();
        assert!(native.is_native());
        assert!(native.is_current());
        assert_eq!(native.thread_id(), Some(thread::current().id()));
        assert_eq!(native.state(), CoroutineState::Running);
    }

    #[test]
    #[should_panic(expected = "native")]
    fn test_native_context_cannot_be_resumed() {
        ThreadFiber::convert_current_thread().resume();
    }

    #[test]
    #[should_panic(expected = "own body")]
    fn test_suspend_outside_body_panics() {
        let fiber = ThreadFiber::new("outside-fiber");
        fiber.prepare(Box::new(|| {}), None).unwrap();
        fiber.suspend();
    }
}
