// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The active barrier guarding a peer against concurrent teardown.
//!
//! A peer operation runs under an *active reference*; teardown deactivates
//! the barrier (stopping new references), drains the in-flight ones, and
//! then lets exactly one caller run the cleanup. The whole state lives in
//! one atomic word so the acquire path is a single CAS.

use crate::sync::WaitQueue;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Lifecycle stage of the barrier. Only ever moves forward.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum Lifecycle {
    /// Initialized but never activated.
    New = 0,
    /// Active references can be acquired.
    Active = 1,
    /// No new references; in-flight ones may still be live.
    Deactivated = 2,
    /// No references left.
    Drained = 3,
    /// The cleanup winner is running its callback.
    Releasing = 4,
    /// Cleanup has finished.
    Released = 5,
}

mycelium_bitfield::bitfield! {
    /// One snapshot of the barrier state.
    #[derive(PartialEq, Eq)]
    struct State<usize> {
        /// Lifecycle stage bits; see [`Lifecycle`].
        const LIFECYCLE = 3;
        /// Number of in-flight active references.
        const COUNT = ..;
    }
}

impl State {
    fn lifecycle(self) -> Lifecycle {
        match self.get(Self::LIFECYCLE) {
            0 => Lifecycle::New,
            1 => Lifecycle::Active,
            2 => Lifecycle::Deactivated,
            3 => Lifecycle::Drained,
            4 => Lifecycle::Releasing,
            5 => Lifecycle::Released,
            bits => unreachable!("corrupt lifecycle bits: {bits}"),
        }
    }

    fn with_lifecycle(self, lifecycle: Lifecycle) -> Self {
        self.with(Self::LIFECYCLE, lifecycle as usize)
    }

    fn count(self) -> usize {
        self.get(Self::COUNT)
    }

    fn drained(self) -> bool {
        self.count() == 0 && self.lifecycle() >= Lifecycle::Deactivated
    }
}

#[derive(Debug)]
pub(crate) struct Active {
    state: AtomicUsize,
}

impl Active {
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicUsize::new(0),
        }
    }

    fn load(&self) -> State {
        State(self.state.load(Ordering::Acquire))
    }

    /// CAS loop; `f` maps a snapshot either to a successor state plus a
    /// result, or straight to a result without a transition.
    fn transition<R>(&self, mut f: impl FnMut(State) -> Result<(State, R), R>) -> R {
        let mut current = self.load();
        loop {
            match f(current) {
                Err(result) => return result,
                Ok((next, result)) => {
                    match self.state.compare_exchange_weak(
                        current.0,
                        next.0,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return result,
                        Err(actual) => current = State(actual),
                    }
                }
            }
        }
    }

    /// Activates the barrier. Succeeds exactly once, and only from the
    /// pristine state.
    pub(crate) fn activate(&self) -> bool {
        let new = State::new().with_lifecycle(Lifecycle::New);
        let active = State::new().with_lifecycle(Lifecycle::Active);
        self.state
            .compare_exchange(new.0, active.0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Acquires an active reference; fails once the barrier is no longer
    /// active. The reference must be returned via [`Active::release`].
    pub(crate) fn acquire(&self) -> bool {
        self.transition(|s| {
            if s.lifecycle() == Lifecycle::Active {
                Ok((s.with(State::COUNT, s.count() + 1), true))
            } else {
                Err(false)
            }
        })
    }

    /// Releases an active reference, waking the drain waiter when the last
    /// one goes away during teardown.
    pub(crate) fn release(&self, waitq: &WaitQueue) {
        let drained = self.transition(|s| {
            debug_assert!(s.count() > 0);
            let next = s.with(State::COUNT, s.count() - 1);
            Ok((next, next.drained()))
        });
        if drained {
            waitq.wake();
        }
    }

    /// Stops new references from being acquired. Idempotent; safe to call
    /// even if the barrier was never activated.
    pub(crate) fn deactivate(&self) {
        self.transition(|s| match s.lifecycle() {
            Lifecycle::New | Lifecycle::Active => Ok((s.with_lifecycle(Lifecycle::Deactivated), ())),
            _ => Err(()),
        });
    }

    pub(crate) fn is_new(&self) -> bool {
        self.load().lifecycle() == Lifecycle::New
    }

    pub(crate) fn is_deactivated(&self) -> bool {
        self.load().lifecycle() >= Lifecycle::Deactivated
    }

    /// Waits until the barrier is deactivated and no reference is left, then
    /// marks it drained. Safe to call from any number of threads.
    pub(crate) fn drain(&self, waitq: &WaitQueue) {
        waitq.wait_until(|| self.load().drained());
        self.transition(|s| {
            if s.lifecycle() == Lifecycle::Deactivated {
                debug_assert_eq!(s.count(), 0);
                Ok((s.with_lifecycle(Lifecycle::Drained), ()))
            } else {
                Err(())
            }
        });
    }

    /// Runs `f` on the drained barrier, exactly once across all callers.
    ///
    /// The winner returns true; every other caller blocks until the cleanup
    /// has finished and returns false.
    pub(crate) fn cleanup(&self, waitq: &WaitQueue, f: impl FnOnce()) -> bool {
        let mut f = Some(f);
        loop {
            let s = self.load();
            match s.lifecycle() {
                Lifecycle::Drained => {
                    let releasing = s.with_lifecycle(Lifecycle::Releasing);
                    if self
                        .state
                        .compare_exchange(s.0, releasing.0, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        if let Some(f) = f.take() {
                            f();
                        }
                        self.transition(|s| {
                            debug_assert_eq!(s.lifecycle(), Lifecycle::Releasing);
                            Ok((s.with_lifecycle(Lifecycle::Released), ()))
                        });
                        waitq.wake();
                        return true;
                    }
                }
                Lifecycle::Releasing => {
                    waitq.wait_until(|| self.load().lifecycle() == Lifecycle::Released);
                    return false;
                }
                Lifecycle::Released => return false,
                Lifecycle::New | Lifecycle::Active | Lifecycle::Deactivated => {
                    debug_assert!(false, "cleanup before drain");
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::thread;

    #[test]
    fn activation_happens_once() {
        let active = Active::new();
        assert!(active.is_new());
        assert!(!active.acquire());
        assert!(active.activate());
        assert!(!active.activate());
        assert!(!active.is_new());
    }

    #[test]
    fn concurrent_activation_has_one_winner() {
        let active = Arc::new(Active::new());
        let winners: usize = (0..8)
            .map(|_| {
                let active = Arc::clone(&active);
                thread::spawn(move || usize::from(active.activate()))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .sum();
        assert_eq!(winners, 1);
    }

    #[test]
    fn acquire_fails_after_deactivation() {
        let active = Active::new();
        let waitq = WaitQueue::new();
        active.activate();
        assert!(active.acquire());
        active.deactivate();
        assert!(!active.acquire());
        assert!(active.is_deactivated());
        active.release(&waitq);
        active.drain(&waitq);
    }

    #[test]
    fn deactivate_is_idempotent() {
        let active = Active::new();
        active.deactivate();
        active.deactivate();
        assert!(active.is_deactivated());
        assert!(!active.activate());
    }

    #[test]
    fn drain_waits_for_releases() {
        let active = Arc::new(Active::new());
        let waitq = Arc::new(WaitQueue::new());
        active.activate();
        for _ in 0..3 {
            assert!(active.acquire());
        }
        active.deactivate();

        let drainer = {
            let active = Arc::clone(&active);
            let waitq = Arc::clone(&waitq);
            thread::spawn(move || active.drain(&waitq))
        };
        for _ in 0..3 {
            active.release(&waitq);
        }
        drainer.join().unwrap();
        assert!(!active.acquire());
    }

    #[test]
    fn cleanup_runs_exactly_once() {
        let active = Arc::new(Active::new());
        let waitq = Arc::new(WaitQueue::new());
        let runs = Arc::new(StdAtomicUsize::new(0));
        active.activate();
        active.deactivate();
        active.drain(&waitq);

        let winners: usize = (0..4)
            .map(|_| {
                let active = Arc::clone(&active);
                let waitq = Arc::clone(&waitq);
                let runs = Arc::clone(&runs);
                thread::spawn(move || {
                    usize::from(active.cleanup(&waitq, || {
                        runs.fetch_add(1, Ordering::SeqCst);
                    }))
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .sum();

        assert_eq!(winners, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        // Late caller sees it already cleaned up.
        assert!(!active.cleanup(&waitq, || unreachable!()));
    }
}
