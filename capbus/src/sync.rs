// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Wake-up plumbing shared by the queue and the peer lifecycle.

use core::hint;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, MutexGuard};

/// An [exponential backoff] for spin loops.
///
/// [exponential backoff]: https://en.wikipedia.org/wiki/Exponential_backoff
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct Backoff {
    exp: u8,
}

impl Backoff {
    /// Past this exponent, yield to the scheduler instead of spinning hotter.
    const YIELD_EXPONENT: u8 = 6;

    pub(crate) const fn new() -> Self {
        Self { exp: 0 }
    }

    /// Backs off once, issuing `2^exp` spin-loop hints and escalating the
    /// exponent, handing the thread back to the scheduler once spinning has
    /// not helped for a while.
    #[inline]
    pub(crate) fn spin(&mut self) {
        if self.exp >= Self::YIELD_EXPONENT {
            std::thread::yield_now();
            return;
        }
        for _ in 0..(1_u32 << self.exp) {
            hint::spin_loop();
        }
        self.exp += 1;
    }
}

/// A wake-up channel with an embedded serializer lock.
///
/// The channel itself is just an event counter: `wake` bumps it, waiters poll
/// their condition with backoff. The counter makes wake-ups *observable*,
/// which the queue's readability contract requires (one wake-up per
/// false-to-true edge), and gives pollers an edge to watch.
///
/// The embedded lock is deliberately public to the rest of the crate: the
/// peer borrows it to serialize publishing and retracting its info pointer,
/// because connect and cleanup already interact with the wait queue and a
/// dedicated third lock would buy nothing.
#[derive(Debug)]
pub(crate) struct WaitQueue {
    lock: Mutex<()>,
    wakes: AtomicU64,
}

impl WaitQueue {
    pub(crate) const fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            wakes: AtomicU64::new(0),
        }
    }

    /// Signals one event. Each call is counted exactly once.
    pub(crate) fn wake(&self) {
        self.wakes.fetch_add(1, Ordering::Release);
    }

    /// Number of wake-ups issued so far.
    pub(crate) fn wakeups(&self) -> u64 {
        self.wakes.load(Ordering::Acquire)
    }

    /// Polls `cond` with exponential backoff until it returns true.
    pub(crate) fn wait_until(&self, mut cond: impl FnMut() -> bool) {
        let mut boff = Backoff::new();
        while !cond() {
            boff.spin();
        }
    }

    /// Borrows the wait-queue lock as a serializer.
    pub(crate) fn serialize(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }
}
