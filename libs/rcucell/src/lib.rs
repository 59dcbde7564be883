// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! # A read-mostly atomic [`Arc`] cell.
//!
//! [`RcuCell`] holds zero or one `Arc<T>` and lets any number of threads read
//! it without taking a lock, while writers swap the stored reference out from
//! under them. The old reference is not released immediately on a swap;
//! instead it is retired through [`crossbeam-epoch`], so a reader that loaded
//! the pointer just before the swap can still safely access (and clone) the
//! pointee for as long as its critical section lasts.
//!
//! This is the userspace analog of an RCU-protected pointer: `get` and `with`
//! correspond to a read-side critical section, `replace`/`take` to
//! `rcu_assign_pointer` plus a deferred free.
//!
//! Writers need no coordination for memory safety. If the *protocol* around a
//! cell requires a single writer at a time (for example, publishing a pointer
//! exactly once), serialize the writers externally.
//!
//! [`crossbeam-epoch`]: crossbeam_epoch

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

/// A cell holding zero or one `Arc<T>`, readable without locks.
///
/// The cell owns one strong reference to its current pointee. That reference
/// is only ever released through the epoch collector, after every reader that
/// could have observed the pointer has finished its critical section.
pub struct RcuCell<T> {
    ptr: AtomicPtr<T>,
}

impl<T> RcuCell<T> {
    /// Returns a new, empty cell.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Returns a new cell holding `value`.
    #[must_use]
    pub fn new(value: Arc<T>) -> Self {
        Self {
            ptr: AtomicPtr::new(Arc::into_raw(value).cast_mut()),
        }
    }

    /// Returns whether the cell currently holds a value.
    ///
    /// The answer may be stale by the time the caller acts on it.
    pub fn is_set(&self) -> bool {
        !self.ptr.load(Ordering::Acquire).is_null()
    }
}

impl<T: Send + Sync + 'static> RcuCell<T> {
    /// Clones the stored `Arc` without taking a lock.
    ///
    /// Returns `None` if the cell is empty. The returned `Arc` is an
    /// independent strong reference; it stays valid even if the cell is
    /// concurrently replaced or dropped.
    pub fn get(&self) -> Option<Arc<T>> {
        let guard = crossbeam_epoch::pin();
        let ptr = self.ptr.load(Ordering::Acquire);
        if ptr.is_null() {
            return None;
        }
        // Safety: the cell owns a strong reference to the pointee, and that
        // reference is only released through a deferred drop registered
        // *after* the pointer is swapped out. Our guard was pinned before the
        // load, so the deferred drop cannot have run yet and the strong count
        // is at least one.
        unsafe { Arc::increment_strong_count(ptr) };
        drop(guard);
        // Safety: the count was incremented above for this exact pointer.
        Some(unsafe { Arc::from_raw(ptr) })
    }

    /// Calls `f` with a borrow of the pointee, without touching the
    /// reference count.
    ///
    /// The borrow is valid only for the duration of the call; this is the
    /// cheap path for hot reads that just inspect a field.
    pub fn with<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        let _guard = crossbeam_epoch::pin();
        let ptr = self.ptr.load(Ordering::Acquire);
        // Safety: as in `get`, the pointee cannot be released while our
        // guard is pinned.
        f(unsafe { ptr.as_ref() })
    }

    /// Stores `new` (or empties the cell), retiring the previous reference
    /// through the epoch collector.
    ///
    /// Returns whether the cell held a value before the call.
    pub fn replace(&self, new: Option<Arc<T>>) -> bool {
        let new_ptr = new.map_or(ptr::null_mut(), |arc| Arc::into_raw(arc).cast_mut());
        let old = self.ptr.swap(new_ptr, Ordering::AcqRel);
        if old.is_null() {
            return false;
        }
        self.retire(old);
        true
    }

    /// Empties the cell and returns the stored `Arc`, if any.
    ///
    /// The cell's own reference is still retired through the collector; the
    /// returned `Arc` is a fresh strong reference, so dropping it does not
    /// invalidate concurrent readers.
    pub fn take(&self) -> Option<Arc<T>> {
        let old = self.ptr.swap(ptr::null_mut(), Ordering::AcqRel);
        if old.is_null() {
            return None;
        }
        // Safety: the cell's strong reference is still live; it is released
        // below via `retire`, never synchronously.
        unsafe { Arc::increment_strong_count(old) };
        self.retire(old);
        // Safety: the count was incremented above for this exact pointer.
        Some(unsafe { Arc::from_raw(old) })
    }

    fn retire(&self, old: *mut T) {
        let guard = crossbeam_epoch::pin();
        // Safety: `old` carries the strong reference the cell owned. Readers
        // pinned before the swap may still be borrowing the pointee, so the
        // release must wait for their critical sections; `defer_unchecked`
        // is required (rather than `defer`) because the raw pointer is not
        // `Send`, but `T: Send + Sync` makes the deferred drop itself safe
        // to run on any thread.
        unsafe { guard.defer_unchecked(move || drop(Arc::from_raw(old))) };
    }
}

impl<T> Drop for RcuCell<T> {
    fn drop(&mut self) {
        let ptr = *self.ptr.get_mut();
        if !ptr.is_null() {
            // Safety: we have exclusive access, so no reader can be inside a
            // critical section on this cell; the cell's own reference can be
            // released synchronously.
            drop(unsafe { Arc::from_raw(ptr) });
        }
    }
}

impl<T> Default for RcuCell<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: core::fmt::Debug + Send + Sync + 'static> core::fmt::Debug for RcuCell<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.with(|inner| f.debug_tuple("RcuCell").field(&inner).finish())
    }
}

// Safety: the cell hands out `Arc<T>` clones and `&T` borrows across
// threads, so it requires the same bounds as `Arc<T>` itself.
unsafe impl<T: Send + Sync> Send for RcuCell<T> {}
// Safety: see above.
unsafe impl<T: Send + Sync> Sync for RcuCell<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[test]
    fn empty_cell() {
        let cell: RcuCell<u64> = RcuCell::empty();
        assert!(!cell.is_set());
        assert!(cell.get().is_none());
        cell.with(|v| assert!(v.is_none()));
        assert!(cell.take().is_none());
    }

    #[test]
    fn set_get_take() {
        let cell = RcuCell::empty();
        assert!(!cell.replace(Some(Arc::new(17_u64))));
        assert!(cell.is_set());
        assert_eq!(*cell.get().unwrap(), 17);
        cell.with(|v| assert_eq!(v.copied(), Some(17)));

        assert!(cell.replace(Some(Arc::new(42))));
        assert_eq!(*cell.get().unwrap(), 42);

        assert_eq!(*cell.take().unwrap(), 42);
        assert!(!cell.is_set());
        assert!(cell.get().is_none());
    }

    #[test]
    fn replace_with_none_clears() {
        let cell = RcuCell::new(Arc::new(1_u64));
        assert!(cell.replace(None));
        assert!(!cell.is_set());
        assert!(!cell.replace(None));
    }

    #[test]
    fn taken_value_outlives_cell() {
        let cell = RcuCell::new(Arc::new(String::from("still here")));
        let value = cell.take().unwrap();
        drop(cell);
        assert_eq!(*value, "still here");
    }

    /// Readers hammer `get` and `with` while a writer keeps swapping the
    /// value; every observed value must be intact.
    #[test]
    fn concurrent_readers_and_writer() {
        const ROUNDS: u64 = 10_000;

        let cell = Arc::new(RcuCell::new(Arc::new(0_u64)));
        let stop = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cell = Arc::clone(&cell);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    let mut last = 0;
                    while !stop.load(Ordering::Acquire) {
                        if let Some(v) = cell.get() {
                            // Writer publishes increasing values.
                            assert!(*v <= ROUNDS);
                            assert!(*v >= last);
                            last = *v;
                        }
                        cell.with(|v| {
                            if let Some(v) = v {
                                assert!(*v <= ROUNDS);
                            }
                        });
                    }
                })
            })
            .collect();

        for i in 1..=ROUNDS {
            cell.replace(Some(Arc::new(i)));
        }
        stop.store(true, Ordering::Release);
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(*cell.get().unwrap(), ROUNDS);
    }
}
