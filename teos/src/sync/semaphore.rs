//! Counting semaphore.

use crate::{
    interrupt::{InterruptGuard, IntrCell},
    kernel::Kernel,
    thread::{self, Thread, Tid, scheduler::SchedPolicy},
};
use alloc::{boxed::Box, vec::Vec};
use core::{cell::Cell, ptr::NonNull};

/// A counting semaphore.
///
/// A semaphore holds a non-negative count. [`down`] waits for the count to
/// become positive and decrements it; [`up`] increments it and wakes one
/// waiter, if any. A semaphore initialized to 0 is a pure event: the downer
/// blocks until the upper has signaled, regardless of which side gets there
/// first.
///
/// [`down`]: Semaphore::down
/// [`up`]: Semaphore::up
pub struct Semaphore {
    value: Cell<usize>,
    waiters: IntrCell<Vec<Box<Thread>>>,
}

impl Semaphore {
    /// Creates a semaphore with initial count `value`.
    pub const fn new(value: usize) -> Self {
        Self {
            value: Cell::new(value),
            waiters: IntrCell::new(Vec::new()),
        }
    }

    /// The current count.
    pub fn value(&self) -> usize {
        self.value.get()
    }

    /// Decrements the count, blocking until it is positive.
    pub fn down(&self, kernel: &'static Kernel) {
        let intr = InterruptGuard::new(kernel.intr());
        while self.value.get() == 0 {
            let here = NonNull::from(self);
            thread::block_current(kernel, &intr, |waiter| {
                waiter.blocked_in.set(Some(here));
                self.waiters.borrow_mut(&intr).push(waiter);
            });
            // Rescheduled: the count may already have been re-taken.
        }
        self.value.set(self.value.get() - 1);
    }

    /// Attempts to decrement the count without blocking.
    pub fn try_down(&self, kernel: &Kernel) -> bool {
        let _intr = InterruptGuard::new(kernel.intr());
        if self.value.get() > 0 {
            self.value.set(self.value.get() - 1);
            true
        } else {
            false
        }
    }

    /// Increments the count and wakes one waiter, if any.
    ///
    /// Waking does not preempt the caller; the woken thread is inserted
    /// into the ready queue by effective priority and runs when the
    /// scheduler reaches it.
    pub fn up(&self, kernel: &'static Kernel) {
        let intr = InterruptGuard::new(kernel.intr());
        self.value.set(self.value.get() + 1);
        if let Some(waiter) = self.pop_waiter(kernel, &intr) {
            thread::unblock(kernel, &intr, waiter);
        }
    }

    /// Picks the waiter to wake: insertion order under FIFO scheduling,
    /// the highest effective priority otherwise.
    fn pop_waiter(&self, kernel: &Kernel, intr: &InterruptGuard<'_>) -> Option<Box<Thread>> {
        let mut waiters = self.waiters.borrow_mut(intr);
        if waiters.is_empty() {
            return None;
        }
        let idx = match kernel.policy() {
            SchedPolicy::Fifo => 0,
            _ => {
                let mut best = 0;
                for (i, w) in waiters.iter().enumerate() {
                    if w.priority() > waiters[best].priority() {
                        best = i;
                    }
                }
                best
            }
        };
        Some(waiters.remove(idx))
    }

    /// The highest effective priority among current waiters.
    pub(crate) fn max_waiter_priority(&self, intr: &InterruptGuard<'_>) -> Option<i32> {
        self.waiters
            .borrow_mut(intr)
            .iter()
            .map(|w| w.priority())
            .max()
    }

    /// Removes the waiter with thread id `tid` from the wait list, if it is
    /// blocked here. Used by process teardown to kill blocked peers.
    pub(crate) fn steal_waiter(
        &self,
        intr: &InterruptGuard<'_>,
        tid: Tid,
    ) -> Option<Box<Thread>> {
        let mut waiters = self.waiters.borrow_mut(intr);
        let idx = waiters.iter().position(|w| w.tid == tid)?;
        let waiter = waiters.remove(idx);
        waiter.blocked_in.set(None);
        Some(waiter)
    }

    /// Removes and returns every waiter. Used when the semaphore's owner is
    /// being torn down.
    pub(crate) fn take_waiters(&self, intr: &InterruptGuard<'_>) -> Vec<Box<Thread>> {
        let waiters = core::mem::take(&mut *self.waiters.borrow_mut(intr));
        for w in &waiters {
            w.blocked_in.set(None);
        }
        waiters
    }
}
