//! Sleeping lock with priority donation.

use super::Semaphore;
use crate::{
    interrupt::InterruptGuard,
    kernel::Kernel,
    thread::{Thread, Tid, scheduler},
};
use core::{cell::Cell, ptr::NonNull};

/// Donation follows at most this many links of blocked lock holders.
const DONATION_DEPTH: usize = 8;

/// A mutual-exclusion lock.
///
/// A lock is a binary semaphore with an owner. Only the holder may release
/// it, and a holder must not re-acquire it. Under the strict-priority
/// scheduling policy, a thread that blocks on a lock donates its effective
/// priority up the chain of holders, so a high-priority waiter is never
/// stuck behind a low-priority holder that cannot get the CPU; releasing
/// recomputes the holder's priority from what it still holds.
pub struct Lock {
    sema: Semaphore,
    holder: Cell<Option<NonNull<Thread>>>,
}

impl Lock {
    /// Creates an unheld lock.
    pub const fn new() -> Self {
        Self {
            sema: Semaphore::new(1),
            holder: Cell::new(None),
        }
    }

    /// The thread id of the current holder, if held.
    pub fn holder_tid(&self) -> Option<Tid> {
        self.holder.get().map(|h| unsafe { h.as_ref().tid })
    }

    /// Whether the calling thread holds this lock.
    pub fn held_by_current(&self, kernel: &Kernel) -> bool {
        self.holder_tid() == Some(kernel.current_tid())
    }

    /// Acquires the lock, blocking until it is available.
    ///
    /// # Panics
    /// Panics if the calling thread already holds the lock; kernel code
    /// never re-acquires, and the user-facing tables reject it before
    /// getting here.
    pub fn acquire(&self, kernel: &'static Kernel) {
        let intr = InterruptGuard::new(kernel.intr());
        let cur = kernel.current();
        assert!(
            !self.held_by_current(kernel),
            "lock re-acquired by its holder"
        );

        if self.holder.get().is_some() && kernel.policy().donates() {
            unsafe {
                cur.as_ref().waiting_on.set(Some(NonNull::from(self)));
                self.donate(kernel, &intr, cur.as_ref().priority());
            }
        }
        drop(intr);

        self.sema.down(kernel);

        let intr = InterruptGuard::new(kernel.intr());
        self.holder.set(Some(cur));
        unsafe {
            cur.as_ref().waiting_on.set(None);
            cur.as_ref().held_locks.borrow_mut().push(NonNull::from(self));
        }
        drop(intr);
    }

    /// Releases the lock and wakes the best waiter.
    ///
    /// Undoes any donation the departing holder received through this lock;
    /// if that leaves a ready thread with a higher effective priority than
    /// the caller, the caller yields.
    ///
    /// # Panics
    /// Panics if the calling thread does not hold the lock.
    pub fn release(&self, kernel: &'static Kernel) {
        let intr = InterruptGuard::new(kernel.intr());
        let cur = kernel.current();
        assert!(
            self.held_by_current(kernel),
            "lock released by a non-holder"
        );

        self.holder.set(None);
        unsafe {
            let me = NonNull::from(self);
            cur.as_ref()
                .held_locks
                .borrow_mut()
                .retain(|l| *l != me);
            if kernel.policy().donates() {
                refresh_priority(kernel, &intr, cur.as_ref());
            }
        }
        drop(intr);

        self.sema.up(kernel);
        scheduler::preempt_check(kernel);
    }

    /// Pushes the caller's effective priority up the chain of holders.
    fn donate(&self, kernel: &Kernel, intr: &InterruptGuard<'_>, donor: i32) {
        let mut lock: NonNull<Lock> = NonNull::from(self);
        for _ in 0..DONATION_DEPTH {
            let holder = match unsafe { lock.as_ref() }.holder.get() {
                Some(h) => h,
                None => break,
            };
            let holder = unsafe { holder.as_ref() };
            if holder.priority() >= donor {
                break;
            }
            holder.donate_priority(donor);
            scheduler::reposition_if_ready(kernel, intr, holder.tid);
            match holder.waiting_on.get() {
                Some(next) => lock = next,
                None => break,
            }
        }
    }

    /// The highest effective priority among threads blocked on this lock.
    pub(crate) fn max_waiter_priority(&self, intr: &InterruptGuard<'_>) -> Option<i32> {
        self.sema.max_waiter_priority(intr)
    }

    pub(crate) fn sema(&self) -> &Semaphore {
        &self.sema
    }
}

/// Recomputes `th`'s effective priority from its base priority and the
/// waiters of the locks it still holds.
pub(crate) fn refresh_priority(kernel: &Kernel, intr: &InterruptGuard<'_>, th: &Thread) {
    let mut priority = th.base_priority();
    for lock in th.held_locks.borrow().iter() {
        if let Some(p) = unsafe { lock.as_ref() }.max_waiter_priority(intr) {
            priority = priority.max(p);
        }
    }
    th.donate_priority_reset(priority);
    scheduler::reposition_if_ready(kernel, intr, th.tid);
}
