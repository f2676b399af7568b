//! Kernel-mediated synchronization objects for user code.
//!
//! User programs synchronize through kernel objects named by small integer
//! handles: the kernel assigns ids from per-process counters starting at
//! 1, writes the id into a user-supplied byte, and subsequent calls name
//! the object by that byte. The objects live in per-PCB tables and die
//! with the PCB; ids are never reused within a process.
//!
//! Failure cases surface as errors, never kills: an unknown id, acquiring
//! a lock already held by the caller, releasing a lock the caller does not
//! hold, or initializing a semaphore with a negative count.

use super::Process;
use crate::{
    KernelError,
    interrupt::InterruptGuard,
    kernel::Kernel,
    sync::{Lock, Semaphore},
    thread,
};
use alloc::boxed::Box;
use core::ptr::NonNull;

impl Process {
    /// Registers a new lock, returning its handle.
    pub fn lock_create(&self, kernel: &Kernel) -> Result<u8, KernelError> {
        let id = self.alloc_lock_id()?;
        let intr = InterruptGuard::new(kernel.intr());
        self.locks.borrow_mut(&intr).push((id, Box::new(Lock::new())));
        Ok(id)
    }

    /// Acquires lock `id`, blocking until it is available.
    pub fn lock_acquire(&self, kernel: &'static Kernel, id: u8) -> Result<usize, KernelError> {
        let lock = self.find_lock(kernel, id)?;
        let lock = unsafe { lock.as_ref() };
        if lock.held_by_current(kernel) {
            return Err(KernelError::Busy);
        }
        lock.acquire(kernel);
        Ok(1)
    }

    /// Releases lock `id`; only its holder may.
    pub fn lock_release(&self, kernel: &'static Kernel, id: u8) -> Result<usize, KernelError> {
        let lock = self.find_lock(kernel, id)?;
        let lock = unsafe { lock.as_ref() };
        if !lock.held_by_current(kernel) {
            return Err(KernelError::OperationNotPermitted);
        }
        lock.release(kernel);
        Ok(1)
    }

    /// Registers a new semaphore with initial count `value`, returning its
    /// handle. A negative count is rejected.
    pub fn sema_create(&self, kernel: &Kernel, value: i32) -> Result<u8, KernelError> {
        if value < 0 {
            return Err(KernelError::InvalidArgument);
        }
        let id = self.alloc_sema_id()?;
        let intr = InterruptGuard::new(kernel.intr());
        self.semas
            .borrow_mut(&intr)
            .push((id, Box::new(Semaphore::new(value as usize))));
        Ok(id)
    }

    /// Ups semaphore `id`.
    pub fn sema_up(&self, kernel: &'static Kernel, id: u8) -> Result<usize, KernelError> {
        let sema = self.find_sema(kernel, id)?;
        unsafe { sema.as_ref() }.up(kernel);
        Ok(1)
    }

    /// Downs semaphore `id`, blocking while its count is zero.
    pub fn sema_down(&self, kernel: &'static Kernel, id: u8) -> Result<usize, KernelError> {
        let sema = self.find_sema(kernel, id)?;
        unsafe { sema.as_ref() }.down(kernel);
        Ok(1)
    }

    /// Looks up lock `id`. The pointer stays valid until process teardown;
    /// the boxed object never moves.
    fn find_lock(&self, kernel: &Kernel, id: u8) -> Result<NonNull<Lock>, KernelError> {
        let intr = InterruptGuard::new(kernel.intr());
        let locks = self.locks.borrow_mut(&intr);
        locks
            .iter()
            .find(|(i, _)| *i == id)
            .map(|(_, l)| NonNull::from(&**l))
            .ok_or(KernelError::NoSuchEntry)
    }

    /// Looks up semaphore `id`.
    fn find_sema(&self, kernel: &Kernel, id: u8) -> Result<NonNull<Semaphore>, KernelError> {
        let intr = InterruptGuard::new(kernel.intr());
        let semas = self.semas.borrow_mut(&intr);
        semas
            .iter()
            .find(|(i, _)| *i == id)
            .map(|(_, s)| NonNull::from(&**s))
            .ok_or(KernelError::NoSuchEntry)
    }
}

/// Destroys every user sync object of `process`. A peer still blocked on
/// one of them is extracted from its wait list and reclaimed; its join
/// record is signaled by the caller's roster sweep afterwards.
pub(crate) fn destroy_sync_objects(kernel: &'static Kernel, process: &Process) {
    let intr = InterruptGuard::new(kernel.intr());
    let locks = core::mem::take(&mut *process.locks.borrow_mut(&intr));
    for (_, lock) in locks {
        if let Some(holder) = lock.holder_tid() {
            let me = NonNull::from(&*lock);
            thread::with_thread(kernel, holder, |th| {
                th.held_locks.borrow_mut().retain(|l| *l != me);
            });
        }
        for waiter in lock.sema().take_waiters(&intr) {
            kernel
                .all
                .borrow_mut(&intr)
                .retain(|(t, _)| *t != waiter.tid);
            super::reap(waiter);
        }
    }
    let semas = core::mem::take(&mut *process.semas.borrow_mut(&intr));
    for (_, sema) in semas {
        for waiter in sema.take_waiters(&intr) {
            kernel
                .all
                .borrow_mut(&intr)
                .retain(|(t, _)| *t != waiter.tid);
            super::reap(waiter);
        }
    }
}
