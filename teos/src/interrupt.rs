//! Interrupt control.
//!
//! On a single CPU, disabling interrupts is the kernel's coarsest mutual
//! exclusion primitive: while interrupts are off nothing can preempt the
//! running thread, so a short critical section over shared scheduler state
//! is safe. The kernel exposes this as an RAII guard: creating an
//! [`InterruptGuard`] disables interrupts, dropping it restores the state
//! that was in effect before, so every exit path of a critical section
//! (including error returns) restores interrupts correctly.
//!
//! Data that must only be touched with interrupts disabled is wrapped in an
//! [`IntrCell`], whose accessors demand a live guard. The ready queue, the
//! all-threads list, the join-record table and the sleep queue all live in
//! such cells.

use core::cell::{Cell, RefCell, RefMut};

/// Enumeration representing the interrupt state.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InterruptState {
    /// Interrupts are enabled.
    On,
    /// Interrupts are disabled.
    Off,
}

/// The interrupt flag of the (single) CPU.
///
/// The kernel carries one of these in its context value. The flag starts
/// [`Off`] during boot and is switched on once the scheduler is ready.
///
/// [`Off`]: InterruptState::Off
pub struct IntrController {
    level: Cell<InterruptState>,
}

impl IntrController {
    pub(crate) const fn new() -> Self {
        Self {
            level: Cell::new(InterruptState::Off),
        }
    }

    /// Reads the current interrupt state.
    #[inline]
    pub fn current(&self) -> InterruptState {
        self.level.get()
    }

    /// Sets the interrupt state, returning the previous one.
    #[inline]
    pub(crate) fn set(&self, state: InterruptState) -> InterruptState {
        self.level.replace(state)
    }
}

/// An RAII guard for a critical section with interrupts disabled.
///
/// Creating the guard disables interrupts; dropping it restores the state
/// that was saved at creation. Guards nest: they must be dropped in reverse
/// order of creation, which Rust's scoping rules uphold unless a guard is
/// stored away.
pub struct InterruptGuard<'a> {
    ctl: &'a IntrController,
    prev: InterruptState,
}

impl<'a> InterruptGuard<'a> {
    /// Disables interrupts and returns the guard that will restore the
    /// previous state on drop.
    pub fn new(ctl: &'a IntrController) -> Self {
        let prev = ctl.set(InterruptState::Off);
        Self { ctl, prev }
    }
}

impl Drop for InterruptGuard<'_> {
    fn drop(&mut self) {
        self.ctl.set(self.prev);
    }
}

/// A cell whose contents are only accessible while interrupts are off.
///
/// `IntrCell` is the data side of the interrupt-disable discipline: the
/// borrow methods take a reference to a live [`InterruptGuard`], so the
/// type system ties every access to a critical section. The borrow itself
/// is dynamically checked; overlapping mutable borrows are a kernel bug and
/// panic.
pub struct IntrCell<T> {
    inner: RefCell<T>,
}

impl<T> IntrCell<T> {
    /// Creates a new cell holding `value`.
    pub const fn new(value: T) -> Self {
        Self {
            inner: RefCell::new(value),
        }
    }

    /// Mutably borrows the contents for the duration of the critical
    /// section witnessed by `_intr`.
    #[track_caller]
    pub fn borrow_mut<'a>(&'a self, _intr: &'a InterruptGuard<'_>) -> RefMut<'a, T> {
        self.inner.borrow_mut()
    }

    /// Runs `f` on the contents under the critical section witnessed by
    /// `_intr`.
    #[track_caller]
    pub fn with<'a, R>(&'a self, _intr: &'a InterruptGuard<'_>, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.inner.borrow_mut())
    }
}
