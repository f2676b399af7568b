//! Kernel threads.
//!
//! A thread is a kernel stack plus a descriptor pinned on the heap. The
//! descriptor records identity, scheduling state, priorities and the
//! bookkeeping the scheduler and the synchronization primitives need; the
//! stack carries the thread's execution. Context switching swaps stacks
//! under the descriptor (see [`arch`]), and thread ownership follows the
//! switch: the running thread's `Box` is leaked while it executes, a
//! blocked thread's `Box` lives in the wait list it blocked on, a ready
//! thread's `Box` lives in the ready queue, and a dying thread's `Box` is
//! reassembled and dropped by the *next* thread, after the switch away from
//! the dying stack has completed.
//!
//! Threads are created with a [`ThreadBuilder`]:
//!
//! ```ignore
//! let tid = ThreadBuilder::new("worker").priority(40).spawn(kernel, move || {
//!     // thread body
//! })?;
//! ```
//!
//! A thread whose body returns exits with code 0. Exactly one thread is
//! `Running` at any time; every state transition happens with interrupts
//! disabled.
//!
//! [`arch`]: crate::arch

pub mod fixed;
pub mod scheduler;

use crate::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
    arch::{self, ContextSwitchFrame},
    interrupt::{InterruptGuard, InterruptState},
    kernel::Kernel,
    process::Process,
    sync::{Lock, Semaphore},
};
use alloc::{boxed::Box, string::String, sync::Arc, vec};
use core::{
    cell::{Cell, RefCell},
    ptr::NonNull,
};
use fixed::Fixed;
use scheduler::SchedPolicy;

/// A thread identifier.
pub type Tid = i32;

/// Identifier returned when thread creation fails.
pub const TID_ERROR: Tid = -1;

/// Lowest thread priority.
pub const PRI_MIN: i32 = 0;
/// Default thread priority.
pub const PRI_DEFAULT: i32 = 31;
/// Highest thread priority.
pub const PRI_MAX: i32 = 63;

/// Size of each thread's kernel stack, in bytes.
pub const STACK_SIZE: usize = 0x20000;

/// Magic value guarding the low end of every kernel stack.
pub(crate) const THREAD_MAGIC: usize = 0xdead_beef_cafe_f00d;

/// A possible state of a thread.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ThreadState {
    /// Currently on the CPU.
    Running,
    /// In the ready queue, waiting for the CPU.
    Ready,
    /// Parked in some wait list; not schedulable.
    Blocked,
    /// Exited; the stack is reclaimed after the switch away completes.
    Dying,
}

/// A thread descriptor.
///
/// The saved stack pointer **must stay the first field**: the context
/// switch trampoline receives the address of this slot and uses it as the
/// address of the whole descriptor.
#[repr(C)]
pub struct Thread {
    pub(crate) sp: usize,
    pub(crate) magic: usize,
    /// Unique thread id.
    pub tid: Tid,
    /// Display name.
    pub name: String,
    pub(crate) kernel: &'static Kernel,
    pub(crate) state: Cell<ThreadState>,
    pub(crate) is_idle: bool,
    base_priority: Cell<i32>,
    priority: Cell<i32>,
    nice: Cell<i32>,
    pub(crate) recent_cpu: Cell<Fixed>,
    pub(crate) sleep_ticks: Cell<i64>,
    /// The lock this thread is blocked on, if any (donation bookkeeping).
    pub(crate) waiting_on: Cell<Option<NonNull<Lock>>>,
    /// Locks currently held by this thread.
    pub(crate) held_locks: RefCell<alloc::vec::Vec<NonNull<Lock>>>,
    /// The semaphore whose wait list currently owns this thread.
    pub(crate) blocked_in: Cell<Option<NonNull<Semaphore>>>,
    /// The process this thread belongs to, if it is a user thread.
    pub(crate) process: RefCell<Option<Arc<Process>>>,
    /// Base of this thread's user stack, for secondary user threads.
    pub(crate) ustack: Cell<Option<Va>>,
    stack: Box<[u8]>,
}

impl Thread {
    fn new(
        kernel: &'static Kernel,
        name: &str,
        priority: i32,
        is_idle: bool,
        with_stack: bool,
    ) -> Result<Box<Self>, KernelError> {
        let stack = if with_stack {
            if !kernel.charge_pages(STACK_SIZE / PAGE_SIZE) {
                return Err(KernelError::NoMemory);
            }
            let mut stack = vec![0u8; STACK_SIZE].into_boxed_slice();
            stack[..8].copy_from_slice(&THREAD_MAGIC.to_ne_bytes());
            stack
        } else {
            Box::default()
        };
        // Inherit the fair-scheduler state of the creator, if any.
        let (nice, recent_cpu) = kernel
            .try_with_current(|c| (c.nice.get(), c.recent_cpu.get()))
            .unwrap_or((0, Fixed::ZERO));
        Ok(Box::new(Self {
            sp: 0,
            magic: THREAD_MAGIC,
            tid: kernel.alloc_tid(),
            name: String::from(name),
            kernel,
            state: Cell::new(ThreadState::Blocked),
            is_idle,
            base_priority: Cell::new(priority),
            priority: Cell::new(priority),
            nice: Cell::new(nice),
            recent_cpu: Cell::new(recent_cpu),
            sleep_ticks: Cell::new(0),
            waiting_on: Cell::new(None),
            held_locks: RefCell::new(alloc::vec::Vec::new()),
            blocked_in: Cell::new(None),
            process: RefCell::new(None),
            ustack: Cell::new(None),
            stack,
        }))
    }

    /// The thread's effective priority.
    pub fn priority(&self) -> i32 {
        self.priority.get()
    }

    /// The thread's base priority, before donation.
    pub fn base_priority(&self) -> i32 {
        self.base_priority.get()
    }

    /// The thread's nice value.
    pub fn nice(&self) -> i32 {
        self.nice.get()
    }

    /// The thread's recent-CPU estimate.
    pub fn recent_cpu(&self) -> Fixed {
        self.recent_cpu.get()
    }

    /// The thread's scheduling state.
    pub fn state(&self) -> ThreadState {
        self.state.get()
    }

    /// Raises the effective priority to `p` if it is higher.
    pub(crate) fn donate_priority(&self, p: i32) {
        if p > self.priority.get() {
            self.priority.set(p);
        }
    }

    /// Sets the effective priority to exactly `p`.
    pub(crate) fn donate_priority_reset(&self, p: i32) {
        self.priority.set(p);
    }

    pub(crate) fn set_base_priority(&self, p: i32) {
        self.base_priority.set(p);
    }

    pub(crate) fn set_nice_raw(&self, n: i32) {
        self.nice.set(n);
    }

    pub(crate) fn set_priority_both(&self, p: i32) {
        self.base_priority.set(p);
        self.priority.set(p);
    }

    pub(crate) fn stack_ok(&self) -> bool {
        self.magic == THREAD_MAGIC
            && (self.stack.is_empty()
                || self.stack[..8] == THREAD_MAGIC.to_ne_bytes())
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        debug_assert!(self.held_locks.borrow().is_empty());
        if !self.stack.is_empty() {
            self.kernel.refund_pages(STACK_SIZE / PAGE_SIZE);
        }
    }
}

/// A builder for kernel threads.
pub struct ThreadBuilder {
    name: String,
    priority: i32,
    nice: Option<i32>,
}

impl ThreadBuilder {
    /// Creates a builder for a thread named `name`, at default priority.
    pub fn new(name: &str) -> Self {
        Self {
            name: String::from(name),
            priority: PRI_DEFAULT,
            nice: None,
        }
    }

    /// Sets the thread's priority.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority.clamp(PRI_MIN, PRI_MAX);
        self
    }

    /// Sets the thread's nice value.
    pub fn nice(mut self, nice: i32) -> Self {
        self.nice = Some(nice.clamp(-20, 20));
        self
    }

    /// Creates the thread without making it runnable.
    ///
    /// The returned handle exposes the new thread's id before it can
    /// possibly run, which creators use to register rendezvous state the
    /// thread will look up; [`ParkedThread::unpark`] then makes it ready.
    pub fn spawn_parked<F: FnOnce() + 'static>(
        self,
        kernel: &'static Kernel,
        f: F,
    ) -> Result<ParkedThread, KernelError> {
        let mut th = Thread::new(kernel, &self.name, self.priority, false, true)?;
        if let Some(nice) = self.nice {
            th.nice.set(nice);
        }
        if let SchedPolicy::Fair { nice_enabled } = kernel.policy() {
            th.set_priority_both(scheduler::fair_priority(
                th.recent_cpu.get(),
                th.nice.get(),
                nice_enabled,
            ));
        }
        let wrapper = move || {
            kernel.intr().set(InterruptState::On);
            f();
            exit(kernel);
        };
        build_initial_frame(&mut th, wrapper);

        let intr = InterruptGuard::new(kernel.intr());
        kernel
            .all
            .borrow_mut(&intr)
            .push((th.tid, NonNull::from(&*th)));
        Ok(ParkedThread { th: Some(th) })
    }

    /// Creates the thread and makes it ready to run.
    ///
    /// If the new thread's effective priority is strictly higher than the
    /// caller's, the caller yields to it immediately.
    pub fn spawn<F: FnOnce() + 'static>(
        self,
        kernel: &'static Kernel,
        f: F,
    ) -> Result<Tid, KernelError> {
        let parked = self.spawn_parked(kernel, f)?;
        Ok(parked.unpark(kernel))
    }
}

/// A created but not yet runnable thread.
///
/// Dropping the handle without unparking destroys the thread before it
/// ever ran.
pub struct ParkedThread {
    th: Option<Box<Thread>>,
}

impl ParkedThread {
    /// The new thread's id.
    pub fn tid(&self) -> Tid {
        self.th.as_ref().expect("thread already unparked").tid
    }

    /// Makes the thread ready; the caller yields if the newcomer has
    /// strictly higher effective priority.
    pub fn unpark(mut self, kernel: &'static Kernel) -> Tid {
        let th = self.th.take().expect("thread already unparked");
        let tid = th.tid;
        {
            let intr = InterruptGuard::new(kernel.intr());
            th.state.set(ThreadState::Ready);
            scheduler::insert_ready(kernel, &intr, th);
        }
        scheduler::preempt_check(kernel);
        tid
    }
}

impl Drop for ParkedThread {
    fn drop(&mut self) {
        if let Some(th) = self.th.take() {
            let intr = InterruptGuard::new(th.kernel.intr());
            th.kernel.all.borrow_mut(&intr).retain(|(t, _)| *t != th.tid);
            // The boxed closure on its never-run stack leaks with the
            // frame; only the descriptor and stack are reclaimed.
            drop(intr);
            drop(th);
        }
    }
}

/// Lays down the three nested frames a newborn stack starts with: the
/// callee-saved registers, the return into the entry thunk, and the boxed
/// closure the thunk hands to [`thread_start`].
fn build_initial_frame<W: FnOnce() + 'static>(th: &mut Thread, wrapper: W) {
    let top = (th.stack.as_ptr() as usize + th.stack.len()) & !0xf;
    let frame = (top - core::mem::size_of::<ContextSwitchFrame>()) as *mut ContextSwitchFrame;
    unsafe {
        frame.write(ContextSwitchFrame {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            rbx: 0,
            rbp: 0,
            ret_addr: arch::thread_entry::<W> as usize,
            thread_fn: Box::into_raw(Box::new(wrapper)) as usize,
            end_of_stack: 0,
        });
    }
    th.sp = frame as usize;
}

/// First Rust code of a new thread: reclaim the boxed closure and run it.
/// The closure wrapper never returns; it ends in [`exit`].
pub(crate) unsafe extern "C" fn thread_start<F: FnOnce()>(f: *mut F) {
    let f = unsafe { Box::from_raw(f) };
    f();
    unreachable!("thread closure returned without exiting");
}

/// Completes a context switch on the incoming thread's stack.
///
/// `prev` is the outgoing thread; its fate depends on the state it was left
/// in. A dying predecessor is dropped *here*, which is the only place its
/// kernel stack is guaranteed to no longer be in use.
pub(crate) unsafe extern "C" fn finish_context_switch(prev: *mut Thread) {
    let prev_ref = unsafe { &*prev };
    let kernel = prev_ref.kernel;
    debug_assert_eq!(kernel.intr().current(), InterruptState::Off);
    debug_assert!(prev_ref.stack_ok(), "kernel stack clobbered: {}", prev_ref.name);

    let intr = InterruptGuard::new(kernel.intr());
    match prev_ref.state.get() {
        ThreadState::Dying => {
            let boxed = unsafe { Box::from_raw(prev) };
            drop(boxed);
        }
        ThreadState::Blocked => {
            // Owned by whatever wait list it was pushed on (or the idle
            // thread, which is never owned by a queue).
        }
        ThreadState::Running if prev_ref.is_idle => {
            prev_ref.state.set(ThreadState::Blocked);
        }
        ThreadState::Running => {
            prev_ref.state.set(ThreadState::Ready);
            let boxed = unsafe { Box::from_raw(prev) };
            scheduler::insert_ready(kernel, &intr, boxed);
        }
        ThreadState::Ready => unreachable!("switched away from a queued thread"),
    }
    kernel.reset_time_slice();
    drop(intr);
}

/// Transitions the running thread to `Blocked` and hands its ownership to
/// `stash`, then reschedules. Returns when the thread is next unblocked
/// and scheduled.
///
/// The caller must hold interrupts disabled, witnessed by `intr`.
pub(crate) fn block_current(
    kernel: &'static Kernel,
    intr: &InterruptGuard<'_>,
    stash: impl FnOnce(Box<Thread>),
) {
    let cur = kernel.current();
    unsafe {
        cur.as_ref().state.set(ThreadState::Blocked);
        stash(Box::from_raw(cur.as_ptr()));
    }
    scheduler::schedule(kernel, intr);
}

/// Transitions a blocked thread to `Ready` and inserts it into the ready
/// queue by effective priority. Does not preempt the caller.
pub(crate) fn unblock(kernel: &Kernel, intr: &InterruptGuard<'_>, th: Box<Thread>) {
    debug_assert_eq!(th.state.get(), ThreadState::Blocked);
    th.state.set(ThreadState::Ready);
    th.blocked_in.set(None);
    scheduler::insert_ready(kernel, intr, th);
}

/// Yields the CPU if another thread of equal or higher effective priority
/// is ready. A no-op before scheduling has started.
pub fn yield_now(kernel: &'static Kernel) {
    if !kernel.scheduling_started() {
        return;
    }
    let intr = InterruptGuard::new(kernel.intr());
    let go = {
        let ready = kernel.ready.borrow_mut(&intr);
        match kernel.policy() {
            SchedPolicy::Fifo => !ready.is_empty(),
            _ => match ready.front() {
                Some(front) => front.priority() >= kernel.with_current(|c| c.priority()),
                None => false,
            },
        }
    };
    if go {
        scheduler::schedule(kernel, &intr);
    }
}

/// Exits the current thread. Never returns.
///
/// The thread is removed from the all-threads list and marked `Dying`; the
/// next thread to run frees its kernel stack.
pub fn exit(kernel: &'static Kernel) -> ! {
    let intr = InterruptGuard::new(kernel.intr());
    let cur = kernel.current();
    let tid = unsafe { cur.as_ref().tid };
    kernel.all.borrow_mut(&intr).retain(|(t, _)| *t != tid);
    unsafe {
        debug_assert!(cur.as_ref().held_locks.borrow().is_empty());
        cur.as_ref().state.set(ThreadState::Dying);
    }
    scheduler::schedule(kernel, &intr);
    unreachable!("scheduled a dying thread");
}

/// Puts the current thread to sleep for `ticks` timer ticks.
///
/// The countdown is driven by [`Kernel::timer_tick`]; with `ticks <= 0`
/// this is just a yield.
///
/// [`Kernel::timer_tick`]: crate::kernel::Kernel::timer_tick
pub fn sleep(kernel: &'static Kernel, ticks: i64) {
    if ticks <= 0 {
        yield_now(kernel);
        return;
    }
    let intr = InterruptGuard::new(kernel.intr());
    kernel.with_current(|c| c.sleep_ticks.set(ticks));
    block_current(kernel, &intr, |th| {
        kernel.sleepers.borrow_mut(&intr).push(th);
    });
}

/// Applies `f` to every live thread, with interrupts disabled.
///
/// `f` must not create, destroy or block threads.
pub fn foreach(kernel: &Kernel, mut f: impl FnMut(&Thread)) {
    let intr = InterruptGuard::new(kernel.intr());
    let all = kernel.all.borrow_mut(&intr);
    for (_, th) in all.iter() {
        f(unsafe { th.as_ref() });
    }
}

/// Looks up a live thread by id and applies `f` to it.
pub fn with_thread<R>(kernel: &Kernel, tid: Tid, f: impl FnOnce(&Thread) -> R) -> Option<R> {
    let intr = InterruptGuard::new(kernel.intr());
    let all = kernel.all.borrow_mut(&intr);
    all.iter()
        .find(|(t, _)| *t == tid)
        .map(|(_, th)| f(unsafe { th.as_ref() }))
}

/// Sets the current thread's base priority and recomputes its effective
/// priority; yields if it is no longer the highest. Ignored under the fair
/// policy, where priorities come from the estimator.
pub fn set_priority(kernel: &'static Kernel, priority: i32) {
    let priority = priority.clamp(PRI_MIN, PRI_MAX);
    match kernel.policy() {
        SchedPolicy::Fair { .. } | SchedPolicy::Mlfqs => return,
        SchedPolicy::Fifo => {
            kernel.with_current(|c| c.set_priority_both(priority));
            return;
        }
        SchedPolicy::Prio => {}
    }
    {
        let intr = InterruptGuard::new(kernel.intr());
        kernel.with_current(|c| {
            c.set_base_priority(priority);
            crate::sync::refresh_thread_priority(kernel, &intr, c);
        });
    }
    scheduler::preempt_check(kernel);
}

/// The current thread's effective priority.
pub fn get_priority(kernel: &Kernel) -> i32 {
    kernel.with_current(|c| c.priority())
}

/// Sets the current thread's nice value; under the fair policy the
/// thread's priority is recomputed immediately and the CPU is yielded if
/// it is no longer the highest.
pub fn set_nice(kernel: &'static Kernel, nice: i32) {
    let nice = nice.clamp(-20, 20);
    kernel.with_current(|c| c.set_nice_raw(nice));
    if let SchedPolicy::Fair { nice_enabled } = kernel.policy() {
        kernel.with_current(|c| {
            c.set_priority_both(scheduler::fair_priority(
                c.recent_cpu.get(),
                nice,
                nice_enabled,
            ));
        });
        scheduler::preempt_check(kernel);
    }
}

/// The current thread's nice value.
pub fn get_nice(kernel: &Kernel) -> i32 {
    kernel.with_current(|c| c.nice())
}

/// The current thread's recent-CPU estimate, rounded.
pub fn get_recent_cpu(kernel: &Kernel) -> i32 {
    kernel.with_current(|c| c.recent_cpu().round())
}

pub(crate) fn init_bootstrap(kernel: &'static Kernel) {
    // The boot stack becomes the first thread.
    let main = Thread::new(kernel, "main", PRI_DEFAULT, false, false)
        .expect("bootstrap thread allocation cannot fail");
    main.state.set(ThreadState::Running);
    let main_ptr = NonNull::from(&*Box::leak(main));
    {
        let intr = InterruptGuard::new(kernel.intr());
        kernel
            .all
            .borrow_mut(&intr)
            .push((unsafe { main_ptr.as_ref().tid }, main_ptr));
    }
    kernel.set_current(main_ptr);

    // The idle thread runs whenever nothing else is ready. It parks itself
    // as soon as real work shows up.
    let mut idle = Thread::new(kernel, "idle", PRI_MIN, true, true)
        .expect("idle thread allocation cannot fail");
    build_initial_frame(&mut idle, move || {
        kernel.intr().set(InterruptState::On);
        scheduler::idle_loop(kernel)
    });
    let idle_ptr = NonNull::from(&*Box::leak(idle));
    {
        let intr = InterruptGuard::new(kernel.intr());
        kernel
            .all
            .borrow_mut(&intr)
            .push((unsafe { idle_ptr.as_ref().tid }, idle_ptr));
    }
    kernel.set_idle(idle_ptr);
}
