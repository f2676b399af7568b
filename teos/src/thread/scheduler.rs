//! Thread scheduling.
//!
//! The scheduling policy is chosen once at boot and dispatched with a
//! `match`: a policy is data, not a trait object. All policies share one
//! ready queue, kept insertion-ordered by effective priority (descending;
//! ties keep insertion order, so equal-priority threads round-robin):
//!
//! - **FIFO** ignores priorities: enqueue at the tail, pop the head.
//! - **PRIO** is strict priority with donation through locks.
//! - **FAIR** uses the same queue discipline as PRIO but recomputes every
//!   thread's priority from a fixed-point estimator: `recent_cpu` grows by
//!   one per tick for the running thread and decays once per second by
//!   `(2·load_avg)/(2·load_avg + 1)`; `load_avg` is an exponentially
//!   smoothed count of ready threads; priorities are
//!   `PRI_MAX − recent_cpu/4 − nice`, clamped, recomputed every fourth
//!   tick.
//! - **MLFQS** is reserved; asking it to schedule is a fatal kernel error.
//!
//! The timer drives preemption: a thread that exhausts its time slice
//! ([`TIME_SLICE`] ticks) is preempted on return from the tick. When no
//! thread is ready, the idle thread runs and asks the platform for the
//! next event.

use super::{PRI_MAX, PRI_MIN, Thread, ThreadState, Tid, fixed::Fixed};
use crate::{arch, interrupt::InterruptGuard, kernel::Kernel};
use alloc::boxed::Box;
use alloc::vec::Vec;

/// Scheduler time slice, in timer ticks.
pub const TIME_SLICE: i64 = 4;

/// Timer ticks per second; the fair estimator's one-second cadence.
pub const TICKS_PER_SEC: u64 = 100;

/// How often (in ticks) the fair policy recomputes every priority.
const PRIORITY_RECALC_TICKS: u64 = 4;

/// The scheduling policy, fixed at boot.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SchedPolicy {
    /// First-in-first-out, no priorities.
    Fifo,
    /// Strict priority with donation.
    Prio,
    /// Fair scheduling from the recent-CPU/load-average estimator. The
    /// flag selects whether `nice` participates in the priority formula.
    Fair {
        /// Whether nice values shift computed priorities.
        nice_enabled: bool,
    },
    /// Reserved. Selecting it boots, scheduling with it panics.
    Mlfqs,
}

impl SchedPolicy {
    /// Parses a `-sched=` kernel command line selector.
    pub fn from_cmdline(cmdline: &str) -> Option<Self> {
        let arg = cmdline
            .split_whitespace()
            .find_map(|w| w.strip_prefix("-sched="))?;
        match arg {
            "fifo" => Some(Self::Fifo),
            "prio" => Some(Self::Prio),
            "fair" => Some(Self::Fair { nice_enabled: true }),
            "mlfqs" => Some(Self::Mlfqs),
            _ => None,
        }
    }

    /// Whether this policy performs priority donation.
    pub fn donates(&self) -> bool {
        matches!(self, Self::Prio)
    }
}

/// Inserts a ready thread into the ready queue per the boot policy:
/// at the tail under FIFO, ordered by effective priority (after its
/// equals) otherwise.
pub(crate) fn insert_ready(kernel: &Kernel, intr: &InterruptGuard<'_>, th: Box<Thread>) {
    debug_assert_eq!(th.state.get(), ThreadState::Ready);
    let mut ready = kernel.ready.borrow_mut(intr);
    match kernel.policy() {
        SchedPolicy::Fifo => ready.push_back(th),
        SchedPolicy::Prio | SchedPolicy::Fair { .. } => {
            let p = th.priority();
            let idx = ready
                .iter()
                .position(|t| t.priority() < p)
                .unwrap_or(ready.len());
            ready.insert(idx, th);
        }
        SchedPolicy::Mlfqs => panic!("mlfqs scheduling is not implemented"),
    }
}

/// Re-sorts a ready thread whose effective priority changed.
pub(crate) fn reposition_if_ready(kernel: &Kernel, intr: &InterruptGuard<'_>, tid: Tid) {
    if kernel.policy() == SchedPolicy::Fifo {
        return;
    }
    let th = {
        let mut ready = kernel.ready.borrow_mut(intr);
        let idx = ready.iter().position(|t| t.tid == tid);
        idx.and_then(|idx| ready.remove(idx))
    };
    if let Some(th) = th {
        insert_ready(kernel, intr, th);
    }
}

/// Yields if a ready thread now has strictly higher effective priority
/// than the caller.
pub(crate) fn preempt_check(kernel: &'static Kernel) {
    if !kernel.scheduling_started() || kernel.policy() == SchedPolicy::Fifo {
        return;
    }
    let intr = InterruptGuard::new(kernel.intr());
    let should = {
        let ready = kernel.ready.borrow_mut(&intr);
        match ready.front() {
            Some(front) => front.priority() > kernel.with_current(|c| c.priority()),
            None => false,
        }
    };
    if should {
        schedule(kernel, &intr);
    }
}

/// Switches to the next thread to run.
///
/// Called with interrupts disabled (witnessed by `intr`) and the current
/// thread's state already set to its post-switch value: `Running` to be
/// requeued, `Blocked` if parked somewhere, `Dying` to be reclaimed. If no
/// thread is ready, the idle thread runs. Returns when the calling thread
/// is next scheduled.
pub(crate) fn schedule(kernel: &'static Kernel, intr: &InterruptGuard<'_>) {
    let prev = kernel.current().as_ptr();
    let next: *mut Thread = {
        let mut ready = kernel.ready.borrow_mut(intr);
        match ready.pop_front() {
            Some(next) => Box::into_raw(next),
            None => kernel.idle_thread().as_ptr(),
        }
    };
    if core::ptr::eq(next, prev) {
        unsafe { (*prev).state.set(ThreadState::Running) };
        return;
    }
    unsafe {
        debug_assert!((*next).stack_ok());
        (*next).state.set(ThreadState::Running);
        kernel.set_current(core::ptr::NonNull::new_unchecked(next));
        let next_sp = (*next).sp;
        arch::context_switch(&mut (*prev).sp, next_sp);
    }
    // Back on this stack: finish_context_switch already ran on our behalf.
}

/// Body of the idle thread.
///
/// Parks itself the moment real work is ready; otherwise hands control to
/// the platform's idle hook, whose job is to deliver the next event
/// (typically a timer tick). A kernel with no idle hook and nothing to run
/// is deadlocked, which is fatal.
pub(crate) fn idle_loop(kernel: &'static Kernel) -> ! {
    loop {
        let intr = InterruptGuard::new(kernel.intr());
        let has_ready = !kernel.ready.borrow_mut(&intr).is_empty();
        if has_ready {
            kernel.with_current(|c| c.state.set(ThreadState::Blocked));
            schedule(kernel, &intr);
            drop(intr);
        } else {
            drop(intr);
            match kernel.on_idle_hook() {
                Some(hook) => hook(kernel),
                None => panic!("idle: no runnable threads and no timer source"),
            }
        }
    }
}

/// One timer tick, in interrupt context: statistics, sleeper wakeup, the
/// fair estimator, and time-slice accounting. Returns whether the running
/// thread should be preempted on return from the interrupt.
pub(crate) fn on_tick(kernel: &'static Kernel) -> bool {
    let intr = InterruptGuard::new(kernel.intr());
    let ticks = kernel.bump_ticks();
    let cur_is_idle = kernel.with_current(|c| c.is_idle);

    // Wake sleepers whose countdown ran out.
    let woken: Vec<Box<Thread>> = {
        let mut sleepers = kernel.sleepers.borrow_mut(&intr);
        let mut woken = Vec::new();
        let mut i = 0;
        while i < sleepers.len() {
            let left = sleepers[i].sleep_ticks.get() - 1;
            sleepers[i].sleep_ticks.set(left);
            if left <= 0 {
                woken.push(sleepers.remove(i));
            } else {
                i += 1;
            }
        }
        woken
    };
    for th in woken {
        super::unblock(kernel, &intr, th);
    }

    let mut preempt = false;
    if let SchedPolicy::Fair { nice_enabled } = kernel.policy() {
        if !cur_is_idle {
            kernel.with_current(|c| c.recent_cpu.set(c.recent_cpu.get().add_int(1)));
        }
        if ticks % TICKS_PER_SEC == 0 {
            update_fair_second(kernel, &intr, cur_is_idle);
        }
        if ticks % PRIORITY_RECALC_TICKS == 0 {
            update_fair_priorities(kernel, &intr, nice_enabled);
            let ready = kernel.ready.borrow_mut(&intr);
            if let Some(front) = ready.front() {
                if front.priority() > kernel.with_current(|c| c.priority()) {
                    preempt = true;
                }
            }
        }
    }

    if !cur_is_idle && kernel.tick_time_slice() {
        preempt = true;
    }
    preempt
}

/// The fair policy's priority formula, truncated and clamped.
pub(crate) fn fair_priority(recent_cpu: Fixed, nice: i32, nice_enabled: bool) -> i32 {
    let nice = if nice_enabled { nice } else { 0 };
    (PRI_MAX - recent_cpu.div_int(4).trunc() - nice).clamp(PRI_MIN, PRI_MAX)
}

/// Once-per-second estimator update: smooth `load_avg` over the ready
/// count and decay every thread's `recent_cpu`.
fn update_fair_second(kernel: &Kernel, intr: &InterruptGuard<'_>, cur_is_idle: bool) {
    let ready_count =
        kernel.ready.borrow_mut(intr).len() as i32 + if cur_is_idle { 0 } else { 1 };
    let load_avg = kernel.load_average().mul_int(59).div_int(60)
        + Fixed::from_int(ready_count).div_int(60);
    kernel.set_load_avg(load_avg);

    let twice = load_avg.mul_int(2);
    let decay = twice / twice.add_int(1);
    let all = kernel.all.borrow_mut(intr);
    for (_, th) in all.iter() {
        let th = unsafe { th.as_ref() };
        if th.is_idle {
            continue;
        }
        th.recent_cpu.set(th.recent_cpu.get() * decay);
    }
}

/// Every-fourth-tick priority recomputation; ready threads are rebalanced
/// in the queue afterwards.
fn update_fair_priorities(kernel: &Kernel, intr: &InterruptGuard<'_>, nice_enabled: bool) {
    {
        let all = kernel.all.borrow_mut(intr);
        for (_, th) in all.iter() {
            let th = unsafe { th.as_ref() };
            if th.is_idle {
                continue;
            }
            th.set_priority_both(fair_priority(th.recent_cpu.get(), th.nice(), nice_enabled));
        }
    }
    let mut ready = kernel.ready.borrow_mut(intr);
    ready
        .make_contiguous()
        .sort_by(|a, b| b.priority().cmp(&a.priority()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmdline_selector() {
        assert_eq!(
            SchedPolicy::from_cmdline("foo -sched=fifo bar"),
            Some(SchedPolicy::Fifo)
        );
        assert_eq!(
            SchedPolicy::from_cmdline("-sched=prio"),
            Some(SchedPolicy::Prio)
        );
        assert_eq!(
            SchedPolicy::from_cmdline("-sched=fair"),
            Some(SchedPolicy::Fair { nice_enabled: true })
        );
        assert_eq!(
            SchedPolicy::from_cmdline("-sched=mlfqs"),
            Some(SchedPolicy::Mlfqs)
        );
        assert_eq!(SchedPolicy::from_cmdline("-sched=rr"), None);
        assert_eq!(SchedPolicy::from_cmdline("no selector"), None);
    }

    #[test]
    fn fair_priority_formula() {
        // Fresh thread, nice 0: top priority.
        assert_eq!(fair_priority(Fixed::ZERO, 0, true), PRI_MAX);
        // Priority drops by one per 4 ticks of recent CPU.
        assert_eq!(fair_priority(Fixed::from_int(8), 0, true), PRI_MAX - 2);
        // Nice pushes priority down when enabled, not otherwise.
        assert_eq!(fair_priority(Fixed::from_int(8), 5, true), PRI_MAX - 7);
        assert_eq!(fair_priority(Fixed::from_int(8), 5, false), PRI_MAX - 2);
        // Clamped at both ends.
        assert_eq!(fair_priority(Fixed::from_int(4000), 20, true), PRI_MIN);
        assert_eq!(fair_priority(Fixed::ZERO, -20, true), PRI_MAX);
    }
}
