//! Scheduling and kernel synchronization scenarios.

mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use teos::kernel::{Kernel, KernelBuilder};
use teos::sync::{Lock, Semaphore};
use teos::thread::{self, PRI_DEFAULT, ThreadBuilder, scheduler::SchedPolicy};

fn boot(policy: SchedPolicy) -> &'static Kernel {
    KernelBuilder::new().scheduler(policy).boot()
}

#[test]
fn fifo_runs_in_spawn_order() {
    // Select the policy the way a boot loader would.
    let kernel = KernelBuilder::new().cmdline("run -sched=fifo").boot();
    assert_eq!(kernel.policy(), SchedPolicy::Fifo);
    let order = Rc::new(RefCell::new(Vec::new()));
    for i in 0..3 {
        let order = order.clone();
        ThreadBuilder::new(&format!("t{i}"))
            .spawn(kernel, move || order.borrow_mut().push(i))
            .unwrap();
    }
    // All three are queued behind us; each runs to completion once we
    // yield through the queue.
    thread::yield_now(kernel);
    assert_eq!(*order.borrow(), vec![0, 1, 2]);
}

#[test]
fn higher_priority_newcomer_preempts() {
    let kernel = boot(SchedPolicy::Prio);
    let order = Rc::new(RefCell::new(Vec::new()));
    let done = Arc::new(Semaphore::new(0));
    {
        let order = order.clone();
        ThreadBuilder::new("hi")
            .priority(PRI_DEFAULT + 5)
            .spawn(kernel, move || order.borrow_mut().push("hi"))
            .unwrap();
    }
    // The newcomer ran to completion before spawn returned.
    order.borrow_mut().push("main");
    {
        let (order, done) = (order.clone(), done.clone());
        ThreadBuilder::new("lo")
            .priority(PRI_DEFAULT - 5)
            .spawn(kernel, move || {
                order.borrow_mut().push("lo");
                done.up(kernel);
            })
            .unwrap();
    }
    // The lower-priority thread must not have run yet; it only gets the
    // CPU once we block.
    order.borrow_mut().push("main2");
    done.down(kernel);
    assert_eq!(*order.borrow(), vec!["hi", "main", "main2", "lo"]);
}

#[test]
fn equal_priority_round_robins_in_order() {
    let kernel = boot(SchedPolicy::Prio);
    let order = Rc::new(RefCell::new(Vec::new()));
    let done = Arc::new(Semaphore::new(0));
    for i in 0..4 {
        let order = order.clone();
        let done = done.clone();
        ThreadBuilder::new(&format!("t{i}"))
            .spawn(kernel, move || {
                order.borrow_mut().push(i);
                thread::yield_now(kernel);
                order.borrow_mut().push(10 + i);
                done.up(kernel);
            })
            .unwrap();
    }
    for _ in 0..4 {
        done.down(kernel);
    }
    // Ties keep insertion order, in both rounds.
    assert_eq!(*order.borrow(), vec![0, 1, 2, 3, 10, 11, 12, 13]);
}

#[test]
fn semaphore_is_a_missed_wakeup_proof_event() {
    let kernel = boot(SchedPolicy::Prio);
    let sema = Arc::new(Semaphore::new(0));
    let done = Arc::new(Semaphore::new(0));

    // Signal first, wait second: the count remembers the signal.
    sema.up(kernel);
    sema.down(kernel);

    let s2 = sema.clone();
    let d2 = done.clone();
    ThreadBuilder::new("waiter")
        .spawn(kernel, move || {
            s2.down(kernel);
            d2.up(kernel);
        })
        .unwrap();
    thread::yield_now(kernel); // waiter blocks on the empty semaphore
    assert_eq!(done.value(), 0);
    sema.up(kernel);
    done.down(kernel);
}

#[test]
fn lock_donation_raises_the_holder() {
    let kernel = boot(SchedPolicy::Prio);
    let lock = Arc::new(Lock::new());
    let order = Rc::new(RefCell::new(Vec::new()));

    lock.acquire(kernel);
    assert_eq!(thread::get_priority(kernel), PRI_DEFAULT);

    {
        let (lock, order) = (lock.clone(), order.clone());
        ThreadBuilder::new("high")
            .priority(PRI_DEFAULT + 10)
            .spawn(kernel, move || {
                order.borrow_mut().push("high: acquiring");
                lock.acquire(kernel);
                order.borrow_mut().push("high: got it");
                lock.release(kernel);
            })
            .unwrap();
    }
    // "high" preempted us and is now blocked on the lock; its priority
    // flowed to us.
    assert_eq!(thread::get_priority(kernel), PRI_DEFAULT + 10);

    // A middle-priority thread must not run ahead of the boosted holder.
    {
        let order = order.clone();
        ThreadBuilder::new("mid")
            .priority(PRI_DEFAULT + 5)
            .spawn(kernel, move || order.borrow_mut().push("mid: done"))
            .unwrap();
    }
    assert_eq!(*order.borrow(), vec!["high: acquiring"]);

    // Release: donation is undone, the donor runs first, "mid" after it.
    lock.release(kernel);
    assert_eq!(thread::get_priority(kernel), PRI_DEFAULT);
    thread::yield_now(kernel);
    assert_eq!(
        *order.borrow(),
        vec!["high: acquiring", "high: got it", "mid: done"]
    );
}

#[test]
fn donation_is_transitive_along_lock_chains() {
    let kernel = boot(SchedPolicy::Prio);
    let lock_a = Arc::new(Lock::new());
    let lock_b = Arc::new(Lock::new());

    lock_a.acquire(kernel); // main holds A at PRI_DEFAULT

    let mid_tid = {
        let (a, b) = (lock_a.clone(), lock_b.clone());
        ThreadBuilder::new("mid")
            .priority(PRI_DEFAULT + 5)
            .spawn(kernel, move || {
                b.acquire(kernel);
                a.acquire(kernel); // blocks on main
                a.release(kernel);
                b.release(kernel);
            })
            .unwrap()
    };
    // mid holds B, blocked on A: its priority reached us.
    assert_eq!(thread::get_priority(kernel), PRI_DEFAULT + 5);

    {
        let b = lock_b.clone();
        ThreadBuilder::new("high")
            .priority(PRI_DEFAULT + 12)
            .spawn(kernel, move || {
                b.acquire(kernel); // blocks on mid
                b.release(kernel);
            })
            .unwrap();
    }
    // high -> B -> mid -> A -> main: the donation crossed both links.
    assert_eq!(thread::get_priority(kernel), PRI_DEFAULT + 12);
    assert_eq!(
        thread::with_thread(kernel, mid_tid, |t| t.priority()),
        Some(PRI_DEFAULT + 12)
    );

    lock_a.release(kernel);
    assert_eq!(thread::get_priority(kernel), PRI_DEFAULT);
    thread::yield_now(kernel);
    assert!(!lock_a.held_by_current(kernel));
}

#[test]
fn sleep_wakes_after_the_countdown() {
    let kernel = boot(SchedPolicy::Prio);
    let done = Arc::new(Semaphore::new(0));
    {
        let done = done.clone();
        ThreadBuilder::new("sleeper")
            .spawn(kernel, move || {
                thread::sleep(kernel, 5);
                done.up(kernel);
            })
            .unwrap();
    }
    thread::yield_now(kernel); // sleeper parks itself
    for _ in 0..4 {
        kernel.timer_interrupt();
        assert_eq!(done.value(), 0);
    }
    kernel.timer_interrupt(); // fifth tick wakes it
    done.down(kernel);
}

#[test]
fn time_slice_requests_preemption() {
    let kernel = boot(SchedPolicy::Prio);
    let ran = Rc::new(Cell::new(false));
    {
        let ran = ran.clone();
        // Parked first so spawning cannot preempt the measurement.
        let parked = ThreadBuilder::new("peer")
            .spawn_parked(kernel, move || ran.set(true))
            .unwrap();
        parked.unpark(kernel);
    }
    let mut preempted = false;
    for _ in 0..teos::thread::scheduler::TIME_SLICE {
        preempted = kernel.timer_tick();
    }
    assert!(preempted, "a full slice must request preemption");
    assert!(!ran.get());
    thread::yield_now(kernel);
    assert!(ran.get());
}

#[test]
fn fair_nice_lowers_priority() {
    let kernel = boot(SchedPolicy::Fair { nice_enabled: true });
    let done = Arc::new(Semaphore::new(0));
    let prios = Rc::new(RefCell::new(Vec::new()));

    for (name, nice) in [("nice0", 0), ("nice5", 5)] {
        let done = done.clone();
        let prios = prios.clone();
        ThreadBuilder::new(name)
            .nice(nice)
            .spawn(kernel, move || {
                assert_eq!(thread::get_nice(kernel), nice);
                // Burn CPU under the timer: every tick lands on whoever
                // is running, and the estimator rebalances the pair.
                for _ in 0..32 {
                    kernel.timer_interrupt();
                }
                prios
                    .borrow_mut()
                    .push((nice, thread::get_priority(kernel)));
                done.up(kernel);
            })
            .unwrap();
    }
    done.down(kernel);
    done.down(kernel);

    let prios = prios.borrow();
    let p0 = prios.iter().find(|(n, _)| *n == 0).unwrap().1;
    let p5 = prios.iter().find(|(n, _)| *n == 5).unwrap().1;
    assert!(
        p5 < p0,
        "nicer thread must end with strictly lower priority ({p5} vs {p0})"
    );
}

#[test]
fn fair_load_average_rises_under_load() {
    let kernel = boot(SchedPolicy::Fair { nice_enabled: true });
    assert_eq!(kernel.load_average().round(), 0);

    // Park two threads on a semaphore, then wake them without yielding:
    // they sit in the ready queue for the whole measured second.
    let hold = Arc::new(Semaphore::new(0));
    for i in 0..2 {
        let hold = hold.clone();
        ThreadBuilder::new(&format!("hog{i}"))
            .spawn(kernel, move || hold.down(kernel))
            .unwrap();
    }
    hold.up(kernel);
    hold.up(kernel);
    for _ in 0..teos::thread::scheduler::TICKS_PER_SEC {
        kernel.timer_tick();
    }
    assert!(kernel.load_average() > teos::thread::fixed::Fixed::ZERO);
    thread::yield_now(kernel);
}

#[test]
#[should_panic(expected = "mlfqs")]
fn mlfqs_scheduling_is_fatal() {
    let kernel = boot(SchedPolicy::Mlfqs);
    let _ = ThreadBuilder::new("t").spawn(kernel, move || {});
}
