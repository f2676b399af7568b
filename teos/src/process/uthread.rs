//! User threads.
//!
//! A process may run several user threads in its one address space. Each
//! secondary thread gets a fresh one-page user stack carved from the top
//! of the address space: creation probes the accessed bits of successive
//! pages downward from the top and claims the first page nobody has
//! touched. The new thread starts at a user-supplied stub that receives
//! the real entry point and its argument on that stack.
//!
//! Join semantics mirror processes, through the same global record table:
//! one successful join per thread. Joining the main thread goes through a
//! process-level semaphore instead, signaled once per registered joiner
//! by `pthread_exit_main`, which also joins every remaining peer before
//! taking the whole process down.

use super::{JoinRecord, Process, RecordKind, caller_pid, current_process};
use crate::{
    KernelError,
    addressing::{PAGE_SIZE, USER_TOP, Va},
    arch::IntrFrame,
    interrupt::InterruptGuard,
    kernel::Kernel,
    mm::Page,
    syscall::uaccess,
    thread::{self, ThreadBuilder, Tid},
};
use alloc::{sync::Arc, vec::Vec};

/// How far below the top of the address space a user stack may be placed.
const STACK_REGION_PAGES: usize = 256;

/// Creates a user thread in the calling thread's process.
///
/// The new thread enters user mode at `stub` with a fresh stack holding a
/// null return address, `entry` and `arg`; the stub's job is to call
/// `entry(arg)` and exit. Blocks until the thread is set up; returns its
/// id.
pub fn pthread_execute(
    kernel: &'static Kernel,
    stub: Va,
    entry: Va,
    arg: u32,
) -> Result<Tid, KernelError> {
    let process = current_process(kernel)?;
    let record = Arc::new(JoinRecord::new(RecordKind::UserThread, caller_pid(kernel)));
    let child_record = record.clone();
    let child_process = process.clone();
    let parked = ThreadBuilder::new("pthread").spawn_parked(kernel, move || {
        start_pthread(kernel, child_process, child_record, stub, entry, arg)
    })?;
    record.set_tid(parked.tid());
    {
        let intr = InterruptGuard::new(kernel.intr());
        kernel.joins_push(&intr, record.clone());
    }
    parked.unpark(kernel);

    record.wait_loaded(kernel);
    if record.load_ok() {
        Ok(record.tid())
    } else {
        let intr = InterruptGuard::new(kernel.intr());
        kernel.joins_remove(&intr, record.tid());
        Err(KernelError::NoMemory)
    }
}

/// The secondary trampoline: first code of every new user thread.
fn start_pthread(
    kernel: &'static Kernel,
    process: Arc<Process>,
    record: Arc<JoinRecord>,
    stub: Va,
    entry: Va,
    arg: u32,
) {
    kernel.with_current(|c| *c.process.borrow_mut() = Some(process.clone()));
    match setup_user_thread(kernel, &process, stub, entry, arg) {
        Ok(frame) => {
            let tid = kernel.current_tid();
            {
                let intr = InterruptGuard::new(kernel.intr());
                process.threads.borrow_mut(&intr).push(tid);
            }
            record.signal_loaded(kernel, true);
            kernel.enter_user(frame)
        }
        Err(_) => {
            kernel.with_current(|c| *c.process.borrow_mut() = None);
            record.signal_loaded(kernel, false);
            thread::exit(kernel)
        }
    }
}

/// Claims a user stack page and fabricates the stub's entry frame.
fn setup_user_thread(
    kernel: &'static Kernel,
    process: &Process,
    stub: Va,
    entry: Va,
    arg: u32,
) -> Result<IntrFrame, KernelError> {
    let mut pd = process.pagedir.borrow_mut();
    let pd = pd.as_mut().ok_or(KernelError::NoSuchEntry)?;

    // First untouched page below the top of user space becomes the stack.
    let mut base = USER_TOP - PAGE_SIZE;
    let floor = USER_TOP - STACK_REGION_PAGES * PAGE_SIZE;
    while pd.is_accessed(Va::new(base).unwrap()) {
        base -= PAGE_SIZE;
        if base < floor {
            return Err(KernelError::NoMemory);
        }
    }
    let page = Page::try_new(kernel)?;
    let base_va = Va::new(base).unwrap();
    pd.map(base_va, page, true)?;
    kernel.with_current(|c| c.ustack.set(Some(base_va)));

    // Stub frame, top down: alignment pad, arg, entry, null return
    // address. The stub runs with an 8-byte aligned stack.
    let top = base + PAGE_SIZE;
    let mut words = Vec::new();
    words.extend_from_slice(&0u32.to_le_bytes());
    words.extend_from_slice(&entry.into_usize().to_le_bytes()[..4]);
    words.extend_from_slice(&arg.to_le_bytes());
    words.extend_from_slice(&0u32.to_le_bytes());
    let esp = Va::new(top - words.len()).unwrap();
    uaccess::copy_to(pd, esp, &words)?;

    let mut frame = IntrFrame::new_user();
    frame.set_entry(stub);
    frame.set_stack(esp);
    frame.save_fpu();
    Ok(frame)
}

/// Waits for user thread `tid` of the calling thread's process to exit.
///
/// Each thread can be joined successfully at most once; a second attempt,
/// or joining a thread of another process, fails. Joining the main thread
/// blocks until `pthread_exit_main` runs; once it has, the join completes
/// immediately.
pub fn pthread_join(kernel: &'static Kernel, tid: Tid) -> Result<Tid, KernelError> {
    let process = current_process(kernel)?;
    if tid == kernel.current_tid() {
        return Err(KernelError::InvalidArgument);
    }
    if tid == process.main_tid {
        {
            let _intr = InterruptGuard::new(kernel.intr());
            if process.main_joiner.get().is_some() {
                return Err(KernelError::InvalidArgument);
            }
            process.main_joiner.set(Some(kernel.current_tid()));
            if process.main_exiting.get() {
                // The gate has already been signalled for the last time;
                // the main thread is at its exit point and will reap us.
                return Ok(tid);
            }
        }
        process.main_join.down(kernel);
        return Ok(tid);
    }

    let record = {
        let intr = InterruptGuard::new(kernel.intr());
        match kernel.joins_find(&intr, tid) {
            Some(r)
                if r.kind() == RecordKind::UserThread
                    && r.creator() == process.main_tid
                    && !r.waited() =>
            {
                r.set_waited();
                Some(r)
            }
            _ => None,
        }
    };
    let Some(record) = record else {
        return Err(KernelError::InvalidArgument);
    };
    record.join_wait(kernel);
    let intr = InterruptGuard::new(kernel.intr());
    kernel.joins_remove(&intr, tid);
    Ok(tid)
}

/// Terminates the calling user thread. Never returns.
///
/// The secondary variant signals the thread's join record, leaves the
/// roster, returns its user stack page and clears the mapping. Called by
/// the main thread, this is [`pthread_exit_main`].
pub fn pthread_exit(kernel: &'static Kernel) -> ! {
    let Ok(process) = current_process(kernel) else {
        thread::exit(kernel)
    };
    let tid = kernel.current_tid();
    if tid == process.main_tid {
        pthread_exit_main(kernel)
    }

    {
        let intr = InterruptGuard::new(kernel.intr());
        if let Some(r) = kernel.joins_find(&intr, tid) {
            r.set_exit_code(0);
            r.signal_join(kernel);
        }
        process.threads.borrow_mut(&intr).retain(|t| *t != tid);
    }
    if let Some(base) = kernel.with_current(|c| c.ustack.get()) {
        let mut pd = process.pagedir.borrow_mut();
        if let Some(pd) = pd.as_mut() {
            pd.unmap(base);
        }
    }
    kernel.with_current(|c| *c.process.borrow_mut() = None);
    thread::exit(kernel)
}

/// Main-thread exit: releases joiners of the main thread, joins every
/// remaining peer so the process shuts down in order, then exits the
/// process. Never returns.
pub fn pthread_exit_main(kernel: &'static Kernel) -> ! {
    let Ok(process) = current_process(kernel) else {
        thread::exit(kernel)
    };
    // One signal per registered joiner, never a blind one. The flag and
    // the signal flip in one critical section: a joiner that registers
    // later sees the flag and completes without touching the gate, so
    // nobody can be left waiting on a signal that already happened.
    {
        let _intr = InterruptGuard::new(kernel.intr());
        process.main_exiting.set(true);
        if process.main_joiner.get().is_some() {
            process.main_join.up(kernel);
        }
    }
    loop {
        let peer = {
            let intr = InterruptGuard::new(kernel.intr());
            let roster = process.threads.borrow_mut(&intr);
            roster
                .iter()
                .copied()
                .find(|t| *t != process.main_tid)
        };
        let Some(peer) = peer else { break };
        if pthread_join(kernel, peer).is_err() {
            // Already claimed by another joiner; let the peer run to its
            // exit and re-check the roster.
            thread::yield_now(kernel);
        }
    }
    super::exit(kernel, 0)
}
