//! Processes.
//!
//! A process is one user address space plus the kernel state needed to run
//! it: the page directory, the open-file table, the roster of threads
//! sharing the address space, the tables of user-visible sync objects, and
//! the executable (held open with writes denied). All of it hangs off the
//! process control block ([`Process`]), shared by the process's threads
//! and torn down exactly once on exit.
//!
//! Creation is a rendezvous. [`execute`] records a [`JoinRecord`] in the
//! kernel's global table, spawns a kernel thread running the loader
//! trampoline, and blocks on the record's load barrier; the trampoline
//! builds the PCB, loads the ELF image, packs `argv` onto the new user
//! stack, signals the barrier with the outcome, and enters user mode by
//! fabricating an interrupt return. The same record later carries the
//! exit-code rendezvous for [`wait`]. The record belongs to neither side:
//! it lives in the kernel table and is dropped by whichever side finishes
//! later, so a child that exits before the parent waits, or a parent that
//! never waits at all, both work.
//!
//! [`exit`] reclaims, in order: the user sync objects (killing any peer
//! still blocked on them), the open files, the peer threads (each one's
//! join record is signaled first), the executable's write denial, the page
//! directory, and finally the PCB itself, before signaling the process's
//! own record and terminating the thread.

pub mod file_table;
pub mod loader;
pub mod uthread;
pub mod usync;

pub use uthread::{pthread_execute, pthread_exit, pthread_exit_main, pthread_join};

use crate::{
    KernelError,
    addressing::PAGE_SIZE,
    arch::IntrFrame,
    fs::FileHandle,
    interrupt::{InterruptGuard, IntrCell},
    kernel::Kernel,
    mm::page_table::PageTable,
    sync::Semaphore,
    thread::{self, Thread, ThreadBuilder, ThreadState, Tid},
};
use alloc::{string::String, sync::Arc, vec::Vec};
use core::cell::{Cell, RefCell};
use file_table::FileTable;

/// A process identifier: the thread id of the process's main thread.
pub type Pid = Tid;

/// What a join record is a rendezvous for.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RecordKind {
    /// A whole process; the creator is its parent.
    Process,
    /// A secondary user thread; the creator is its process.
    UserThread,
}

/// The rendezvous between a creator and a created process or user thread.
///
/// Carries the load barrier (creator blocks until the child has entered
/// user mode or failed to), the join barrier, and the exit code. Lives in
/// the kernel's global table rather than in either party's control block,
/// because parents outlive children across PCB teardown.
pub struct JoinRecord {
    kind: RecordKind,
    tid: Cell<Tid>,
    creator: Tid,
    exit_code: Cell<i32>,
    waited: Cell<bool>,
    joined: Semaphore,
    loaded: Semaphore,
    load_ok: Cell<bool>,
}

impl JoinRecord {
    pub(crate) fn new(kind: RecordKind, creator: Tid) -> Self {
        Self {
            kind,
            tid: Cell::new(thread::TID_ERROR),
            creator,
            exit_code: Cell::new(-1),
            waited: Cell::new(false),
            joined: Semaphore::new(0),
            loaded: Semaphore::new(0),
            load_ok: Cell::new(false),
        }
    }

    /// The joinable thread's id.
    pub fn tid(&self) -> Tid {
        self.tid.get()
    }

    /// The creator's id (the parent pid for process records).
    pub fn creator(&self) -> Tid {
        self.creator
    }

    /// What this record is a rendezvous for.
    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    /// The stored exit code, default −1.
    pub fn exit_code(&self) -> i32 {
        self.exit_code.get()
    }

    pub(crate) fn set_tid(&self, tid: Tid) {
        self.tid.set(tid);
    }

    pub(crate) fn waited(&self) -> bool {
        self.waited.get()
    }

    pub(crate) fn set_waited(&self) {
        self.waited.set(true);
    }

    pub(crate) fn set_exit_code(&self, code: i32) {
        self.exit_code.set(code);
    }

    /// Signals the join barrier; the stored exit code stands.
    pub(crate) fn signal_join(&self, kernel: &'static Kernel) {
        self.joined.up(kernel);
    }

    /// Blocks until the join barrier is signaled.
    pub(crate) fn join_wait(&self, kernel: &'static Kernel) {
        self.joined.down(kernel);
    }

    /// Reports the load outcome and releases the creator.
    pub(crate) fn signal_loaded(&self, kernel: &'static Kernel, ok: bool) {
        self.load_ok.set(ok);
        self.loaded.up(kernel);
    }

    /// Blocks until the child reports its load outcome.
    pub(crate) fn wait_loaded(&self, kernel: &'static Kernel) {
        self.loaded.down(kernel);
    }

    pub(crate) fn load_ok(&self) -> bool {
        self.load_ok.get()
    }
}

/// A process control block.
pub struct Process {
    /// Display name: the program name, truncated.
    pub name: heapless::String<15>,
    /// The main thread's id; the canonical pid.
    pub main_tid: Tid,
    pub(crate) pagedir: RefCell<Option<PageTable>>,
    pub(crate) exec_file: RefCell<Option<FileHandle>>,
    /// The open-file table.
    pub files: FileTable,
    /// Thread ids sharing this address space, the main thread included.
    pub(crate) threads: IntrCell<Vec<Tid>>,
    pub(crate) locks: IntrCell<Vec<(u8, alloc::boxed::Box<crate::sync::Lock>)>>,
    pub(crate) semas: IntrCell<Vec<(u8, alloc::boxed::Box<Semaphore>)>>,
    next_lock_id: Cell<u8>,
    next_sema_id: Cell<u8>,
    /// Gate between `pthread_exit_main` and joiners of the main thread.
    pub(crate) main_join: Semaphore,
    pub(crate) main_joiner: Cell<Option<Tid>>,
    /// Set once `pthread_exit_main` has signalled the gate for the last
    /// time; a joiner registering after that must not wait on it.
    pub(crate) main_exiting: Cell<bool>,
}

impl Process {
    pub(crate) fn new(name: &str, main_tid: Tid) -> Self {
        let mut short = heapless::String::new();
        for c in name.chars().take(15) {
            let _ = short.push(c);
        }
        Self {
            name: short,
            main_tid,
            pagedir: RefCell::new(Some(PageTable::new())),
            exec_file: RefCell::new(None),
            files: FileTable::new(),
            threads: IntrCell::new(alloc::vec![main_tid]),
            locks: IntrCell::new(Vec::new()),
            semas: IntrCell::new(Vec::new()),
            next_lock_id: Cell::new(1),
            next_sema_id: Cell::new(1),
            main_join: Semaphore::new(0),
            main_joiner: Cell::new(None),
            main_exiting: Cell::new(false),
        }
    }

    pub(crate) fn alloc_lock_id(&self) -> Result<u8, KernelError> {
        let id = self.next_lock_id.get();
        if id == u8::MAX {
            return Err(KernelError::TooManyObjects);
        }
        self.next_lock_id.set(id + 1);
        Ok(id)
    }

    pub(crate) fn alloc_sema_id(&self) -> Result<u8, KernelError> {
        let id = self.next_sema_id.get();
        if id == u8::MAX {
            return Err(KernelError::TooManyObjects);
        }
        self.next_sema_id.set(id + 1);
        Ok(id)
    }
}

/// The pid on whose behalf the calling thread acts: its process's main
/// thread id, or its own id if it has no process yet.
pub(crate) fn caller_pid(kernel: &Kernel) -> Tid {
    kernel.with_current(|c| {
        c.process
            .borrow()
            .as_ref()
            .map(|p| p.main_tid)
            .unwrap_or(c.tid)
    })
}

/// The calling thread's process.
pub fn current_process(kernel: &Kernel) -> Result<Arc<Process>, KernelError> {
    kernel
        .with_current(|c| c.process.borrow().clone())
        .ok_or(KernelError::NoSuchEntry)
}

/// Starts a new process running the executable named by the first
/// whitespace-delimited token of `cmdline`, passing the remaining tokens
/// as arguments.
///
/// Blocks until the child has either entered user mode or failed to load;
/// on success the child's pid is returned and the caller may later
/// [`wait`] on it.
pub fn execute(kernel: &'static Kernel, cmdline: &str) -> Result<Pid, KernelError> {
    if cmdline.len() >= PAGE_SIZE {
        return Err(KernelError::InvalidArgument);
    }
    let program = cmdline
        .split_whitespace()
        .next()
        .ok_or(KernelError::InvalidArgument)?;
    // The command line is copied once; the child frees the copy after
    // argv has been packed onto the user stack.
    let cmd = String::from(cmdline);

    let record = Arc::new(JoinRecord::new(RecordKind::Process, caller_pid(kernel)));
    let child_record = record.clone();
    let parked = ThreadBuilder::new(program)
        .spawn_parked(kernel, move || start_process(kernel, cmd, child_record))?;
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
        Err(KernelError::NoExec)
    }
}

/// The loader trampoline: first code of every new process's main thread.
fn start_process(kernel: &'static Kernel, cmd: String, record: Arc<JoinRecord>) {
    let program = cmd.split_whitespace().next().unwrap_or("");
    let process = Arc::new(Process::new(program, kernel.current_tid()));
    kernel.with_current(|c| *c.process.borrow_mut() = Some(process.clone()));

    let mut frame = IntrFrame::new_user();
    match loader::load(kernel, &process, &mut frame, &cmd) {
        Ok(()) => {
            drop(cmd);
            {
                let pd = process.pagedir.borrow();
                kernel.activate_page_table(pd.as_ref());
            }
            record.signal_loaded(kernel, true);
            frame.save_fpu();
            kernel.enter_user(frame)
        }
        Err(_) => {
            // Unwind: dropping the half-built PCB frees its pages and
            // closes the executable.
            kernel.with_current(|c| *c.process.borrow_mut() = None);
            drop(process);
            record.signal_loaded(kernel, false);
            thread::exit(kernel)
        }
    }
}

/// Waits for child process `pid` to exit and returns its exit code.
///
/// Returns −1 if `pid` is not a live child of the caller or has already
/// been waited for. A child that exited before the call returns its
/// stored code immediately.
pub fn wait(kernel: &'static Kernel, pid: Pid) -> i32 {
    let caller = caller_pid(kernel);
    let record = {
        let intr = InterruptGuard::new(kernel.intr());
        match kernel.joins_find(&intr, pid) {
            Some(r)
                if r.kind() == RecordKind::Process && r.creator() == caller && !r.waited() =>
            {
                r.set_waited();
                Some(r)
            }
            _ => None,
        }
    };
    let Some(record) = record else {
        return -1;
    };
    record.join_wait(kernel);
    let code = record.exit_code();
    let intr = InterruptGuard::new(kernel.intr());
    kernel.joins_remove(&intr, pid);
    code
}

/// Terminates the calling thread's process with `code`, reclaiming every
/// resource it acquired. Never returns.
///
/// A thread with no process just exits.
pub fn exit(kernel: &'static Kernel, code: i32) -> ! {
    let cur_tid = kernel.current_tid();
    let Some(process) = kernel.with_current(|c| c.process.borrow().clone()) else {
        thread::exit(kernel)
    };
    kprintln!(kernel, "{}: exit({})", process.name, code);

    // 1. User sync objects; peers still blocked on one die with it.
    usync::destroy_sync_objects(kernel, &process);

    // 2. Open files, table lock inside the filesystem lock.
    kernel.fs_lock().acquire(kernel);
    process.files.close_all(kernel);
    kernel.fs_lock().release(kernel);

    // 3. Reap peers: signal each one's join record, then kill it.
    {
        let intr = InterruptGuard::new(kernel.intr());
        let peers: Vec<Tid> = process.threads.borrow_mut(&intr).clone();
        for tid in peers {
            if tid == cur_tid {
                continue;
            }
            if tid != process.main_tid {
                if let Some(r) = kernel.joins_find(&intr, tid) {
                    r.signal_join(kernel);
                }
                kill_thread(kernel, &intr, tid);
            }
        }
        if cur_tid != process.main_tid {
            // The main thread may itself be blocked joining us.
            if let Some(r) = kernel.joins_find(&intr, process.main_tid) {
                r.set_exit_code(code);
                r.signal_join(kernel);
            }
            kill_thread(kernel, &intr, process.main_tid);
            if let Some(r) = kernel.joins_find(&intr, cur_tid) {
                r.set_exit_code(code);
                r.signal_join(kernel);
            }
        }
        process.threads.borrow_mut(&intr).clear();
        // Records this process created (unreaped children, dead peers)
        // die with it; its own record stays for the parent.
        kernel.joins_purge_creator(&intr, process.main_tid, process.main_tid);
    }

    // 4. The executable loses its write denial; the address space dies:
    // detach the directory, activate the kernel-only mappings, destroy.
    kernel.fs_lock().acquire(kernel);
    process.exec_file.borrow_mut().take();
    kernel.fs_lock().release(kernel);
    let pagedir = process.pagedir.borrow_mut().take();
    kernel.activate_page_table(None);
    drop(pagedir);

    // 5. The PCB itself.
    kernel.with_current(|c| *c.process.borrow_mut() = None);
    let main_tid = process.main_tid;
    drop(process);

    // 6. Release the parent and die.
    if cur_tid == main_tid {
        let intr = InterruptGuard::new(kernel.intr());
        if let Some(r) = kernel.joins_find(&intr, cur_tid) {
            r.set_exit_code(code);
            r.signal_join(kernel);
        }
    }
    thread::exit(kernel)
}

/// Forcibly reclaims a non-running peer thread: extracts it from whatever
/// queue owns it, unregisters it, and frees its kernel stack.
pub(crate) fn kill_thread(kernel: &Kernel, intr: &InterruptGuard<'_>, tid: Tid) {
    let target = {
        let all = kernel.all.borrow_mut(intr);
        all.iter().find(|(t, _)| *t == tid).map(|(_, p)| *p)
    };
    let Some(target) = target else {
        return;
    };
    debug_assert_ne!(tid, kernel.current_tid());

    let th = unsafe { target.as_ref() };
    let boxed = match th.state.get() {
        ThreadState::Ready => {
            let mut ready = kernel.ready.borrow_mut(intr);
            let idx = ready.iter().position(|t| t.tid == tid);
            idx.and_then(|idx| ready.remove(idx))
        }
        ThreadState::Blocked => match th.blocked_in.get() {
            Some(sema) => unsafe { sema.as_ref() }.steal_waiter(intr, tid),
            None => {
                let mut sleepers = kernel.sleepers.borrow_mut(intr);
                let idx = sleepers.iter().position(|t| t.tid == tid);
                idx.map(|idx| sleepers.remove(idx))
            }
        },
        ThreadState::Running | ThreadState::Dying => None,
    };
    kernel.all.borrow_mut(intr).retain(|(t, _)| *t != tid);
    if let Some(victim) = boxed {
        reap(victim);
    }
}

/// Drops a forcibly reclaimed thread. Its lock bookkeeping is cleared
/// first; the locks it held are being destroyed by the same teardown.
pub(crate) fn reap(victim: alloc::boxed::Box<Thread>) {
    victim.held_locks.borrow_mut().clear();
    victim.state.set(ThreadState::Dying);
    drop(victim);
}
