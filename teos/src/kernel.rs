//! The kernel context.
//!
//! Everything a classical kernel keeps in file-scope globals (the ready
//! queue, the all-threads list, the join-record table, the global
//! filesystem lock, the idle thread, the load average, the console) lives
//! in one [`Kernel`] value. Boot builds it once with [`KernelBuilder`],
//! leaks it, and every subsystem carries the resulting `&'static Kernel`
//! handle. Besides making initialization order explicit, this is what lets
//! an entire kernel instance be stood up inside a test.
//!
//! The platform-dependent pieces are injected into the builder:
//!
//! - [`KernelBuilder::filesystem`]: the backing filesystem.
//! - [`KernelBuilder::user_entry`]: the interrupt-return path that drops
//!   the CPU into user mode for a fabricated [`IntrFrame`].
//! - [`KernelBuilder::on_idle`]: what the idle thread does while waiting
//!   for work; on hardware, "enable interrupts and halt".
//! - [`KernelBuilder::console`]: the console sink.

use crate::{
    arch::IntrFrame,
    console::{Console, NullSink, Sink},
    fs::{FileHandle, memfs::MemFs, traits::FileSystem},
    interrupt::{InterruptGuard, InterruptState, IntrCell, IntrController},
    process::JoinRecord,
    sync::Lock,
    thread::{
        self, Thread, Tid,
        fixed::Fixed,
        scheduler::{self, SchedPolicy},
    },
    KernelError,
};
use alloc::{boxed::Box, collections::VecDeque, sync::Arc, vec::Vec};
use core::{cell::Cell, ptr::NonNull};

/// The kernel context: every process-wide singleton of the kernel.
///
/// Obtained from [`KernelBuilder::boot`] as a `&'static` handle.
pub struct Kernel {
    intr: IntrController,
    policy: SchedPolicy,
    current: Cell<Option<NonNull<Thread>>>,
    idle: Cell<Option<NonNull<Thread>>>,
    pub(crate) ready: IntrCell<VecDeque<Box<Thread>>>,
    pub(crate) all: IntrCell<Vec<(Tid, NonNull<Thread>)>>,
    pub(crate) sleepers: IntrCell<Vec<Box<Thread>>>,
    pub(crate) joins: IntrCell<Vec<Arc<JoinRecord>>>,
    next_tid: Cell<Tid>,
    ticks: Cell<u64>,
    slice_left: Cell<i64>,
    load_avg: Cell<Fixed>,
    pages_left: Cell<usize>,
    fs_root: Box<dyn FileSystem>,
    fs_lock: Lock,
    console: Console,
    user_entry: Option<Box<dyn Fn(&'static Kernel, IntrFrame) -> !>>,
    on_idle: Option<Box<dyn Fn(&'static Kernel)>>,
    active_pd: Cell<Option<NonNull<crate::mm::page_table::PageTable>>>,
}

impl Kernel {
    /// Starts configuring a kernel.
    pub fn builder() -> KernelBuilder {
        KernelBuilder::new()
    }

    /// The interrupt controller of the (single) CPU.
    pub fn intr(&self) -> &IntrController {
        &self.intr
    }

    /// The scheduling policy chosen at boot.
    pub fn policy(&self) -> SchedPolicy {
        self.policy
    }

    /// The kernel console.
    pub fn console(&self) -> &Console {
        &self.console
    }

    /// The global filesystem lock. Every call into the backing filesystem
    /// must hold it; the per-process file-table locks nest inside it.
    pub fn fs_lock(&self) -> &Lock {
        &self.fs_lock
    }

    /// The backing filesystem.
    pub fn fs_root(&self) -> &dyn FileSystem {
        &*self.fs_root
    }

    /// Opens `name` under the filesystem lock, returning an open handle.
    pub fn open_file(&'static self, name: &str) -> Result<FileHandle, KernelError> {
        self.fs_lock.acquire(self);
        let node = self.fs_root.open(name);
        self.fs_lock.release(self);
        Ok(FileHandle::new(node?))
    }

    /// Timer ticks since boot.
    pub fn ticks(&self) -> u64 {
        self.ticks.get()
    }

    /// The fair scheduler's load average.
    pub fn load_average(&self) -> Fixed {
        self.load_avg.get()
    }

    /// Delivers one timer tick, as the platform's timer interrupt handler
    /// would. Returns whether the running thread should be preempted on
    /// return from the interrupt.
    pub fn timer_tick(&'static self) -> bool {
        scheduler::on_tick(self)
    }

    /// Delivers one timer tick and performs the preemption the tick
    /// requested, i.e. a full timer interrupt including its return path.
    pub fn timer_interrupt(&'static self) {
        if self.timer_tick() {
            thread::yield_now(self);
        }
    }

    /// The id of the running thread.
    pub fn current_tid(&self) -> Tid {
        self.with_current(|c| c.tid)
    }

    /// Runs `f` on the running thread's descriptor.
    pub fn with_current<R>(&self, f: impl FnOnce(&Thread) -> R) -> R {
        self.try_with_current(f)
            .expect("no running thread; kernel not booted")
    }

    /// Runs `f` on the running thread's descriptor, if scheduling has
    /// started.
    pub fn try_with_current<R>(&self, f: impl FnOnce(&Thread) -> R) -> Option<R> {
        self.current.get().map(|p| f(unsafe { p.as_ref() }))
    }

    /// Enters user mode through the injected interrupt-return path.
    /// Diverges; panics if the platform installed no user-mode entry.
    pub fn enter_user(&'static self, frame: IntrFrame) -> ! {
        match self.user_entry.as_ref() {
            Some(entry) => entry(self, frame),
            None => panic!("no user-mode entry installed"),
        }
    }

    /// Remaining page budget.
    pub fn pages_left(&self) -> usize {
        self.pages_left.get()
    }

    // Scheduler plumbing.

    pub(crate) fn scheduling_started(&self) -> bool {
        self.current.get().is_some()
    }

    pub(crate) fn current(&self) -> NonNull<Thread> {
        self.current.get().expect("no running thread")
    }

    pub(crate) fn set_current(&self, th: NonNull<Thread>) {
        self.current.set(Some(th));
    }

    pub(crate) fn idle_thread(&self) -> NonNull<Thread> {
        self.idle.get().expect("idle thread missing")
    }

    pub(crate) fn set_idle(&self, th: NonNull<Thread>) {
        self.idle.set(Some(th));
    }

    pub(crate) fn alloc_tid(&self) -> Tid {
        let tid = self.next_tid.get();
        self.next_tid.set(tid + 1);
        tid
    }

    pub(crate) fn bump_ticks(&self) -> u64 {
        let t = self.ticks.get() + 1;
        self.ticks.set(t);
        t
    }

    pub(crate) fn reset_time_slice(&self) {
        self.slice_left.set(scheduler::TIME_SLICE);
    }

    /// Burns one tick of the running thread's time slice; true when the
    /// slice is exhausted.
    pub(crate) fn tick_time_slice(&self) -> bool {
        let left = (self.slice_left.get() - 1).max(0);
        self.slice_left.set(left);
        left == 0
    }

    pub(crate) fn set_load_avg(&self, v: Fixed) {
        self.load_avg.set(v);
    }

    pub(crate) fn on_idle_hook(&self) -> Option<&dyn Fn(&'static Kernel)> {
        self.on_idle.as_deref()
    }

    pub(crate) fn charge_pages(&self, n: usize) -> bool {
        let left = self.pages_left.get();
        if left < n {
            return false;
        }
        self.pages_left.set(left - n);
        true
    }

    pub(crate) fn refund_pages(&self, n: usize) {
        self.pages_left.set(self.pages_left.get() + n);
    }

    /// Makes `pd` the active address space (`None` selects the kernel-only
    /// mappings). The kernel never dereferences the previous value.
    pub(crate) fn activate_page_table(
        &self,
        pd: Option<&crate::mm::page_table::PageTable>,
    ) {
        self.active_pd.set(pd.map(NonNull::from));
    }

    // Join-record table.

    pub(crate) fn joins_push(&self, intr: &InterruptGuard<'_>, rec: Arc<JoinRecord>) {
        self.joins.borrow_mut(intr).push(rec);
    }

    pub(crate) fn joins_find(
        &self,
        intr: &InterruptGuard<'_>,
        tid: Tid,
    ) -> Option<Arc<JoinRecord>> {
        self.joins
            .borrow_mut(intr)
            .iter()
            .find(|r| r.tid() == tid)
            .cloned()
    }

    pub(crate) fn joins_remove(&self, intr: &InterruptGuard<'_>, tid: Tid) {
        self.joins.borrow_mut(intr).retain(|r| r.tid() != tid);
    }

    /// Drops every record created by `creator` except `keep`.
    pub(crate) fn joins_purge_creator(
        &self,
        intr: &InterruptGuard<'_>,
        creator: Tid,
        keep: Tid,
    ) {
        self.joins
            .borrow_mut(intr)
            .retain(|r| r.creator() != creator || r.tid() == keep);
    }
}

/// Configures and boots a [`Kernel`].
pub struct KernelBuilder {
    policy: SchedPolicy,
    fs: Option<Box<dyn FileSystem>>,
    page_budget: usize,
    sink: Box<dyn Sink>,
    user_entry: Option<Box<dyn Fn(&'static Kernel, IntrFrame) -> !>>,
    on_idle: Option<Box<dyn Fn(&'static Kernel)>>,
}

impl KernelBuilder {
    /// A builder with defaults: strict-priority scheduling, an empty RAM
    /// filesystem, an unbounded page budget, a discarding console.
    pub fn new() -> Self {
        Self {
            policy: SchedPolicy::Prio,
            fs: None,
            page_budget: usize::MAX,
            sink: Box::new(NullSink),
            user_entry: None,
            on_idle: None,
        }
    }

    /// Sets the scheduling policy.
    pub fn scheduler(mut self, policy: SchedPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Applies kernel command line options, currently the scheduler
    /// selector `-sched=fifo|prio|fair|mlfqs`.
    ///
    /// # Panics
    /// Panics on an unrecognized `-sched=` value; a misconfigured boot is
    /// fatal.
    pub fn cmdline(mut self, cmdline: &str) -> Self {
        if cmdline.split_whitespace().any(|w| w.starts_with("-sched=")) {
            self.policy = SchedPolicy::from_cmdline(cmdline)
                .unwrap_or_else(|| panic!("unrecognized scheduler selector in {cmdline:?}"));
        }
        self
    }

    /// Installs the backing filesystem.
    pub fn filesystem(mut self, fs: impl FileSystem + 'static) -> Self {
        self.fs = Some(Box::new(fs));
        self
    }

    /// Caps the number of allocatable pages (user frames and kernel thread
    /// stacks), making out-of-memory paths reachable.
    pub fn page_budget(mut self, pages: usize) -> Self {
        self.page_budget = pages;
        self
    }

    /// Installs the console sink.
    pub fn console(mut self, sink: impl Sink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    /// Installs the interrupt-return path that enters user mode for a
    /// fabricated frame. A real port installs its `iret` sequence here; a
    /// hosted kernel installs an interpreter for the loaded program.
    pub fn user_entry(
        mut self,
        entry: impl Fn(&'static Kernel, IntrFrame) -> ! + 'static,
    ) -> Self {
        self.user_entry = Some(Box::new(entry));
        self
    }

    /// Installs the idle thread's wait-for-event hook. On hardware this is
    /// "enable interrupts and halt"; a hosted kernel pumps its timer here.
    pub fn on_idle(mut self, hook: impl Fn(&'static Kernel) + 'static) -> Self {
        self.on_idle = Some(Box::new(hook));
        self
    }

    /// Boots the kernel: the calling thread becomes the first kernel
    /// thread, the idle thread is created, interrupts are enabled.
    pub fn boot(self) -> &'static Kernel {
        let kernel: &'static Kernel = Box::leak(Box::new(Kernel {
            intr: IntrController::new(),
            policy: self.policy,
            current: Cell::new(None),
            idle: Cell::new(None),
            ready: IntrCell::new(VecDeque::new()),
            all: IntrCell::new(Vec::new()),
            sleepers: IntrCell::new(Vec::new()),
            joins: IntrCell::new(Vec::new()),
            next_tid: Cell::new(1),
            ticks: Cell::new(0),
            slice_left: Cell::new(scheduler::TIME_SLICE),
            load_avg: Cell::new(Fixed::ZERO),
            pages_left: Cell::new(self.page_budget),
            fs_root: self.fs.unwrap_or_else(|| Box::new(MemFs::new())),
            fs_lock: Lock::new(),
            console: Console::new(self.sink),
            user_entry: self.user_entry,
            on_idle: self.on_idle,
            active_pd: Cell::new(None),
        }));
        thread::init_bootstrap(kernel);
        kernel.intr.set(InterruptState::On);
        kprintln!(kernel, "TeOS kernel, {:?} scheduler", kernel.policy());
        kernel
    }
}
