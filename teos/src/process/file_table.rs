//! Per-process file-descriptor table.
//!
//! Descriptors are small integers handed out from 2 upward (0 and 1 are
//! the console) and are never reused within a process. The table is
//! protected by its own sleeping lock; callers that also need the
//! filesystem must take the global filesystem lock *first*. The table
//! lock always nests inside it, the one lock ordering in the kernel.

use crate::{KernelError, fs::FileHandle, kernel::Kernel, sync::Lock};
use alloc::collections::BTreeMap;
use core::cell::{Cell, RefCell};

/// First descriptor handed out for files.
const FD_BASE: i32 = 2;

/// The open-file table of one process.
pub struct FileTable {
    lock: Lock,
    map: RefCell<BTreeMap<i32, FileHandle>>,
    next_fd: Cell<i32>,
}

impl FileTable {
    pub(crate) fn new() -> Self {
        Self {
            lock: Lock::new(),
            map: RefCell::new(BTreeMap::new()),
            next_fd: Cell::new(FD_BASE),
        }
    }

    /// Installs an open file, returning its fresh descriptor.
    pub fn install(&self, kernel: &'static Kernel, file: FileHandle) -> Result<i32, KernelError> {
        self.lock.acquire(kernel);
        let fd = self.next_fd.get();
        let result = if fd == i32::MAX {
            Err(KernelError::TooManyObjects)
        } else {
            self.next_fd.set(fd + 1);
            self.map.borrow_mut().insert(fd, file);
            Ok(fd)
        };
        self.lock.release(kernel);
        result
    }

    /// Looks up descriptor `fd`.
    pub fn get(&self, kernel: &'static Kernel, fd: i32) -> Result<FileHandle, KernelError> {
        self.lock.acquire(kernel);
        let file = self.map.borrow().get(&fd).cloned();
        self.lock.release(kernel);
        file.ok_or(KernelError::BadFileDescriptor)
    }

    /// Removes and closes descriptor `fd`. The caller holds the
    /// filesystem lock.
    pub fn close(&self, kernel: &'static Kernel, fd: i32) -> Result<(), KernelError> {
        self.lock.acquire(kernel);
        let file = self.map.borrow_mut().remove(&fd);
        self.lock.release(kernel);
        file.map(drop).ok_or(KernelError::BadFileDescriptor)
    }

    /// Closes every open descriptor. The caller holds the filesystem
    /// lock.
    pub(crate) fn close_all(&self, kernel: &'static Kernel) {
        self.lock.acquire(kernel);
        self.map.borrow_mut().clear();
        self.lock.release(kernel);
    }

    /// The number of open descriptors.
    pub fn open_count(&self, kernel: &'static Kernel) -> usize {
        self.lock.acquire(kernel);
        let n = self.map.borrow().len();
        self.lock.release(kernel);
        n
    }
}
