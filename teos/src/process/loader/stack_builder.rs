//! User stack construction.
//!
//! [`StackBuilder`] pushes bytes downward onto an already-mapped user
//! stack through the process page table, tracking the would-be `esp`. The
//! argument packer drives it; nothing here knows what the pushed bytes
//! mean.

use crate::{
    KernelError,
    addressing::{USER_TOP, Va},
    mm::page_table::PageTable,
    syscall::uaccess,
};

/// A downward-growing writer over a user stack.
pub struct StackBuilder<'a> {
    sp: usize,
    pd: &'a mut PageTable,
}

impl<'a> StackBuilder<'a> {
    /// Starts at the top of the user address space. The stack page must
    /// already be mapped.
    pub fn new(pd: &'a mut PageTable) -> Self {
        Self { sp: USER_TOP, pd }
    }

    /// The current stack pointer.
    pub fn sp(&self) -> Va {
        Va::new(self.sp).expect("stack pointer left the user range")
    }

    /// Pushes raw bytes, returning their user address.
    ///
    /// Fails if the push would leave the mapped stack.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<Va, KernelError> {
        let sp = self
            .sp
            .checked_sub(bytes.len())
            .ok_or(KernelError::NoMemory)?;
        let va = Va::new(sp).ok_or(KernelError::NoMemory)?;
        uaccess::copy_to(self.pd, va, bytes).map_err(|_| KernelError::NoMemory)?;
        self.sp = sp;
        Ok(va)
    }

    /// Pushes a 32-bit word.
    pub fn push_u32(&mut self, value: u32) -> Result<Va, KernelError> {
        self.push_bytes(&value.to_le_bytes())
    }

    /// Pushes a NUL-terminated string, returning its user address.
    pub fn push_str(&mut self, s: &str) -> Result<Va, KernelError> {
        self.sp = self.sp.checked_sub(1).ok_or(KernelError::NoMemory)?;
        let va = Va::new(self.sp).ok_or(KernelError::NoMemory)?;
        uaccess::copy_to(self.pd, va, &[0]).map_err(|_| KernelError::NoMemory)?;
        self.push_bytes(s.as_bytes())
    }

    /// Pads the stack down so that after `words` further 32-bit pushes the
    /// stack pointer lands on a 16-byte boundary.
    pub fn align_for(&mut self, words: usize) {
        let after = self.sp - 4 * words;
        self.sp = (after & !0xf) + 4 * words;
    }

    /// Finishes, returning the final stack pointer.
    pub fn finish(self) -> Va {
        self.sp()
    }
}
