//! Safe access to user-space memory.
//!
//! The kernel never dereferences a user pointer. Every transfer crosses
//! this module, which walks the current process's page table page by page,
//! honors the writable bit, and maintains the accessed/dirty bits as the
//! MMU would. A bad pointer (unmapped, out of the user range, wrapping,
//! or writing a read-only page) fails with [`KernelError::BadAddress`]
//! and the operation is rejected; the process is not killed for it.
//!
//! The typed wrappers ([`UserPtrRO`], [`UserPtrWO`], [`UserCString`],
//! [`UserBytesRO`], [`UserBytesWO`]) are one-shot: they take ownership of
//! the address on use, so a checked pointer cannot be re-used after the
//! check.

use crate::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
    kernel::Kernel,
    mm::page_table::PageTable,
};
use alloc::{string::String, vec, vec::Vec};

/// Copies `buf.len()` bytes from user memory at `va` out of `pt`.
pub fn copy_from(pt: &mut PageTable, mut va: Va, buf: &mut [u8]) -> Result<(), KernelError> {
    let mut done = 0;
    while done < buf.len() {
        let off = va.page_offset();
        let n = (PAGE_SIZE - off).min(buf.len() - done);
        pt.with_page(va, |bytes| {
            buf[done..done + n].copy_from_slice(&bytes[off..off + n]);
        })
        .ok_or(KernelError::BadAddress)?;
        done += n;
        if done < buf.len() {
            va = va.checked_add(n).ok_or(KernelError::BadAddress)?;
        }
    }
    Ok(())
}

/// Copies `bytes` into user memory at `va` in `pt`, honoring the writable
/// bit.
pub fn copy_to(pt: &mut PageTable, mut va: Va, bytes: &[u8]) -> Result<(), KernelError> {
    let mut done = 0;
    while done < bytes.len() {
        let off = va.page_offset();
        let n = (PAGE_SIZE - off).min(bytes.len() - done);
        pt.with_page_mut(va, |page| {
            page[off..off + n].copy_from_slice(&bytes[done..done + n]);
        })
        .ok_or(KernelError::BadAddress)?;
        done += n;
        if done < bytes.len() {
            va = va.checked_add(n).ok_or(KernelError::BadAddress)?;
        }
    }
    Ok(())
}

/// Runs `f` on the current process's page table.
pub(crate) fn with_current_pt<R>(
    kernel: &Kernel,
    f: impl FnOnce(&mut PageTable) -> Result<R, KernelError>,
) -> Result<R, KernelError> {
    kernel.with_current(|c| {
        let process = c.process.borrow();
        let process = process.as_ref().ok_or(KernelError::BadAddress)?;
        let mut pd = process.pagedir.borrow_mut();
        let pd = pd.as_mut().ok_or(KernelError::BadAddress)?;
        f(pd)
    })
}

/// A one-shot, read-only user pointer to a `T`.
pub struct UserPtrRO<T: Copy> {
    va: Va,
    _ty: core::marker::PhantomData<T>,
}

impl<T: Copy> UserPtrRO<T> {
    /// Wraps the user address `addr`.
    pub fn new(addr: usize) -> Result<Self, KernelError> {
        Ok(Self {
            va: Va::new(addr).ok_or(KernelError::BadAddress)?,
            _ty: core::marker::PhantomData,
        })
    }

    /// Reads the `T` at the wrapped address.
    pub fn get(self, kernel: &Kernel) -> Result<T, KernelError> {
        let mut buf = vec![0u8; core::mem::size_of::<T>()];
        with_current_pt(kernel, |pt| copy_from(pt, self.va, &mut buf))?;
        Ok(unsafe { core::ptr::read_unaligned(buf.as_ptr() as *const T) })
    }
}

/// A one-shot, write-only user pointer to a `T`.
pub struct UserPtrWO<T: Copy> {
    va: Va,
    _ty: core::marker::PhantomData<T>,
}

impl<T: Copy> UserPtrWO<T> {
    /// Wraps the user address `addr`.
    pub fn new(addr: usize) -> Result<Self, KernelError> {
        Ok(Self {
            va: Va::new(addr).ok_or(KernelError::BadAddress)?,
            _ty: core::marker::PhantomData,
        })
    }

    /// Writes `value` to the wrapped address.
    pub fn put(self, kernel: &Kernel, value: T) -> Result<(), KernelError> {
        let size = core::mem::size_of::<T>();
        let mut buf = vec![0u8; size];
        unsafe {
            core::ptr::write_unaligned(buf.as_mut_ptr() as *mut T, value);
        }
        with_current_pt(kernel, |pt| copy_to(pt, self.va, &buf))
    }
}

/// A one-shot, read-only user byte slice.
pub struct UserBytesRO {
    va: Va,
    len: usize,
}

impl UserBytesRO {
    /// Wraps `len` bytes of user memory at `addr`.
    pub fn new(addr: usize, len: usize) -> Result<Self, KernelError> {
        Ok(Self {
            va: Va::new(addr).ok_or(KernelError::BadAddress)?,
            len,
        })
    }

    /// Reads the slice into a kernel buffer.
    pub fn read(self, kernel: &Kernel) -> Result<Vec<u8>, KernelError> {
        let mut buf = vec![0u8; self.len];
        with_current_pt(kernel, |pt| copy_from(pt, self.va, &mut buf))?;
        Ok(buf)
    }
}

/// A one-shot, write-only user byte slice.
pub struct UserBytesWO {
    va: Va,
}

impl UserBytesWO {
    /// Wraps user memory at `addr`.
    pub fn new(addr: usize) -> Result<Self, KernelError> {
        Ok(Self {
            va: Va::new(addr).ok_or(KernelError::BadAddress)?,
        })
    }

    /// Writes `bytes` to the wrapped address.
    pub fn write(self, kernel: &Kernel, bytes: &[u8]) -> Result<(), KernelError> {
        with_current_pt(kernel, |pt| copy_to(pt, self.va, bytes))
    }
}

/// A NUL-terminated user string.
pub struct UserCString {
    va: Va,
}

impl UserCString {
    /// Wraps the user address `addr`.
    pub fn new(addr: usize) -> Result<Self, KernelError> {
        Ok(Self {
            va: Va::new(addr).ok_or(KernelError::BadAddress)?,
        })
    }

    /// Reads the string, stopping at NUL. Fails with
    /// [`KernelError::InvalidArgument`] if no NUL shows up within
    /// `max_len` bytes, and with [`KernelError::BadAddress`] on a bad
    /// pointer or non-UTF-8 contents.
    pub fn read(self, kernel: &Kernel, max_len: usize) -> Result<String, KernelError> {
        let mut bytes = Vec::new();
        let mut va = self.va;
        with_current_pt(kernel, |pt| {
            loop {
                let off = va.page_offset();
                let chunk = pt
                    .with_page(va, |page| {
                        let slice = &page[off..];
                        match slice.iter().position(|&b| b == 0) {
                            Some(nul) => (slice[..nul].to_vec(), true),
                            None => (slice.to_vec(), false),
                        }
                    })
                    .ok_or(KernelError::BadAddress)?;
                let (chunk, done) = chunk;
                bytes.extend_from_slice(&chunk);
                if bytes.len() > max_len {
                    return Err(KernelError::InvalidArgument);
                }
                if done {
                    return Ok(());
                }
                va = va
                    .checked_add(PAGE_SIZE - off)
                    .ok_or(KernelError::BadAddress)?;
            }
        })?;
        String::from_utf8(bytes).map_err(|_| KernelError::BadAddress)
    }
}
