//! The system call surface.
//!
//! System calls use the classic i386 convention: user code pushes the
//! arguments, then the syscall number, and traps; the kernel reads the
//! number at `[esp]` and the arguments above it off the **user** stack,
//! and leaves the result in `eax`. Every pointer argument crosses the
//! [`uaccess`] layer.
//!
//! Handlers return `Result<usize, KernelError>`; the dispatch epilogue
//! writes either the value or the negative errno into the saved `eax`.
//! User errors never panic the kernel.

pub mod uaccess;

use crate::{
    KernelError,
    addressing::Va,
    arch::IntrFrame,
    fs::FileHandle,
    kernel::Kernel,
    process::{self, current_process},
    thread::Tid,
};
use alloc::vec;
use num_enum::TryFromPrimitive;
use uaccess::{UserBytesRO, UserBytesWO, UserCString, UserPtrRO, UserPtrWO};

/// Longest accepted path or command line argument to a syscall, in bytes.
const STR_MAX: usize = 4096;

/// I/O chunk size for file reads and writes.
const IO_CHUNK: usize = 0x1000;

/// System call numbers.
#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive)]
#[repr(u32)]
pub enum SyscallNumber {
    /// Terminate this process.
    Exit = 1,
    /// Start another process.
    Exec = 2,
    /// Wait for a child process to die.
    Wait = 3,
    /// Open a file.
    Open = 6,
    /// Obtain a file's size.
    Filesize = 7,
    /// Read from a file.
    Read = 8,
    /// Write to a file.
    Write = 9,
    /// Change position in a file.
    Seek = 10,
    /// Report current position in a file.
    Tell = 11,
    /// Close a file.
    Close = 12,
    /// Create a user thread in this process.
    PthreadCreate = 13,
    /// Terminate the calling user thread.
    PthreadExit = 14,
    /// Wait for a user thread of this process to exit.
    PthreadJoin = 15,
    /// Register a kernel-backed lock, returning its handle.
    LockInit = 16,
    /// Acquire a registered lock.
    LockAcquire = 17,
    /// Release a registered lock.
    LockRelease = 18,
    /// Register a kernel-backed semaphore, returning its handle.
    SemaInit = 19,
    /// Up a registered semaphore.
    SemaUp = 20,
    /// Down a registered semaphore.
    SemaDown = 21,
    /// The calling thread's id.
    GetTid = 22,
}

/// Handles the system call described by `frame`, leaving the result in
/// `frame.eax`.
pub fn dispatch(kernel: &'static Kernel, frame: &mut IntrFrame) {
    let result = dispatch_inner(kernel, frame);
    frame.eax = match result {
        Ok(v) => v as u32,
        Err(e) => e.into_isize() as u32,
    };
}

/// Reads syscall argument `idx` (0 is the number itself) off the user
/// stack.
fn arg(kernel: &Kernel, esp: u32, idx: usize) -> Result<u32, KernelError> {
    let addr = (esp as usize)
        .checked_add(4 * idx)
        .ok_or(KernelError::BadAddress)?;
    UserPtrRO::<u32>::new(addr)?.get(kernel)
}

fn dispatch_inner(kernel: &'static Kernel, frame: &mut IntrFrame) -> Result<usize, KernelError> {
    let esp = frame.esp;
    let number = SyscallNumber::try_from(arg(kernel, esp, 0)?)
        .map_err(|_| KernelError::NoSuchSyscall)?;
    match number {
        SyscallNumber::Exit => {
            let code = arg(kernel, esp, 1)? as i32;
            process::exit(kernel, code)
        }
        SyscallNumber::Exec => {
            let cmdline =
                UserCString::new(arg(kernel, esp, 1)? as usize)?.read(kernel, STR_MAX)?;
            process::execute(kernel, &cmdline).map(|tid| tid as usize)
        }
        SyscallNumber::Wait => {
            let pid = arg(kernel, esp, 1)? as i32;
            Ok(process::wait(kernel, pid) as isize as usize)
        }
        SyscallNumber::Open => sys_open(kernel, arg(kernel, esp, 1)? as usize),
        SyscallNumber::Filesize => {
            let fd = arg(kernel, esp, 1)? as i32;
            let file = lookup_fd(kernel, fd)?;
            Ok(file.size())
        }
        SyscallNumber::Read => sys_read(
            kernel,
            arg(kernel, esp, 1)? as i32,
            arg(kernel, esp, 2)? as usize,
            arg(kernel, esp, 3)? as usize,
        ),
        SyscallNumber::Write => sys_write(
            kernel,
            arg(kernel, esp, 1)? as i32,
            arg(kernel, esp, 2)? as usize,
            arg(kernel, esp, 3)? as usize,
        ),
        SyscallNumber::Seek => {
            let file = lookup_fd(kernel, arg(kernel, esp, 1)? as i32)?;
            file.seek(arg(kernel, esp, 2)? as usize);
            Ok(0)
        }
        SyscallNumber::Tell => {
            let file = lookup_fd(kernel, arg(kernel, esp, 1)? as i32)?;
            Ok(file.tell())
        }
        SyscallNumber::Close => sys_close(kernel, arg(kernel, esp, 1)? as i32),
        SyscallNumber::PthreadCreate => {
            let stub = Va::new(arg(kernel, esp, 1)? as usize).ok_or(KernelError::BadAddress)?;
            let entry = Va::new(arg(kernel, esp, 2)? as usize).ok_or(KernelError::BadAddress)?;
            let argument = arg(kernel, esp, 3)?;
            process::pthread_execute(kernel, stub, entry, argument).map(|tid| tid as usize)
        }
        SyscallNumber::PthreadExit => process::pthread_exit(kernel),
        SyscallNumber::PthreadJoin => {
            let tid = arg(kernel, esp, 1)? as Tid;
            process::pthread_join(kernel, tid).map(|tid| tid as usize)
        }
        SyscallNumber::LockInit => {
            let out = UserPtrWO::<u8>::new(arg(kernel, esp, 1)? as usize)?;
            let id = current_process(kernel)?.lock_create(kernel)?;
            out.put(kernel, id)?;
            Ok(1)
        }
        SyscallNumber::LockAcquire => {
            let id = UserPtrRO::<u8>::new(arg(kernel, esp, 1)? as usize)?.get(kernel)?;
            current_process(kernel)?.lock_acquire(kernel, id)
        }
        SyscallNumber::LockRelease => {
            let id = UserPtrRO::<u8>::new(arg(kernel, esp, 1)? as usize)?.get(kernel)?;
            current_process(kernel)?.lock_release(kernel, id)
        }
        SyscallNumber::SemaInit => {
            let out = UserPtrWO::<u8>::new(arg(kernel, esp, 1)? as usize)?;
            let value = arg(kernel, esp, 2)? as i32;
            let id = current_process(kernel)?.sema_create(kernel, value)?;
            out.put(kernel, id)?;
            Ok(1)
        }
        SyscallNumber::SemaUp => {
            let id = UserPtrRO::<u8>::new(arg(kernel, esp, 1)? as usize)?.get(kernel)?;
            current_process(kernel)?.sema_up(kernel, id)
        }
        SyscallNumber::SemaDown => {
            let id = UserPtrRO::<u8>::new(arg(kernel, esp, 1)? as usize)?.get(kernel)?;
            current_process(kernel)?.sema_down(kernel, id)
        }
        SyscallNumber::GetTid => Ok(kernel.current_tid() as usize),
    }
}

fn lookup_fd(kernel: &'static Kernel, fd: i32) -> Result<FileHandle, KernelError> {
    current_process(kernel)?.files.get(kernel, fd)
}

/// Opens a file for the calling process and installs a descriptor for it.
pub fn sys_open(kernel: &'static Kernel, name_addr: usize) -> Result<usize, KernelError> {
    let name = UserCString::new(name_addr)?.read(kernel, STR_MAX)?;
    let process = current_process(kernel)?;
    kernel.fs_lock().acquire(kernel);
    let node = kernel.fs_root().open(&name);
    kernel.fs_lock().release(kernel);
    let handle = FileHandle::new(node?);
    process.files.install(kernel, handle).map(|fd| fd as usize)
}

/// Closes a descriptor. The table lock nests inside the filesystem lock,
/// the same order the loader uses.
pub fn sys_close(kernel: &'static Kernel, fd: i32) -> Result<usize, KernelError> {
    let process = current_process(kernel)?;
    kernel.fs_lock().acquire(kernel);
    let r = process.files.close(kernel, fd);
    kernel.fs_lock().release(kernel);
    r.map(|_| 0)
}

/// Reads `len` bytes from `fd` into user memory at `buf_addr`.
///
/// Descriptor 0 reads console input; reading descriptor 1 is an error.
pub fn sys_read(
    kernel: &'static Kernel,
    fd: i32,
    buf_addr: usize,
    len: usize,
) -> Result<usize, KernelError> {
    match fd {
        0 => {
            let mut buf = vec![0u8; len];
            let n = kernel.console().read_bytes(&mut buf)?;
            UserBytesWO::new(buf_addr)?.write(kernel, &buf[..n])?;
            Ok(n)
        }
        1 => Err(KernelError::BadFileDescriptor),
        _ => {
            let file = lookup_fd(kernel, fd)?;
            let mut done = 0;
            let mut chunk = vec![0u8; IO_CHUNK];
            while done < len {
                let want = (len - done).min(IO_CHUNK);
                kernel.fs_lock().acquire(kernel);
                let n = file.read(&mut chunk[..want]);
                kernel.fs_lock().release(kernel);
                let n = n?;
                if n == 0 {
                    break;
                }
                UserBytesWO::new(buf_addr + done)?.write(kernel, &chunk[..n])?;
                done += n;
                if n < want {
                    break;
                }
            }
            Ok(done)
        }
    }
}

/// Writes `len` bytes of user memory at `buf_addr` to `fd`.
///
/// Descriptor 1 writes to the console; writing descriptor 0 is an error.
pub fn sys_write(
    kernel: &'static Kernel,
    fd: i32,
    buf_addr: usize,
    len: usize,
) -> Result<usize, KernelError> {
    match fd {
        0 => Err(KernelError::BadFileDescriptor),
        1 => {
            let buf = UserBytesRO::new(buf_addr, len)?.read(kernel)?;
            kernel.console().write_bytes(&buf)
        }
        _ => {
            let file = lookup_fd(kernel, fd)?;
            let mut done = 0;
            while done < len {
                let want = (len - done).min(IO_CHUNK);
                let chunk = UserBytesRO::new(buf_addr + done, want)?.read(kernel)?;
                kernel.fs_lock().acquire(kernel);
                let n = file.write(&chunk);
                kernel.fs_lock().release(kernel);
                let n = n?;
                done += n;
                if n < want {
                    break;
                }
            }
            Ok(done)
        }
    }
}
