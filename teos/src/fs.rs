//! Filesystem abstraction.
//!
//! The on-disk filesystem itself is not this kernel's concern; the kernel
//! sees it through the traits in [`traits`]: a [`traits::FileSystem`] opens
//! files by name, a [`traits::RegularFile`] is a byte array with positional
//! reads and writes and a write-denial count. The concrete implementation
//! is injected at boot; [`memfs`] provides a RAM-backed one used to seed
//! executables and data files.
//!
//! An open file is a [`FileHandle`]: a shared node plus a cursor. Handles
//! are what file-descriptor tables store and what the loader keeps (with
//! writes denied) for the lifetime of a running executable, so that the
//! on-disk image of a program cannot change underneath it.
//!
//! The underlying filesystem is not reentrant; every call into it must be
//! made with the kernel's global filesystem lock held (see
//! [`Kernel::fs_lock`]).
//!
//! [`Kernel::fs_lock`]: crate::kernel::Kernel::fs_lock

use crate::KernelError;
use alloc::sync::Arc;
use core::cell::Cell;

/// Traits the backing filesystem implements.
pub mod traits {
    use crate::KernelError;

    /// A filesystem: a flat namespace of regular files.
    pub trait FileSystem {
        /// Opens the file named `name`.
        fn open(&self, name: &str) -> Result<super::FileNode, KernelError>;
    }

    /// A regular file: a growable byte array.
    pub trait RegularFile {
        /// The size of the file in bytes.
        fn size(&self) -> usize;

        /// Reads from byte offset `pos` into `buf`, returning the number of
        /// bytes read. Reads past the end return 0.
        fn read_at(&self, pos: usize, buf: &mut [u8]) -> Result<usize, KernelError>;

        /// Writes `buf` at byte offset `pos`, growing the file if needed,
        /// and returns the number of bytes written. A file whose writes are
        /// denied reports 0 bytes written.
        fn write_at(&self, pos: usize, buf: &[u8]) -> Result<usize, KernelError>;

        /// Increments the file's write-denial count.
        fn deny_write(&self);

        /// Decrements the file's write-denial count.
        fn allow_write(&self);
    }
}

/// A reference-counted handle to a file node.
#[derive(Clone)]
pub struct FileNode(pub Arc<dyn traits::RegularFile>);

impl FileNode {
    /// Wraps a concrete file in a node handle.
    pub fn new(file: impl traits::RegularFile + 'static) -> Self {
        Self(Arc::new(file))
    }
}

struct OpenFile {
    node: FileNode,
    pos: Cell<usize>,
    denying: Cell<bool>,
}

impl Drop for OpenFile {
    fn drop(&mut self) {
        if self.denying.get() {
            self.node.0.allow_write();
        }
    }
}

/// An open file: a node plus a cursor.
///
/// Cloning a handle shares the cursor, which is the fd-duplication
/// behavior a descriptor table needs. Dropping the last clone releases the
/// write denial the handle may hold.
#[derive(Clone)]
pub struct FileHandle(Arc<OpenFile>);

impl FileHandle {
    /// Opens a handle on `node` with the cursor at 0.
    pub fn new(node: FileNode) -> Self {
        Self(Arc::new(OpenFile {
            node,
            pos: Cell::new(0),
            denying: Cell::new(false),
        }))
    }

    /// The size of the underlying file in bytes.
    pub fn size(&self) -> usize {
        self.0.node.0.size()
    }

    /// Reads at the cursor, advancing it by the number of bytes read.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, KernelError> {
        let n = self.0.node.0.read_at(self.0.pos.get(), buf)?;
        self.0.pos.set(self.0.pos.get() + n);
        Ok(n)
    }

    /// Reads at an explicit offset without touching the cursor.
    pub fn read_at(&self, pos: usize, buf: &mut [u8]) -> Result<usize, KernelError> {
        self.0.node.0.read_at(pos, buf)
    }

    /// Writes at the cursor, advancing it by the number of bytes written.
    pub fn write(&self, buf: &[u8]) -> Result<usize, KernelError> {
        let n = self.0.node.0.write_at(self.0.pos.get(), buf)?;
        self.0.pos.set(self.0.pos.get() + n);
        Ok(n)
    }

    /// Moves the cursor to `pos`.
    pub fn seek(&self, pos: usize) {
        self.0.pos.set(pos);
    }

    /// The current cursor position.
    pub fn tell(&self) -> usize {
        self.0.pos.get()
    }

    /// Denies writes to the underlying file for the lifetime of this
    /// handle. Idempotent per handle.
    pub fn deny_write(&self) {
        if !self.0.denying.replace(true) {
            self.0.node.0.deny_write();
        }
    }
}

/// A RAM-backed filesystem.
pub mod memfs {
    use super::{FileNode, traits};
    use crate::KernelError;
    use alloc::{
        collections::BTreeMap,
        string::{String, ToString},
        sync::Arc,
        vec::Vec,
    };
    use core::cell::{Cell, RefCell};

    /// A filesystem whose files live entirely in kernel memory.
    ///
    /// Seed it before boot with [`MemFs::add`], then hand it to
    /// [`KernelBuilder::filesystem`].
    ///
    /// [`KernelBuilder::filesystem`]: crate::kernel::KernelBuilder::filesystem
    pub struct MemFs {
        files: RefCell<BTreeMap<String, Arc<MemFile>>>,
    }

    impl MemFs {
        /// Creates an empty filesystem.
        pub fn new() -> Self {
            Self {
                files: RefCell::new(BTreeMap::new()),
            }
        }

        /// Creates (or replaces) the file `name` with `content`.
        pub fn add(&self, name: &str, content: &[u8]) {
            self.files.borrow_mut().insert(
                name.to_string(),
                Arc::new(MemFile {
                    data: RefCell::new(content.to_vec()),
                    deny: Cell::new(0),
                }),
            );
        }
    }

    impl traits::FileSystem for MemFs {
        fn open(&self, name: &str) -> Result<FileNode, KernelError> {
            self.files
                .borrow()
                .get(name)
                .cloned()
                .map(|f| FileNode(f as Arc<dyn traits::RegularFile>))
                .ok_or(KernelError::NoSuchEntry)
        }
    }

    struct MemFile {
        data: RefCell<Vec<u8>>,
        deny: Cell<usize>,
    }

    impl traits::RegularFile for MemFile {
        fn size(&self) -> usize {
            self.data.borrow().len()
        }

        fn read_at(&self, pos: usize, buf: &mut [u8]) -> Result<usize, KernelError> {
            let data = self.data.borrow();
            if pos >= data.len() {
                return Ok(0);
            }
            let n = buf.len().min(data.len() - pos);
            buf[..n].copy_from_slice(&data[pos..pos + n]);
            Ok(n)
        }

        fn write_at(&self, pos: usize, buf: &[u8]) -> Result<usize, KernelError> {
            if self.deny.get() > 0 {
                return Ok(0);
            }
            let mut data = self.data.borrow_mut();
            if pos + buf.len() > data.len() {
                data.resize(pos + buf.len(), 0);
            }
            data[pos..pos + buf.len()].copy_from_slice(buf);
            Ok(buf.len())
        }

        fn deny_write(&self) {
            self.deny.set(self.deny.get() + 1);
        }

        fn allow_write(&self) {
            self.deny.set(self.deny.get().saturating_sub(1));
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::fs::FileHandle;
        use crate::fs::traits::FileSystem;

        #[test]
        fn read_write_cursor() {
            let fs = MemFs::new();
            fs.add("a", b"hello");
            let h = FileHandle::new(fs.open("a").unwrap());
            let mut buf = [0u8; 3];
            assert_eq!(h.read(&mut buf).unwrap(), 3);
            assert_eq!(&buf, b"hel");
            assert_eq!(h.tell(), 3);
            h.seek(0);
            assert_eq!(h.write(b"HE").unwrap(), 2);
            let mut all = [0u8; 8];
            assert_eq!(h.read_at(0, &mut all).unwrap(), 5);
            assert_eq!(&all[..5], b"HEllo");
        }

        #[test]
        fn deny_write_blocks_writers_until_all_handles_drop() {
            let fs = MemFs::new();
            fs.add("x", b"abc");
            let exec = FileHandle::new(fs.open("x").unwrap());
            exec.deny_write();
            exec.deny_write(); // per-handle idempotent

            let other = FileHandle::new(fs.open("x").unwrap());
            assert_eq!(other.write(b"zzz").unwrap(), 0);

            drop(exec);
            assert_eq!(other.write(b"zzz").unwrap(), 3);
        }

        #[test]
        fn open_missing() {
            let fs = MemFs::new();
            assert!(fs.open("nope").is_err());
        }
    }
}
