//! Shared scaffolding for the scenario tests.
//!
//! Each test boots its own kernel. User programs are supplied through the
//! kernel's user-mode entry seam: the test installs a closure that plays
//! the role of the CPU running ring-3 code. It receives the fabricated
//! interrupt frame, reads its arguments back out of user memory through
//! the real `uaccess` layer, and drives the real syscall surface.

#![allow(dead_code)]

use std::cell::RefCell;
use std::sync::Arc;

use teos::arch::IntrFrame;
use teos::console::Sink;
use teos::kernel::Kernel;
use teos::syscall::uaccess::{self, UserCString, UserPtrRO};

struct CaptureInner {
    out: RefCell<String>,
}

/// A console sink that captures everything written to it.
#[derive(Clone)]
pub struct Capture(Arc<CaptureInner>);

impl Capture {
    pub fn new() -> Self {
        Capture(Arc::new(CaptureInner {
            out: RefCell::new(String::new()),
        }))
    }

    pub fn contents(&self) -> String {
        self.0.out.borrow().clone()
    }
}

impl Sink for Capture {
    fn write_str(&self, s: &str) {
        self.0.out.borrow_mut().push_str(s);
    }
}

/// One loadable segment of a synthetic executable.
pub struct Seg {
    pub vaddr: u32,
    pub data: Vec<u8>,
    pub memsz: u32,
    pub flags: u32,
    pub ptype: u32,
}

impl Seg {
    /// A read-only code segment holding `data`.
    pub fn code(vaddr: u32, data: &[u8]) -> Self {
        Self {
            vaddr,
            data: data.to_vec(),
            memsz: data.len() as u32,
            flags: 0x5, // r-x
            ptype: 1,
        }
    }

    /// A writable data segment with a zeroed tail up to `memsz`.
    pub fn data(vaddr: u32, data: &[u8], memsz: u32) -> Self {
        Self {
            vaddr,
            data: data.to_vec(),
            memsz,
            flags: 0x6, // rw-
            ptype: 1,
        }
    }
}

const PAGE: u32 = 0x1000;
const EHDR_SIZE: u32 = 52;
const PHDR_SIZE: u32 = 32;

/// Builds a 32-bit little-endian static executable image from `segs`,
/// entering at `entry`.
pub fn build_elf(entry: u32, segs: &[Seg]) -> Vec<u8> {
    build_elf_with(entry, segs, |_| {})
}

/// Same as [`build_elf`], with a final chance to corrupt the header for
/// negative tests.
pub fn build_elf_with(entry: u32, segs: &[Seg], patch: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
    // Lay out file offsets so every segment's offset is page-congruent
    // with its vaddr.
    let mut cursor = EHDR_SIZE + PHDR_SIZE * segs.len() as u32;
    let offsets: Vec<u32> = segs
        .iter()
        .map(|seg| {
            let aligned = (cursor + PAGE - 1) & !(PAGE - 1);
            let off = aligned + (seg.vaddr & (PAGE - 1));
            cursor = off + seg.data.len() as u32;
            off
        })
        .collect();

    let mut image = Vec::new();
    // ELF header.
    image.extend_from_slice(b"\x7fELF");
    image.push(1); // ELFCLASS32
    image.push(1); // little endian
    image.push(1); // ident version
    image.push(0); // abi
    image.push(0); // abi version
    image.extend_from_slice(&[0u8; 7]);
    image.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    image.extend_from_slice(&3u16.to_le_bytes()); // EM_386
    image.extend_from_slice(&1u32.to_le_bytes()); // version
    image.extend_from_slice(&entry.to_le_bytes());
    image.extend_from_slice(&EHDR_SIZE.to_le_bytes()); // phoff
    image.extend_from_slice(&0u32.to_le_bytes()); // shoff
    image.extend_from_slice(&0u32.to_le_bytes()); // flags
    image.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
    image.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
    image.extend_from_slice(&(segs.len() as u16).to_le_bytes());
    image.extend_from_slice(&0u16.to_le_bytes());
    image.extend_from_slice(&0u16.to_le_bytes());
    image.extend_from_slice(&0u16.to_le_bytes());

    for (seg, off) in segs.iter().zip(&offsets) {
        image.extend_from_slice(&seg.ptype.to_le_bytes());
        image.extend_from_slice(&off.to_le_bytes());
        image.extend_from_slice(&seg.vaddr.to_le_bytes());
        image.extend_from_slice(&seg.vaddr.to_le_bytes()); // paddr
        image.extend_from_slice(&(seg.data.len() as u32).to_le_bytes());
        image.extend_from_slice(&seg.memsz.to_le_bytes());
        image.extend_from_slice(&seg.flags.to_le_bytes());
        image.extend_from_slice(&PAGE.to_le_bytes());
    }

    for (seg, off) in segs.iter().zip(&offsets) {
        image.resize(*off as usize, 0);
        image.extend_from_slice(&seg.data);
    }
    patch(&mut image);
    image
}

/// A boring one-segment executable entering at [`ENTRY`].
pub fn trivial_elf() -> Vec<u8> {
    build_elf(ENTRY, &[Seg::code(ENTRY, b"\x90\x90\x90\x90")])
}

/// Entry point used by the synthetic executables.
pub const ENTRY: u32 = 0x0804_8000;

/// The name of the running process, as user code would know itself.
pub fn current_name(kernel: &'static Kernel) -> String {
    teos::process::current_process(kernel)
        .map(|p| p.name.as_str().to_string())
        .unwrap_or_default()
}

/// Reads `argc` and the `argv` strings back off the user stack.
pub fn read_args(kernel: &'static Kernel, frame: &IntrFrame) -> (u32, Vec<String>) {
    let esp = frame.esp as usize;
    let argc = UserPtrRO::<u32>::new(esp + 4)
        .unwrap()
        .get(kernel)
        .expect("argc unreadable");
    let argv = UserPtrRO::<u32>::new(esp + 8)
        .unwrap()
        .get(kernel)
        .expect("argv unreadable");
    let mut args = Vec::new();
    for i in 0..argc {
        let ptr = UserPtrRO::<u32>::new(argv as usize + 4 * i as usize)
            .unwrap()
            .get(kernel)
            .expect("argv entry unreadable");
        args.push(
            UserCString::new(ptr as usize)
                .unwrap()
                .read(kernel, 4096)
                .expect("argument string unreadable"),
        );
    }
    (argc, args)
}

/// Writes `bytes` into the current process's user memory.
pub fn upoke(kernel: &'static Kernel, addr: usize, bytes: &[u8]) {
    uaccess::UserBytesWO::new(addr)
        .unwrap()
        .write(kernel, bytes)
        .expect("user memory unwritable");
}

/// Reads a `u32` from the current process's user memory.
pub fn upeek_u32(kernel: &'static Kernel, addr: usize) -> u32 {
    UserPtrRO::<u32>::new(addr)
        .unwrap()
        .get(kernel)
        .expect("user memory unreadable")
}
