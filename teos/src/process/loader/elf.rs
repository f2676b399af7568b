//! ELF executable parsing.
//!
//! The loader accepts 32-bit little-endian ELF executables for the user
//! ISA, statically linked, and reads nothing beyond the ELF header and the
//! program header table; sections are a linker concern. Anything that
//! smells of dynamic linking is rejected outright.

use crate::{KernelError, fs::FileHandle};
use alloc::{vec, vec::Vec};

/// Accepted machine id: EM_386.
const EM_386: u16 = 3;
/// Accepted object type: ET_EXEC.
const ET_EXEC: u16 = 2;
/// Size of an ELF32 program header entry.
const PHDR_SIZE: usize = 32;
/// Upper bound on program header count.
const PHDR_MAX: u16 = 1024;

/// The ELF32 file header.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ElfHeader {
    /// `0x7f` followed by `"ELF"`.
    pub magic: [u8; 4],
    /// 1 for 32-bit objects.
    pub class: u8,
    /// 1 for little-endian encoding.
    pub data: u8,
    /// Ident version, always 1.
    pub version: u8,
    /// OS ABI; ignored.
    pub abi: u8,
    /// ABI version; ignored.
    pub abi_version: u8,
    /// Reserved padding.
    pub pad: [u8; 7],
    /// Object type.
    pub e_type: u16,
    /// Target machine.
    pub e_machine: u16,
    /// Object version, always 1.
    pub e_version: u32,
    /// Entry point virtual address.
    pub e_entry: u32,
    /// Program header table offset.
    pub e_phoff: u32,
    /// Section header table offset; ignored.
    pub e_shoff: u32,
    /// Machine flags; ignored.
    pub e_flags: u32,
    /// Size of this header.
    pub e_ehsize: u16,
    /// Size of one program header entry.
    pub e_phentsize: u16,
    /// Number of program header entries.
    pub e_phnum: u16,
    /// Size of one section header entry; ignored.
    pub e_shentsize: u16,
    /// Number of section header entries; ignored.
    pub e_shnum: u16,
    /// Section name string table index; ignored.
    pub e_shstrndx: u16,
}

/// An ELF32 program header entry.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Phdr {
    /// Segment type.
    pub p_type: u32,
    /// Offset of the segment in the file.
    pub p_offset: u32,
    /// Virtual address the segment is mapped at.
    pub p_vaddr: u32,
    /// Physical address; ignored.
    pub p_paddr: u32,
    /// Bytes of the segment present in the file.
    pub p_filesz: u32,
    /// Bytes of the segment in memory.
    pub p_memsz: u32,
    /// Segment permission flags.
    pub p_flags: u32,
    /// Alignment; ignored beyond validation elsewhere.
    pub p_align: u32,
}

/// Program header types the loader distinguishes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PType {
    /// Unused entry.
    Null,
    /// Loadable segment.
    Load,
    /// Dynamic linking information.
    Dynamic,
    /// Interpreter path.
    Interp,
    /// Auxiliary information.
    Note,
    /// Reserved.
    Shlib,
    /// The program header table itself.
    Phdr,
    /// Stack attributes.
    Stack,
    /// Anything else.
    Unknown,
}

impl Phdr {
    /// This entry's type.
    pub fn ptype(&self) -> PType {
        match self.p_type {
            0 => PType::Null,
            1 => PType::Load,
            2 => PType::Dynamic,
            3 => PType::Interp,
            4 => PType::Note,
            5 => PType::Shlib,
            6 => PType::Phdr,
            0x6474_e551 => PType::Stack,
            _ => PType::Unknown,
        }
    }

    /// Whether the segment is writable (`PF_W`).
    pub fn writable(&self) -> bool {
        self.p_flags & PFlags::WRITE.bits() != 0
    }
}

bitflags::bitflags! {
    /// ELF segment permission flags.
    pub struct PFlags: u32 {
        /// Segment is executable.
        const EXECUTABLE = 1 << 0;
        /// Segment is writable.
        const WRITE = 1 << 1;
        /// Segment is readable.
        const READ = 1 << 2;
    }
}

/// A validated ELF executable backed by an open file.
pub struct Elf<'a> {
    /// The parsed file header.
    pub header: ElfHeader,
    /// The backing file.
    pub file: &'a FileHandle,
}

impl<'a> Elf<'a> {
    /// Parses and validates the header of `file`.
    ///
    /// Rejects anything that is not a 32-bit little-endian static
    /// executable for the user ISA with a sane program header table.
    pub fn from_file(file: &'a FileHandle) -> Result<Self, KernelError> {
        union HeaderBytes {
            raw: [u8; core::mem::size_of::<ElfHeader>()],
            header: ElfHeader,
        }
        let mut u = HeaderBytes {
            raw: [0; core::mem::size_of::<ElfHeader>()],
        };
        let n = file.read_at(0, unsafe { &mut u.raw })?;
        if n < core::mem::size_of::<ElfHeader>() {
            return Err(KernelError::NoExec);
        }
        let header = unsafe { u.header };

        if &header.magic != b"\x7fELF"
            || header.class != 1
            || header.data != 1
            || header.version != 1
            || header.e_type != ET_EXEC
            || header.e_machine != EM_386
            || header.e_version != 1
            || header.e_phentsize as usize != PHDR_SIZE
            || header.e_phnum > PHDR_MAX
        {
            return Err(KernelError::NoExec);
        }
        Ok(Self { header, file })
    }

    /// Reads the program header table.
    pub fn phdrs(&self) -> Result<Vec<Phdr>, KernelError> {
        union PhdrBytes {
            raw: [u8; PHDR_SIZE],
            phdr: Phdr,
        }
        let count = self.header.e_phnum as usize;
        let mut buffer = vec![0u8; count * PHDR_SIZE];
        let n = self.file.read_at(self.header.e_phoff as usize, &mut buffer)?;
        if n < buffer.len() {
            return Err(KernelError::NoExec);
        }
        Ok(buffer
            .chunks_exact(PHDR_SIZE)
            .map(|chunk| {
                let mut u = PhdrBytes { raw: [0; PHDR_SIZE] };
                unsafe {
                    u.raw.copy_from_slice(chunk);
                    u.phdr
                }
            })
            .collect())
    }
}
