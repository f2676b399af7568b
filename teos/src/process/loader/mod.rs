//! Executable loading.
//!
//! Turns an ELF file into a runnable address space: validates the image,
//! maps each loadable segment page by page (bytes from the file, the tail
//! zeroed), installs the initial user stack page just below the top of the
//! address space, packs `argv` onto it, and leaves the entry point and
//! stack pointer in the user frame. The executable stays open with writes
//! denied until process exit, so the on-disk image cannot change under the
//! running program.
//!
//! On any failure the half-built mappings unwind with the page directory;
//! the file closes when the handle drops.
//!
//! The initial stack, from the final `esp` upward: a null fake return
//! address, `argc`, `argv`, the `argv[0..argc]` pointers, a null sentinel,
//! alignment padding, then the argument strings themselves at the top.
//! `esp + 4` lands on a 16-byte boundary.

pub mod elf;
pub mod stack_builder;

use super::Process;
use crate::{
    KernelError,
    addressing::{PAGE_MASK, PAGE_SIZE, USER_TOP, Va},
    arch::IntrFrame,
    fs::FileHandle,
    kernel::Kernel,
    mm::{Page, page_table::PageTable},
};
use alloc::vec::Vec;
use elf::{Elf, PType, Phdr};
use stack_builder::StackBuilder;

/// Most argv entries a command line may carry.
pub const MAX_ARGS: usize = 50;

/// Loads the executable named by `cmdline`'s first token into `process`
/// and prepares `frame` for user-mode entry. The whole load runs under the
/// global filesystem lock.
pub fn load(
    kernel: &'static Kernel,
    process: &Process,
    frame: &mut IntrFrame,
    cmdline: &str,
) -> Result<(), KernelError> {
    let argv: Vec<&str> = cmdline.split_whitespace().collect();
    if argv.is_empty() || argv.len() > MAX_ARGS {
        return Err(KernelError::InvalidArgument);
    }
    kernel.fs_lock().acquire(kernel);
    let result = load_locked(kernel, process, frame, &argv);
    kernel.fs_lock().release(kernel);
    result
}

fn load_locked(
    kernel: &'static Kernel,
    process: &Process,
    frame: &mut IntrFrame,
    argv: &[&str],
) -> Result<(), KernelError> {
    let node = kernel.fs_root().open(argv[0])?;
    let file = FileHandle::new(node);
    let elf = Elf::from_file(&file)?;

    let mut pd = process.pagedir.borrow_mut();
    let pd = pd.as_mut().ok_or(KernelError::NoSuchEntry)?;

    for phdr in elf.phdrs()? {
        match phdr.ptype() {
            PType::Null | PType::Note | PType::Phdr | PType::Stack | PType::Unknown => {}
            PType::Dynamic | PType::Interp | PType::Shlib => return Err(KernelError::NoExec),
            PType::Load => {
                validate_segment(&phdr, file.size())?;
                load_segment(kernel, pd, &file, &phdr)?;
            }
        }
    }

    setup_stack(kernel, pd)?;
    let esp = push_arguments(pd, argv)?;
    frame.set_entry(Va::new(elf.header.e_entry as usize).ok_or(KernelError::NoExec)?);
    frame.set_stack(esp);

    file.deny_write();
    *process.exec_file.borrow_mut() = Some(file);
    Ok(())
}

/// The sanity rules a loadable segment must satisfy.
fn validate_segment(phdr: &Phdr, file_len: usize) -> Result<(), KernelError> {
    let ok = (phdr.p_offset as usize & PAGE_MASK) == (phdr.p_vaddr as usize & PAGE_MASK)
        && phdr.p_offset as usize <= file_len
        && phdr.p_memsz >= phdr.p_filesz
        && phdr.p_filesz > 0
        && phdr.p_vaddr as usize >= PAGE_SIZE
        && (phdr.p_vaddr as usize)
            .checked_add(phdr.p_memsz as usize)
            .map(|end| end <= USER_TOP)
            .unwrap_or(false);
    if ok { Ok(()) } else { Err(KernelError::NoExec) }
}

/// Maps one segment: file bytes first, the tail zeroed to a page
/// boundary, page writability from `PF_W`.
fn load_segment(
    kernel: &'static Kernel,
    pd: &mut PageTable,
    file: &FileHandle,
    phdr: &Phdr,
) -> Result<(), KernelError> {
    let page_offset = phdr.p_vaddr as usize & PAGE_MASK;
    let mut upage = phdr.p_vaddr as usize - page_offset;
    let mut file_ofs = phdr.p_offset as usize - page_offset;
    let mut read_bytes = page_offset + phdr.p_filesz as usize;
    let mut zero_bytes =
        ((page_offset + phdr.p_memsz as usize + PAGE_MASK) & !PAGE_MASK) - read_bytes;

    while read_bytes > 0 || zero_bytes > 0 {
        let page_read = read_bytes.min(PAGE_SIZE);
        let page_zero = PAGE_SIZE - page_read;

        let mut page = Page::try_new(kernel)?;
        if page_read > 0 {
            let n = file.read_at(file_ofs, &mut page.inner_mut()[..page_read])?;
            if n != page_read {
                return Err(KernelError::NoExec);
            }
        }
        // The allocator hands out zeroed pages; the tail needs no work.
        pd.map(
            Va::new(upage).ok_or(KernelError::NoExec)?,
            page,
            phdr.writable(),
        )
        .map_err(|_| KernelError::NoExec)?;

        read_bytes -= page_read;
        zero_bytes -= page_zero.min(zero_bytes);
        file_ofs += PAGE_SIZE;
        upage += PAGE_SIZE;
    }
    Ok(())
}

/// Maps one zeroed, writable page at the very top of the user address
/// space; the initial `esp` is the top itself.
fn setup_stack(kernel: &'static Kernel, pd: &mut PageTable) -> Result<(), KernelError> {
    let page = Page::try_new(kernel)?;
    pd.map(Va::new(USER_TOP - PAGE_SIZE).unwrap(), page, true)
}

/// Packs `argv` onto the stack per the 32-bit System V convention.
///
/// String bodies go in first (last argument highest), then padding chosen
/// so that the null sentinel, the `argc` pointers, `argv` and `argc`
/// together end on a 16-byte boundary, then those words, then the null
/// fake return address.
fn push_arguments(pd: &mut PageTable, argv: &[&str]) -> Result<Va, KernelError> {
    let mut builder = StackBuilder::new(pd);
    let argc = argv.len();

    let mut arg_ptrs = alloc::vec![Va::new(0).unwrap(); argc];
    for (i, arg) in argv.iter().enumerate().rev() {
        arg_ptrs[i] = builder.push_str(arg)?;
    }

    // sentinel + argv[argc-1..0] + argv + argc
    builder.align_for(argc + 3);
    builder.push_u32(0)?;
    for ptr in arg_ptrs.iter().rev() {
        builder.push_u32(ptr.into_usize() as u32)?;
    }
    let argv_base = builder.sp();
    builder.push_u32(argv_base.into_usize() as u32)?;
    builder.push_u32(argc as u32)?;
    builder.push_u32(0)?;
    Ok(builder.finish())
}
