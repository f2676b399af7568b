//! Architecture seam.
//!
//! Everything the kernel needs from the machine is concentrated here:
//!
//! - The **context switch**: a stack-switch trampoline that saves the
//!   callee-saved registers of the outgoing thread, swaps stack pointers,
//!   and restores the incoming thread's registers. The trampoline tail-jumps
//!   into [`thread::finish_context_switch`] with the outgoing thread as its
//!   argument, which is what lets the next thread dispose of a dying
//!   predecessor after the switch has fully completed.
//! - The **logical interrupt frame** ([`IntrFrame`]) describing a user-mode
//!   CPU state for the 32-bit user ISA: segment selectors, general
//!   registers, `eip`/`esp`/`eflags`, and the FPU save area. Jumping to
//!   user mode is performed by fabricating such a frame and handing it to
//!   the platform's interrupt-return path, which is injected at boot (see
//!   [`KernelBuilder::user_entry`]).
//!
//! The trampoline depends on one layout contract: the saved stack pointer
//! is the **first field** of `Thread`, so the address of that slot is the
//! address of the thread itself.
//!
//! [`thread::finish_context_switch`]: crate::thread
//! [`KernelBuilder::user_entry`]: crate::kernel::KernelBuilder::user_entry

use crate::addressing::Va;

#[cfg(target_arch = "x86_64")]
use core::arch::naked_asm;

/// Kernel code segment selector.
pub const SEL_KCSEG: u16 = 0x08;
/// Kernel data segment selector.
pub const SEL_KDSEG: u16 = 0x10;
/// User code segment selector.
pub const SEL_UCSEG: u16 = 0x1b;
/// User data segment selector.
pub const SEL_UDSEG: u16 = 0x23;

bitflags::bitflags! {
    /// EFLAGS register bits the kernel cares about.
    pub struct Eflags: u32 {
        /// Must-be-set bit 1.
        const MBS = 1 << 1;
        /// Interrupt enable flag.
        const IF = 1 << 9;
    }
}

/// Size of the FPU save area of an interrupt frame, in bytes.
pub const FPU_STATE_SIZE: usize = 108;

/// The logical interrupt frame for user-mode entry and syscall handling.
///
/// This is the register state a user thread has between kernel entries: the
/// general registers, the segment selectors, and the `eip`/`eflags`/`esp`
/// triple the interrupt-return path consumes. The loader fabricates one of
/// these to make the first entry into user mode look like a return from an
/// interrupt.
#[repr(C)]
#[derive(Clone)]
pub struct IntrFrame {
    /// FPU/x87 state, in FNSAVE layout.
    pub fpu: [u8; FPU_STATE_SIZE],
    /// General register EDI.
    pub edi: u32,
    /// General register ESI.
    pub esi: u32,
    /// General register EBP.
    pub ebp: u32,
    /// General register EBX.
    pub ebx: u32,
    /// General register EDX.
    pub edx: u32,
    /// General register ECX.
    pub ecx: u32,
    /// General register EAX, the syscall return slot.
    pub eax: u32,
    /// Data segment selectors.
    pub ds: u16,
    /// Extra segment selector.
    pub es: u16,
    /// Instruction pointer.
    pub eip: u32,
    /// Code segment selector.
    pub cs: u16,
    /// EFLAGS image.
    pub eflags: u32,
    /// User stack pointer.
    pub esp: u32,
    /// Stack segment selector.
    pub ss: u16,
}

impl IntrFrame {
    /// Builds the frame for a fresh entry into user mode: user code and
    /// data selectors, interrupts enabled, all general registers cleared.
    ///
    /// `eip` and `esp` are filled in by the loader once the executable and
    /// the user stack exist.
    pub fn new_user() -> Self {
        Self {
            fpu: [0; FPU_STATE_SIZE],
            edi: 0,
            esi: 0,
            ebp: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
            ds: SEL_UDSEG,
            es: SEL_UDSEG,
            eip: 0,
            cs: SEL_UCSEG,
            eflags: (Eflags::MBS | Eflags::IF).bits(),
            esp: 0,
            ss: SEL_UDSEG,
        }
    }

    /// Sets the instruction pointer.
    pub fn set_entry(&mut self, entry: Va) {
        self.eip = entry.into_usize() as u32;
    }

    /// Sets the user stack pointer.
    pub fn set_stack(&mut self, sp: Va) {
        self.esp = sp.into_usize() as u32;
    }

    /// Saves the current FPU state into the frame.
    ///
    /// The frame carries the initial x87 image a freshly initialized FPU
    /// would have: control word `0x037f`, empty tag word.
    pub fn save_fpu(&mut self) {
        self.fpu = [0; FPU_STATE_SIZE];
        self.fpu[0] = 0x7f;
        self.fpu[1] = 0x03;
        self.fpu[8] = 0xff;
        self.fpu[9] = 0xff;
    }
}

/// The stack image a thread is born with.
///
/// Three nested frames: the callee-saved registers the trampoline will pop,
/// the return into the entry thunk, and the closure pointer plus a null
/// return address for the thunk's landing function. Field order mirrors the
/// pop sequence of [`context_switch`].
#[repr(C)]
pub(crate) struct ContextSwitchFrame {
    pub r15: usize,
    pub r14: usize,
    pub r13: usize,
    pub r12: usize,
    pub rbx: usize,
    pub rbp: usize,
    /// Popped by the trampoline's final `ret`: the entry thunk.
    pub ret_addr: usize,
    /// Popped by the entry thunk into the first argument register.
    pub thread_fn: usize,
    /// Fake return address for the thread's landing function.
    pub end_of_stack: usize,
}

/// Switches from the current thread's stack to `next_sp`.
///
/// `prev_sp_slot` must point at the outgoing thread's saved-`sp` slot,
/// which by layout contract is the outgoing `Thread` itself; the trampoline
/// stores the outgoing stack pointer there and tail-jumps into
/// `finish_context_switch(prev)` on the incoming stack.
///
/// # Safety
/// Must be called with interrupts disabled, with `next_sp` pointing at a
/// stack image built by this module (either a [`ContextSwitchFrame`] or a
/// stack previously saved by this function).
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn context_switch(_prev_sp_slot: *mut usize, _next_sp: usize) {
    // RDI: outgoing sp slot (== outgoing Thread). RSI: incoming sp.
    // Flags need not be preserved; both sides run with interrupts off.
    naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        // RDI still holds the outgoing thread.
        "jmp {}",
        sym crate::thread::finish_context_switch,
    );
}

#[cfg(not(target_arch = "x86_64"))]
pub(crate) unsafe extern "C" fn context_switch(_prev_sp_slot: *mut usize, _next_sp: usize) {
    unimplemented!("context switching is only implemented for x86-64 hosts");
}

/// The very beginning of a thread: pops the closure pointer left on the
/// newborn stack and lands in `F`'s runner.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn thread_entry<F: FnOnce()>() -> ! {
    naked_asm!(
        "pop rdi",
        "jmp {}",
        sym crate::thread::thread_start::<F>,
    );
}

#[cfg(not(target_arch = "x86_64"))]
pub(crate) unsafe extern "C" fn thread_entry<F: FnOnce()>() -> ! {
    unimplemented!("context switching is only implemented for x86-64 hosts");
}
