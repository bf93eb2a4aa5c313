//! x86_64 context switching implementation
//!
//! Uses inline assembly for context switch.
//! Now stable in Rust 1.88+

use std::arch::naked_asm;

/// Callee-saved register set of a suspended fiber (System V AMD64).
///
/// Field order is fixed; the assembly below addresses fields by byte offset.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Registers {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

/// Initialize a fresh fiber context
///
/// Sets up the register set so that when switched to, execution begins at
/// `entry_fn(entry_arg)` on the given stack.
///
/// # Safety
///
/// `regs` must point to valid `Registers` memory. `stack_top` must be the
/// high end of a live, writable stack mapping.
#[inline]
pub unsafe fn init_context(
    regs: *mut Registers,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    // Align to 16 bytes; the trampoline's `call` then leaves rsp at
    // entry % 16 == 8 as the System V AMD64 ABI expects.
    let aligned_sp = (stack_top as usize) & !0xF;

    let regs = &mut *regs;
    regs.rsp = aligned_sp as u64;
    regs.rip = fiber_entry_trampoline as usize as u64;
    regs.rbx = 0;
    regs.rbp = 0;
    regs.r12 = entry_fn as u64; // Entry function
    regs.r13 = entry_arg as u64; // Entry argument
    regs.r14 = 0;
    regs.r15 = 0;
}

/// Trampoline that calls the entry function with its argument
///
/// The entry function performs the final switch away itself and never
/// returns here; `ud2` faults immediately if it somehow does.
#[unsafe(naked)]
pub unsafe extern "C" fn fiber_entry_trampoline() {
    naked_asm!("mov rdi, r13", "call r12", "ud2",);
}

/// Perform a voluntary context switch
///
/// Saves callee-saved registers to `old_regs` and loads from `new_regs`.
/// Returns (into the old context) only when something later switches back.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old_regs: *mut Registers, _new_regs: *const Registers) {
    naked_asm!(
        // Save callee-saved registers to old_regs (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from new_regs (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to new RIP
        "jmp rax",
        // Return point for saved context
        "1:",
        "ret",
    );
}
