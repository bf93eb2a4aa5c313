//! aarch64 context switching (not yet implemented)
//!
//! The x86_64 module is the reference; the aarch64 port needs x19-x28,
//! fp, lr, sp and d8-d15 saved per AAPCS64.

/// Callee-saved register set of a suspended fiber (AAPCS64).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Registers {
    pub sp: u64,
    pub pc: u64,
    pub x19_x28: [u64; 10],
    pub fp: u64,
    pub lr: u64,
    pub d8_d15: [u64; 8],
}

/// # Safety
///
/// Same contract as the x86_64 implementation.
pub unsafe fn init_context(
    _regs: *mut Registers,
    _stack_top: *mut u8,
    _entry_fn: usize,
    _entry_arg: usize,
) {
    todo!("aarch64 context init")
}

/// # Safety
///
/// Same contract as the x86_64 implementation.
pub unsafe extern "C" fn context_switch(_old_regs: *mut Registers, _new_regs: *const Registers) {
    todo!("aarch64 context switch")
}
