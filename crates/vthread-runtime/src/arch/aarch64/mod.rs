//! aarch64 (AAPCS64) context switch
//!
//! Saves x19-x28, the frame pointer, the link register and the low halves
//! of v8-v15, which are callee-saved.

use super::EntryFn;
use std::arch::naked_asm;

/// Saved execution context
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MachineContext {
    sp: u64,            // 0x00
    pc: u64,            // 0x08
    x19_x28: [u64; 10], // 0x10
    fp: u64,            // 0x60
    lr: u64,            // 0x68
    d8_d15: [u64; 8],   // 0x70
}

impl MachineContext {
    #[inline]
    pub fn stack_pointer(&self) -> usize {
        self.sp as usize
    }

    #[inline]
    pub fn instruction_pointer(&self) -> usize {
        self.pc as usize
    }

    /// Redirect the next switch into this context to `ip`
    #[inline]
    pub fn set_instruction_pointer(&mut self, ip: usize) {
        self.pc = ip as u64;
    }
}

/// Prepare `ctx` so that switching to it calls `entry(arg)` on the stack
/// ending at `stack_top`
///
/// # Safety
///
/// `stack_top` must be the high end of a writable stack region that outlives
/// every switch into `ctx`.
pub unsafe fn init_context(ctx: &mut MachineContext, stack_top: usize, entry: EntryFn, arg: usize) {
    let mut regs = [0u64; 10];
    regs[0] = entry as usize as u64;
    regs[1] = arg as u64;
    *ctx = MachineContext {
        sp: (stack_top & !0xF) as u64,
        pc: entry_trampoline as usize as u64,
        x19_x28: regs,
        ..MachineContext::default()
    };
}

#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!("mov x0, x20", "blr x19", "brk #1");
}

/// Save the current context into `save`, then resume `load`
///
/// Returns `value` passed by whichever `switch_context` later resumes `save`.
///
/// # Safety
///
/// `load` must hold a context produced by `init_context` or by a previous
/// `switch_context` whose stack is still intact.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(
    _save: *mut MachineContext,
    _load: *const MachineContext,
    _value: usize,
) -> usize {
    naked_asm!(
        "mov x9, sp",
        "adr x10, 2f",
        "stp x9, x10, [x0, #0x00]",
        "stp x19, x20, [x0, #0x10]",
        "stp x21, x22, [x0, #0x20]",
        "stp x23, x24, [x0, #0x30]",
        "stp x25, x26, [x0, #0x40]",
        "stp x27, x28, [x0, #0x50]",
        "stp x29, x30, [x0, #0x60]",
        "stp d8, d9, [x0, #0x70]",
        "stp d10, d11, [x0, #0x80]",
        "stp d12, d13, [x0, #0x90]",
        "stp d14, d15, [x0, #0xa0]",
        "ldp x9, x10, [x1, #0x00]",
        "ldp x19, x20, [x1, #0x10]",
        "ldp x21, x22, [x1, #0x20]",
        "ldp x23, x24, [x1, #0x30]",
        "ldp x25, x26, [x1, #0x40]",
        "ldp x27, x28, [x1, #0x50]",
        "ldp x29, x30, [x1, #0x60]",
        "ldp d8, d9, [x1, #0x70]",
        "ldp d10, d11, [x1, #0x80]",
        "ldp d12, d13, [x1, #0x90]",
        "ldp d14, d15, [x1, #0xa0]",
        "mov sp, x9",
        "mov x0, x2",
        "br x10",
        "2:",
        "ret",
    );
}
