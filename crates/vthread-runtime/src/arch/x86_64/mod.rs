//! x86_64 (System V) context switch

use super::EntryFn;
use std::arch::naked_asm;

/// Saved execution context
///
/// Field order is fixed by the offsets used in `switch_context`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MachineContext {
    rsp: u64, // 0x00
    rip: u64, // 0x08
    rbx: u64, // 0x10
    rbp: u64, // 0x18
    r12: u64, // 0x20
    r13: u64, // 0x28
    r14: u64, // 0x30
    r15: u64, // 0x38
}

impl MachineContext {
    #[inline]
    pub fn stack_pointer(&self) -> usize {
        self.rsp as usize
    }

    #[inline]
    pub fn instruction_pointer(&self) -> usize {
        self.rip as usize
    }

    /// Redirect the next switch into this context to `ip`
    #[inline]
    pub fn set_instruction_pointer(&mut self, ip: usize) {
        self.rip = ip as u64;
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
    // The trampoline's `call` pushes the return address, leaving the
    // callee with the ABI's entry alignment of rsp % 16 == 8.
    *ctx = MachineContext {
        rsp: (stack_top & !0xF) as u64,
        rip: entry_trampoline as usize as u64,
        r12: entry as usize as u64,
        r13: arg as u64,
        ..MachineContext::default()
    };
}

#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!("mov rdi, r13", "call r12", "ud2");
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
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        "mov rsp, [rsi + 0x00]",
        "mov rcx, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "mov rax, rdx",
        "jmp rcx",
        "2:",
        "ret",
    );
}
