//! Architecture-specific context capture and transfer
//!
//! Each backend provides:
//!
//! - `MachineContext`: saved stack pointer, resume address and callee-saved
//!   registers
//! - `init_context`: prepare a context that starts `entry(arg)` on a fresh stack
//! - `switch_context`: save the current context, load another, and hand it a
//!   value that its own earlier `switch_context` call returns
//!
//! Only callee-saved state is kept: every transfer happens at a call
//! boundary, so the compiler has already spilled everything else.

/// Entry point of a fresh context; must never return
pub type EntryFn = extern "C" fn(usize) -> !;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use self::x86_64::{init_context, switch_context, MachineContext};
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use self::aarch64::{init_context, switch_context, MachineContext};
    } else {
        compile_error!("vthread-runtime supports x86_64 and aarch64 only");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vthread_core::constants::DEFAULT_STACK_SIZE;

    struct Pingpong {
        main: MachineContext,
        coro: MachineContext,
        seen: Vec<usize>,
    }

    extern "C" fn bounce(arg: usize) -> ! {
        let pp = arg as *mut Pingpong;
        unsafe {
            let mut v = 1;
            loop {
                let got = switch_context(&mut (*pp).coro, &(*pp).main, v);
                (*pp).seen.push(got);
                v += 1;
            }
        }
    }

    #[test]
    fn test_switch_round_trip() {
        let mut stack = vec![0u8; DEFAULT_STACK_SIZE];
        let top = unsafe { stack.as_mut_ptr().add(stack.len()) } as usize;

        let mut pp = Box::new(Pingpong {
            main: MachineContext::default(),
            coro: MachineContext::default(),
            seen: Vec::new(),
        });
        let raw: *mut Pingpong = &mut *pp;

        unsafe {
            init_context(&mut (*raw).coro, top, bounce, raw as usize);
            assert_eq!(switch_context(&mut (*raw).main, &(*raw).coro, 0), 1);
            assert_eq!(switch_context(&mut (*raw).main, &(*raw).coro, 10), 2);
            assert_eq!(switch_context(&mut (*raw).main, &(*raw).coro, 20), 3);
        }
        assert_eq!(pp.seen, vec![10, 20]);
        // The coroutine is abandoned mid-loop; its stack is plain heap memory
        drop(stack);
    }

    #[test]
    fn test_init_context_aligns_stack() {
        let mut ctx = MachineContext::default();
        let top = 0x7fff_0000_1239usize;
        unsafe { init_context(&mut ctx, top, bounce, 0) };
        assert_eq!(ctx.stack_pointer() % 16, 0);
        assert!(ctx.stack_pointer() <= top);
        assert_ne!(ctx.instruction_pointer(), 0);
    }
}
