/*
 * Architecture Layer
 *
 * The portable core calls a handful of privileged operations through
 * this module: the context switch, entering user mode, halting, and
 * power-off. On an i386 target the `x86` submodule supplies the real
 * thing; on any other build the operations reduce to inert stand-ins so
 * the core's state machine runs under test. The trap and interrupt
 * vectors themselves come from the platform layer outside this crate;
 * `x86::trap` holds the handler bodies they jump into.
 */

#[cfg(target_arch = "x86")]
pub mod x86;

/// Saved register context of a switched-out thread. The callee-saved
/// registers live on the thread's kernel stack; only the stack pointer
/// is kept here.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelContext {
    pub sp: usize,
}

#[cfg(target_arch = "x86")]
pub use x86::{context_switch, enter_user_mode, halt_until_interrupt, power_off, seed_context};

#[cfg(not(target_arch = "x86"))]
mod portable {
    use super::KernelContext;

    /// No second kernel stack to jump onto in a portable build; the
    /// scheduler has already updated its bookkeeping.
    ///
    /// # Safety
    /// Trivially safe here; the signature matches the target version.
    pub unsafe fn context_switch(_prev: Option<*mut KernelContext>, _next: *const KernelContext) {}

    pub fn halt_until_interrupt() {
        core::hint::spin_loop();
    }

    pub fn power_off() -> ! {
        panic!("power_off on a portable build");
    }

    pub fn enter_user_mode(_entry: u32, _esp: u32) -> ! {
        panic!("user mode is not reachable on a portable build");
    }
}

#[cfg(not(target_arch = "x86"))]
pub use portable::{context_switch, enter_user_mode, halt_until_interrupt, power_off};
