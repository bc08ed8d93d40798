/*
 * Interrupt Enable State
 *
 * The kernel runs on one processor, so short critical sections are
 * protected by turning interrupts off rather than by locks. This module
 * owns the interrupt-enable flag: on an i386 target the flag mirrors
 * EFLAGS.IF via cli/sti, elsewhere it is a plain software flag so the
 * portable core keeps identical semantics under test.
 *
 * Interrupt-off windows are reserved for the scheduler's run-queue
 * surgery, the context swap itself, and reading the fault address.
 * Everything else synchronizes with the sleeping locks in `sync`.
 */

use core::sync::atomic::{AtomicBool, Ordering};

static ENABLED: AtomicBool = AtomicBool::new(false);

/// True while an interrupt handler is running. Wake-ups from handler
/// context must not switch synchronously; they flag the return path.
static IN_HANDLER: AtomicBool = AtomicBool::new(false);

/// True if interrupts are currently enabled.
pub fn are_enabled() -> bool {
    ENABLED.load(Ordering::SeqCst)
}

/// True when called from interrupt context.
pub fn in_handler() -> bool {
    IN_HANDLER.load(Ordering::SeqCst)
}

/// Bracket an interrupt handler's execution.
pub(crate) fn enter_handler() {
    IN_HANDLER.store(true, Ordering::SeqCst);
}

pub(crate) fn leave_handler() {
    IN_HANDLER.store(false, Ordering::SeqCst);
}

/// Enable interrupts.
pub fn enable() {
    ENABLED.store(true, Ordering::SeqCst);
    #[cfg(target_arch = "x86")]
    unsafe {
        x86::irq::enable();
    }
}

/// Disable interrupts, returning the previous state.
pub fn disable() -> bool {
    #[cfg(target_arch = "x86")]
    unsafe {
        x86::irq::disable();
    }
    ENABLED.swap(false, Ordering::SeqCst)
}

/// Restore a state previously returned by `disable`.
pub fn restore(was_enabled: bool) {
    if was_enabled {
        enable();
    }
}

/// RAII interrupt-off window.
pub struct IntrGuard {
    was_enabled: bool,
}

impl IntrGuard {
    pub fn new() -> IntrGuard {
        IntrGuard { was_enabled: disable() }
    }
}

impl Default for IntrGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IntrGuard {
    fn drop(&mut self) {
        restore(self.was_enabled);
    }
}

/// Run `f` with interrupts disabled.
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let _guard = IntrGuard::new();
    f()
}
