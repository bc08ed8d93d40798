/*
 * Context Switch
 *
 * cdecl on i386: ebx, ebp, esi, edi are callee-saved, so the switch
 * only has to push those four, stash the old stack pointer, load the
 * new one, and pop them back. A brand-new thread's stack is seeded to
 * look exactly like that, with the "return address" pointing at the
 * kickoff shim that runs the thread's entry closure.
 *
 * Interrupts are off across the swap; the resuming side restores them.
 */

use alloc::vec;

use crate::arch::KernelContext;
use crate::scheduler::thread::{THREAD_STACK_SIZE, Thread};

/// Swap stacks: save into `prev` (when present) and resume `next`.
///
/// # Safety
/// Interrupts must be disabled and `next` must point at a context seeded
/// by `seed_context` or saved by an earlier switch.
pub unsafe fn context_switch(prev: Option<*mut KernelContext>, next: *const KernelContext) {
    let mut discard = 0usize;
    let prev_sp: *mut usize = match prev {
        Some(ctx) => unsafe { &mut (*ctx).sp },
        None => &mut discard,
    };
    let next_sp = unsafe { (*next).sp };
    unsafe { switch_stacks(prev_sp, next_sp) };
}

#[unsafe(naked)]
unsafe extern "C" fn switch_stacks(_prev_sp: *mut usize, _next_sp: usize) {
    core::arch::naked_asm!(
        "push ebx",
        "push ebp",
        "push esi",
        "push edi",
        "mov eax, [esp + 20]", // prev_sp out-param
        "mov ecx, [esp + 24]", // next_sp
        "mov [eax], esp",
        "mov esp, ecx",
        "pop edi",
        "pop esi",
        "pop ebp",
        "pop ebx",
        "ret",
    )
}

/// First code a new thread runs, on its own stack with interrupts off.
extern "C" fn kickoff() -> ! {
    crate::intr::enable();
    let entry = crate::scheduler::with_current(|t| t.entry.take());
    if let Some(entry) = entry {
        entry();
    }
    // Falling off the end of the entry is a normal exit.
    crate::process::exit_current(0);
    unreachable!("terminated thread resumed");
}

/// Allocate a kernel stack for `thread` and seed it so the first switch
/// "returns" into `kickoff`.
pub fn seed_context(thread: &mut Thread) {
    let stack = vec![0u8; THREAD_STACK_SIZE].into_boxed_slice();
    let top = (stack.as_ptr() as usize + THREAD_STACK_SIZE) & !0xf;

    // From the top down: kickoff's address, then the four callee-saved
    // register slots `switch_stacks` will pop.
    let sp = top - 5 * core::mem::size_of::<usize>();
    unsafe {
        let words = sp as *mut usize;
        words.add(0).write(0); // edi
        words.add(1).write(0); // esi
        words.add(2).write(0); // ebp
        words.add(3).write(0); // ebx
        words.add(4).write(kickoff as usize);
    }

    thread.stack = Some(stack);
    thread.context = KernelContext { sp };
}
