/*
 * KITE Kernel Core
 *
 * A small 32-bit teaching kernel for user processes: priority
 * scheduling with donation, sleeping synchronization primitives,
 * tickless timer sleep, demand paging with clock eviction and swap, and
 * the system-call boundary with argument marshalling and pointer
 * validation.
 *
 * The crate is the portable core. Privileged i386 glue lives under
 * `arch::x86` and compiles only for that target; everything else builds
 * anywhere, which is how the test suites drive it.
 *
 * Initialization order (see `init`): console and logging first, then
 * the page pool, the scheduler, interrupt hardware, and the VM
 * singletons (frame table, swap); the file system is usable once the
 * scheduler is (its lock needs a current thread). Global lock order,
 * outermost first: child-list lock, file-system lock, page-table lock,
 * frame-table lock, swap lock.
 */

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod devices;
pub mod exception;
pub mod fixed_point;
pub mod fs;
pub mod intr;
pub mod loaders;
pub mod mem;
pub mod options;
pub mod pagedir;
pub mod palloc;
pub mod process;
pub mod scheduler;
pub mod sync;
pub mod syscall;
pub mod timer;
pub mod utils;
pub mod vm;

#[cfg(test)]
mod tests;

use alloc::boxed::Box;

use devices::BlockDevice;
use options::BootOptions;

/// Bring the core up. `mem_base`/`mem_pages` describe the free region
/// the page pool manages; `swap_dev` is the block device reserved for
/// swap. The caller (the platform boot path) has the console sink and
/// kernel heap installed before calling.
pub fn init(opts: &BootOptions, mem_base: usize, mem_pages: usize, swap_dev: Box<dyn BlockDevice>) {
    utils::logger::init(opts.log_level);
    log::info!("kite: booting ({})", opts);

    palloc::init(mem_base, mem_pages);
    scheduler::init(opts.mlfqs);
    vm::init(swap_dev);

    #[cfg(target_arch = "x86")]
    arch::x86::interrupt_hardware_init();

    intr::enable();
    log::info!("kite: core up");
}

/// Run the boot `run` action, if any: start the initial user process
/// and wait for it.
pub fn run_action(opts: &BootOptions) {
    let Some(cmd) = &opts.run else { return };
    log::info!("running '{}'", cmd);
    let pid = process::execute(cmd);
    if pid < 0 {
        log::warn!("'{}' failed to start", cmd);
        return;
    }
    let status = process::wait(scheduler::ThreadId(pid as usize));
    log::info!("'{}' exited with status {}", cmd, status);
}
