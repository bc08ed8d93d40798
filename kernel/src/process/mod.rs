/*
 * User Processes
 *
 * A user process is a kernel thread carrying a `Process`: an address
 * space, a descriptor table, a mapping table, and a claim on its
 * executable. Process ids are the thread ids.
 *
 * Parent and child are coupled through a shared `WaitRecord` rather
 * than pointers at each other: a neutral node carrying the exit code, a
 * single-slot semaphore the parent downs, and one aliveness flag per
 * side. Whichever side outlives the other drops the last handle and the
 * record goes with it. The child-list lock guards every record's flags
 * and the children lists themselves.
 */

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use lazy_static::lazy_static;

use crate::fs::fd::FdTable;
use crate::kprintln;
use crate::loaders::elf;
use crate::mem::PG_SIZE;
use crate::scheduler::{self, PRI_DEFAULT, ThreadId};
use crate::sync::{Lock, Semaphore};
use crate::vm::mmap::MmapTable;
use crate::vm::{self, VmHandle};

/// Per-process state hung off the owning thread.
pub struct Process {
    pub vm: VmHandle,
    pub fds: FdTable,
    pub mmaps: MmapTable,
    /// Name the executable was checked out under; released at exit.
    pub exe_name: Option<String>,
}

impl Process {
    pub fn new() -> Process {
        Process {
            vm: VmHandle::default(),
            fds: FdTable::new(),
            mmaps: MmapTable::new(),
            exe_name: None,
        }
    }
}

impl Default for Process {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared parent/child node. See the module comment.
pub struct WaitRecord {
    /// Child thread id; filled in by the parent right after creation.
    tid: AtomicUsize,
    /// Downed once by the parent in `wait`; upped by the child at exit.
    exited: Semaphore,
    exit_code: AtomicI32,
    parent_alive: AtomicBool,
    child_alive: AtomicBool,
}

impl WaitRecord {
    pub(crate) fn new() -> Arc<WaitRecord> {
        Arc::new(WaitRecord {
            tid: AtomicUsize::new(0),
            exited: Semaphore::new(0),
            exit_code: AtomicI32::new(-1),
            parent_alive: AtomicBool::new(true),
            child_alive: AtomicBool::new(true),
        })
    }

    pub fn tid(&self) -> ThreadId {
        ThreadId(self.tid.load(Ordering::SeqCst))
    }

    pub(crate) fn set_tid(&self, tid: ThreadId) {
        self.tid.store(tid.0, Ordering::SeqCst);
    }

    /// True once the child has upped the semaphore.
    pub(crate) fn signalled(&self) -> bool {
        self.exited.value() > 0
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }
}

lazy_static! {
    /// Outermost lock in the kernel ordering; guards children lists and
    /// wait-record flags.
    static ref CHILD_LOCK: Lock = Lock::new();
}

pub fn child_lock() -> &'static Lock {
    &CHILD_LOCK
}

/// What the child reports back through the exec semaphore.
struct ExecReport {
    loaded: Semaphore,
    ok: AtomicBool,
}

/// Start a user program from `cmdline` (program name plus arguments).
/// Blocks until the child reports whether its executable loaded;
/// returns the child's tid, or -1 on failure.
pub fn execute(cmdline: &str) -> i32 {
    // Own a copy before anything can touch the caller's buffer.
    let cmd = String::from(cmdline);
    let args: Vec<String> = cmd.split_whitespace().map(|s| s.to_string()).collect();
    if args.is_empty() {
        return -1;
    }

    // Refuse commands whose marshalled form cannot fit the stack page:
    // each argument costs its bytes, a terminator, and a pointer, and
    // the fixed tail (sentinel, argv, argc, return address) costs 16.
    let stack_usage: usize =
        args.iter().map(|a| a.len() + 1 + 4).sum::<usize>() + 16;
    if stack_usage > PG_SIZE {
        return -1;
    }

    let report = Arc::new(ExecReport {
        loaded: Semaphore::new(0),
        ok: AtomicBool::new(false),
    });
    let record = WaitRecord::new();

    let program = args[0].clone();
    let tid = {
        let report = report.clone();
        let record = record.clone();
        scheduler::spawn(&program, PRI_DEFAULT, move || {
            start_process(args, report, record);
        })
    };

    record.tid.store(tid.0, Ordering::SeqCst);
    child_lock().acquire();
    scheduler::with_current(|t| t.children.push(record));
    child_lock().release();

    report.loaded.down();
    if report.ok.load(Ordering::SeqCst) { tid.0 as i32 } else { -1 }
}

/// Child-side start: build the process, load the executable, report to
/// the parent, and enter user mode. Never returns.
fn start_process(args: Vec<String>, report: Arc<ExecReport>, record: Arc<WaitRecord>) {
    let program = args[0].clone();
    let mut process = Process::new();

    vm::page_lock().acquire();
    let loaded = elf::load(&program, &args, &process.vm);
    vm::page_lock().release();

    match loaded {
        Err(err) => {
            log::info!("load: {}: {}", program, err);
            scheduler::with_current(|t| t.wait_record = Some(record));
            report.ok.store(false, Ordering::SeqCst);
            report.loaded.up();
            exit_current(-1);
        }
        Ok((entry, esp)) => {
            process.exe_name = Some(program);
            process.vm.lock().pagedir.activate();
            scheduler::with_current(|t| {
                t.wait_record = Some(record);
                t.process = Some(process);
            });
            report.ok.store(true, Ordering::SeqCst);
            report.loaded.up();
            crate::arch::enter_user_mode(entry, esp);
        }
    }
}

/// Wait for child `tid` to exit and collect its status. -1 when `tid`
/// is not an un-waited child of the caller.
pub fn wait(tid: ThreadId) -> i32 {
    child_lock().acquire();
    let record = scheduler::with_current(|t| {
        t.children.iter().find(|r| r.tid() == tid).cloned()
    });
    child_lock().release();

    let Some(record) = record else { return -1 };

    record.exited.down();

    child_lock().acquire();
    let code = record.exit_code();
    scheduler::with_current(|t| t.children.retain(|r| r.tid() != tid));
    child_lock().release();
    code
}

/// Terminate the running thread with `status`, releasing everything it
/// holds. Also the path for kernel-forced termination (bad pointer,
/// fault outside the stack window, unknown syscall), which uses -1.
///
/// On the target this never returns; the portable build returns after
/// the bookkeeping so the state machine can be inspected.
pub fn exit_current(status: i32) {
    // Locks first: an exiting thread must not take the file-system lock
    // (or any other) to its grave.
    loop {
        let lock = scheduler::with_current(|t| t.held_locks.last().cloned());
        match lock {
            Some(lock) => lock.release(),
            None => break,
        }
    }

    let (name, is_process) = scheduler::with_current(|t| {
        (t.name.clone(), t.process.is_some())
    });
    if is_process {
        kprintln!("{}: exit({})", name, status);
    }

    // Settle the family under the child-list lock: report our status to
    // a surviving parent, orphan our children.
    child_lock().acquire();
    let (record, children) = scheduler::with_current(|t| {
        (t.wait_record.take(), core::mem::take(&mut t.children))
    });
    if let Some(record) = &record {
        record.exit_code.store(status, Ordering::SeqCst);
        record.child_alive.store(false, Ordering::SeqCst);
        if record.parent_alive.load(Ordering::SeqCst) {
            record.exited.up();
        }
    }
    for child in &children {
        child.parent_alive.store(false, Ordering::SeqCst);
    }
    drop(children);
    child_lock().release();

    // Release the process's resources: mappings (with write-back), the
    // whole address space, open files, and the executable claim.
    let process = scheduler::with_current(|t| t.process.take());
    if let Some(mut process) = process {
        vm::page_lock().acquire();
        for mapping in process.mmaps.drain() {
            vm::mmap::munmap(&process.vm, mapping);
        }
        vm::destroy(&process.vm);
        vm::page_lock().release();

        crate::fs::fs_lock().acquire();
        process.fds.close_all();
        if let Some(exe) = process.exe_name.take() {
            vm::exe::release(&exe);
        }
        crate::fs::fs_lock().release();
        // The page directory itself goes down with the Process.
    }

    scheduler::terminate_current();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_longer_than_a_page_is_rejected() {
        let _serial = crate::test_sync::lock();
        scheduler::init(false);
        let long = alloc::format!("prog {}", "a".repeat(2 * PG_SIZE));
        assert_eq!(execute(&long), -1);
        assert_eq!(execute(""), -1);
        assert_eq!(execute("   "), -1);
    }

    #[test]
    fn wait_on_unknown_child_fails_fast() {
        let _serial = crate::test_sync::lock();
        scheduler::init(false);
        assert_eq!(wait(ThreadId(4242)), -1);
    }

    #[test]
    fn exit_code_flows_through_the_record() {
        let _serial = crate::test_sync::lock();
        scheduler::init(false);

        let record = WaitRecord::new();
        record.tid.store(7, Ordering::SeqCst);
        scheduler::with_current(|t| t.children.push(record.clone()));

        // Child side: store the code and signal.
        record.exit_code.store(42, Ordering::SeqCst);
        record.child_alive.store(false, Ordering::SeqCst);
        record.exited.up();

        // Parent side: first wait collects, second wait misses.
        assert_eq!(wait(ThreadId(7)), 42);
        assert_eq!(wait(ThreadId(7)), -1);
    }
}
