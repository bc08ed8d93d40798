/*
 * User Process Scenarios
 *
 * Stack growth decisions, the exec/wait/exit plumbing through the
 * shared wait record, and the teardown guarantees of a dying process.
 */

use crate::exception::{self, FaultInfo, FaultOutcome};
use crate::mem::{PG_SIZE, STACK_BOTTOM};
use crate::process::{self, Process, WaitRecord};
use crate::scheduler::{self, ThreadState};
use crate::sync::Lock;
use crate::vm::test_setup;

fn adopt_process() {
    scheduler::with_current(|t| t.process = Some(Process::new()));
}

fn fault(addr: u32, esp: u32) -> FaultOutcome {
    exception::page_fault(FaultInfo { addr, not_present: true, write: true, user: true, esp })
}

#[test]
fn push_below_esp_grows_the_stack() {
    let _serial = crate::test_sync::lock();
    test_setup::init_vm(8, 16);
    scheduler::init(false);
    adopt_process();

    let esp = 0xbfff_f000u32;
    assert_eq!(fault(esp - 4, esp), FaultOutcome::Handled);

    let (pages, stack_size) = scheduler::with_current(|t| {
        let vm = t.process.as_ref().unwrap().vm.clone();
        let g = vm.lock();
        (g.pages.len(), g.stack_size)
    });
    assert_eq!(pages, 1);
    assert_eq!(stack_size, PG_SIZE as u32);

    // A push window only reaches 32 bytes below esp; a touch a page
    // further down is legitimate once esp itself has moved there.
    let moved_esp = esp - 2 * PG_SIZE as u32;
    assert_eq!(fault(moved_esp, moved_esp), FaultOutcome::Handled);
    let stack_size = scheduler::with_current(|t| {
        t.process.as_ref().unwrap().vm.lock().stack_size
    });
    assert_eq!(stack_size, 2 * PG_SIZE as u32);

    scheduler::with_current(|t| t.process = None);
}

#[test]
fn faults_outside_the_stack_window_kill_the_process() {
    let _serial = crate::test_sync::lock();
    test_setup::init_vm(8, 16);
    scheduler::init(false);
    let buf = crate::devices::console::capture::install();
    adopt_process();

    // A write far below the stack region is no growth request.
    let esp = 0xbfff_f000u32;
    let doomed = scheduler::current_id();
    assert_eq!(fault(STACK_BOTTOM - 4, esp), FaultOutcome::Terminated);

    let state = scheduler::with_scheduler(|s| s.thread(doomed).map(|t| t.state));
    assert_eq!(state, Some(ThreadState::Dying));
    let out = crate::devices::console::capture::contents(&buf);
    assert!(out.contains("exit(-1)"), "missing exit banner in {out:?}");
}

#[test]
fn wait_returns_the_exit_status_exactly_once() {
    let _serial = crate::test_sync::lock();
    test_setup::init_vm(8, 16);
    scheduler::init(false);
    let buf = crate::devices::console::capture::install();
    scheduler::set_priority(5);

    // Parent side of an exec: create the child and share a record.
    let record = WaitRecord::new();
    let child = {
        let record = record.clone();
        scheduler::spawn("child", 40, move || {
            let _ = record;
        })
    };
    record.set_tid(child);

    // The spawn preempted us; we are now "the child": adopt the record
    // and a process, then exit 7 the way the exit syscall would.
    assert_eq!(scheduler::current_id(), child);
    scheduler::with_current(|t| {
        t.wait_record = Some(record.clone());
        t.process = Some(Process::new());
    });

    // Parent bookkeeping happens before the child can exit: register
    // the record in our (the spawning thread's) child list.
    let parent = scheduler::with_scheduler(|s| {
        s.stats()
            .into_iter()
            .find(|t| t.name == "main")
            .map(|t| t.id)
            .unwrap()
    });
    scheduler::with_scheduler_mut(|s| {
        s.thread_mut(parent).unwrap().children.push(record.clone())
    });

    process::exit_current(7);

    // Back on the parent: the record carries the status.
    let out = crate::devices::console::capture::contents(&buf);
    assert!(out.contains("child: exit(7)"), "missing exit banner in {out:?}");
    assert_eq!(process::wait(child), 7);
    // A second wait on the same pid misses.
    assert_eq!(process::wait(child), -1);
}

#[test]
fn dispatcher_reads_args_from_the_user_stack() {
    let _serial = crate::test_sync::lock();
    test_setup::init_vm(8, 16);
    scheduler::init(false);
    adopt_process();

    // A user stack page holding: [nr][arg0] = tell(fd 77).
    let esp = 0x2000_0f00u32;
    let vm = scheduler::with_current(|t| t.process.as_ref().unwrap().vm.clone());
    crate::vm::add_anon_page(&vm, crate::mem::Vpn::containing(esp)).unwrap();
    {
        let _pins = crate::syscall::usermem::pin_range(&vm, esp, 8, true).unwrap();
        crate::syscall::usermem::write_bytes(&vm, esp, &11u32.to_le_bytes()).unwrap();
        crate::syscall::usermem::write_bytes(&vm, esp + 4, &77u32.to_le_bytes()).unwrap();
    }

    let mut frame = crate::syscall::SyscallFrame { esp, eax: 0 };
    crate::syscall::dispatch(&mut frame);
    // tell() on an unknown descriptor answers -1 without killing us.
    assert_eq!(frame.eax as i32, -1);
    let alive = scheduler::with_scheduler(|s| {
        s.thread(scheduler::current_id()).map(|t| t.state)
    });
    assert_eq!(alive, Some(ThreadState::Running));

    scheduler::with_current(|t| t.process = None);
}

#[test]
fn bad_syscall_pointer_terminates_the_process() {
    let _serial = crate::test_sync::lock();
    test_setup::init_vm(8, 16);
    scheduler::init(false);
    let buf = crate::devices::console::capture::install();
    adopt_process();

    let doomed = scheduler::current_id();
    // esp pointing at unmapped memory: even fetching the number faults.
    let mut frame = crate::syscall::SyscallFrame { esp: 0x4000_0000, eax: 0 };
    crate::syscall::dispatch(&mut frame);

    assert_eq!(frame.eax as i32, -1);
    let state = scheduler::with_scheduler(|s| s.thread(doomed).map(|t| t.state));
    assert_eq!(state, Some(ThreadState::Dying));
    let out = crate::devices::console::capture::contents(&buf);
    assert!(out.contains("exit(-1)"));
}

#[test]
fn exit_releases_every_held_lock() {
    let _serial = crate::test_sync::lock();
    test_setup::init_vm(8, 16);
    scheduler::init(false);
    scheduler::set_priority(5);

    let a = Lock::new();
    let b = Lock::new();

    let t = scheduler::spawn("doomed", 40, || {});
    assert_eq!(scheduler::current_id(), t);
    a.acquire();
    b.acquire();
    crate::fs::fs_lock().acquire();

    process::exit_current(-1);

    assert_eq!(a.holder(), None);
    assert_eq!(b.holder(), None);
    assert_eq!(crate::fs::fs_lock().holder(), None);
}

#[test]
fn orphaned_children_detach_from_the_record() {
    let _serial = crate::test_sync::lock();
    test_setup::init_vm(8, 16);
    scheduler::init(false);
    scheduler::set_priority(5);

    // A "parent" thread with one child record dies first.
    let record = WaitRecord::new();
    let parent = scheduler::spawn("parent", 40, || {});
    assert_eq!(scheduler::current_id(), parent);
    scheduler::with_current(|t| t.children.push(record.clone()));
    process::exit_current(0);

    // The child exits afterwards; with the parent gone there is nobody
    // to signal, and the permit must not be minted.
    let child = scheduler::spawn("orphan", 40, || {});
    assert_eq!(scheduler::current_id(), child);
    record.set_tid(child);
    scheduler::with_current(|t| t.wait_record = Some(record.clone()));
    process::exit_current(3);

    assert_eq!(record.exit_code(), 3);
    // With no surviving parent the child must not mint the wake permit.
    assert!(!record.signalled());
}
