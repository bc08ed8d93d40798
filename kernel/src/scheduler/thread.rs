/*
 * Thread Descriptor
 *
 * One descriptor per kernel thread. A thread that runs a user program
 * additionally owns a `Process` with the address space, open files, and
 * parent/child plumbing; pure kernel threads leave it `None`.
 *
 * Priorities run 0..=63. `priority` is the base set by the thread itself;
 * `effective` is the base raised by any donations currently received
 * through held locks. The two are equal whenever the thread holds no
 * locks, and the advanced scheduler overwrites `effective` directly from
 * recent_cpu/nice (donations are disabled in that mode).
 */

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use alloc::sync::Arc;

use crate::arch::KernelContext;
use crate::fixed_point::Fp;
use crate::process::{Process, WaitRecord};
use crate::sync::Lock;

/// Thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ThreadId(pub usize);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid {}", self.0)
    }
}

/// Lowest priority.
pub const PRI_MIN: i32 = 0;
/// Default priority for new threads.
pub const PRI_DEFAULT: i32 = 31;
/// Highest priority.
pub const PRI_MAX: i32 = 63;

/// Thread lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Runnable, waiting for the processor.
    Ready,
    /// Currently on the processor.
    Running,
    /// Waiting on a semaphore, lock, or sleep entry.
    Blocked,
    /// Finished; reaped at the next context switch.
    Dying,
}

/// Size of a thread's kernel stack.
pub const THREAD_STACK_SIZE: usize = 16 * 1024;

pub struct Thread {
    pub id: ThreadId,
    pub name: String,
    pub state: ThreadState,

    /// Base priority, 0..=63.
    pub priority: i32,
    /// Base priority plus donations (or the computed mlfqs priority).
    pub effective: i32,

    /// Advanced-scheduler fields.
    pub nice: i32,
    pub recent_cpu: Fp,

    /// Locks this thread currently holds.
    pub held_locks: Vec<Lock>,
    /// The lock this thread is blocked on, if any. Donation chains are
    /// walked through this field.
    pub blocked_on: Option<Lock>,

    /// Tick at which this thread last got the processor; the scheduler
    /// breaks priority ties toward the smallest value.
    pub last_run: u64,
    /// Accumulated ticks on the processor.
    pub cpu_ticks: u64,

    /// Entry point, consumed the first time the thread is dispatched.
    pub entry: Option<Box<dyn FnOnce() + Send>>,
    /// Kernel stack backing the saved context.
    pub stack: Option<Box<[u8]>>,
    /// Saved register context for the context switch.
    pub context: KernelContext,

    /// User-process state, if this thread runs a user program.
    pub process: Option<Process>,

    /// Wait records of children this thread has spawned and not yet
    /// waited for. Guarded by the child-list lock.
    pub children: Vec<Arc<WaitRecord>>,
    /// This thread's own record, shared with its parent.
    pub wait_record: Option<Arc<WaitRecord>>,
}

impl Thread {
    pub fn new(id: ThreadId, name: &str, priority: i32) -> Thread {
        assert!((PRI_MIN..=PRI_MAX).contains(&priority));
        Thread {
            id,
            name: String::from(name),
            state: ThreadState::Blocked,
            priority,
            effective: priority,
            nice: 0,
            recent_cpu: Fp::ZERO,
            held_locks: Vec::new(),
            blocked_on: None,
            last_run: 0,
            cpu_ticks: 0,
            entry: None,
            stack: None,
            context: KernelContext::default(),
            process: None,
            children: Vec::new(),
            wait_record: None,
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("priority", &self.priority)
            .field("effective", &self.effective)
            .finish()
    }
}

/// Per-thread snapshot for diagnostics.
#[derive(Debug, Clone)]
pub struct ThreadStats {
    pub id: ThreadId,
    pub name: String,
    pub state: ThreadState,
    pub priority: i32,
    pub effective: i32,
    pub cpu_ticks: u64,
}
