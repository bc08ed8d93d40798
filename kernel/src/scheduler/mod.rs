/*
 * Priority Scheduler
 *
 * Strict highest-effective-priority-first over the ready set, with
 * round-robin among equals (the thread that ran least recently wins a
 * tie). A 100 Hz tick drives preemption: whenever a ready thread outranks
 * the running one, the running one gives way at the next opportunity.
 * Threads also yield voluntarily after waking something that outranks
 * them (`sync` handles those sites).
 *
 * Two modes are selected at boot and never mixed:
 * - priority mode (default): `effective` is the base priority raised by
 *   donations received through held locks;
 * - advanced mode (-mlfqs): priorities are recomputed from recent_cpu and
 *   nice every fourth tick (see `mlfqs`), and donation is disabled.
 *
 * All run-queue surgery happens inside interrupt-off windows. The context
 * swap itself is the arch layer's job; everything else in this module is
 * portable and drives the same state machine under test.
 */

pub mod mlfqs;
pub mod thread;

use alloc::boxed::Box;
use alloc::string::ToString;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use alloc::collections::BTreeMap;
use spin::Mutex;

use crate::fixed_point::Fp;
use crate::intr;
pub use thread::{PRI_DEFAULT, PRI_MAX, PRI_MIN, Thread, ThreadId, ThreadState, ThreadStats};

/// Global scheduler instance.
static SCHEDULER: Mutex<Option<Scheduler>> = Mutex::new(None);

/// Currently running thread id (atomic so interrupt handlers may read it).
static CURRENT_THREAD_ID: AtomicUsize = AtomicUsize::new(0);

/// Set once `init` has run.
static SCHEDULER_ENABLED: AtomicBool = AtomicBool::new(false);

/// Set when an interrupt handler wakes a thread that outranks the running
/// one; the interrupt return path yields on its way out.
static YIELD_PENDING: AtomicBool = AtomicBool::new(false);

/// Ticks between consecutive mlfqs priority recomputations.
pub const PRIORITY_RECALC_TICKS: u64 = 4;

/// Scheduling quantum: a thread sharing its priority level gives way
/// after this many ticks, which is what makes equals round-robin.
pub const TIME_SLICE: u64 = 4;

/// Maximum length of a donation chain walk.
pub const DONATION_DEPTH_MAX: usize = 8;

pub struct Scheduler {
    threads: BTreeMap<ThreadId, Thread>,
    /// Runnable threads. Selection scans for the best candidate, so
    /// donations never leave a stale ordering behind.
    ready: Vec<ThreadId>,
    /// The thread on the processor. Mirrored into CURRENT_THREAD_ID for
    /// lock-free reads from interrupt handlers.
    current: ThreadId,
    next_id: usize,
    mlfqs: bool,
    load_avg: Fp,
    idle: Option<ThreadId>,
}

impl Scheduler {
    pub fn new(mlfqs: bool) -> Scheduler {
        Scheduler {
            threads: BTreeMap::new(),
            ready: Vec::new(),
            current: ThreadId(0),
            next_id: 1,
            mlfqs,
            load_avg: Fp::ZERO,
            idle: None,
        }
    }

    pub fn mlfqs(&self) -> bool {
        self.mlfqs
    }

    pub fn load_avg(&self) -> Fp {
        self.load_avg
    }

    pub fn thread(&self, tid: ThreadId) -> Option<&Thread> {
        self.threads.get(&tid)
    }

    pub fn thread_mut(&mut self, tid: ThreadId) -> Option<&mut Thread> {
        self.threads.get_mut(&tid)
    }

    pub fn current_tid(&self) -> ThreadId {
        self.current
    }

    /// Effective priority of `tid`; threads that vanished rank lowest.
    pub fn effective(&self, tid: ThreadId) -> i32 {
        self.threads.get(&tid).map_or(PRI_MIN, |t| t.effective)
    }

    /// Create a thread. The descriptor is born blocked and enters the
    /// ready set once initialization completes, so a partially built
    /// thread can never be picked.
    pub fn create_thread(
        &mut self,
        name: &str,
        priority: i32,
        entry: Option<Box<dyn FnOnce() + Send>>,
    ) -> ThreadId {
        let tid = ThreadId(self.next_id);
        self.next_id += 1;

        let mut t = Thread::new(tid, name, priority);
        t.entry = entry;

        // The advanced scheduler has children inherit nice and recent_cpu.
        if self.mlfqs
            && let Some(cur) = self.threads.get(&self.current_tid())
        {
            t.nice = cur.nice;
            t.recent_cpu = cur.recent_cpu;
            t.effective = mlfqs::priority_for(t.recent_cpu, t.nice);
        }

        #[cfg(target_arch = "x86")]
        crate::arch::seed_context(&mut t);

        self.threads.insert(tid, t);
        self.make_ready(tid);
        log::debug!("created thread '{}' ({})", name, tid);
        tid
    }

    /// Adopt the boot context as a thread and make it current.
    pub fn adopt_running(&mut self, name: &str, priority: i32) -> ThreadId {
        let tid = ThreadId(self.next_id);
        self.next_id += 1;
        let mut t = Thread::new(tid, name, priority);
        t.state = ThreadState::Running;
        self.threads.insert(tid, t);
        self.current = tid;
        tid
    }

    /// Register `tid` as the idle thread. It never sits in the ready set;
    /// it is the fallback when nothing else can run.
    pub fn set_idle(&mut self, tid: ThreadId) {
        self.ready.retain(|&r| r != tid);
        self.idle = Some(tid);
    }

    pub fn idle_tid(&self) -> Option<ThreadId> {
        self.idle
    }

    /// Move a blocked thread into the ready set.
    pub fn make_ready(&mut self, tid: ThreadId) {
        if Some(tid) == self.idle {
            return;
        }
        let t = self.threads.get_mut(&tid).expect("make_ready: unknown thread");
        debug_assert!(t.state != ThreadState::Running);
        t.state = ThreadState::Ready;
        if !self.ready.contains(&tid) {
            self.ready.push(tid);
        }
    }

    /// Unblock `tid`; true if it outranks the running thread.
    pub fn unblock(&mut self, tid: ThreadId) -> bool {
        self.make_ready(tid);
        self.effective(tid) > self.effective(self.current_tid())
    }

    /// Best ready candidate without removing it.
    fn best_ready(&self) -> Option<ThreadId> {
        let mut best: Option<ThreadId> = None;
        for &tid in &self.ready {
            let better = match best {
                None => true,
                Some(b) => {
                    let (te, be) = (self.effective(tid), self.effective(b));
                    te > be
                        || (te == be
                            && self.threads[&tid].last_run < self.threads[&b].last_run)
                }
            };
            if better {
                best = Some(tid);
            }
        }
        best
    }

    /// True if a ready thread outranks the running one.
    pub fn should_preempt(&self) -> bool {
        match self.best_ready() {
            Some(tid) => {
                let cur = self.current_tid();
                Some(cur) == self.idle
                    || self.effective(tid) > self.effective(cur)
            }
            None => false,
        }
    }

    /// Pick the next thread to run and take it off the ready set.
    /// Falls back to the idle thread when nothing is ready.
    pub fn pick_next(&mut self) -> Option<ThreadId> {
        match self.best_ready() {
            Some(tid) => {
                self.ready.retain(|&r| r != tid);
                Some(tid)
            }
            None => self.idle,
        }
    }

    /// Drop descriptors of threads that finished. The thread being
    /// switched away from is reaped on a later pass, once its stack is
    /// guaranteed not to be in use.
    fn reap_dying(&mut self, keep: ThreadId) {
        self.threads
            .retain(|&tid, t| tid == keep || t.state != ThreadState::Dying);
    }

    /// Raise `tid`'s effective priority to at least `value`.
    pub fn donate(&mut self, tid: ThreadId, value: i32) {
        if let Some(t) = self.threads.get_mut(&tid)
            && t.effective < value
        {
            t.effective = value;
        }
    }

    /// Recompute `tid`'s effective priority from its base and the waiters
    /// of every lock it still holds. Called lazily at release sites.
    pub fn refresh_effective(&mut self, tid: ThreadId) {
        let Some(t) = self.threads.get(&tid) else { return };
        if self.mlfqs {
            return;
        }
        let mut effective = t.priority;
        for lock in t.held_locks.clone() {
            for waiter in lock.waiters() {
                effective = effective.max(self.effective(waiter));
            }
        }
        if let Some(t) = self.threads.get_mut(&tid) {
            t.effective = effective;
        }
    }

    /// Set the base priority of the running thread. Returns true if the
    /// caller should yield because it no longer ranks highest.
    pub fn set_priority(&mut self, tid: ThreadId, priority: i32) -> bool {
        assert!((PRI_MIN..=PRI_MAX).contains(&priority));
        if self.mlfqs {
            return false;
        }
        if let Some(t) = self.threads.get_mut(&tid) {
            t.priority = priority;
        }
        self.refresh_effective(tid);
        self.should_preempt()
    }

    /// Per-tick bookkeeping; true if the running thread should yield.
    pub fn on_tick(&mut self, now: u64) -> bool {
        let cur = self.current_tid();
        if let Some(t) = self.threads.get_mut(&cur) {
            t.cpu_ticks += 1;
        }
        if self.mlfqs {
            self.mlfqs_tick(now);
        }
        // A strictly higher-priority thread preempts at once; an equal
        // one gets its turn when the quantum runs out.
        if self.should_preempt() {
            return true;
        }
        now % TIME_SLICE == 0
            && self
                .best_ready()
                .is_some_and(|b| self.effective(b) >= self.effective(cur))
    }

    pub fn stats(&self) -> Vec<ThreadStats> {
        self.threads
            .values()
            .map(|t| ThreadStats {
                id: t.id,
                name: t.name.clone(),
                state: t.state,
                priority: t.priority,
                effective: t.effective,
                cpu_ticks: t.cpu_ticks,
            })
            .collect()
    }
}

/// Initialize the global scheduler. The boot context becomes the "main"
/// thread; an idle thread is created at the lowest priority.
pub fn init(mlfqs: bool) {
    let mut s = Scheduler::new(mlfqs);
    let main = s.adopt_running("main", PRI_DEFAULT);
    let idle = s.create_thread("idle", PRI_MIN, Some(Box::new(idle_loop)));
    s.set_idle(idle);
    *SCHEDULER.lock() = Some(s);
    CURRENT_THREAD_ID.store(main.0, Ordering::SeqCst);
    SCHEDULER_ENABLED.store(true, Ordering::SeqCst);
    log::info!(
        "scheduler: {} mode",
        if mlfqs { "advanced (mlfqs)" } else { "priority" }
    );
}

/// Idle thread body: halt until the next interrupt.
fn idle_loop() {
    loop {
        crate::arch::halt_until_interrupt();
    }
}

/// Run `f` on the global scheduler. Interrupts stay off for the duration,
/// so `f` must neither block nor switch.
pub(crate) fn with_scheduler_mut<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    let _guard = intr::IntrGuard::new();
    let mut s = SCHEDULER.lock();
    f(s.as_mut().expect("scheduler not initialized"))
}

pub(crate) fn with_scheduler<R>(f: impl FnOnce(&Scheduler) -> R) -> R {
    let _guard = intr::IntrGuard::new();
    let s = SCHEDULER.lock();
    f(s.as_ref().expect("scheduler not initialized"))
}

pub fn is_enabled() -> bool {
    SCHEDULER_ENABLED.load(Ordering::SeqCst)
}

/// Id of the running thread.
pub fn current_id() -> ThreadId {
    ThreadId(CURRENT_THREAD_ID.load(Ordering::SeqCst))
}

/// Spawn a kernel thread. Yields immediately if the new thread outranks
/// the caller, so creation of a high-priority thread schedules it at once.
pub fn spawn(name: &str, priority: i32, entry: impl FnOnce() + Send + 'static) -> ThreadId {
    let (tid, preempt) = with_scheduler_mut(|s| {
        let tid = s.create_thread(name, priority, Some(Box::new(entry)));
        (tid, s.should_preempt())
    });
    if preempt {
        yield_now();
    }
    tid
}

/// Name of a thread, for diagnostics and the exit banner.
pub fn thread_name(tid: ThreadId) -> Option<alloc::string::String> {
    with_scheduler(|s| s.thread(tid).map(|t| t.name.to_string()))
}

/// Run `f` against the running thread's descriptor.
pub(crate) fn with_current<R>(f: impl FnOnce(&mut Thread) -> R) -> R {
    with_scheduler_mut(|s| {
        let cur = s.current_tid();
        f(s.thread_mut(cur).expect("current thread vanished"))
    })
}

/// Base priority of the running thread.
pub fn get_priority() -> i32 {
    with_scheduler(|s| {
        s.thread(current_id()).map_or(PRI_DEFAULT, |t| t.priority)
    })
}

/// Set the running thread's base priority, yielding if it stops being
/// the highest. A no-op in mlfqs mode.
pub fn set_priority(priority: i32) {
    let should_yield = with_scheduler_mut(|s| s.set_priority(current_id(), priority));
    if should_yield {
        yield_now();
    }
}

/// The core switch: pick the best candidate and hand the processor over.
/// The running thread must already be in its post-switch state (Ready and
/// queued for a yield, Blocked for a wait, Dying for an exit).
pub(crate) fn reschedule() {
    if !is_enabled() {
        return;
    }
    let was_enabled = intr::disable();

    let mut sched_guard = SCHEDULER.lock();
    let s = sched_guard.as_mut().expect("scheduler not initialized");

    let prev = s.current_tid();
    s.reap_dying(prev);

    let next = match s.pick_next() {
        Some(tid) if tid != prev => tid,
        _ => {
            // Nothing better to do; if the previous thread was parked in
            // the ready set by a yield, put it back on the processor.
            if let Some(t) = s.thread_mut(prev)
                && t.state == ThreadState::Ready
            {
                t.state = ThreadState::Running;
                s.ready.retain(|&r| r != prev);
            }
            drop(sched_guard);
            intr::restore(was_enabled);
            return;
        }
    };

    // The idle thread parks without queueing; anything else still
    // Running here was requeued by the yield that brought us in.
    if let Some(t) = s.thread_mut(prev)
        && t.state == ThreadState::Running
    {
        t.state = ThreadState::Ready;
    }

    let now = crate::timer::ticks();
    if let Some(t) = s.thread_mut(next) {
        t.state = ThreadState::Running;
        t.last_run = now;
    }
    s.current = next;
    CURRENT_THREAD_ID.store(next.0, Ordering::SeqCst);
    YIELD_PENDING.store(false, Ordering::SeqCst);

    #[cfg(target_arch = "x86")]
    {
        let prev_ctx = s
            .thread_mut(prev)
            .map(|t| &mut t.context as *mut crate::arch::KernelContext);
        let next_ctx = s
            .thread(next)
            .map(|t| &t.context as *const crate::arch::KernelContext)
            .expect("picked thread vanished");
        drop(sched_guard);
        // Interrupts stay off across the swap; the resuming thread
        // restores them when it unwinds its own IntrGuard.
        unsafe { crate::arch::context_switch(prev_ctx, next_ctx) };
        intr::restore(was_enabled);
        return;
    }

    #[cfg(not(target_arch = "x86"))]
    {
        // Portable build: there is no second kernel stack to jump onto.
        // The state machine above has already transferred "the processor";
        // control simply returns to the caller, which the test harnesses
        // treat as the end of the previous thread's turn.
        drop(sched_guard);
        intr::restore(was_enabled);
    }
}

/// Voluntarily give up the processor.
pub fn yield_now() {
    if !is_enabled() {
        return;
    }
    with_scheduler_mut(|s| {
        let cur = current_id();
        if Some(cur) != s.idle
            && let Some(t) = s.thread_mut(cur)
            && t.state == ThreadState::Running
        {
            t.state = ThreadState::Ready;
            if !s.ready.contains(&cur) {
                s.ready.push(cur);
            }
        }
    });
    reschedule();
}

/// Block the running thread. The caller has already put it on whatever
/// wait list will wake it; this marks it blocked and switches away.
pub(crate) fn block_current() {
    with_current(|t| {
        debug_assert!(t.state == ThreadState::Running);
        t.state = ThreadState::Blocked;
    });
    reschedule();
}

/// React to having woken a thread: yield if it outranks the caller, or
/// flag the interrupt return path when called from a handler.
pub(crate) fn note_wakeup(woke_higher: bool) {
    if !woke_higher {
        return;
    }
    if intr::in_handler() {
        YIELD_PENDING.store(true, Ordering::SeqCst);
    } else {
        yield_now();
    }
}

/// Mark the running thread dying and switch away for good. On the target
/// this never returns; the descriptor is reaped at a later switch.
pub(crate) fn terminate_current() {
    with_current(|t| t.state = ThreadState::Dying);
    reschedule();
}

/// Timer tick hook. Returns true when the interrupt return path should
/// yield the processor.
pub(crate) fn note_tick(now: u64) -> bool {
    if !is_enabled() {
        return false;
    }
    let preempt = with_scheduler_mut(|s| s.on_tick(now));
    preempt || YIELD_PENDING.swap(false, Ordering::SeqCst)
}

/// Snapshot of every thread, for diagnostics.
pub fn stats() -> Vec<ThreadStats> {
    with_scheduler(|s| s.stats())
}

/// Current system load average (mlfqs).
pub fn load_avg() -> Fp {
    with_scheduler(|s| s.load_avg())
}

/// Nice value of the running thread (mlfqs).
pub fn get_nice() -> i32 {
    with_scheduler(|s| s.thread(current_id()).map_or(0, |t| t.nice))
}

/// Set the running thread's nice value and recompute its priority.
pub fn set_nice(nice: i32) {
    let should_yield = with_scheduler_mut(|s| {
        let cur = s.current_tid();
        let advanced = s.mlfqs;
        if let Some(t) = s.thread_mut(cur) {
            t.nice = nice.clamp(-20, 20);
            if advanced {
                t.effective = mlfqs::priority_for(t.recent_cpu, t.nice);
            }
        }
        s.should_preempt()
    });
    if should_yield {
        yield_now();
    }
}
