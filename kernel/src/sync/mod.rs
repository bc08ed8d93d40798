/*
 * Sleeping Synchronization Primitives
 *
 * Counting semaphore, lock with priority donation, and condition
 * variable. These block the calling thread through the scheduler; they
 * are the kernel's synchronization tools everywhere an interrupt-off
 * window would be too coarse.
 *
 * Wake ordering is decided at wake time, not enqueue time: a waiter's
 * effective priority may change while it sleeps (donation), so every
 * wake scans the wait set for the currently-highest waiter.
 *
 * Semaphore wakes transfer the permit directly to the woken thread.
 * `up` never lets a third thread slip in between a wake and the waker's
 * reacquisition, which also gives locks their release-before-next-acquire
 * ordering.
 *
 * Global lock order (outer to inner): child-list lock, file-system lock,
 * page-table lock, frame-table lock, swap lock. Acquiring against this
 * order risks deadlock; blocking while holding the file-system lock is a
 * bug on every path that can reach an exit.
 */

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::scheduler::{self, DONATION_DEPTH_MAX, Scheduler, ThreadId, ThreadState};

/// A counting semaphore.
///
/// Cloning shares the underlying counter, so a semaphore can be handed to
/// the thread that will `up` it (sleep entries, wait records, exec
/// reports all do this).
#[derive(Clone)]
pub struct Semaphore(Arc<SemaInner>);

struct SemaInner {
    state: Mutex<SemaState>,
}

struct SemaState {
    value: u32,
    waiters: Vec<ThreadId>,
}

impl Semaphore {
    pub fn new(value: u32) -> Semaphore {
        Semaphore(Arc::new(SemaInner {
            state: Mutex::new(SemaState { value, waiters: Vec::new() }),
        }))
    }

    /// Current value, for diagnostics.
    pub fn value(&self) -> u32 {
        self.0.state.lock().value
    }

    /// Decrement, blocking until the value is positive.
    pub fn down(&self) {
        let must_block = scheduler::with_scheduler_mut(|s| {
            let mut st = self.0.state.lock();
            if st.value > 0 {
                st.value -= 1;
                false
            } else {
                let cur = s.current_tid();
                st.waiters.push(cur);
                drop(st);
                let t = s.thread_mut(cur).expect("down: current thread vanished");
                debug_assert_eq!(t.state, ThreadState::Running);
                t.state = ThreadState::Blocked;
                true
            }
        });
        if must_block {
            scheduler::reschedule();
            // The permit was transferred by `up`; nothing left to take.
        }
    }

    /// Decrement without blocking. True on success.
    pub fn try_down(&self) -> bool {
        let mut st = self.0.state.lock();
        if st.value > 0 {
            st.value -= 1;
            true
        } else {
            false
        }
    }

    /// Increment, or hand the permit straight to the highest-priority
    /// waiter. Yields when the woken thread outranks the caller.
    pub fn up(&self) {
        let woke_higher = scheduler::with_scheduler_mut(|s| {
            let mut st = self.0.state.lock();
            match pick_waiter(s, &st.waiters) {
                Some(idx) => {
                    let tid = st.waiters.remove(idx);
                    drop(st);
                    s.unblock(tid)
                }
                None => {
                    st.value += 1;
                    false
                }
            }
        });
        scheduler::note_wakeup(woke_higher);
    }

    /// Waiting thread ids, in no particular order.
    pub(crate) fn waiters(&self) -> Vec<ThreadId> {
        self.0.state.lock().waiters.clone()
    }
}

/// Index of the highest-effective-priority waiter, recomputed now.
fn pick_waiter(s: &Scheduler, waiters: &[ThreadId]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (idx, &tid) in waiters.iter().enumerate() {
        if best.is_none_or(|b| s.effective(tid) > s.effective(waiters[b])) {
            best = Some(idx);
        }
    }
    best
}

/// A lock: a binary wait set with an owner and priority donation.
///
/// Clones are handles to the same lock; a thread's `held_locks` list and
/// another thread's `blocked_on` field both point at the shared state, so
/// a donation chain can be walked without touching the scheduler's maps.
#[derive(Clone)]
pub struct Lock(Arc<LockInner>);

struct LockInner {
    state: Mutex<LockState>,
}

struct LockState {
    holder: Option<ThreadId>,
    waiters: Vec<ThreadId>,
}

impl PartialEq for Lock {
    fn eq(&self, other: &Lock) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Lock {
    pub fn new() -> Lock {
        Lock(Arc::new(LockInner {
            state: Mutex::new(LockState { holder: None, waiters: Vec::new() }),
        }))
    }

    pub fn holder(&self) -> Option<ThreadId> {
        self.0.state.lock().holder
    }

    pub(crate) fn waiters(&self) -> Vec<ThreadId> {
        self.0.state.lock().waiters.clone()
    }

    pub fn held_by_current(&self) -> bool {
        self.holder() == Some(scheduler::current_id())
    }

    /// Acquire the lock, blocking while another thread holds it. While
    /// blocked, the caller donates its effective priority along the chain
    /// of holders, bounded at DONATION_DEPTH_MAX hops.
    pub fn acquire(&self) {
        let must_block = scheduler::with_scheduler_mut(|s| {
            let cur = s.current_tid();
            let mut st = self.0.state.lock();
            assert!(st.holder != Some(cur), "recursive lock acquire");
            match st.holder {
                None => {
                    st.holder = Some(cur);
                    drop(st);
                    let t = s.thread_mut(cur).expect("acquire: current thread vanished");
                    t.held_locks.push(self.clone());
                    false
                }
                Some(_) => {
                    st.waiters.push(cur);
                    drop(st);
                    let t = s.thread_mut(cur).expect("acquire: current thread vanished");
                    t.blocked_on = Some(self.clone());
                    t.state = ThreadState::Blocked;
                    if !s.mlfqs() {
                        donate_chain(s, cur, self);
                    }
                    true
                }
            }
        });
        if must_block {
            scheduler::reschedule();
            // `release` handed the lock over: we resume as the holder,
            // already on our own held-locks list.
        }
    }

    /// Acquire without blocking. True on success.
    pub fn try_acquire(&self) -> bool {
        scheduler::with_scheduler_mut(|s| {
            let cur = s.current_tid();
            let mut st = self.0.state.lock();
            if st.holder.is_none() {
                st.holder = Some(cur);
                drop(st);
                let t = s.thread_mut(cur).expect("try_acquire: current thread vanished");
                t.held_locks.push(self.clone());
                true
            } else {
                false
            }
        })
    }

    /// Release the lock. The holder's effective priority is recomputed
    /// from its remaining locks, and the highest-priority waiter (judged
    /// now, not at enqueue) becomes the new holder.
    pub fn release(&self) {
        let woke_higher = scheduler::with_scheduler_mut(|s| {
            let cur = s.current_tid();
            let mut st = self.0.state.lock();
            assert_eq!(st.holder, Some(cur), "lock released by non-holder");

            let next_holder = pick_waiter(s, &st.waiters).map(|idx| {
                let tid = st.waiters.remove(idx);
                st.holder = Some(tid);
                tid
            });
            if next_holder.is_none() {
                st.holder = None;
            }
            drop(st);

            let t = s.thread_mut(cur).expect("release: current thread vanished");
            t.held_locks.retain(|l| l != self);
            s.refresh_effective(cur);

            match next_holder {
                Some(tid) => {
                    let w = s.thread_mut(tid).expect("release: waiter vanished");
                    w.blocked_on = None;
                    w.held_locks.push(self.clone());
                    s.unblock(tid)
                }
                None => false,
            }
        });
        scheduler::note_wakeup(woke_higher);
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

/// Propagate `from`'s effective priority down the chain of lock holders,
/// starting at `lock`. Stops early when a holder already ranks at least
/// as high, or when the chain ends or exceeds the depth bound.
fn donate_chain(s: &mut Scheduler, from: ThreadId, lock: &Lock) {
    let mut donated = s.effective(from);
    let mut lock = lock.clone();
    for _ in 0..DONATION_DEPTH_MAX {
        let Some(holder) = lock.holder() else { return };
        if s.effective(holder) >= donated {
            return;
        }
        s.donate(holder, donated);
        donated = s.effective(holder);
        match s.thread(holder).and_then(|t| t.blocked_on.clone()) {
            Some(next) => lock = next,
            None => return,
        }
    }
}

/// A condition variable.
///
/// Each waiter sleeps on its own one-shot semaphore, so `signal` can wake
/// exactly one thread, the highest-priority one at signal time.
pub struct Condvar {
    waiters: Mutex<Vec<CondWaiter>>,
}

struct CondWaiter {
    tid: ThreadId,
    sema: Semaphore,
}

impl Condvar {
    pub fn new() -> Condvar {
        Condvar { waiters: Mutex::new(Vec::new()) }
    }

    /// Atomically release `lock` and wait to be signalled; reacquires
    /// `lock` before returning.
    pub fn wait(&self, lock: &Lock) {
        let sema = self.wait_enqueue(lock);
        lock.release();
        sema.down();
        lock.acquire();
    }

    /// First half of `wait`: register the calling thread. Split out so
    /// the release/block/reacquire steps stay individually observable.
    pub(crate) fn wait_enqueue(&self, lock: &Lock) -> Semaphore {
        assert!(lock.held_by_current(), "cond wait without the lock");
        let sema = Semaphore::new(0);
        self.waiters.lock().push(CondWaiter {
            tid: scheduler::current_id(),
            sema: sema.clone(),
        });
        sema
    }

    /// Wake the highest-priority waiter, if any.
    pub fn signal(&self, lock: &Lock) {
        assert!(lock.held_by_current(), "cond signal without the lock");
        let waiter = {
            let mut ws = self.waiters.lock();
            let idx = scheduler::with_scheduler(|s| {
                let tids: Vec<ThreadId> = ws.iter().map(|w| w.tid).collect();
                pick_waiter(s, &tids)
            });
            idx.map(|i| ws.remove(i))
        };
        if let Some(w) = waiter {
            w.sema.up();
        }
    }

    /// Wake every waiter, highest priority first.
    pub fn broadcast(&self, lock: &Lock) {
        while !self.waiters.lock().is_empty() {
            self.signal(lock);
        }
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.lock().is_empty()
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler;

    #[test]
    fn semaphore_counts_without_contention() {
        let _serial = crate::test_sync::lock();
        scheduler::init(false);

        let sema = Semaphore::new(2);
        sema.down();
        sema.down();
        assert_eq!(sema.value(), 0);
        assert!(!sema.try_down());
        sema.up();
        assert_eq!(sema.value(), 1);
        assert!(sema.try_down());
    }

    #[test]
    fn lock_tracks_holder_and_held_list() {
        let _serial = crate::test_sync::lock();
        scheduler::init(false);

        let lock = Lock::new();
        assert_eq!(lock.holder(), None);
        assert!(!lock.held_by_current());

        lock.acquire();
        assert!(lock.held_by_current());
        let held = scheduler::with_current(|t| t.held_locks.len());
        assert_eq!(held, 1);

        // A lock held by us cannot be try-acquired again.
        assert!(!lock.try_acquire());

        lock.release();
        assert_eq!(lock.holder(), None);
        let held = scheduler::with_current(|t| t.held_locks.len());
        assert_eq!(held, 0);
    }

    #[test]
    #[should_panic(expected = "lock released by non-holder")]
    fn release_requires_holder() {
        let _serial = crate::test_sync::lock();
        scheduler::init(false);
        Lock::new().release();
    }

    #[test]
    fn no_locks_means_effective_equals_base() {
        let _serial = crate::test_sync::lock();
        scheduler::init(false);

        let lock = Lock::new();
        lock.acquire();
        lock.release();
        let (base, effective) =
            scheduler::with_current(|t| (t.priority, t.effective));
        assert_eq!(base, effective);
    }
}
