/*
 * Priority Donation Scenarios
 *
 * The classic inversion setups: a low-priority lock holder must inherit
 * the priority of whoever waits on it, transitively along chains, and
 * fall back to its base the moment it releases.
 */

use crate::process;
use crate::scheduler::{self, ThreadId, ThreadState};
use crate::sync::{Condvar, Lock, Semaphore};

fn effective(tid: ThreadId) -> i32 {
    scheduler::with_scheduler(|s| s.effective(tid))
}

fn state(tid: ThreadId) -> ThreadState {
    scheduler::with_scheduler(|s| s.thread(tid).map(|t| t.state).unwrap())
}

#[test]
fn single_donation_schedules_holder_then_waiter() {
    let _serial = crate::test_sync::lock();
    scheduler::init(false);

    // Step down so the players outrank the orchestrating thread.
    scheduler::set_priority(5);

    let lock_a = Lock::new();

    // L (priority 10) takes the lock.
    let l = scheduler::spawn("L", 10, || {});
    assert_eq!(scheduler::current_id(), l);
    lock_a.acquire();
    assert_eq!(lock_a.holder(), Some(l));

    // H (priority 40) preempts and blocks on the lock: L inherits 40.
    let h = scheduler::spawn("H", 40, || {});
    assert_eq!(scheduler::current_id(), h);
    lock_a.acquire();

    assert_eq!(scheduler::current_id(), l, "holder must run on H's donation");
    assert_eq!(effective(l), 40);
    assert_eq!(state(h), ThreadState::Blocked);

    // M (priority 30) becomes ready but cannot pass the donated 40.
    let m = scheduler::spawn("M", 30, || {});
    assert_eq!(scheduler::current_id(), l, "M must not preempt the donee");

    // Release: the donation evaporates, H takes the lock and the CPU.
    lock_a.release();
    assert_eq!(scheduler::current_id(), h);
    assert_eq!(lock_a.holder(), Some(h));
    assert_eq!(effective(l), 10, "no locks held means base priority");

    // H finishes, then M, then L: the S1 order.
    lock_a.release();
    process::exit_current(0);
    assert_eq!(scheduler::current_id(), m);
    process::exit_current(0);
    assert_eq!(scheduler::current_id(), l);
}

#[test]
fn donation_propagates_along_a_chain() {
    let _serial = crate::test_sync::lock();
    scheduler::init(false);
    scheduler::set_priority(3);

    let lock_a = Lock::new();
    let lock_b = Lock::new();

    // L holds A.
    let l = scheduler::spawn("L", 10, || {});
    assert_eq!(scheduler::current_id(), l);
    lock_a.acquire();

    // M holds B and blocks on A: L inherits 30.
    let m = scheduler::spawn("M", 30, || {});
    assert_eq!(scheduler::current_id(), m);
    lock_b.acquire();
    lock_a.acquire();
    assert_eq!(scheduler::current_id(), l);
    assert_eq!(effective(l), 30);

    // H blocks on B: the donation walks B -> M -> A -> L.
    let h = scheduler::spawn("H", 40, || {});
    assert_eq!(scheduler::current_id(), h);
    lock_b.acquire();

    assert_eq!(scheduler::current_id(), l);
    assert_eq!(effective(m), 40, "middle of the chain inherits");
    assert_eq!(effective(l), 40, "head of the chain inherits");

    // L releases A: ownership passes to M, which still carries H's 40.
    lock_a.release();
    assert_eq!(scheduler::current_id(), m);
    assert_eq!(lock_a.holder(), Some(m));
    assert_eq!(effective(l), 10);
    assert_eq!(effective(m), 40, "M still holds B with H waiting");

    // M releases B: H runs; M drops back to base.
    lock_b.release();
    assert_eq!(scheduler::current_id(), h);
    assert_eq!(effective(m), 30);
}

#[test]
fn semaphore_wakes_highest_priority_waiter_at_wake_time() {
    let _serial = crate::test_sync::lock();
    scheduler::init(false);
    scheduler::set_priority(5);

    let sema = Semaphore::new(0);

    let a = scheduler::spawn("A", 40, || {});
    assert_eq!(scheduler::current_id(), a);
    sema.down();
    assert_eq!(state(a), ThreadState::Blocked);

    let b = scheduler::spawn("B", 50, || {});
    assert_eq!(scheduler::current_id(), b);
    sema.down();

    // Both parked; the up must pick B, the higher waiter right now.
    sema.up();
    assert_eq!(scheduler::current_id(), b);
    assert_eq!(state(a), ThreadState::Blocked);
    assert_eq!(sema.waiters(), alloc::vec![a]);

    sema.up();
    assert_eq!(state(a), ThreadState::Ready);
}

#[test]
fn condvar_signal_picks_highest_priority_waiter() {
    let _serial = crate::test_sync::lock();
    scheduler::init(false);
    scheduler::set_priority(5);

    let lock = Lock::new();
    let cond = Condvar::new();

    // Two waiters park on the condition, each on its own one-shot
    // semaphore, releasing the lock as they go.
    let w1 = scheduler::spawn("w1", 40, || {});
    assert_eq!(scheduler::current_id(), w1);
    lock.acquire();
    let s1 = cond.wait_enqueue(&lock);
    lock.release();
    s1.down();

    let w2 = scheduler::spawn("w2", 50, || {});
    assert_eq!(scheduler::current_id(), w2);
    lock.acquire();
    let s2 = cond.wait_enqueue(&lock);
    lock.release();
    s2.down();

    // Signal from the lock holder: w2 outranks w1. Raise our own
    // priority first so the woken thread waits its turn.
    scheduler::set_priority(63);
    lock.acquire();
    cond.signal(&lock);
    assert_eq!(state(w2), ThreadState::Ready);
    assert_eq!(state(w1), ThreadState::Blocked);
    assert!(cond.has_waiters());

    cond.broadcast(&lock);
    assert_eq!(state(w1), ThreadState::Ready);
    assert!(!cond.has_waiters());
    lock.release();
}

#[test]
fn released_locks_stop_contributing_donations() {
    let _serial = crate::test_sync::lock();
    scheduler::init(false);
    scheduler::set_priority(5);

    let lock_a = Lock::new();
    let lock_b = Lock::new();

    // L holds both locks; donors wait on each.
    let l = scheduler::spawn("L", 10, || {});
    assert_eq!(scheduler::current_id(), l);
    lock_a.acquire();
    lock_b.acquire();

    let da = scheduler::spawn("donor-a", 25, || {});
    assert_eq!(scheduler::current_id(), da);
    lock_a.acquire();

    let db = scheduler::spawn("donor-b", 35, || {});
    assert_eq!(scheduler::current_id(), db);
    lock_b.acquire();

    assert_eq!(scheduler::current_id(), l);
    assert_eq!(effective(l), 35);

    // Dropping B hands it to donor-b and leaves only A's donation.
    lock_b.release();
    assert_eq!(scheduler::current_id(), db);

    // donor-b finishes with its lock; back to L, now carrying 25.
    lock_b.release();
    crate::process::exit_current(0);
    assert_eq!(scheduler::current_id(), l);
    assert_eq!(effective(l), 25);
}
