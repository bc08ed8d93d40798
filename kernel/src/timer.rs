/*
 * System Timer and Tickless Sleep
 *
 * A 100 Hz tick drives everything time-related: the monotonic tick
 * counter, wake-ups of sleeping threads, and the scheduler's preemption
 * decision. Sleeping is tickless on the thread's side: a sleeper parks on
 * its own one-shot semaphore in a deadline-ordered queue and is woken by
 * the tick hook, so no thread ever spins waiting for its deadline.
 *
 * Sub-tick delays busy-wait instead; they are for device-driver use and
 * never block.
 */

use alloc::vec::Vec;
use spin::Mutex;

use crate::intr;
use crate::scheduler::{self, ThreadId};
use crate::sync::Semaphore;

/// Timer interrupts per second.
pub const TICKS_PER_SEC: u64 = 100;

/// Ticks since boot.
static TICKS: Mutex<u64> = Mutex::new(0);

/// Threads asleep, ordered by non-decreasing deadline. Entries with equal
/// deadlines keep their insertion order.
static SLEEPERS: Mutex<Vec<SleepEntry>> = Mutex::new(Vec::new());

struct SleepEntry {
    deadline: u64,
    tid: ThreadId,
    sema: Semaphore,
}

/// Current tick count.
pub fn ticks() -> u64 {
    *TICKS.lock()
}

/// Ticks elapsed since `then`.
pub fn elapsed(then: u64) -> u64 {
    ticks().saturating_sub(then)
}

/// Sleep for at least `n` ticks. Returns immediately when `n <= 0`.
pub fn sleep(n: i64) {
    if n <= 0 {
        return;
    }
    let sema = Semaphore::new(0);
    let deadline = ticks() + n as u64;
    {
        let mut sleepers = SLEEPERS.lock();
        let pos = sleepers
            .iter()
            .position(|e| e.deadline > deadline)
            .unwrap_or(sleepers.len());
        sleepers.insert(
            pos,
            SleepEntry { deadline, tid: scheduler::current_id(), sema: sema.clone() },
        );
    }
    sema.down();
}

/// Sleep for approximately `ms` milliseconds.
pub fn msleep(ms: i64) {
    real_time_sleep(ms, 1000);
}

/// Sleep for approximately `us` microseconds.
pub fn usleep(us: i64) {
    real_time_sleep(us, 1000 * 1000);
}

/// Sleep for approximately `ns` nanoseconds.
pub fn nsleep(ns: i64) {
    real_time_sleep(ns, 1000 * 1000 * 1000);
}

/// Sleep `num`/`denom` seconds: whole ticks asleep, the sub-tick
/// remainder as a busy wait.
fn real_time_sleep(num: i64, denom: i64) {
    let whole_ticks = num * TICKS_PER_SEC as i64 / denom;
    if whole_ticks > 0 {
        sleep(whole_ticks);
    } else if num > 0 {
        busy_wait(num * LOOPS_PER_SEC / denom);
    }
}

/// Busy-wait for approximately `ms` milliseconds.
pub fn mdelay(ms: i64) {
    busy_wait(ms * LOOPS_PER_SEC / 1000);
}

/// Busy-wait for approximately `us` microseconds.
pub fn udelay(us: i64) {
    busy_wait(us * LOOPS_PER_SEC / (1000 * 1000));
}

/// Busy-wait for approximately `ns` nanoseconds.
pub fn ndelay(ns: i64) {
    busy_wait(ns * LOOPS_PER_SEC / (1000 * 1000 * 1000));
}

/// Nominal spin-loop iterations per second. A boot-time calibration
/// against the tick counter would refine this; the delays only need
/// order-of-magnitude accuracy.
const LOOPS_PER_SEC: i64 = 100_000_000;

fn busy_wait(loops: i64) {
    for _ in 0..loops.max(0) {
        core::hint::spin_loop();
    }
}

/// Number of threads currently asleep, for diagnostics.
pub fn sleeper_count() -> usize {
    SLEEPERS.lock().len()
}

/// The 100 Hz tick. Called by the timer interrupt on the target and by
/// the test harnesses directly. Returns true when the running thread
/// should yield on the way out of the handler.
pub fn interrupt_tick() -> bool {
    intr::enter_handler();

    let now = {
        let mut t = TICKS.lock();
        *t += 1;
        *t
    };

    // Pull every entry whose deadline arrived, in queue order, and wake
    // it. The queue is deadline-sorted, so wakes fire in deadline order.
    let due: Vec<SleepEntry> = {
        let mut sleepers = SLEEPERS.lock();
        let n = sleepers.iter().take_while(|e| e.deadline <= now).count();
        sleepers.drain(..n).collect()
    };
    for entry in due {
        log::trace!("waking {} at tick {}", entry.tid, now);
        entry.sema.up();
    }

    let preempt = scheduler::note_tick(now);
    intr::leave_handler();
    preempt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonpositive_sleep_returns_immediately() {
        let _serial = crate::test_sync::lock();
        scheduler::init(false);
        sleep(0);
        sleep(-5);
        assert_eq!(sleeper_count(), 0);
    }

    #[test]
    fn ticks_are_monotonic() {
        let _serial = crate::test_sync::lock();
        scheduler::init(false);
        let before = ticks();
        interrupt_tick();
        interrupt_tick();
        assert_eq!(elapsed(before), 2);
    }

    #[test]
    fn sleepers_stay_queued_until_deadline() {
        let _serial = crate::test_sync::lock();
        scheduler::init(false);

        // Park the main thread's entry; on the portable build `sleep`
        // returns after blocking, with the entry still queued.
        sleep(3);
        assert_eq!(sleeper_count(), 1);

        interrupt_tick();
        assert_eq!(sleeper_count(), 1);
        interrupt_tick();
        interrupt_tick();
        assert_eq!(sleeper_count(), 0);
    }
}
