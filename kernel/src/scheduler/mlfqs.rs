/*
 * Advanced (BSD-style) Scheduler Arithmetic
 *
 * Selected at boot with -mlfqs. Priorities are derived, not donated:
 *
 *   priority   = PRI_MAX - recent_cpu/4 - nice*2        (every 4th tick)
 *   recent_cpu = (2*load_avg)/(2*load_avg + 1) * recent_cpu + nice
 *                                                        (once per second)
 *   load_avg   = (59/60)*load_avg + (1/60)*ready_threads (once per second)
 *
 * recent_cpu additionally grows by one on every tick the thread spends on
 * the processor. All arithmetic is Q17.14.
 */

use super::{PRI_MAX, PRI_MIN, Scheduler, ThreadState};
use crate::fixed_point::Fp;
use crate::timer::TICKS_PER_SEC;

/// Priority from scheduling history, clamped to the legal range.
pub fn priority_for(recent_cpu: Fp, nice: i32) -> i32 {
    let raw = PRI_MAX - recent_cpu.div_int(4).trunc() - nice * 2;
    raw.clamp(PRI_MIN, PRI_MAX)
}

/// One step of the recent_cpu decay.
pub fn decay_recent_cpu(recent_cpu: Fp, load_avg: Fp, nice: i32) -> Fp {
    let twice_load = load_avg.mul_int(2);
    twice_load.div(twice_load.add_int(1)).mul(recent_cpu).add_int(nice)
}

/// One step of the load average.
pub fn next_load_avg(load_avg: Fp, ready_threads: i32) -> Fp {
    Fp::from_fraction(59, 60)
        .mul(load_avg)
        .add(Fp::from_fraction(1, 60).mul_int(ready_threads))
}

impl Scheduler {
    /// Advanced-mode tick work. The running thread is charged one tick;
    /// per-second and per-4-tick recomputations follow.
    pub(super) fn mlfqs_tick(&mut self, now: u64) {
        let cur = self.current_tid();
        let idle = self.idle_tid();

        if Some(cur) != idle
            && let Some(t) = self.thread_mut(cur)
        {
            t.recent_cpu = t.recent_cpu.add_int(1);
        }

        if now % TICKS_PER_SEC == 0 {
            // Threads counted toward load: ready plus running, idle aside.
            let mut ready_threads = self
                .threads
                .values()
                .filter(|t| t.state == ThreadState::Ready && Some(t.id) != idle)
                .count() as i32;
            if Some(cur) != idle
                && self.thread(cur).is_some_and(|t| t.state == ThreadState::Running)
            {
                ready_threads += 1;
            }
            self.load_avg = next_load_avg(self.load_avg, ready_threads);

            let load_avg = self.load_avg;
            for t in self.threads.values_mut() {
                t.recent_cpu = decay_recent_cpu(t.recent_cpu, load_avg, t.nice);
            }
        }

        if now % super::PRIORITY_RECALC_TICKS == 0 {
            for t in self.threads.values_mut() {
                t.effective = priority_for(t.recent_cpu, t.nice);
            }
        }
    }
}
