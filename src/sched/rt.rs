//! Real-time class: policies, deadlines and bandwidth control.
//!
//! The RT class may consume at most `rt.bandwidth_ns` of CPU inside each
//! `rt.period_ns` window (95% of one second by default), across all CPUs.
//! Consumption is accounted on the tick of whichever CPU is running an RT
//! entity; once the budget is spent, pick-next skips the RT queues until
//! the window rolls over. Deadline misses are counted, never fatal.

use crate::platform::{Pid, Platform};
use crate::kdebug;

use super::core::Scheduler;
use super::types::{ClassParams, RtParams, RtPolicy, SchedError, RT_RR_QUANTUM_NS};

/// Global RT bandwidth window, under its own lock.
pub(crate) struct RtBandwidth {
    pub consumed_ns: u64,
    pub period_start_ns: u64,
}

impl RtBandwidth {
    pub const fn new() -> Self {
        Self {
            consumed_ns: 0,
            period_start_ns: 0,
        }
    }

    /// Advance the window to cover `now`. Returns whether the period
    /// rolled over (budget replenished).
    pub fn advance(&mut self, now: u64, period_ns: u64) -> bool {
        if period_ns == 0 {
            return false;
        }
        if self.period_start_ns == 0 {
            self.period_start_ns = now;
            return false;
        }
        let mut rolled = false;
        while now.saturating_sub(self.period_start_ns) >= period_ns {
            self.period_start_ns += period_ns;
            self.consumed_ns = 0;
            rolled = true;
        }
        rolled
    }
}

impl Scheduler {
    /// Put a process under a real-time policy. Converts MLFQ entities to
    /// the RT class; gaming entities are rejected (drop the boost first).
    pub fn rt_set_policy<P: Platform>(
        &self,
        p: &P,
        pid: Pid,
        policy: RtPolicy,
    ) -> Result<(), SchedError> {
        let now = p.now_ns();
        self.with_task(pid, |rq, slot| {
            let e = rq.task(slot);
            match &e.params {
                ClassParams::Gaming(_) => return Err(SchedError::InvalidPolicy),
                ClassParams::Realtime(_) => {
                    let e = rq.task_mut(slot);
                    if let Some(r) = e.rt_mut() {
                        r.policy = policy;
                        if policy == RtPolicy::Rr {
                            r.quantum_remaining_ns = RT_RR_QUANTUM_NS;
                        }
                    }
                    return Ok(());
                }
                ClassParams::Mlfq(_) => {}
            }

            let was_queued = e.queue.is_some();
            if was_queued {
                rq.unlink(slot);
            }
            {
                let e = rq.task_mut(slot);
                e.params = ClassParams::Realtime(RtParams::new(policy));
            }
            if was_queued {
                rq.enqueue(slot, now);
                self.check_preempt(rq, slot);
            }
            kdebug!("rt: pid {} now {:?}", pid, policy);
            Ok(())
        })?
    }

    /// Install an absolute deadline for an RT entity.
    pub fn rt_set_deadline(&self, pid: Pid, deadline_ns: u64) -> Result<(), SchedError> {
        self.with_task(pid, |rq, slot| {
            let e = rq.task_mut(slot);
            match e.rt_mut() {
                Some(r) => {
                    r.deadline_ns = deadline_ns;
                    r.deadline_flagged = false;
                    Ok(())
                }
                None => Err(SchedError::InvalidPolicy),
            }
        })?
    }

    /// Set the period for a periodic RT entity.
    pub fn rt_set_period(&self, pid: Pid, period_ns: u64) -> Result<(), SchedError> {
        self.with_task(pid, |rq, slot| {
            let e = rq.task_mut(slot);
            match e.rt_mut() {
                Some(r) => {
                    r.period_ns = period_ns;
                    Ok(())
                }
                None => Err(SchedError::InvalidPolicy),
            }
        })?
    }

    /// Set the per-period runtime budget for an RT entity.
    pub fn rt_set_runtime_budget(&self, pid: Pid, budget_ns: u64) -> Result<(), SchedError> {
        self.with_task(pid, |rq, slot| {
            let e = rq.task_mut(slot);
            match e.rt_mut() {
                Some(r) => {
                    r.runtime_budget_ns = budget_ns;
                    Ok(())
                }
                None => Err(SchedError::InvalidPolicy),
            }
        })?
    }

    /// Is the RT class currently throttled?
    pub fn rt_is_throttled(&self) -> bool {
        self.rt_throttled.load(core::sync::atomic::Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bandwidth_window_initializes_lazily() {
        let mut bw = RtBandwidth::new();
        assert!(!bw.advance(5_000, 1_000_000_000));
        assert_eq!(bw.period_start_ns, 5_000);
        assert_eq!(bw.consumed_ns, 0);
    }

    #[test]
    fn bandwidth_rolls_over_and_replenishes() {
        let mut bw = RtBandwidth::new();
        bw.advance(0, 0);
        bw.period_start_ns = 1_000;
        bw.consumed_ns = 950_000_000;

        // Still inside the window.
        assert!(!bw.advance(900_000_000, 1_000_000_000));
        assert_eq!(bw.consumed_ns, 950_000_000);

        // Past the window: budget replenished, start advanced.
        assert!(bw.advance(1_000_001_000, 1_000_000_000));
        assert_eq!(bw.consumed_ns, 0);
        assert_eq!(bw.period_start_ns, 1_000_001_000);
    }

    #[test]
    fn bandwidth_skips_multiple_periods() {
        let mut bw = RtBandwidth::new();
        bw.period_start_ns = 1;
        bw.consumed_ns = 500;
        assert!(bw.advance(3_500_000_001, 1_000_000_000));
        assert_eq!(bw.period_start_ns, 3_000_000_001);
        assert_eq!(bw.consumed_ns, 0);
    }
}
