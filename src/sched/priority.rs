//! Priority management: aging, starvation prevention and behaviour learning.
//!
//! These passes run on the owning CPU's tick at the aging cadence, under
//! that CPU's runqueue lock. They only ever relink entities between MLFQ
//! levels of the same runqueue; cross-CPU movement is the balancer's job.

use super::percpu::{CpuRunQueue, RQ_CAP};
use super::types::{
    Behavior, ClassParams, EntityState, QueueId, SchedConfig, MAX_BEHAVIOR_BIAS, MLFQ_LEVELS,
    quantum_for,
};

/// CPU-bound entities above this usage get demoted on the learning pass.
const CPU_HOG_USAGE_PERCENT: u32 = 95;

/// Promote entities that waited past the aging threshold; force entities
/// past the emergency threshold back to their natural level at the head of
/// the queue. Returns whether a reschedule should be requested.
pub(crate) fn aging_scan(rq: &mut CpuRunQueue, now: u64, cfg: &SchedConfig) -> bool {
    let threshold_ns = cfg.aging_threshold_ms as u64 * 1_000_000;
    let emergency_ns = cfg.aging_emergency_threshold_ms as u64 * 1_000_000;
    let mut buf = [0u16; RQ_CAP];
    let mut need_resched = false;

    for level in 1..MLFQ_LEVELS as u8 {
        let n = rq.collect_queue(QueueId::Mlfq(level), &mut buf);
        for &slot in &buf[..n] {
            let (waited, natural) = {
                let e = rq.task(slot);
                let natural = match &e.params {
                    ClassParams::Mlfq(m) => m.tier.natural_level(),
                    _ => continue,
                };
                (now.saturating_sub(e.wait_start_ns), natural)
            };

            if waited >= emergency_ns {
                // Severely starved: go straight back to the natural level,
                // ahead of everything already waiting there.
                let target = natural.min(level - 1);
                rq.unlink(slot);
                let e = rq.task_mut(slot);
                if let ClassParams::Mlfq(m) = &mut e.params {
                    m.level = target;
                    m.quantum_remaining_ns = quantum_for(target);
                }
                e.boost_count += 1;
                rq.link_head(QueueId::Mlfq(target), slot);
                need_resched = true;
            } else if waited >= threshold_ns {
                let target = level - 1;
                rq.unlink(slot);
                let e = rq.task_mut(slot);
                if let ClassParams::Mlfq(m) = &mut e.params {
                    m.level = target;
                    m.quantum_remaining_ns = quantum_for(target);
                }
                e.boost_count += 1;
                rq.link_tail(QueueId::Mlfq(target), slot);
            }
        }
    }

    need_resched
}

/// Reclassify behaviour from cheap counters and apply the bounded
/// dynamic-priority bias. CPU hogs waiting in a queue get demoted one
/// level; interactive and I/O-bound entities drift back toward their
/// natural level.
pub(crate) fn behavior_pass(rq: &mut CpuRunQueue) {
    let mut buf = [0u16; RQ_CAP];
    let mut n = 0;
    for slot in rq.slots() {
        buf[n] = slot;
        n += 1;
    }

    for &slot in &buf[..n] {
        let e = rq.task_mut(slot);

        let denom = e.total_runtime_ns + e.total_wait_ns + e.total_blocked_ns;
        if denom > 0 {
            e.cpu_usage_percent = ((e.total_runtime_ns as u128 * 100) / denom as u128) as u32;
            e.io_wait_percent = ((e.total_blocked_ns as u128 * 100) / denom as u128) as u32;
        }

        e.behavior = if e.cpu_usage_percent > 80 {
            Behavior::CpuBound
        } else if e.io_wait_percent > 50 {
            Behavior::IoBound
        } else if e.voluntary_switches > e.involuntary_switches * 2 {
            Behavior::Interactive
        } else if e.is_gaming() {
            Behavior::Gaming
        } else {
            Behavior::Unknown
        };

        if e.mlfq().is_none() {
            continue;
        }

        match e.behavior {
            Behavior::CpuBound => {
                if e.dynamic_priority < e.static_priority + MAX_BEHAVIOR_BIAS {
                    e.dynamic_priority += 1;
                }
                let hog = e.cpu_usage_percent > CPU_HOG_USAGE_PERCENT
                    || e.dynamic_priority - e.static_priority >= MAX_BEHAVIOR_BIAS / 2;
                let queued = e.state == EntityState::Queued;
                let level = e.mlfq().map(|m| m.level).unwrap_or(0);
                if hog && queued && level < MLFQ_LEVELS as u8 - 1 {
                    shift_level(rq, slot, level + 1);
                }
            }
            Behavior::Interactive | Behavior::IoBound => {
                if e.dynamic_priority > e.static_priority {
                    e.dynamic_priority -= 1;
                }
                let queued = e.state == EntityState::Queued;
                let (level, natural) = match e.mlfq() {
                    Some(m) => (m.level, m.tier.natural_level()),
                    None => continue,
                };
                if queued && level > natural {
                    shift_level(rq, slot, level - 1);
                }
            }
            _ => {}
        }
    }
}

/// Move a queued MLFQ entity to another level (tail), resetting its quantum.
fn shift_level(rq: &mut CpuRunQueue, slot: u16, target: u8) {
    rq.unlink(slot);
    let e = rq.task_mut(slot);
    if let ClassParams::Mlfq(m) = &mut e.params {
        m.level = target;
        m.quantum_remaining_ns = quantum_for(target);
    }
    rq.link_tail(QueueId::Mlfq(target), slot);
}
