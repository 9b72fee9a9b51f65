//! Gaming fast path: frame deadlines, input boosts, VSync alignment.
//!
//! Gaming mode is a scheduler-wide switch. While it is on, gaming entities
//! live on a dedicated per-CPU queue that pick-next drains ahead of every
//! other class, the timer runs at 1 kHz for sub-millisecond dispatch, and
//! the gaming CPU set (the performance cores by default) gets a
//! max-frequency hint.
//!
//! Entering the gaming class happens only through `gaming_boost`; the
//! name-pattern detector and the behaviour heuristics set a classifier
//! hint, nothing more.

use core::sync::atomic::Ordering;

use crate::platform::{Pid, Platform};
use crate::{kdebug, kinfo};

use super::core::Scheduler;
use super::percpu::{CpuRunQueue, RQ_CAP};
use super::types::{
    ClassParams, EntityState, GamingConfig, GamingParams, MlfqParams, MlfqTier, QueueId,
    SchedConfig, SchedEntity, SchedError,
};

/// Timer cadence in gaming mode (1 kHz) and out of it (100 Hz).
pub const GAMING_TIMER_INTERVAL_NS: u64 = 1_000_000;
pub const NORMAL_TIMER_INTERVAL_NS: u64 = 10_000_000;

/// Pacing never delays a frame by more than this.
const MAX_PACING_DELAY_NS: u64 = 1_000_000;

/// Thread-name fragments that mark a process as likely gaming work.
const GAMING_NAME_PATTERNS: [&str; 16] = [
    "render", "game", "audio", "input", "physics", "network", "streaming", "capture", "overlay",
    "engine", "dx11", "dx12", "vulkan", "opengl", "unity", "unreal",
];

/// Result of frame accounting at dispatch-out.
pub(crate) enum FrameOutcome {
    None,
    Met,
    Missed,
}

/// Frame accounting on dispatch-out: smooth the observed frame time
/// (alpha = 0.1) and either record the miss or compute a pacing delay for
/// the early finish.
pub(crate) fn frame_dispatch_out(e: &mut SchedEntity, now: u64) -> FrameOutcome {
    let Some(g) = e.gaming_mut() else {
        return FrameOutcome::None;
    };
    if g.frame_start_ns == 0 || g.frame_deadline_ns == 0 {
        return FrameOutcome::None;
    }

    let actual = now.saturating_sub(g.frame_start_ns);
    g.smooth_frame_ns = if g.smooth_frame_ns == 0 {
        actual
    } else {
        (g.smooth_frame_ns * 9 + actual) / 10
    };
    g.frame_start_ns = now;

    let target = g.frame_target_ns();
    if actual > target {
        g.frame_misses += 1;
        FrameOutcome::Missed
    } else {
        g.frames_completed += 1;
        g.pacing_delay_ns = (target - actual).min(MAX_PACING_DELAY_NS);
        FrameOutcome::Met
    }
}

/// Tick-side pass over the gaming queue: expire input boosts and pull the
/// most urgent frame deadline to the head. Returns whether the CPU should
/// reschedule for an urgent frame.
pub(crate) fn urgency_pass(rq: &mut CpuRunQueue, now: u64, cfg: &SchedConfig) -> bool {
    if rq.gaming.count == 0 {
        return false;
    }
    let urgency = cfg.gaming.urgency_threshold_ns;

    let mut buf = [0u16; RQ_CAP];
    let n = rq.collect_queue(QueueId::Gaming, &mut buf);
    let mut urgent: Option<(u16, u64)> = None;
    for &slot in &buf[..n] {
        let expired = rq
            .task(slot)
            .gaming()
            .map_or(false, |g| g.boost_expiry_ns != 0 && now >= g.boost_expiry_ns);
        if expired {
            let e = rq.task_mut(slot);
            if let Some(g) = e.gaming_mut() {
                g.boost_expiry_ns = 0;
            }
            e.dynamic_priority = -20;
        }
        if let Some(g) = rq.task(slot).gaming() {
            if g.frame_deadline_ns != 0 && g.frame_deadline_ns <= now + urgency {
                match urgent {
                    Some((_, d)) if d <= g.frame_deadline_ns => {}
                    _ => urgent = Some((slot, g.frame_deadline_ns)),
                }
            }
        }
    }

    if let Some((slot, _)) = urgent {
        if rq.gaming.head != Some(slot) {
            rq.unlink(slot);
            rq.link_head(QueueId::Gaming, slot);
        }
        return true;
    }
    false
}

impl Scheduler {
    // ------------------------------------------------------------------
    // Mode switches
    // ------------------------------------------------------------------

    /// Turn gaming mode on: 1 kHz timer, gaming CPU set, max-frequency
    /// hints for those CPUs.
    pub fn gaming_enable<P: Platform>(&self, p: &P) {
        let mask = {
            let mut cfg = self.config.lock();
            cfg.gaming.enabled = true;
            cfg.gaming
                .cpu_mask
                .unwrap_or_else(|| self.topology.performance_mask())
        };
        let mask = if mask.and(self.topology.online_mask()).is_empty() {
            self.topology.online_mask()
        } else {
            mask
        };
        self.gaming_cpus.store(mask.0, Ordering::Release);
        self.gaming_on.store(true, Ordering::Release);

        p.arm_timer(GAMING_TIMER_INTERVAL_NS);
        for cpu in mask.iter() {
            let info = self.topology.cpu(cpu);
            p.frequency_hint(cpu, info.desc.max_mhz);
            info.current_mhz.store(info.desc.max_mhz, Ordering::Relaxed);
        }
        kinfo!("gaming mode enabled: cpus {:#x}, 1kHz tick", mask.0);
    }

    /// Turn gaming mode off and return every gaming entity to its saved
    /// MLFQ tier.
    pub fn gaming_disable<P: Platform>(&self, p: &P) {
        self.gaming_on.store(false, Ordering::Release);
        self.config.lock().gaming.enabled = false;
        let now = p.now_ns();

        p.arm_timer(NORMAL_TIMER_INTERVAL_NS);
        for cpu in 0..self.topology.nr_cpus() {
            let info = self.topology.cpu(cpu);
            p.frequency_hint(cpu, info.desc.base_mhz);
            info.current_mhz.store(info.desc.base_mhz, Ordering::Relaxed);
        }

        for cpu in 0..self.topology.nr_cpus() {
            let mut rq = self.slot(cpu).rq.lock();
            let mut buf = [0u16; RQ_CAP];
            let mut n = 0;
            for slot in rq.slots() {
                buf[n] = slot;
                n += 1;
            }
            for &slot in &buf[..n] {
                if !rq.task(slot).is_gaming() {
                    continue;
                }
                let was_queued = rq.task(slot).queue.is_some();
                if was_queued {
                    rq.unlink(slot);
                }
                let e = rq.task_mut(slot);
                let saved = match &e.params {
                    ClassParams::Gaming(g) => g.saved_tier,
                    _ => MlfqTier::Normal,
                };
                e.params = ClassParams::Mlfq(MlfqParams::new(saved));
                e.dynamic_priority = e.static_priority;
                if was_queued {
                    rq.enqueue(slot, now);
                }
            }
            self.refresh_runnable(&rq);
            drop(rq);
            self.note_resched(cpu);
        }
        kinfo!("gaming mode disabled");
    }

    /// Replace the gaming configuration. The enabled flag follows the
    /// actual mode, not the struct.
    pub fn gaming_configure(&self, gaming: GamingConfig) {
        let enabled = self.gaming_on.load(Ordering::Acquire);
        let mut cfg = self.config.lock();
        cfg.gaming = gaming;
        cfg.gaming.enabled = enabled;
        if enabled {
            if let Some(mask) = gaming.cpu_mask {
                self.gaming_cpus.store(mask.0, Ordering::Release);
            }
        }
    }

    // ------------------------------------------------------------------
    // Per-process operations
    // ------------------------------------------------------------------

    /// Promote a process into the gaming class: top priority, affinity
    /// narrowed to the gaming set, re-placed onto the best performance
    /// core.
    pub fn gaming_boost<P: Platform>(&self, p: &P, pid: Pid) -> Result<(), SchedError> {
        if !self.gaming_enabled() {
            return Err(SchedError::InvalidPolicy);
        }
        let now = p.now_ns();
        let gmask = self.gaming_cpu_mask();
        let fps = self.cfg().gaming.frame_rate_target;

        let state = self.with_task(pid, |rq, slot| {
            let (new_aff, already_gaming, saved, was_queued) = {
                let e = rq.task(slot);
                let saved = match &e.params {
                    ClassParams::Mlfq(m) => m.tier,
                    _ => MlfqTier::Normal,
                };
                (
                    e.cpu_affinity.and(gmask),
                    e.is_gaming(),
                    saved,
                    e.queue.is_some(),
                )
            };
            if new_aff.is_empty() {
                return Err(SchedError::AffinityEmpty);
            }
            if already_gaming {
                let e = rq.task_mut(slot);
                e.dynamic_priority = -20;
                e.boost_count += 1;
                return Ok(e.state);
            }
            if was_queued {
                rq.unlink(slot);
            }
            {
                let e = rq.task_mut(slot);
                e.cpu_affinity = new_aff;
                e.params = ClassParams::Gaming(GamingParams::new(fps, saved));
                e.dynamic_priority = -20;
                e.boost_count += 1;
            }
            if was_queued {
                rq.enqueue(slot, now);
                self.check_preempt(rq, slot);
            }
            Ok(rq.task(slot).state)
        })??;

        // Prefer the least-loaded performance core inside the narrowed
        // affinity. A running entity stays put until its next dispatch.
        if state == EntityState::Queued {
            let snapshot = self.with_task(pid, |rq, slot| *rq.task(slot))?;
            let perf = snapshot
                .cpu_affinity
                .and(self.topology.performance_mask())
                .and(self.topology.schedulable_mask());
            if !perf.is_empty() {
                let target = self.least_loaded(perf);
                if target != snapshot.last_cpu {
                    let _ = self.move_task(pid, snapshot.last_cpu, target, now, false);
                }
            }
        }
        kdebug!("gaming: pid {} boosted", pid);
        Ok(())
    }

    /// Install the next frame deadline. Non-gaming processes are boosted
    /// first (gaming mode must be on).
    pub fn gaming_set_frame_deadline<P: Platform>(
        &self,
        p: &P,
        pid: Pid,
        deadline_ns: u64,
    ) -> Result<(), SchedError> {
        let is_gaming = self.with_task(pid, |rq, slot| rq.task(slot).is_gaming())?;
        if !is_gaming {
            self.gaming_boost(p, pid)?;
        }
        let now = p.now_ns();
        let urgency = self.cfg().gaming.urgency_threshold_ns;
        self.with_task(pid, |rq, slot| {
            {
                let e = rq.task_mut(slot);
                if let Some(g) = e.gaming_mut() {
                    g.frame_deadline_ns = deadline_ns;
                    g.frame_start_ns = now;
                }
            }
            let e = rq.task(slot);
            if e.state == EntityState::Queued {
                if deadline_ns <= now + urgency && e.queue == Some(QueueId::Gaming) {
                    rq.unlink(slot);
                    rq.link_head(QueueId::Gaming, slot);
                }
                self.check_preempt(rq, slot);
            }
        })
    }

    /// Input event: temporary priority boost, expiring on the tick after
    /// `input_boost_duration_ns`. A no-op for non-gaming processes.
    pub fn gaming_input_event<P: Platform>(&self, p: &P, pid: Pid) -> Result<(), SchedError> {
        let now = p.now_ns();
        let cfg = self.cfg();
        self.with_task(pid, |rq, slot| {
            let e = rq.task_mut(slot);
            let Some(g) = e.gaming_mut() else {
                return;
            };
            g.boost_expiry_ns = now + cfg.gaming.input_boost_duration_ns;
            g.last_input_ns = now;
            e.dynamic_priority = cfg.gaming.input_boost_priority;
            e.boost_count += 1;
            self.counters.input_boosts.fetch_add(1, Ordering::Relaxed);
            if e.state == EntityState::Queued {
                self.check_preempt(rq, slot);
            }
        })
    }

    /// VSync pulse: rebase every gaming entity's frame deadline to
    /// `vsync + frame_target`.
    pub fn gaming_vsync_event<P: Platform>(&self, p: &P) {
        let now = p.now_ns();
        self.vsync_ns.store(now, Ordering::Release);
        for cpu in 0..self.topology.nr_cpus() {
            let mut rq = self.slot(cpu).rq.lock();
            let mut buf = [0u16; RQ_CAP];
            let mut n = 0;
            for slot in rq.slots() {
                buf[n] = slot;
                n += 1;
            }
            for &slot in &buf[..n] {
                let e = rq.task_mut(slot);
                if let Some(g) = e.gaming_mut() {
                    g.frame_deadline_ns = now + g.frame_target_ns();
                    g.frame_start_ns = now;
                }
            }
        }
    }

    /// Process-name hint for gaming detection. Matching names only set the
    /// behaviour hint; the class changes through `gaming_boost` alone.
    /// Returns whether the name matched.
    pub fn task_name_hint(&self, pid: Pid, name: &str) -> Result<bool, SchedError> {
        let matched = GAMING_NAME_PATTERNS
            .iter()
            .any(|pat| contains_ignore_case(name, pat));
        if matched {
            self.with_task(pid, |rq, slot| {
                rq.task_mut(slot).behavior = super::types::Behavior::Gaming;
            })?;
        }
        Ok(matched)
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    let h = haystack.as_bytes();
    let n = needle.as_bytes();
    if n.is_empty() || h.len() < n.len() {
        return false;
    }
    h.windows(n.len()).any(|w| w.eq_ignore_ascii_case(n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::CpuMask;

    fn gaming_entity(fps: u32) -> SchedEntity {
        SchedEntity::new(
            1,
            ClassParams::Gaming(GamingParams::new(fps, MlfqTier::Normal)),
            CpuMask::first_n(1),
            0,
            0,
        )
    }

    #[test]
    fn name_patterns_match_case_insensitively() {
        assert!(contains_ignore_case("VulkanWorker", "vulkan"));
        assert!(contains_ignore_case("my-render-thread", "render"));
        assert!(contains_ignore_case("UnrealEngine", "unreal"));
        assert!(!contains_ignore_case("database", "game"));
        assert!(!contains_ignore_case("io", "input"));
    }

    #[test]
    fn frame_on_time_paces() {
        let mut e = gaming_entity(60);
        {
            let g = e.gaming_mut().unwrap();
            g.frame_deadline_ns = 20_000_000;
            g.frame_start_ns = 1_000_000;
        }
        // 10 ms frame against a ~16.6 ms target: met, pacing capped at 1 ms.
        let outcome = frame_dispatch_out(&mut e, 11_000_000);
        assert!(matches!(outcome, FrameOutcome::Met));
        let g = e.gaming().unwrap();
        assert_eq!(g.frames_completed, 1);
        assert_eq!(g.pacing_delay_ns, MAX_PACING_DELAY_NS);
        assert_eq!(g.smooth_frame_ns, 10_000_000);
        assert_eq!(g.frame_start_ns, 11_000_000);
    }

    #[test]
    fn frame_overrun_counts_miss() {
        let mut e = gaming_entity(60);
        {
            let g = e.gaming_mut().unwrap();
            g.frame_deadline_ns = 20_000_000;
            g.frame_start_ns = 1_000_000;
        }
        let outcome = frame_dispatch_out(&mut e, 21_000_000);
        assert!(matches!(outcome, FrameOutcome::Missed));
        assert_eq!(e.gaming().unwrap().frame_misses, 1);
    }

    #[test]
    fn frame_smoothing_converges() {
        let mut e = gaming_entity(60);
        {
            let g = e.gaming_mut().unwrap();
            g.frame_deadline_ns = u64::MAX;
            g.frame_start_ns = 1;
        }
        let mut now = 1;
        for _ in 0..100 {
            now += 8_000_000;
            frame_dispatch_out(&mut e, now);
        }
        let smooth = e.gaming().unwrap().smooth_frame_ns;
        assert!((7_500_000..=8_000_000).contains(&smooth));
    }

    #[test]
    fn no_accounting_without_deadline() {
        let mut e = gaming_entity(60);
        let outcome = frame_dispatch_out(&mut e, 5_000_000);
        assert!(matches!(outcome, FrameOutcome::None));
        assert_eq!(e.gaming().unwrap().frames_completed, 0);
    }
}
