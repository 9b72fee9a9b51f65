//! Core scheduling: the `Scheduler` value, the tick path and dispatch.
//!
//! One `Scheduler` is built by the kernel init path and shared by every
//! CPU. All hot state is per-CPU behind that CPU's runqueue lock; the few
//! scheduler-wide pieces (config, RT bandwidth, task index) sit behind
//! their own short-lived locks and are never held across a context switch.
//!
//! The tick is written for interrupt context: straight-line, non-suspending,
//! bounded work. It accounts the current entity against an explicit
//! `delta = now - last_tick_ns`, so a raised timer frequency (gaming mode)
//! changes granularity and nothing else.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

use crate::platform::{Pid, Platform};
use crate::topology::{CpuMask, CpuTopology, MAX_CPUS};
use crate::{kdebug, kinfo};

use super::gaming::{self, FrameOutcome};
use super::percpu::{CpuRunQueue, Current};
use super::priority;
use super::rt::RtBandwidth;
use super::stats::Counters;
use super::table::TaskIndex;
use super::types::{
    ClassParams, EntityState, MlfqParams, MlfqTier, QueueId, RtPolicy, SchedClass, SchedConfig,
    SchedEntity, SchedError, RT_RR_QUANTUM_NS,
};

/// Per-CPU slot: the runqueue lock plus counters readable without it.
/// Cache-line aligned to keep CPUs off each other's lines.
#[repr(align(64))]
pub(crate) struct CpuSlot {
    pub rq: Mutex<CpuRunQueue>,
    /// Cached runnable count (queued + running non-idle), maintained on
    /// every queue operation. The balancer reads this lock-free.
    pub runnable: AtomicU32,
    pub need_resched: AtomicBool,
    pub context_switches: AtomicU64,
    pub preemptions: AtomicU64,
    pub voluntary_switches: AtomicU64,
    pub migrations_in: AtomicU64,
    pub migrations_out: AtomicU64,
}

impl CpuSlot {
    const fn new(cpu_id: u32) -> Self {
        Self {
            rq: Mutex::new(CpuRunQueue::new(cpu_id)),
            runnable: AtomicU32::new(0),
            need_resched: AtomicBool::new(false),
            context_switches: AtomicU64::new(0),
            preemptions: AtomicU64::new(0),
            voluntary_switches: AtomicU64::new(0),
            migrations_in: AtomicU64::new(0),
            migrations_out: AtomicU64::new(0),
        }
    }
}

/// The scheduler. Owned by the kernel init path; every method takes `&self`.
pub struct Scheduler {
    pub(crate) topology: CpuTopology,
    pub(crate) config: Mutex<SchedConfig>,
    pub(crate) cpus: [CpuSlot; MAX_CPUS],
    pub(crate) index: Mutex<TaskIndex>,
    pub(crate) rt_bw: Mutex<RtBandwidth>,
    pub(crate) rt_throttled: AtomicBool,
    pub(crate) gaming_on: AtomicBool,
    pub(crate) gaming_cpus: AtomicU64,
    pub(crate) vsync_ns: AtomicU64,
    pub(crate) counters: Counters,
}

impl Scheduler {
    pub fn new(topology: CpuTopology, config: SchedConfig) -> Self {
        let nr_cpus = topology.nr_cpus();
        let sched = Self {
            topology,
            config: Mutex::new(config),
            cpus: core::array::from_fn(|i| CpuSlot::new(i as u32)),
            index: Mutex::new(TaskIndex::new()),
            rt_bw: Mutex::new(RtBandwidth::new()),
            rt_throttled: AtomicBool::new(false),
            gaming_on: AtomicBool::new(false),
            gaming_cpus: AtomicU64::new(0),
            vsync_ns: AtomicU64::new(0),
            counters: Counters::new(),
        };
        kinfo!(
            "MLFQ scheduler initialized: {} CPUs, {} NUMA nodes, {} levels",
            nr_cpus,
            sched.topology.nr_nodes(),
            super::types::MLFQ_LEVELS
        );
        sched
    }

    #[inline]
    pub fn topology(&self) -> &CpuTopology {
        &self.topology
    }

    /// Arm the calling CPU's timer and begin scheduling. Called once per
    /// CPU after init.
    pub fn start<P: Platform>(&self, p: &P) {
        p.arm_timer(gaming::NORMAL_TIMER_INTERVAL_NS);
        kinfo!("scheduler online on CPU {}", p.current_cpu_id());
    }

    #[inline]
    pub(crate) fn cfg(&self) -> SchedConfig {
        *self.config.lock()
    }

    /// Mutate the scheduler-wide configuration.
    pub fn update_config(&self, f: impl FnOnce(&mut SchedConfig)) {
        f(&mut self.config.lock());
    }

    pub fn set_placement_policy(&self, policy: super::types::PlacementPolicy) {
        self.config.lock().placement = policy;
    }

    #[inline]
    pub(crate) fn gaming_enabled(&self) -> bool {
        self.gaming_on.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn gaming_cpu_mask(&self) -> CpuMask {
        CpuMask(self.gaming_cpus.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn slot(&self, cpu: u32) -> &CpuSlot {
        &self.cpus[cpu as usize]
    }

    #[inline]
    pub(crate) fn note_resched(&self, cpu: u32) {
        self.slot(cpu).need_resched.store(true, Ordering::Release);
    }

    /// Refresh the lock-free runnable cache from the locked runqueue.
    #[inline]
    pub(crate) fn refresh_runnable(&self, rq: &CpuRunQueue) {
        self.slot(rq.cpu_id)
            .runnable
            .store(rq.runnable_count(), Ordering::Release);
    }

    /// Run `f` against the entity's owning runqueue. Retries when the
    /// entity migrates between the index read and the lock acquisition.
    pub(crate) fn with_task<R>(
        &self,
        pid: Pid,
        mut f: impl FnMut(&mut CpuRunQueue, u16) -> R,
    ) -> Result<R, SchedError> {
        loop {
            let cpu = self
                .index
                .lock()
                .lookup(pid)
                .ok_or(SchedError::TaskNotFound)?;
            let mut rq = self.slot(cpu).rq.lock();
            if let Some(slot) = rq.find(pid) {
                let r = f(&mut rq, slot);
                self.refresh_runnable(&rq);
                return Ok(r);
            }
            // Raced with a migration; the index will have been repointed.
        }
    }

    /// The CPU's current task, `None` when idle.
    pub fn current_task(&self, cpu_id: u32) -> Option<Pid> {
        let rq = self.slot(cpu_id).rq.lock();
        match rq.current {
            Current::Idle => None,
            Current::Task(slot) => Some(rq.task(slot).pid),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Create and place the scheduling entity for a new process. The
    /// process starts blocked; `wake` makes it runnable.
    pub fn attach<P: Platform>(
        &self,
        p: &P,
        pid: Pid,
        class: SchedClass,
        affinity: CpuMask,
    ) -> Result<(), SchedError> {
        let now = p.now_ns();
        let allowed = affinity.and(self.topology.schedulable_mask());
        let first = allowed.first_set().ok_or(SchedError::AffinityEmpty)?;

        let cfg = self.cfg();
        let params = match class {
            SchedClass::Gaming => {
                if !self.gaming_enabled() {
                    return Err(SchedError::InvalidPolicy);
                }
                ClassParams::Gaming(super::types::GamingParams::new(
                    cfg.gaming.frame_rate_target,
                    MlfqTier::Normal,
                ))
            }
            SchedClass::Realtime => ClassParams::Realtime(super::types::RtParams::new(
                RtPolicy::Fifo,
            )),
            SchedClass::Interactive => ClassParams::Mlfq(MlfqParams::new(MlfqTier::Interactive)),
            SchedClass::Normal => ClassParams::Mlfq(MlfqParams::new(MlfqTier::Normal)),
            SchedClass::Background => ClassParams::Mlfq(MlfqParams::new(MlfqTier::Background)),
        };

        let mut entity = SchedEntity::new(pid, params, affinity, first, now);
        if class == SchedClass::Gaming {
            entity.dynamic_priority = -20;
        }
        let cpu = self.choose_cpu(&entity, now)?;
        entity.last_cpu = cpu;
        entity.preferred_cpu = cpu;

        self.index.lock().insert(pid, cpu)?;
        let mut rq = self.slot(cpu).rq.lock();
        if let Err(e) = rq.insert(entity) {
            drop(rq);
            self.index.lock().remove(pid);
            return Err(e);
        }
        drop(rq);
        self.topology
            .node_of_cpu(cpu)
            .process_count
            .fetch_add(1, Ordering::Relaxed);
        kdebug!("attach: pid {} class {} on CPU {}", pid, class.as_str(), cpu);
        Ok(())
    }

    /// Tear down the entity for an exiting process.
    pub fn detach<P: Platform>(&self, _p: &P, pid: Pid) -> Result<(), SchedError> {
        loop {
            let cpu = self
                .index
                .lock()
                .lookup(pid)
                .ok_or(SchedError::TaskNotFound)?;
            let mut rq = self.slot(cpu).rq.lock();
            let slot = match rq.find(pid) {
                Some(s) => s,
                None => continue,
            };
            if rq.task(slot).queue.is_some() {
                rq.unlink(slot);
            }
            if rq.current == Current::Task(slot) {
                rq.current = Current::Idle;
                self.note_resched(cpu);
            }
            rq.remove(slot);
            self.refresh_runnable(&rq);
            drop(rq);
            self.index.lock().remove(pid);
            self.topology
                .node_of_cpu(cpu)
                .process_count
                .fetch_sub(1, Ordering::Relaxed);
            return Ok(());
        }
    }

    /// Mark a process not runnable. If it is running somewhere, that CPU
    /// switches it out at its next dispatcher invocation.
    pub fn block<P: Platform>(&self, p: &P, pid: Pid) -> Result<(), SchedError> {
        let now = p.now_ns();
        self.with_task(pid, |rq, slot| {
            let cpu = rq.cpu_id;
            let e = rq.task(slot);
            match e.state {
                EntityState::Blocked => {}
                EntityState::Queued => {
                    rq.unlink(slot);
                    let e = rq.task_mut(slot);
                    e.state = EntityState::Blocked;
                    e.block_start_ns = now;
                }
                EntityState::Running => {
                    let e = rq.task_mut(slot);
                    e.state = EntityState::Blocked;
                    e.block_start_ns = now;
                    e.voluntary_switches += 1;
                    self.note_resched(cpu);
                }
            }
        })
    }

    /// Make a blocked process runnable, choosing a CPU by the placement
    /// policy and preempting the target's current if warranted.
    pub fn wake<P: Platform>(&self, p: &P, pid: Pid) -> Result<(), SchedError> {
        let now = p.now_ns();
        let cfg = self.cfg();
        let min_migration_ns = cfg.min_migration_interval_ms as u64 * 1_000_000;
        loop {
            let owner = self
                .index
                .lock()
                .lookup(pid)
                .ok_or(SchedError::TaskNotFound)?;
            let mut rq = self.slot(owner).rq.lock();
            let slot = match rq.find(pid) {
                Some(s) => s,
                None => continue,
            };
            if rq.task(slot).state != EntityState::Blocked {
                return Ok(());
            }

            {
                let e = rq.task_mut(slot);
                e.total_blocked_ns = e
                    .total_blocked_ns
                    .saturating_add(now.saturating_sub(e.block_start_ns));
            }

            let mut target = self.choose_cpu(rq.task(slot), now)?;
            let e = rq.task(slot);
            let allowed = e.cpu_affinity.and(self.topology.schedulable_mask());
            // Keep cache warmth: stay on the owner unless it is no longer
            // allowed or the entity is past the migration cooldown.
            if target != owner
                && allowed.is_set(owner)
                && now.saturating_sub(e.last_migration_ns) < min_migration_ns
            {
                target = owner;
            }

            if target == owner {
                rq.enqueue(slot, now);
                self.check_preempt(&rq, slot);
                self.refresh_runnable(&rq);
                return Ok(());
            }

            drop(rq);
            match self.move_task(pid, owner, target, now, true) {
                Ok(true) => return Ok(()),
                // Raced with a migration or the target went offline:
                // re-resolve and re-place.
                Ok(false) | Err(SchedError::CpuOffline) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Voluntary yield by the current task on the calling CPU.
    pub fn yield_now<P: Platform>(&self, p: &P) {
        let cpu = p.current_cpu_id();
        let now = p.now_ns();
        {
            let mut rq = self.slot(cpu).rq.lock();
            if let Current::Task(slot) = rq.current {
                let e = rq.task_mut(slot);
                e.voluntary_switches += 1;
                // Yielding refills the quantum; cooperative tasks are not
                // punished with a demotion.
                if let ClassParams::Mlfq(m) = &mut e.params {
                    m.quantum_remaining_ns = super::types::quantum_for(m.level);
                }
            }
        }
        self.reschedule(p, cpu);
    }

    // ------------------------------------------------------------------
    // Priorities
    // ------------------------------------------------------------------

    /// Set the static (nice) priority. Resets any behaviour bias.
    pub fn set_priority(&self, pid: Pid, nice: i32) -> Result<(), SchedError> {
        if !(super::types::NICE_MIN..=super::types::NICE_MAX).contains(&nice) {
            return Err(SchedError::InvalidPolicy);
        }
        self.with_task(pid, |rq, slot| {
            let e = rq.task_mut(slot);
            e.static_priority = nice;
            e.dynamic_priority = nice;
        })
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    /// Per-CPU timer tick. Accounts the current entity, runs the aging and
    /// behaviour passes on their cadence, and triggers balancing. Returns
    /// whether the CPU should reschedule.
    pub fn tick<P: Platform>(&self, p: &P, cpu_id: u32) -> bool {
        let now = p.now_ns();
        let cfg = self.cfg();
        let gaming_on = self.gaming_enabled();
        let mut need_resched = false;

        {
            let mut rq = self.slot(cpu_id).rq.lock();
            let delta = if rq.last_tick_ns == 0 {
                0
            } else {
                now.saturating_sub(rq.last_tick_ns)
            };
            rq.last_tick_ns = now;

            let mut rt_current = false;
            match rq.current {
                Current::Idle => rq.idle_ns += delta,
                Current::Task(slot) => {
                    need_resched |= self.account_current(&mut rq, slot, now, delta, &mut rt_current);
                }
            }

            // RT bandwidth window: consume while an RT entity runs, roll
            // the period over, lift the throttle on rollover.
            if rt_current || self.rt_throttled.load(Ordering::Acquire) {
                need_resched |= self.rt_bandwidth_tick(&mut rq, delta, rt_current, &cfg);
            }

            if gaming_on {
                need_resched |= gaming::urgency_pass(&mut rq, now, &cfg);
            }

            if now.saturating_sub(rq.last_aging_ns)
                >= cfg.aging_scan_interval_ms as u64 * 1_000_000
            {
                rq.last_aging_ns = now;
                need_resched |= priority::aging_scan(&mut rq, now, &cfg);
                priority::behavior_pass(&mut rq);
            }

            let runnable = rq.runnable_count();
            rq.load.sample(runnable);

            // Would anything queued preempt the current entity?
            let rt_throttled = self.rt_throttled.load(Ordering::Acquire);
            if let Some(cand) = rq.select_next(now, gaming_on, rt_throttled) {
                match rq.current {
                    Current::Idle => need_resched = true,
                    Current::Task(cur) => {
                        if rq.task(cur).state != EntityState::Running
                            || should_preempt(rq.task(cand), rq.task(cur))
                        {
                            need_resched = true;
                        }
                    }
                }
            }

            self.refresh_runnable(&rq);
        }

        if need_resched {
            self.note_resched(cpu_id);
        }
        self.balance(now);
        need_resched || self.slot(cpu_id).need_resched.load(Ordering::Acquire)
    }

    /// Account the running entity for `delta` nanoseconds. Returns whether
    /// a reschedule is due; sets `rt_current` when the entity is RT.
    fn account_current(
        &self,
        rq: &mut CpuRunQueue,
        slot: u16,
        now: u64,
        delta: u64,
        rt_current: &mut bool,
    ) -> bool {
        let mut need_resched = false;
        let e = rq.task_mut(slot);
        e.total_runtime_ns += delta;
        if e.state != EntityState::Running {
            // Blocked or detached from under us; switch out at the next
            // dispatch.
            return true;
        }

        match &mut e.params {
            ClassParams::Mlfq(m) => {
                m.quantum_remaining_ns = m.quantum_remaining_ns.saturating_sub(delta);
                if m.quantum_remaining_ns == 0 {
                    // Quantum exhausted: demote one level and refill.
                    if (m.level as usize) < super::types::MLFQ_LEVELS - 1 {
                        m.level += 1;
                    }
                    m.quantum_remaining_ns = super::types::quantum_for(m.level);
                    e.involuntary_switches += 1;
                    e.last_preempted_ns = now;
                    need_resched = true;
                }
            }
            ClassParams::Realtime(r) => {
                *rt_current = true;
                if r.deadline_ns != 0 && now > r.deadline_ns && !r.deadline_flagged {
                    r.deadline_flagged = true;
                    r.deadline_misses += 1;
                    self.counters
                        .deadline_misses
                        .fetch_add(1, Ordering::Relaxed);
                    kdebug!("rt: pid {} missed deadline", e.pid);
                }
                if r.policy == RtPolicy::Rr {
                    r.quantum_remaining_ns = r.quantum_remaining_ns.saturating_sub(delta);
                    if r.quantum_remaining_ns == 0 {
                        e.involuntary_switches += 1;
                        need_resched = true;
                    }
                }
            }
            ClassParams::Gaming(g) => {
                if g.boost_expiry_ns != 0 && now >= g.boost_expiry_ns {
                    g.boost_expiry_ns = 0;
                    e.dynamic_priority = -20;
                }
            }
        }
        need_resched
    }

    fn rt_bandwidth_tick(
        &self,
        rq: &mut CpuRunQueue,
        delta: u64,
        rt_current: bool,
        cfg: &SchedConfig,
    ) -> bool {
        let mut bw = self.rt_bw.lock();
        let rolled = bw.advance(rq.last_tick_ns, cfg.rt_period_ns);
        if rolled && self.rt_throttled.swap(false, Ordering::AcqRel) {
            kdebug!("rt: bandwidth period rollover, throttle lifted");
        }
        if !rt_current {
            return false;
        }

        let room = cfg.rt_bandwidth_ns.saturating_sub(bw.consumed_ns);
        bw.consumed_ns += delta.min(room);
        if bw.consumed_ns >= cfg.rt_bandwidth_ns
            && !self.rt_throttled.swap(true, Ordering::AcqRel)
        {
            self.counters
                .bandwidth_violations
                .fetch_add(1, Ordering::Relaxed);
            // Flag the running entity; queued RT entities are flagged as
            // they are skipped.
            if let Current::Task(slot) = rq.current {
                if let Some(r) = rq.task_mut(slot).rt_mut() {
                    r.throttled = true;
                }
            }
            return true;
        }
        false
    }

    /// Mark the target CPU for reschedule if `slot` would preempt its
    /// current entity.
    pub(crate) fn check_preempt(&self, rq: &CpuRunQueue, slot: u16) {
        match rq.current {
            Current::Idle => self.note_resched(rq.cpu_id),
            Current::Task(cur) => {
                if should_preempt(rq.task(slot), rq.task(cur)) {
                    self.note_resched(rq.cpu_id);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Pick and switch to the next entity on `cpu_id`. Safe to call even
    /// when nothing changed; the context-switch primitive is only invoked
    /// when the decision differs from `current`.
    pub fn reschedule<P: Platform>(&self, p: &P, cpu_id: u32) {
        let now = p.now_ns();
        self.slot(cpu_id).need_resched.store(false, Ordering::Release);

        let (prev_pid, next_pid, voluntary, misplaced) = {
            let mut rq = self.slot(cpu_id).rq.lock();
            let out = self.reschedule_locked(&mut rq, now);
            self.refresh_runnable(&rq);
            out
        };

        if prev_pid != next_pid {
            let slot = self.slot(cpu_id);
            slot.context_switches.fetch_add(1, Ordering::Relaxed);
            if voluntary {
                slot.voluntary_switches.fetch_add(1, Ordering::Relaxed);
            } else {
                slot.preemptions.fetch_add(1, Ordering::Relaxed);
            }
            // No runqueue lock is held across the switch primitive.
            p.switch_context(prev_pid, next_pid);
        }

        if let Some(pid) = misplaced {
            // The switched-out entity was parked on a CPU its affinity no
            // longer allows; move it somewhere permitted and requeue it.
            let _ = self.rehome(pid, now, true);
        }
    }

    fn reschedule_locked(
        &self,
        rq: &mut CpuRunQueue,
        now: u64,
    ) -> (Option<Pid>, Option<Pid>, bool, Option<Pid>) {
        let gaming_on = self.gaming_enabled();
        let rt_throttled = self.rt_throttled.load(Ordering::Acquire);
        let cfg = self.cfg();

        let mut prev_pid = None;
        let mut voluntary = false;
        let mut misplaced = None;

        if let Current::Task(slot) = rq.current {
            let state = rq.task(slot).state;
            prev_pid = Some(rq.task(slot).pid);
            match state {
                EntityState::Running => {
                    if rq.task(slot).cpu_affinity.is_set(rq.cpu_id) {
                        self.dispatch_out(rq, slot, now, &cfg);
                    } else {
                        // This CPU is no longer allowed: park the entity
                        // and move it to a permitted CPU after the switch.
                        if rq.task(slot).is_gaming() {
                            self.frame_accounting(rq, slot, now, &cfg);
                        }
                        let e = rq.task_mut(slot);
                        e.state = EntityState::Blocked;
                        e.block_start_ns = now;
                        misplaced = Some(e.pid);
                    }
                }
                EntityState::Blocked => {
                    voluntary = true;
                    if rq.task(slot).is_gaming() {
                        self.frame_accounting(rq, slot, now, &cfg);
                    }
                }
                EntityState::Queued => unreachable!("current entity on a queue"),
            }
            rq.current = Current::Idle;
        }

        let next_pid = match rq.pick_next(now, gaming_on, rt_throttled) {
            Some(slot) => {
                self.dispatch_in(rq, slot, now);
                rq.current = Current::Task(slot);
                Some(rq.task(slot).pid)
            }
            None => None,
        };

        (prev_pid, next_pid, voluntary, misplaced)
    }

    /// Switch-out bookkeeping for a still-runnable entity: frame accounting
    /// for gaming, then requeue by class policy.
    fn dispatch_out(&self, rq: &mut CpuRunQueue, slot: u16, now: u64, cfg: &SchedConfig) {
        if rq.task(slot).is_gaming() {
            self.frame_accounting(rq, slot, now, cfg);
        }

        enum Requeue {
            Mlfq,
            RtTail,
            RtHead,
            Gaming,
        }
        let action = {
            let e = rq.task_mut(slot);
            e.wait_start_ns = now;
            match &mut e.params {
                ClassParams::Mlfq(_) => Requeue::Mlfq,
                ClassParams::Realtime(r) => {
                    if r.policy == RtPolicy::Rr && r.quantum_remaining_ns == 0 {
                        // Round-robin quantum spent: refill and go to the
                        // tail.
                        r.quantum_remaining_ns = RT_RR_QUANTUM_NS;
                        Requeue::RtTail
                    } else {
                        // FIFO and deadline entities keep their place in
                        // line.
                        Requeue::RtHead
                    }
                }
                ClassParams::Gaming(_) => Requeue::Gaming,
            }
        };
        match action {
            Requeue::Mlfq => rq.enqueue(slot, now),
            Requeue::RtTail => rq.link_tail(QueueId::Rt, slot),
            Requeue::RtHead => rq.link_head(QueueId::Rt, slot),
            Requeue::Gaming => rq.link_tail(QueueId::Gaming, slot),
        }
    }

    /// Frame accounting on every dispatch-out of a gaming entity.
    fn frame_accounting(&self, rq: &mut CpuRunQueue, slot: u16, now: u64, cfg: &SchedConfig) {
        let outcome = gaming::frame_dispatch_out(rq.task_mut(slot), now);
        match outcome {
            FrameOutcome::None => {}
            FrameOutcome::Met => {
                self.counters.frames_completed.fetch_add(1, Ordering::Relaxed);
            }
            FrameOutcome::Missed => {
                self.counters.frame_misses.fetch_add(1, Ordering::Relaxed);
                // Emergency boost: back to top priority with the input
                // boost re-armed.
                let e = rq.task_mut(slot);
                e.dynamic_priority = -20;
                if let Some(g) = e.gaming_mut() {
                    g.boost_expiry_ns = now + cfg.gaming.input_boost_duration_ns;
                }
                e.boost_count += 1;
            }
        }
    }

    fn dispatch_in(&self, rq: &mut CpuRunQueue, slot: u16, now: u64) {
        let cpu_id = rq.cpu_id;
        let e = rq.task_mut(slot);
        e.state = EntityState::Running;
        e.total_wait_ns = e
            .total_wait_ns
            .saturating_add(now.saturating_sub(e.wait_start_ns));
        e.last_dispatched_ns = now;
        e.last_cpu = cpu_id;

        match &mut e.params {
            ClassParams::Realtime(r) => {
                // Being dispatched means the throttle no longer applies.
                r.throttled = false;
                if r.deadline_ns != 0 && now > r.deadline_ns && !r.deadline_flagged {
                    r.deadline_flagged = true;
                    r.deadline_misses += 1;
                    self.counters
                        .deadline_misses
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
            ClassParams::Gaming(g) => {
                if g.last_input_ns != 0 {
                    g.input_latency_ns = now.saturating_sub(g.last_input_ns);
                    g.last_input_ns = 0;
                }
            }
            ClassParams::Mlfq(_) => {}
        }
    }
}

/// The class preemption predicate: should candidate `c` take the CPU from
/// the running entity `t`?
pub(crate) fn should_preempt(c: &SchedEntity, t: &SchedEntity) -> bool {
    let cc = c.class();
    let tc = t.class();

    if cc == SchedClass::Gaming && tc != SchedClass::Gaming {
        return true;
    }
    if cc == SchedClass::Realtime
        && tc != SchedClass::Gaming
        && tc != SchedClass::Realtime
    {
        return true;
    }
    if let (Some(cr), Some(tr)) = (c.rt(), t.rt()) {
        if cr.policy == RtPolicy::Deadline
            && tr.policy == RtPolicy::Deadline
            && cr.deadline_ns != 0
            && (tr.deadline_ns == 0 || cr.deadline_ns < tr.deadline_ns)
        {
            return true;
        }
    }
    if cc == tc {
        if let (Some(cm), Some(tm)) = (c.mlfq(), t.mlfq()) {
            if cm.level < tm.level {
                return true;
            }
            if cm.level == tm.level && tm.quantum_remaining_ns == 0 {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::types::{GamingParams, RtParams};
    use crate::topology::CpuMask;

    fn mk(params: ClassParams) -> SchedEntity {
        SchedEntity::new(1, params, CpuMask::first_n(1), 0, 0)
    }

    fn mlfq(tier: MlfqTier, level: u8, quantum: u64) -> SchedEntity {
        let mut e = mk(ClassParams::Mlfq(MlfqParams::new(tier)));
        if let Some(m) = e.mlfq_mut() {
            m.level = level;
            m.quantum_remaining_ns = quantum;
        }
        e
    }

    // ========================================================================
    // Preemption predicate
    // ========================================================================

    #[test]
    fn gaming_preempts_everything_else() {
        let g = mk(ClassParams::Gaming(GamingParams::new(60, MlfqTier::Normal)));
        let rt = mk(ClassParams::Realtime(RtParams::new(RtPolicy::Fifo)));
        let n = mlfq(MlfqTier::Normal, 2, 1);
        assert!(should_preempt(&g, &rt));
        assert!(should_preempt(&g, &n));
        assert!(!should_preempt(&g, &g));
    }

    #[test]
    fn rt_preempts_mlfq_but_not_gaming() {
        let rt = mk(ClassParams::Realtime(RtParams::new(RtPolicy::Fifo)));
        let g = mk(ClassParams::Gaming(GamingParams::new(60, MlfqTier::Normal)));
        let n = mlfq(MlfqTier::Normal, 2, 1);
        assert!(should_preempt(&rt, &n));
        assert!(!should_preempt(&rt, &g));
        assert!(!should_preempt(&n, &rt));
    }

    #[test]
    fn lower_level_preempts_same_class() {
        let high = mlfq(MlfqTier::Normal, 1, 1);
        let low = mlfq(MlfqTier::Normal, 3, 1);
        assert!(should_preempt(&high, &low));
        assert!(!should_preempt(&low, &high));
    }

    #[test]
    fn same_level_preempts_on_spent_quantum() {
        let a = mlfq(MlfqTier::Normal, 2, 1);
        let spent = mlfq(MlfqTier::Normal, 2, 0);
        let fresh = mlfq(MlfqTier::Normal, 2, 1_000);
        assert!(should_preempt(&a, &spent));
        assert!(!should_preempt(&a, &fresh));
    }

    #[test]
    fn edf_preempts_later_deadline() {
        let mut early = mk(ClassParams::Realtime(RtParams::new(RtPolicy::Deadline)));
        early.rt_mut().unwrap().deadline_ns = 1_000;
        let mut late = mk(ClassParams::Realtime(RtParams::new(RtPolicy::Deadline)));
        late.rt_mut().unwrap().deadline_ns = 9_000;
        assert!(should_preempt(&early, &late));
        assert!(!should_preempt(&late, &early));
    }

    #[test]
    fn fifo_rt_does_not_preempt_rt() {
        let a = mk(ClassParams::Realtime(RtParams::new(RtPolicy::Fifo)));
        let b = mk(ClassParams::Realtime(RtParams::new(RtPolicy::Fifo)));
        assert!(!should_preempt(&a, &b));
    }

    #[test]
    fn interactive_does_not_class_preempt_normal() {
        // Interactive and Normal share the MLFQ levels; only level order
        // matters between them.
        let inter = mlfq(MlfqTier::Interactive, 2, 1);
        let norm = mlfq(MlfqTier::Normal, 2, 1_000);
        assert!(!should_preempt(&inter, &norm));
    }
}
