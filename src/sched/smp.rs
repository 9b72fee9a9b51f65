//! SMP: CPU affinity, placement policies, migration and load balancing.
//!
//! Placement honours the affinity mask absolutely: the scheduler never
//! falls back to a CPU the mask forbids, it returns `AffinityEmpty`
//! instead. Cross-CPU moves always go through `with_two_runqueues`, which
//! acquires the two runqueue locks in ascending CPU-id order.

use core::sync::atomic::Ordering;

use crate::platform::{Pid, Platform};
use crate::topology::{BalanceDomain, CpuMask, DomainLevel};
use crate::{kdebug, kinfo};

use super::core::Scheduler;
use super::percpu::CpuRunQueue;
use super::types::{EntityState, SchedClass, SchedConfig, SchedEntity, SchedError, MLFQ_LEVELS};

/// CPUs at or above this temperature count as thermal events during
/// thermal-aware placement.
const THERMAL_EVENT_CELSIUS: u32 = 85;

impl Scheduler {
    // ------------------------------------------------------------------
    // Affinity API
    // ------------------------------------------------------------------

    pub fn set_cpu_affinity<P: Platform>(
        &self,
        p: &P,
        pid: Pid,
        mask: CpuMask,
    ) -> Result<(), SchedError> {
        if mask.and(self.topology.online_mask()).is_empty() {
            return Err(SchedError::AffinityEmpty);
        }
        let now = p.now_ns();
        let mut misplaced = false;
        self.with_task(pid, |rq, slot| {
            let cpu = rq.cpu_id;
            let e = rq.task_mut(slot);
            e.cpu_affinity = mask;
            match e.state {
                EntityState::Blocked => {}
                EntityState::Queued => {
                    if !mask.is_set(cpu) {
                        misplaced = true;
                    }
                }
                EntityState::Running => {
                    if !mask.is_set(cpu) {
                        // Switched out and re-homed at the next dispatch.
                        self.note_resched(cpu);
                    }
                }
            }
        })?;
        if misplaced {
            self.rehome(pid, now, false)?;
        }
        kinfo!("affinity: pid {} set to {:#x}", pid, mask.0);
        Ok(())
    }

    pub fn get_cpu_affinity(&self, pid: Pid) -> Result<CpuMask, SchedError> {
        self.with_task(pid, |rq, slot| rq.task(slot).cpu_affinity)
    }

    // ------------------------------------------------------------------
    // Hotplug and thermal state
    // ------------------------------------------------------------------

    pub fn set_cpu_online(&self, cpu_id: u32, online: bool) {
        self.topology.set_online(cpu_id, online);
        if !online {
            self.note_resched(cpu_id);
        }
    }

    pub fn set_cpu_isolated(&self, cpu_id: u32, isolated: bool) {
        self.topology.set_isolated(cpu_id, isolated);
    }

    pub fn set_cpu_temperature(&self, cpu_id: u32, celsius: u32) {
        self.topology.set_temperature(cpu_id, celsius);
    }

    // ------------------------------------------------------------------
    // Placement
    // ------------------------------------------------------------------

    /// Choose a CPU for a (newly runnable) entity by the configured
    /// placement policy. Only CPUs in the affinity mask that are online
    /// and not isolated are ever eligible.
    pub(crate) fn choose_cpu(&self, e: &SchedEntity, _now: u64) -> Result<u32, SchedError> {
        let allowed = e.cpu_affinity.and(self.topology.schedulable_mask());
        if allowed.is_empty() {
            return Err(SchedError::AffinityEmpty);
        }
        let policy = self.config.lock().placement;

        use super::types::PlacementPolicy::*;
        let cpu = match policy {
            FirstFit => allowed.first_set().unwrap(),
            BestFit => {
                let preferred = if e.is_gaming() || e.is_realtime() {
                    allowed.and(self.topology.performance_mask())
                } else if e.class() == SchedClass::Background {
                    allowed.and(self.topology.efficiency_mask())
                } else {
                    CpuMask::NONE
                };
                let mask = if preferred.is_empty() { allowed } else { preferred };
                self.least_loaded(mask)
            }
            NumaLocal => {
                let node = self.topology.node_of_cpu(e.last_cpu);
                let local = allowed.and(node.cpu_mask);
                if local.is_empty() {
                    self.counters
                        .numa_remote_placements
                        .fetch_add(1, Ordering::Relaxed);
                    self.least_loaded(allowed)
                } else {
                    self.counters
                        .numa_local_placements
                        .fetch_add(1, Ordering::Relaxed);
                    self.least_loaded(local)
                }
            }
            CacheAware => {
                let mut best_cpu = allowed.first_set().unwrap();
                let mut best_score = 0u32;
                for cpu in allowed.iter() {
                    let mut score = 0;
                    if self.topology.share_cache(e.last_cpu, cpu, 3) {
                        score += 4;
                    }
                    if self.topology.share_cache(e.last_cpu, cpu, 2) {
                        score += 2;
                    }
                    if self.topology.share_cache(e.last_cpu, cpu, 1) {
                        score += 1;
                    }
                    if score > best_score {
                        best_score = score;
                        best_cpu = cpu;
                    }
                }
                if best_score > 0 {
                    self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                }
                best_cpu
            }
            ThermalAware => {
                let mut best_cpu = allowed.first_set().unwrap();
                let mut best_temp = u32::MAX;
                for cpu in allowed.iter() {
                    let temp = self.topology.cpu(cpu).temperature();
                    if temp < best_temp {
                        best_temp = temp;
                        best_cpu = cpu;
                    }
                }
                if best_temp >= THERMAL_EVENT_CELSIUS {
                    self.counters.thermal_events.fetch_add(1, Ordering::Relaxed);
                }
                best_cpu
            }
            PowerAware => {
                let eff = allowed.and(self.topology.efficiency_mask());
                let mask = if eff.is_empty() { allowed } else { eff };
                self.least_loaded(mask)
            }
        };
        Ok(cpu)
    }

    /// Keep the per-node process counts in step with a cross-CPU move.
    fn note_node_move(&self, src: u32, dst: u32) {
        let src_node = self.topology.node_of_cpu(src);
        let dst_node = self.topology.node_of_cpu(dst);
        if src_node.node_id != dst_node.node_id {
            src_node.process_count.fetch_sub(1, Ordering::Relaxed);
            dst_node.process_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Least-loaded CPU in a non-empty mask, from the lock-free runnable
    /// cache. Ties go to the lowest id.
    pub(crate) fn least_loaded(&self, mask: CpuMask) -> u32 {
        let mut best_cpu = mask.first_set().unwrap();
        let mut best_load = u32::MAX;
        for cpu in mask.iter() {
            let load = self.slot(cpu).runnable.load(Ordering::Relaxed);
            if load < best_load {
                best_load = load;
                best_cpu = cpu;
            }
        }
        best_cpu
    }

    // ------------------------------------------------------------------
    // Migration
    // ------------------------------------------------------------------

    /// Acquire two runqueue locks in ascending CPU-id order and run `f`
    /// with (first, second) matching (a, b).
    pub(crate) fn with_two_runqueues<R>(
        &self,
        a: u32,
        b: u32,
        f: impl FnOnce(&mut CpuRunQueue, &mut CpuRunQueue) -> R,
    ) -> R {
        debug_assert_ne!(a, b);
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let mut lo_guard = self.slot(lo).rq.lock();
        let mut hi_guard = self.slot(hi).rq.lock();
        if a < b {
            f(&mut lo_guard, &mut hi_guard)
        } else {
            f(&mut hi_guard, &mut lo_guard)
        }
    }

    /// Move a non-running entity from `src` to `dst`. Returns `Ok(false)`
    /// when the entity raced away (caller re-resolves), `Ok(true)` once it
    /// is settled — on `dst`, or back on `src` if the destination arena
    /// was full.
    ///
    /// `make_runnable` enqueues the entity on arrival even if it was
    /// blocked (the wake path).
    pub(crate) fn move_task(
        &self,
        pid: Pid,
        src: u32,
        dst: u32,
        now: u64,
        make_runnable: bool,
    ) -> Result<bool, SchedError> {
        if !self.topology.cpu(dst).is_online() {
            self.counters
                .failed_migrations
                .fetch_add(1, Ordering::Relaxed);
            return Err(SchedError::CpuOffline);
        }
        self.with_two_runqueues(src, dst, |srq, drq| {
            let slot = match srq.find(pid) {
                Some(s) => s,
                None => return Ok(false),
            };
            if srq.task(slot).state == EntityState::Running {
                return Ok(false);
            }
            // Re-check under the locks: the target can go offline between
            // selection and acquisition.
            if !self.topology.cpu(dst).is_online() {
                self.counters
                    .failed_migrations
                    .fetch_add(1, Ordering::Relaxed);
                return Err(SchedError::CpuOffline);
            }

            let was_queued = srq.task(slot).queue.is_some();
            if was_queued {
                srq.unlink(slot);
            }
            let entity = srq.remove(slot);
            match drq.insert(entity) {
                Ok(new_slot) => {
                    {
                        let e = drq.task_mut(new_slot);
                        e.last_cpu = dst;
                        e.migration_count += 1;
                        e.last_migration_ns = now;
                    }
                    self.index.lock().set_cpu(pid, dst);
                    if was_queued || make_runnable {
                        drq.enqueue(new_slot, now);
                        self.check_preempt(drq, new_slot);
                    }
                    self.slot(src).migrations_out.fetch_add(1, Ordering::Relaxed);
                    self.slot(dst).migrations_in.fetch_add(1, Ordering::Relaxed);
                    self.counters.migrations.fetch_add(1, Ordering::Relaxed);
                    self.note_node_move(src, dst);
                    self.refresh_runnable(srq);
                    self.refresh_runnable(drq);
                    kdebug!("migrate: pid {} CPU {} -> {}", pid, src, dst);
                    Ok(true)
                }
                Err(_) => {
                    // Destination arena full: put it back where it was.
                    let back = srq.insert(entity).expect("source slot just freed");
                    if was_queued || make_runnable {
                        srq.enqueue(back, now);
                    }
                    self.counters
                        .failed_migrations
                        .fetch_add(1, Ordering::Relaxed);
                    self.refresh_runnable(srq);
                    Ok(true)
                }
            }
        })
    }

    /// Re-place an entity whose owner CPU is no longer inside its affinity
    /// mask (after `set_cpu_affinity`, a hotplug event, or a parked
    /// dispatch-out). With `make_runnable` the entity is enqueued at the
    /// destination even if it arrived parked.
    pub(crate) fn rehome(&self, pid: Pid, now: u64, make_runnable: bool) -> Result<(), SchedError> {
        loop {
            let snapshot = match self.with_task(pid, |rq, slot| *rq.task(slot)) {
                Ok(e) => e,
                // Detached while we were deciding; nothing to fix.
                Err(SchedError::TaskNotFound) => return Ok(()),
                Err(e) => return Err(e),
            };
            let owner = snapshot.last_cpu;
            if snapshot.cpu_affinity.is_set(owner)
                && self.topology.schedulable_mask().is_set(owner)
            {
                // The owner became acceptable again; just requeue in place
                // if the caller needs the entity runnable.
                if make_runnable && snapshot.state == EntityState::Blocked {
                    self.with_task(pid, |rq, slot| {
                        if rq.task(slot).state == EntityState::Blocked {
                            rq.enqueue(slot, now);
                            self.check_preempt(rq, slot);
                        }
                    })?;
                }
                return Ok(());
            }
            let target = self.choose_cpu(&snapshot, now)?;
            if target == owner {
                continue;
            }
            match self.move_task(pid, owner, target, now, make_runnable) {
                Ok(true) => return Ok(()),
                Ok(false) => continue,
                Err(SchedError::CpuOffline) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    // ------------------------------------------------------------------
    // Periodic balancing
    // ------------------------------------------------------------------

    /// Walk the balance domains from SMT up to NUMA and balance every
    /// domain whose cadence has elapsed. Cheap when nothing is due: one
    /// atomic load per domain.
    pub(crate) fn balance(&self, now: u64) {
        if self.topology.nr_cpus() <= 1 {
            return;
        }
        let cfg = self.cfg();
        for level in DomainLevel::ALL {
            let interval_ns = cfg.balance_interval_ms[level.index()] as u64 * 1_000_000;
            for dom in self.topology.domains(level) {
                let last = dom.last_balance_ns.load(Ordering::Relaxed);
                if now.saturating_sub(last) < interval_ns {
                    continue;
                }
                // Claim the pass; losers skip this round.
                if dom
                    .last_balance_ns
                    .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                    .is_err()
                {
                    continue;
                }
                self.balance_domain(dom, now, &cfg);
            }
        }
    }

    fn balance_domain(&self, dom: &BalanceDomain, now: u64, cfg: &SchedConfig) {
        let mask = dom.cpu_mask.and(self.topology.schedulable_mask());
        if mask.count() < 2 {
            return;
        }

        let mut max_cpu = 0;
        let mut max_load = 0u32;
        let mut min_cpu = 0;
        let mut min_load = u32::MAX;
        for cpu in mask.iter() {
            let load = self.slot(cpu).runnable.load(Ordering::Relaxed);
            if load > max_load {
                max_load = load;
                max_cpu = cpu;
            }
            if load < min_load {
                min_load = load;
                min_cpu = cpu;
            }
        }
        if max_load.saturating_sub(min_load) <= dom.imbalance_threshold || max_cpu == min_cpu {
            return;
        }

        if self.migrate_one(max_cpu, min_cpu, now, cfg) {
            dom.total_migrations.fetch_add(1, Ordering::Relaxed);
            self.counters.migrations.fetch_add(1, Ordering::Relaxed);
        } else {
            dom.failed_migrations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Migrate one queued MLFQ entity from `src` to `dst`, lowest priority
    /// first. Honours affinity, the migration cooldown and the benefit
    /// heuristic.
    fn migrate_one(&self, src: u32, dst: u32, now: u64, cfg: &SchedConfig) -> bool {
        if src == dst || !self.topology.cpu(dst).is_online() {
            return false;
        }
        let min_migration_ns = cfg.min_migration_interval_ms as u64 * 1_000_000;

        self.with_two_runqueues(src, dst, |srq, drq| {
            if !self.topology.cpu(dst).is_online() {
                return false;
            }
            let src_load = srq.runnable_count();
            let dst_load = drq.runnable_count();
            if src_load.saturating_sub(dst_load) < 2 {
                return false;
            }

            for level in (0..MLFQ_LEVELS).rev() {
                let mut cur = srq.mlfq[level].head;
                while let Some(slot) = cur {
                    let e = srq.task(slot);
                    cur = e.next;
                    if !e.cpu_affinity.is_set(dst) {
                        continue;
                    }
                    if now.saturating_sub(e.last_migration_ns) < min_migration_ns {
                        continue;
                    }

                    let pid = e.pid;
                    srq.unlink(slot);
                    let entity = srq.remove(slot);
                    match drq.insert(entity) {
                        Ok(new_slot) => {
                            {
                                let e = drq.task_mut(new_slot);
                                e.last_cpu = dst;
                                e.migration_count += 1;
                                e.last_migration_ns = now;
                            }
                            drq.enqueue(new_slot, now);
                            self.index.lock().set_cpu(pid, dst);
                            self.check_preempt(drq, new_slot);
                            self.slot(src).migrations_out.fetch_add(1, Ordering::Relaxed);
                            self.slot(dst).migrations_in.fetch_add(1, Ordering::Relaxed);
                            self.note_node_move(src, dst);
                            self.refresh_runnable(srq);
                            self.refresh_runnable(drq);
                            kdebug!("balance: pid {} CPU {} -> {}", pid, src, dst);
                            return true;
                        }
                        Err(_) => {
                            let back = srq.insert(entity).expect("source slot just freed");
                            srq.enqueue(back, now);
                            return false;
                        }
                    }
                }
            }
            false
        })
    }
}
