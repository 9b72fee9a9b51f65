//! Scheduler statistics and debugging.
//!
//! Snapshots are assembled from the per-CPU atomic counters plus one brief
//! runqueue lock per CPU; no lock is ever held across CPUs.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::kinfo;
use crate::platform::Pid;
use crate::topology::{CpuMask, MAX_CPUS};

use super::core::Scheduler;
use super::percpu::Current;
use super::types::{Behavior, EntityState, RtPolicy, SchedClass, SchedError};

/// Scheduler-wide event counters. All plain atomics; incremented from
/// whatever CPU observes the event.
pub(crate) struct Counters {
    pub deadline_misses: AtomicU64,
    pub bandwidth_violations: AtomicU64,
    pub migrations: AtomicU64,
    pub failed_migrations: AtomicU64,
    pub numa_local_placements: AtomicU64,
    pub numa_remote_placements: AtomicU64,
    pub cache_hits: AtomicU64,
    pub thermal_events: AtomicU64,
    pub input_boosts: AtomicU64,
    pub frames_completed: AtomicU64,
    pub frame_misses: AtomicU64,
}

impl Counters {
    pub const fn new() -> Self {
        Self {
            deadline_misses: AtomicU64::new(0),
            bandwidth_violations: AtomicU64::new(0),
            migrations: AtomicU64::new(0),
            failed_migrations: AtomicU64::new(0),
            numa_local_placements: AtomicU64::new(0),
            numa_remote_placements: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            thermal_events: AtomicU64::new(0),
            input_boosts: AtomicU64::new(0),
            frames_completed: AtomicU64::new(0),
            frame_misses: AtomicU64::new(0),
        }
    }
}

/// Per-CPU view inside a [`SchedStats`] snapshot.
#[derive(Clone, Copy, Debug, Default)]
pub struct CpuLoadSnapshot {
    pub cpu_id: u32,
    pub runnable: u32,
    pub load_1m: u64,
    pub load_5m: u64,
    pub load_15m: u64,
    pub context_switches: u64,
    pub preemptions: u64,
    pub voluntary_switches: u64,
    pub migrations_in: u64,
    pub migrations_out: u64,
    pub idle_ns: u64,
    pub current: Option<Pid>,
}

/// Point-in-time scheduler statistics.
#[derive(Clone, Copy)]
pub struct SchedStats {
    pub class_runnable: [u32; SchedClass::COUNT],
    pub context_switches: u64,
    pub preemptions: u64,
    pub voluntary_switches: u64,
    pub deadline_misses: u64,
    pub rt_bandwidth_violations: u64,
    pub rt_throttled: bool,
    pub migrations: u64,
    pub failed_migrations: u64,
    pub numa_local_placements: u64,
    pub numa_remote_placements: u64,
    pub cache_hits: u64,
    pub thermal_events: u64,
    pub input_boosts: u64,
    pub frames_completed: u64,
    pub frame_misses: u64,
    pub nr_cpus: u32,
    pub per_cpu: [CpuLoadSnapshot; MAX_CPUS],
}

/// Aggregate gaming performance over all gaming entities.
#[derive(Clone, Copy, Debug, Default)]
pub struct GamingPerf {
    pub frames_completed: u64,
    pub frame_misses: u64,
    pub worst_input_latency_ns: u64,
    pub worst_smooth_frame_ns: u64,
    pub input_boosts: u64,
    /// Timestamp of the last VSync pulse; 0 before the first one.
    pub last_vsync_ns: u64,
}

/// Per-task view for inspection and debugging.
#[derive(Clone, Copy, Debug)]
pub struct TaskInfo {
    pub pid: Pid,
    pub class: SchedClass,
    pub state: EntityState,
    pub static_priority: i32,
    pub dynamic_priority: i32,
    pub behavior: Behavior,
    pub cpu_affinity: CpuMask,
    pub last_cpu: u32,
    pub total_runtime_ns: u64,
    pub voluntary_switches: u32,
    pub involuntary_switches: u32,
    pub boost_count: u32,
    pub migration_count: u32,
    pub mlfq_level: Option<u8>,
    pub quantum_remaining_ns: Option<u64>,
    pub rt_policy: Option<RtPolicy>,
    pub rt_deadline_misses: Option<u32>,
    pub rt_throttled: Option<bool>,
    pub frame_deadline_ns: Option<u64>,
    pub frame_misses: Option<u32>,
    pub smooth_frame_ns: Option<u64>,
    pub pacing_delay_ns: Option<u64>,
    pub input_latency_ns: Option<u64>,
}

impl Scheduler {
    /// Gather a statistics snapshot across all CPUs.
    pub fn stats_snapshot(&self) -> SchedStats {
        let mut stats = SchedStats {
            class_runnable: [0; SchedClass::COUNT],
            context_switches: 0,
            preemptions: 0,
            voluntary_switches: 0,
            deadline_misses: self.counters.deadline_misses.load(Ordering::Relaxed),
            rt_bandwidth_violations: self.counters.bandwidth_violations.load(Ordering::Relaxed),
            rt_throttled: self.rt_is_throttled(),
            migrations: self.counters.migrations.load(Ordering::Relaxed),
            failed_migrations: self.counters.failed_migrations.load(Ordering::Relaxed),
            numa_local_placements: self.counters.numa_local_placements.load(Ordering::Relaxed),
            numa_remote_placements: self.counters.numa_remote_placements.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            thermal_events: self.counters.thermal_events.load(Ordering::Relaxed),
            input_boosts: self.counters.input_boosts.load(Ordering::Relaxed),
            frames_completed: self.counters.frames_completed.load(Ordering::Relaxed),
            frame_misses: self.counters.frame_misses.load(Ordering::Relaxed),
            nr_cpus: self.topology.nr_cpus(),
            per_cpu: [CpuLoadSnapshot::default(); MAX_CPUS],
        };

        for cpu in 0..self.topology.nr_cpus() {
            let slot = self.slot(cpu);
            let (counts, load, idle_ns, current) = {
                let rq = slot.rq.lock();
                let current = match rq.current {
                    Current::Idle => None,
                    Current::Task(s) => Some(rq.task(s).pid),
                };
                (rq.class_counts(), rq.load, rq.idle_ns, current)
            };
            for (i, c) in counts.iter().enumerate() {
                stats.class_runnable[i] += *c;
            }
            let view = &mut stats.per_cpu[cpu as usize];
            view.cpu_id = cpu;
            view.runnable = slot.runnable.load(Ordering::Relaxed);
            view.load_1m = load.one;
            view.load_5m = load.five;
            view.load_15m = load.fifteen;
            view.context_switches = slot.context_switches.load(Ordering::Relaxed);
            view.preemptions = slot.preemptions.load(Ordering::Relaxed);
            view.voluntary_switches = slot.voluntary_switches.load(Ordering::Relaxed);
            view.migrations_in = slot.migrations_in.load(Ordering::Relaxed);
            view.migrations_out = slot.migrations_out.load(Ordering::Relaxed);
            view.idle_ns = idle_ns;
            view.current = current;

            stats.context_switches += view.context_switches;
            stats.preemptions += view.preemptions;
            stats.voluntary_switches += view.voluntary_switches;
        }

        for node_id in 0..self.topology.nr_nodes() {
            let node = self.topology.node(node_id);
            let load: u32 = node
                .cpu_mask
                .iter()
                .map(|c| self.slot(c).runnable.load(Ordering::Relaxed))
                .sum();
            node.load_avg.store(load, Ordering::Relaxed);
        }
        stats
    }

    /// Aggregate frame and input statistics over every gaming entity.
    pub fn gaming_perf_snapshot(&self) -> GamingPerf {
        let mut perf = GamingPerf {
            frames_completed: self.counters.frames_completed.load(Ordering::Relaxed),
            frame_misses: self.counters.frame_misses.load(Ordering::Relaxed),
            input_boosts: self.counters.input_boosts.load(Ordering::Relaxed),
            last_vsync_ns: self.vsync_ns.load(Ordering::Acquire),
            ..GamingPerf::default()
        };
        for cpu in 0..self.topology.nr_cpus() {
            let rq = self.slot(cpu).rq.lock();
            for slot in rq.slots() {
                if let Some(g) = rq.task(slot).gaming() {
                    perf.worst_input_latency_ns = perf.worst_input_latency_ns.max(g.input_latency_ns);
                    perf.worst_smooth_frame_ns = perf.worst_smooth_frame_ns.max(g.smooth_frame_ns);
                }
            }
        }
        perf
    }

    /// Inspect one task's scheduler state.
    pub fn task_info(&self, pid: Pid) -> Result<TaskInfo, SchedError> {
        self.with_task(pid, |rq, slot| {
            let e = rq.task(slot);
            TaskInfo {
                pid: e.pid,
                class: e.class(),
                state: e.state,
                static_priority: e.static_priority,
                dynamic_priority: e.dynamic_priority,
                behavior: e.behavior,
                cpu_affinity: e.cpu_affinity,
                last_cpu: e.last_cpu,
                total_runtime_ns: e.total_runtime_ns,
                voluntary_switches: e.voluntary_switches,
                involuntary_switches: e.involuntary_switches,
                boost_count: e.boost_count,
                migration_count: e.migration_count,
                mlfq_level: e.mlfq().map(|m| m.level),
                quantum_remaining_ns: e.mlfq().map(|m| m.quantum_remaining_ns),
                rt_policy: e.rt().map(|r| r.policy),
                rt_deadline_misses: e.rt().map(|r| r.deadline_misses),
                rt_throttled: e.rt().map(|r| r.throttled),
                frame_deadline_ns: e.gaming().map(|g| g.frame_deadline_ns),
                frame_misses: e.gaming().map(|g| g.frame_misses),
                smooth_frame_ns: e.gaming().map(|g| g.smooth_frame_ns),
                pacing_delay_ns: e.gaming().map(|g| g.pacing_delay_ns),
                input_latency_ns: e.gaming().map(|g| g.input_latency_ns),
            }
        })
    }

    /// Structural self-check: queue counts match the lists, linked
    /// entities carry the matching tag, runnable entities sit inside
    /// their affinity, MLFQ quanta never exceed the level quantum.
    /// Panics on violation; meant for tests and debug builds.
    pub fn check_consistency(&self) {
        let mut total_runnable = 0u32;
        for cpu in 0..self.topology.nr_cpus() {
            let rq = self.slot(cpu).rq.lock();

            let mut linked = 0u32;
            for id in (0..super::types::MLFQ_LEVELS as u8)
                .map(super::types::QueueId::Mlfq)
                .chain([super::types::QueueId::Rt, super::types::QueueId::Gaming])
            {
                let q = rq.queue(id);
                let mut walked = 0;
                let mut cur = q.head;
                let mut prev = None;
                while let Some(s) = cur {
                    let e = rq.task(s);
                    assert_eq!(e.queue, Some(id), "queue tag mismatch");
                    assert_eq!(e.prev, prev, "broken back link");
                    assert_eq!(e.state, EntityState::Queued, "linked entity not queued");
                    prev = cur;
                    cur = e.next;
                    walked += 1;
                }
                assert_eq!(q.tail, prev, "queue tail mismatch");
                assert_eq!(q.count, walked, "queue count mismatch");
                linked += walked;
            }
            let running = matches!(rq.current, Current::Task(_)) as u32;
            assert_eq!(
                rq.runnable_count(),
                linked + running,
                "runnable count out of sync with the queues"
            );

            for slot in rq.slots() {
                let e = rq.task(slot);
                assert_eq!(e.last_cpu, cpu, "entity owned by the wrong CPU");
                if e.state != EntityState::Blocked {
                    assert!(
                        e.cpu_affinity.is_set(cpu),
                        "runnable entity outside its affinity"
                    );
                }
                if let Some(m) = e.mlfq() {
                    assert!(
                        m.quantum_remaining_ns <= super::types::quantum_for(m.level),
                        "quantum above the level quantum"
                    );
                }
                match e.state {
                    EntityState::Queued => assert!(e.queue.is_some()),
                    EntityState::Running => {
                        assert_eq!(rq.current, Current::Task(slot));
                        assert!(e.queue.is_none());
                    }
                    EntityState::Blocked => assert!(e.queue.is_none()),
                }
            }

            if let Current::Task(s) = rq.current {
                assert_eq!(rq.task(s).state, EntityState::Running);
            }
            total_runnable += rq.runnable_count();
        }

        // Every runnable entity is counted exactly once across the CPUs.
        let mut per_class = 0;
        let stats = self.stats_snapshot();
        for c in stats.class_runnable {
            per_class += c;
        }
        assert_eq!(total_runnable, per_class, "runnable totals disagree");
    }

    /// Log a per-CPU summary through the kernel log.
    pub fn dump_runqueues(&self) {
        kinfo!("=== Runqueue summary ({} CPUs) ===", self.topology.nr_cpus());
        for cpu in 0..self.topology.nr_cpus() {
            let slot = self.slot(cpu);
            let rq = slot.rq.lock();
            let mlfq: u32 = rq.mlfq.iter().map(|q| q.count).sum();
            kinfo!(
                "cpu{}: run={} mlfq={} rt={} gaming={} ctxsw={} idle_ns={}",
                cpu,
                rq.runnable_count(),
                mlfq,
                rq.rt.count,
                rq.gaming.count,
                slot.context_switches.load(Ordering::Relaxed),
                rq.idle_ns
            );
        }
        let s = self.stats_snapshot();
        kinfo!(
            "totals: ctxsw={} migrations={} failed={} dl_miss={} bw_viol={}",
            s.context_switches,
            s.migrations,
            s.failed_migrations,
            s.deadline_misses,
            s.rt_bandwidth_violations
        );
    }
}
