#![allow(dead_code)]

//! Shared test harness: a deterministic simulated platform and helpers to
//! drive the scheduler through simulated time.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use nexa_sched::{
    CpuDesc, CpuMask, CpuTopology, Pid, Platform, SchedClass, SchedConfig, Scheduler,
};

/// Simulated machine: a manually advanced clock, a selectable "current"
/// CPU, and recorders for timer/context-switch/frequency calls.
pub struct SimPlatform {
    now: AtomicU64,
    cpu: AtomicU32,
    pub timer_interval: AtomicU64,
    pub switches: Mutex<Vec<(Option<Pid>, Option<Pid>)>>,
    pub freq_hints: Mutex<Vec<(u32, u32)>>,
}

impl SimPlatform {
    pub fn new() -> Self {
        Self {
            // Start past zero so "never" (0) timestamps stay distinguishable.
            now: AtomicU64::new(1_000_000),
            cpu: AtomicU32::new(0),
            timer_interval: AtomicU64::new(0),
            switches: Mutex::new(Vec::new()),
            freq_hints: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, ns: u64) {
        self.now.fetch_add(ns, Ordering::SeqCst);
    }

    pub fn set_cpu(&self, cpu: u32) {
        self.cpu.store(cpu, Ordering::SeqCst);
    }

    pub fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    pub fn switch_count(&self) -> usize {
        self.switches.lock().unwrap().len()
    }
}

impl Platform for SimPlatform {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn current_cpu_id(&self) -> u32 {
        self.cpu.load(Ordering::SeqCst)
    }

    fn arm_timer(&self, interval_ns: u64) {
        self.timer_interval.store(interval_ns, Ordering::SeqCst);
    }

    fn switch_context(&self, prev: Option<Pid>, next: Option<Pid>) {
        self.switches.lock().unwrap().push((prev, next));
    }

    fn cpu_relax(&self) {}

    fn frequency_hint(&self, cpu_id: u32, mhz: u32) {
        self.freq_hints.lock().unwrap().push((cpu_id, mhz));
    }
}

/// Scheduler over the synthetic symmetric topology.
pub fn sched(num_cpus: u32, cpus_per_node: u32) -> Scheduler {
    Scheduler::new(
        CpuTopology::symmetric(num_cpus, cpus_per_node),
        SchedConfig::new(),
    )
}

/// Scheduler over a flat single-package topology: no SMT pairs, one L2/L3
/// complex spanning all CPUs, one NUMA node.
pub fn sched_flat_package(num_cpus: u32) -> Scheduler {
    let descs: Vec<CpuDesc> = (0..num_cpus)
        .map(|cpu| CpuDesc {
            cpu_id: cpu,
            physical_core_id: cpu,
            package_id: 0,
            numa_node_id: 0,
            l1_group: cpu,
            l2_group: 0,
            l3_group: 0,
            kind: nexa_sched::topology::CoreKind::Performance,
            smt_sibling: None,
            base_mhz: 3000,
            max_mhz: 4000,
        })
        .collect();
    Scheduler::new(CpuTopology::new(&descs), SchedConfig::new())
}

/// Attach a process with full affinity and wake it.
pub fn spawn(s: &Scheduler, p: &SimPlatform, pid: Pid, class: SchedClass) {
    s.attach(p, pid, class, CpuMask::ALL).unwrap();
    s.wake(p, pid).unwrap();
}

/// Attach a process pinned to one CPU and wake it.
pub fn spawn_pinned(s: &Scheduler, p: &SimPlatform, pid: Pid, class: SchedClass, cpu: u32) {
    s.attach(p, pid, class, CpuMask::single(cpu)).unwrap();
    s.wake(p, pid).unwrap();
}

/// Tick-and-dispatch one CPU once at the current simulated time.
pub fn kick(s: &Scheduler, p: &SimPlatform, cpu: u32) {
    p.set_cpu(cpu);
    if s.tick(p, cpu) {
        s.reschedule(p, cpu);
    }
}

/// Drive all CPUs through `span_ns` of simulated time with a fixed tick.
pub fn run_for(s: &Scheduler, p: &SimPlatform, num_cpus: u32, span_ns: u64, tick_ns: u64) {
    let mut elapsed = 0;
    while elapsed < span_ns {
        p.advance(tick_ns);
        elapsed += tick_ns;
        for cpu in 0..num_cpus {
            kick(s, p, cpu);
        }
    }
}
