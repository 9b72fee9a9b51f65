//! Scheduler subsystem
//!
//! Multi-level feedback queue scheduler with a gaming fast path, a
//! real-time class and topology-aware placement.
//!
//! ## Per-CPU Architecture
//!
//! Each CPU owns one runqueue behind its own spinlock. The runqueue holds
//! the scheduling entities assigned to that CPU in a fixed-size arena;
//! the MLFQ levels and the RT and gaming queues are intrusive index lists
//! over that arena. Cross-CPU work (migration, remote wakeup) takes both
//! runqueue locks in ascending CPU-id order and never anything more.
//!
//! ## Module Organization
//!
//! - `types`: scheduling classes, entity record, configuration, errors
//! - `table`: pid to owning-CPU index and attach/detach lifecycle
//! - `percpu`: per-CPU runqueue, arena, queue linkage, load averages
//! - `priority`: quantum table, demotion, aging, behaviour learning
//! - `core`: the `Scheduler` value — tick, pick-next, preemption, dispatch
//! - `smp`: affinity, placement policies, migration, domain balancing
//! - `gaming`: gaming mode, frame deadlines, input boosts, VSync
//! - `rt`: real-time policies and bandwidth throttling
//! - `stats`: statistics snapshots and debug dumps

mod core;
mod gaming;
mod percpu;
mod priority;
mod rt;
mod smp;
mod stats;
mod table;
mod types;

pub use self::core::Scheduler;
pub use self::gaming::{GAMING_TIMER_INTERVAL_NS, NORMAL_TIMER_INTERVAL_NS};
pub use self::percpu::{Current, PICK_URGENCY_NS, RQ_CAP};
pub use self::stats::{CpuLoadSnapshot, GamingPerf, SchedStats, TaskInfo};
pub use self::table::MAX_TASKS;
pub use self::types::{
    Behavior, ClassParams, EntityState, GamingConfig, GamingParams, MlfqParams, MlfqTier,
    PlacementPolicy, QueueId, RtParams, RtPolicy, SchedClass, SchedConfig, SchedEntity,
    SchedError, MLFQ_LEVELS, MLFQ_QUANTUM_NS, NICE_MAX, NICE_MIN, RT_RR_QUANTUM_NS, quantum_for,
};
