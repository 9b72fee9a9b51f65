//! Scheduler type definitions
//!
//! This module contains the scheduling classes, the per-process scheduling
//! entity, the scheduler-wide configuration and the error type.

use crate::platform::Pid;
use crate::topology::CpuMask;

/// Number of priority levels in the MLFQ scheduler (0 = highest).
pub const MLFQ_LEVELS: usize = 5;

/// Time quantum per MLFQ level. These are the only quanta non-RT classes
/// ever run with.
pub const MLFQ_QUANTUM_NS: [u64; MLFQ_LEVELS] =
    [1_000_000, 2_000_000, 4_000_000, 8_000_000, 16_000_000];

/// Round-robin quantum for `RtPolicy::Rr`.
pub const RT_RR_QUANTUM_NS: u64 = 1_000_000;

/// Nice value range (POSIX compatible).
pub const NICE_MIN: i32 = -20;
pub const NICE_MAX: i32 = 19;

/// Upper bound on the behaviour-learning priority bias:
/// `static_priority <= dynamic_priority <= static_priority + MAX_BEHAVIOR_BIAS`.
pub const MAX_BEHAVIOR_BIAS: i32 = 10;

#[inline]
pub const fn quantum_for(level: u8) -> u64 {
    MLFQ_QUANTUM_NS[level as usize]
}

/// Scheduling class, ordered by preemption strength (strongest first).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedClass {
    Gaming,
    Realtime,
    Interactive,
    Normal,
    Background,
}

impl SchedClass {
    pub const COUNT: usize = 5;

    pub const fn index(self) -> usize {
        match self {
            SchedClass::Gaming => 0,
            SchedClass::Realtime => 1,
            SchedClass::Interactive => 2,
            SchedClass::Normal => 3,
            SchedClass::Background => 4,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            SchedClass::Gaming => "Gaming",
            SchedClass::Realtime => "Realtime",
            SchedClass::Interactive => "Interactive",
            SchedClass::Normal => "Normal",
            SchedClass::Background => "Background",
        }
    }
}

/// The three classes that live on the MLFQ levels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MlfqTier {
    Interactive,
    Normal,
    Background,
}

impl MlfqTier {
    /// The level a freshly attached (or emergency-promoted) entity of this
    /// tier runs at.
    pub const fn natural_level(self) -> u8 {
        match self {
            MlfqTier::Interactive => 1,
            MlfqTier::Normal => 2,
            MlfqTier::Background => 4,
        }
    }

    pub const fn class(self) -> SchedClass {
        match self {
            MlfqTier::Interactive => SchedClass::Interactive,
            MlfqTier::Normal => SchedClass::Normal,
            MlfqTier::Background => SchedClass::Background,
        }
    }
}

/// Real-time scheduling policies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RtPolicy {
    Fifo,
    Rr,
    Deadline,
}

/// Learned process behaviour pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behavior {
    Unknown,
    CpuBound,
    IoBound,
    Interactive,
    Gaming,
    Batch,
}

/// Initial CPU placement policy (scheduler-wide setting).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlacementPolicy {
    FirstFit,
    BestFit,
    NumaLocal,
    CacheAware,
    ThermalAware,
    PowerAware,
}

// ============================================================================
// Class-specific state
// ============================================================================

#[derive(Clone, Copy, Debug)]
pub struct MlfqParams {
    pub tier: MlfqTier,
    /// Current MLFQ level (0..=4). Demoted on quantum exhaustion, promoted
    /// by aging.
    pub level: u8,
    pub quantum_remaining_ns: u64,
}

impl MlfqParams {
    pub const fn new(tier: MlfqTier) -> Self {
        let level = tier.natural_level();
        Self {
            tier,
            level,
            quantum_remaining_ns: quantum_for(level),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RtParams {
    pub policy: RtPolicy,
    /// Absolute deadline; 0 means none installed.
    pub deadline_ns: u64,
    pub period_ns: u64,
    pub runtime_budget_ns: u64,
    /// Round-robin quantum, only decremented for `RtPolicy::Rr`.
    pub quantum_remaining_ns: u64,
    pub throttled: bool,
    pub deadline_misses: u32,
    /// The current deadline has already been counted as missed.
    pub deadline_flagged: bool,
}

impl RtParams {
    pub const fn new(policy: RtPolicy) -> Self {
        Self {
            policy,
            deadline_ns: 0,
            period_ns: 0,
            runtime_budget_ns: 0,
            quantum_remaining_ns: RT_RR_QUANTUM_NS,
            throttled: false,
            deadline_misses: 0,
            deadline_flagged: false,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct GamingParams {
    /// Frame deadline; 0 means none installed.
    pub frame_deadline_ns: u64,
    pub frame_target_fps: u32,
    /// When the current frame started computing.
    pub frame_start_ns: u64,
    /// Exponentially smoothed frame time.
    pub smooth_frame_ns: u64,
    pub frames_completed: u32,
    pub frame_misses: u32,
    /// Pacing delay suggested after the last early frame.
    pub pacing_delay_ns: u64,
    /// Input boost expiry; 0 means no boost armed.
    pub boost_expiry_ns: u64,
    pub last_input_ns: u64,
    /// Input-to-dispatch latency observed for the last input event.
    pub input_latency_ns: u64,
    /// Tier to return to when gaming mode is dropped.
    pub saved_tier: MlfqTier,
}

impl GamingParams {
    pub const fn new(frame_target_fps: u32, saved_tier: MlfqTier) -> Self {
        Self {
            frame_deadline_ns: 0,
            frame_target_fps,
            frame_start_ns: 0,
            smooth_frame_ns: 0,
            frames_completed: 0,
            frame_misses: 0,
            pacing_delay_ns: 0,
            boost_expiry_ns: 0,
            last_input_ns: 0,
            input_latency_ns: 0,
            saved_tier,
        }
    }

    /// Nanoseconds per frame at the target rate.
    pub const fn frame_target_ns(&self) -> u64 {
        if self.frame_target_fps == 0 {
            1_000_000_000 / 60
        } else {
            1_000_000_000 / self.frame_target_fps as u64
        }
    }
}

/// Class behaviour, dispatched on the variant.
#[derive(Clone, Copy, Debug)]
pub enum ClassParams {
    Gaming(GamingParams),
    Realtime(RtParams),
    Mlfq(MlfqParams),
}

// ============================================================================
// Scheduling entity
// ============================================================================

/// What the entity is doing right now, from the runqueue's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityState {
    /// Linked into one of the owner CPU's queues.
    Queued,
    /// The owner CPU's `current`.
    Running,
    /// Not runnable; parked in the owner CPU's arena, linked nowhere.
    Blocked,
}

/// Which queue an entity is linked into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueId {
    Mlfq(u8),
    Rt,
    Gaming,
}

/// Per-process scheduler state. Lives in the owning CPU's arena; the owner
/// is `last_cpu` and only changes under both runqueue locks.
#[derive(Clone, Copy, Debug)]
pub struct SchedEntity {
    pub pid: Pid,
    pub params: ClassParams,
    pub state: EntityState,

    /// Static priority (nice value, -20..=19).
    pub static_priority: i32,
    /// Dynamic priority; behaviour bias keeps it in
    /// `static ..= static + MAX_BEHAVIOR_BIAS`, gaming/RT boosts set it
    /// directly.
    pub dynamic_priority: i32,

    // Accounting
    pub total_runtime_ns: u64,
    pub last_dispatched_ns: u64,
    pub last_preempted_ns: u64,
    pub voluntary_switches: u32,
    pub involuntary_switches: u32,
    pub boost_count: u32,
    pub migration_count: u32,
    pub last_migration_ns: u64,
    pub wait_start_ns: u64,
    pub total_wait_ns: u64,
    pub block_start_ns: u64,
    pub total_blocked_ns: u64,

    // Placement
    pub cpu_affinity: CpuMask,
    pub preferred_cpu: u32,
    pub last_cpu: u32,

    // Behaviour learning
    pub behavior: Behavior,
    pub cpu_usage_percent: u32,
    pub io_wait_percent: u32,

    // Runqueue linkage (slot indices into the owning CPU's arena)
    pub queue: Option<QueueId>,
    pub prev: Option<u16>,
    pub next: Option<u16>,
}

impl SchedEntity {
    pub fn new(pid: Pid, params: ClassParams, affinity: CpuMask, cpu: u32, now: u64) -> Self {
        Self {
            pid,
            params,
            state: EntityState::Blocked,
            static_priority: 0,
            dynamic_priority: 0,
            total_runtime_ns: 0,
            last_dispatched_ns: 0,
            last_preempted_ns: 0,
            voluntary_switches: 0,
            involuntary_switches: 0,
            boost_count: 0,
            migration_count: 0,
            last_migration_ns: 0,
            wait_start_ns: now,
            total_wait_ns: 0,
            block_start_ns: now,
            total_blocked_ns: 0,
            cpu_affinity: affinity,
            preferred_cpu: cpu,
            last_cpu: cpu,
            behavior: Behavior::Unknown,
            cpu_usage_percent: 0,
            io_wait_percent: 0,
            queue: None,
            prev: None,
            next: None,
        }
    }

    pub const fn class(&self) -> SchedClass {
        match self.params {
            ClassParams::Gaming(_) => SchedClass::Gaming,
            ClassParams::Realtime(_) => SchedClass::Realtime,
            ClassParams::Mlfq(m) => m.tier.class(),
        }
    }

    pub const fn is_gaming(&self) -> bool {
        matches!(self.params, ClassParams::Gaming(_))
    }

    pub const fn is_realtime(&self) -> bool {
        matches!(self.params, ClassParams::Realtime(_))
    }

    pub fn mlfq(&self) -> Option<&MlfqParams> {
        match &self.params {
            ClassParams::Mlfq(m) => Some(m),
            _ => None,
        }
    }

    pub fn mlfq_mut(&mut self) -> Option<&mut MlfqParams> {
        match &mut self.params {
            ClassParams::Mlfq(m) => Some(m),
            _ => None,
        }
    }

    pub fn rt(&self) -> Option<&RtParams> {
        match &self.params {
            ClassParams::Realtime(r) => Some(r),
            _ => None,
        }
    }

    pub fn rt_mut(&mut self) -> Option<&mut RtParams> {
        match &mut self.params {
            ClassParams::Realtime(r) => Some(r),
            _ => None,
        }
    }

    pub fn gaming(&self) -> Option<&GamingParams> {
        match &self.params {
            ClassParams::Gaming(g) => Some(g),
            _ => None,
        }
    }

    pub fn gaming_mut(&mut self) -> Option<&mut GamingParams> {
        match &mut self.params {
            ClassParams::Gaming(g) => Some(g),
            _ => None,
        }
    }

    /// The queue this entity belongs on when runnable.
    pub fn home_queue(&self) -> QueueId {
        match &self.params {
            ClassParams::Gaming(_) => QueueId::Gaming,
            ClassParams::Realtime(_) => QueueId::Rt,
            ClassParams::Mlfq(m) => QueueId::Mlfq(m.level),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Gaming mode configuration.
#[derive(Clone, Copy, Debug)]
pub struct GamingConfig {
    pub enabled: bool,
    /// Dynamic priority applied on input events.
    pub input_boost_priority: i32,
    pub input_boost_duration_ns: u64,
    pub frame_rate_target: u32,
    /// CPUs reserved for gaming entities; `None` means the topology's
    /// performance cores.
    pub cpu_mask: Option<CpuMask>,
    /// Frame deadlines closer than this get head placement and preempt.
    pub urgency_threshold_ns: u64,
}

impl GamingConfig {
    pub const fn new() -> Self {
        Self {
            enabled: false,
            input_boost_priority: -10,
            input_boost_duration_ns: 16_666_666,
            frame_rate_target: 60,
            cpu_mask: None,
            urgency_threshold_ns: 100_000,
        }
    }
}

impl Default for GamingConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Scheduler-wide configuration. Read-mostly; hot flags are mirrored into
/// atomics by the scheduler.
#[derive(Clone, Copy, Debug)]
pub struct SchedConfig {
    pub placement: PlacementPolicy,
    pub aging_scan_interval_ms: u32,
    pub aging_threshold_ms: u32,
    pub aging_emergency_threshold_ms: u32,
    pub min_migration_interval_ms: u32,
    /// Balance cadence per domain level, indexed by `DomainLevel::index()`
    /// (SMT, core, package, NUMA).
    pub balance_interval_ms: [u32; 4],
    pub rt_bandwidth_ns: u64,
    pub rt_period_ns: u64,
    pub gaming: GamingConfig,
}

impl SchedConfig {
    pub const fn new() -> Self {
        Self {
            placement: PlacementPolicy::NumaLocal,
            aging_scan_interval_ms: 100,
            aging_threshold_ms: 100,
            aging_emergency_threshold_ms: 500,
            min_migration_interval_ms: 10,
            balance_interval_ms: [1, 5, 10, 100],
            rt_bandwidth_ns: 950_000_000,
            rt_period_ns: 1_000_000_000,
            gaming: GamingConfig::new(),
        }
    }
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced to the process layer. In-scheduler conditions (throttle,
/// deadline miss, migration abort) never reach here; they land in the
/// statistics counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedError {
    /// Affinity mask contains no schedulable CPU.
    AffinityEmpty,
    /// Target CPU went offline between selection and use.
    CpuOffline,
    /// Incompatible class/policy combination or out-of-range argument.
    InvalidPolicy,
    /// No entity attached for that pid.
    TaskNotFound,
    /// Pid already has an entity attached.
    AlreadyAttached,
    /// Task table or target runqueue arena is full.
    TableFull,
}

impl core::fmt::Display for SchedError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            SchedError::AffinityEmpty => "affinity mask contains no schedulable CPU",
            SchedError::CpuOffline => "target CPU is offline",
            SchedError::InvalidPolicy => "invalid policy or argument",
            SchedError::TaskNotFound => "task not found",
            SchedError::AlreadyAttached => "task already attached",
            SchedError::TableFull => "task table full",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantum_table_doubles() {
        assert_eq!(MLFQ_QUANTUM_NS, [1_000_000, 2_000_000, 4_000_000, 8_000_000, 16_000_000]);
        for level in 0..MLFQ_LEVELS - 1 {
            assert_eq!(MLFQ_QUANTUM_NS[level] * 2, MLFQ_QUANTUM_NS[level + 1]);
        }
    }

    #[test]
    fn natural_levels() {
        assert_eq!(MlfqTier::Interactive.natural_level(), 1);
        assert_eq!(MlfqTier::Normal.natural_level(), 2);
        assert_eq!(MlfqTier::Background.natural_level(), 4);
    }

    #[test]
    fn new_entity_defaults() {
        let e = SchedEntity::new(
            7,
            ClassParams::Mlfq(MlfqParams::new(MlfqTier::Normal)),
            CpuMask::first_n(4),
            2,
            1000,
        );
        assert_eq!(e.class(), SchedClass::Normal);
        assert_eq!(e.state, EntityState::Blocked);
        assert_eq!(e.last_cpu, 2);
        assert_eq!(e.mlfq().unwrap().level, 2);
        assert_eq!(e.mlfq().unwrap().quantum_remaining_ns, quantum_for(2));
        assert!(e.queue.is_none());
    }

    #[test]
    fn frame_target_from_fps() {
        let g = GamingParams::new(60, MlfqTier::Normal);
        assert_eq!(g.frame_target_ns(), 16_666_666);
        let g = GamingParams::new(144, MlfqTier::Normal);
        assert_eq!(g.frame_target_ns(), 6_944_444);
        let g = GamingParams::new(0, MlfqTier::Normal);
        assert_eq!(g.frame_target_ns(), 16_666_666);
    }

    #[test]
    fn config_defaults() {
        let cfg = SchedConfig::new();
        assert_eq!(cfg.placement, PlacementPolicy::NumaLocal);
        assert_eq!(cfg.rt_bandwidth_ns, 950_000_000);
        assert_eq!(cfg.rt_period_ns, 1_000_000_000);
        assert_eq!(cfg.aging_scan_interval_ms, 100);
        assert_eq!(cfg.aging_emergency_threshold_ms, 500);
        assert_eq!(cfg.balance_interval_ms, [1, 5, 10, 100]);
        assert!(!cfg.gaming.enabled);
        assert_eq!(cfg.gaming.input_boost_priority, -10);
        assert_eq!(cfg.gaming.input_boost_duration_ns, 16_666_666);
    }
}
