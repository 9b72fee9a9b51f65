//! CPU and NUMA topology model.
//!
//! Discovered once at boot from platform-provided [`CpuDesc`] records and
//! published read-only. Placement and balancing hit this table on every hot
//! path, so it is flat arrays throughout: one CPU record per logical CPU,
//! one node record per NUMA node, and one pre-built domain list per balance
//! level. Only the dynamic per-CPU state (online, isolated, frequency,
//! temperature) changes after boot, and it lives in atomics.
//!
//! ## Invariants
//!
//! - CPUs sharing an L1 group share L2 and L3; CPUs sharing L2 share L3.
//! - NUMA node cpu masks partition the CPUs.
//! - Domains nest: every SMT set is inside a core set, every core set
//!   inside a package set, every package set inside a NUMA set.
//!
//! Violations are construction-time assertion failures.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Maximum number of logical CPUs supported (one bit per CPU in [`CpuMask`]).
pub const MAX_CPUS: usize = 64;

/// Maximum number of NUMA nodes.
pub const MAX_NUMA_NODES: usize = 8;

// ============================================================================
// CPU mask
// ============================================================================

/// A set of logical CPUs, one bit per CPU id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuMask(pub u64);

impl CpuMask {
    pub const NONE: CpuMask = CpuMask(0);
    pub const ALL: CpuMask = CpuMask(u64::MAX);

    /// Mask with the low `n` CPUs set.
    pub const fn first_n(n: u32) -> CpuMask {
        if n >= 64 {
            CpuMask::ALL
        } else {
            CpuMask((1u64 << n) - 1)
        }
    }

    pub const fn single(cpu: u32) -> CpuMask {
        CpuMask(1u64 << cpu)
    }

    pub const fn is_set(self, cpu: u32) -> bool {
        cpu < 64 && (self.0 & (1u64 << cpu)) != 0
    }

    pub const fn set(self, cpu: u32) -> CpuMask {
        CpuMask(self.0 | (1u64 << cpu))
    }

    pub const fn clear(self, cpu: u32) -> CpuMask {
        CpuMask(self.0 & !(1u64 << cpu))
    }

    pub const fn and(self, other: CpuMask) -> CpuMask {
        CpuMask(self.0 & other.0)
    }

    pub const fn or(self, other: CpuMask) -> CpuMask {
        CpuMask(self.0 | other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    pub const fn first_set(self) -> Option<u32> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros())
        }
    }

    pub fn iter(self) -> CpuMaskIter {
        CpuMaskIter { bits: self.0 }
    }
}

pub struct CpuMaskIter {
    bits: u64,
}

impl Iterator for CpuMaskIter {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.bits == 0 {
            return None;
        }
        let cpu = self.bits.trailing_zeros();
        self.bits &= self.bits - 1;
        Some(cpu)
    }
}

// ============================================================================
// Per-CPU records
// ============================================================================

/// Performance vs efficiency core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoreKind {
    Performance,
    Efficiency,
}

/// Static description of one logical CPU, as reported by platform discovery.
#[derive(Clone, Copy, Debug)]
pub struct CpuDesc {
    pub cpu_id: u32,
    pub physical_core_id: u32,
    pub package_id: u32,
    pub numa_node_id: u32,
    pub l1_group: u32,
    pub l2_group: u32,
    pub l3_group: u32,
    pub kind: CoreKind,
    pub smt_sibling: Option<u32>,
    pub base_mhz: u32,
    pub max_mhz: u32,
}

/// Published CPU record: the static description plus runtime state.
pub struct CpuInfo {
    pub desc: CpuDesc,
    pub online: AtomicBool,
    pub isolated: AtomicBool,
    pub current_mhz: AtomicU32,
    pub temperature_c: AtomicU32,
}

impl CpuInfo {
    fn new(desc: CpuDesc) -> Self {
        Self {
            online: AtomicBool::new(true),
            isolated: AtomicBool::new(false),
            current_mhz: AtomicU32::new(desc.base_mhz),
            temperature_c: AtomicU32::new(40),
            desc,
        }
    }

    #[inline]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_isolated(&self) -> bool {
        self.isolated.load(Ordering::Acquire)
    }

    #[inline]
    pub fn temperature(&self) -> u32 {
        self.temperature_c.load(Ordering::Relaxed)
    }
}

/// NUMA node record.
pub struct NumaNode {
    pub node_id: u32,
    pub cpu_mask: CpuMask,
    pub memory_bytes: u64,
    pub free_bytes: AtomicU64,
    pub bandwidth_mbps: u32,
    pub latency_ns: u32,
    pub load_avg: AtomicU32,
    pub process_count: AtomicU32,
}

// Per-node defaults used when discovery reports no memory figures.
const NODE_MEMORY_BYTES: u64 = 8 * 1024 * 1024 * 1024;
const NODE_BANDWIDTH_MBPS: u32 = 25_600;
const NODE_LATENCY_NS: u32 = 100;

impl NumaNode {
    fn new(node_id: u32, cpu_mask: CpuMask) -> Self {
        Self {
            node_id,
            cpu_mask,
            memory_bytes: NODE_MEMORY_BYTES,
            free_bytes: AtomicU64::new(NODE_MEMORY_BYTES / 2),
            bandwidth_mbps: NODE_BANDWIDTH_MBPS,
            latency_ns: NODE_LATENCY_NS,
            load_avg: AtomicU32::new(0),
            process_count: AtomicU32::new(0),
        }
    }
}

// ============================================================================
// Balance domains
// ============================================================================

/// Topological level a load-balance domain covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DomainLevel {
    Smt,
    Core,
    Package,
    Numa,
}

impl DomainLevel {
    pub const ALL: [DomainLevel; 4] = [
        DomainLevel::Smt,
        DomainLevel::Core,
        DomainLevel::Package,
        DomainLevel::Numa,
    ];

    pub const fn index(self) -> usize {
        match self {
            DomainLevel::Smt => 0,
            DomainLevel::Core => 1,
            DomainLevel::Package => 2,
            DomainLevel::Numa => 3,
        }
    }

    /// Runqueue-length difference that triggers a migration at this level.
    pub const fn default_imbalance_threshold(self) -> u32 {
        match self {
            DomainLevel::Smt => 1,
            DomainLevel::Core => 2,
            DomainLevel::Package => 3,
            DomainLevel::Numa => 4,
        }
    }

    /// Minimum interval between balance passes at this level.
    pub const fn default_interval_ns(self) -> u64 {
        match self {
            DomainLevel::Smt => 1_000_000,
            DomainLevel::Core => 5_000_000,
            DomainLevel::Package => 10_000_000,
            DomainLevel::Numa => 100_000_000,
        }
    }
}

/// One load-balance domain: a CPU set balanced on its own cadence.
pub struct BalanceDomain {
    pub level: DomainLevel,
    pub cpu_mask: CpuMask,
    pub imbalance_threshold: u32,
    pub min_balance_interval_ns: u64,
    pub last_balance_ns: AtomicU64,
    pub total_migrations: AtomicU64,
    pub failed_migrations: AtomicU64,
}

impl BalanceDomain {
    fn new(level: DomainLevel, cpu_mask: CpuMask) -> Self {
        Self {
            level,
            cpu_mask,
            imbalance_threshold: level.default_imbalance_threshold(),
            min_balance_interval_ns: level.default_interval_ns(),
            last_balance_ns: AtomicU64::new(0),
            total_migrations: AtomicU64::new(0),
            failed_migrations: AtomicU64::new(0),
        }
    }
}

struct DomainList {
    list: [Option<BalanceDomain>; MAX_CPUS],
    len: usize,
}

impl DomainList {
    fn push(&mut self, domain: BalanceDomain) {
        assert!(self.len < MAX_CPUS, "too many balance domains");
        self.list[self.len] = Some(domain);
        self.len += 1;
    }
}

// ============================================================================
// Topology table
// ============================================================================

/// The boot-time topology table. Immutable after construction except for the
/// dynamic per-CPU state.
pub struct CpuTopology {
    cpus: [Option<CpuInfo>; MAX_CPUS],
    nr_cpus: u32,
    nodes: [Option<NumaNode>; MAX_NUMA_NODES],
    nr_nodes: u32,
    domains: [DomainList; 4],
    performance_mask: CpuMask,
    efficiency_mask: CpuMask,
}

impl CpuTopology {
    /// Build the table from discovery output. `descs[i].cpu_id` must equal
    /// `i` (dense logical ids).
    pub fn new(descs: &[CpuDesc]) -> Self {
        assert!(!descs.is_empty(), "topology needs at least one CPU");
        assert!(descs.len() <= MAX_CPUS, "too many CPUs");

        let mut cpus: [Option<CpuInfo>; MAX_CPUS] = core::array::from_fn(|_| None);
        let mut performance_mask = CpuMask::NONE;
        let mut efficiency_mask = CpuMask::NONE;

        for (i, desc) in descs.iter().enumerate() {
            assert_eq!(desc.cpu_id as usize, i, "CPU ids must be dense");
            match desc.kind {
                CoreKind::Performance => performance_mask = performance_mask.set(desc.cpu_id),
                CoreKind::Efficiency => efficiency_mask = efficiency_mask.set(desc.cpu_id),
            }
            cpus[i] = Some(CpuInfo::new(*desc));
        }

        // Cache nesting: same L1 group implies same L2 and L3, same L2
        // implies same L3.
        for a in descs {
            for b in descs {
                if a.l1_group == b.l1_group {
                    assert_eq!(a.l2_group, b.l2_group, "L1 group split across L2");
                    assert_eq!(a.l3_group, b.l3_group, "L1 group split across L3");
                }
                if a.l2_group == b.l2_group {
                    assert_eq!(a.l3_group, b.l3_group, "L2 group split across L3");
                }
            }
        }

        // NUMA nodes from the per-CPU node ids.
        let mut nodes: [Option<NumaNode>; MAX_NUMA_NODES] = core::array::from_fn(|_| None);
        let mut nr_nodes = 0u32;
        for desc in descs {
            let node = desc.numa_node_id as usize;
            assert!(node < MAX_NUMA_NODES, "NUMA node id out of range");
            match &mut nodes[node] {
                Some(existing) => existing.cpu_mask = existing.cpu_mask.set(desc.cpu_id),
                None => {
                    nodes[node] = Some(NumaNode::new(
                        desc.numa_node_id,
                        CpuMask::single(desc.cpu_id),
                    ));
                    nr_nodes = nr_nodes.max(desc.numa_node_id + 1);
                }
            }
        }

        let domains = [
            Self::build_domains(descs, DomainLevel::Smt, |d| d.physical_core_id),
            Self::build_domains(descs, DomainLevel::Core, |d| d.l2_group),
            Self::build_domains(descs, DomainLevel::Package, |d| d.package_id),
            Self::build_domains(descs, DomainLevel::Numa, |d| d.numa_node_id),
        ];

        let topo = Self {
            cpus,
            nr_cpus: descs.len() as u32,
            nodes,
            nr_nodes,
            domains,
            performance_mask,
            efficiency_mask,
        };
        topo.assert_nesting();
        topo
    }

    /// Synthetic symmetric topology: SMT pairs, `cpus_per_node` CPUs per
    /// NUMA node (also the package and L3 boundary), the first four CPUs
    /// performance cores. Used for boots without real discovery and by the
    /// test harness.
    pub fn symmetric(num_cpus: u32, cpus_per_node: u32) -> Self {
        assert!(num_cpus >= 1 && num_cpus as usize <= MAX_CPUS);
        assert!(cpus_per_node >= 1);

        let mut descs = [CpuDesc {
            cpu_id: 0,
            physical_core_id: 0,
            package_id: 0,
            numa_node_id: 0,
            l1_group: 0,
            l2_group: 0,
            l3_group: 0,
            kind: CoreKind::Performance,
            smt_sibling: None,
            base_mhz: 0,
            max_mhz: 0,
        }; MAX_CPUS];

        for cpu in 0..num_cpus {
            let perf = cpu < 4;
            let sibling = if cpu % 2 == 0 { cpu + 1 } else { cpu - 1 };
            descs[cpu as usize] = CpuDesc {
                cpu_id: cpu,
                physical_core_id: cpu / 2,
                package_id: cpu / cpus_per_node,
                numa_node_id: cpu / cpus_per_node,
                l1_group: cpu,
                l2_group: cpu / 2,
                l3_group: cpu / cpus_per_node,
                kind: if perf {
                    CoreKind::Performance
                } else {
                    CoreKind::Efficiency
                },
                smt_sibling: if sibling < num_cpus {
                    Some(sibling)
                } else {
                    None
                },
                base_mhz: if perf { 3000 } else { 2000 },
                max_mhz: if perf { 4000 } else { 2500 },
            };
        }

        Self::new(&descs[..num_cpus as usize])
    }

    fn build_domains(
        descs: &[CpuDesc],
        level: DomainLevel,
        key: impl Fn(&CpuDesc) -> u32,
    ) -> DomainList {
        let mut out = DomainList {
            list: core::array::from_fn(|_| None),
            len: 0,
        };
        for desc in descs {
            let k = key(desc);
            let mut found = false;
            for slot in out.list[..out.len].iter_mut() {
                let dom = slot.as_mut().unwrap();
                // Reuse the domain whose members carry the same key.
                if dom
                    .cpu_mask
                    .iter()
                    .any(|cpu| key(&descs[cpu as usize]) == k)
                {
                    dom.cpu_mask = dom.cpu_mask.set(desc.cpu_id);
                    found = true;
                    break;
                }
            }
            if !found {
                out.push(BalanceDomain::new(level, CpuMask::single(desc.cpu_id)));
            }
        }
        out
    }

    fn assert_nesting(&self) {
        // Every domain at one level must sit inside some domain one level up.
        let pairs = [
            (DomainLevel::Smt, DomainLevel::Core),
            (DomainLevel::Core, DomainLevel::Package),
            (DomainLevel::Package, DomainLevel::Numa),
        ];
        for (inner, outer) in pairs {
            for dom in self.domains(inner) {
                let nested = self
                    .domains(outer)
                    .any(|o| dom.cpu_mask.and(o.cpu_mask) == dom.cpu_mask);
                assert!(nested, "balance domains do not nest");
            }
        }
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    #[inline]
    pub fn nr_cpus(&self) -> u32 {
        self.nr_cpus
    }

    #[inline]
    pub fn nr_nodes(&self) -> u32 {
        self.nr_nodes
    }

    /// CPU record by id. Panics on an id outside the table; the scheduler
    /// never manufactures ids.
    #[inline]
    pub fn cpu(&self, cpu_id: u32) -> &CpuInfo {
        self.cpus[cpu_id as usize]
            .as_ref()
            .expect("CPU id outside topology")
    }

    #[inline]
    pub fn node(&self, node_id: u32) -> &NumaNode {
        self.nodes[node_id as usize]
            .as_ref()
            .expect("NUMA node id outside topology")
    }

    #[inline]
    pub fn node_of_cpu(&self, cpu_id: u32) -> &NumaNode {
        self.node(self.cpu(cpu_id).desc.numa_node_id)
    }

    pub fn performance_mask(&self) -> CpuMask {
        self.performance_mask
    }

    pub fn efficiency_mask(&self) -> CpuMask {
        self.efficiency_mask
    }

    /// All CPUs currently online and not isolated.
    pub fn schedulable_mask(&self) -> CpuMask {
        let mut mask = CpuMask::NONE;
        for cpu in 0..self.nr_cpus {
            let info = self.cpu(cpu);
            if info.is_online() && !info.is_isolated() {
                mask = mask.set(cpu);
            }
        }
        mask
    }

    pub fn online_mask(&self) -> CpuMask {
        let mut mask = CpuMask::NONE;
        for cpu in 0..self.nr_cpus {
            if self.cpu(cpu).is_online() {
                mask = mask.set(cpu);
            }
        }
        mask
    }

    /// Do two CPUs share a cache at `level` (1, 2 or 3)?
    pub fn share_cache(&self, a: u32, b: u32, level: u32) -> bool {
        let da = &self.cpu(a).desc;
        let db = &self.cpu(b).desc;
        match level {
            1 => da.l1_group == db.l1_group,
            2 => da.l2_group == db.l2_group,
            3 => da.l3_group == db.l3_group,
            _ => false,
        }
    }

    /// CPUs in the same domain as `cpu_id` at `level`.
    pub fn cpus_in_domain(&self, level: DomainLevel, cpu_id: u32) -> CpuMask {
        for dom in self.domains(level) {
            if dom.cpu_mask.is_set(cpu_id) {
                return dom.cpu_mask;
            }
        }
        CpuMask::NONE
    }

    /// Iterate the balance domains at one level.
    pub fn domains(&self, level: DomainLevel) -> impl Iterator<Item = &BalanceDomain> {
        let dl = &self.domains[level.index()];
        dl.list[..dl.len].iter().filter_map(|d| d.as_ref())
    }

    // ------------------------------------------------------------------
    // Dynamic state
    // ------------------------------------------------------------------

    pub fn set_online(&self, cpu_id: u32, online: bool) {
        self.cpu(cpu_id).online.store(online, Ordering::Release);
    }

    pub fn set_isolated(&self, cpu_id: u32, isolated: bool) {
        self.cpu(cpu_id).isolated.store(isolated, Ordering::Release);
    }

    pub fn set_temperature(&self, cpu_id: u32, celsius: u32) {
        self.cpu(cpu_id)
            .temperature_c
            .store(celsius, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // CpuMask
    // ========================================================================

    #[test]
    fn mask_set_clear_count() {
        let mask = CpuMask::NONE.set(0).set(5).set(63);
        assert!(mask.is_set(0));
        assert!(mask.is_set(5));
        assert!(mask.is_set(63));
        assert!(!mask.is_set(4));
        assert_eq!(mask.count(), 3);

        let mask = mask.clear(5);
        assert!(!mask.is_set(5));
        assert_eq!(mask.count(), 2);
    }

    #[test]
    fn mask_first_n() {
        assert_eq!(CpuMask::first_n(0), CpuMask::NONE);
        assert_eq!(CpuMask::first_n(4).0, 0b1111);
        assert_eq!(CpuMask::first_n(64), CpuMask::ALL);
    }

    #[test]
    fn mask_iter_ascending() {
        let mask = CpuMask::NONE.set(7).set(1).set(33);
        let collected: Vec<u32> = mask.iter().collect();
        assert_eq!(collected, vec![1, 7, 33]);
    }

    #[test]
    fn mask_first_set() {
        assert_eq!(CpuMask::NONE.first_set(), None);
        assert_eq!(CpuMask::NONE.set(9).set(40).first_set(), Some(9));
    }

    // ========================================================================
    // Symmetric topology
    // ========================================================================

    #[test]
    fn symmetric_eight_cpus_two_nodes() {
        let topo = CpuTopology::symmetric(8, 4);
        assert_eq!(topo.nr_cpus(), 8);
        assert_eq!(topo.nr_nodes(), 2);
        assert_eq!(topo.node(0).cpu_mask.0, 0b0000_1111);
        assert_eq!(topo.node(1).cpu_mask.0, 0b1111_0000);
        assert_eq!(topo.performance_mask().0, 0b0000_1111);
        assert_eq!(topo.efficiency_mask().0, 0b1111_0000);
    }

    #[test]
    fn symmetric_cache_sharing() {
        let topo = CpuTopology::symmetric(8, 4);
        // SMT siblings share everything.
        assert!(topo.share_cache(0, 1, 1) == false);
        assert!(topo.share_cache(0, 1, 2));
        assert!(topo.share_cache(0, 1, 3));
        // Cross-node CPUs share nothing.
        assert!(!topo.share_cache(0, 4, 2));
        assert!(!topo.share_cache(0, 4, 3));
    }

    #[test]
    fn domain_counts_and_nesting() {
        let topo = CpuTopology::symmetric(8, 4);
        assert_eq!(topo.domains(DomainLevel::Smt).count(), 4);
        assert_eq!(topo.domains(DomainLevel::Core).count(), 4);
        assert_eq!(topo.domains(DomainLevel::Package).count(), 2);
        assert_eq!(topo.domains(DomainLevel::Numa).count(), 2);

        let smt0 = topo.cpus_in_domain(DomainLevel::Smt, 0);
        let numa0 = topo.cpus_in_domain(DomainLevel::Numa, 0);
        assert_eq!(smt0.and(numa0), smt0);
    }

    #[test]
    fn domain_defaults() {
        let topo = CpuTopology::symmetric(4, 4);
        let numa = topo.domains(DomainLevel::Numa).next().unwrap();
        assert_eq!(numa.imbalance_threshold, 4);
        assert_eq!(numa.min_balance_interval_ns, 100_000_000);
        let smt = topo.domains(DomainLevel::Smt).next().unwrap();
        assert_eq!(smt.imbalance_threshold, 1);
        assert_eq!(smt.min_balance_interval_ns, 1_000_000);
    }

    #[test]
    fn schedulable_mask_tracks_dynamic_state() {
        let topo = CpuTopology::symmetric(4, 4);
        assert_eq!(topo.schedulable_mask().0, 0b1111);
        topo.set_online(2, false);
        topo.set_isolated(3, true);
        assert_eq!(topo.schedulable_mask().0, 0b0011);
        assert_eq!(topo.online_mask().0, 0b1011);
        topo.set_online(2, true);
        topo.set_isolated(3, false);
        assert_eq!(topo.schedulable_mask().0, 0b1111);
    }

    #[test]
    fn temperature_updates() {
        let topo = CpuTopology::symmetric(2, 2);
        assert_eq!(topo.cpu(0).temperature(), 40);
        topo.set_temperature(0, 85);
        assert_eq!(topo.cpu(0).temperature(), 85);
    }
}
