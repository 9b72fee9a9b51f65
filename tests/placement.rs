//! Placement policies, affinity enforcement, hotplug and isolation.

mod common;

use common::*;
use nexa_sched::{CpuMask, PlacementPolicy, SchedClass, SchedError};

// ============================================================================
// NUMA-local placement
// ============================================================================

#[test]
fn wake_lands_on_the_least_loaded_cpu_of_the_home_node() {
    let p = SimPlatform::new();
    let s = sched(8, 4);

    // Two pinned hogs keep CPU 0 busy; the subject starts there too.
    spawn_pinned(&s, &p, 10, SchedClass::Normal, 0);
    spawn_pinned(&s, &p, 11, SchedClass::Normal, 0);
    s.attach(&p, 1, SchedClass::Normal, CpuMask::single(0)).unwrap();
    s.wake(&p, 1).unwrap();
    run_for(&s, &p, 8, 20_000_000, 1_000_000);

    // Widen the mask, block and wake: the entity stays NUMA-local (node 0,
    // CPUs 0-3) but leaves the loaded CPU.
    s.set_cpu_affinity(&p, 1, CpuMask::ALL).unwrap();
    s.block(&p, 1).unwrap();
    run_for(&s, &p, 8, 2_000_000, 1_000_000);
    s.wake(&p, 1).unwrap();

    let info = s.task_info(1).unwrap();
    assert!(info.last_cpu < 4, "left its NUMA node");
    assert_ne!(info.last_cpu, 0, "stayed on the loaded CPU");
    assert!(s.stats_snapshot().numa_local_placements >= 2);
    s.check_consistency();
}

// ============================================================================
// The other placement policies
// ============================================================================

#[test]
fn first_fit_takes_the_lowest_allowed_cpu() {
    let p = SimPlatform::new();
    let s = sched(8, 4);
    s.set_placement_policy(PlacementPolicy::FirstFit);

    s.attach(&p, 1, SchedClass::Normal, CpuMask::NONE.set(3).set(6))
        .unwrap();
    s.wake(&p, 1).unwrap();
    assert_eq!(s.task_info(1).unwrap().last_cpu, 3);
}

#[test]
fn cache_aware_prefers_the_shared_complex() {
    let p = SimPlatform::new();
    let s = sched(8, 4);

    // Land the task on CPU 2 first.
    s.attach(&p, 1, SchedClass::Normal, CpuMask::single(2)).unwrap();
    s.wake(&p, 1).unwrap();
    run_for(&s, &p, 8, 20_000_000, 1_000_000);

    s.set_placement_policy(PlacementPolicy::CacheAware);
    s.block(&p, 1).unwrap();
    run_for(&s, &p, 8, 2_000_000, 1_000_000);
    // CPU 3 shares L2+L3 with CPU 2; CPU 4 shares nothing.
    s.set_cpu_affinity(&p, 1, CpuMask::NONE.set(3).set(4)).unwrap();
    s.wake(&p, 1).unwrap();

    assert_eq!(s.task_info(1).unwrap().last_cpu, 3);
    assert!(s.stats_snapshot().cache_hits >= 1);
}

#[test]
fn thermal_aware_picks_the_coolest_cpu() {
    let p = SimPlatform::new();
    let s = sched(4, 4);
    s.set_placement_policy(PlacementPolicy::ThermalAware);
    s.set_cpu_temperature(0, 90);
    s.set_cpu_temperature(1, 55);
    s.set_cpu_temperature(2, 45);
    s.set_cpu_temperature(3, 80);

    spawn(&s, &p, 1, SchedClass::Normal);
    assert_eq!(s.task_info(1).unwrap().last_cpu, 2);
    assert_eq!(s.stats_snapshot().thermal_events, 0);
}

#[test]
fn thermal_events_count_when_everything_is_hot() {
    let p = SimPlatform::new();
    let s = sched(2, 2);
    s.set_placement_policy(PlacementPolicy::ThermalAware);
    s.set_cpu_temperature(0, 88);
    s.set_cpu_temperature(1, 92);

    spawn(&s, &p, 1, SchedClass::Normal);
    assert_eq!(s.task_info(1).unwrap().last_cpu, 0);
    assert!(s.stats_snapshot().thermal_events >= 1);
}

#[test]
fn power_aware_prefers_efficiency_cores() {
    let p = SimPlatform::new();
    let s = sched(8, 4);
    s.set_placement_policy(PlacementPolicy::PowerAware);
    spawn(&s, &p, 1, SchedClass::Normal);
    // Efficiency cores are CPUs 4-7 on the synthetic topology.
    assert!(s.task_info(1).unwrap().last_cpu >= 4);
}

#[test]
fn best_fit_matches_class_to_core_kind() {
    let p = SimPlatform::new();
    let s = sched(8, 4);
    s.set_placement_policy(PlacementPolicy::BestFit);

    spawn(&s, &p, 1, SchedClass::Background);
    assert!(
        s.task_info(1).unwrap().last_cpu >= 4,
        "background work belongs on efficiency cores"
    );

    spawn(&s, &p, 2, SchedClass::Realtime);
    assert!(
        s.task_info(2).unwrap().last_cpu < 4,
        "RT work belongs on performance cores"
    );
}

// ============================================================================
// Affinity enforcement
// ============================================================================

#[test]
fn empty_affinity_is_rejected_not_worked_around() {
    let p = SimPlatform::new();
    let s = sched(2, 2);
    assert_eq!(
        s.attach(&p, 1, SchedClass::Normal, CpuMask::NONE),
        Err(SchedError::AffinityEmpty)
    );

    spawn(&s, &p, 1, SchedClass::Normal);
    assert_eq!(
        s.set_cpu_affinity(&p, 1, CpuMask::NONE),
        Err(SchedError::AffinityEmpty)
    );
    // The old mask survives a rejected update.
    assert_eq!(s.get_cpu_affinity(1).unwrap(), CpuMask::ALL);
}

#[test]
fn affinity_to_an_offline_cpu_is_rejected() {
    let p = SimPlatform::new();
    let s = sched(2, 2);
    s.set_cpu_online(1, false);
    assert_eq!(
        s.attach(&p, 1, SchedClass::Normal, CpuMask::single(1)),
        Err(SchedError::AffinityEmpty)
    );
    s.set_cpu_online(1, true);
    s.attach(&p, 1, SchedClass::Normal, CpuMask::single(1)).unwrap();
}

#[test]
fn narrowing_affinity_moves_a_queued_task() {
    let p = SimPlatform::new();
    let s = sched(2, 2);
    spawn_pinned(&s, &p, 1, SchedClass::Normal, 0);
    spawn_pinned(&s, &p, 2, SchedClass::Normal, 0);
    run_for(&s, &p, 2, 20_000_000, 1_000_000);

    // Whichever task is queued right now gets pinned to CPU 1.
    let queued = if s.current_task(0) == Some(1) { 2 } else { 1 };
    s.set_cpu_affinity(&p, queued, CpuMask::single(1)).unwrap();
    let info = s.task_info(queued).unwrap();
    assert_eq!(info.last_cpu, 1);
    assert!(info.migration_count >= 1);
    run_for(&s, &p, 2, 5_000_000, 1_000_000);
    assert_eq!(s.current_task(1), Some(queued));
    s.check_consistency();
}

#[test]
fn narrowing_affinity_rehomes_a_running_task() {
    let p = SimPlatform::new();
    let s = sched(2, 2);
    spawn_pinned(&s, &p, 1, SchedClass::Normal, 0);
    run_for(&s, &p, 2, 20_000_000, 1_000_000);
    assert_eq!(s.current_task(0), Some(1));

    s.set_cpu_affinity(&p, 1, CpuMask::single(1)).unwrap();
    run_for(&s, &p, 2, 5_000_000, 1_000_000);
    let info = s.task_info(1).unwrap();
    assert_eq!(info.last_cpu, 1);
    assert_eq!(s.current_task(1), Some(1));
    s.check_consistency();
}

#[test]
fn isolated_cpus_are_skipped_by_placement() {
    let p = SimPlatform::new();
    let s = sched(2, 2);
    s.set_cpu_isolated(0, true);
    spawn(&s, &p, 1, SchedClass::Normal);
    assert_eq!(s.task_info(1).unwrap().last_cpu, 1);
}
