//! Domain load balancing and migration discipline.

mod common;

use common::*;
use nexa_sched::{CpuMask, PlacementPolicy, SchedClass};

// ============================================================================
// Spreading load across a package
// ============================================================================

#[test]
fn eight_tasks_on_one_cpu_spread_across_the_package() {
    let p = SimPlatform::new();
    let s = sched_flat_package(4);
    s.set_placement_policy(PlacementPolicy::BestFit);

    // All eight tasks start on CPU 0, then the pin is lifted.
    for pid in 1..=8 {
        spawn_pinned(&s, &p, pid, SchedClass::Normal, 0);
    }
    for pid in 1..=8 {
        s.set_cpu_affinity(&p, pid, CpuMask::ALL).unwrap();
    }

    run_for(&s, &p, 4, 100_000_000, 1_000_000);

    let stats = s.stats_snapshot();
    let loads: Vec<u32> = (0..4usize).map(|c| stats.per_cpu[c].runnable).collect();
    let max = *loads.iter().max().unwrap();
    let min = *loads.iter().min().unwrap();
    assert!(
        max - min <= 2,
        "package still imbalanced after 100ms: {loads:?}"
    );
    assert!(stats.migrations >= 3, "too few migrations: {}", stats.migrations);
    s.check_consistency();
}

#[test]
fn single_cpu_systems_never_balance() {
    let p = SimPlatform::new();
    let s = sched(1, 1);
    for pid in 1..=4 {
        spawn(&s, &p, pid, SchedClass::Normal);
    }
    run_for(&s, &p, 1, 100_000_000, 1_000_000);
    assert_eq!(s.stats_snapshot().migrations, 0);
}

// ============================================================================
// Migration constraints
// ============================================================================

#[test]
fn pinned_tasks_are_never_pulled_off_their_cpu() {
    let p = SimPlatform::new();
    let s = sched_flat_package(4);

    // Heavy pinned load on CPU 0 plus one free task.
    for pid in 1..=6 {
        spawn_pinned(&s, &p, pid, SchedClass::Normal, 0);
    }
    spawn(&s, &p, 7, SchedClass::Normal);

    run_for(&s, &p, 4, 100_000_000, 1_000_000);

    for pid in 1..=6 {
        let info = s.task_info(pid).unwrap();
        assert_eq!(info.last_cpu, 0, "pinned task {pid} left CPU 0");
        assert_eq!(info.migration_count, 0);
    }
    s.check_consistency();
}

#[test]
fn migration_rate_respects_the_cooldown() {
    let p = SimPlatform::new();
    let s = sched_flat_package(4);
    for pid in 1..=8 {
        spawn_pinned(&s, &p, pid, SchedClass::Normal, 0);
    }
    for pid in 1..=8 {
        s.set_cpu_affinity(&p, pid, CpuMask::ALL).unwrap();
    }

    let span_ms = 100u64;
    run_for(&s, &p, 4, span_ms * 1_000_000, 1_000_000);

    // No entity may move more often than once per cooldown interval.
    let ceiling = (span_ms / 10 + 1) as u32;
    for pid in 1..=8 {
        let count = s.task_info(pid).unwrap().migration_count;
        assert!(count <= ceiling, "pid {pid} migrated {count} times");
    }
}

#[test]
fn balancing_skips_offline_cpus() {
    let p = SimPlatform::new();
    let s = sched_flat_package(4);
    s.set_cpu_online(3, false);

    for pid in 1..=8 {
        spawn_pinned(&s, &p, pid, SchedClass::Normal, 0);
    }
    for pid in 1..=8 {
        s.set_cpu_affinity(&p, pid, CpuMask::ALL).unwrap();
    }
    run_for(&s, &p, 4, 100_000_000, 1_000_000);

    for pid in 1..=8 {
        assert_ne!(
            s.task_info(pid).unwrap().last_cpu,
            3,
            "task placed on the offline CPU"
        );
    }
    assert_eq!(s.stats_snapshot().per_cpu[3].runnable, 0);
    s.check_consistency();
}

// ============================================================================
// Balancer bookkeeping
// ============================================================================

#[test]
fn migrations_show_up_in_per_cpu_counters() {
    let p = SimPlatform::new();
    let s = sched_flat_package(2);
    for pid in 1..=6 {
        spawn_pinned(&s, &p, pid, SchedClass::Normal, 0);
    }
    for pid in 1..=6 {
        s.set_cpu_affinity(&p, pid, CpuMask::ALL).unwrap();
    }
    run_for(&s, &p, 2, 50_000_000, 1_000_000);

    let stats = s.stats_snapshot();
    assert!(stats.migrations >= 1);
    assert!(stats.per_cpu[0].migrations_out >= 1);
    assert!(stats.per_cpu[1].migrations_in >= 1);

    let total_count: u32 = (1..=6)
        .map(|pid| s.task_info(pid).unwrap().migration_count)
        .sum();
    assert_eq!(total_count as u64, stats.migrations);
}
