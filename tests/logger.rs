//! Kernel log front-end: sink registration and runtime level filtering.
//!
//! These tests share the process-wide sink and level filter, so they run
//! serialized.

use std::sync::Mutex;

use nexa_sched::logger::{self, LogLevel};
use serial_test::serial;

static CAPTURED: Mutex<Vec<(LogLevel, String)>> = Mutex::new(Vec::new());

fn capture(level: LogLevel, args: &core::fmt::Arguments) {
    CAPTURED.lock().unwrap().push((level, args.to_string()));
}

fn reset() {
    CAPTURED.lock().unwrap().clear();
    logger::set_level(LogLevel::INFO);
    logger::clear_sink();
}

#[test]
#[serial]
fn records_reach_the_registered_sink() {
    reset();
    logger::set_sink(capture);

    nexa_sched::kinfo!("scheduler online on CPU {}", 3);
    nexa_sched::kwarn!("affinity mask {:#x} rejected", 0u64);

    logger::clear_sink();
    let records = CAPTURED.lock().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].0, LogLevel::INFO);
    assert_eq!(records[0].1, "scheduler online on CPU 3");
    assert_eq!(records[1].0, LogLevel::WARN);
    assert_eq!(records[1].1, "affinity mask 0x0 rejected");
    drop(records);
    reset();
}

#[test]
#[serial]
fn level_filter_drops_quiet_records() {
    reset();
    logger::set_level(LogLevel::WARN);
    logger::set_sink(capture);

    nexa_sched::kdebug!("not seen");
    nexa_sched::kinfo!("not seen either");
    nexa_sched::kerror!("seen");

    logger::clear_sink();
    let records = CAPTURED.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].0, LogLevel::ERROR);
    drop(records);
    reset();
}

#[test]
#[serial]
fn without_a_sink_nothing_is_recorded() {
    reset();
    nexa_sched::kinfo!("dropped on the floor");
    assert!(CAPTURED.lock().unwrap().is_empty());
}
