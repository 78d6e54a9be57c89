//! Workers plan independently; their views of the run must agree.

#![cfg(unix)]

mod common;

use std::collections::BTreeSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::{TestRoot, init_test_logging};
use systest_common::{
    HarnessConfig, PortAssignment, SchedulePolicy, WorkerSlot, discover_modules, matches_filters,
};

fn populate(root: &TestRoot) {
    for name in ["acl", "dnstap", "rpz", "runtime", "timeouts", "upforwd", "xfer"] {
        root.module(name, "", &[("tests.sh", "exit 0\n")]);
    }
}

#[test]
fn test_independent_workers_compute_identical_tables() {
    init_test_logging();
    let root = TestRoot::new();
    populate(&root);
    let config = HarnessConfig::new(root.path());
    let hour = UNIX_EPOCH + Duration::from_secs(487_000 * 3600);

    let first = discover_modules(root.path()).unwrap();
    // A sibling worker starts later in the same hour, after the first
    // worker already created its workspace and alias.
    let manager = systest_common::WorkspaceManager::new(root.path());
    let mut ws = manager.create(&first[0]).unwrap();
    manager.link_alias(&mut ws, &first[0].alias_name()).unwrap();
    let second = discover_modules(root.path()).unwrap();
    assert_eq!(first, second);

    let a = PortAssignment::allocate(&first, &config.ports, hour).unwrap();
    let later = hour + Duration::from_secs(3599);
    let b = PortAssignment::allocate(&second, &config.ports, later).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_filtered_run_keeps_port_offsets() {
    init_test_logging();
    let root = TestRoot::new();
    populate(&root);
    let config = HarnessConfig::new(root.path());
    let all = discover_modules(root.path()).unwrap();
    let now = SystemTime::now();

    let full = PortAssignment::allocate(&all, &config.ports, now).unwrap();
    let filters = vec!["runtime".to_string()];
    let selected: Vec<_> = all.iter().filter(|m| matches_filters(m, &filters)).cloned().collect();
    assert_eq!(selected.len(), 1);
    // The table is always computed from the full list.
    let again = PortAssignment::allocate(&all, &config.ports, now).unwrap();
    assert_eq!(full.get(&selected[0]), again.get(&selected[0]));
}

#[test]
fn test_schedule_split_covers_every_module_once() {
    init_test_logging();
    let root = TestRoot::new();
    populate(&root);
    let config = HarnessConfig::new(root.path());
    let all = discover_modules(root.path()).unwrap();
    let ordered = SchedulePolicy::new(&config.priority_patterns).unwrap().order(&all);

    assert_eq!(ordered[0].system_test_name(), "rpz");
    assert_eq!(ordered[1].system_test_name(), "timeouts");
    assert_eq!(ordered[2].system_test_name(), "upforwd");

    let mut seen = BTreeSet::new();
    for index in 0..3 {
        for module in WorkerSlot::new(index, 3).unwrap().select(&ordered) {
            assert!(seen.insert(module));
        }
    }
    assert_eq!(seen.len(), all.len());
}
