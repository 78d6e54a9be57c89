//! Module ordering and worker partitioning.
//!
//! Slow modules are started first so parallel runs finish sooner. Whole
//! modules are the unit handed to a worker: every test case of a module
//! shares its workspace, its port range and its running servers, so they
//! must run on one worker as a contiguous block.

use regex::Regex;
use tracing::{debug, info};

use crate::errors::{HarnessError, HarnessResult};
use crate::module::ModuleId;

/// Module patterns known to be slow; scheduled before everything else.
pub const DEFAULT_PRIORITY_PATTERNS: &[&str] = &[
    "rpz/",
    "rpzrecurse/",
    "serve-stale/",
    "timeouts/",
    "upforwd/",
];

/// Orders modules priority-first.
#[derive(Debug, Clone)]
pub struct SchedulePolicy {
    priority: Option<Regex>,
}

impl SchedulePolicy {
    /// Patterns are regular expressions searched anywhere in the module id.
    pub fn new(patterns: &[String]) -> HarnessResult<Self> {
        let patterns: Vec<&str> = patterns
            .iter()
            .map(String::as_str)
            .filter(|p| !p.is_empty())
            .collect();
        if patterns.is_empty() {
            return Ok(Self { priority: None });
        }
        let priority = Regex::new(&patterns.join("|")).map_err(|err| {
            HarnessError::Config(format!("invalid priority pattern: {err}"))
        })?;
        Ok(Self {
            priority: Some(priority),
        })
    }

    pub fn is_priority(&self, module: &ModuleId) -> bool {
        self.priority
            .as_ref()
            .is_some_and(|re| re.is_match(module.as_str()))
    }

    /// Priority modules first, each group keeping discovery order.
    pub fn order(&self, modules: &[ModuleId]) -> Vec<ModuleId> {
        let (mut ordered, other): (Vec<ModuleId>, Vec<ModuleId>) = modules
            .iter()
            .cloned()
            .partition(|module| self.is_priority(module));
        debug!(priority = ordered.len(), other = other.len(), "scheduled modules");
        ordered.extend(other);
        ordered
    }
}

/// Whether a module is selected by the user's filters (substring match).
///
/// No filters selects everything.
pub fn matches_filters(module: &ModuleId, filters: &[String]) -> bool {
    filters.is_empty() || filters.iter().any(|filter| module.as_str().contains(filter.as_str()))
}

/// The share of the schedule owned by one worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSlot {
    index: usize,
    count: usize,
}

impl WorkerSlot {
    pub fn new(index: usize, count: usize) -> HarnessResult<Self> {
        if count == 0 || index >= count {
            return Err(HarnessError::Config(format!(
                "worker index {index} out of range for {count} workers"
            )));
        }
        Ok(Self { index, count })
    }

    pub fn single() -> Self {
        Self { index: 0, count: 1 }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Modules at the scheduled positions this worker owns, in order.
    pub fn select(&self, ordered: &[ModuleId]) -> Vec<ModuleId> {
        ordered
            .iter()
            .enumerate()
            .filter(|(position, _)| position % self.count == self.index)
            .map(|(_, module)| module.clone())
            .collect()
    }
}

/// How many workers a run may use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parallelism {
    Serial,
    Parallel(usize),
}

impl Parallelism {
    /// Parallel execution requires an engine that keeps each module's test
    /// cases together; otherwise the run falls back to a single worker.
    pub fn decide(requested: usize, groups_by_module: bool, modules: usize) -> Self {
        let workers = requested.min(modules);
        if workers <= 1 {
            return Self::Serial;
        }
        if !groups_by_module {
            info!("test engine cannot keep module test cases together, disabling parallelism");
            return Self::Serial;
        }
        Self::Parallel(workers)
    }

    pub fn workers(&self) -> usize {
        match self {
            Self::Serial => 1,
            Self::Parallel(workers) => *workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn ids(names: &[&str]) -> Vec<ModuleId> {
        names.iter().map(|n| ModuleId::new(*n)).collect()
    }

    fn default_policy() -> SchedulePolicy {
        let patterns: Vec<String> = DEFAULT_PRIORITY_PATTERNS
            .iter()
            .map(ToString::to_string)
            .collect();
        SchedulePolicy::new(&patterns).unwrap()
    }

    #[test]
    fn test_priority_modules_first_in_discovery_order() {
        let modules = ids(&[
            "acl/tests_acl.toml",
            "rpz/tests_rpz.toml",
            "runtime/tests_sh_runtime.toml",
            "timeouts/tests_timeouts.toml",
        ]);
        let ordered = default_policy().order(&modules);
        assert_eq!(
            ordered,
            ids(&[
                "rpz/tests_rpz.toml",
                "timeouts/tests_timeouts.toml",
                "acl/tests_acl.toml",
                "runtime/tests_sh_runtime.toml",
            ])
        );
    }

    #[test]
    fn test_pattern_requires_directory_separator() {
        let policy = default_policy();
        assert!(!policy.is_priority(&ModuleId::new("rpzextra/tests_x.toml")));
        assert!(policy.is_priority(&ModuleId::new("rpzrecurse/tests_x.toml")));
    }

    #[test]
    fn test_empty_patterns_keep_order() {
        let policy = SchedulePolicy::new(&[]).unwrap();
        let modules = ids(&["b/tests_b.toml", "a/tests_a.toml"]);
        assert_eq!(policy.order(&modules), modules);
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let err = SchedulePolicy::new(&["(".to_string()]).unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
    }

    #[test]
    fn test_worker_slots_partition_schedule() {
        let modules: Vec<ModuleId> = (0..11)
            .map(|i| ModuleId::new(format!("m{i:02}/tests_m.toml")))
            .collect();
        let mut seen = BTreeSet::new();
        for index in 0..3 {
            for module in WorkerSlot::new(index, 3).unwrap().select(&modules) {
                assert!(seen.insert(module), "module assigned twice");
            }
        }
        assert_eq!(seen.len(), modules.len());
    }

    #[test]
    fn test_worker_slot_bounds() {
        assert!(WorkerSlot::new(3, 3).is_err());
        assert!(WorkerSlot::new(0, 0).is_err());
        assert_eq!(WorkerSlot::single().select(&ids(&["a", "b"])).len(), 2);
    }

    #[test]
    fn test_parallelism_falls_back_without_grouping() {
        assert_eq!(Parallelism::decide(4, false, 10), Parallelism::Serial);
        assert_eq!(Parallelism::decide(4, true, 10), Parallelism::Parallel(4));
        assert_eq!(Parallelism::decide(4, true, 2), Parallelism::Parallel(2));
        assert_eq!(Parallelism::decide(1, true, 10).workers(), 1);
        assert_eq!(Parallelism::decide(8, true, 0), Parallelism::Serial);
    }

    #[test]
    fn test_filters_match_substrings() {
        let module = ModuleId::new("runtime/tests_sh_runtime.toml");
        assert!(matches_filters(&module, &[]));
        assert!(matches_filters(&module, &["runtime".to_string()]));
        assert!(!matches_filters(&module, &["dnstap".to_string()]));
    }
}
