//! Discovery, port table and schedule, computed identically in every process.

use std::time::SystemTime;

use anyhow::{Context, Result};
use systest_common::{
    HarnessConfig, ModuleId, PortAssignment, SchedulePolicy, WorkerSlot, discover_modules,
    matches_filters,
};

/// What one process knows about the run before any module starts.
pub struct RunPlan {
    /// Full module list; the port table depends on all of it.
    pub all: Vec<ModuleId>,
    pub ports: PortAssignment,
    /// Selected modules, priority first.
    pub scheduled: Vec<ModuleId>,
}

impl RunPlan {
    pub fn build(config: &HarnessConfig, filters: &[String]) -> Result<Self> {
        let all = discover_modules(&config.root).with_context(|| {
            format!("failed to discover modules under {}", config.root.display())
        })?;
        let ports = PortAssignment::allocate(&all, &config.ports, SystemTime::now())?;
        let policy = SchedulePolicy::new(&config.priority_patterns)?;
        let selected: Vec<ModuleId> = all
            .iter()
            .filter(|module| matches_filters(module, filters))
            .cloned()
            .collect();
        let scheduled = policy.order(&selected);
        Ok(Self {
            all,
            ports,
            scheduled,
        })
    }
}

pub fn print_ports(config: &HarnessConfig) -> Result<()> {
    let plan = RunPlan::build(config, &[])?;
    println!(
        "{} modules, offset {} (ports {}..={}, {} per module)",
        plan.all.len(),
        plan.ports.offset(),
        config.ports.min,
        config.ports.max,
        config.ports.per_module
    );
    for (module, range) in plan.ports.iter() {
        println!("{:>5} {:>5}  {module}", range.base, range.last());
    }
    Ok(())
}

pub fn print_schedule(
    config: &HarnessConfig,
    filters: &[String],
    workers: Option<usize>,
) -> Result<()> {
    let plan = RunPlan::build(config, filters)?;
    let policy = SchedulePolicy::new(&config.priority_patterns)?;
    let count = workers.unwrap_or(1).max(1);
    for index in 0..count {
        let slot = WorkerSlot::new(index, count)?;
        for module in slot.select(&plan.scheduled) {
            let marker = if policy.is_priority(&module) { "*" } else { " " };
            if workers.is_some() {
                println!("[{index}] {marker} {module}");
            } else {
                println!("{marker} {module}");
            }
        }
    }
    Ok(())
}
