//! A single worker process: runs its share of the schedule module by module.

use std::io::Write;
use std::process::ExitCode;
use std::time::SystemTime;

use anyhow::{Context, Result};
use systest_common::{
    HarnessConfig, HarnessError, InterruptFlag, LifecycleDriver, ModuleManifest, ModuleReport,
    RunSummary, ScriptEngine, WorkerSlot, WorkspaceManager,
};
use tracing::{error, info, warn};

use crate::plan::RunPlan;
use crate::signals::Interruptions;

pub async fn run(
    config: HarnessConfig,
    filters: &[String],
    worker_index: usize,
    worker_count: usize,
    skip_sweep: bool,
) -> Result<ExitCode> {
    let slot = WorkerSlot::new(worker_index, worker_count)?;
    let plan = RunPlan::build(&config, filters)?;

    // SIGTERM and SIGHUP must not kill the worker while servers are running.
    let mut signals = Interruptions::listen()?;
    let interrupt = InterruptFlag::new();
    let flag = interrupt.clone();
    tokio::spawn(async move {
        let signal = signals.recv().await;
        warn!(signal, "interrupted, stopping after the current module");
        flag.trigger();
    });

    let reports = tokio::task::spawn_blocking(move || {
        if !skip_sweep {
            WorkspaceManager::new(&config.root)
                .sweep_stale(config.stale_workspace_age, SystemTime::now());
        }
        run_modules(&config, &plan, slot, interrupt)
    })
    .await
    .context("worker thread failed")??;

    let summary: RunSummary = reports.iter().collect();
    info!(worker = worker_index, "{summary}");
    if summary.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn run_modules(
    config: &HarnessConfig,
    plan: &RunPlan,
    slot: WorkerSlot,
    interrupt: InterruptFlag,
) -> Result<Vec<ModuleReport>> {
    let engine = ScriptEngine;
    let driver = LifecycleDriver::new(config, &engine, interrupt);
    let modules = slot.select(&plan.scheduled);
    info!(
        worker = slot.index(),
        workers = slot.count(),
        modules = modules.len(),
        "worker started"
    );

    let mut reports = Vec::with_capacity(modules.len());
    let stdout = std::io::stdout();
    for module in &modules {
        if driver.interrupt().is_set() {
            warn!(module = %module, "run interrupted, not starting module");
            break;
        }

        let report = match (
            ModuleManifest::load(&config.root, module, &config.scripts.tests),
            plan.ports.get(module),
        ) {
            (Ok(manifest), Some(range)) => driver.run_module(&manifest, range),
            (Err(err), _) => {
                error!(module = %module, code = err.code(), "{err}");
                ModuleReport::not_run(module, &err)
            }
            (Ok(_), None) => {
                let err = HarnessError::Config(format!("no port range for {module}"));
                error!(module = %module, "{err}");
                ModuleReport::not_run(module, &err)
            }
        };

        let line = report.to_json_line().context("failed to serialize module report")?;
        let mut out = stdout.lock();
        writeln!(out, "{line}").context("failed to write module report")?;
        out.flush().context("failed to flush module report")?;
        reports.push(report);
    }
    Ok(reports)
}
