//! Spawns worker processes and collects their module reports.
//!
//! Workers never talk to each other or to the supervisor beyond the JSON
//! report lines on their stdout; each one recomputes the same port table
//! and schedule on its own.

use std::process::{ExitCode, Stdio};
use std::time::SystemTime;

use anyhow::{Context, Result};
use systest_common::{
    HarnessConfig, ModuleReport, Parallelism, RunSummary, ScriptEngine, TestCaseEngine,
    WorkspaceManager,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::RunOptions;
use crate::plan::RunPlan;
use crate::signals::{Interruptions, forward_terminate};

/// Reports and exit status of one worker process.
struct WorkerResult {
    index: usize,
    reports: Vec<ModuleReport>,
    success: bool,
}

pub async fn run(
    config: HarnessConfig,
    options: RunOptions,
    requested: usize,
    verbose: bool,
) -> Result<ExitCode> {
    let plan = RunPlan::build(&config, &options.filters)?;
    if plan.scheduled.is_empty() {
        warn!("no test modules selected");
        return Ok(ExitCode::SUCCESS);
    }

    let engine = ScriptEngine;
    let parallelism =
        Parallelism::decide(requested, engine.groups_by_module(), plan.scheduled.len());
    let workers = parallelism.workers();
    info!(
        modules = plan.scheduled.len(),
        total = plan.all.len(),
        workers,
        "starting run"
    );

    WorkspaceManager::new(&config.root)
        .sweep_stale(config.stale_workspace_age, SystemTime::now());

    let mut signals = Interruptions::listen()?;
    let exe = std::env::current_exe().context("failed to locate systest executable")?;
    let mut set = JoinSet::new();
    let mut pids = Vec::with_capacity(workers);
    for index in 0..workers {
        let mut cmd = Command::new(&exe);
        if verbose {
            cmd.arg("--verbose");
        }
        cmd.arg("worker")
            .arg("--worker-index")
            .arg(index.to_string())
            .arg("--worker-count")
            .arg(workers.to_string())
            .arg("--skip-sweep");
        if config.keep_artifacts {
            cmd.arg("--noclean");
        }
        cmd.arg("--shell").arg(&config.shell);
        cmd.arg("--perl").arg(&config.perl);
        if !options.filters.is_empty() {
            cmd.arg("--").args(&options.filters);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn worker {index}"))?;
        debug!(worker = index, pid = child.id(), "worker spawned");
        if let Some(pid) = child.id() {
            pids.push((index, pid));
        }
        set.spawn(collect_reports(index, child));
    }

    let mut results = Vec::with_capacity(workers);
    let mut interrupted = false;
    loop {
        tokio::select! {
            joined = set.join_next() => match joined {
                Some(joined) => results.push(joined.context("worker task failed")??),
                None => break,
            },
            signal = signals.recv(), if !interrupted => {
                warn!(signal, "interrupted, waiting for workers to stop their current modules");
                interrupted = true;
                let running: Vec<u32> = pids
                    .iter()
                    .filter(|(index, _)| !results.iter().any(|r: &WorkerResult| r.index == *index))
                    .map(|(_, pid)| *pid)
                    .collect();
                forward_terminate(&running).await;
            }
        }
    }

    results.sort_by_key(|result| result.index);
    let reports: Vec<&ModuleReport> = results.iter().flat_map(|r| r.reports.iter()).collect();
    let summary: RunSummary = reports.iter().copied().collect();

    for report in &reports {
        println!("{}", report.summary_line());
    }
    println!("{summary}");
    for path in &summary.retained {
        println!("  artifacts kept in {}", path.display());
    }

    let missing = plan.scheduled.len().saturating_sub(reports.len());
    if missing > 0 {
        warn!(missing, "some modules produced no report");
    }
    let workers_ok = results.iter().all(|result| result.success);
    if !workers_ok && summary.is_success() {
        error!("a worker exited with failure without reporting a failed module");
    }

    if summary.is_success() && workers_ok && missing == 0 && !interrupted {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

async fn collect_reports(index: usize, mut child: tokio::process::Child) -> Result<WorkerResult> {
    let mut reports = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .with_context(|| format!("failed to read output of worker {index}"))?
        {
            match ModuleReport::from_json_line(&line) {
                Ok(report) => {
                    info!(
                        worker = index,
                        module = %report.module,
                        verdict = %report.verdict,
                        "module finished"
                    );
                    reports.push(report);
                }
                Err(_) => debug!(worker = index, "{line}"),
            }
        }
    }

    let status = child
        .wait()
        .await
        .with_context(|| format!("failed to wait for worker {index}"))?;
    debug!(worker = index, %status, "worker exited");
    Ok(WorkerResult {
        index,
        reports,
        success: status.success(),
    })
}
