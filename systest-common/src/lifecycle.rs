//! Per-module lifecycle driver.
//!
//! ```text
//! Init -> Checked -> SetUp -> Started -> Running -> Stopped -> Inspected -> Done
//!   \________\________\________\__________\__________\__________\-> Aborted
//! ```
//!
//! Once start has been attempted, stop and the core-dump check run exactly
//! once on every exit path, including engine panics. `setup_complete`
//! becomes true only when the module reaches `Done`, and an incomplete
//! lifecycle always keeps its workspace.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, field, info, info_span, warn};

use crate::artifacts;
use crate::config::HarnessConfig;
use crate::engine::TestCaseEngine;
use crate::errors::{HarnessError, HarnessResult};
use crate::logging::LOG_FILE_FIELD;
use crate::module::{InterpreterKind, ModuleId, ModuleManifest};
use crate::ports::PortRange;
use crate::report::{FailureDetail, ModuleReport};
use crate::results::{Outcome, Phase, ResultAggregator, Verdict};
use crate::script::{InterruptFlag, ScriptContext, ScriptError, ScriptInvocation};
use crate::workspace::{Retention, Workspace, WorkspaceManager};

/// Lifecycle step a script belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    NetworkCheck,
    Prereq,
    Setup,
    Start,
    TestCase,
    Stop,
    CoreDumpCheck,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NetworkCheck => write!(f, "network check"),
            Self::Prereq => write!(f, "prereq"),
            Self::Setup => write!(f, "setup"),
            Self::Start => write!(f, "start"),
            Self::TestCase => write!(f, "test case"),
            Self::Stop => write!(f, "stop"),
            Self::CoreDumpCheck => write!(f, "core dump check"),
        }
    }
}

/// Position of a module in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Init,
    Checked,
    SetUp,
    Started,
    Running,
    Stopped,
    Inspected,
    Done,
    Aborted,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Checked => "checked",
            Self::SetUp => "set_up",
            Self::Started => "started",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Inspected => "inspected",
            Self::Done => "done",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Everything a test-case engine may use while a module is `Running`.
pub struct ModuleContext<'a> {
    pub manifest: &'a ModuleManifest,
    pub ports: PortRange,
    pub workspace: &'a Workspace,
    pub scripts: &'a ScriptContext,
    pub config: &'a HarnessConfig,
    pub interrupt: &'a InterruptFlag,
}

impl ModuleContext<'_> {
    pub fn module(&self) -> &ModuleId {
        &self.manifest.id
    }

    pub fn interpreter(&self, kind: InterpreterKind) -> &Path {
        match kind {
            InterpreterKind::Shell => &self.config.shell,
            InterpreterKind::Perl => &self.config.perl,
        }
    }

    pub fn test_case_ids(&self) -> Vec<String> {
        self.manifest
            .tests
            .iter()
            .map(|test| self.manifest.test_case_id(test))
            .collect()
    }
}

/// Result of stop plus inspection.
#[derive(Debug)]
struct Teardown {
    stop: HarnessResult<()>,
    inspect: HarnessResult<()>,
}

/// Mutable bookkeeping of one module run.
#[derive(Debug)]
struct ModuleRun {
    module: ModuleId,
    state: LifecycleState,
    setup_complete: bool,
    failure: Option<HarnessError>,
    skip_reason: Option<String>,
}

impl ModuleRun {
    fn new(module: ModuleId) -> Self {
        Self {
            module,
            state: LifecycleState::Init,
            setup_complete: false,
            failure: None,
            skip_reason: None,
        }
    }

    fn transition(&mut self, to: LifecycleState) {
        info!(module = %self.module, from = %self.state, state = %to, "lifecycle transition");
        self.state = to;
    }

    fn is_aborted(&self) -> bool {
        self.state == LifecycleState::Aborted
    }

    /// Abort with `err`; the first error is the one reported.
    fn abort(&mut self, err: HarnessError) {
        if let HarnessError::EnvironmentSkip { reason } = &err {
            self.skip_reason.get_or_insert_with(|| reason.clone());
        } else if self.failure.is_none() {
            self.failure = Some(err);
        }
        if !self.is_aborted() {
            self.transition(LifecycleState::Aborted);
        }
    }
}

/// Drives modules through their lifecycle.
pub struct LifecycleDriver<'a> {
    config: &'a HarnessConfig,
    engine: &'a dyn TestCaseEngine,
    workspaces: WorkspaceManager,
    interrupt: InterruptFlag,
}

impl<'a> LifecycleDriver<'a> {
    pub fn new(
        config: &'a HarnessConfig,
        engine: &'a dyn TestCaseEngine,
        interrupt: InterruptFlag,
    ) -> Self {
        Self {
            config,
            engine,
            workspaces: WorkspaceManager::new(&config.root),
            interrupt,
        }
    }

    pub fn interrupt(&self) -> &InterruptFlag {
        &self.interrupt
    }

    /// Run one module from workspace creation to the retention decision.
    ///
    /// Everything logged on the way, script output included, is also written
    /// to the module log in the workspace once that exists.
    pub fn run_module(&self, manifest: &ModuleManifest, ports: PortRange) -> ModuleReport {
        let started = (Utc::now(), Instant::now());
        let module = &manifest.id;
        let span = info_span!("module", module = %module, log_file = field::Empty);
        let _entered = span.enter();
        let mut run = ModuleRun::new(module.clone());
        let mut results = ResultAggregator::new();

        if self.interrupt.is_set() {
            run.abort(HarnessError::Interrupted);
            return self.finish(run, results, None, Vec::new(), started);
        }

        let mut workspace = match self.workspaces.create(module) {
            Ok(workspace) => workspace,
            Err(err) => {
                error!(module = %module, code = err.code(), "failed to create workspace: {err}");
                run.abort(err);
                return self.finish(run, results, None, Vec::new(), started);
            }
        };
        span.record(LOG_FILE_FIELD, field::display(workspace.log_file().display()));
        info!(module = %module, "test started: {module}");
        info!(module = %module, "using port range: {ports}");
        if let Err(err) = self.workspaces.link_alias(&mut workspace, &module.alias_name()) {
            warn!(module = %module, "failed to link workspace alias: {err}");
        }
        info!(module = %module, "switching to tmpdir: {}", workspace.path().display());

        let scripts =
            ScriptContext::new(workspace.path()).with_env(ports.named_ports().env_vars());
        let ctx = ModuleContext {
            manifest,
            ports,
            workspace: &workspace,
            scripts: &scripts,
            config: self.config,
            interrupt: &self.interrupt,
        };
        self.drive(&ctx, &mut run, &mut results);

        let extra = &manifest.extra_artifacts;
        let unexpected = match artifacts::unexpected_artifacts(&workspace, extra) {
            Ok(unexpected) => unexpected,
            Err(err) => {
                warn!(module = %module, "artifact inspection failed: {err}");
                Vec::new()
            }
        };
        self.finish(run, results, Some(workspace), unexpected, started)
    }

    fn drive(&self, ctx: &ModuleContext<'_>, run: &mut ModuleRun, results: &mut ResultAggregator) {
        if let Err(err) = self.check(ctx) {
            self.abort_all(ctx, run, results, err);
            return;
        }
        run.transition(LifecycleState::Checked);

        if let Err(err) = self.setup(ctx) {
            error!(module = %run.module, "Failed to run test setup");
            self.abort_all(ctx, run, results, err);
            return;
        }
        run.transition(LifecycleState::SetUp);

        if self.interrupt.is_set() {
            run.abort(HarnessError::Interrupted);
            return;
        }

        let guard = TeardownGuard::arm(self, ctx);
        let body = match self.start(ctx) {
            Ok(()) => {
                run.transition(LifecycleState::Started);
                run.transition(LifecycleState::Running);
                debug!(module = %run.module, "executing test(s)");
                let body = self.run_engine(ctx, results);
                debug!(module = %run.module, "test(s) finished");
                body
            }
            Err(err) => {
                error!(module = %run.module, "Failed to start servers");
                self.abort_all(ctx, run, results, err);
                Ok(())
            }
        };
        let teardown = guard.run();

        if let Err(err) = body {
            if !err.is_fatal() {
                self.fail_unfinished(ctx, results, &err.to_string());
            }
            run.abort(err);
        }

        match teardown.stop {
            Ok(()) if !run.is_aborted() => run.transition(LifecycleState::Stopped),
            Ok(()) => {}
            Err(err) => {
                self.record_teardown_failure(ctx, results, &err);
                run.abort(err);
            }
        }
        match teardown.inspect {
            Ok(()) if !run.is_aborted() => run.transition(LifecycleState::Inspected),
            Ok(()) => {}
            Err(err) => {
                self.record_teardown_failure(ctx, results, &err);
                run.abort(err);
            }
        }

        if !run.is_aborted() {
            run.setup_complete = true;
            run.transition(LifecycleState::Done);
        }
    }

    /// Network check and optional prereq; failures are environment skips.
    fn check(&self, ctx: &ModuleContext<'_>) -> HarnessResult<()> {
        let port = ctx.ports.named_ports().port.to_string();
        let network = ScriptInvocation::new(&self.config.perl, &self.config.scripts.network_check)
            .args(["-p".to_string(), port]);
        match self.run_step(ctx, Step::NetworkCheck, &network, false) {
            Err(HarnessError::ScriptFailure { exit_code, .. }) => {
                error!("{}: exited with code {exit_code}", self.config.scripts.network_check);
                return Err(HarnessError::EnvironmentSkip {
                    reason: "Network interface aliases not set up.".to_string(),
                });
            }
            other => {
                other?;
            }
        }

        let prereq = ScriptInvocation::new(
            &self.config.shell,
            ctx.workspace.path().join(&self.config.scripts.prereq),
        );
        match self.run_step(ctx, Step::Prereq, &prereq, true) {
            Err(HarnessError::ScriptFailure { .. }) => Err(HarnessError::EnvironmentSkip {
                reason: "Prerequisites missing.".to_string(),
            }),
            other => other.map(|_| ()),
        }
    }

    fn setup(&self, ctx: &ModuleContext<'_>) -> HarnessResult<()> {
        let setup = ScriptInvocation::new(
            &self.config.shell,
            ctx.workspace.path().join(&self.config.scripts.setup),
        );
        self.run_step(ctx, Step::Setup, &setup, true).map(|_| ())
    }

    fn start(&self, ctx: &ModuleContext<'_>) -> HarnessResult<()> {
        let start = ScriptInvocation::new(&self.config.perl, &self.config.scripts.start).args([
            "--port".to_string(),
            ctx.ports.named_ports().port.to_string(),
            ctx.workspace.name(),
        ]);
        self.run_step(ctx, Step::Start, &start, false).map(|_| ())
    }

    /// Stop then inspect; inspection runs even when stop failed.
    fn teardown(&self, ctx: &ModuleContext<'_>) -> Teardown {
        let stop = ScriptInvocation::new(&self.config.perl, &self.config.scripts.stop)
            .args([ctx.workspace.name()]);
        let stop = self.run_step(ctx, Step::Stop, &stop, false).map(|_| ());
        if stop.is_err() {
            error!(module = %ctx.module(), "Failed to stop servers");
        }

        let inspect =
            ScriptInvocation::new(&self.config.shell, &self.config.scripts.core_dump_check)
                .args([ctx.workspace.name()]);
        let inspect = match self.run_step(ctx, Step::CoreDumpCheck, &inspect, false) {
            Err(HarnessError::ScriptFailure { exit_code, .. }) => {
                error!(module = %ctx.module(), "Found core dumps or sanitizer reports");
                Err(HarnessError::IntegrityFinding { exit_code })
            }
            other => other.map(|_| ()),
        };
        Teardown { stop, inspect }
    }

    /// Run one lifecycle script; returns whether it existed.
    fn run_step(
        &self,
        ctx: &ModuleContext<'_>,
        step: Step,
        invocation: &ScriptInvocation,
        optional: bool,
    ) -> HarnessResult<bool> {
        match ctx.scripts.run(invocation) {
            Ok(_) => Ok(true),
            Err(ScriptError::NotFound { path }) if optional => {
                debug!(module = %ctx.module(), %step, "optional script {} absent", path.display());
                Ok(false)
            }
            Err(ScriptError::NotFound { path }) => Err(HarnessError::ScriptMissing { step, path }),
            Err(ScriptError::Failed { exit_code, .. }) => {
                Err(HarnessError::ScriptFailure { step, exit_code })
            }
            Err(err @ ScriptError::TimedOut { .. }) => Err(HarnessError::ScriptFailure {
                step,
                exit_code: err.exit_code().unwrap_or(124),
            }),
            Err(ScriptError::Interrupted { .. }) => Err(HarnessError::Interrupted),
            Err(ScriptError::Spawn { path, source }) => Err(HarnessError::io(
                format!("running {step} script {}", path.display()),
                source,
            )),
        }
    }

    fn run_engine(
        &self,
        ctx: &ModuleContext<'_>,
        results: &mut ResultAggregator,
    ) -> HarnessResult<()> {
        let outcome =
            panic::catch_unwind(AssertUnwindSafe(|| self.engine.run_module(ctx, results)));
        match outcome {
            Ok(result) => result,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(module = %ctx.module(), "test engine panicked: {message}");
                Err(HarnessError::Config(format!("test engine panicked: {message}")))
            }
        }
    }

    /// Abort before any test case ran: every test case gets the outcome.
    fn abort_all(
        &self,
        ctx: &ModuleContext<'_>,
        run: &mut ModuleRun,
        results: &mut ResultAggregator,
        err: HarnessError,
    ) {
        let (outcome, message) = match &err {
            HarnessError::EnvironmentSkip { reason } => (Outcome::Skipped, reason.clone()),
            other => (Outcome::Failed, self.failure_message(other)),
        };
        if err.is_skip() {
            info!(module = %run.module, "skipping module: {message}");
        } else {
            error!(module = %run.module, code = err.code(), "{message}");
        }
        for id in ctx.test_case_ids() {
            results.record(&id, Phase::Setup, outcome, Some(message.clone()));
        }
        run.abort(err);
    }

    /// Fail every test case without a result, or the last one if all have one.
    fn fail_unfinished(
        &self,
        ctx: &ModuleContext<'_>,
        results: &mut ResultAggregator,
        message: &str,
    ) {
        let ids = ctx.test_case_ids();
        let unfinished: Vec<&String> = ids.iter().filter(|id| results.get(id).is_none()).collect();
        if unfinished.is_empty() {
            if let Some(last) = ids.last() {
                results.record(last, Phase::Teardown, Outcome::Failed, Some(message.to_string()));
            }
            return;
        }
        for id in unfinished {
            results.record(id, Phase::Call, Outcome::Failed, Some(message.to_string()));
        }
    }

    fn record_teardown_failure(
        &self,
        ctx: &ModuleContext<'_>,
        results: &mut ResultAggregator,
        err: &HarnessError,
    ) {
        if let Some(last) = ctx.test_case_ids().last() {
            results.record(last, Phase::Teardown, Outcome::Failed, Some(self.failure_message(err)));
        }
    }

    /// Failure text naming the script, e.g. `stop.pl exited with 1`.
    fn failure_message(&self, err: &HarnessError) -> String {
        let scripts = &self.config.scripts;
        let script = match err.step() {
            Some(Step::NetworkCheck) => &scripts.network_check,
            Some(Step::Prereq) => &scripts.prereq,
            Some(Step::Setup) => &scripts.setup,
            Some(Step::Start) => &scripts.start,
            Some(Step::Stop) => &scripts.stop,
            Some(Step::CoreDumpCheck) => &scripts.core_dump_check,
            Some(Step::TestCase) | None => return err.to_string(),
        };
        match err {
            HarnessError::ScriptFailure { exit_code, .. }
            | HarnessError::IntegrityFinding { exit_code } => {
                format!("{script} exited with {exit_code}")
            }
            other => other.to_string(),
        }
    }

    fn finish(
        &self,
        run: ModuleRun,
        results: ResultAggregator,
        workspace: Option<Workspace>,
        unexpected_artifacts: Vec<PathBuf>,
        (started_at, started): (DateTime<Utc>, Instant),
    ) -> ModuleReport {
        let module = run.module.clone();
        let verdict = results.verdict();
        for result in results.results() {
            let outcome = result.outcome.to_string().to_uppercase();
            debug!(module = %module, "{outcome} {}", result.id);
        }
        for message in results.messages() {
            debug!(module = %module, "\n{message}");
        }
        if verdict == Verdict::Error {
            debug!(module = %module, "no test results recorded, module never ran a test");
        }
        info!(module = %module, %verdict, state = %run.state, "module finished: {verdict}");

        let failure = match &run.failure {
            Some(err) => Some(FailureDetail {
                step: err.step(),
                code: err.code().to_string(),
                exit_code: err.exit_code(),
                message: self.failure_message(err),
            }),
            None if verdict == Verdict::Failed => Some(FailureDetail {
                step: Some(Step::TestCase),
                code: String::new(),
                exit_code: None,
                message: results.messages().into_iter().next().unwrap_or_default(),
            }),
            None => None,
        };

        let retention = Retention::decide(self.config.keep_artifacts, verdict, run.setup_complete);
        let mut retained = workspace.is_some();
        let (workspace_path, alias) = match &workspace {
            Some(ws) => (Some(ws.path().to_path_buf()), ws.alias().map(Path::to_path_buf)),
            None => (None, None),
        };
        let keep_reason = match retention {
            Retention::Keep(reason) => Some(reason),
            Retention::Destroy => None,
        };

        if let Some(ws) = workspace {
            match retention {
                Retention::Keep(reason) => {
                    let shown = ws
                        .display_path()
                        .strip_prefix(&self.config.root)
                        .unwrap_or(ws.display_path())
                        .display()
                        .to_string();
                    debug!(
                        module = %module,
                        %reason,
                        "keeping temporary directory {}",
                        ws.path().display()
                    );
                    info!(module = %module, verdict = %verdict, "test artifacts in: {shown}");
                }
                Retention::Destroy => {
                    debug!(module = %module, "deleting temporary directory");
                    match self.workspaces.destroy(ws) {
                        Ok(()) => retained = false,
                        Err(err) => warn!(module = %module, "failed to remove workspace: {err}"),
                    }
                }
            }
        }

        ModuleReport {
            system_test: module.system_test_name().to_string(),
            module,
            verdict,
            state: run.state,
            setup_complete: run.setup_complete,
            failure,
            skip_reason: run.skip_reason,
            workspace: workspace_path,
            alias,
            retained,
            keep_reason,
            unexpected_artifacts,
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
            test_cases: results.results(),
        }
    }
}

/// Runs stop and inspection when dropped without an explicit [`run`].
///
/// [`run`]: TeardownGuard::run
struct TeardownGuard<'g> {
    driver: &'g LifecycleDriver<'g>,
    ctx: &'g ModuleContext<'g>,
    armed: bool,
}

impl<'g> TeardownGuard<'g> {
    fn arm(driver: &'g LifecycleDriver<'g>, ctx: &'g ModuleContext<'g>) -> Self {
        Self {
            driver,
            ctx,
            armed: true,
        }
    }

    fn run(mut self) -> Teardown {
        self.armed = false;
        self.driver.teardown(self.ctx)
    }
}

impl Drop for TeardownGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(module = %self.ctx.module(), "abnormal exit, stopping servers");
            let teardown = self.driver.teardown(self.ctx);
            if let Err(err) = teardown.stop.and(teardown.inspect) {
                error!(module = %self.ctx.module(), "teardown after abnormal exit failed: {err}");
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::engine::ScriptEngine;
    use std::fs;

    struct Fixture {
        root: tempfile::TempDir,
        config: HarnessConfig,
        manifest: ModuleManifest,
        workspace: Workspace,
    }

    impl Fixture {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            let log = root.path().join("calls.log");
            for (script, label) in [("stop.pl", "stop"), ("get_core_dumps.sh", "cores")] {
                let body = format!("echo {label} >> '{}'\n", log.display());
                fs::write(root.path().join(script), body).unwrap();
            }
            fs::create_dir_all(root.path().join("sigma")).unwrap();

            let config = HarnessConfig::new(root.path())
                .with_shell("/bin/sh")
                .with_perl("/bin/sh");
            let id = ModuleId::new("sigma/tests_sigma.toml");
            let workspace = WorkspaceManager::new(root.path()).create(&id).unwrap();
            let manifest = ModuleManifest {
                id,
                extra_artifacts: Vec::new(),
                tests: Vec::new(),
            };
            Self {
                root,
                config,
                manifest,
                workspace,
            }
        }

        fn calls(&self) -> Vec<String> {
            fs::read_to_string(self.root.path().join("calls.log"))
                .unwrap_or_default()
                .lines()
                .map(ToString::to_string)
                .collect()
        }
    }

    #[test]
    fn test_guard_tears_down_while_unwinding() {
        let f = Fixture::new();
        let engine = ScriptEngine;
        let driver = LifecycleDriver::new(&f.config, &engine, InterruptFlag::new());
        let scripts = ScriptContext::new(f.workspace.path());
        let ctx = ModuleContext {
            manifest: &f.manifest,
            ports: PortRange {
                base: 5001,
                width: 20,
            },
            workspace: &f.workspace,
            scripts: &scripts,
            config: &f.config,
            interrupt: driver.interrupt(),
        };

        let unwound = panic::catch_unwind(AssertUnwindSafe(|| {
            let _guard = TeardownGuard::arm(&driver, &ctx);
            panic!("escaped the engine");
        }));

        assert!(unwound.is_err());
        assert_eq!(f.calls(), vec!["stop", "cores"]);
    }

    #[test]
    fn test_guard_is_disarmed_by_explicit_teardown() {
        let f = Fixture::new();
        let engine = ScriptEngine;
        let driver = LifecycleDriver::new(&f.config, &engine, InterruptFlag::new());
        let scripts = ScriptContext::new(f.workspace.path());
        let ctx = ModuleContext {
            manifest: &f.manifest,
            ports: PortRange {
                base: 5001,
                width: 20,
            },
            workspace: &f.workspace,
            scripts: &scripts,
            config: &f.config,
            interrupt: driver.interrupt(),
        };

        let teardown = TeardownGuard::arm(&driver, &ctx).run();

        assert!(teardown.stop.is_ok());
        assert!(teardown.inspect.is_ok());
        assert_eq!(f.calls(), vec!["stop", "cores"]);
    }
}
