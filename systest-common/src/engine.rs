//! Test-case execution engines.
//!
//! The lifecycle driver hands control to an engine while a module is
//! `Running`. The engine executes the module's test cases and records their
//! phase outcomes; it must not touch the lifecycle itself.

use std::time::Duration;

use tracing::{info, warn};

use crate::errors::{HarnessError, HarnessResult};
use crate::lifecycle::ModuleContext;
use crate::results::{Outcome, Phase, ResultAggregator};
use crate::script::{ScriptError, ScriptInvocation};

/// Executes the test cases of one module.
pub trait TestCaseEngine: Send + Sync {
    /// Whether every test case of a module runs on one worker as a unit.
    /// Parallel runs are only allowed when this holds.
    fn groups_by_module(&self) -> bool;

    /// Run all test cases of the module in `ctx`.
    ///
    /// Returns `Err(HarnessError::Interrupted)` when the run was interrupted;
    /// test cases not yet started are left without a result.
    fn run_module(
        &self,
        ctx: &ModuleContext<'_>,
        results: &mut ResultAggregator,
    ) -> HarnessResult<()>;
}

/// Runs each manifest test case as a script inside the workspace.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptEngine;

impl TestCaseEngine for ScriptEngine {
    fn groups_by_module(&self) -> bool {
        true
    }

    fn run_module(
        &self,
        ctx: &ModuleContext<'_>,
        results: &mut ResultAggregator,
    ) -> HarnessResult<()> {
        for test in &ctx.manifest.tests {
            if ctx.interrupt.is_set() {
                return Err(HarnessError::Interrupted);
            }
            let id = ctx.manifest.test_case_id(test);

            if let Some(reason) = &test.skip {
                info!(test_case = %id, "skipped: {reason}");
                results.record(&id, Phase::Setup, Outcome::Skipped, Some(reason.clone()));
                continue;
            }

            info!(test_case = %id, "test case started");
            results.record(&id, Phase::Setup, Outcome::Passed, None);

            let timeout = test
                .timeout_secs
                .map(Duration::from_secs)
                .or(ctx.config.script_timeout);
            let invocation = ScriptInvocation::new(
                ctx.interpreter(test.interpreter),
                ctx.workspace.path().join(&test.script),
            )
            .args(test.args.iter().cloned())
            .timeout(timeout)
            .interruptible(ctx.interrupt);

            let (outcome, message) = match ctx.scripts.run(&invocation) {
                Ok(_) => (Outcome::Passed, None),
                Err(ScriptError::Interrupted { .. }) => {
                    let message = Some("interrupted".to_string());
                    results.record(&id, Phase::Call, Outcome::Failed, message);
                    return Err(HarnessError::Interrupted);
                }
                Err(ScriptError::Failed {
                    exit_code,
                    output_tail,
                    ..
                }) => {
                    let mut message = format!("{} exited with {exit_code}", test.script);
                    if !output_tail.is_empty() {
                        message.push('\n');
                        message.push_str(&output_tail.join("\n"));
                    }
                    (Outcome::Failed, Some(message))
                }
                Err(err) => (Outcome::Failed, Some(err.to_string())),
            };
            if outcome == Outcome::Failed {
                warn!(test_case = %id, "test case failed");
            }
            results.record(&id, Phase::Call, outcome, message);
            results.record(&id, Phase::Teardown, Outcome::Passed, None);
        }
        Ok(())
    }
}
