//! Module reports handed to the outer reporting layer.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::HarnessError;
use crate::lifecycle::{LifecycleState, Step};
use crate::module::ModuleId;
use crate::results::{TestCaseResult, Verdict};
use crate::workspace::KeepReason;

/// The lifecycle failure that aborted a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub step: Option<Step>,
    /// Error code, empty for plain test-case failures.
    pub code: String,
    pub exit_code: Option<i32>,
    pub message: String,
}

/// Outcome of one module run, one JSON line per module on a worker's stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleReport {
    pub module: ModuleId,
    pub system_test: String,
    pub verdict: Verdict,
    /// Last lifecycle state reached.
    pub state: LifecycleState,
    pub setup_complete: bool,
    pub failure: Option<FailureDetail>,
    pub skip_reason: Option<String>,
    pub workspace: Option<PathBuf>,
    pub alias: Option<PathBuf>,
    pub retained: bool,
    pub keep_reason: Option<KeepReason>,
    #[serde(default)]
    pub unexpected_artifacts: Vec<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default)]
    pub test_cases: Vec<TestCaseResult>,
}

impl ModuleReport {
    /// Report for a module that never reached its lifecycle, e.g. because
    /// its manifest could not be loaded.
    pub fn not_run(module: &ModuleId, err: &HarnessError) -> Self {
        Self {
            module: module.clone(),
            system_test: module.system_test_name().to_string(),
            verdict: Verdict::Error,
            state: LifecycleState::Aborted,
            setup_complete: false,
            failure: Some(FailureDetail {
                step: err.step(),
                code: err.code().to_string(),
                exit_code: err.exit_code(),
                message: err.to_string(),
            }),
            skip_reason: None,
            workspace: None,
            alias: None,
            retained: false,
            keep_reason: None,
            unexpected_artifacts: Vec::new(),
            started_at: Utc::now(),
            duration_ms: 0,
            test_cases: Vec::new(),
        }
    }

    /// Serialize as a single line of JSON.
    pub fn to_json_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }

    pub fn is_success(&self) -> bool {
        matches!(self.verdict, Verdict::Passed | Verdict::Skipped)
    }

    /// Human-readable one-line summary.
    pub fn summary_line(&self) -> String {
        let mut line = format!("{:<8} {}", self.verdict.to_string().to_uppercase(), self.module);
        if let Some(failure) = &self.failure {
            line.push_str(&format!(" ({})", failure.message));
        } else if let Some(reason) = &self.skip_reason {
            line.push_str(&format!(" ({reason})"));
        }
        line
    }
}

/// Counts over every module of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub error: usize,
    /// Workspaces kept for inspection (alias path when there is one).
    pub retained: Vec<PathBuf>,
}

impl RunSummary {
    pub fn add(&mut self, report: &ModuleReport) {
        match report.verdict {
            Verdict::Passed => self.passed += 1,
            Verdict::Failed => self.failed += 1,
            Verdict::Skipped => self.skipped += 1,
            Verdict::Error => self.error += 1,
        }
        if report.retained
            && let Some(path) = report.alias.as_ref().or(report.workspace.as_ref())
        {
            self.retained.push(path.clone());
        }
    }

    pub fn total(&self) -> usize {
        self.passed + self.failed + self.skipped + self.error
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.error == 0
    }
}

impl<'a> FromIterator<&'a ModuleReport> for RunSummary {
    fn from_iter<I: IntoIterator<Item = &'a ModuleReport>>(iter: I) -> Self {
        let mut summary = Self::default();
        for report in iter {
            summary.add(report);
        }
        summary
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} modules: {} passed, {} failed, {} skipped, {} error",
            self.total(),
            self.passed,
            self.failed,
            self.skipped,
            self.error
        )
    }
}
