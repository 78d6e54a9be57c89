//! Lifecycle orchestration for black-box system tests.
//!
//! Each test module gets a private workspace and a private port range,
//! computed without any coordination between worker processes, and is
//! driven through prerequisite checks, setup, server start, test
//! execution, server stop and artifact inspection. The aggregated verdict
//! decides whether the workspace is kept as evidence.

pub mod artifacts;
pub mod config;
pub mod engine;
pub mod errors;
pub mod lifecycle;
pub mod logging;
pub mod module;
pub mod ports;
pub mod report;
pub mod results;
pub mod schedule;
pub mod script;
pub mod workspace;

pub use config::{HarnessConfig, LifecycleScripts};
pub use engine::{ScriptEngine, TestCaseEngine};
pub use errors::{HarnessError, HarnessResult};
pub use lifecycle::{LifecycleDriver, LifecycleState, ModuleContext, Step};
pub use logging::{LogConfig, LogFormat, LoggingGuards, init_logging};
pub use module::{InterpreterKind, ModuleId, ModuleManifest, TestCaseSpec, discover_modules};
pub use ports::{NamedPorts, PortAssignment, PortRange, PortSpace};
pub use report::{FailureDetail, ModuleReport, RunSummary};
pub use results::{Outcome, Phase, ResultAggregator, TestCaseResult, Verdict};
pub use schedule::{Parallelism, SchedulePolicy, WorkerSlot, matches_filters};
pub use script::{InterruptFlag, ScriptContext, ScriptError, ScriptInvocation, ScriptRun};
pub use workspace::{KeepReason, Retention, SweepReport, Workspace, WorkspaceManager};
