//! Configuration for a harness run.
//!
//! Values come from the environment exported by the build system
//! (`builddir`, `SHELL`, `PERL`) and from `SYSTEST_*` tunables. The CLI
//! layers its flags on top through the `with_*` builders.

pub mod env;
pub mod source;

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::errors::{HarnessError, HarnessResult};
use crate::ports::{
    DEFAULT_PORTS_PER_TEST, DEFAULT_PORT_MAX, DEFAULT_PORT_MIN, MIN_PORTS_PER_TEST, PortSpace,
};
use crate::schedule::DEFAULT_PRIORITY_PATTERNS;

pub use env::{EnvError, EnvParser};
pub use source::{ConfigSource, Sourced};

/// File names of the lifecycle scripts.
///
/// `network_check`, `start`, `stop` and `core_dump_check` live in the
/// system-test root; `prereq`, `setup` and `tests` live inside each module
/// directory (and therefore inside each workspace copy).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleScripts {
    pub network_check: String,
    pub prereq: String,
    pub setup: String,
    pub start: String,
    pub stop: String,
    pub core_dump_check: String,
    pub tests: String,
}

impl Default for LifecycleScripts {
    fn default() -> Self {
        Self {
            network_check: "testsock.pl".to_string(),
            prereq: "prereq.sh".to_string(),
            setup: "setup.sh".to_string(),
            start: "start.pl".to_string(),
            stop: "stop.pl".to_string(),
            core_dump_check: "get_core_dumps.sh".to_string(),
            tests: "tests.sh".to_string(),
        }
    }
}

/// Configuration for one harness run.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// System-test root; holds module directories, workspaces and aliases.
    pub root: PathBuf,
    /// Interpreter for shell scripts.
    pub shell: PathBuf,
    /// Interpreter for the secondary scripting language.
    pub perl: PathBuf,
    pub ports: PortSpace,
    /// Keep every workspace regardless of outcome (`--noclean`).
    pub keep_artifacts: bool,
    /// Module-name patterns scheduled ahead of everything else.
    pub priority_patterns: Vec<String>,
    /// Default timeout applied to test-case scripts without their own.
    pub script_timeout: Option<Duration>,
    /// Leftover workspaces older than this are swept before a run.
    pub stale_workspace_age: Duration,
    pub scripts: LifecycleScripts,
}

impl HarnessConfig {
    /// Minimal configuration rooted at `root`, with defaults everywhere else.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            shell: PathBuf::from("/bin/sh"),
            perl: PathBuf::from("perl"),
            ports: PortSpace::default(),
            keep_artifacts: false,
            priority_patterns: DEFAULT_PRIORITY_PATTERNS
                .iter()
                .map(ToString::to_string)
                .collect(),
            script_timeout: None,
            stale_workspace_age: Duration::from_secs(24 * 3600),
            scripts: LifecycleScripts::default(),
        }
    }

    /// Load configuration from the process environment.
    ///
    /// All parse problems are collected and reported together.
    pub fn from_env() -> HarnessResult<Self> {
        let mut parser = EnvParser::new();

        let root = parser.get_external_dir("builddir");
        let shell = parser.get_external_string("SHELL", "/bin/sh");
        let perl = parser.get_external_string("PERL", "perl");
        let port_min = parser.get_in_range("PORT_MIN", DEFAULT_PORT_MIN, 1024..=u16::MAX);
        let port_max = parser.get_in_range("PORT_MAX", DEFAULT_PORT_MAX, 1024..=u16::MAX);
        let ports_per_test = parser.get_in_range(
            "PORTS_PER_TEST",
            DEFAULT_PORTS_PER_TEST,
            MIN_PORTS_PER_TEST..=1024,
        );
        let keep_artifacts = parser.get_bool("NOCLEAN", false);
        let priority = parser.get_string_list(
            "PRIORITY",
            DEFAULT_PRIORITY_PATTERNS
                .iter()
                .map(ToString::to_string)
                .collect(),
        );
        let timeout = parser.get_in_range("SCRIPT_TIMEOUT_SECS", 0u64, 0..=86_400);
        let stale_age = parser.get_in_range("STALE_WORKSPACE_HOURS", 24u64, 1..=24 * 365);

        if parser.has_errors() {
            let message = parser
                .take_errors()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(HarnessError::Config(message));
        }
        let Some(root) = root else {
            return Err(HarnessError::Config("builddir is not set".to_string()));
        };

        debug!(
            root = %root.value.display(),
            shell = %shell.value,
            shell_source = %shell.source,
            perl = %perl.value,
            "loaded harness configuration"
        );

        let ports = PortSpace {
            min: port_min.value,
            max: port_max.value,
            per_module: ports_per_test.value,
        };
        if ports.min >= ports.max {
            return Err(HarnessError::Config(format!(
                "SYSTEST_PORT_MIN ({}) must be below SYSTEST_PORT_MAX ({})",
                ports.min, ports.max
            )));
        }

        Ok(Self {
            root: root.into_value(),
            shell: PathBuf::from(shell.value),
            perl: PathBuf::from(perl.value),
            ports,
            keep_artifacts: keep_artifacts.value,
            priority_patterns: priority.value,
            script_timeout: match timeout.value {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            stale_workspace_age: Duration::from_secs(stale_age.value * 3600),
            scripts: LifecycleScripts::default(),
        })
    }

    pub fn with_keep_artifacts(mut self, keep: bool) -> Self {
        self.keep_artifacts = self.keep_artifacts || keep;
        self
    }

    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_perl(mut self, perl: impl Into<PathBuf>) -> Self {
        self.perl = perl.into();
        self
    }

    pub fn with_ports(mut self, ports: PortSpace) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_script_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.script_timeout = timeout;
        self
    }

    /// Resolve both interpreters to executables, failing the whole run if
    /// either is missing.
    pub fn check_interpreters(&mut self) -> HarnessResult<()> {
        self.shell = resolve_interpreter(&self.shell, "Shell interpreter required")?;
        self.perl = resolve_interpreter(&self.perl, "Perl interpreter required")?;
        Ok(())
    }
}

fn resolve_interpreter(interpreter: &Path, requirement: &str) -> HarnessResult<PathBuf> {
    which::which(interpreter).map_err(|err| {
        HarnessError::Config(format!(
            "{requirement}: {} is not executable ({err})",
            interpreter.display()
        ))
    })
}
