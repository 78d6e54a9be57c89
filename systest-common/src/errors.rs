//! Error taxonomy for the lifecycle harness.
//!
//! # Error Code Ranges
//!
//! | Range      | Category     | Description                              |
//! |------------|--------------|------------------------------------------|
//! | E001-E009  | Environment  | Missing infrastructure, surfaced as skip |
//! | E010-E019  | Script       | Lifecycle script failures                |
//! | E020-E029  | Resources    | Port space, workspace filesystem         |
//! | E030-E039  | Integrity    | Core dumps and sanitizer reports         |
//! | E090-E099  | Run          | Configuration, manifests, interruption   |

use std::path::PathBuf;

use crate::lifecycle::Step;

/// Error type for harness operations.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// A prerequisite of the environment is missing. Not a test defect.
    #[error("environment prerequisite missing: {reason}")]
    EnvironmentSkip { reason: String },

    #[error("{step} script exited with {exit_code}")]
    ScriptFailure { step: Step, exit_code: i32 },

    /// A mandatory lifecycle script does not exist.
    #[error("{step} script not found: {}", path.display())]
    ScriptMissing { step: Step, path: PathBuf },

    #[error(
        "not enough ports to assign unique port set to each module \
         ({modules} modules need {required} ports, {available} available)"
    )]
    Capacity {
        modules: usize,
        required: u64,
        available: u64,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("core dumps or sanitizer reports found (inspection exited with {exit_code})")]
    IntegrityFinding { exit_code: i32 },

    #[error("run interrupted")]
    Interrupted,

    #[error("invalid module manifest {}: {source}", path.display())]
    Manifest {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

impl HarnessError {
    /// Wrap an IO error with a description of what was being attempted.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Stable code for reports and log correlation.
    pub fn code(&self) -> &'static str {
        match self {
            Self::EnvironmentSkip { .. } => "STH-E001",
            Self::ScriptFailure { .. } => "STH-E010",
            Self::ScriptMissing { .. } => "STH-E011",
            Self::Capacity { .. } => "STH-E020",
            Self::Io { .. } => "STH-E021",
            Self::IntegrityFinding { .. } => "STH-E030",
            Self::Manifest { .. } => "STH-E090",
            Self::Config(_) => "STH-E091",
            Self::Interrupted => "STH-E099",
        }
    }

    /// Skips are resolved locally into a skipped outcome.
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::EnvironmentSkip { .. })
    }

    /// Errors that end the whole run rather than one module.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Capacity { .. } | Self::Interrupted)
    }

    /// The lifecycle step this error is attributed to, when there is one.
    pub fn step(&self) -> Option<Step> {
        match self {
            Self::ScriptFailure { step, .. } | Self::ScriptMissing { step, .. } => Some(*step),
            Self::IntegrityFinding { .. } => Some(Step::CoreDumpCheck),
            _ => None,
        }
    }

    /// Exit code of the failing script, if the error came from one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::ScriptFailure { exit_code, .. } | Self::IntegrityFinding { exit_code } => {
                Some(*exit_code)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_unique() {
        let errors = [
            HarnessError::EnvironmentSkip {
                reason: "x".to_string(),
            },
            HarnessError::ScriptFailure {
                step: Step::Setup,
                exit_code: 1,
            },
            HarnessError::ScriptMissing {
                step: Step::Start,
                path: PathBuf::from("start.pl"),
            },
            HarnessError::Capacity {
                modules: 1,
                required: 1,
                available: 0,
            },
            HarnessError::io("x", std::io::Error::other("boom")),
            HarnessError::IntegrityFinding { exit_code: 1 },
            HarnessError::Interrupted,
            HarnessError::Config("x".to_string()),
        ];
        let mut codes: Vec<_> = errors.iter().map(HarnessError::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_script_failure_carries_step_and_exit_code() {
        let err = HarnessError::ScriptFailure {
            step: Step::Stop,
            exit_code: 3,
        };
        assert_eq!(err.step(), Some(Step::Stop));
        assert_eq!(err.exit_code(), Some(3));
        assert_eq!(err.to_string(), "stop script exited with 3");
        assert!(!err.is_skip());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_environment_skip_is_not_a_failure() {
        let skip = HarnessError::EnvironmentSkip {
            reason: "no ifconfig".to_string(),
        };
        assert!(skip.is_skip());
        assert_eq!(skip.step(), None);
        assert_eq!(skip.exit_code(), None);
        assert!(!skip.is_fatal());
    }

    #[test]
    fn test_interruption_ends_the_run() {
        assert!(HarnessError::Interrupted.is_fatal());
        assert!(!HarnessError::Config("engine panicked".to_string()).is_fatal());
    }

    #[test]
    fn test_integrity_finding_is_attributed_to_inspection() {
        let err = HarnessError::IntegrityFinding { exit_code: 2 };
        assert_eq!(err.step(), Some(Step::CoreDumpCheck));
    }
}
