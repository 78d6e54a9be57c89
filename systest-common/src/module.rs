//! Test module identity, discovery and manifests.
//!
//! A module is a `tests_*.toml` manifest inside a system-test directory
//! directly below the root. Its identity is the manifest path relative to
//! the root, which sorts deterministically and is the sole key for port
//! and workspace assignment.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::errors::{HarnessError, HarnessResult};

const MANIFEST_PREFIX: &str = "tests_";
const MANIFEST_SUFFIX: &str = ".toml";

/// Stable identity of a test module.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleId(String);

impl ModuleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identity of the manifest at `path`, which must lie under `root`.
    pub fn from_path(root: &Path, path: &Path) -> Option<Self> {
        let relative = path.strip_prefix(root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if parts.is_empty() {
            return None;
        }
        Some(Self(parts.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the system-test directory holding the manifest.
    pub fn system_test_name(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }

    /// Stable alias name, e.g. `runtime/tests_sh_runtime.toml` -> `runtime_sh_runtime`.
    pub fn alias_name(&self) -> String {
        let (dir, file) = self.0.rsplit_once('/').unwrap_or(("", &self.0));
        let stem = file
            .strip_prefix("tests")
            .and_then(|rest| rest.strip_suffix(MANIFEST_SUFFIX))
            .filter(|rest| rest.starts_with('_'));
        match stem {
            Some(stem) => format!("{dir}{stem}").replace('/', "_"),
            None => self.0.replace('/', "_"),
        }
    }

    pub fn manifest_path(&self, root: &Path) -> PathBuf {
        root.join(&self.0)
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether `path` is outside the set of collectable system-test locations.
///
/// Workspace copies and aliases are named with an underscore, which is not
/// allowed in a system-test name, so anything beneath them is ignored.
pub fn is_ignored_path(root: &Path, path: &Path) -> bool {
    let Ok(relative) = path.strip_prefix(root) else {
        warn!(path = %path.display(), "unexpected test path (ignored)");
        return true;
    };
    match relative.components().next() {
        Some(first) => first.as_os_str().to_string_lossy().contains('_'),
        None => true,
    }
}

/// Sorted list of every module under `root`.
///
/// This is the complete list, independent of any selection made for the
/// current run, so that port offsets stay stable across partial runs.
pub fn discover_modules(root: &Path) -> HarnessResult<Vec<ModuleId>> {
    if !root.is_dir() {
        return Err(HarnessError::Config(format!(
            "system test root {} is not a directory",
            root.display()
        )));
    }

    let mut modules = Vec::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .max_depth(2)
        .follow_links(false)
        .sort_by_file_name();
    for entry in walker {
        let entry = entry.map_err(|err| {
            let context = format!("walking {}", root.display());
            HarnessError::io(context, err.into())
        })?;
        if entry.depth() != 2 || !entry.file_type().is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy();
        if !(file_name.starts_with(MANIFEST_PREFIX) && file_name.ends_with(MANIFEST_SUFFIX)) {
            continue;
        }
        if is_ignored_path(root, entry.path()) {
            continue;
        }
        if let Some(module) = ModuleId::from_path(root, entry.path()) {
            modules.push(module);
        }
    }

    modules.sort();
    debug!(count = modules.len(), root = %root.display(), "discovered test modules");
    Ok(modules)
}

/// Interpreter used for a test-case script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpreterKind {
    #[default]
    Shell,
    Perl,
}

/// One test case declared by a module manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCaseSpec {
    pub name: String,
    /// Script path relative to the workspace.
    pub script: String,
    #[serde(default)]
    pub interpreter: InterpreterKind,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Report the test case as skipped with this reason, without running it.
    #[serde(default)]
    pub skip: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawManifest {
    #[serde(default)]
    extra_artifacts: Vec<String>,
    #[serde(default, rename = "test")]
    tests: Vec<TestCaseSpec>,
}

/// Parsed module manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleManifest {
    pub id: ModuleId,
    /// Glob patterns of files the module is allowed to leave behind.
    pub extra_artifacts: Vec<String>,
    pub tests: Vec<TestCaseSpec>,
}

impl ModuleManifest {
    /// Load and validate the manifest of `id`.
    ///
    /// A manifest without test cases runs the conventional `tests_script`
    /// under the shell as a single test case named after the system test.
    pub fn load(root: &Path, id: &ModuleId, tests_script: &str) -> HarnessResult<Self> {
        let path = id.manifest_path(root);
        let contents = std::fs::read_to_string(&path)
            .map_err(|err| HarnessError::io(format!("reading {}", path.display()), err))?;
        Self::parse(id, &path, &contents, tests_script)
    }

    fn parse(
        id: &ModuleId,
        path: &Path,
        contents: &str,
        tests_script: &str,
    ) -> HarnessResult<Self> {
        let raw: RawManifest = toml::from_str(contents).map_err(|source| HarnessError::Manifest {
            path: path.to_path_buf(),
            source,
        })?;

        let tests = if raw.tests.is_empty() {
            vec![TestCaseSpec {
                name: id.system_test_name().to_string(),
                script: tests_script.to_string(),
                interpreter: InterpreterKind::Shell,
                args: Vec::new(),
                timeout_secs: None,
                skip: None,
            }]
        } else {
            raw.tests
        };

        let mut names: Vec<&str> = tests.iter().map(|t| t.name.as_str()).collect();
        names.sort_unstable();
        if let Some(pair) = names.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(HarnessError::Config(format!(
                "{}: duplicate test case name '{}'",
                path.display(),
                pair[0]
            )));
        }

        for pattern in &raw.extra_artifacts {
            glob::Pattern::new(pattern).map_err(|err| {
                HarnessError::Config(format!(
                    "{}: invalid extra_artifacts pattern '{pattern}': {err}",
                    path.display()
                ))
            })?;
        }

        Ok(Self {
            id: id.clone(),
            extra_artifacts: raw.extra_artifacts,
            tests,
        })
    }

    /// Fully qualified test-case id, e.g. `runtime/tests_sh_runtime.toml::runtime`.
    pub fn test_case_id(&self, test: &TestCaseSpec) -> String {
        format!("{}::{}", self.id, test.name)
    }
}
