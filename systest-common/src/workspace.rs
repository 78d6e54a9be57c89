//! Per-module workspaces.
//!
//! A workspace is a fresh `<system_test>_tmp_<unique>` directory under the
//! root holding a copy of the module's fixture tree. A stable alias next to
//! it points at the latest workspace of a module so a human can find the
//! artifacts of the last run without knowing the unique suffix.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::errors::{HarnessError, HarnessResult};
use crate::module::ModuleId;
use crate::results::Verdict;

const WORKSPACE_MARKER: &str = "_tmp_";

/// A materialized module workspace.
#[derive(Debug, Clone)]
pub struct Workspace {
    module: ModuleId,
    path: PathBuf,
    alias: Option<PathBuf>,
    fixture_files: BTreeSet<PathBuf>,
}

impl Workspace {
    pub fn module(&self) -> &ModuleId {
        &self.module
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory name, handed to start/stop scripts as the instance name.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn alias(&self) -> Option<&Path> {
        self.alias.as_deref()
    }

    /// Relative paths of every non-directory entry copied from the fixture.
    pub fn fixture_files(&self) -> &BTreeSet<PathBuf> {
        &self.fixture_files
    }

    /// Path shown to humans: the alias if there is one.
    pub fn display_path(&self) -> &Path {
        self.alias.as_deref().unwrap_or(&self.path)
    }

    /// Name of the module log inside the workspace, `<system_test>.log`.
    pub fn log_name(&self) -> String {
        format!("{}.log", self.module.system_test_name())
    }

    pub fn log_file(&self) -> PathBuf {
        self.path.join(self.log_name())
    }
}

/// Why a workspace is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepReason {
    AlwaysKeep,
    Failed,
    Error,
    SetupIncomplete,
}

impl fmt::Display for KeepReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlwaysKeep => write!(f, "artifacts kept on request"),
            Self::Failed => write!(f, "module failed"),
            Self::Error => write!(f, "module produced no results"),
            Self::SetupIncomplete => write!(f, "lifecycle did not reach a clean stop"),
        }
    }
}

/// Retention decision for a finished module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    Keep(KeepReason),
    Destroy,
}

impl Retention {
    /// First matching rule wins: always-keep, failed, error, setup incomplete.
    pub fn decide(always_keep: bool, verdict: Verdict, setup_complete: bool) -> Self {
        if always_keep {
            Self::Keep(KeepReason::AlwaysKeep)
        } else if verdict == Verdict::Failed {
            Self::Keep(KeepReason::Failed)
        } else if verdict == Verdict::Error {
            Self::Keep(KeepReason::Error)
        } else if !setup_complete {
            Self::Keep(KeepReason::SetupIncomplete)
        } else {
            Self::Destroy
        }
    }

    pub fn is_keep(&self) -> bool {
        matches!(self, Self::Keep(_))
    }
}

/// Leftovers removed by [`WorkspaceManager::sweep_stale`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub workspaces: usize,
    pub aliases: usize,
}

/// Creates and removes workspaces under a shared root.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a fresh workspace and copy the module's fixture tree into it.
    ///
    /// The directory is removed again if the copy fails.
    pub fn create(&self, module: &ModuleId) -> HarnessResult<Workspace> {
        let system_test = module.system_test_name();
        let source = self.root.join(system_test);
        if !source.is_dir() {
            return Err(HarnessError::io(
                format!("fixture tree {}", source.display()),
                io::Error::new(io::ErrorKind::NotFound, "directory does not exist"),
            ));
        }

        let tmp = tempfile::Builder::new()
            .prefix(&format!("{system_test}{WORKSPACE_MARKER}"))
            .tempdir_in(&self.root)
            .map_err(|err| {
                HarnessError::io(format!("creating workspace under {}", self.root.display()), err)
            })?;

        let fixture_files = copy_tree(&source, tmp.path())?;
        let path = tmp.keep();
        debug!(
            module = %module,
            workspace = %path.display(),
            files = fixture_files.len(),
            "workspace created"
        );

        Ok(Workspace {
            module: module.clone(),
            path,
            alias: None,
            fixture_files,
        })
    }

    /// Point `<root>/<alias_name>` at `workspace`, replacing any old alias.
    ///
    /// The link target is the workspace's directory name, so the alias stays
    /// valid if the root is moved.
    pub fn link_alias(
        &self,
        workspace: &mut Workspace,
        alias_name: &str,
    ) -> HarnessResult<PathBuf> {
        let alias = self.root.join(alias_name);
        remove_alias(&alias)?;
        symlink_dir(Path::new(&workspace.name()), &alias)
            .map_err(|err| HarnessError::io(format!("linking alias {}", alias.display()), err))?;
        debug!(alias = %alias.display(), workspace = %workspace.path.display(), "alias linked");
        workspace.alias = Some(alias.clone());
        Ok(alias)
    }

    /// Remove the workspace and its alias.
    ///
    /// The alias is only removed while it still points at this workspace.
    pub fn destroy(&self, workspace: Workspace) -> HarnessResult<()> {
        if let Some(alias) = &workspace.alias {
            let ours = fs::read_link(alias)
                .map(|target| target == Path::new(&workspace.name()))
                .unwrap_or(false);
            if ours {
                remove_alias(alias)?;
            }
        }
        match fs::remove_dir_all(&workspace.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(HarnessError::io(
                    format!("removing workspace {}", workspace.path.display()),
                    err,
                ));
            }
        }
        debug!(workspace = %workspace.path.display(), "workspace removed");
        Ok(())
    }

    /// Remove workspaces older than `max_age` and aliases whose target is gone.
    ///
    /// Failures to remove a single entry are logged and skipped.
    pub fn sweep_stale(&self, max_age: Duration, now: SystemTime) -> SweepReport {
        let mut report = SweepReport::default();
        let Ok(entries) = fs::read_dir(&self.root) else {
            return report;
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.contains('_') {
                continue;
            }
            let path = entry.path();
            let Ok(meta) = fs::symlink_metadata(&path) else {
                continue;
            };

            if meta.file_type().is_symlink() {
                if fs::metadata(&path).is_err() {
                    match fs::remove_file(&path) {
                        Ok(()) => report.aliases += 1,
                        Err(err) => {
                            warn!(alias = %path.display(), "failed to remove dangling alias: {err}")
                        }
                    }
                }
                continue;
            }

            if !meta.is_dir() || !name.contains(WORKSPACE_MARKER) {
                continue;
            }
            let is_stale = meta
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age > max_age);
            if is_stale {
                match fs::remove_dir_all(&path) {
                    Ok(()) => report.workspaces += 1,
                    Err(err) => warn!(
                        workspace = %path.display(),
                        "failed to remove stale workspace: {err}"
                    ),
                }
            }
        }

        if report.workspaces > 0 || report.aliases > 0 {
            info!(
                workspaces = report.workspaces,
                aliases = report.aliases,
                "removed stale workspaces and dangling aliases"
            );
        }
        report
    }
}

/// Deep-copy `source` into `dest`, returning the relative paths of files.
fn copy_tree(source: &Path, dest: &Path) -> HarnessResult<BTreeSet<PathBuf>> {
    let mut files = BTreeSet::new();
    for entry in WalkDir::new(source).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|err| {
            HarnessError::io(format!("walking {}", source.display()), err.into())
        })?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|err| HarnessError::io("computing fixture path", io::Error::other(err)))?;
        let target = dest.join(relative);
        let file_type = entry.file_type();

        let copied = if file_type.is_dir() {
            fs::create_dir_all(&target)
        } else if file_type.is_symlink() {
            fs::read_link(entry.path()).and_then(|link| symlink_any(&link, &target))
        } else {
            fs::copy(entry.path(), &target).map(|_| ())
        };
        copied.map_err(|err| {
            HarnessError::io(format!("copying {} into workspace", entry.path().display()), err)
        })?;

        if !file_type.is_dir() {
            files.insert(relative.to_path_buf());
        }
    }
    Ok(files)
}

fn remove_alias(alias: &Path) -> HarnessResult<()> {
    match fs::remove_file(alias) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(HarnessError::io(format!("removing alias {}", alias.display()), err)),
    }
}

#[cfg(unix)]
fn symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

#[cfg(unix)]
fn symlink_any(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink_any(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}
