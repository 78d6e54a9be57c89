//! Detection of files a module left behind that it did not declare.

use std::path::PathBuf;

use glob::Pattern;
use tracing::warn;
use walkdir::WalkDir;

use crate::errors::{HarnessError, HarnessResult};
use crate::workspace::Workspace;

/// Files in `workspace` that were neither copied from the fixture nor match
/// one of the `allowed` glob patterns. Paths are relative to the workspace.
/// The harness's own module log is never an artifact.
///
/// A workspace that no longer exists has no artifacts.
pub fn unexpected_artifacts(
    workspace: &Workspace,
    allowed: &[String],
) -> HarnessResult<Vec<PathBuf>> {
    let root = workspace.path();
    let log_name = PathBuf::from(workspace.log_name());
    if !root.is_dir() {
        return Ok(Vec::new());
    }

    let patterns = allowed
        .iter()
        .map(|pattern| {
            Pattern::new(pattern).map_err(|err| {
                HarnessError::Config(format!("invalid extra_artifacts pattern '{pattern}': {err}"))
            })
        })
        .collect::<HarnessResult<Vec<_>>>()?;

    let mut unexpected = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|err| {
            HarnessError::io(format!("walking {}", root.display()), err.into())
        })?;
        if entry.file_type().is_dir() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        if relative == log_name || workspace.fixture_files().contains(relative) {
            continue;
        }
        if patterns.iter().any(|pattern| pattern.matches_path(relative)) {
            continue;
        }
        unexpected.push(relative.to_path_buf());
    }

    if !unexpected.is_empty() {
        let listed: Vec<String> = unexpected.iter().map(|p| p.display().to_string()).collect();
        warn!(
            module = %workspace.module(),
            count = unexpected.len(),
            "unexpected test artifacts: {}",
            listed.join(", ")
        );
    }
    Ok(unexpected)
}
