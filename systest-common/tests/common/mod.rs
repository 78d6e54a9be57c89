use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Once;

use systest_common::HarnessConfig;
use systest_common::logging::ModuleLogLayer;
use tempfile::TempDir;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .with(ModuleLogLayer)
            .with(filter)
            .init();
    });
}

/// A throwaway system-test root with recording lifecycle scripts.
///
/// Every root-level script appends `<name> <args>` to `calls.log` in the
/// root, so tests can assert which steps ran and how often. All scripts are
/// plain `sh`; the config uses `/bin/sh` for both interpreters.
#[allow(dead_code)]
pub struct TestRoot {
    dir: TempDir,
}

#[allow(dead_code)]
impl TestRoot {
    pub fn new() -> Self {
        let root = Self {
            dir: tempfile::tempdir().unwrap(),
        };
        root.root_script("testsock.pl", "testsock", "exit 0");
        root.root_script("start.pl", "start", "exit 0");
        root.root_script("stop.pl", "stop", "exit 0");
        root.root_script("get_core_dumps.sh", "core_dumps", "exit 0");
        root
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn config(&self) -> HarnessConfig {
        HarnessConfig::new(self.path())
            .with_shell("/bin/sh")
            .with_perl("/bin/sh")
    }

    fn log_path(&self) -> PathBuf {
        self.path().join("calls.log")
    }

    /// Shell line appending `<label> <args>` to the call log.
    pub fn record_line(&self, label: &str) -> String {
        format!("echo \"{label} $*\" >> '{}'", self.log_path().display())
    }

    /// (Re)write a root-level lifecycle script ending with `tail`.
    pub fn root_script(&self, name: &str, label: &str, tail: &str) {
        let body = format!("{}\n{tail}\n", self.record_line(label));
        fs::write(self.path().join(name), body).unwrap();
    }

    pub fn remove_root_script(&self, name: &str) {
        fs::remove_file(self.path().join(name)).unwrap();
    }

    /// Create `<root>/<name>/` with a manifest and extra files.
    pub fn module(
        &self,
        name: &str,
        manifest: &str,
        files: &[(&str, &str)],
    ) -> systest_common::ModuleId {
        let dir = self.path().join(name);
        fs::create_dir_all(&dir).unwrap();
        let manifest_name = format!("tests_{name}.toml");
        fs::write(dir.join(&manifest_name), manifest).unwrap();
        for (file, body) in files {
            let path = dir.join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, body).unwrap();
        }
        systest_common::ModuleId::new(format!("{name}/{manifest_name}"))
    }

    pub fn calls(&self) -> Vec<String> {
        fs::read_to_string(self.log_path())
            .unwrap_or_default()
            .lines()
            .map(|line| line.trim_end().to_string())
            .collect()
    }

    pub fn count(&self, label: &str) -> usize {
        self.calls()
            .iter()
            .filter(|line| line.split_whitespace().next() == Some(label))
            .count()
    }

    pub fn labels(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter_map(|line| line.split_whitespace().next().map(ToString::to_string))
            .collect()
    }
}
