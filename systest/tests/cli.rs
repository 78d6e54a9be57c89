//! End-to-end runs of the `systest` binary against a scratch test root.

#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

/// Root scripts append their label to `calls.log` in the root.
fn scratch_root() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("calls.log");
    for (script, label) in [
        ("testsock.pl", "check"),
        ("start.pl", "start"),
        ("stop.pl", "stop"),
        ("get_core_dumps.sh", "cores"),
    ] {
        let body = format!("echo {label} >> '{}'\nexit 0\n", log.display());
        fs::write(dir.path().join(script), body).unwrap();
    }
    dir
}

fn calls(root: &Path) -> Vec<String> {
    fs::read_to_string(root.join("calls.log"))
        .unwrap_or_default()
        .lines()
        .map(ToString::to_string)
        .collect()
}

fn count(root: &Path, label: &str) -> usize {
    calls(root).iter().filter(|call| *call == label).count()
}

fn wait_for_call(root: &Path, label: &str) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while count(root, label) == 0 {
        assert!(Instant::now() < deadline, "{label} never ran: {:?}", calls(root));
        thread::sleep(Duration::from_millis(50));
    }
}

fn send_sigterm(pid: u32) {
    let status = Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .status()
        .unwrap();
    assert!(status.success());
}

fn add_module(root: &Path, name: &str, tests_body: &str) {
    let dir = root.join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(format!("tests_{name}.toml")), "").unwrap();
    fs::write(dir.join("tests.sh"), tests_body).unwrap();
}

fn systest_command(root: &Path, args: &[&str]) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_systest"));
    cmd.args(args)
        .env("builddir", root)
        .env("SHELL", "/bin/sh")
        .env("PERL", "/bin/sh")
        .env_remove("SYSTEST_NOCLEAN")
        .env_remove("SYSTEST_PRIORITY")
        .env_remove("SYSTEST_LOG_FILE");
    cmd
}

fn systest(root: &Path, args: &[&str]) -> Output {
    systest_command(root, args).output().unwrap()
}

fn leftovers(root: &Path) -> Vec<String> {
    fs::read_dir(root)
        .unwrap()
        .filter_map(Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains('_'))
        .collect()
}

#[test]
fn test_ports_lists_every_module() {
    let root = scratch_root();
    add_module(root.path(), "acl", "exit 0\n");
    add_module(root.path(), "xfer", "exit 0\n");

    let output = systest(root.path(), &["ports"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("2 modules, offset"));
    assert!(stdout.contains("acl/tests_acl.toml"));
    assert!(stdout.contains("xfer/tests_xfer.toml"));
}

#[test]
fn test_list_puts_priority_modules_first() {
    let root = scratch_root();
    add_module(root.path(), "acl", "exit 0\n");
    add_module(root.path(), "rpz", "exit 0\n");

    let output = systest(root.path(), &["list"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines, vec!["* rpz/tests_rpz.toml", "  acl/tests_acl.toml"]);
}

#[test]
fn test_parallel_run_passes_and_cleans_up() {
    let root = scratch_root();
    add_module(root.path(), "acl", "exit 0\n");
    add_module(root.path(), "dnstap", "exit 0\n");
    add_module(root.path(), "xfer", "exit 0\n");

    let output = systest(root.path(), &["run", "-n", "2"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "stdout: {stdout}");
    assert!(stdout.contains("3 modules: 3 passed, 0 failed, 0 skipped, 0 error"));
    assert!(leftovers(root.path()).is_empty());
}

#[test]
fn test_failed_module_fails_run_and_keeps_workspace() {
    let root = scratch_root();
    add_module(root.path(), "acl", "exit 0\n");
    add_module(root.path(), "xfer", "echo broken\nexit 1\n");

    let output = systest(root.path(), &["run"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!output.status.success());
    assert!(stdout.contains("2 modules: 1 passed, 1 failed, 0 skipped, 0 error"));
    assert!(stdout.contains("FAILED   xfer/tests_xfer.toml"));

    let kept = leftovers(root.path());
    assert!(kept.iter().any(|name| name == "xfer_xfer"));
    assert!(kept.iter().any(|name| name.starts_with("xfer_tmp_")));
    assert!(!kept.iter().any(|name| name.starts_with("acl_")));
}

#[test]
fn test_filters_restrict_the_run() {
    let root = scratch_root();
    add_module(root.path(), "acl", "exit 0\n");
    add_module(root.path(), "xfer", "exit 1\n");

    let output = systest(root.path(), &["run", "acl"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "stdout: {stdout}");
    assert!(stdout.contains("1 modules: 1 passed"));
}

#[test]
fn test_missing_builddir_is_an_error() {
    let output = Command::new(env!("CARGO_BIN_EXE_systest"))
        .arg("ports")
        .env_remove("builddir")
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn test_sigterm_to_worker_still_stops_servers() {
    let root = scratch_root();
    add_module(root.path(), "xfer", "sleep 20\nexit 0\n");

    let started = Instant::now();
    let child = systest_command(root.path(), &["worker"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    wait_for_call(root.path(), "start");
    send_sigterm(child.id());

    let output = child.wait_with_output().unwrap();
    assert!(started.elapsed() < Duration::from_secs(15));
    // Exited on its own rather than being killed by the signal.
    assert_eq!(output.status.code(), Some(1));
    assert_eq!(count(root.path(), "stop"), 1);
    assert_eq!(count(root.path(), "cores"), 1);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("xfer/tests_xfer.toml"), "stdout: {stdout}");
}

#[test]
fn test_sigterm_to_run_is_forwarded_to_workers() {
    let root = scratch_root();
    add_module(root.path(), "xfer", "sleep 20\nexit 0\n");

    let started = Instant::now();
    let child = systest_command(root.path(), &["run"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    wait_for_call(root.path(), "start");
    send_sigterm(child.id());

    let output = child.wait_with_output().unwrap();
    assert!(started.elapsed() < Duration::from_secs(15));
    assert_eq!(output.status.code(), Some(1));
    assert_eq!(count(root.path(), "stop"), 1);
    assert_eq!(count(root.path(), "cores"), 1);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("1 modules:"), "stdout: {stdout}");
}
