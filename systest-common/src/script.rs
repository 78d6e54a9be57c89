//! Invocation of external lifecycle scripts.
//!
//! Scripts run to completion in the module workspace with the module's
//! port environment. Stdout and stderr share one pipe, so the log shows
//! them interleaved in the order the script wrote them, streamed line by
//! line while the process runs. A missing script, a non-zero exit, a timeout and an
//! interruption are distinct results; deciding what each means for the
//! lifecycle is left to the caller.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{Span, debug, info, warn};

/// Lines of output kept for failure messages.
const OUTPUT_TAIL_LINES: usize = 20;
const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// How long output readers may lag behind the exit of their script.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Errors from a single script invocation.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("script {} not found", path.display())]
    NotFound { path: PathBuf },

    #[error("script {} exited with {exit_code}", path.display())]
    Failed {
        path: PathBuf,
        exit_code: i32,
        output_tail: Vec<String>,
    },

    #[error("script {} timed out after {timeout:?}", path.display())]
    TimedOut { path: PathBuf, timeout: Duration },

    #[error("script {} interrupted", path.display())]
    Interrupted { path: PathBuf },

    #[error("failed to spawn {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ScriptError {
    /// Exit code to report; timeouts use the conventional 124.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Failed { exit_code, .. } => Some(*exit_code),
            Self::TimedOut { .. } => Some(124),
            _ => None,
        }
    }
}

/// Shared flag set when the run is asked to stop.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of a script that exited successfully.
#[derive(Debug, Clone)]
pub struct ScriptRun {
    pub duration: Duration,
    pub output_tail: Vec<String>,
}

/// One script call.
#[derive(Debug, Clone)]
pub struct ScriptInvocation {
    pub interpreter: PathBuf,
    pub script: PathBuf,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
    pub interrupt: Option<InterruptFlag>,
}

impl ScriptInvocation {
    pub fn new(interpreter: impl Into<PathBuf>, script: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            script: script.into(),
            args: Vec::new(),
            timeout: None,
            interrupt: None,
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Kill the script if `flag` is set while it runs.
    pub fn interruptible(mut self, flag: &InterruptFlag) -> Self {
        self.interrupt = Some(flag.clone());
        self
    }
}

/// Per-module context for running scripts.
///
/// Carries the workspace that relative script paths are resolved against,
/// so no process-global "current workspace" exists.
#[derive(Debug, Clone)]
pub struct ScriptContext {
    workspace: PathBuf,
    env: Vec<(String, String)>,
}

impl ScriptContext {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(vars);
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    /// Relative paths resolve against the parent of the workspace, where
    /// lifecycle scripts live next to (not inside) the per-run copy.
    pub fn resolve(&self, script: &Path) -> PathBuf {
        if script.is_absolute() {
            return script.to_path_buf();
        }
        self.workspace
            .parent()
            .unwrap_or(&self.workspace)
            .join(script)
    }

    /// Run a script to completion with cwd = workspace.
    pub fn run(&self, invocation: &ScriptInvocation) -> Result<ScriptRun, ScriptError> {
        let path = self.resolve(&invocation.script);
        if !path.exists() {
            debug!(
                script = %path.display(),
                workdir = %self.workspace.display(),
                "script not found"
            );
            return Err(ScriptError::NotFound { path });
        }

        debug!(
            "running script: {} {} {}",
            invocation.interpreter.display(),
            path.display(),
            invocation.args.join(" ")
        );
        debug!("  workdir: {}", self.workspace.display());

        let spawn_error = |source| ScriptError::Spawn {
            path: path.clone(),
            source,
        };
        let (output, writer) = std::io::pipe().map_err(spawn_error)?;
        let stderr_writer = writer.try_clone().map_err(spawn_error)?;

        let start = Instant::now();
        let mut cmd = Command::new(&invocation.interpreter);
        cmd.arg(&path)
            .args(&invocation.args)
            .current_dir(&self.workspace)
            .stdin(Stdio::null())
            .stdout(writer)
            .stderr(stderr_writer);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let spawned = cmd.spawn();
        // The reader only sees EOF once no write end is left in this process.
        drop(cmd);
        let mut child = spawned.map_err(spawn_error)?;
        let output_tail = spawn_reader(output);

        // Background children of a script may hold the pipe open after it
        // exits; readers of killed scripts are never waited for.
        let status = match wait_for_exit(&mut child, invocation, start) {
            WaitResult::Exited(status) => status,
            WaitResult::TimedOut(timeout) => {
                warn!(script = %path.display(), ?timeout, "script timed out, killed");
                return Err(ScriptError::TimedOut { path, timeout });
            }
            WaitResult::Interrupted => {
                warn!(script = %path.display(), "script killed after interruption");
                return Err(ScriptError::Interrupted { path });
            }
            WaitResult::WaitFailed(source) => return Err(ScriptError::Spawn { path, source }),
        };

        let output_tail = collect_tail(&output_tail);
        let exit_code = exit_code(status);
        if exit_code != 0 {
            return Err(ScriptError::Failed {
                path,
                exit_code,
                output_tail,
            });
        }
        debug!("  exited with {exit_code}");
        Ok(ScriptRun {
            duration: start.elapsed(),
            output_tail,
        })
    }
}

enum WaitResult {
    Exited(ExitStatus),
    TimedOut(Duration),
    Interrupted,
    WaitFailed(std::io::Error),
}

fn wait_for_exit(child: &mut Child, invocation: &ScriptInvocation, start: Instant) -> WaitResult {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return WaitResult::Exited(status),
            Ok(None) => {}
            Err(err) => return WaitResult::WaitFailed(err),
        }

        if let Some(timeout) = invocation.timeout
            && start.elapsed() >= timeout
        {
            let _ = child.kill();
            let _ = child.wait();
            return WaitResult::TimedOut(timeout);
        }

        if invocation
            .interrupt
            .as_ref()
            .is_some_and(InterruptFlag::is_set)
        {
            let _ = child.kill();
            let _ = child.wait();
            return WaitResult::Interrupted;
        }

        thread::sleep(POLL_INTERVAL);
    }
}

/// Log every line as it arrives; return the last few for error reports.
fn stream_lines<R: Read>(reader: R) -> VecDeque<String> {
    let mut reader = BufReader::new(reader);
    let mut tail = VecDeque::with_capacity(OUTPUT_TAIL_LINES);
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buffer);
                let line = line.trim_end_matches(['\n', '\r']);
                info!(target: "systest::script", "    {line}");
                if tail.len() == OUTPUT_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line.to_string());
            }
        }
    }
    tail
}

/// Reads on its own thread inside the caller's span, so script output lands
/// in the same module log as the lifecycle events around it.
fn spawn_reader<R: Read + Send + 'static>(reader: R) -> Receiver<VecDeque<String>> {
    let (tx, rx) = mpsc::channel();
    let span = Span::current();
    thread::spawn(move || {
        let _entered = span.enter();
        let _ = tx.send(stream_lines(reader));
    });
    rx
}

fn collect_tail(tail: &Receiver<VecDeque<String>>) -> Vec<String> {
    match tail.recv_timeout(READER_GRACE) {
        Ok(lines) => Vec::from(lines),
        Err(_) => {
            debug!("script output still open after exit, not waiting for it");
            Vec::new()
        }
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
