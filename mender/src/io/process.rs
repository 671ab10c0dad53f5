//! Supervised child-process execution with timeouts and bounded output.

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::error::OrchestratorError;
use crate::io::discover::TestTarget;

/// One completed supervised run.
///
/// Only produced when the child actually started; a spawn failure surfaces
/// as [`OrchestratorError::ExecutionInfrastructure`] instead, so callers can
/// tell "the tests failed" apart from "the test machinery failed".
#[derive(Debug, Clone, PartialEq)]
pub struct TestRun {
    /// Exit code 0 and no timeout.
    pub passed: bool,
    /// Captured stdout followed by stderr, with truncation notices.
    pub output: String,
    /// Wall-clock duration; reported as the configured bound on timeout.
    pub duration: Duration,
    pub timed_out: bool,
}

/// Abstraction over test execution backends.
///
/// The production implementation spawns the configured interpreter; tests
/// use scripted runners that return predetermined outcomes without
/// spawning processes.
pub trait TestRunner {
    fn run(&self, target: &TestTarget) -> Result<TestRun>;
}

/// Runner that invokes the configured command with the test file as argument,
/// from the test file's containing directory.
#[derive(Debug, Clone)]
pub struct ProcessTestRunner {
    pub command: Vec<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl TestRunner for ProcessTestRunner {
    #[instrument(skip_all, fields(target = %target.name))]
    fn run(&self, target: &TestTarget) -> Result<TestRun> {
        let mut argv = self.command.clone();
        argv.push(target.test_path.display().to_string());
        let workdir = match target.test_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        run_supervised(&argv, workdir, None, self.timeout, self.output_limit_bytes)
    }
}

/// Run a command with a hard wall-clock timeout, capturing stdout and stderr
/// without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes`
/// bounds the amount of each stream stored in memory (bytes beyond this are
/// discarded while still draining the pipe). On timeout the child is killed
/// and reaped, and the combined output carries a recognizable
/// `[timed out after {N}s]` marker.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_supervised(
    command: &[String],
    workdir: &Path,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<TestRun> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("empty command"))?;
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(workdir);
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!(program = %program, "spawning child process");
    let start = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(source) => {
            error!(program = %program, err = %source, "failed to spawn command");
            return Err(OrchestratorError::ExecutionInfrastructure {
                command: program.clone(),
                source,
            }
            .into());
        }
    };

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin.write_all(input).context("write stdin")?;
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };
    // On timeout the run is reported as lasting exactly the enforced bound;
    // the elapsed kill-and-reap overhead is not the test's time.
    let duration = if timed_out { timeout } else { start.elapsed() };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    let mut output = String::new();
    output.push_str(&String::from_utf8_lossy(&stdout));
    if stdout_truncated > 0 {
        output.push_str(&format!("\n[stdout truncated {stdout_truncated} bytes]\n"));
    }
    output.push_str(&String::from_utf8_lossy(&stderr));
    if stderr_truncated > 0 {
        output.push_str(&format!("\n[stderr truncated {stderr_truncated} bytes]\n"));
    }
    if timed_out {
        output.push_str(&format!("\n[timed out after {}s]\n", timeout.as_secs()));
    }

    let passed = status.success() && !timed_out;
    debug!(exit_code = ?status.code(), timed_out, passed, "command finished");
    Ok(TestRun {
        passed,
        output,
        duration,
        timed_out,
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
