//! Blocking subprocess orchestration.
//!
//! The external hydrology tools (TOPAZ, TauDEM, CLIGEN, WEPP) are plain
//! binaries launched per pipeline stage. [`ToolRunner`] is the seam the
//! controllers depend on; [`SystemToolRunner`] is the production
//! implementation driving `std::process::Command` with a kill-on-timeout
//! poll loop. Tests substitute a stub runner that fabricates outputs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Default wall-clock bound on a tool invocation.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(3600);

/// Poll interval while waiting for a child process.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Failures launching or completing an external tool.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The binary could not be spawned at all.
    #[error("failed to launch {binary}: {source}")]
    LaunchFailed {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    /// The process exceeded its timeout and was killed.
    #[error("{binary} timed out after {timeout:?}")]
    Timeout { binary: String, timeout: Duration },

    /// The process exited nonzero.
    #[error("{binary} exited with status {exit_code}: {stderr}")]
    NonzeroExit {
        binary: String,
        exit_code: i32,
        stderr: String,
    },
}

/// What to run and where.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// argv[0] plus arguments.
    pub argv: Vec<String>,
    /// Working directory for the child.
    pub cwd: PathBuf,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
    /// Wall-clock bound; the child is killed past this.
    pub timeout: Duration,
}

impl CommandSpec {
    /// Builds a spec with the default timeout and empty environment.
    pub fn new(argv: Vec<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            argv,
            cwd: cwd.into(),
            env: BTreeMap::new(),
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    fn binary(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("<empty>")
    }
}

/// Captured result of a completed tool invocation.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
}

/// Seam for launching external tools.
///
/// A successful return means exit code zero; nonzero exits, spawn
/// failures, and timeouts are all [`ToolError`].
pub trait ToolRunner: Send + Sync + 'static {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutcome, ToolError>;
}

/// Production runner over `std::process::Command`.
///
/// Stdout and stderr are piped and captured; the child is polled until
/// exit or timeout, and killed on timeout.
#[derive(Debug, Default, Clone)]
pub struct SystemToolRunner;

impl SystemToolRunner {
    pub fn new() -> Self {
        Self
    }
}

impl ToolRunner for SystemToolRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutcome, ToolError> {
        let binary = spec.binary().to_string();
        let started = Instant::now();
        let mut command = Command::new(&binary);
        command
            .args(spec.argv.get(1..).unwrap_or(&[]))
            .current_dir(&spec.cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null());
        for (k, v) in &spec.env {
            command.env(k, v);
        }
        let mut child = command.spawn().map_err(|source| ToolError::LaunchFailed {
            binary: binary.clone(),
            source,
        })?;

        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) => {
                    if started.elapsed() >= spec.timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(ToolError::Timeout {
                            binary,
                            timeout: spec.timeout,
                        });
                    }
                    std::thread::sleep(WAIT_POLL_INTERVAL);
                }
                Err(source) => {
                    return Err(ToolError::LaunchFailed { binary, source });
                }
            }
        }

        let output = child
            .wait_with_output()
            .map_err(|source| ToolError::LaunchFailed {
                binary: binary.clone(),
                source,
            })?;
        let outcome = CommandOutcome {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
            duration: started.elapsed(),
        };
        if outcome.exit_code != 0 {
            return Err(ToolError::NonzeroExit {
                binary,
                exit_code: outcome.exit_code,
                stderr: outcome.stderr,
            });
        }
        Ok(outcome)
    }
}

/// Runs `argv` in `cwd`, mapping every failure mode to [`ToolError`].
pub fn run_binary(
    runner: &dyn ToolRunner,
    argv: Vec<String>,
    cwd: &Path,
    timeout: Duration,
) -> Result<CommandOutcome, ToolError> {
    runner.run(&CommandSpec::new(argv, cwd).with_timeout(timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_successful_invocation_captures_stdout() {
        let cwd = tempdir().unwrap();
        let runner = SystemToolRunner::new();
        let outcome = run_binary(
            &runner,
            sh("echo delineation complete"),
            cwd.path(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.stdout.contains("delineation complete"));
    }

    #[test]
    fn test_nonzero_exit_is_an_error() {
        let cwd = tempdir().unwrap();
        let runner = SystemToolRunner::new();
        let err = run_binary(
            &runner,
            sh("echo boom >&2; exit 3"),
            cwd.path(),
            Duration::from_secs(5),
        )
        .unwrap_err();
        match err {
            ToolError::NonzeroExit {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, 3);
                assert!(stderr.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_timeout_kills_the_child() {
        let cwd = tempdir().unwrap();
        let runner = SystemToolRunner::new();
        let started = Instant::now();
        let err = run_binary(
            &runner,
            sh("sleep 30"),
            cwd.path(),
            Duration::from_millis(200),
        )
        .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_missing_binary_fails_to_launch() {
        let cwd = tempdir().unwrap();
        let runner = SystemToolRunner::new();
        let err = run_binary(
            &runner,
            vec!["definitely-not-a-binary-xyz".to_string()],
            cwd.path(),
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(matches!(err, ToolError::LaunchFailed { .. }));
    }

    #[test]
    fn test_child_runs_in_requested_cwd() {
        let cwd = tempdir().unwrap();
        let runner = SystemToolRunner::new();
        run_binary(
            &runner,
            sh("pwd > here.txt"),
            cwd.path(),
            Duration::from_secs(5),
        )
        .unwrap();
        let here = std::fs::read_to_string(cwd.path().join("here.txt")).unwrap();
        let written = std::fs::canonicalize(here.trim()).unwrap();
        assert_eq!(written, std::fs::canonicalize(cwd.path()).unwrap());
    }
}
