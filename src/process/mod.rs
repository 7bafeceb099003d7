//! External process invocation.
//!
//! All orchestrated binaries are driven through here: short-lived CLI calls
//! via [`CommandRunner::run`], and the few genuinely long-running children we
//! own ourselves (the mock object-store server) via [`SpawnedProcess`].

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::process::Command;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::CommandError;
use crate::Result;

/// Indent every line of a (possibly multi-line) blob so captured subprocess
/// output stays readable inside error messages and logs.
pub(crate) fn indent(text: &str) -> String {
    text.trim_end()
        .lines()
        .map(|line| format!("  {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// One CLI invocation: binary, arguments, environment extras and limits.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub binary: PathBuf,
    pub args: Vec<String>,
    /// Caller-supplied variables; these win over the runner's fixed set
    pub extra_env: HashMap<String, String>,
    pub timeout: Option<Duration>,
    /// Convert non-zero exit into [`CommandError::Failed`]
    pub strict: bool,
}

impl RunSpec {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            extra_env: HashMap::new(),
            timeout: None,
            strict: true,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn no_strict(mut self) -> Self {
        self.strict = false;
        self
    }

    fn display(&self) -> String {
        let mut rendered = self.binary.display().to_string();
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(arg);
        }
        rendered
    }
}

/// Captured result of a finished invocation.
#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: ExitStatus,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Runs CLI tools with a fixed environment base.
///
/// Every invocation merges, in order of increasing priority: the parent
/// environment, the cluster root and distribution directory, the optional
/// log-verbosity override, and the caller's extras.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    cluster_root: PathBuf,
    dist_dir: PathBuf,
    log_filter: Option<String>,
}

impl CommandRunner {
    pub fn new(cluster_root: impl Into<PathBuf>, dist_dir: impl Into<PathBuf>) -> Self {
        Self {
            cluster_root: cluster_root.into(),
            dist_dir: dist_dir.into(),
            log_filter: None,
        }
    }

    pub fn with_log_filter(mut self, filter: Option<String>) -> Self {
        self.log_filter = filter;
        self
    }

    pub fn cluster_root(&self) -> &Path {
        &self.cluster_root
    }

    /// Run one invocation to completion, capturing stdout and stderr.
    ///
    /// With `strict`, a non-zero exit becomes [`CommandError::Failed`]. A
    /// timeout kills the child and becomes [`CommandError::TimedOut`] with
    /// whatever output was produced before the deadline.
    pub async fn run(&self, spec: RunSpec) -> Result<CommandOutput> {
        let rendered = spec.display();
        info!("Running command \"{rendered}\"");

        let mut command = Command::new(&spec.binary);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("CLUSTER_ROOT", &self.cluster_root)
            .env("DIST_DIR", &self.dist_dir);
        if let Some(filter) = &self.log_filter {
            command.env("RUST_LOG", filter);
        }
        for (key, value) in &spec.extra_env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| CommandError::Spawn {
            command: rendered.clone(),
            source,
        })?;

        // Drain both pipes concurrently so a chatty child cannot deadlock on
        // a full pipe buffer while we wait for exit.
        let mut stdout_pipe = child.stdout.take().expect("stdout was piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr was piped");
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stdout_pipe.read_to_end(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr_pipe.read_to_end(&mut buf).await;
            buf
        });

        let status = match spec.timeout {
            None => child.wait().await.map_err(|source| CommandError::Spawn {
                command: rendered.clone(),
                source,
            })?,
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(waited) => waited.map_err(|source| CommandError::Spawn {
                    command: rendered.clone(),
                    source,
                })?,
                Err(_elapsed) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    let stdout = collect(stdout_task).await;
                    let stderr = collect(stderr_task).await;
                    warn!("CLI timeout: stderr={stderr}, stdout={stdout}");
                    return Err(CommandError::TimedOut {
                        command: rendered,
                        timeout: limit,
                        stdout: indent(&stdout),
                        stderr: indent(&stderr),
                    }
                    .into());
                }
            },
        };

        let stdout = collect(stdout_task).await;
        let stderr = collect(stderr_task).await;

        if status.success() {
            let stripped = stdout.trim();
            if stripped.lines().count() < 2 {
                debug!("Run {rendered} success: {stripped}");
            } else {
                debug!("Run {rendered} success:\n{}", indent(stripped));
            }
        } else if spec.strict {
            return Err(CommandError::Failed {
                command: rendered,
                status,
                stdout: indent(&stdout),
                stderr: indent(&stderr),
            }
            .into());
        }

        Ok(CommandOutput {
            stdout,
            stderr,
            status,
        })
    }
}

async fn collect(task: tokio::task::JoinHandle<Vec<u8>>) -> String {
    match task.await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => String::new(),
    }
}

/// A long-running child process owned by the harness.
///
/// Killed on drop, so an aborted test cannot leak it.
#[derive(Debug)]
pub struct SpawnedProcess {
    command: String,
    child: Child,
}

impl SpawnedProcess {
    /// Spawn without waiting. The child inherits stdout/stderr so its logs
    /// land in the test output like any other fixture noise.
    pub fn spawn(binary: impl AsRef<Path>, args: &[String]) -> Result<Self> {
        let rendered = format!("{} {}", binary.as_ref().display(), args.join(" "));
        let child = Command::new(binary.as_ref())
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::Spawn {
                command: rendered.clone(),
                source,
            })?;
        Ok(Self {
            command: rendered,
            child,
        })
    }

    /// Exit status if the child already terminated.
    pub fn try_exit_status(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!("kill {}: {e}", self.command);
        }
    }
}

#[cfg(test)]
mod process_test;
