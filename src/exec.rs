//! Bounded external command execution.
//!
//! Every external call the watchdog makes (journalctl, ssh, virsh, the stack
//! decoder) goes through [`BoundedCommand`]. The child is spawned in its own
//! process group; when its deadline passes the whole group is killed, so an
//! `ssh` stuck on a dead host can never hold a pass past its bound.
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Default bound for journal queries.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Captured result of a command that ran to completion.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code (None if killed by signal).
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Errors from running a bounded command.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} did not finish within {}s", .after.as_secs())]
    Timeout { program: String, after: Duration },
    #[error("I/O error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ExecError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecError::Timeout { .. })
    }
}

/// An external command with an explicit deadline.
#[derive(Debug, Clone)]
pub struct BoundedCommand {
    program: String,
    args: Vec<String>,
    stdin: Option<PathBuf>,
    timeout: Duration,
}

impl BoundedCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            timeout: DEFAULT_TIMEOUT,
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

    /// Feed the given file to the child's stdin.
    pub fn stdin_file(mut self, path: &Path) -> Self {
        self.stdin = Some(path.to_path_buf());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// The full command line, for log messages.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run the command to completion or until its deadline.
    ///
    /// A non-zero exit is not an error here; callers inspect
    /// [`CommandOutput::status`]. Only spawn failures, I/O failures and
    /// deadline expiry are errors.
    pub async fn run(&self) -> Result<CommandOutput, ExecError> {
        let stdin = match &self.stdin {
            Some(path) => Stdio::from(std::fs::File::open(path).map_err(|e| ExecError::Io {
                program: self.program.clone(),
                source: e,
            })?),
            None => Stdio::null(),
        };

        tracing::debug!(command = %self.command_line(), timeout_secs = self.timeout.as_secs(), "running external command");

        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0) // New process group so a timeout can kill the whole tree
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::Spawn {
                program: self.program.clone(),
                source: e,
            })?;

        let pid = child.id();

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                status: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Ok(Err(e)) => Err(ExecError::Io {
                program: self.program.clone(),
                source: e,
            }),
            Err(_) => {
                if let Some(pid) = pid {
                    kill_group(pid);
                }
                tracing::warn!(
                    command = %self.command_line(),
                    timeout_secs = self.timeout.as_secs(),
                    "external command timed out, killed its process group"
                );
                Err(ExecError::Timeout {
                    program: self.program.clone(),
                    after: self.timeout,
                })
            }
        }
    }
}

fn kill_group(pid: u32) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        tracing::debug!(pid, error = %e, "failed to kill timed-out process group");
    }
}
