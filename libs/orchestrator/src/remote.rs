//! Remote execution capability.
//!
//! Backends drive their host through [`RemoteExec`]: run a command, capture
//! its output, test a condition, or write a file. [`SshRemote`] shells out to the system `ssh`
//! client; [`MockRemote`] records calls for tests.

use std::process::{Output, Stdio};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};
use crate::lock_unpoisoned;

/// Command execution against one fixed remote host.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Host this capability is bound to.
    fn host(&self) -> &str;

    /// Run a command for its side effects. Non-zero exit is an error.
    async fn run(&self, command: &str) -> Result<()>;

    /// Run a command and return its standard output.
    async fn capture(&self, command: &str) -> Result<String>;

    /// Run a test command. `Ok(false)` means it ran and exited non-zero.
    async fn check(&self, command: &str) -> Result<bool>;

    /// Write `content` to `path` on the host.
    async fn copy(&self, path: &str, content: &str) -> Result<()>;
}

/// Quote a string for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Remote execution over the system SSH client.
#[derive(Debug, Clone)]
pub struct SshRemote {
    ssh_bin: String,
    host: String,
    user: String,
    sudo: bool,
}

impl SshRemote {
    /// Bind to `user@host`; with `sudo` every command runs as root.
    pub fn new(ssh_bin: &str, host: &str, user: &str, sudo: bool) -> Self {
        Self {
            ssh_bin: ssh_bin.to_string(),
            host: host.to_string(),
            user: user.to_string(),
            sudo,
        }
    }

    /// The command line handed to the remote login shell.
    fn remote_command(&self, command: &str) -> String {
        if self.sudo {
            format!("sudo sh -c {}", shell_quote(command))
        } else {
            format!("sh -c {}", shell_quote(command))
        }
    }

    async fn output(&self, command: &str, stdin: Option<&str>) -> Result<Output> {
        debug!(host = %self.host, command = %command, "Running remote command");

        let mut child = Command::new(&self.ssh_bin)
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(format!("{}@{}", self.user, self.host))
            .arg(self.remote_command(command))
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.error(command, format!("failed to spawn {}: {e}", self.ssh_bin)))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|e| self.error(command, format!("failed to write stdin: {e}")))?;
            // Close stdin so the remote side sees EOF.
            drop(pipe);
        }

        child
            .wait_with_output()
            .await
            .map_err(|e| self.error(command, e.to_string()))
    }

    async fn execute(&self, command: &str, stdin: Option<&str>) -> Result<String> {
        let output = self.output(command, stdin).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = match stderr.trim() {
                "" => format!("exited with {}", output.status),
                trimmed => trimmed.to_string(),
            };
            return Err(self.error(command, message));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn error(&self, command: &str, message: String) -> Error {
        Error::Remote {
            host: self.host.clone(),
            command: command.to_string(),
            message,
        }
    }
}

#[async_trait]
impl RemoteExec for SshRemote {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, command: &str) -> Result<()> {
        self.execute(command, None).await.map(|_| ())
    }

    async fn capture(&self, command: &str) -> Result<String> {
        self.execute(command, None).await
    }

    async fn check(&self, command: &str) -> Result<bool> {
        let output = self.output(command, None).await?;
        // ssh reserves 255 for its own failures.
        match output.status.code() {
            Some(0) => Ok(true),
            Some(255) | None => Err(self.error(
                command,
                format!("ssh failed with {}", output.status),
            )),
            Some(_) => Ok(false),
        }
    }

    async fn copy(&self, path: &str, content: &str) -> Result<()> {
        let command = format!("cat > {}", shell_quote(path));
        self.execute(&command, Some(content)).await.map(|_| ())
    }
}

/// A call observed by [`MockRemote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    Run(String),
    Capture(String),
    Check(String),
    Copy { path: String, content: String },
}

impl RemoteCall {
    /// Command text, or the destination path for copies.
    pub fn text(&self) -> &str {
        match self {
            Self::Run(command) | Self::Capture(command) | Self::Check(command) => command,
            Self::Copy { path, .. } => path,
        }
    }
}

/// Recording remote for tests and development.
///
/// Captures answer with the most recently registered response whose pattern
/// is contained in the command, or an empty string. Checks fail unless
/// registered with [`MockRemote::pass`].
#[derive(Debug, Default)]
pub struct MockRemote {
    host: String,
    calls: Mutex<Vec<RemoteCall>>,
    responses: Mutex<Vec<(String, String)>>,
    passing: Mutex<Vec<String>>,
    failures: Mutex<Vec<String>>,
}

impl MockRemote {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            ..Default::default()
        }
    }

    /// Answer captures containing `pattern` with `output`.
    pub fn respond(&self, pattern: &str, output: &str) -> &Self {
        lock_unpoisoned(&self.responses).push((pattern.to_string(), output.to_string()));
        self
    }

    /// Let checks containing `pattern` succeed.
    pub fn pass(&self, pattern: &str) -> &Self {
        lock_unpoisoned(&self.passing).push(pattern.to_string());
        self
    }

    /// Fail every call whose command or path contains `pattern`.
    pub fn fail_on(&self, pattern: &str) -> &Self {
        lock_unpoisoned(&self.failures).push(pattern.to_string());
        self
    }

    /// Every call in order.
    pub fn calls(&self) -> Vec<RemoteCall> {
        lock_unpoisoned(&self.calls).clone()
    }

    /// Text of every run, capture and check, in order.
    pub fn commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RemoteCall::Run(command)
                | RemoteCall::Capture(command)
                | RemoteCall::Check(command) => Some(command),
                RemoteCall::Copy { .. } => None,
            })
            .collect()
    }

    /// Number of runs, captures and checks containing `pattern`.
    pub fn count_matching(&self, pattern: &str) -> usize {
        self.commands()
            .iter()
            .filter(|command| command.contains(pattern))
            .count()
    }

    /// Last content copied to `path`.
    pub fn copied(&self, path: &str) -> Option<String> {
        self.calls().into_iter().rev().find_map(|call| match call {
            RemoteCall::Copy {
                path: copied,
                content,
            } if copied == path => Some(content),
            _ => None,
        })
    }

    fn record(&self, call: RemoteCall) -> Result<()> {
        let text = call.text().to_string();
        lock_unpoisoned(&self.calls).push(call);

        let failing = lock_unpoisoned(&self.failures)
            .iter()
            .any(|pattern| text.contains(pattern.as_str()));
        if failing {
            return Err(Error::Remote {
                host: self.host.clone(),
                command: text,
                message: "mock failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteExec for MockRemote {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, command: &str) -> Result<()> {
        self.record(RemoteCall::Run(command.to_string()))
    }

    async fn capture(&self, command: &str) -> Result<String> {
        self.record(RemoteCall::Capture(command.to_string()))?;
        let responses = lock_unpoisoned(&self.responses);
        Ok(responses
            .iter()
            .rev()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default())
    }

    async fn check(&self, command: &str) -> Result<bool> {
        self.record(RemoteCall::Check(command.to_string()))?;
        Ok(lock_unpoisoned(&self.passing)
            .iter()
            .any(|pattern| command.contains(pattern.as_str())))
    }

    async fn copy(&self, path: &str, content: &str) -> Result<()> {
        self.record(RemoteCall::Copy {
            path: path.to_string(),
            content: content.to_string(),
        })
    }
}
