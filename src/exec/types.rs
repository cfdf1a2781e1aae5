//! Command descriptions, masked rendering, and the runner abstraction.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use camino::Utf8PathBuf;
use tokio::process::Command;

use super::ExecError;

/// Placeholder rendered in place of secret values unless secrets are shown.
pub const MASK: &str = "xxxxxxxx";

/// A single command-line value with an optional masked display form.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandArg {
    value: String,
    display: Option<String>,
}

impl CommandArg {
    /// Creates an argument that is displayed verbatim.
    #[must_use]
    pub fn plain(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            display: None,
        }
    }

    /// Creates an argument whose log rendering is replaced by `display`.
    #[must_use]
    pub fn masked(value: impl Into<String>, display: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            display: Some(display.into()),
        }
    }

    /// Creates an argument rendered as [`MASK`] in logs.
    #[must_use]
    pub fn secret(value: impl Into<String>) -> Self {
        Self::masked(value, MASK)
    }

    /// Value passed to the process.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Value written to logs and error messages.
    #[must_use]
    pub fn display(&self, show_secrets: bool) -> &str {
        match &self.display {
            Some(display) if !show_secrets => display,
            _ => &self.value,
        }
    }
}

impl From<&str> for CommandArg {
    fn from(value: &str) -> Self {
        Self::plain(value)
    }
}

impl From<String> for CommandArg {
    fn from(value: String) -> Self {
        Self::plain(value)
    }
}

impl From<&String> for CommandArg {
    fn from(value: &String) -> Self {
        Self::plain(value.as_str())
    }
}

/// Full description of a local process invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandSpec {
    /// Program to execute, resolved through `PATH`.
    pub program: String,
    /// Arguments in order.
    pub args: Vec<CommandArg>,
    /// Extra environment variables for the child process.
    pub envs: Vec<(String, CommandArg)>,
    /// Upper bound on the wall-clock duration of the process.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    /// Starts a command for `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            timeout: None,
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<CommandArg>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<CommandArg>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Appends an argument rendered as [`MASK`].
    #[must_use]
    pub fn secret_arg(self, value: impl Into<String>) -> Self {
        self.arg(CommandArg::secret(value))
    }

    /// Sets an environment variable for the child.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<CommandArg>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Bounds the process run time.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Renders the command for logs.
    ///
    /// Spaces and quotes are backslash-escaped. For `ssh` invocations the
    /// remote command (the final argument) is wrapped in double quotes with
    /// only embedded double quotes escaped. Environment assignments are
    /// rendered as `KEY=value` prefixes and honour masking like arguments.
    #[must_use]
    pub fn render(&self, show_secrets: bool) -> String {
        let quote_last = self.program == "ssh" && !self.args.is_empty();
        let last = self.args.len().saturating_sub(1);
        let mut parts: Vec<String> = self
            .envs
            .iter()
            .map(|(key, value)| format!("{key}={}", escape_display(value.display(show_secrets))))
            .collect();
        parts.push(escape_display(&self.program));
        for (index, arg) in self.args.iter().enumerate() {
            let shown = arg.display(show_secrets);
            if quote_last && index == last {
                parts.push(format!("\"{}\"", shown.replace('"', "\\\"")));
            } else {
                parts.push(escape_display(shown));
            }
        }
        parts.join(" ")
    }
}

fn escape_display(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, ' ' | '\'' | '"') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Boxed future returned by [`CommandRunner::run`].
pub type RunnerFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CommandOutput, ExecError>> + Send + 'a>>;

/// Abstraction over process execution so tests can script responses.
pub trait CommandRunner: Send + Sync {
    /// Runs `spec`, capturing stdout and stderr.
    ///
    /// A non-zero exit status is reported through [`CommandOutput::code`],
    /// not as an error.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Spawn`] when the process cannot be started and
    /// [`ExecError::Timeout`] when it outlives [`CommandSpec::timeout`].
    fn run<'a>(&'a self, spec: &'a CommandSpec) -> RunnerFuture<'a>;
}

/// Runner that spawns real processes on the host.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(&'a self, spec: &'a CommandSpec) -> RunnerFuture<'a> {
        Box::pin(async move {
            let mut command = Command::new(&spec.program);
            command
                .args(spec.args.iter().map(CommandArg::value))
                .envs(spec.envs.iter().map(|(key, value)| (key.as_str(), value.value())))
                .stdin(Stdio::null())
                .kill_on_drop(true);

            let pending = command.output();
            let result = match spec.timeout {
                Some(limit) => tokio::time::timeout(limit, pending)
                    .await
                    .map_err(|_| ExecError::Timeout {
                        command: spec.render(false),
                        timeout_secs: limit.as_secs(),
                    })?,
                None => pending.await,
            };
            let output = result.map_err(|err| ExecError::Spawn {
                command: spec.render(false),
                message: err.to_string(),
            })?;

            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}

/// SSH endpoint of a provisioned VM.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshTarget {
    /// Login user on the VM.
    pub user: String,
    /// Address the VM is reachable at.
    pub host: String,
    /// Private key used for authentication.
    pub identity_file: Utf8PathBuf,
}

impl SshTarget {
    /// `user@host` form used by `ssh` and `scp`.
    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    pub(crate) fn common_options(&self) -> Vec<CommandArg> {
        [
            "-i",
            self.identity_file.as_str(),
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "IdentitiesOnly=yes",
        ]
        .into_iter()
        .map(CommandArg::plain)
        .collect()
    }
}

/// Direction of an `scp` transfer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CopyDirection {
    /// From the local machine to the VM.
    ToRemote,
    /// From the VM to the local machine.
    FromRemote,
}
