//! Local, remote, and file-transfer command execution with masked logging.
//!
//! Every vendor interaction in the crate goes through [`Executor`], which
//! wraps a [`CommandRunner`], enforces a timeout on every invocation, renders
//! commands with secrets masked, and turns non-zero exits into typed
//! [`ExecError`] values. Callers may mark a failure as fatal by attaching a
//! [`FatalCode`]; the binary maps that code to the process exit status.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;
use serde::de::DeserializeOwned;
use tracing::{debug, error};

use crate::session::Session;

mod error;
mod types;

pub use error::{ExecError, FailureKind, FatalCode};
pub use types::{
    CommandArg, CommandOutput, CommandRunner, CommandSpec, CopyDirection, MASK,
    ProcessCommandRunner, RunnerFuture, SshTarget,
};

/// Timeout applied to commands that do not carry their own.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Per-call behaviour of the executor.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ExecOptions {
    /// Suppresses the detailed error log on failure.
    pub quiet: bool,
    /// Marks a failure as fatal with the given exit code.
    pub fatal: Option<FatalCode>,
    /// Overrides the command's timeout.
    pub timeout: Option<Duration>,
    /// Turns a failed transfer into a logged error; only honoured by
    /// [`Executor::copy_file`].
    pub ignore_failure: bool,
}

impl ExecOptions {
    /// Default options: verbose, non-fatal, command timeout.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            quiet: false,
            fatal: None,
            timeout: None,
            ignore_failure: false,
        }
    }

    /// Suppresses error logging.
    #[must_use]
    pub const fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    /// Marks failures as fatal with `code`.
    #[must_use]
    pub const fn fatal(mut self, code: FatalCode) -> Self {
        self.fatal = Some(code);
        self
    }

    /// Bounds the invocation by `timeout`.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Logs transfer failures instead of returning them.
    #[must_use]
    pub const fn ignore_failure(mut self) -> Self {
        self.ignore_failure = true;
        self
    }
}

/// Runs commands on behalf of connectors.
#[derive(Clone)]
pub struct Executor {
    runner: Arc<dyn CommandRunner>,
    session: Arc<Session>,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Creates an executor over `runner` sharing `session`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, session: Arc<Session>) -> Self {
        Self { runner, session }
    }

    /// Convenience constructor that spawns real processes.
    #[must_use]
    pub fn with_process_runner(session: Arc<Session>) -> Self {
        Self::new(Arc::new(ProcessCommandRunner), session)
    }

    /// Shared session state.
    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Renders `spec` honouring the session's masking setting.
    #[must_use]
    pub fn render(&self, spec: &CommandSpec) -> String {
        spec.render(self.session.show_secrets())
    }

    /// Executes `spec` locally and returns its standard output.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Failed`] on a non-zero exit, or
    /// [`ExecError::Spawn`]/[`ExecError::Timeout`] from the runner. When
    /// `options.fatal` is set the error is wrapped in [`ExecError::Fatal`].
    pub async fn execute_local(
        &self,
        spec: &CommandSpec,
        options: ExecOptions,
    ) -> Result<String, ExecError> {
        let mut bounded = spec.clone();
        bounded.timeout = options
            .timeout
            .or(spec.timeout)
            .or(Some(DEFAULT_COMMAND_TIMEOUT));
        let rendered = self.render(&bounded);
        debug!(command = %rendered, "Command");

        let result = match self.runner.run(&bounded).await {
            Ok(output) if output.is_success() => return Ok(output.stdout),
            Ok(output) => {
                if !options.quiet {
                    error!(
                        command = %rendered,
                        return_code = ?output.code,
                        error_message = %output.stderr.trim_end(),
                        "Error executing command"
                    );
                }
                if options.fatal.is_some() {
                    debug!(stdout = %output.stdout.trim_end(), "output of failed command");
                }
                ExecError::Failed {
                    command: rendered,
                    code: output.code,
                    kind: FailureKind::classify(&output.stderr),
                    stderr: output.stderr,
                }
            }
            Err(err) => {
                if !options.quiet {
                    error!(command = %rendered, error = %err, "Error executing command");
                }
                err
            }
        };

        Err(match options.fatal {
            Some(code) => ExecError::Fatal {
                code,
                source: Box::new(result),
            },
            None => result,
        })
    }

    /// Executes `spec` locally and parses its standard output as JSON.
    ///
    /// # Errors
    ///
    /// Propagates [`Executor::execute_local`] errors and returns
    /// [`ExecError::InvalidResponse`] when the output is not valid JSON.
    pub async fn execute_json<T: DeserializeOwned>(
        &self,
        spec: &CommandSpec,
        options: ExecOptions,
    ) -> Result<T, ExecError> {
        let stdout = self.execute_local(spec, options).await?;
        serde_json::from_str(&stdout).map_err(|err| ExecError::InvalidResponse {
            command: self.render(spec),
            message: err.to_string(),
        })
    }

    /// Executes `command` on the VM at `target` over SSH.
    ///
    /// # Errors
    ///
    /// Same as [`Executor::execute_local`] for the wrapping `ssh` process.
    pub async fn execute_remote(
        &self,
        target: &SshTarget,
        command: impl Into<CommandArg>,
        options: ExecOptions,
    ) -> Result<String, ExecError> {
        let spec = CommandSpec::new("ssh")
            .args(target.common_options())
            .arg(target.destination())
            .arg(command);
        self.execute_local(&spec, options).await
    }

    /// Transfers a file between the local machine and the VM with `scp`.
    ///
    /// # Errors
    ///
    /// Same as [`Executor::execute_local`]; with `options.ignore_failure`
    /// the failure is logged and `Ok(())` returned.
    pub async fn copy_file(
        &self,
        target: &SshTarget,
        local: &Utf8Path,
        remote: &str,
        direction: CopyDirection,
        options: ExecOptions,
    ) -> Result<(), ExecError> {
        let remote_url = format!("{}:{remote}", target.destination());
        let (from, to) = match direction {
            CopyDirection::ToRemote => (local.to_string(), remote_url),
            CopyDirection::FromRemote => (remote_url, local.to_string()),
        };
        let spec = CommandSpec::new("scp")
            .args(target.common_options())
            .arg(from)
            .arg(to);

        match self.execute_local(&spec, options).await {
            Ok(_) => Ok(()),
            Err(err) if options.ignore_failure => {
                if options.quiet {
                    error!(error = %err, "Error during file transfer");
                }
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests;
