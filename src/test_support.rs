//! Test support utilities shared across unit and integration tests.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tracing_subscriber::fmt::MakeWriter;

use crate::exec::{CommandOutput, CommandRunner, CommandSpec, ExecError, Executor, RunnerFuture};
use crate::session::Session;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Debug)]
enum ScriptedResponse {
    Output(CommandOutput),
    Timeout,
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
/// Clones share the same queue and invocation log.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<ScriptedResponse>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Unmasked argument values.
    pub args: Vec<String>,
    /// Unmasked environment assignments.
    pub envs: Vec<(String, String)>,
    /// Masked rendering as it would appear in logs.
    pub rendered: String,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }

    /// Returns `true` when the argument list contains `needle` verbatim.
    #[must_use]
    pub fn has_arg(&self, needle: &str) -> bool {
        self.args.iter().any(|arg| arg == needle)
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Number of responses not yet consumed.
    #[must_use]
    pub fn pending(&self) -> usize {
        lock(&self.responses).len()
    }

    fn push(&self, response: ScriptedResponse) {
        lock(&self.responses).push_back(response);
    }

    /// Pushes a successful exit status with empty output.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a successful exit status with `stdout`.
    pub fn push_stdout(&self, stdout: impl Into<String>) {
        self.push_output(Some(0), stdout, "");
    }

    /// Pushes a successful exit status whose stdout is `value` as JSON.
    pub fn push_json(&self, value: &serde_json::Value) {
        self.push_stdout(value.to_string());
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32, stderr: impl Into<String>) {
        self.push_output(Some(code), "", stderr);
    }

    /// Pushes a runner-level timeout.
    pub fn push_timeout(&self) {
        self.push(ScriptedResponse::Timeout);
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.push(ScriptedResponse::Output(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }));
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, spec: &'a CommandSpec) -> RunnerFuture<'a> {
        lock(&self.invocations).push(CommandInvocation {
            program: spec.program.clone(),
            args: spec.args.iter().map(|arg| arg.value().to_owned()).collect(),
            envs: spec
                .envs
                .iter()
                .map(|(key, value)| (key.clone(), value.value().to_owned()))
                .collect(),
            rendered: spec.render(false),
        });
        let next = lock(&self.responses).pop_front();
        Box::pin(async move {
            match next {
                Some(ScriptedResponse::Output(output)) => Ok(output),
                Some(ScriptedResponse::Timeout) => Err(ExecError::Timeout {
                    command: spec.render(false),
                    timeout_secs: spec.timeout.map_or(0, |limit| limit.as_secs()),
                }),
                None => Err(ExecError::Spawn {
                    command: spec.render(false),
                    message: String::from("no scripted response available"),
                }),
            }
        })
    }
}

/// Executor over `runner` with a fresh session that masks secrets.
#[must_use]
pub fn scripted_executor(runner: &ScriptedRunner) -> Executor {
    Executor::new(Arc::new(runner.clone()), Arc::new(Session::new(false)))
}

/// RFC 3339 timestamp `hours` in the past.
#[must_use]
pub fn hours_ago(hours: i64) -> String {
    (Utc::now() - chrono::Duration::hours(hours) - chrono::Duration::minutes(1)).to_rfc3339()
}

/// In-memory sink for `tracing` output.
#[derive(Clone, Debug, Default)]
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

/// Writer handed out by [`LogCapture`].
#[derive(Debug)]
pub struct LogCaptureWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl io::Write for LogCaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.buffer).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogCaptureWriter {
            buffer: Arc::clone(&self.buffer),
        }
    }
}

impl LogCapture {
    /// Creates an empty capture.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscriber writing every event at `DEBUG` or above into this capture.
    #[must_use]
    pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync + use<> {
        tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .finish()
    }

    /// Everything written so far.
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&lock(&self.buffer)).into_owned()
    }
}
