//! Waits and retries shared by every adapter.

use std::future::Future;
use std::net::IpAddr;

use camino::Utf8PathBuf;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{ComputeConfig, ConnectSettings};
use crate::context::RunContext;
use crate::exec::{CommandSpec, ExecError, ExecOptions, Executor, FailureKind, SshTarget};
use crate::janitor::{Janitor, StaleCandidate, SweepPolicy, SweepSummary};
use crate::probe::{ProbeOutcome, ProbeStep, Prober, RetryPolicy};
use crate::session::Session;

use super::ConnectorError;

/// Trivial command used to check that a VM accepts SSH sessions.
pub const SSH_PROBE_COMMAND: &str = "ls";

/// Builds the SSH endpoint of the VM tracked by `ctx`.
///
/// # Errors
///
/// Returns [`ConnectorError::Configuration`] when `remote_user` or
/// `private_key_file` is missing and [`ConnectorError::Creation`] when the
/// VM has no address yet.
pub fn ssh_target(config: &ComputeConfig, ctx: &RunContext) -> Result<SshTarget, ConnectorError> {
    let user = config.require("remote_user")?;
    let key = config.require("private_key_file")?;
    let host = ctx
        .public_ip
        .ok_or_else(|| ConnectorError::creation("virtual machine has no public address"))?;
    Ok(SshTarget {
        user: user.to_owned(),
        host: host.to_string(),
        identity_file: Utf8PathBuf::from(key),
    })
}

/// Parses an address reported by a vendor.
///
/// # Errors
///
/// Returns [`ConnectorError::Creation`] when `raw` is not an IP address.
pub fn parse_address(raw: &str) -> Result<IpAddr, ConnectorError> {
    raw.trim()
        .parse()
        .map_err(|_| ConnectorError::creation(format!("invalid address '{raw}'")))
}

/// Probes the VM over SSH until it answers or the retry rounds run out.
///
/// Records [`RunContext::ssh_ready_time`] on success.
pub async fn await_ssh(
    executor: &Executor,
    target: &SshTarget,
    settings: ConnectSettings,
    ctx: &mut RunContext,
) -> bool {
    let prober = Prober::new(
        RetryPolicy::ssh(settings.retries, settings.interval),
        "Virtual machine",
    );
    let options = ExecOptions::new().quiet().timeout(settings.probe_timeout);
    info!(host = %target.host, "Waiting for virtual machine to accept SSH connections");

    let outcome = prober
        .run(|attempt| async move {
            match executor
                .execute_remote(target, SSH_PROBE_COMMAND, options)
                .await
            {
                Ok(_) => ProbeStep::Ready(()),
                Err(err) => {
                    debug!(attempt, error = %err, "virtual machine not reachable yet");
                    ProbeStep::Retry(err)
                }
            }
        })
        .await;

    match outcome {
        ProbeOutcome::Ready { attempts, .. } => {
            ctx.ssh_ready_time = Some(Utc::now());
            info!(attempts, "Virtual machine is available");
            true
        }
        other => {
            error!(
                attempts = other.attempts(),
                "Virtual machine not available after all connection attempts"
            );
            false
        }
    }
}

/// Deletes one resource with the deletion retry policy.
///
/// Not-found payloads count as success and permanent failures stop retrying.
/// When the resource cannot be deleted the session's incomplete-deletion flag
/// is raised and manual-cleanup guidance is logged.
pub async fn delete_with_retries<F, Fut>(session: &Session, resource: &str, mut delete: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), ExecError>>,
{
    let prober = Prober::new(RetryPolicy::deletion(), "Deletion");
    let outcome = prober
        .run(|attempt| {
            let pending = delete();
            async move {
                match pending.await {
                    Ok(()) => ProbeStep::Ready(()),
                    Err(err) => match err.kind() {
                        FailureKind::NotFound => {
                            info!(resource, "Resource already gone");
                            ProbeStep::Ready(())
                        }
                        FailureKind::Permanent => ProbeStep::Abort(err),
                        FailureKind::Transient => {
                            warn!(resource, attempt, error = %err, "Deletion failed");
                            ProbeStep::Retry(err)
                        }
                    },
                }
            }
        })
        .await;

    let failure = match outcome {
        ProbeOutcome::Ready { .. } => {
            debug!(resource, "deleted");
            return true;
        }
        ProbeOutcome::Exhausted { last, .. } => last.map(|err| err.to_string()),
        ProbeOutcome::Aborted { error, .. } => Some(error.to_string()),
    };

    session.incomplete_deletion().raise();
    error!("{}", "*".repeat(80));
    error!(resource, "Failed to delete {resource}");
    if let Some(message) = failure {
        error!("Message: {message}");
    }
    error!("Delete manually");
    error!("{}", "*".repeat(80));
    false
}

/// Runs `spec` under [`delete_with_retries`].
pub async fn delete_resource(executor: &Executor, resource: &str, spec: &CommandSpec) -> bool {
    delete_with_retries(executor.session(), resource, move || async move {
        executor
            .execute_local(spec, ExecOptions::new())
            .await
            .map(drop)
    })
    .await
}

/// Deletes the stale resources among `candidates`, building each deletion
/// command with `delete_spec`.
pub async fn sweep_stale<S>(
    executor: &Executor,
    name_prefix: &str,
    max_retention_hours: u64,
    candidates: Vec<StaleCandidate>,
    delete_spec: S,
) -> SweepSummary
where
    S: Fn(&StaleCandidate) -> CommandSpec,
{
    let janitor = Janitor::new(SweepPolicy::new(name_prefix, max_retention_hours));
    janitor
        .sweep(candidates, move |candidate| {
            let spec = delete_spec(&candidate);
            async move {
                executor
                    .execute_local(&spec, ExecOptions::new())
                    .await
                    .map(drop)
            }
        })
        .await
}

/// Terminal or intermediate state of a vendor operation.
#[derive(Debug)]
pub enum OperationState<T> {
    /// Finished successfully.
    Done(T),
    /// Still running; carries the reported status.
    Pending(String),
    /// Finished unsuccessfully; carries the vendor error payload.
    Failed(String),
}

#[derive(Debug, Error)]
enum PollFailure {
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Exec(ExecError),
    #[error("still {0}")]
    Pending(String),
}

/// Polls a vendor operation until it reaches a terminal state.
///
/// # Errors
///
/// Returns [`ConnectorError::Operation`] with the vendor payload when the
/// operation fails, [`ConnectorError::OperationTimeout`] when `policy` is
/// exhausted, and [`ConnectorError::Exec`] when polling itself fails.
pub async fn poll_operation<T, F, Fut>(
    operation: &str,
    policy: RetryPolicy,
    mut poll: F,
) -> Result<T, ConnectorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<OperationState<T>, ExecError>>,
{
    let prober = Prober::new(policy, "Operation");
    let outcome = prober
        .run(|_| {
            let pending = poll();
            async move {
                match pending.await {
                    Ok(OperationState::Done(value)) => ProbeStep::Ready(value),
                    Ok(OperationState::Pending(status)) => {
                        ProbeStep::Retry(PollFailure::Pending(status))
                    }
                    Ok(OperationState::Failed(payload)) => {
                        ProbeStep::Abort(PollFailure::Failed(payload))
                    }
                    Err(err) => ProbeStep::Abort(PollFailure::Exec(err)),
                }
            }
        })
        .await;

    match outcome {
        ProbeOutcome::Ready { value, .. } => Ok(value),
        ProbeOutcome::Exhausted { attempts, .. } => Err(ConnectorError::OperationTimeout {
            operation: operation.to_owned(),
            attempts,
        }),
        ProbeOutcome::Aborted { error, .. } => Err(match error {
            PollFailure::Exec(err) => ConnectorError::Exec(err),
            PollFailure::Failed(payload) | PollFailure::Pending(payload) => {
                error!(operation, payload = %payload, "Operation failed");
                ConnectorError::Operation {
                    operation: operation.to_owned(),
                    payload,
                }
            }
        }),
    }
}

