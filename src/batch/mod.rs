//! Drives one batch of transient VMs through creation, use, and deletion.
//!
//! A [`BatchRunner`] prepares its connector once, creates every planned VM
//! concurrently, hands each reachable VM to a [`Workload`], and then deletes
//! every VM whatever the creation or workload outcome was. The first failed
//! creation cancels the sibling creations and skips the workloads. An
//! interrupt (Ctrl-C for the binary) cancels whatever phase is running. In
//! both cases deletion still runs over whatever each [`RunContext`] recorded
//! so far.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use shell_escape::unix::escape;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::ComputeConfig;
use crate::connector::lifecycle::ssh_target;
use crate::connector::{Connector, ConnectorError, SupplierRegistry};
use crate::context::RunContext;
use crate::exec::{ExecOptions, Executor, FatalCode};
use crate::session::Session;

/// Future returned by [`Workload::run`].
pub type WorkloadFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ConnectorError>> + Send + 'a>>;

/// Work performed on each VM that became reachable.
pub trait Workload: Send + Sync {
    /// Runs against the VM described by `ctx`.
    ///
    /// # Errors
    ///
    /// Returns the failure to record for this run; the VM is deleted anyway.
    fn run<'a>(&'a self, ctx: &'a RunContext) -> WorkloadFuture<'a>;
}

/// Workload that does nothing; VMs are created and deleted straight away.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoWorkload;

impl Workload for NoWorkload {
    fn run<'a>(&'a self, _ctx: &'a RunContext) -> WorkloadFuture<'a> {
        Box::pin(async { Ok(()) })
    }
}

/// Runs one shell command on every VM over SSH.
///
/// A failing command maps to [`FatalCode::RemoteCommand`].
#[derive(Clone, Debug)]
pub struct RemoteCommand {
    executor: Executor,
    config: ComputeConfig,
    command: String,
}

impl RemoteCommand {
    /// Creates the workload; `config` supplies the SSH user and key.
    #[must_use]
    pub const fn new(executor: Executor, config: ComputeConfig, command: String) -> Self {
        Self {
            executor,
            config,
            command,
        }
    }

    /// Command line sent to each VM.
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }
}

impl Workload for RemoteCommand {
    fn run<'a>(&'a self, ctx: &'a RunContext) -> WorkloadFuture<'a> {
        Box::pin(async move {
            let target = ssh_target(&self.config, ctx)?;
            info!(host = %target.host, "Running remote command");
            let output = self
                .executor
                .execute_remote(
                    &target,
                    self.command.as_str(),
                    ExecOptions::new().fatal(FatalCode::RemoteCommand),
                )
                .await?;
            for line in output.lines() {
                info!(target: "benchvm::remote", "{line}");
            }
            Ok(())
        })
    }
}

/// Joins command arguments into one shell command line, quoting each one.
#[must_use]
pub fn render_remote_command(args: &[String]) -> String {
    args.iter()
        .map(|arg| escape(arg.as_str().into()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Errors that stop a batch before any VM is created.
#[derive(Debug, Error)]
pub enum BatchError {
    /// The batch plan is unusable.
    #[error("invalid batch plan: {message}")]
    InvalidPlan {
        /// Description of the problem.
        message: String,
    },
    /// Batch-wide discovery failed.
    #[error("failed to prepare batch: {0}")]
    Prepare(#[source] ConnectorError),
}

impl BatchError {
    /// Process exit code implied by this error.
    #[must_use]
    pub fn exit_code(&self) -> FatalCode {
        match self {
            Self::InvalidPlan { .. } => FatalCode::Configuration,
            Self::Prepare(err) => err.exit_code(),
        }
    }
}

/// VMs to create in one batch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BatchPlan {
    /// Number of VMs.
    pub count: usize,
    /// Instance type for every VM; empty selects the configured default.
    pub flavor: String,
}

impl BatchPlan {
    /// Plan for `count` VMs of `flavor`.
    #[must_use]
    pub fn new(count: usize, flavor: impl Into<String>) -> Self {
        Self {
            count,
            flavor: flavor.into(),
        }
    }
}

/// A failure recorded against one run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunFailure {
    /// Exit code the failure maps to.
    pub code: FatalCode,
    /// Error text.
    pub message: String,
}

impl From<&ConnectorError> for RunFailure {
    fn from(err: &ConnectorError) -> Self {
        Self {
            code: err.exit_code(),
            message: err.to_string(),
        }
    }
}

/// Outcome of one VM in the batch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunReport {
    /// Zero-based run index.
    pub index: usize,
    /// Log tag of the run.
    pub short_name: String,
    /// Full VM name, if creation started.
    pub vm_name: Option<String>,
    /// Whether the VM accepted SSH connections.
    pub available: bool,
    /// Creation or workload failure.
    pub failure: Option<RunFailure>,
    /// Resources left behind by deletion.
    pub deletion_error: Option<String>,
}

impl RunReport {
    fn pending(ctx: &RunContext) -> Self {
        Self {
            index: ctx.index,
            short_name: ctx.short_name.clone(),
            vm_name: None,
            available: false,
            failure: None,
            deletion_error: None,
        }
    }
}

/// Result of a whole batch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BatchReport {
    /// One entry per planned VM, in index order.
    pub runs: Vec<RunReport>,
    /// Whether an interrupt cut creation or the workloads short.
    pub interrupted: bool,
    /// Final value of the incomplete-deletion flag.
    pub incomplete_deletion: bool,
    /// Data suppliers contributed by the connector.
    pub suppliers: SupplierRegistry,
}

impl BatchReport {
    /// Exit code the process should end with, if any.
    ///
    /// The first failed run decides; otherwise an incomplete deletion maps
    /// to [`FatalCode::Deletion`].
    #[must_use]
    pub fn exit_code(&self) -> Option<FatalCode> {
        self.runs
            .iter()
            .find_map(|run| run.failure.as_ref().map(|failure| failure.code))
            .or_else(|| self.incomplete_deletion.then_some(FatalCode::Deletion))
    }

    /// Number of VMs that became reachable.
    #[must_use]
    pub fn available_count(&self) -> usize {
        self.runs.iter().filter(|run| run.available).count()
    }
}

type SharedContext = Arc<Mutex<RunContext>>;

struct CreateOutcome {
    index: usize,
    available: bool,
    failure: Option<RunFailure>,
}

/// Runs a batch against one prepared connector.
pub struct BatchRunner {
    connector: Box<dyn Connector>,
    session: Arc<Session>,
    plan: BatchPlan,
}

impl BatchRunner {
    /// Creates a runner; `session` must be the one the connector's
    /// executor reports into.
    #[must_use]
    pub fn new(connector: Box<dyn Connector>, session: Arc<Session>, plan: BatchPlan) -> Self {
        Self {
            connector,
            session,
            plan,
        }
    }

    /// Runs the batch, treating Ctrl-C as an interrupt.
    ///
    /// # Errors
    ///
    /// See [`BatchRunner::run_until`].
    pub async fn run(self, workload: Arc<dyn Workload>) -> Result<BatchReport, BatchError> {
        self.run_until(workload, ctrl_c()).await
    }

    /// Runs the batch; when `interrupt` resolves during creation or the
    /// workload, pending tasks are cancelled and deletion starts. The first
    /// failed creation does the same before any workload runs.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::InvalidPlan`] for an empty plan and
    /// [`BatchError::Prepare`] when batch-wide discovery fails. Failures of
    /// individual runs are recorded in the report instead.
    pub async fn run_until<I>(
        mut self,
        workload: Arc<dyn Workload>,
        interrupt: I,
    ) -> Result<BatchReport, BatchError>
    where
        I: Future<Output = ()> + Send,
    {
        if self.plan.count == 0 {
            return Err(BatchError::InvalidPlan {
                message: String::from("at least one virtual machine is required"),
            });
        }
        let batch_id = Uuid::new_v4().simple().to_string();
        let span = info_span!("batch", batch = %batch_id, provider = %self.connector.provider());
        let count = self.plan.count;
        self.connector
            .prepare(count)
            .instrument(span.clone())
            .await
            .map_err(BatchError::Prepare)?;
        let mut suppliers = SupplierRegistry::new();
        self.connector.add_supplier(&mut suppliers);

        let connector: Arc<dyn Connector> = Arc::from(self.connector);
        let contexts: Vec<SharedContext> = (0..count)
            .map(|index| {
                let suffix = format!("-{}", index + 1);
                Arc::new(Mutex::new(RunContext::new(index, suffix, self.plan.flavor.as_str())))
            })
            .collect();
        let mut reports = Vec::with_capacity(count);
        for ctx in &contexts {
            reports.push(RunReport::pending(&*ctx.lock().await));
        }

        tokio::pin!(interrupt);
        span.in_scope(|| info!(count, "Creating virtual machines"));
        let mut creations = JoinSet::new();
        for ctx in &contexts {
            creations.spawn(create_run(Arc::clone(&connector), Arc::clone(ctx)));
        }
        let mut outcomes = Vec::with_capacity(count);
        let (mut interrupted, aborted) = tokio::select! {
            failed = collect_creations(&mut creations, &mut outcomes) => (false, failed),
            () = &mut interrupt => (true, false),
        };
        if interrupted {
            span.in_scope(|| warn!("Interrupted, deleting virtual machines created so far"));
        } else if aborted {
            span.in_scope(|| error!("Creation failed, cancelling the batch"));
        }
        creations.shutdown().await;
        for outcome in outcomes {
            if let Some(report) = reports.get_mut(outcome.index) {
                report.available = outcome.available;
                report.failure = outcome.failure;
            }
        }

        if !interrupted && !aborted {
            let mut uses = JoinSet::new();
            for (ctx, report) in contexts.iter().zip(&reports) {
                if report.available {
                    uses.spawn(use_run(
                        Arc::clone(&connector),
                        Arc::clone(&workload),
                        Arc::clone(ctx),
                    ));
                }
            }
            let mut failures = Vec::new();
            interrupted = tokio::select! {
                () = collect_uses(&mut uses, &mut failures) => false,
                () = &mut interrupt => true,
            };
            if interrupted {
                span.in_scope(|| warn!("Interrupted, deleting virtual machines"));
                uses.shutdown().await;
            }
            for (index, failure) in failures {
                if let Some(report) = reports.get_mut(index) {
                    report.failure = Some(failure);
                }
            }
        }

        span.in_scope(|| info!("Deleting virtual machines"));
        let mut deletions = JoinSet::new();
        for ctx in &contexts {
            deletions.spawn(delete_run(Arc::clone(&connector), Arc::clone(ctx)));
        }
        while let Some(joined) = deletions.join_next().await {
            match joined {
                Ok((index, vm_name, deletion_error)) => {
                    if let Some(report) = reports.get_mut(index) {
                        report.vm_name = vm_name;
                        report.deletion_error = deletion_error;
                    }
                }
                Err(err) => span.in_scope(|| error!(error = %err, "Deletion task failed")),
            }
        }

        let report = BatchReport {
            runs: reports,
            interrupted,
            incomplete_deletion: self.session.incomplete_deletion().is_raised(),
            suppliers,
        };
        span.in_scope(|| {
            info!(
                available = report.available_count(),
                planned = count,
                incomplete_deletion = report.incomplete_deletion,
                "Batch finished"
            );
        });
        Ok(report)
    }
}

async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

/// Collects creation outcomes; returns `true` as soon as one run failed.
async fn collect_creations(
    set: &mut JoinSet<CreateOutcome>,
    outcomes: &mut Vec<CreateOutcome>,
) -> bool {
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(outcome) => {
                let failed = outcome.failure.is_some();
                outcomes.push(outcome);
                if failed {
                    return true;
                }
            }
            Err(err) => error!(error = %err, "Creation task failed"),
        }
    }
    false
}

async fn collect_uses(
    set: &mut JoinSet<(usize, Option<RunFailure>)>,
    failures: &mut Vec<(usize, RunFailure)>,
) {
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, Some(failure))) => failures.push((index, failure)),
            Ok((_, None)) => {}
            Err(err) => error!(error = %err, "Workload task failed"),
        }
    }
}

async fn create_run(connector: Arc<dyn Connector>, shared: SharedContext) -> CreateOutcome {
    let mut ctx = shared.lock().await;
    let index = ctx.index;
    match connector.create_vm(&mut ctx).await {
        Ok(available) => CreateOutcome {
            index,
            available,
            failure: None,
        },
        Err(err) => {
            ctx.span()
                .in_scope(|| error!(error = %err, "Virtual machine creation failed"));
            CreateOutcome {
                index,
                available: false,
                failure: Some(RunFailure::from(&err)),
            }
        }
    }
}

async fn use_run(
    connector: Arc<dyn Connector>,
    workload: Arc<dyn Workload>,
    shared: SharedContext,
) -> (usize, Option<RunFailure>) {
    let ctx = shared.lock().await;
    let span = ctx.span().clone();
    let used = async {
        connector.copy_additional_files(&ctx).await?;
        workload.run(&ctx).await
    }
    .instrument(span.clone())
    .await;
    let failure = used.err().map(|err| {
        span.in_scope(|| error!(error = %err, "Workload failed"));
        RunFailure::from(&err)
    });
    (ctx.index, failure)
}

async fn delete_run(
    connector: Arc<dyn Connector>,
    shared: SharedContext,
) -> (usize, Option<String>, Option<String>) {
    let mut ctx = shared.lock().await;
    let vm_name = ctx.vm_name.clone();
    let deletion_error = connector
        .delete_vm(&mut ctx)
        .await
        .err()
        .map(|err| err.to_string());
    (ctx.index, vm_name, deletion_error)
}
