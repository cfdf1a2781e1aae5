//! Binary entry point for the benchvm CLI.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use camino::Utf8Path;
use clap::Parser;
use thiserror::Error;
use tracing::info;

use benchvm::batch::{
    BatchError, BatchPlan, BatchRunner, NoWorkload, RemoteCommand, Workload,
    render_remote_command,
};
use benchvm::config::{BatchConfig, ComputeConfig, ConfigError};
use benchvm::connector::{ConnectorError, ProviderKind, build_connector, collect_garbage};
use benchvm::exec::{Executor, FatalCode};
use benchvm::logging;
use benchvm::session::Session;

mod cli;

use cli::{Cli, CommonArgs, GcCommand, RunCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error("garbage collection failed: {0}")]
    Gc(#[source] ConnectorError),
    #[error("invalid command argument: {0}")]
    InvalidCommand(String),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::InvalidCommand(_) => FatalCode::Configuration.code(),
            Self::Connector(err) => err.exit_code().code(),
            Self::Batch(err) => err.exit_code().code(),
            Self::Gc(_) => 1,
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            err.exit_code()
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Run(command) => run_command(command).await,
        Cli::Gc(command) => gc_command(command).await,
    }
}

/// Everything a subcommand needs before talking to the provider.
struct Prepared {
    kind: ProviderKind,
    batch: BatchConfig,
    compute: ComputeConfig,
    session: Arc<Session>,
    executor: Executor,
}

fn prepare(common: &CommonArgs) -> Result<Prepared, CliError> {
    logging::init(common.log_level.as_deref(), common.verbose)
        .map_err(|err| CliError::Config(err.to_string()))?;
    let kind: ProviderKind = common
        .provider
        .parse()
        .map_err(|err: benchvm::connector::UnknownProvider| CliError::Config(err.to_string()))?;
    let batch =
        BatchConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    let mut compute = ComputeConfig::load(Utf8Path::new(&common.compute))?;
    if let Some(defaults) = &common.defaults {
        compute.fill_missing_from(&ComputeConfig::load(Utf8Path::new(defaults))?);
    }
    let session = Arc::new(Session::new(common.show_secrets || batch.show_secrets));
    let executor = Executor::with_process_runner(Arc::clone(&session));
    Ok(Prepared {
        kind,
        batch,
        compute,
        session,
        executor,
    })
}

async fn run_command(args: RunCommand) -> Result<i32, CliError> {
    validate_command_args(&args.command)?;
    let prepared = prepare(&args.common)?;
    let count = args
        .count
        .unwrap_or_else(|| usize::try_from(prepared.batch.total_vm_count).unwrap_or(1));
    let plan = BatchPlan::new(count, args.flavor.unwrap_or_default());

    let connector = build_connector(
        prepared.kind,
        prepared.executor.clone(),
        prepared.compute.clone(),
        prepared.batch.connect_settings(),
    )
    .await?;
    let workload: Arc<dyn Workload> = if args.command.is_empty() {
        Arc::new(NoWorkload)
    } else {
        Arc::new(RemoteCommand::new(
            prepared.executor,
            prepared.compute,
            render_remote_command(&args.command),
        ))
    };

    let report = BatchRunner::new(connector, prepared.session, plan)
        .run(workload)
        .await?;
    Ok(report.exit_code().map_or(0, FatalCode::code))
}

async fn gc_command(args: GcCommand) -> Result<i32, CliError> {
    let prepared = prepare(&args.common)?;
    let hours = args
        .max_retention_hours
        .unwrap_or(prepared.batch.max_retention_hours);
    let summary = collect_garbage(
        prepared.kind,
        prepared.executor,
        prepared.compute,
        prepared.batch.connect_settings(),
        hours,
    )
    .await
    .map_err(|err| match err {
        ConnectorError::Configuration(_) | ConnectorError::Session { .. } => {
            CliError::Connector(err)
        }
        other => CliError::Gc(other),
    })?;
    info!(
        deleted_vms = summary.deleted_vms,
        deleted_volumes = summary.deleted_volumes,
        failures = summary.failures,
        "Garbage collection complete"
    );
    Ok(0)
}

fn validate_command_args(args: &[String]) -> Result<(), CliError> {
    for arg in args {
        if arg
            .chars()
            .any(|ch| matches!(ch, '\n' | '\r' | '\u{0000}'..='\u{001F}' | '\u{007F}'))
        {
            return Err(CliError::InvalidCommand(String::from(concat!(
                "command arguments must not contain control characters (ASCII ",
                "0x00-0x1F or 0x7F, e.g. newline, carriage return, tab, NUL)"
            ))));
        }
    }
    Ok(())
}

fn report_error(err: &CliError) {
    writeln!(io::stderr(), "{err}").ok();
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("echo ok", true)]
    #[case("echo\nok", false)]
    #[case("tab\there", false)]
    fn control_characters_are_rejected(#[case] arg: &str, #[case] accepted: bool) {
        let args = vec![arg.to_owned()];
        assert_eq!(validate_command_args(&args).is_ok(), accepted);
    }

    #[test]
    fn errors_map_to_exit_codes() {
        let config = CliError::Config(String::from("missing"));
        let deletion = CliError::Connector(ConnectorError::Deletion {
            resources: vec![String::from("volume 'vol-1'")],
        });
        assert_eq!(config.exit_code(), 10);
        assert_eq!(deletion.exit_code(), 13);
    }
}
