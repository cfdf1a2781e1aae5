//! Stale-resource janitor for benchvm.
//!
//! This binary deletes VMs and volumes carrying the configured `vm_name`
//! prefix that are older than the retention period. It is meant to run from
//! cron alongside batches that may have been killed before cleaning up.

use std::io::Write as _;
use std::sync::Arc;

use benchvm::config::{BatchConfig, ComputeConfig};
use benchvm::connector::{ProviderKind, collect_garbage};
use benchvm::exec::Executor;
use benchvm::logging;
use benchvm::session::Session;
use camino::Utf8Path;
use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "benchvm-janitor",
    about = "Delete benchvm resources older than the retention period"
)]
struct Cli {
    /// Cloud provider: amazon, azure, google or openstack.
    #[arg(long, env = "BENCHVM_PROVIDER")]
    provider: String,
    /// JSON file with the compute configuration of the target cloud.
    #[arg(long)]
    compute: String,
    /// Minimum age in hours of reclaimed resources.
    #[arg(long)]
    max_retention_hours: Option<u64>,
    /// Log filter, e.g. `debug`.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let cli = Cli::parse();
    logging::init(cli.log_level.as_deref(), false).map_err(|err| err.to_string())?;
    let kind: ProviderKind = cli.provider.parse().map_err(|err| format!("{err}"))?;
    let batch = BatchConfig::load_without_cli_args().map_err(|err| err.to_string())?;
    let compute =
        ComputeConfig::load(Utf8Path::new(&cli.compute)).map_err(|err| err.to_string())?;
    let executor = Executor::with_process_runner(Arc::new(Session::new(batch.show_secrets)));
    let hours = cli.max_retention_hours.unwrap_or(batch.max_retention_hours);

    let summary = collect_garbage(kind, executor, compute, batch.connect_settings(), hours)
        .await
        .map_err(|err| err.to_string())?;
    writeln!(
        std::io::stdout(),
        "janitor sweep complete: deleted_vms={}, deleted_volumes={}, failures={}",
        summary.deleted_vms,
        summary.deleted_volumes,
        summary.failures
    )
    .map_err(|err| err.to_string())?;
    Ok(())
}
