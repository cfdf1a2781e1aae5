//! Command-line interface definitions for the `benchvm` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser};

/// Top-level CLI for the `benchvm` binary.
#[derive(Debug, Parser)]
#[command(
    name = "benchvm",
    about = "Create, use, and clean up transient benchmark VMs on public and private clouds",
    version,
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Create a batch of VMs, run a command on each, and delete them.
    #[command(
        name = "run",
        about = "Create a batch of VMs, run a command on each, and delete them"
    )]
    Run(RunCommand),
    /// Delete tagged resources older than the retention period.
    #[command(name = "gc", about = "Delete tagged resources older than the retention period")]
    Gc(GcCommand),
}

/// Options shared by every subcommand.
#[derive(Debug, Args)]
pub(crate) struct CommonArgs {
    /// Cloud provider: amazon, azure, google or openstack.
    #[arg(long, value_name = "PROVIDER", env = "BENCHVM_PROVIDER")]
    pub(crate) provider: String,
    /// JSON file with the compute configuration of the target cloud.
    #[arg(long, value_name = "PATH")]
    pub(crate) compute: String,
    /// JSON file with provider-level defaults for missing compute keys.
    #[arg(long, value_name = "PATH")]
    pub(crate) defaults: Option<String>,
    /// Log filter, e.g. `debug` or `benchvm=trace`.
    #[arg(long, value_name = "FILTER")]
    pub(crate) log_level: Option<String>,
    /// Shorthand for `--log-level debug`.
    #[arg(short, long)]
    pub(crate) verbose: bool,
    /// Write passwords and keys to logs unmasked.
    #[arg(long)]
    pub(crate) show_secrets: bool,
}

/// Arguments for the `benchvm run` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RunCommand {
    #[command(flatten)]
    pub(crate) common: CommonArgs,
    /// Instance type for every VM, overriding `flavor_name`.
    #[arg(long, value_name = "FLAVOR")]
    pub(crate) flavor: Option<String>,
    /// Number of VMs, overriding `total_vm_count`.
    #[arg(long, value_name = "N")]
    pub(crate) count: Option<usize>,
    /// Command to execute on each VM (use -- to separate flags).
    #[arg(trailing_var_arg = true, value_name = "COMMAND")]
    pub(crate) command: Vec<String>,
}

/// Arguments for the `benchvm gc` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct GcCommand {
    #[command(flatten)]
    pub(crate) common: CommonArgs,
    /// Minimum age in hours of reclaimed resources, overriding
    /// `max_retention_hours`.
    #[arg(long, value_name = "HOURS")]
    pub(crate) max_retention_hours: Option<u64>,
}
