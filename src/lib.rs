//! Core library for benchvm, a transient-VM lifecycle manager.
//!
//! The crate creates short-lived virtual machines on Amazon EC2, Microsoft
//! Azure, Google Compute Engine, and OpenStack by driving each vendor's
//! command-line client, waits until they accept SSH sessions, and deletes
//! them with every resource they acquired. A janitor pass reclaims resources
//! left behind by interrupted batches.

pub mod amazon;
pub mod azure;
pub mod batch;
pub mod config;
pub mod connector;
pub mod context;
pub mod exec;
pub mod google;
pub mod janitor;
pub mod logging;
pub mod openstack;
pub mod probe;
pub mod session;
pub mod test_support;

pub use batch::{BatchError, BatchPlan, BatchReport, BatchRunner, RemoteCommand, Workload};
pub use config::{BatchConfig, ComputeConfig, ConfigError, ConnectSettings, RequiredKey};
pub use connector::{
    AddressPool, Connector, ConnectorError, ProviderKind, build_connector, collect_garbage,
};
pub use context::RunContext;
pub use exec::{CommandSpec, ExecError, Executor, FailureKind, FatalCode};
pub use janitor::{Janitor, StaleCandidate, SweepPolicy, SweepSummary};
pub use session::{IncompleteDeletionFlag, Session};
