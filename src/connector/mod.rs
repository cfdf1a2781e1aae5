//! Uniform contract over the supported cloud providers.
//!
//! A [`Connector`] provisions, probes, and tears down transient VMs for one
//! provider. Adapters are selected at runtime by [`ProviderKind`] through
//! [`build_connector`], so methods return boxed futures to keep the trait
//! object safe.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

use crate::config::{ComputeConfig, ConnectSettings};
use crate::context::RunContext;
use crate::exec::Executor;
use crate::janitor::SweepSummary;

mod error;
pub mod lifecycle;
mod pool;

pub use error::ConnectorError;
pub use pool::AddressPool;

/// Boxed future returned by [`Connector`] methods.
pub type ConnectorFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ConnectorError>> + Send + 'a>>;

/// Supported cloud providers.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Amazon EC2.
    Amazon,
    /// Microsoft Azure.
    Azure,
    /// Google Compute Engine.
    Google,
    /// OpenStack Nova/Cinder.
    OpenStack,
}

impl ProviderKind {
    /// Tag used on the command line and in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Amazon => "amazon",
            Self::Azure => "azure",
            Self::Google => "google",
            Self::OpenStack => "openstack",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a provider tag is not recognised.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unknown provider '{0}' (expected amazon, azure, google or openstack)")]
pub struct UnknownProvider(pub String);

impl FromStr for ProviderKind {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "amazon" | "aws" => Ok(Self::Amazon),
            "azure" => Ok(Self::Azure),
            "google" | "gcp" => Ok(Self::Google),
            "openstack" => Ok(Self::OpenStack),
            _ => Err(UnknownProvider(s.to_owned())),
        }
    }
}

/// Data source descriptor handed to downstream data-access configuration.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Supplier {
    /// Fully qualified supplier type.
    #[serde(rename = "Type")]
    pub kind: String,
    /// Endpoint of the data source.
    #[serde(rename = "ServiceUrl")]
    pub service_url: String,
    /// Supplier-specific settings.
    #[serde(flatten)]
    pub settings: BTreeMap<String, String>,
}

/// Named suppliers contributed by connectors.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct SupplierRegistry {
    suppliers: BTreeMap<String, Supplier>,
}

impl SupplierRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `supplier` under `name`, replacing any previous entry.
    pub fn insert(&mut self, name: impl Into<String>, supplier: Supplier) {
        self.suppliers.insert(name.into(), supplier);
    }

    /// Supplier registered under `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Supplier> {
        self.suppliers.get(name)
    }

    /// Number of registered suppliers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.suppliers.len()
    }

    /// Returns `true` when no supplier is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.suppliers.is_empty()
    }
}

/// Capability set every provider adapter implements.
pub trait Connector: Send + Sync {
    /// Provider served by this connector.
    fn provider(&self) -> ProviderKind;

    /// Batch-wide discovery run once before any VM is created.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::InsufficientAddresses`] when fewer
    /// pre-allocated addresses than `planned` VMs exist.
    fn prepare(&mut self, planned: usize) -> ConnectorFuture<'_, ()>;

    /// Creates the VM for `ctx`, resolves its address, and waits for SSH.
    ///
    /// Returns whether the VM became reachable. Identifiers are recorded in
    /// `ctx` as soon as the provider acknowledges each resource.
    ///
    /// # Errors
    ///
    /// Returns an error mapping to [`crate::exec::FatalCode::Creation`] when
    /// the VM or an attached resource cannot be created.
    fn create_vm<'a>(&'a self, ctx: &'a mut RunContext) -> ConnectorFuture<'a, bool>;

    /// Deletes every resource recorded in `ctx`.
    ///
    /// Succeeds immediately without any vendor call when `ctx.vm_id` is unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Deletion`] naming resources left behind.
    fn delete_vm<'a>(&'a self, ctx: &'a mut RunContext) -> ConnectorFuture<'a, ()>;

    /// Deletes tagged resources older than `max_retention_hours`.
    ///
    /// # Errors
    ///
    /// Returns an error when the resources cannot be listed; individual
    /// deletion failures are counted in the summary instead.
    fn delete_old_resources(&self, max_retention_hours: u64) -> ConnectorFuture<'_, SweepSummary>;

    /// Copies provider-specific files to the VM.
    ///
    /// # Errors
    ///
    /// Returns an error when a transfer fails.
    fn copy_additional_files<'a>(&'a self, ctx: &'a RunContext) -> ConnectorFuture<'a, ()> {
        let _ = ctx;
        Box::pin(async { Ok(()) })
    }

    /// Registers provider-specific data suppliers.
    fn add_supplier(&self, registry: &mut SupplierRegistry) {
        let _ = registry;
    }
}

/// Validates `config` and establishes a vendor session for `kind`.
///
/// # Errors
///
/// Returns [`ConnectorError::Configuration`] listing every missing key, or
/// [`ConnectorError::Session`] when credentials cannot be established.
pub async fn build_connector(
    kind: ProviderKind,
    executor: Executor,
    config: ComputeConfig,
    settings: ConnectSettings,
) -> Result<Box<dyn Connector>, ConnectorError> {
    Ok(match kind {
        ProviderKind::Amazon => Box::new(
            crate::amazon::AmazonConnector::initialize(executor, config, settings).await?,
        ),
        ProviderKind::Azure => {
            Box::new(crate::azure::AzureConnector::initialize(executor, config, settings).await?)
        }
        ProviderKind::Google => {
            Box::new(crate::google::GoogleConnector::initialize(executor, config, settings).await?)
        }
        ProviderKind::OpenStack => Box::new(
            crate::openstack::OpenStackConnector::initialize(executor, config, settings).await?,
        ),
    })
}

/// Builds the connector for `kind` and runs one garbage-collection pass.
///
/// # Errors
///
/// Returns the [`build_connector`] errors, or the listing failure raised by
/// [`Connector::delete_old_resources`].
pub async fn collect_garbage(
    kind: ProviderKind,
    executor: Executor,
    config: ComputeConfig,
    settings: ConnectSettings,
    max_retention_hours: u64,
) -> Result<SweepSummary, ConnectorError> {
    let connector = build_connector(kind, executor, config, settings).await?;
    connector.delete_old_resources(max_retention_hours).await
}
