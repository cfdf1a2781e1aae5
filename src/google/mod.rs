//! Google Compute Engine adapter driven through the `gcloud` CLI.
//!
//! Instance insertion and deletion are zone operations: commands run with
//! `--async`, the returned operation is polled every second until `DONE`,
//! and an `error` member on the finished operation is surfaced verbatim.
//! The external address is assigned automatically and read back from the
//! instance's access configuration.

use camino::Utf8Path;
use chrono::Utc;
use tracing::{Instrument, info, warn};

use crate::config::{ComputeConfig, ConnectSettings, RequiredKey};
use crate::connector::lifecycle::{
    OperationState, await_ssh, delete_with_retries, parse_address, poll_operation, ssh_target,
    sweep_stale,
};
use crate::connector::{
    Connector, ConnectorError, ConnectorFuture, ProviderKind, Supplier, SupplierRegistry,
};
use crate::context::RunContext;
use crate::exec::{CommandArg, CommandSpec, CopyDirection, ExecError, ExecOptions, Executor, FailureKind, FatalCode};
use crate::janitor::{ResourceKind, StaleCandidate, SweepSummary, parse_timestamp};
use crate::probe::{OPERATION_MAX_WAIT, OPERATION_POLL_INTERVAL, RetryPolicy};

mod types;

use types::{Instance, Operation};

/// Keys the Google adapter cannot work without.
pub const REQUIRED_KEYS: &[RequiredKey] = &[
    RequiredKey::new("account_file", "service account key file"),
    RequiredKey::new("project_id", "Google Cloud project id"),
    RequiredKey::new("region_name", "zone in which VMs are created"),
    RequiredKey::new("vm_name", "name prefix of created virtual machines"),
    RequiredKey::new("image_name", "source image"),
    RequiredKey::new("flavor_name", "machine type"),
    RequiredKey::new("private_key_file", "private key used for SSH"),
    RequiredKey::new("remote_user", "login user on the image"),
];

/// Size of the boot disk in GB.
pub const BOOT_DISK_GB: u32 = 20;

/// Name under which the storage supplier is registered.
pub const SUPPLIER_NAME: &str = "GOOGLE";

const SUPPLIER_TYPE: &str = "Terradue.Data.Stars.Suppliers.DataHubSourceSupplier";
const SUPPLIER_URL: &str = "https://storage.googleapis.com";
const SERVICE_SCOPES: &str = "https://www.googleapis.com/auth/devstorage.read_write,https://www.googleapis.com/auth/logging.write";
const DONE: &str = "DONE";

/// Connector for Google Compute Engine.
#[derive(Clone, Debug)]
pub struct GoogleConnector {
    executor: Executor,
    config: ComputeConfig,
    settings: ConnectSettings,
}

impl GoogleConnector {
    /// Resolves key aliases, validates `config`, and activates the service
    /// account.
    ///
    /// `account_file` falls back to `auth_file` and `project_id` to
    /// `project_name`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Configuration`] listing every missing key,
    /// or [`ConnectorError::Session`] when the account cannot be activated.
    pub async fn initialize(
        executor: Executor,
        mut config: ComputeConfig,
        settings: ConnectSettings,
    ) -> Result<Self, ConnectorError> {
        config.fill_from_aliases("account_file", &["auth_file"]);
        config.fill_from_aliases("project_id", &["project_name"]);
        config.validate(REQUIRED_KEYS)?;
        if config.flag("floating_ip") {
            warn!(
                "Google Cloud Platform instances have external IP addresses assigned automatically, 'floating_ip' setting is ignored"
            );
        }
        let connector = Self {
            executor,
            config,
            settings,
        };
        let activate = CommandSpec::new("gcloud")
            .args(["auth", "activate-service-account"])
            .arg(format!("--key-file={}", connector.config.value("account_file")));
        connector
            .executor
            .execute_local(&activate, ExecOptions::new())
            .await
            .map_err(|source| ConnectorError::Session {
                provider: "google",
                source,
            })?;
        Ok(connector)
    }

    fn gcloud<I, A>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = A>,
        A: Into<CommandArg>,
    {
        CommandSpec::new("gcloud")
            .arg("compute")
            .args(args)
            .arg(format!("--project={}", self.config.value("project_id")))
            .arg("--format=json")
    }

    fn zone_arg(&self) -> String {
        format!("--zone={}", self.config.value("region_name"))
    }

    fn insert_spec(&self, name: &str, flavor: &str) -> CommandSpec {
        self.gcloud(["instances", "create", name])
            .arg(self.zone_arg())
            .arg(format!("--machine-type={flavor}"))
            .arg(format!("--image={}", self.config.value("image_name")))
            .arg(format!("--boot-disk-size={BOOT_DISK_GB}GB"))
            .arg("--boot-disk-auto-delete")
            .arg("--network=default")
            .arg(format!("--scopes={SERVICE_SCOPES}"))
            .arg("--async")
    }

    async fn operation_state(&self, name: &str) -> Result<OperationState<Operation>, ExecError> {
        let describe = self
            .gcloud(["operations", "describe", name])
            .arg(self.zone_arg());
        let operation: Operation = self
            .executor
            .execute_json(&describe, ExecOptions::new())
            .await?;
        Ok(match operation.status.as_deref() {
            Some(DONE) => match &operation.error {
                Some(error) => OperationState::Failed(error.to_string()),
                None => OperationState::Done(operation),
            },
            other => OperationState::Pending(other.unwrap_or("UNKNOWN").to_owned()),
        })
    }

    async fn wait_for_operation(&self, name: &str) -> Result<Operation, ConnectorError> {
        poll_operation(
            name,
            RetryPolicy::operation(OPERATION_POLL_INTERVAL, OPERATION_MAX_WAIT),
            move || self.operation_state(name),
        )
        .await
    }

    async fn create(&self, ctx: &mut RunContext) -> Result<bool, ConnectorError> {
        info!("Creating virtual machine ...");
        let name = ctx.full_name(self.config.value("vm_name"));
        let flavor = if ctx.flavor.is_empty() {
            self.config.value("flavor_name").to_owned()
        } else {
            ctx.flavor.clone()
        };
        ctx.vm_name = Some(name.clone());
        ctx.create_start_time = Some(Utc::now());

        let operations: Vec<Operation> = self
            .executor
            .execute_json(
                &self.insert_spec(&name, &flavor),
                ExecOptions::new().fatal(FatalCode::Creation),
            )
            .await?;
        let operation = operations
            .into_iter()
            .next()
            .ok_or_else(|| ConnectorError::creation("No operation in response"))?;
        let target_id = operation
            .target_id
            .clone()
            .ok_or_else(|| ConnectorError::creation("No targetId in response"))?;
        ctx.vm_id = Some(target_id.clone());
        info!(vm_id = %target_id, "Virtual machine '{name}' created (target ID = {target_id})");

        self.wait_for_operation(&operation.name).await?;

        let instance: Instance = self
            .executor
            .execute_json(
                &self
                    .gcloud(["instances", "describe", name.as_str()])
                    .arg(self.zone_arg()),
                ExecOptions::new().fatal(FatalCode::Creation),
            )
            .await?;
        let address = instance
            .nat_ip()
            .ok_or_else(|| ConnectorError::creation("No IP address found"))?;
        ctx.public_ip = Some(parse_address(address)?);
        info!(ip = %address, "IP address is {address}");

        let target = ssh_target(&self.config, ctx)?;
        Ok(await_ssh(&self.executor, &target, self.settings, ctx).await)
    }

    async fn delete_attempt(&self, instance: &str) -> Result<(), ExecError> {
        let spec = self
            .gcloud(["instances", "delete", instance])
            .arg(self.zone_arg())
            .args(["--quiet", "--async"]);
        let operations: Vec<Operation> = self.executor.execute_json(&spec, ExecOptions::new()).await?;
        let Some(operation) = operations.into_iter().next() else {
            return Ok(());
        };
        self.wait_for_operation(&operation.name)
            .await
            .map(drop)
            .map_err(|err| match err {
                ConnectorError::Exec(source) => source,
                other => {
                    let payload = other.to_string();
                    ExecError::Failed {
                        command: self.executor.render(&spec),
                        code: None,
                        kind: FailureKind::classify(&payload),
                        stderr: payload,
                    }
                }
            })
    }

    async fn delete(&self, ctx: &mut RunContext) -> Result<(), ConnectorError> {
        let Some(vm_id) = ctx.vm_id.clone() else {
            return Ok(());
        };
        let instance = ctx.vm_name.clone().unwrap_or_else(|| vm_id.clone());
        info!(vm_id = %vm_id, "Deleting virtual machine '{instance}' ...");
        let resource = format!("virtual machine '{vm_id}'");
        let attempt = instance.as_str();
        let deleted = delete_with_retries(self.executor.session(), &resource, move || {
            self.delete_attempt(attempt)
        })
        .await;
        if deleted {
            info!("Virtual machine deleted");
            ctx.clear_resources();
            Ok(())
        } else {
            Err(ConnectorError::Deletion {
                resources: vec![resource],
            })
        }
    }

    async fn sweep(&self, max_retention_hours: u64) -> Result<SweepSummary, ConnectorError> {
        let list = self
            .gcloud(["instances", "list"])
            .arg(format!("--zones={}", self.config.value("region_name")));
        let instances: Vec<Instance> = self.executor.execute_json(&list, ExecOptions::new()).await?;
        let candidates = instances
            .into_iter()
            .filter_map(|instance| {
                Some(StaleCandidate {
                    created: parse_timestamp(instance.creation_timestamp.as_deref()?)?,
                    id: instance.name.clone(),
                    name: instance.name,
                    kind: ResourceKind::Vm,
                })
            })
            .collect();

        Ok(sweep_stale(
            &self.executor,
            self.config.value("vm_name"),
            max_retention_hours,
            candidates,
            |candidate| {
                self.gcloud(["instances", "delete", candidate.id.as_str()])
                    .arg(self.zone_arg())
                    .arg("--quiet")
            },
        )
        .await)
    }

    async fn copy_account_file(&self, ctx: &RunContext) -> Result<(), ConnectorError> {
        let target = ssh_target(&self.config, ctx)?;
        let account_file = Utf8Path::new(self.config.value("account_file"));
        let directory = account_file
            .parent()
            .map(Utf8Path::as_str)
            .filter(|dir| !dir.is_empty())
            .unwrap_or(".");
        let user = self.config.value("remote_user");
        for command in [
            format!("sudo mkdir -p {directory}"),
            format!("sudo chown {user} {directory}"),
        ] {
            self.executor
                .execute_remote(&target, command, ExecOptions::new())
                .await?;
        }
        self.executor
            .copy_file(
                &target,
                account_file,
                account_file.as_str(),
                CopyDirection::ToRemote,
                ExecOptions::new(),
            )
            .await?;
        Ok(())
    }
}

impl Connector for GoogleConnector {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Google
    }

    fn prepare(&mut self, _planned: usize) -> ConnectorFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn create_vm<'a>(&'a self, ctx: &'a mut RunContext) -> ConnectorFuture<'a, bool> {
        let span = ctx.span().clone();
        Box::pin(self.create(ctx).instrument(span))
    }

    fn delete_vm<'a>(&'a self, ctx: &'a mut RunContext) -> ConnectorFuture<'a, ()> {
        let span = ctx.span().clone();
        Box::pin(self.delete(ctx).instrument(span))
    }

    fn delete_old_resources(&self, max_retention_hours: u64) -> ConnectorFuture<'_, SweepSummary> {
        Box::pin(self.sweep(max_retention_hours))
    }

    fn copy_additional_files<'a>(&'a self, ctx: &'a RunContext) -> ConnectorFuture<'a, ()> {
        let span = ctx.span().clone();
        Box::pin(self.copy_account_file(ctx).instrument(span))
    }

    fn add_supplier(&self, registry: &mut SupplierRegistry) {
        registry.insert(
            SUPPLIER_NAME,
            Supplier {
                kind: SUPPLIER_TYPE.to_owned(),
                service_url: SUPPLIER_URL.to_owned(),
                settings: [
                    ("projectId", self.config.value("project_id")),
                    ("AccountFile", self.config.value("account_file")),
                ]
                .into_iter()
                .map(|(key, value)| (key.to_owned(), value.to_owned()))
                .collect(),
            },
        );
    }
}
