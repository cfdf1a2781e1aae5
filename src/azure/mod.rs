//! Microsoft Azure adapter driven through the `az` CLI.
//!
//! Azure VMs take their public address from a pre-allocated public IP whose
//! network interface is handed to `az vm create`. `prepare` discovers the
//! interfaces not yet bound to a VM and run `i` of the batch uses entry `i`.
//! Creation is submitted with `--no-wait` and the VM is polled every second
//! until its provisioning state is terminal. The managed OS disk outlives
//! the VM, so deletion removes it explicitly afterwards.

use chrono::Utc;
use tracing::{Instrument, info, warn};

use crate::config::{ComputeConfig, ConnectSettings, RequiredKey};
use crate::connector::lifecycle::{
    OperationState, await_ssh, delete_resource, parse_address, poll_operation, ssh_target,
    sweep_stale,
};
use crate::connector::{AddressPool, Connector, ConnectorError, ConnectorFuture, ProviderKind};
use crate::context::RunContext;
use crate::exec::{CommandArg, CommandSpec, ExecError, ExecOptions, Executor, FailureKind, FatalCode};
use crate::janitor::{ResourceKind, StaleCandidate, SweepSummary, parse_timestamp};
use crate::probe::{OPERATION_MAX_WAIT, OPERATION_POLL_INTERVAL, RetryPolicy};

mod types;

use types::{Disk, IpConfiguration, PublicIpAddress, VirtualMachine, free_ip_configurations};

/// Keys the Azure adapter cannot work without.
pub const REQUIRED_KEYS: &[RequiredKey] = &[
    RequiredKey::new("subscription_id", "Azure subscription id"),
    RequiredKey::new("tenant_id", "Azure Active Directory tenant id"),
    RequiredKey::new("client_id", "service principal application id"),
    RequiredKey::new("client_secret", "service principal secret"),
    RequiredKey::new("resource_group_name", "resource group holding VMs and addresses"),
    RequiredKey::new("region_name", "Azure location"),
    RequiredKey::new("vm_name", "name prefix of created virtual machines"),
    RequiredKey::new("image", "image URN or id"),
    RequiredKey::new("flavor_name", "VM size"),
    RequiredKey::new("private_key_file", "private key used for SSH"),
    RequiredKey::new("public_key_file", "public key installed on the VM"),
    RequiredKey::new("remote_user", "admin user created on the VM"),
];

/// Provisioning state of a VM that finished successfully.
const SUCCEEDED: &str = "Succeeded";

fn az<I, A>(args: I) -> CommandSpec
where
    I: IntoIterator<Item = A>,
    A: Into<CommandArg>,
{
    CommandSpec::new("az").args(args).args(["--output", "json"])
}

/// Connector for Microsoft Azure.
#[derive(Clone, Debug)]
pub struct AzureConnector {
    executor: Executor,
    config: ComputeConfig,
    settings: ConnectSettings,
    pool: AddressPool<IpConfiguration>,
}

impl AzureConnector {
    /// Validates `config` and logs in with the service principal.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Configuration`] listing every missing key,
    /// or [`ConnectorError::Session`] when the login is rejected.
    pub async fn initialize(
        executor: Executor,
        config: ComputeConfig,
        settings: ConnectSettings,
    ) -> Result<Self, ConnectorError> {
        config.validate(REQUIRED_KEYS)?;
        if config.flag("floating_ip") {
            warn!(
                "Azure instances require manual selection of IP addresses, 'floating_ip' setting is ignored"
            );
        }
        let connector = Self {
            executor,
            config,
            settings,
            pool: AddressPool::default(),
        };
        connector.login().await.map_err(|source| ConnectorError::Session {
            provider: "azure",
            source,
        })?;
        Ok(connector)
    }

    async fn login(&self) -> Result<(), ExecError> {
        let login = CommandSpec::new("az")
            .args(["login", "--service-principal", "--username"])
            .arg(self.config.value("client_id"))
            .arg("--password")
            .arg(CommandArg::secret(self.config.value("client_secret")))
            .arg("--tenant")
            .arg(self.config.value("tenant_id"))
            .args(["--output", "none"]);
        self.executor.execute_local(&login, ExecOptions::new()).await?;
        let subscription = az(["account", "set", "--subscription"])
            .arg(self.config.value("subscription_id"));
        self.executor
            .execute_local(&subscription, ExecOptions::new())
            .await
            .map(drop)
    }

    fn resource_group(&self) -> &str {
        self.config.value("resource_group_name")
    }

    fn expected_vm_id(&self, name: &str) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachines/{name}",
            self.config.value("subscription_id"),
            self.resource_group(),
        )
    }

    async fn discover(&mut self, planned: usize) -> Result<(), ConnectorError> {
        info!("Obtaining list of available public IP addresses ...");
        let fatal = ExecOptions::new().fatal(FatalCode::Creation);
        let group = self.resource_group();
        let vms: Vec<VirtualMachine> = self
            .executor
            .execute_json(&az(["vm", "list", "--resource-group", group]), fatal)
            .await?;
        let addresses: Vec<PublicIpAddress> = self
            .executor
            .execute_json(
                &az(["network", "public-ip", "list", "--resource-group", group]),
                fatal,
            )
            .await?;
        let free = free_ip_configurations(addresses, &vms);
        let listed: Vec<&str> = free.iter().map(|entry| entry.address.as_str()).collect();
        info!("Available public IP addresses: {}", listed.join(", "));
        self.pool = AddressPool::for_batch(free, planned)?;
        Ok(())
    }

    async fn vm_state(&self, name: &str) -> Result<OperationState<VirtualMachine>, ExecError> {
        let group = self.resource_group();
        let show = az(["vm", "show", "--resource-group", group, "--name", name]);
        let vm: VirtualMachine = match self
            .executor
            .execute_json(&show, ExecOptions::new().quiet())
            .await
        {
            Ok(vm) => vm,
            Err(err) if matches!(err.kind(), FailureKind::NotFound) => {
                return Ok(OperationState::Pending(String::from("NotFound")));
            }
            Err(err) => return Err(err),
        };
        Ok(match vm.provisioning_state.as_deref() {
            Some(SUCCEEDED) => OperationState::Done(vm),
            Some(state @ ("Failed" | "Canceled")) => {
                let view = az([
                    "vm",
                    "get-instance-view",
                    "--resource-group",
                    group,
                    "--name",
                    name,
                    "--query",
                    "instanceView.statuses",
                ]);
                let detail = self
                    .executor
                    .execute_local(&view, ExecOptions::new().quiet())
                    .await
                    .unwrap_or_else(|err| err.to_string());
                OperationState::Failed(format!("{state}: {}", detail.trim()))
            }
            other => OperationState::Pending(other.unwrap_or("Unknown").to_owned()),
        })
    }

    async fn create(&self, ctx: &mut RunContext) -> Result<bool, ConnectorError> {
        info!("Creating virtual machine ...");
        let ip_configuration = self.pool.for_run(ctx.index)?.clone();
        let flavor = if ctx.flavor.is_empty() {
            self.config.value("flavor_name").to_owned()
        } else {
            ctx.flavor.clone()
        };
        let name = ctx.full_name(self.config.value("vm_name"));
        ctx.vm_name = Some(name.clone());
        ctx.create_start_time = Some(Utc::now());

        let create = az([
            "vm",
            "create",
            "--resource-group",
            self.resource_group(),
            "--name",
            name.as_str(),
            "--location",
            self.config.value("region_name"),
            "--zone",
            "1",
            "--size",
            flavor.as_str(),
            "--image",
            self.config.value("image"),
            "--admin-username",
            self.config.value("remote_user"),
            "--authentication-type",
            "ssh",
            "--ssh-key-values",
            self.config.value("public_key_file"),
            "--nics",
            ip_configuration.nic_id.as_str(),
        ])
        .arg("--no-wait");
        self.executor
            .execute_local(&create, ExecOptions::new().fatal(FatalCode::Creation))
            .await?;
        // Set before provisioning is confirmed so a failed poll still gets
        // cleaned up; deletion treats NotFound as already gone.
        ctx.vm_id = Some(self.expected_vm_id(&name));

        let polled = name.as_str();
        let vm = poll_operation(
            "create virtual machine",
            RetryPolicy::operation(OPERATION_POLL_INTERVAL, OPERATION_MAX_WAIT),
            move || self.vm_state(polled),
        )
        .await?;
        ctx.vm_id = Some(vm.id.clone());
        match vm.os_disk_id() {
            Some(disk_id) => ctx.os_disk_id = Some(disk_id.to_owned()),
            None => warn!("Disk ID not retrieved (disk has to be deleted manually)"),
        }
        info!(vm_id = %vm.id, "Virtual machine '{name}' created (ID = {})", vm.id);

        ctx.public_ip = Some(parse_address(&ip_configuration.address)?);
        let target = ssh_target(&self.config, ctx)?;
        Ok(await_ssh(&self.executor, &target, self.settings, ctx).await)
    }

    async fn delete(&self, ctx: &mut RunContext) -> Result<(), ConnectorError> {
        let Some(vm_id) = ctx.vm_id.clone() else {
            return Ok(());
        };
        info!(vm_id = %vm_id, "Deleting virtual machine ...");
        let mut left_behind = Vec::new();

        let vm_resource = format!("virtual machine '{vm_id}'");
        let delete_vm = az(["vm", "delete", "--ids", vm_id.as_str(), "--yes"]);
        let vm_deleted = delete_resource(&self.executor, &vm_resource, &delete_vm).await;
        if vm_deleted {
            info!("Virtual machine deleted");
        } else {
            left_behind.push(vm_resource);
        }

        if let Some(disk_id) = ctx.os_disk_id.clone() {
            let disk_resource = format!("disk '{disk_id}'");
            if vm_deleted {
                info!("Deleting attached disk '{disk_id}' ...");
                let delete_disk = az(["disk", "delete", "--ids", disk_id.as_str(), "--yes"]);
                if delete_resource(&self.executor, &disk_resource, &delete_disk).await {
                    info!("Disk deleted");
                } else {
                    left_behind.push(disk_resource);
                }
            } else {
                left_behind.push(disk_resource);
            }
        }

        if left_behind.is_empty() {
            ctx.clear_resources();
            Ok(())
        } else {
            Err(ConnectorError::Deletion {
                resources: left_behind,
            })
        }
    }

    async fn sweep(&self, max_retention_hours: u64) -> Result<SweepSummary, ConnectorError> {
        let group = self.resource_group();
        let vms: Vec<VirtualMachine> = self
            .executor
            .execute_json(&az(["vm", "list", "--resource-group", group]), ExecOptions::new())
            .await?;
        let disks: Vec<Disk> = self
            .executor
            .execute_json(&az(["disk", "list", "--resource-group", group]), ExecOptions::new())
            .await?;

        let vm_candidates = vms.into_iter().filter_map(|vm| {
            Some(StaleCandidate {
                created: parse_timestamp(vm.time_created.as_deref()?)?,
                id: vm.id,
                name: vm.name,
                kind: ResourceKind::Vm,
            })
        });
        let disk_candidates = disks
            .into_iter()
            .filter(|disk| {
                disk.disk_state
                    .as_deref()
                    .is_some_and(|state| state.eq_ignore_ascii_case("Unattached"))
            })
            .filter_map(|disk| {
                Some(StaleCandidate {
                    created: parse_timestamp(disk.time_created.as_deref()?)?,
                    id: disk.id,
                    name: disk.name,
                    kind: ResourceKind::Volume,
                })
            });
        let candidates = vm_candidates.chain(disk_candidates).collect();

        Ok(sweep_stale(
            &self.executor,
            self.config.value("vm_name"),
            max_retention_hours,
            candidates,
            |candidate| {
                let noun = match candidate.kind {
                    ResourceKind::Vm => "vm",
                    ResourceKind::Volume => "disk",
                };
                az([noun, "delete", "--ids", candidate.id.as_str(), "--yes"])
            },
        )
        .await)
    }
}

impl Connector for AzureConnector {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Azure
    }

    fn prepare(&mut self, planned: usize) -> ConnectorFuture<'_, ()> {
        Box::pin(self.discover(planned))
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
}
