//! OpenStack adapter driven through the unified `openstack` client.
//!
//! Every invocation carries the full set of `--os-*` authentication options,
//! with the password masked in logs. `server create --wait` blocks until the
//! server is active. The address is either parsed from the creation output
//! or, when `floating_ip` is set, taken from the pool of unassigned floating
//! IPs discovered by `prepare` and bound explicitly. Optional data volumes
//! are handled in [`volume`].

use chrono::Utc;
use tracing::{Instrument, debug, info, warn};

use crate::config::{ComputeConfig, ConnectSettings, RequiredKey};
use crate::connector::lifecycle::{
    await_ssh, delete_resource, parse_address, ssh_target, sweep_stale,
};
use crate::connector::{AddressPool, Connector, ConnectorError, ConnectorFuture, ProviderKind};
use crate::context::RunContext;
use crate::exec::{CommandArg, CommandSpec, ExecError, ExecOptions, Executor, FatalCode};
use crate::janitor::{
    ResourceKind, StaleCandidate, SweepPolicy, SweepSummary, is_protected, parse_timestamp,
};

pub mod disk_script;
mod types;
pub mod volume;

use types::{FloatingIp, Listed, Server, VolumeDetail, last_ipv4};

/// Keys the OpenStack adapter cannot work without.
pub const REQUIRED_KEYS: &[RequiredKey] = &[
    RequiredKey::new("auth_url", "identity service endpoint"),
    RequiredKey::new("username", "OpenStack user name"),
    RequiredKey::new("password", "OpenStack password"),
    RequiredKey::new("project_name", "project (tenant) name"),
    RequiredKey::new("user_domain_name", "domain of the user"),
    RequiredKey::new("interface", "endpoint interface, e.g. public"),
    RequiredKey::new("identity_api_version", "identity API version"),
    RequiredKey::new("vm_name", "name prefix of created virtual machines"),
    RequiredKey::new("key_name", "name of the registered key pair"),
    RequiredKey::new("image_name", "image name or id"),
    RequiredKey::new("flavor_name", "flavor name or id"),
    RequiredKey::new("private_key_file", "private key matching the key pair"),
    RequiredKey::new("remote_user", "login user on the image"),
];

/// Authentication options passed on every call, in client order.
fn base_options(config: &ComputeConfig) -> Vec<CommandArg> {
    let mut options: Vec<CommandArg> = vec![
        "--os-auth-url".into(),
        config.value("auth_url").into(),
        "--os-username".into(),
        config.value("username").into(),
        "--os-password".into(),
        CommandArg::secret(config.value("password")),
    ];
    let mut optional = |flag: &str, key: &str| {
        if let Some(value) = config.get(key) {
            options.push(flag.into());
            options.push(value.into());
        }
    };
    optional("--os-project-id", "project_id");
    optional("--os-project-name", "project_name");
    optional("--os-user-domain-name", "user_domain_name");
    optional("--os-region-name", "region_name");
    optional("--os-interface", "interface");
    optional("--os-identity-api-version", "identity_api_version");
    optional("--os-volume-api-version", "volume_api_version");
    options
}

/// Connector for OpenStack clouds.
#[derive(Clone, Debug)]
pub struct OpenStackConnector {
    executor: Executor,
    config: ComputeConfig,
    settings: ConnectSettings,
    base_options: Vec<CommandArg>,
    pool: AddressPool<String>,
}

impl OpenStackConnector {
    /// Validates `config`, assembles the authentication options, and checks
    /// them by issuing a token.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Configuration`] listing every missing key,
    /// or [`ConnectorError::Session`] when authentication fails.
    pub async fn initialize(
        executor: Executor,
        config: ComputeConfig,
        settings: ConnectSettings,
    ) -> Result<Self, ConnectorError> {
        config.validate(REQUIRED_KEYS)?;
        let connector = Self {
            executor,
            base_options: base_options(&config),
            config,
            settings,
            pool: AddressPool::default(),
        };
        connector
            .executor
            .execute_local(
                &connector.openstack(["token", "issue", "-f", "json"]),
                ExecOptions::new(),
            )
            .await
            .map_err(|source| ConnectorError::Session {
                provider: "openstack",
                source,
            })?;
        Ok(connector)
    }

    /// Builds an `openstack` invocation with the authentication options.
    fn openstack<I, A>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = A>,
        A: Into<CommandArg>,
    {
        CommandSpec::new("openstack")
            .args(args)
            .args(self.base_options.iter().cloned())
    }

    async fn find_floating_ips(&mut self, planned: usize) -> Result<(), ConnectorError> {
        if !self.config.flag("floating_ip") {
            return Ok(());
        }
        info!("Obtaining list of available floating IP addresses ...");
        let mut list = self.openstack(["floating", "ip", "list", "-f", "json"]);
        if let Some(network) = self.config.get("floating_ip_network") {
            list = list.args(["--network", network]);
        }
        let listed: Vec<FloatingIp> = self
            .executor
            .execute_json(&list, ExecOptions::new().fatal(FatalCode::Creation))
            .await?;
        let free: Vec<String> = listed
            .into_iter()
            .filter(|entry| entry.fixed.is_none())
            .map(|entry| entry.floating)
            .collect();
        info!("Available floating IP addresses: {}", free.join(", "));
        self.pool = AddressPool::for_batch(free, planned)?;
        Ok(())
    }

    fn create_spec(&self, name: &str, flavor: &str) -> CommandSpec {
        let mut spec = self
            .openstack(["server", "create", "--wait", "-f", "json"])
            .args(["--image", self.config.value("image_name"), "--flavor", flavor]);
        for network in self.config.list("network_name") {
            spec = spec.arg("--network").arg(network);
        }
        if let Some(group) = self.config.get("security_group") {
            spec = spec.args(["--security-group", group]);
        }
        spec.args(["--key-name", self.config.value("key_name"), name])
    }

    /// Looks up a server that may exist even though its creation failed.
    async fn recover_server_id(&self, name: &str) -> Option<String> {
        let show = self.openstack(["server", "show", "-f", "json", name]);
        let server: Server = self
            .executor
            .execute_json(&show, ExecOptions::new().quiet())
            .await
            .ok()?;
        server.id.filter(|id| !id.is_empty())
    }

    async fn assign_floating_ip(&self, ctx: &mut RunContext) -> Result<(), ConnectorError> {
        info!("Assigning floating IP address ...");
        let address = self.pool.for_run(ctx.index)?;
        let vm_id = ctx.vm_id.as_deref().unwrap_or_default();
        self.executor
            .execute_local(
                &self.openstack(["server", "add", "floating", "ip", vm_id, address.as_str()]),
                ExecOptions::new().fatal(FatalCode::Creation),
            )
            .await?;
        ctx.public_ip = Some(parse_address(address)?);
        info!("IP address {address} assigned explicitly");
        Ok(())
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

        let created: Result<Server, ExecError> = self
            .executor
            .execute_json(
                &self.create_spec(&name, &flavor),
                ExecOptions::new().fatal(FatalCode::Creation),
            )
            .await;
        let server = match created {
            Ok(server) => server,
            Err(err) => {
                if let Some(vm_id) = self.recover_server_id(&name).await {
                    warn!(vm_id = %vm_id, "Server exists despite failed creation");
                    ctx.vm_id = Some(vm_id);
                }
                return Err(err.into());
            }
        };
        debug!(response = ?server, "server create");
        let vm_id = server
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ConnectorError::creation("No virtual machine ID found"))?;
        ctx.vm_id = Some(vm_id.clone());
        info!(vm_id = %vm_id, "Virtual machine '{vm_id}' created");

        if self.config.flag("floating_ip") {
            self.assign_floating_ip(ctx).await?;
        } else {
            let addresses = server.addresses.unwrap_or_default();
            let address = last_ipv4(&addresses).ok_or_else(|| {
                ConnectorError::creation(format!("No IP address found: {addresses}"))
            })?;
            ctx.public_ip = Some(address.into());
            info!("IP address {address} assigned automatically at creation");
        }

        let target = ssh_target(&self.config, ctx)?;
        let available = await_ssh(&self.executor, &target, self.settings, ctx).await;
        if available {
            self.provision_volumes(ctx, &target).await?;
        }
        Ok(available)
    }

    async fn delete(&self, ctx: &mut RunContext) -> Result<(), ConnectorError> {
        let Some(vm_id) = ctx.vm_id.clone() else {
            return Ok(());
        };
        let mut left_behind = self.release_volumes(ctx, &vm_id).await;

        info!(vm_id = %vm_id, "Deleting virtual machine '{vm_id}' ...");
        let resource = format!("virtual machine '{vm_id}'");
        let delete = self.openstack(["server", "delete", vm_id.as_str()]);
        if delete_resource(&self.executor, &resource, &delete).await {
            info!("Virtual machine deleted");
        } else {
            left_behind.push(resource);
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

    /// Lists resources of one kind and reads their creation times.
    ///
    /// Only names carrying the prefix are inspected further; lookups that
    /// fail are logged and skipped.
    async fn list_candidates(
        &self,
        kind: ResourceKind,
        policy: &SweepPolicy,
    ) -> Result<Vec<StaleCandidate>, ConnectorError> {
        let noun = match kind {
            ResourceKind::Vm => "server",
            ResourceKind::Volume => "volume",
        };
        let listed: Vec<Listed> = self
            .executor
            .execute_json(&self.openstack([noun, "list", "-f", "json"]), ExecOptions::new())
            .await?;
        let mut candidates = Vec::new();
        for entry in listed {
            let name = entry.name.unwrap_or_default();
            if !name.starts_with(policy.name_prefix.as_str()) || is_protected(&name) {
                continue;
            }
            let show = self.openstack([noun, "show", "-f", "json", entry.id.as_str()]);
            let created = match kind {
                ResourceKind::Vm => self
                    .executor
                    .execute_json::<Server>(&show, ExecOptions::new())
                    .await
                    .map(|server| server.created),
                ResourceKind::Volume => self
                    .executor
                    .execute_json::<VolumeDetail>(&show, ExecOptions::new())
                    .await
                    .map(|volume| volume.created_at),
            };
            match created {
                Ok(Some(raw)) => {
                    if let Some(created) = parse_timestamp(&raw) {
                        candidates.push(StaleCandidate {
                            id: entry.id,
                            name,
                            kind,
                            created,
                        });
                    }
                }
                Ok(None) => {}
                Err(err) => warn!(
                    id = %entry.id,
                    "Error while accessing information of {noun} '{}': {err}",
                    entry.id
                ),
            }
        }
        Ok(candidates)
    }

    async fn sweep(&self, max_retention_hours: u64) -> Result<SweepSummary, ConnectorError> {
        let prefix = self.config.value("vm_name");
        let policy = SweepPolicy::new(prefix, max_retention_hours);
        let mut candidates = self.list_candidates(ResourceKind::Vm, &policy).await?;
        candidates.extend(self.list_candidates(ResourceKind::Volume, &policy).await?);

        Ok(sweep_stale(
            &self.executor,
            prefix,
            max_retention_hours,
            candidates,
            |candidate| match candidate.kind {
                ResourceKind::Vm => self.openstack(["server", "delete", candidate.id.as_str()]),
                ResourceKind::Volume => self.openstack(["volume", "delete", candidate.id.as_str()]),
            },
        )
        .await)
    }
}

impl Connector for OpenStackConnector {
    fn provider(&self) -> ProviderKind {
        ProviderKind::OpenStack
    }

    fn prepare(&mut self, planned: usize) -> ConnectorFuture<'_, ()> {
        Box::pin(self.find_floating_ips(planned))
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

#[cfg(test)]
mod tests;
