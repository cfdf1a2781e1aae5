//! Amazon EC2 adapter driven through the `aws` CLI.
//!
//! EC2 returns the instance id as soon as the launch request is accepted, so
//! the id is recorded immediately and the CLI waiter blocks until the
//! instance is running. The public address is assigned automatically and
//! read back with `describe-instances`. Credentials travel as environment
//! variables on every invocation, with the secret key masked in logs.

use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{Instrument, info, warn};

use crate::config::{ComputeConfig, ConnectSettings, RequiredKey};
use crate::connector::lifecycle::{
    await_ssh, delete_resource, parse_address, ssh_target, sweep_stale,
};
use crate::connector::{Connector, ConnectorError, ConnectorFuture, ProviderKind};
use crate::context::RunContext;
use crate::exec::{CommandArg, CommandSpec, ExecOptions, Executor, FatalCode};
use crate::janitor::{ResourceKind, StaleCandidate, SweepSummary, parse_timestamp};

mod types;

use types::{DescribeInstancesResponse, DescribeVolumesResponse, RunInstancesResponse, name_tag};

/// Keys the Amazon adapter cannot work without.
pub const REQUIRED_KEYS: &[RequiredKey] = &[
    RequiredKey::new("username", "AWS access key id"),
    RequiredKey::new("password", "AWS secret access key"),
    RequiredKey::new("region_name", "AWS region"),
    RequiredKey::new("key_name", "name of the EC2 key pair"),
    RequiredKey::new("vm_name", "name prefix of created virtual machines"),
    RequiredKey::new("image_name", "AMI id"),
    RequiredKey::new("flavor_name", "EC2 instance type"),
    RequiredKey::new("security_group", "security group id"),
    RequiredKey::new("private_key_file", "private key matching the key pair"),
    RequiredKey::new("remote_user", "login user on the image"),
];

/// Size of the boot volume in GB.
pub const BOOT_VOLUME_GB: u32 = 20;

const RUNNING_WAIT_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Connector for Amazon EC2.
#[derive(Clone, Debug)]
pub struct AmazonConnector {
    executor: Executor,
    config: ComputeConfig,
    settings: ConnectSettings,
}

impl AmazonConnector {
    /// Validates `config` and checks the credentials with STS.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Configuration`] listing every missing key,
    /// or [`ConnectorError::Session`] when the credentials are rejected.
    pub async fn initialize(
        executor: Executor,
        config: ComputeConfig,
        settings: ConnectSettings,
    ) -> Result<Self, ConnectorError> {
        config.validate(REQUIRED_KEYS)?;
        if config.flag("floating_ip") {
            warn!(
                "Amazon AWS EC2 instances have external IP addresses assigned automatically, 'floating_ip' setting is ignored"
            );
        }
        let connector = Self {
            executor,
            config,
            settings,
        };
        connector
            .executor
            .execute_local(
                &connector.aws(["sts", "get-caller-identity"]),
                ExecOptions::new(),
            )
            .await
            .map_err(|source| ConnectorError::Session {
                provider: "amazon",
                source,
            })?;
        Ok(connector)
    }

    fn aws<I, A>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = A>,
        A: Into<CommandArg>,
    {
        CommandSpec::new("aws")
            .env("AWS_ACCESS_KEY_ID", self.config.value("username"))
            .env(
                "AWS_SECRET_ACCESS_KEY",
                CommandArg::secret(self.config.value("password")),
            )
            .env("AWS_DEFAULT_REGION", self.config.value("region_name"))
            .args(args)
            .args(["--output", "json"])
    }

    fn run_instances_spec(&self, name: &str, flavor: &str) -> CommandSpec {
        let block_devices = json!([{
            "DeviceName": "/dev/sda1",
            "Ebs": { "DeleteOnTermination": true, "VolumeSize": BOOT_VOLUME_GB }
        }]);
        self.aws([
            "ec2",
            "run-instances",
            "--image-id",
            self.config.value("image_name"),
            "--instance-type",
            flavor,
            "--key-name",
            self.config.value("key_name"),
            "--security-group-ids",
            self.config.value("security_group"),
            "--count",
            "1",
        ])
        .arg("--block-device-mappings")
        .arg(block_devices.to_string())
        .arg("--tag-specifications")
        .arg(format!(
            "ResourceType=instance,Tags=[{{Key=Name,Value={name}}}]"
        ))
        .arg(format!("ResourceType=volume,Tags=[{{Key=Name,Value={name}}}]"))
    }

    async fn create(&self, ctx: &mut RunContext) -> Result<bool, ConnectorError> {
        let fatal = ExecOptions::new().fatal(FatalCode::Creation);
        let name = ctx.full_name(self.config.value("vm_name"));
        let flavor = if ctx.flavor.is_empty() {
            self.config.value("flavor_name").to_owned()
        } else {
            ctx.flavor.clone()
        };
        ctx.vm_name = Some(name.clone());
        ctx.create_start_time = Some(Utc::now());
        info!(name = %name, flavor = %flavor, "Creating virtual machine ...");

        let launched: RunInstancesResponse = self
            .executor
            .execute_json(&self.run_instances_spec(&name, &flavor), fatal)
            .await?;
        let instance_id = launched
            .instances
            .into_iter()
            .next()
            .map(|instance| instance.instance_id)
            .ok_or_else(|| ConnectorError::creation("run-instances returned no instance"))?;
        ctx.vm_id = Some(instance_id.clone());

        self.executor
            .execute_local(
                &self
                    .aws(["ec2", "wait", "instance-running", "--instance-ids", instance_id.as_str()])
                    .timeout(RUNNING_WAIT_TIMEOUT),
                fatal,
            )
            .await?;

        let described: DescribeInstancesResponse = self
            .executor
            .execute_json(
                &self.aws(["ec2", "describe-instances", "--instance-ids", instance_id.as_str()]),
                fatal,
            )
            .await?;
        let address = described
            .reservations
            .into_iter()
            .flat_map(|reservation| reservation.instances)
            .find_map(|instance| instance.public_ip_address)
            .ok_or_else(|| ConnectorError::creation("No IP address found"))?;
        ctx.public_ip = Some(parse_address(&address)?);
        info!(ip = %address, "IP address is {address}");

        let target = ssh_target(&self.config, ctx)?;
        Ok(await_ssh(&self.executor, &target, self.settings, ctx).await)
    }

    async fn delete(&self, ctx: &mut RunContext) -> Result<(), ConnectorError> {
        let Some(vm_id) = ctx.vm_id.clone() else {
            return Ok(());
        };
        info!(vm_id = %vm_id, "Deleting virtual machine ...");
        let spec = self.aws(["ec2", "terminate-instances", "--instance-ids", vm_id.as_str()]);
        let resource = format!("virtual machine '{vm_id}'");
        if delete_resource(&self.executor, &resource, &spec).await {
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
        let prefix = self.config.value("vm_name");
        let name_filter = format!("Name=tag:Name,Values={prefix}*");
        let instances: DescribeInstancesResponse = self
            .executor
            .execute_json(
                &self.aws([
                    "ec2",
                    "describe-instances",
                    "--filters",
                    name_filter.as_str(),
                    "Name=instance-state-name,Values=pending,running,stopping,stopped",
                ]),
                ExecOptions::new(),
            )
            .await?;
        let volumes: DescribeVolumesResponse = self
            .executor
            .execute_json(
                &self.aws([
                    "ec2",
                    "describe-volumes",
                    "--filters",
                    name_filter.as_str(),
                    "Name=status,Values=available",
                ]),
                ExecOptions::new(),
            )
            .await?;

        let vm_candidates = instances
            .reservations
            .into_iter()
            .flat_map(|reservation| reservation.instances)
            .filter_map(|instance| {
                Some(StaleCandidate {
                    name: name_tag(&instance.tags)?.to_owned(),
                    created: parse_timestamp(instance.launch_time.as_deref()?)?,
                    id: instance.instance_id,
                    kind: ResourceKind::Vm,
                })
            });
        let volume_candidates = volumes.volumes.into_iter().filter_map(|volume| {
            Some(StaleCandidate {
                name: name_tag(&volume.tags)?.to_owned(),
                created: parse_timestamp(volume.create_time.as_deref()?)?,
                id: volume.volume_id,
                kind: ResourceKind::Volume,
            })
        });
        let candidates = vm_candidates.chain(volume_candidates).collect();

        Ok(sweep_stale(
            &self.executor,
            prefix,
            max_retention_hours,
            candidates,
            |candidate| match candidate.kind {
                ResourceKind::Vm => {
                    self.aws(["ec2", "terminate-instances", "--instance-ids", candidate.id.as_str()])
                }
                ResourceKind::Volume => {
                    self.aws(["ec2", "delete-volume", "--volume-id", candidate.id.as_str()])
                }
            },
        )
        .await)
    }
}

impl Connector for AmazonConnector {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Amazon
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
}
