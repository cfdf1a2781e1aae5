//! Block-storage volumes attached to OpenStack VMs.
//!
//! Each volume is created, polled until `available`, attached, and polled
//! again until the server reports a device for it. A generated script then
//! partitions, formats and mounts the devices over SSH. Deletion detaches
//! attached volumes best-effort, lets the detach settle, and deletes each
//! volume with the usual retry policy.

use std::time::Duration;

use camino::Utf8Path;
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::connector::ConnectorError;
use crate::connector::lifecycle::{OperationState, delete_resource, poll_operation};
use crate::context::RunContext;
use crate::exec::{CopyDirection, ExecError, ExecOptions, FatalCode, SshTarget};
use crate::probe::{OPERATION_POLL_INTERVAL, RetryPolicy};

use super::OpenStackConnector;
use super::disk_script::{DiskLayout, REMOTE_SCRIPT_NAME};
use super::types::{VolumeDetail, attachment_device};

/// Upper bound on waiting for a volume to become available or attached.
pub const VOLUME_MAX_WAIT: Duration = Duration::from_secs(10 * 60);

/// Pause after detaching a volume before deleting it.
pub const DETACH_SETTLE: Duration = Duration::from_secs(10);

/// Purpose of an attached volume.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VolumeRole {
    /// Main data volume mounted on the test directory.
    Main,
    /// Volume backing `/tmp`.
    Tmp,
}

impl VolumeRole {
    /// Requested size in GB.
    #[must_use]
    pub const fn size_gb(self) -> u32 {
        match self {
            Self::Main => 100,
            Self::Tmp => 50,
        }
    }

    /// Appended to the VM name to form the volume name.
    #[must_use]
    pub const fn name_suffix(self) -> &'static str {
        match self {
            Self::Main => "-volume",
            Self::Tmp => "-tmp-volume",
        }
    }

    const fn label(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Tmp => "/tmp",
        }
    }
}

struct VolumeSlot<'a> {
    id: &'a mut Option<String>,
    device: &'a mut Option<String>,
    attached: &'a mut bool,
}

const fn slot(ctx: &mut RunContext, role: VolumeRole) -> VolumeSlot<'_> {
    match role {
        VolumeRole::Main => VolumeSlot {
            id: &mut ctx.volume_id,
            device: &mut ctx.volume_device,
            attached: &mut ctx.volume_attached,
        },
        VolumeRole::Tmp => VolumeSlot {
            id: &mut ctx.tmp_volume_id,
            device: &mut ctx.tmp_volume_device,
            attached: &mut ctx.tmp_volume_attached,
        },
    }
}

impl OpenStackConnector {
    /// Volumes requested by the `use_volume` and `use_tmp_volume` flags.
    pub(super) fn volume_roles(&self) -> Vec<VolumeRole> {
        [
            ("use_volume", VolumeRole::Main),
            ("use_tmp_volume", VolumeRole::Tmp),
        ]
        .into_iter()
        .filter(|(key, _)| self.config.flag(key))
        .map(|(_, role)| role)
        .collect()
    }

    async fn show_volume(&self, volume_id: &str) -> Result<VolumeDetail, ExecError> {
        self.executor
            .execute_json(
                &self.openstack(["volume", "show", "-f", "json", volume_id]),
                ExecOptions::new(),
            )
            .await
    }

    async fn volume_available(&self, volume_id: &str) -> Result<OperationState<()>, ExecError> {
        let detail = self.show_volume(volume_id).await?;
        Ok(match detail.status.as_deref() {
            Some("available") => OperationState::Done(()),
            Some(status) if status.starts_with("error") => {
                OperationState::Failed(format!("volume status is {status}"))
            }
            other => OperationState::Pending(other.unwrap_or("unknown").to_owned()),
        })
    }

    async fn volume_device(
        &self,
        volume_id: &str,
        server_id: &str,
    ) -> Result<OperationState<String>, ExecError> {
        let detail = self.show_volume(volume_id).await?;
        let status = detail.status.as_deref().unwrap_or("unknown");
        if status.starts_with("error") {
            return Ok(OperationState::Failed(format!("volume status is {status}")));
        }
        let device = detail
            .attachments
            .as_ref()
            .and_then(|attachments| attachment_device(attachments, server_id));
        Ok(match device {
            Some(device) if status == "in-use" => OperationState::Done(device),
            _ => OperationState::Pending(status.to_owned()),
        })
    }

    async fn create_volume(
        &self,
        ctx: &mut RunContext,
        role: VolumeRole,
    ) -> Result<String, ConnectorError> {
        info!("Creating {} volume for virtual machine ...", role.label());
        let name = format!(
            "{}{}",
            ctx.full_name(self.config.value("vm_name")),
            role.name_suffix()
        );
        let size = role.size_gb().to_string();
        let created: VolumeDetail = self
            .executor
            .execute_json(
                &self.openstack([
                    "volume",
                    "create",
                    "-f",
                    "json",
                    "--size",
                    size.as_str(),
                    name.as_str(),
                ]),
                ExecOptions::new().fatal(FatalCode::Creation),
            )
            .await?;
        let volume_id = created
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                ConnectorError::creation(format!("No ID found for {} volume", role.label()))
            })?;
        *slot(ctx, role).id = Some(volume_id.clone());
        info!(volume_id = %volume_id, "Volume '{volume_id}' created");
        Ok(volume_id)
    }

    async fn attach_volume(
        &self,
        ctx: &mut RunContext,
        role: VolumeRole,
        server_id: &str,
        volume_id: &str,
    ) -> Result<(), ConnectorError> {
        let policy = RetryPolicy::operation(OPERATION_POLL_INTERVAL, VOLUME_MAX_WAIT);
        poll_operation("volume creation", policy, move || {
            self.volume_available(volume_id)
        })
        .await?;

        info!("Attaching volume to virtual machine ...");
        self.executor
            .execute_local(
                &self.openstack(["server", "add", "volume", server_id, volume_id]),
                ExecOptions::new().fatal(FatalCode::Creation),
            )
            .await?;

        let device = poll_operation("volume attachment", policy, move || {
            self.volume_device(volume_id, server_id)
        })
        .await?;
        info!(device = %device, "Volume attached as {device}");
        let target = slot(ctx, role);
        *target.device = Some(device);
        *target.attached = true;
        Ok(())
    }

    async fn run_disk_script(
        &self,
        ctx: &RunContext,
        target: &SshTarget,
        layout: &DiskLayout,
    ) -> Result<(), ConnectorError> {
        let workspace = tempfile::tempdir().map_err(|err| ConnectorError::Io {
            path: String::from("temporary directory"),
            message: err.to_string(),
        })?;
        let root = Utf8Path::from_path(workspace.path()).ok_or_else(|| ConnectorError::Io {
            path: workspace.path().display().to_string(),
            message: String::from("path is not valid UTF-8"),
        })?;
        let file_name = format!("setup-disk{}.sh", ctx.suffix);
        let local = root.join(&file_name);
        let io_error = |err: std::io::Error| ConnectorError::Io {
            path: local.to_string(),
            message: err.to_string(),
        };
        let dir = Dir::open_ambient_dir(root, ambient_authority()).map_err(io_error)?;
        dir.write(&file_name, layout.render()).map_err(io_error)?;

        let fatal = ExecOptions::new().fatal(FatalCode::Creation);
        self.executor
            .copy_file(target, &local, REMOTE_SCRIPT_NAME, CopyDirection::ToRemote, fatal)
            .await?;
        self.executor
            .execute_remote(target, format!("sudo sh {REMOTE_SCRIPT_NAME}"), fatal)
            .await?;
        Ok(())
    }

    /// Creates, attaches and mounts the configured volumes.
    pub(super) async fn provision_volumes(
        &self,
        ctx: &mut RunContext,
        target: &SshTarget,
    ) -> Result<(), ConnectorError> {
        let roles = self.volume_roles();
        if roles.is_empty() {
            return Ok(());
        }
        let server_id = ctx
            .vm_id
            .clone()
            .ok_or_else(|| ConnectorError::creation("No virtual machine ID found"))?;
        for role in roles {
            let volume_id = self.create_volume(ctx, role).await?;
            self.attach_volume(ctx, role, &server_id, &volume_id).await?;
        }
        let layout = DiskLayout {
            main_device: ctx.volume_device.clone(),
            tmp_device: ctx.tmp_volume_device.clone(),
            owner: self.config.value("remote_user").to_owned(),
        };
        self.run_disk_script(ctx, target, &layout).await
    }

    /// Detaches and deletes every volume recorded in `ctx`, returning the
    /// volumes left behind.
    pub(super) async fn release_volumes(&self, ctx: &mut RunContext, server_id: &str) -> Vec<String> {
        let mut left_behind = Vec::new();
        for role in [VolumeRole::Main, VolumeRole::Tmp] {
            let current = slot(ctx, role);
            let Some(volume_id) = current.id.clone() else {
                continue;
            };
            if *current.attached {
                info!("Detaching {} volume from virtual machine ...", role.label());
                let detach = self.openstack(["server", "remove", "volume", server_id, volume_id.as_str()]);
                if let Err(err) = self.executor.execute_local(&detach, ExecOptions::new()).await {
                    warn!(error = %err, "Detaching volume failed");
                }
                sleep(DETACH_SETTLE).await;
            }

            info!(volume_id = %volume_id, "Deleting volume {volume_id} ...");
            let resource = format!("volume '{volume_id}'");
            let delete = self.openstack(["volume", "delete", volume_id.as_str()]);
            if delete_resource(&self.executor, &resource, &delete).await {
                info!("Volume deleted");
                let released = slot(ctx, role);
                *released.id = None;
                *released.device = None;
                *released.attached = false;
            } else {
                left_behind.push(resource);
            }
        }
        left_behind
    }
}
