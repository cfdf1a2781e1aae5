//! Per-VM state threaded through creation, use, and deletion.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use tracing::{Span, info_span};

/// Mutable record of one transient VM and the resources attached to it.
///
/// Identifiers are `None` until the provider has acknowledged the resource,
/// so deletion only targets resources that were actually created.
#[derive(Clone, Debug)]
pub struct RunContext {
    /// Zero-based position of the run in its batch.
    pub index: usize,
    /// Suffix appended to the configured VM name.
    pub suffix: String,
    /// Instance type requested for the VM.
    pub flavor: String,
    /// Short tag attached to every log line of this run.
    pub short_name: String,
    /// Full VM name, set once creation starts.
    pub vm_name: Option<String>,
    /// Provider identifier of the VM.
    pub vm_id: Option<String>,
    /// Identifier of the main data volume.
    pub volume_id: Option<String>,
    /// Identifier of the temporary-storage volume.
    pub tmp_volume_id: Option<String>,
    /// Device path of the main volume on the VM.
    pub volume_device: Option<String>,
    /// Device path of the temporary-storage volume on the VM.
    pub tmp_volume_device: Option<String>,
    /// Identifier of a boot disk that outlives the VM.
    pub os_disk_id: Option<String>,
    /// Whether the main volume is attached.
    pub volume_attached: bool,
    /// Whether the temporary-storage volume is attached.
    pub tmp_volume_attached: bool,
    /// Address the VM is reachable at.
    pub public_ip: Option<IpAddr>,
    /// When the creation request was issued.
    pub create_start_time: Option<DateTime<Utc>>,
    /// When the VM first accepted an SSH command.
    pub ssh_ready_time: Option<DateTime<Utc>>,
    /// When deletion completed.
    pub delete_end_time: Option<DateTime<Utc>>,
    span: Span,
}

impl RunContext {
    /// Creates the context for run `index` of a batch.
    #[must_use]
    pub fn new(index: usize, suffix: impl Into<String>, flavor: impl Into<String>) -> Self {
        let short_name = format!("run-{}", index + 1);
        let span = info_span!("run", run = %short_name);
        Self {
            index,
            suffix: suffix.into(),
            flavor: flavor.into(),
            short_name,
            vm_name: None,
            vm_id: None,
            volume_id: None,
            tmp_volume_id: None,
            volume_device: None,
            tmp_volume_device: None,
            os_disk_id: None,
            volume_attached: false,
            tmp_volume_attached: false,
            public_ip: None,
            create_start_time: None,
            ssh_ready_time: None,
            delete_end_time: None,
            span,
        }
    }

    /// Span that tags log output with this run.
    #[must_use]
    pub const fn span(&self) -> &Span {
        &self.span
    }

    /// Name for a VM whose configured prefix is `prefix`.
    #[must_use]
    pub fn full_name(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.suffix)
    }

    /// Public address as text, or an empty string before assignment.
    #[must_use]
    pub fn public_ip_text(&self) -> String {
        self.public_ip.map(|ip| ip.to_string()).unwrap_or_default()
    }

    /// Returns `true` when no resource of this run is known to exist.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.vm_id.is_none()
            && self.volume_id.is_none()
            && self.tmp_volume_id.is_none()
            && self.os_disk_id.is_none()
    }

    /// Forgets every resource identifier after a completed deletion.
    pub fn clear_resources(&mut self) {
        self.vm_id = None;
        self.volume_id = None;
        self.tmp_volume_id = None;
        self.volume_device = None;
        self.tmp_volume_device = None;
        self.os_disk_id = None;
        self.volume_attached = false;
        self.tmp_volume_attached = false;
        self.delete_end_time = Some(Utc::now());
    }
}
