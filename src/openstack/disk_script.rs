//! Shell script that partitions, formats and mounts attached volumes.

/// Mount point of the main volume.
pub const MAIN_MOUNT_POINT: &str = "/mnt/cdab-volume";

/// Name of the script on the VM.
pub const REMOTE_SCRIPT_NAME: &str = "setup-disk.sh";

/// Devices to prepare and the user owning the test directory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiskLayout {
    /// Device of the main volume, mounted on [`MAIN_MOUNT_POINT`].
    pub main_device: Option<String>,
    /// Device of the temporary-storage volume, mounted on `/tmp`.
    pub tmp_device: Option<String>,
    /// Owner of the `test` directory on the main volume.
    pub owner: String,
}

fn partition(lines: &mut Vec<String>, device: &str) {
    lines.extend([
        format!("parted {device} mklabel gpt"),
        format!("parted {device} unit GB "),
        format!("parted {device} mkpart primary 0% 100%"),
        format!("mkfs.ext4 {device}1"),
    ]);
}

impl DiskLayout {
    /// Returns `true` when neither volume is present.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.main_device.is_none() && self.tmp_device.is_none()
    }

    /// Renders the script run as root on the VM.
    #[must_use]
    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        if let Some(device) = &self.main_device {
            partition(&mut lines, device);
            lines.extend([
                format!("mkdir {MAIN_MOUNT_POINT}"),
                format!("mkdir {MAIN_MOUNT_POINT}/test"),
                format!("chown {} {MAIN_MOUNT_POINT}/test", self.owner),
                format!("echo '{device}1 {MAIN_MOUNT_POINT} ext4 defaults 0 2' >> /etc/fstab"),
            ]);
        }
        if let Some(device) = &self.tmp_device {
            partition(&mut lines, device);
            if self.main_device.is_some() {
                lines.push(format!("mkdir {MAIN_MOUNT_POINT}/tmp"));
            }
            lines.push(format!("echo '{device}1 /tmp ext4 defaults 0 0' >> /etc/fstab"));
        }
        lines.push(String::from("mount -a"));
        if self.tmp_device.is_some() {
            lines.push(String::from("chmod 1777 /tmp"));
        }
        let mut script = lines.join("\n");
        script.push('\n');
        script
    }
}
