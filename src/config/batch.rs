//! Batch-wide settings loaded via `ortho-config`.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Default number of SSH probes per round.
pub const DEFAULT_CONNECT_RETRIES: u32 = 20;

/// Default pause between SSH probes, in seconds.
pub const DEFAULT_CONNECT_INTERVAL_SECS: u64 = 5;

/// Settings shared by every run of a batch. Values merge defaults,
/// configuration files, and `BENCHVM_*` environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "BENCHVM",
    discovery(
        app_name = "benchvm",
        env_var = "BENCHVM_CONFIG_PATH",
        config_file_name = "benchvm.toml",
        dotfile_name = ".benchvm.toml",
        project_file_name = "benchvm.toml"
    )
)]
pub struct BatchConfig {
    /// SSH probes per availability round.
    #[ortho_config(default = DEFAULT_CONNECT_RETRIES)]
    pub connect_retries: u32,
    /// Seconds between SSH probes.
    #[ortho_config(default = DEFAULT_CONNECT_INTERVAL_SECS)]
    pub connect_interval: u64,
    /// Number of VMs created by a batch.
    #[ortho_config(default = 1)]
    pub total_vm_count: u32,
    /// Age in hours after which tagged resources are reclaimed.
    #[ortho_config(default = 24)]
    pub max_retention_hours: u64,
    /// Timeout of each SSH probe, in seconds.
    #[ortho_config(default = 10)]
    pub ssh_probe_timeout: u64,
    /// Writes secrets to logs unmasked.
    #[ortho_config(default = false)]
    pub show_secrets: bool,
}

/// Errors raised when loading the batch configuration from layered sources.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum BatchConfigError {
    /// Indicates that parsing or merging configuration layers failed.
    #[error("batch configuration parsing failed: {0}")]
    Parse(String),
    /// A value is out of range.
    #[error("invalid batch setting {field}: {message}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// Why it was rejected.
        message: String,
    },
}

impl BatchConfig {
    /// Loads configuration from defaults, files, and environment variables
    /// without parsing the process arguments.
    ///
    /// # Errors
    ///
    /// Returns [`BatchConfigError::Parse`] when merging sources fails and
    /// [`BatchConfigError::Invalid`] when validation fails.
    pub fn load_without_cli_args() -> Result<Self, BatchConfigError> {
        let config = Self::load_from_iter([std::ffi::OsString::from("benchvm")])
            .map_err(|err| BatchConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings that would make probing meaningless.
    ///
    /// # Errors
    ///
    /// Returns [`BatchConfigError::Invalid`] for a zero retry count or VM
    /// count.
    pub fn validate(&self) -> Result<(), BatchConfigError> {
        if self.connect_retries == 0 {
            return Err(BatchConfigError::Invalid {
                field: "connect_retries",
                message: String::from("must be at least 1"),
            });
        }
        if self.total_vm_count == 0 {
            return Err(BatchConfigError::Invalid {
                field: "total_vm_count",
                message: String::from("must be at least 1"),
            });
        }
        Ok(())
    }

    /// SSH probing parameters derived from this configuration.
    #[must_use]
    pub const fn connect_settings(&self) -> ConnectSettings {
        ConnectSettings {
            retries: self.connect_retries,
            interval: Duration::from_secs(self.connect_interval),
            probe_timeout: Duration::from_secs(self.ssh_probe_timeout),
        }
    }
}

/// SSH availability probing parameters handed to connectors.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnectSettings {
    /// Probes per round.
    pub retries: u32,
    /// Pause between probes.
    pub interval: Duration,
    /// Timeout of a single probe.
    pub probe_timeout: Duration,
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            retries: DEFAULT_CONNECT_RETRIES,
            interval: Duration::from_secs(DEFAULT_CONNECT_INTERVAL_SECS),
            probe_timeout: Duration::from_secs(10),
        }
    }
}
