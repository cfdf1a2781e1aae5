//! Errors surfaced by connectors.

use thiserror::Error;

use crate::config::ConfigError;
use crate::exec::{ExecError, FatalCode};

/// Errors raised by the connector contract.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// The compute configuration is incomplete or invalid.
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    /// Establishing vendor credentials failed.
    #[error("failed to establish {provider} session: {source}")]
    Session {
        /// Provider tag.
        provider: &'static str,
        /// Underlying command failure.
        #[source]
        source: ExecError,
    },
    /// Fewer pre-allocated addresses exist than VMs are planned.
    #[error("Not enough free addresses for {needed} virtual machines ({available} available)")]
    InsufficientAddresses {
        /// Addresses discovered.
        available: usize,
        /// VMs planned.
        needed: usize,
    },
    /// No address was reserved for the run at `index`.
    #[error("no address reserved for run {index}; was prepare() called?")]
    NoAddressForRun {
        /// Zero-based run index.
        index: usize,
    },
    /// The VM or one of its resources could not be created.
    #[error("{message}")]
    Creation {
        /// Description including the vendor payload.
        message: String,
    },
    /// A vendor operation finished in a failed state.
    #[error("operation {operation} failed: {payload}")]
    Operation {
        /// Operation being awaited.
        operation: String,
        /// Raw vendor error payload.
        payload: String,
    },
    /// A vendor operation did not finish in time.
    #[error("operation {operation} did not complete after {attempts} polls")]
    OperationTimeout {
        /// Operation being awaited.
        operation: String,
        /// Polls made.
        attempts: u32,
    },
    /// A command failed.
    #[error(transparent)]
    Exec(#[from] ExecError),
    /// Some resources could not be deleted after all retries.
    #[error("failed to delete {}", .resources.join(", "))]
    Deletion {
        /// Resources left behind.
        resources: Vec<String>,
    },
    /// A local file needed by the connector could not be written.
    #[error("failed to write {path}: {message}")]
    Io {
        /// File path.
        path: String,
        /// Underlying error text.
        message: String,
    },
}

impl ConnectorError {
    /// Wraps any failure raised while creating a VM as a creation error.
    #[must_use]
    pub fn creation(err: impl std::fmt::Display) -> Self {
        Self::Creation {
            message: err.to_string(),
        }
    }

    /// Process exit code implied by this error.
    #[must_use]
    pub fn exit_code(&self) -> FatalCode {
        match self {
            Self::Configuration(_) | Self::Session { .. } => FatalCode::Configuration,
            Self::Deletion { .. } => FatalCode::Deletion,
            Self::Exec(err) => err.fatal_code().unwrap_or(FatalCode::Creation),
            Self::InsufficientAddresses { .. }
            | Self::NoAddressForRun { .. }
            | Self::Creation { .. }
            | Self::Operation { .. }
            | Self::OperationTimeout { .. }
            | Self::Io { .. } => FatalCode::Creation,
        }
    }
}
