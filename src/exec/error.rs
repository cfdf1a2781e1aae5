//! Executor errors, failure classification, and fatal exit codes.

use thiserror::Error;

/// Process exit codes reserved for unrecoverable failures.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FatalCode {
    /// Missing or invalid configuration.
    Configuration,
    /// VM or attached resource creation failed.
    Creation,
    /// A command on the VM failed.
    RemoteCommand,
    /// At least one resource could not be deleted.
    Deletion,
}

impl FatalCode {
    /// Numeric exit status for the process.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Configuration => 10,
            Self::Creation => 11,
            Self::RemoteCommand => 12,
            Self::Deletion => 13,
        }
    }
}

/// How a failed vendor call should be treated by retry logic.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureKind {
    /// Worth retrying.
    Transient,
    /// Authentication, authorization, or quota failures; never retried.
    Permanent,
    /// The target no longer exists.
    NotFound,
}

const PERMANENT_MARKERS: &[&str] = &[
    "unauthorized",
    "authfailure",
    "authorizationfailed",
    "authenticationfailed",
    "authentication failed",
    "invalidclienttokenid",
    "permission_denied",
    "forbidden",
    "quotaexceeded",
    "quota exceeded",
    "insufficient quota",
];

const NOT_FOUND_MARKERS: &[&str] = &[
    "notfound",
    "not found",
    "was not found",
    "could not be found",
    "does not exist",
    "no server with a name or id",
    "no volume with a name or id",
];

impl FailureKind {
    /// Classifies a vendor error payload by well-known markers.
    #[must_use]
    pub fn classify(stderr: &str) -> Self {
        let lowered = stderr.to_lowercase();
        if PERMANENT_MARKERS.iter().any(|marker| lowered.contains(marker)) {
            Self::Permanent
        } else if NOT_FOUND_MARKERS.iter().any(|marker| lowered.contains(marker)) {
            Self::NotFound
        } else {
            Self::Transient
        }
    }
}

/// Errors raised while executing local or remote commands.
///
/// Commands embedded in messages are always rendered with masking applied.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The process could not be started.
    #[error("failed to spawn {command}: {message}")]
    Spawn {
        /// Rendered command.
        command: String,
        /// Operating system error text.
        message: String,
    },
    /// The process exceeded its time budget and was killed.
    #[error("{command} timed out after {timeout_secs}s")]
    Timeout {
        /// Rendered command.
        command: String,
        /// Configured limit.
        timeout_secs: u64,
    },
    /// The process exited unsuccessfully.
    #[error("Error during command execution: {command} (exit code {code:?}): {stderr}")]
    Failed {
        /// Rendered command.
        command: String,
        /// Exit status, if the process was not killed by a signal.
        code: Option<i32>,
        /// Raw vendor error payload.
        stderr: String,
        /// Classification of `stderr`.
        kind: FailureKind,
    },
    /// Output was expected to be JSON but could not be parsed.
    #[error("Invalid response (not JSON) from {command}: {message}")]
    InvalidResponse {
        /// Rendered command.
        command: String,
        /// Parser error.
        message: String,
    },
    /// A failure the caller marked as fatal.
    #[error("{source}")]
    Fatal {
        /// Exit code the process should terminate with.
        code: FatalCode,
        /// Underlying failure.
        #[source]
        source: Box<ExecError>,
    },
}

impl ExecError {
    /// Retry classification of this failure.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Spawn { .. } | Self::Timeout { .. } | Self::InvalidResponse { .. } => {
                FailureKind::Transient
            }
            Self::Failed { kind, .. } => *kind,
            Self::Fatal { source, .. } => source.kind(),
        }
    }

    /// Exit code attached by the caller, if any.
    #[must_use]
    pub const fn fatal_code(&self) -> Option<FatalCode> {
        match self {
            Self::Fatal { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Raw error output of the failed process, if any.
    #[must_use]
    pub fn payload(&self) -> Option<&str> {
        match self {
            Self::Failed { stderr, .. } => Some(stderr),
            Self::Fatal { source, .. } => source.payload(),
            _ => None,
        }
    }
}
