//! Error taxonomy shared by the object graph, the operations and the RPC layer.

use std::fmt;
use std::io;

use thiserror::Error;

/// Every failure an operation can surface to a caller.
///
/// The variants are stable: the RPC layer maps each one to a fixed error
/// code and a `kind` string so clients can branch on them.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    NotSupported(String),

    #[error("Not authorized to perform operation: {0}")]
    Unauthorized(String),

    #[error("{0}")]
    DeviceBusy(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Cancelled(String),

    #[error("Error running {tool}: {status}: {stderr}")]
    ExternalToolFailed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("{0}")]
    Failed(String),
}

impl StorageError {
    /// Wrap an I/O error with a short description of what was attempted.
    pub fn io(what: impl fmt::Display, err: io::Error) -> Self {
        StorageError::Failed(format!("{}: {}", what, err))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StorageError::NotFound(_) => "not-found",
            StorageError::NotSupported(_) => "not-supported",
            StorageError::Unauthorized(_) => "unauthorized",
            StorageError::DeviceBusy(_) => "device-busy",
            StorageError::Timeout(_) => "timeout",
            StorageError::Cancelled(_) => "cancelled",
            StorageError::ExternalToolFailed { .. } => "external-tool-failed",
            StorageError::Failed(_) => "failed",
        }
    }

    /// JSON-RPC error code (server-defined range).
    pub fn code(&self) -> i32 {
        match self {
            StorageError::Failed(_) => -32000,
            StorageError::NotFound(_) => -32001,
            StorageError::NotSupported(_) => -32002,
            StorageError::Unauthorized(_) => -32003,
            StorageError::DeviceBusy(_) => -32004,
            StorageError::Timeout(_) => -32005,
            StorageError::Cancelled(_) => -32006,
            StorageError::ExternalToolFailed { .. } => -32007,
        }
    }
}

/// Steps of the format workflow, used to tag a failure with where it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FormatStep {
    Validate,
    Authorize,
    TearDown,
    Wipe,
    Erase,
    EncryptFormat,
    EncryptOpen,
    Create,
    TakeOwnership,
    SetPartitionType,
    Configure,
}

impl fmt::Display for FormatStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FormatStep::Validate => "validate",
            FormatStep::Authorize => "authorize",
            FormatStep::TearDown => "tear-down",
            FormatStep::Wipe => "wipe",
            FormatStep::Erase => "erase",
            FormatStep::EncryptFormat => "encrypt-format",
            FormatStep::EncryptOpen => "encrypt-open",
            FormatStep::Create => "create",
            FormatStep::TakeOwnership => "take-ownership",
            FormatStep::SetPartitionType => "set-partition-type",
            FormatStep::Configure => "configure",
        };
        f.write_str(name)
    }
}

/// Terminal error of a format run: the failing step plus the underlying cause.
#[derive(Debug, Error)]
#[error("{step}: {source}")]
pub struct FormatError {
    pub step: FormatStep,
    #[source]
    pub source: StorageError,
}

impl FormatError {
    pub fn new(step: FormatStep, source: StorageError) -> Self {
        Self { step, source }
    }
}

/// Attach a [`FormatStep`] to a `Result<_, StorageError>`.
pub trait StepExt<T> {
    fn at(self, step: FormatStep) -> Result<T, FormatError>;
}

impl<T> StepExt<T> for Result<T, StorageError> {
    fn at(self, step: FormatStep) -> Result<T, FormatError> {
        self.map_err(|source| FormatError::new(step, source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_failure_embeds_stderr() {
        let err = StorageError::ExternalToolFailed {
            tool: "mkfs.ext4".to_string(),
            status: "exit status: 1".to_string(),
            stderr: "device is busy".to_string(),
        };
        assert!(err.to_string().contains("device is busy"));
        assert_eq!(err.kind(), "external-tool-failed");
    }

    #[test]
    fn format_error_names_step() {
        let err: Result<(), _> = Err(StorageError::Timeout("timed out".into()));
        let err = err.at(FormatStep::Wipe).unwrap_err();
        assert_eq!(err.step, FormatStep::Wipe);
        assert_eq!(err.to_string(), "wipe: timed out");
    }
}
