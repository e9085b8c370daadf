//! Error types for kvmgr.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using kvmgr's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in kvmgr operations.
#[derive(Error, Debug)]
pub enum Error {
    // VM lifecycle errors
    /// VM not found.
    #[error("vm not found: {0}")]
    VmNotFound(String),

    /// Hypervisor call failed.
    #[error("hypervisor error: {0}")]
    Hypervisor(String),

    /// VM creation parameters were rejected.
    #[error("invalid vm parameters: {0}")]
    InvalidParams(String),

    // Export errors
    /// Requested export format is not one of the supported formats.
    #[error("unsupported export format: {0}")]
    UnsupportedFormat(String),

    /// Export options were rejected before scheduling.
    #[error("invalid export options: {key}: {reason}")]
    InvalidOptions {
        /// Offending option key.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// Export job not found.
    #[error("export job not found: {0}")]
    JobNotFound(String),

    /// Requested state transition is not allowed.
    #[error("{0}")]
    IllegalTransition(String),

    /// Format conversion failed.
    #[error("{format} conversion failed: {message}")]
    ConversionFailed {
        /// Target format name.
        format: String,
        /// Error message, including tool output.
        message: String,
    },

    /// Operation was canceled.
    #[error("operation canceled: {0}")]
    Canceled(String),

    // Storage errors
    /// Generic storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Cloud-init materialization failed.
    #[error("cloud-init error: {0}")]
    CloudInit(String),

    /// VM template lookup or application failed.
    #[error("template error: {0}")]
    Template(String),

    // Configuration errors
    /// Generic configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    // Command execution errors
    /// External command failed.
    #[error("command failed: {command}: {message}")]
    CommandFailed {
        /// The command that failed.
        command: String,
        /// Error message.
        message: String,
        /// Whatever the command wrote to stdout before failing.
        stdout: Vec<u8>,
    },

    /// External command is not installed.
    #[error("command not found: {0}")]
    CommandNotFound(String),

    /// External command exceeded its timeout.
    #[error("command timed out after {}: {command}", humantime::format_duration(*after))]
    Timeout {
        /// The command that timed out.
        command: String,
        /// Configured timeout.
        after: Duration,
    },

    /// XML rendering or parsing failed.
    #[error("xml error: {0}")]
    Xml(String),

    /// Unreachable state or broken invariant.
    #[error("internal error: {0}")]
    Internal(String),

    // IO errors
    /// IO error wrapper.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error codes surfaced to callers. The transport layer maps these to its own
/// status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    /// The VM does not exist.
    #[serde(rename = "VMNotFound")]
    VmNotFound,
    /// The export format is not supported.
    UnsupportedFormat,
    /// Options or parameters were rejected.
    InvalidOptions,
    /// The export job does not exist.
    JobNotFound,
    /// The job or VM is in the wrong state.
    IllegalTransition,
    /// An external conversion tool failed.
    ConversionFailed,
    /// Anything else.
    InternalError,
}

impl ErrorCode {
    /// Stable name of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::VmNotFound => "VMNotFound",
            ErrorCode::UnsupportedFormat => "UnsupportedFormat",
            ErrorCode::InvalidOptions => "InvalidOptions",
            ErrorCode::JobNotFound => "JobNotFound",
            ErrorCode::IllegalTransition => "IllegalTransition",
            ErrorCode::ConversionFailed => "ConversionFailed",
            ErrorCode::InternalError => "InternalError",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Create an invalid options error for `key`.
    pub fn invalid_options(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidOptions {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a conversion failed error for `format`.
    pub fn conversion_failed(format: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConversionFailed {
            format: format.into(),
            message: message.into(),
        }
    }

    /// Create a command failed error with no captured stdout.
    pub fn command_failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
            stdout: Vec::new(),
        }
    }

    /// Create a hypervisor error with a message.
    pub fn hypervisor(msg: impl Into<String>) -> Self {
        Self::Hypervisor(msg.into())
    }

    /// Create a storage error with a message.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an internal error with a message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error stems from cancellation.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled(_))
    }

    /// Map to the caller-facing error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::VmNotFound(_) => ErrorCode::VmNotFound,
            Error::UnsupportedFormat(_) => ErrorCode::UnsupportedFormat,
            Error::InvalidOptions { .. } | Error::InvalidParams(_) => ErrorCode::InvalidOptions,
            Error::JobNotFound(_) => ErrorCode::JobNotFound,
            Error::IllegalTransition(_) => ErrorCode::IllegalTransition,
            Error::ConversionFailed { .. }
            | Error::CommandFailed { .. }
            | Error::Timeout { .. } => ErrorCode::ConversionFailed,
            _ => ErrorCode::InternalError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_options_includes_key_and_reason() {
        let err = Error::invalid_options("compression", "must be between 0 and 9");
        let msg = err.to_string();
        assert!(msg.contains("compression"), "Error should include option key");
        assert!(msg.contains("between 0 and 9"), "Error should include reason");
    }

    #[test]
    fn test_conversion_failed_has_format_prefix() {
        let err = Error::conversion_failed("qcow2", "qemu-img exploded");
        assert!(err.to_string().starts_with("qcow2 conversion failed: "));
    }

    #[test]
    fn test_command_failed_includes_command_and_message() {
        let err = Error::command_failed("qemu-img", "Could not open 'x'");
        let msg = err.to_string();
        assert!(msg.contains("qemu-img"));
        assert!(msg.contains("Could not open"));
    }

    #[test]
    fn test_illegal_transition_is_verbatim() {
        let err = Error::IllegalTransition("cannot cancel job in completed state".into());
        assert_eq!(err.to_string(), "cannot cancel job in completed state");
    }

    #[test]
    fn test_timeout_is_human_readable() {
        let err = Error::Timeout {
            command: "tar".into(),
            after: Duration::from_secs(90),
        };
        assert!(err.to_string().contains("1m 30s"));
    }

    #[test]
    fn test_error_codes() {
        let cases = [
            (Error::VmNotFound("a".into()), ErrorCode::VmNotFound),
            (Error::UnsupportedFormat("isoz".into()), ErrorCode::UnsupportedFormat),
            (Error::invalid_options("k", "r"), ErrorCode::InvalidOptions),
            (Error::JobNotFound("j".into()), ErrorCode::JobNotFound),
            (Error::IllegalTransition("x".into()), ErrorCode::IllegalTransition),
            (Error::conversion_failed("raw", "x"), ErrorCode::ConversionFailed),
            (Error::command_failed("tar", "x"), ErrorCode::ConversionFailed),
            (Error::Canceled("x".into()), ErrorCode::InternalError),
            (Error::storage("x"), ErrorCode::InternalError),
        ];
        for (err, code) in cases {
            assert_eq!(err.code(), code, "unexpected code for {err}");
        }
        assert_eq!(ErrorCode::VmNotFound.to_string(), "VMNotFound");
    }
}
