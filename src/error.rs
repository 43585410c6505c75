// vim: tw=80
use std::fmt;

/// The error taxonomy consumed throughout the crate.
///
/// Every fallible call in the action registry, block layer, and apply
/// driver returns a `Result<T, FwupError>` instead of setting process-wide
/// state; the interpreter surfaces the first failure verbatim and aborts
/// the enclosing task (spec §7).
#[derive(Debug, thiserror::Error)]
pub enum FwupError {
    /// Argument shape/count wrong, unknown action, out-of-range integer.
    #[error("validation error in `{action}`: {message}")]
    Validation { action: String, message: String },

    /// Referenced config section missing, hash missing/wrong length.
    #[error("config error: {message}")]
    Config { message: String },

    /// Stream underrun, hash mismatch, double-write of a resource.
    #[error("resource error for `{resource}`: {message}")]
    Resource { resource: String, message: String },

    /// Device read/write failure, subprocess spawn failure.
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Corrupt U-Boot env when not recovering, malformed MBR config.
    #[error("format error: {message}")]
    Format { message: String },

    /// Unsafe action invoked without the unsafe flag.
    #[error("safety error: `{action}` requires --unsafe")]
    Safety { action: String },

    /// The `error` action: the task aborted itself.
    #[error("task aborted: {message}")]
    Abort { message: String },
}

pub type Result<T> = std::result::Result<T, FwupError>;

impl FwupError {
    pub fn validation(action: impl Into<String>, message: impl fmt::Display) -> Self {
        FwupError::Validation { action: action.into(), message: message.to_string() }
    }

    pub fn config(message: impl fmt::Display) -> Self {
        FwupError::Config { message: message.to_string() }
    }

    pub fn resource(resource: impl Into<String>, message: impl fmt::Display) -> Self {
        FwupError::Resource { resource: resource.into(), message: message.to_string() }
    }

    pub fn io(message: impl fmt::Display) -> Self {
        FwupError::Io { message: message.to_string() }
    }

    pub fn format(message: impl fmt::Display) -> Self {
        FwupError::Format { message: message.to_string() }
    }

    pub fn safety(action: impl Into<String>) -> Self {
        FwupError::Safety { action: action.into() }
    }

    /// Exit code this error should produce, per spec §6.
    pub fn exit_code(&self) -> i32 {
        1
    }
}

impl From<std::io::Error> for FwupError {
    fn from(e: std::io::Error) -> Self {
        FwupError::io(e)
    }
}
