//! Error types for fleet provisioning.

use thiserror::Error;

/// Result type alias for provisioning operations.
pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Coarse classification used in per-host summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Validation,
    NotFound,
    Backend,
    Installer,
    Cancelled,
}

#[derive(Error, Debug)]
pub enum ProvisionError {
    /// Malformed configuration (name template, unknown ISO, address overflow)
    #[error("configuration error: {0}")]
    Config(String),

    /// Gateway and start address are not on the same subnet
    #[error("validation error: {0}")]
    Validation(String),

    /// A management-plane object the run depends on does not exist.
    /// A missing VM is never reported this way; that is the skip signal.
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("backend {operation} failed: {reason}")]
    Backend { operation: String, reason: String },

    #[error("installer service error: {0}")]
    Installer(String),

    #[error("cancelled while {0}")]
    Cancelled(String),
}

impl ProvisionError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn backend(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::Backend {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    pub fn installer(reason: impl ToString) -> Self {
        Self::Installer(reason.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Backend { .. } => ErrorKind::Backend,
            Self::Installer(_) => ErrorKind::Installer,
            Self::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}
