//! Shell error types.
//!
//! Errors are categorized by where they surface and whether retrying helps:
//!
//! | Category | Variants | Recovery |
//! |----------|----------|----------|
//! | **Local** | `Validation`, `Busy`, `NoModuleSelected`, `NotFound`, `Usage` | Fix input, never retried |
//! | **Transient** | `BackendUnavailable` | Retried with bounded backoff |
//! | **Auth** | `Auth` | Permanent for that backend |
//! | **Terminal** | `Timeout`, `JobFailed`, `JobNotFound` | Recorded in the result |
//! | **Startup** | `Fatal`, `Configuration` | Abort or fix configuration |
//!
//! Local errors are returned synchronously. Remote errors never cross the
//! dispatcher boundary as `Err`; they become terminal
//! [`ExecutionResult`](crate::result::ExecutionResult) states instead.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Option or capability validation failure.
///
/// Every variant names the offending option (or backend) so the command
/// layer can point the user at the exact thing to fix.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ValidationError {
    /// Option name is not declared by the module.
    #[error("unknown option '{name}' for module '{module}'")]
    UnknownOption { module: String, name: String },

    /// Required option has neither an explicit value nor a default.
    #[error("required option '{name}' is not set")]
    MissingRequired { name: String },

    /// Raw value could not be coerced to the declared type.
    #[error("option '{name}' expects {expected}, got '{raw}'")]
    TypeMismatch {
        name: String,
        expected: String,
        raw: String,
    },

    /// Coerced value fails the declared rule.
    #[error("option '{name}' is invalid: {reason}")]
    RuleViolation { name: String, reason: String },

    /// Request needs more than the target backend offers.
    #[error("backend '{backend}' cannot run this request: {}", reasons.join("; "))]
    CapabilityExceeded {
        backend: String,
        reasons: Vec<String>,
    },

    /// Options were resolved against a different module.
    #[error("options were resolved for module '{resolved}', not '{module}'")]
    ModuleMismatch { module: String, resolved: String },

    /// Shot count is zero.
    #[error("invalid shot count: {0}")]
    InvalidShots(String),
}

impl ValidationError {
    /// Name of the option this error refers to, if any.
    pub fn option_name(&self) -> Option<&str> {
        match self {
            Self::UnknownOption { name, .. }
            | Self::MissingRequired { name }
            | Self::TypeMismatch { name, .. }
            | Self::RuleViolation { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// Errors that can occur while configuring or executing modules.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ShellError {
    // ── Local errors (surfaced immediately, never retried) ───────────
    /// Bad or missing option, or capability mismatch.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// A run is already in flight on this session.
    #[error("Session is busy: a run is already in progress")]
    Busy,

    /// `run` or `set` was issued with no module selected.
    #[error("No module selected")]
    NoModuleSelected,

    /// Module or backend lookup failed.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed shell command.
    #[error("Usage: {0}")]
    Usage(String),

    // ── Transient errors (retry with backoff) ────────────────────────
    /// Backend is unreachable or rate limiting.
    #[error("Backend not available: {0}")]
    BackendUnavailable(String),

    // ── Auth errors ──────────────────────────────────────────────────
    /// Credential rejected by the backend.
    #[error("Authentication failed: {0}")]
    Auth(String),

    // ── Terminal job errors ──────────────────────────────────────────
    /// This process stopped waiting; the remote job may still be running.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Backend reported the job as failed.
    #[error("Job failed: {0}")]
    JobFailed(String),

    /// Backend does not know the job.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Operation not offered by the backend.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    // ── Startup and config errors ────────────────────────────────────
    /// Registry or schema inconsistency detected at startup.
    #[error("Fatal: {0}")]
    Fatal(String),

    /// Configuration could not be read.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Generic backend error.
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ShellError {
    /// Returns `true` if this error is transient and the operation may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_))
    }

    /// Returns `true` for errors raised locally before any backend call.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::Busy
                | Self::NoModuleSelected
                | Self::NotFound(_)
                | Self::Usage(_)
        )
    }

    /// Serializable category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::NoModuleSelected | Self::Usage(_) => {
                ErrorKind::Validation
            }
            Self::Auth(_) => ErrorKind::Auth,
            Self::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Busy => ErrorKind::Busy,
            Self::Fatal(_) | Self::Configuration(_) => ErrorKind::Fatal,
            _ => ErrorKind::Backend,
        }
    }
}

/// Error category recorded alongside non-successful results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Auth,
    BackendUnavailable,
    Timeout,
    Busy,
    Fatal,
    Backend,
}

/// Result type for shell operations.
pub type ShellResult<T> = Result<T, ShellError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(ShellError::BackendUnavailable("rate limited".into()).is_transient());
        assert!(!ShellError::Auth("bad token".into()).is_transient());
        assert!(!ShellError::Timeout("job-1".into()).is_transient());
        assert!(
            !ShellError::Validation(ValidationError::MissingRequired { name: "N".into() })
                .is_transient()
        );
    }

    #[test]
    fn test_local_errors() {
        assert!(ShellError::Busy.is_local());
        assert!(ShellError::NoModuleSelected.is_local());
        assert!(!ShellError::JobFailed("boom".into()).is_local());
    }

    #[test]
    fn test_validation_error_names_option() {
        let err = ValidationError::MissingRequired { name: "N".into() };
        assert_eq!(err.option_name(), Some("N"));
        assert_eq!(err.to_string(), "required option 'N' is not set");
    }

    #[test]
    fn test_capability_error_display() {
        let err = ValidationError::CapabilityExceeded {
            backend: "local".into(),
            reasons: vec!["needs 40 qubits, max 32".into(), "needs network".into()],
        };
        assert_eq!(
            err.to_string(),
            "backend 'local' cannot run this request: needs 40 qubits, max 32; needs network"
        );
        assert_eq!(err.option_name(), None);
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(ShellError::Auth("x".into()).kind(), ErrorKind::Auth);
        assert_eq!(ShellError::JobFailed("x".into()).kind(), ErrorKind::Backend);
    }
}
