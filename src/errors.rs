//! Typed error hierarchy for the ISX Pulse engine.
//!
//! Three top-level enums cover the three subsystems:
//! - `OrchestratorError`: operation admission, scheduling, and lookup failures
//! - `StepError`: per-step execution failures, with retryability carried on
//!   the execution variant
//! - `LicenseError`: license store, validation, and issuer failures

use thiserror::Error;

/// Errors from the orchestrator subsystem (admission, scheduling, lookup).
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Step '{0}' is already registered")]
    DuplicateStep(String),

    #[error("Operation '{0}' already exists")]
    DuplicateOperation(String),

    #[error("Unknown step '{0}'")]
    UnknownStep(String),

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("Cycle detected in step dependencies. Involved steps: {0:?}")]
    CyclicDependency(Vec<String>),

    #[error("Operation '{0}' not found")]
    NotFound(String),

    #[error("Step registry is frozen; register steps before the first run")]
    RegistryFrozen,

    #[error("No valid license: {0}")]
    LicenseRequired(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// Stable machine-readable kind for broadcasts and API payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DuplicateStep(_) => "duplicate_step",
            Self::DuplicateOperation(_) => "duplicate_operation",
            Self::UnknownStep(_) => "unknown_step",
            Self::UnknownDependency { .. } => "unknown_dependency",
            Self::CyclicDependency(_) => "cyclic_dependency",
            Self::NotFound(_) => "not_found",
            Self::RegistryFrozen => "registry_frozen",
            Self::LicenseRequired(_) => "license_required",
            Self::Other(_) => "internal",
        }
    }
}

/// Errors from a single step execution attempt.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Dependency '{dependency}' of step '{step}' did not complete")]
    DependencyUnsatisfied { step: String, dependency: String },

    #[error("{message}")]
    Execution { message: String, retryable: bool },

    #[error("Step timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Step was cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StepError {
    /// A retryable execution error. The orchestrator will re-invoke the step
    /// per the configured retry policy.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            retryable: true,
        }
    }

    /// A fatal execution error. Bypasses retries.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether the orchestrator may retry the attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Execution {
                retryable: true,
                ..
            }
        )
    }

    /// Stable machine-readable kind for broadcasts and API payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::DependencyUnsatisfied { .. } => "dependency_unsatisfied",
            Self::Execution { .. } => "execution_error",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::Other(_) => "internal",
        }
    }
}

/// Errors from the license store, validation, and the remote issuer.
#[derive(Debug, Error)]
pub enum LicenseError {
    #[error("License key has an invalid format")]
    InvalidFormat,

    #[error("License data failed integrity verification")]
    IntegrityFailure,

    #[error("License is bound to a different machine")]
    FingerprintMismatch,

    #[error("License expired at {0}")]
    Expired(chrono::DateTime<chrono::Utc>),

    #[error("License key was already activated")]
    AlreadyActivated,

    #[error("License key has been revoked")]
    Revoked,

    #[error("No license has been activated on this machine")]
    NotActivated,

    #[error("License issuer request failed: {0}")]
    Network(String),

    #[error("License file error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LicenseError {
    /// Stable machine-readable kind for API payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidFormat => "invalid_format",
            Self::IntegrityFailure => "integrity_failure",
            Self::FingerprintMismatch => "fingerprint_mismatch",
            Self::Expired(_) => "expired",
            Self::AlreadyActivated => "already_activated",
            Self::Revoked => "revoked",
            Self::NotActivated => "not_activated",
            Self::Network(_) => "network_error",
            Self::Io { .. } => "io",
            Self::Other(_) => "internal",
        }
    }
}

/// Strip details that must not reach user-facing broadcasts or API payloads:
/// filesystem paths and anything shaped like a license key.
pub fn redact_message(message: &str) -> String {
    message
        .split_whitespace()
        .map(|word| {
            let bare = word.trim_matches(|c: char| !c.is_alphanumeric() && c != '/' && c != '-');
            if bare.contains('/') && bare.len() > 1 {
                "<path>"
            } else if looks_like_license_key(bare) {
                "<license-key>"
            } else {
                word
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn looks_like_license_key(word: &str) -> bool {
    let upper = word.to_ascii_uppercase();
    upper.starts_with("ISX-") || (upper.starts_with("ISX") && word.len() >= 8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_error_retryability() {
        assert!(StepError::execution("transient").is_retryable());
        assert!(!StepError::fatal("permanent").is_retryable());
        assert!(!StepError::Validation("bad input".into()).is_retryable());
        assert!(!StepError::Timeout { timeout_ms: 50 }.is_retryable());
        assert!(!StepError::Cancelled.is_retryable());
    }

    #[test]
    fn step_error_kinds_are_stable() {
        assert_eq!(StepError::Validation("x".into()).kind(), "validation_error");
        assert_eq!(StepError::execution("x").kind(), "execution_error");
        assert_eq!(StepError::Timeout { timeout_ms: 1 }.kind(), "timeout");
        assert_eq!(StepError::Cancelled.kind(), "cancelled");
    }

    #[test]
    fn orchestrator_error_duplicate_carries_id() {
        let err = OrchestratorError::DuplicateOperation("op-1".into());
        assert!(err.to_string().contains("op-1"));
        assert_eq!(err.kind(), "duplicate_operation");
    }

    #[test]
    fn license_error_kinds_are_stable() {
        assert_eq!(LicenseError::NotActivated.kind(), "not_activated");
        assert_eq!(LicenseError::IntegrityFailure.kind(), "integrity_failure");
        assert_eq!(
            LicenseError::Network("refused".into()).kind(),
            "network_error"
        );
    }

    #[test]
    fn redact_strips_paths_and_keys() {
        let msg = redact_message("failed to read /home/user/data/report.csv for ISX-AB12-CD34-EF56-GH78");
        assert!(!msg.contains("/home"));
        assert!(!msg.contains("ISX-AB12"));
        assert!(msg.contains("<path>"));
        assert!(msg.contains("<license-key>"));
    }

    #[test]
    fn redact_keeps_plain_words() {
        assert_eq!(redact_message("download failed"), "download failed");
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&OrchestratorError::RegistryFrozen);
        assert_std_error(&StepError::Cancelled);
        assert_std_error(&LicenseError::NotActivated);
    }
}
