use thiserror::Error;

/// Stable machine-readable error codes surfaced at the transport boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    Validation,
    NotFound,
    Unauthorized,
    VersionConflict,
    StaleState,
    Terminal,
    RestrictViolation,
    ApprovalPending,
    ApprovalRejected,
    ApprovalCanceled,
    NotPending,
    Timeout,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "Validation",
            ErrorCode::NotFound => "NotFound",
            ErrorCode::Unauthorized => "Unauthorized",
            ErrorCode::VersionConflict => "VersionConflict",
            ErrorCode::StaleState => "StaleState",
            ErrorCode::Terminal => "Terminal",
            ErrorCode::RestrictViolation => "RestrictViolation",
            ErrorCode::ApprovalPending => "ApprovalPending",
            ErrorCode::ApprovalRejected => "ApprovalRejected",
            ErrorCode::ApprovalCanceled => "ApprovalCanceled",
            ErrorCode::NotPending => "NotPending",
            ErrorCode::Timeout => "Timeout",
            ErrorCode::Internal => "Internal",
        }
    }
}

/// One field-level validation failure, carried inside `PlatformError::Validation`.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldViolation {
    pub rule_id: String,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.rule_id, self.field, self.message)
    }
}

/// A referencing entity blocking a RESTRICT delete.
#[derive(Clone, Debug, PartialEq)]
pub struct RestrictReferrer {
    pub entity: String,
    pub field: String,
    pub count: u64,
}

/// The platform error taxonomy. Engines return these directly; store-level
/// `anyhow` failures convert to `Internal` at the service boundary.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("validation failed: {}", format_violations(.0))]
    Validation(Vec<FieldViolation>),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {reason}")]
    Unauthorized {
        reason: String,
        matched_rule: Option<String>,
    },

    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: i64, actual: i64 },

    #[error("stale state: {0}")]
    StaleState(String),

    #[error("record is in terminal state {0}")]
    Terminal(String),

    #[error("delete restricted by {} referencing entities", .0.len())]
    RestrictViolation(Vec<RestrictReferrer>),

    #[error("approval pending")]
    ApprovalPending,

    #[error("approval rejected")]
    ApprovalRejected,

    #[error("approval canceled")]
    ApprovalCanceled,

    #[error("decision target is not pending: {0}")]
    NotPending(String),

    #[error("deadline exceeded: {0}")]
    Timeout(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

fn format_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl PlatformError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PlatformError::Validation(_) => ErrorCode::Validation,
            PlatformError::NotFound(_) => ErrorCode::NotFound,
            PlatformError::Unauthorized { .. } => ErrorCode::Unauthorized,
            PlatformError::VersionConflict { .. } => ErrorCode::VersionConflict,
            PlatformError::StaleState(_) => ErrorCode::StaleState,
            PlatformError::Terminal(_) => ErrorCode::Terminal,
            PlatformError::RestrictViolation(_) => ErrorCode::RestrictViolation,
            PlatformError::ApprovalPending => ErrorCode::ApprovalPending,
            PlatformError::ApprovalRejected => ErrorCode::ApprovalRejected,
            PlatformError::ApprovalCanceled => ErrorCode::ApprovalCanceled,
            PlatformError::NotPending(_) => ErrorCode::NotPending,
            PlatformError::Timeout(_) => ErrorCode::Timeout,
            PlatformError::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        PlatformError::NotFound(what.into())
    }

    pub fn unauthorized(reason: impl Into<String>, matched_rule: Option<String>) -> Self {
        PlatformError::Unauthorized {
            reason: reason.into(),
            matched_rule,
        }
    }

    /// Whether a caller retry can reasonably succeed without changing input.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            PlatformError::VersionConflict { .. }
                | PlatformError::StaleState(_)
                | PlatformError::Timeout(_)
        )
    }
}

pub type PlatformResult<T> = Result<T, PlatformError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            PlatformError::ApprovalPending.code().as_str(),
            "ApprovalPending"
        );
        assert_eq!(
            PlatformError::VersionConflict {
                expected: 3,
                actual: 4
            }
            .code()
            .as_str(),
            "VersionConflict"
        );
        let internal: PlatformError = anyhow::anyhow!("boom").into();
        assert_eq!(internal.code().as_str(), "Internal");
    }

    #[test]
    fn retryable_classification() {
        assert!(PlatformError::StaleState("s".into()).retryable());
        assert!(!PlatformError::ApprovalPending.retryable());
    }

    #[test]
    fn validation_display_includes_rule_and_field() {
        let err = PlatformError::Validation(vec![FieldViolation {
            rule_id: "required".to_string(),
            field: "amount".to_string(),
            message: "value is required".to_string(),
        }]);
        let text = err.to_string();
        assert!(text.contains("[required]"));
        assert!(text.contains("amount"));
    }
}
