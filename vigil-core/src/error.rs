use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("scope denied for {candidate}: {reason}")]
    ScopeDenied { candidate: String, reason: String },

    #[error("normalization failed for {value:?}: {reason}")]
    Normalization { value: String, reason: String },

    #[error("scanner {scanner} timed out after {timeout_secs}s")]
    ScannerTimeout { scanner: String, timeout_secs: u64 },

    #[error("scanner error: {0}")]
    Scanner(String),

    #[error("dependency unreachable: {0}")]
    DependencyUnreachable(String),

    #[error("verification inconclusive: {0}")]
    VerificationInconclusive(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether a job failing with this error should be re-queued with
    /// backoff (until `max_attempts`) rather than failed terminally.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::ScannerTimeout { .. }
            | EngineError::Scanner(_)
            | EngineError::DependencyUnreachable(_)
            | EngineError::VerificationInconclusive(_)
            | EngineError::Database(_) => true,
            EngineError::Io(_)
            | EngineError::Serialization(_)
            | EngineError::ScopeDenied { .. }
            | EngineError::Normalization { .. }
            | EngineError::NotFound(_)
            | EngineError::Conflict(_)
            | EngineError::Cancelled(_)
            | EngineError::Internal(_) => false,
        }
    }

    /// Short machine-readable reason recorded on failed jobs and audit rows.
    pub fn reason_code(&self) -> &'static str {
        match self {
            EngineError::ScopeDenied { .. } => "scope_denied",
            EngineError::Normalization { .. } => "normalization_failed",
            EngineError::ScannerTimeout { .. } => "scanner_timeout",
            EngineError::Scanner(_) => "scanner_error",
            EngineError::Database(_) | EngineError::DependencyUnreachable(_) => {
                "dependency_unreachable"
            }
            EngineError::VerificationInconclusive(_) => "verification_inconclusive",
            EngineError::Cancelled(_) => "cancelled",
            EngineError::NotFound(_) => "not_found",
            EngineError::Conflict(_) => "conflict",
            EngineError::Io(_) => "io_error",
            EngineError::Serialization(_) => "serialization_error",
            EngineError::Internal(_) => "internal_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
