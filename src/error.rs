use thiserror::Error;

/// Failures callers branch on. Everything else travels as a plain
/// `anyhow::Error` with context attached.
#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("API token not found in any credential source ({0})")]
    CredentialNotFound(String),

    #[error("Zone not found: {0}")]
    ZoneNotFound(String),

    #[error("{provider} API error: {message}")]
    Api { provider: &'static str, message: String },

    /// The distribution changed between read and write; re-fetch and retry.
    #[error("Distribution {id} was modified concurrently (ETag mismatch)")]
    Conflict { id: String },

    #[error("`{program}` failed: {stderr}")]
    Command { program: String, stderr: String },

    #[error("Interrupted by operator")]
    Cancelled,
}

impl MigrateError {
    pub fn is_conflict(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<MigrateError>(),
            Some(MigrateError::Conflict { .. })
        )
    }

    pub fn is_cancelled(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<MigrateError>(), Some(MigrateError::Cancelled))
    }
}
