/// Shared error type used across all Relay crates.
///
/// The variants map one-to-one onto the failure kinds the pipeline
/// distinguishes: request validation, auth, lookup misses, duplicate tool
/// registration, worker-pool admission, upstream (LLM/sandbox) trouble,
/// tool handler failures, cooperative cancellation, and invariant
/// violations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("admission timeout: {0}")]
    AdmissionTimeout(String),

    #[error("upstream timeout: {0}")]
    UpstreamTimeout(String),

    #[error("upstream failure: {0}")]
    UpstreamFailure(String),

    #[error("tool failure: {0}")]
    ToolFailure(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal: {0}")]
    Internal(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error represents a cooperative stop rather than a fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind() {
        let e = Error::Conflict("tool 'ask' already registered".into());
        assert!(e.to_string().contains("conflict"));
        assert!(e.to_string().contains("ask"));
    }

    #[test]
    fn cancelled_is_cancelled() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::Internal("x".into()).is_cancelled());
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let e: Error = io.into();
        assert!(matches!(e, Error::Io(_)));
    }
}
