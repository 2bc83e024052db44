//! Error types for herd

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Routing / leadership ===
    #[error("Not leader for partition {partition} (leader hint: {leader:?})")]
    NotLeader {
        partition: u64,
        leader: Option<String>,
    },

    #[error("No quorum: {0}")]
    NoQuorum(String),

    #[error("Term mismatch on partition {partition}: local term {local}, remote term {remote}")]
    TermMismatch {
        partition: u64,
        local: u64,
        remote: u64,
    },

    #[error("Stale epoch: already observed {seen}, got {got}")]
    EpochStale { seen: u64, got: u64 },

    // === Network ===
    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Node unreachable: {0}")]
    NodeUnreachable(String),

    // === Integrity ===
    #[error("Corrupted data: {0}")]
    Corrupt(String),

    #[error("Log file error: {0}")]
    Wal(String),

    // === Storage ===
    #[error("Key not found: {0}")]
    NotFound(String),

    // === Config ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    ///
    /// Retryable errors are re-attempted locally (gateway re-route, sync
    /// resume); `NoQuorum` and `Corrupt` are surfaced immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NotLeader { .. }
                | Error::Timeout(_)
                | Error::NodeUnreachable(_)
                | Error::EpochStale { .. }
        )
    }

    /// Convert to HTTP status code for gateway responses
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::NotLeader { .. } => StatusCode::TEMPORARY_REDIRECT,
            Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::EpochStale { .. } => StatusCode::CONFLICT,
            Error::NoQuorum(_) | Error::NodeUnreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Corrupt(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Timeout("probe".into()).is_retryable());
        assert!(Error::NodeUnreachable("node-2".into()).is_retryable());
        assert!(Error::NotLeader {
            partition: 3,
            leader: Some("node-1".into())
        }
        .is_retryable());

        assert!(!Error::NoQuorum("2/5".into()).is_retryable());
        assert!(!Error::Corrupt("bad checksum".into()).is_retryable());
    }

    #[test]
    fn test_http_status_mapping() {
        use axum::http::StatusCode;
        assert_eq!(
            Error::NotFound("k".into()).to_http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::NoQuorum("meta".into()).to_http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
