use crate::{lease::LeaseScope, time::Timestamp, PrincipalId, ResourceId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Lease conflict: {resource}/{scope} exclusively held by {holder} until {expires_at}")]
    LeaseConflict {
        resource: ResourceId,
        scope: LeaseScope,
        holder: PrincipalId,
        acquired_at: Timestamp,
        expires_at: Timestamp,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Principal {principal} may not access resource {resource}")]
    PermissionDenied {
        principal: PrincipalId,
        resource: ResourceId,
    },

    #[error("Unauthenticated request")]
    Unauthenticated,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Lease store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Request timed out, outcome unknown")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Conflicts are expected control flow, not failures.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::LeaseConflict { .. })
    }

    /// Whether the caller may sensibly retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::Timeout)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::StoreUnavailable(format!("store task failed: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let conflict = Error::LeaseConflict {
            resource: ResourceId::from("u1"),
            scope: LeaseScope::Assess,
            holder: PrincipalId::from("alice"),
            acquired_at: chrono::Utc::now(),
            expires_at: chrono::Utc::now(),
        };
        assert!(conflict.is_conflict());
        assert!(!conflict.is_retryable());

        assert!(Error::StoreUnavailable("down".into()).is_retryable());
        assert!(Error::Timeout.is_retryable());
        assert!(!Error::Unauthenticated.is_retryable());
    }

    #[test]
    fn test_sqlite_errors_map_to_store_unavailable() {
        let err: Error = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, Error::StoreUnavailable(_)));
    }
}
