use thiserror::Error;

use crate::cloud::CloudError;
use crate::storage::CacheError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Not authenticated")]
    Unauthenticated,
    #[error("Network error: {0}")]
    Network(String),
    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("Data integrity check failed")]
    IntegrityMismatch,
    #[error("Reconciliation finished with {} error(s)", .0.len())]
    PartialReconciliation(Vec<String>),
    #[error("Sync service not initialized")]
    NotInitialized,
    #[error("Book not found: {0}")]
    BookNotFound(String),
    #[error("Cache error: {0}")]
    Cache(CacheError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    Config(String),
}

impl From<CacheError> for SyncError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::QuotaExceeded { key } => SyncError::QuotaExceeded(key),
            other => SyncError::Cache(other),
        }
    }
}

impl From<CloudError> for SyncError {
    fn from(err: CloudError) -> Self {
        match err {
            CloudError::Unauthenticated => SyncError::Unauthenticated,
            other => SyncError::Network(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        let quota: SyncError = CacheError::QuotaExceeded {
            key: "NOTES_A_B".to_string(),
        }
        .into();
        assert!(matches!(quota, SyncError::QuotaExceeded(k) if k == "NOTES_A_B"));

        let auth: SyncError = CloudError::Unauthenticated.into();
        assert!(matches!(auth, SyncError::Unauthenticated));

        let server: SyncError = CloudError::Server {
            status: 500,
            message: "boom".to_string(),
        }
        .into();
        assert_eq!(server.to_string(), "Network error: Server error: 500 - boom");

        let partial = SyncError::PartialReconciliation(vec!["a".into(), "b".into()]);
        assert_eq!(partial.to_string(), "Reconciliation finished with 2 error(s)");
    }
}
