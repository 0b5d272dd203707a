use async_trait::async_trait;
use thiserror::Error;

use crate::scan::{ScanKey, ScanResult};

/// Enumeration of errors for storage operations.
/// All of them are considered retryable: a later redelivery of the same message may succeed.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("write to {key} kept conflicting after {attempts} attempts")]
    ContentionError { key: String, attempts: u32 },
    #[error("{0} is not a valid table name")]
    InvalidTableName(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// What happened to a record handed to `ScanRepository::put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// No record existed for the key, or the stored one was older.
    Written,
    /// The stored record has the same or a newer timestamp; the incoming one was discarded.
    Stale,
}

impl PutOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PutOutcome::Written => "written",
            PutOutcome::Stale => "stale",
        }
    }
}

/// Storage of the newest `ScanResult` per `ScanKey`.
///
/// Implementations must apply `put` as a single atomic conditional write: the record is stored
/// iff no record exists for its key or the stored timestamp is strictly smaller than the
/// incoming one. Losing the condition is not an error, it's reported as `PutOutcome::Stale`.
#[async_trait]
pub trait ScanRepository: Send + Sync {
    async fn put(&self, result: &ScanResult) -> Result<PutOutcome, StoreError>;

    async fn get(&self, key: &ScanKey) -> Result<Option<ScanResult>, StoreError>;
}

/// The last-writer-wins rule: may `incoming` replace `stored`?
/// Ties keep the stored record, which makes redelivery of the same message a no-op.
pub fn supersedes(incoming: &ScanResult, stored: Option<&ScanResult>) -> bool {
    match stored {
        None => true,
        Some(stored) => stored.timestamp < incoming.timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::DataVersion;

    fn scan(timestamp: i64) -> ScanResult {
        ScanResult {
            ip: "172.16.0.1".to_owned(),
            port: 443,
            service: "https".to_owned(),
            timestamp,
            response: "response".to_owned(),
            data_version: DataVersion::V2,
        }
    }

    #[test]
    fn test_supersedes() {
        assert!(supersedes(&scan(1), None));
        assert!(supersedes(&scan(2), Some(&scan(1))));
        assert!(!supersedes(&scan(1), Some(&scan(2))));
        assert!(!supersedes(&scan(1), Some(&scan(1))));
    }
}
