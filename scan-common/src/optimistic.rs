//! Last-writer-wins on top of stores that only offer a compare-version-and-swap.
//!
//! Every stored record carries a version that the store bumps on each write. A put reads the
//! current version, decides with `supersedes`, and writes only if the version is unchanged.
//! A concurrent writer moving the version forces a re-read, so an older record can never
//! overwrite a newer one that landed in between.
use async_trait::async_trait;
use tracing::debug;

use crate::metrics_consts::STORE_VERSION_CONFLICTS;
use crate::repository::{supersedes, PutOutcome, ScanRepository, StoreError};
use crate::scan::{ScanKey, ScanResult};

/// A value together with the version it was stored at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// A key-value store with an atomic write-if-version-matches primitive.
#[async_trait]
pub trait VersionedStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<Versioned<ScanResult>>, StoreError>;

    /// Store `value` iff the current version of `key` equals `expected`, `None` meaning absent.
    /// Returns `false` when the version moved and nothing was written.
    async fn store_if_version(
        &self,
        key: &str,
        expected: Option<u64>,
        value: ScanResult,
    ) -> Result<bool, StoreError>;
}

pub const DEFAULT_MAX_ATTEMPTS: u32 = 16;

/// A `ScanRepository` implemented with optimistic concurrency over a `VersionedStore`.
pub struct OptimisticRepository<S> {
    store: S,
    max_attempts: u32,
}

impl<S: VersionedStore> OptimisticRepository<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Bound the number of read-check-write rounds before giving up with a `ContentionError`.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[async_trait]
impl<S: VersionedStore> ScanRepository for OptimisticRepository<S> {
    async fn put(&self, result: &ScanResult) -> Result<PutOutcome, StoreError> {
        let key = result.key().to_string();

        for attempt in 1..=self.max_attempts {
            let current = self.store.load(&key).await?;

            if !supersedes(result, current.as_ref().map(|stored| &stored.value)) {
                return Ok(PutOutcome::Stale);
            }

            let expected = current.map(|stored| stored.version);
            if self
                .store
                .store_if_version(&key, expected, result.clone())
                .await?
            {
                return Ok(PutOutcome::Written);
            }

            debug!(key = %key, attempt, "version conflict, retrying conditional write");
            metrics::counter!(STORE_VERSION_CONFLICTS).increment(1);
        }

        Err(StoreError::ContentionError {
            key,
            attempts: self.max_attempts,
        })
    }

    async fn get(&self, key: &ScanKey) -> Result<Option<ScanResult>, StoreError> {
        Ok(self
            .store
            .load(&key.to_string())
            .await?
            .map(|stored| stored.value))
    }
}
