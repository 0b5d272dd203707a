use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::debug;

use crate::metrics_consts::STORE_PUT_DURATION;
use crate::repository::{PutOutcome, ScanRepository, StoreError};
use crate::scan::ScanResult;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("failed to put scan {key}: {error}")]
    PutError { key: String, error: StoreError },
}

/// Hands decoded scans to a `ScanRepository`.
/// It holds no state and no policy: conflicts are entirely resolved by the repository.
#[derive(Clone)]
pub struct ScanManager {
    repository: Arc<dyn ScanRepository>,
}

impl ScanManager {
    pub fn new(repository: Arc<dyn ScanRepository>) -> Self {
        Self { repository }
    }

    pub async fn put_scan(&self, result: &ScanResult) -> Result<PutOutcome, ManagerError> {
        let start = Instant::now();

        let outcome = self
            .repository
            .put(result)
            .await
            .map_err(|error| ManagerError::PutError {
                key: result.key().to_string(),
                error,
            })?;

        let labels = [("outcome", outcome.as_str())];
        metrics::histogram!(STORE_PUT_DURATION, &labels)
            .record(start.elapsed().as_secs_f64());

        debug!(
            key = %result.key(),
            timestamp = result.timestamp,
            data_version = %result.data_version,
            outcome = outcome.as_str(),
            "scan result stored"
        );

        Ok(outcome)
    }
}
