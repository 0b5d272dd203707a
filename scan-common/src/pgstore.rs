use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::repository::{PutOutcome, ScanRepository, StoreError};
use crate::scan::{DataVersion, ScanKey, ScanResult};

/// A `ScanRepository` backed by a PostgreSQL table.
///
/// The last-writer-wins rule is pushed into a single upsert: the `DO UPDATE` only fires when the
/// stored timestamp is strictly older, and PostgreSQL serializes concurrent upserts on the same
/// primary key, so the check and the write can't be separated by another writer.
pub struct PgScanStore {
    table: String,
    pool: PgPool,
}

/// A row of the scan results table. `port` and `data_version` are widened to fit PostgreSQL's
/// signed integer types.
#[derive(sqlx::FromRow)]
struct ScanRow {
    ip: String,
    port: i64,
    service: String,
    timestamp: i64,
    response: String,
    data_version: i16,
}

impl TryFrom<ScanRow> for ScanResult {
    type Error = StoreError;

    fn try_from(row: ScanRow) -> Result<Self, Self::Error> {
        let port = u32::try_from(row.port).map_err(|_| {
            StoreError::Unavailable(format!("stored port {} is out of range", row.port))
        })?;
        let data_version = DataVersion::try_from(i64::from(row.data_version))
            .map_err(|error| StoreError::Unavailable(format!("stored row is invalid: {error}")))?;

        Ok(ScanResult {
            ip: row.ip,
            port,
            service: row.service,
            timestamp: row.timestamp,
            response: row.response,
            data_version,
        })
    }
}

impl PgScanStore {
    /// Initialize a new PgScanStore backed by table in PostgreSQL.
    pub async fn new(table: &str, url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        Self::new_from_pool(table, pool)
    }

    /// Initialize a new PgScanStore from an existing pool.
    pub fn new_from_pool(table: &str, pool: PgPool) -> Result<Self, StoreError> {
        // The table name is interpolated into queries as sqlx can't bind identifiers.
        if table.is_empty()
            || !table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(StoreError::InvalidTableName(table.to_owned()));
        }

        Ok(Self {
            table: table.to_owned(),
            pool,
        })
    }
}

#[async_trait]
impl ScanRepository for PgScanStore {
    async fn put(&self, result: &ScanResult) -> Result<PutOutcome, StoreError> {
        let base_query = format!(
            r#"
INSERT INTO "{0}"
    (pk, ip, port, service, timestamp, response, data_version)
VALUES
    ($1, $2, $3, $4, $5, $6, $7)
ON CONFLICT (pk) DO UPDATE
SET
    ip = EXCLUDED.ip,
    port = EXCLUDED.port,
    service = EXCLUDED.service,
    timestamp = EXCLUDED.timestamp,
    response = EXCLUDED.response,
    data_version = EXCLUDED.data_version
WHERE
    "{0}".timestamp < EXCLUDED.timestamp
            "#,
            &self.table
        );

        let query_result = sqlx::query(&base_query)
            .bind(result.key().to_string())
            .bind(&result.ip)
            .bind(i64::from(result.port))
            .bind(&result.service)
            .bind(result.timestamp)
            .bind(&result.response)
            .bind(i16::from(u8::from(result.data_version)))
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        // Zero rows means the conflict target exists and the WHERE clause rejected the update.
        match query_result.rows_affected() {
            0 => Ok(PutOutcome::Stale),
            _ => Ok(PutOutcome::Written),
        }
    }

    async fn get(&self, key: &ScanKey) -> Result<Option<ScanResult>, StoreError> {
        let base_query = format!(
            r#"
SELECT
    ip, port, service, timestamp, response, data_version
FROM
    "{0}"
WHERE
    pk = $1
            "#,
            &self.table
        );

        let row: Option<ScanRow> = sqlx::query_as(&base_query)
            .bind(key.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        row.map(ScanResult::try_from).transpose()
    }
}
