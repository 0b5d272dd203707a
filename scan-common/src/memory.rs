use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::optimistic::{OptimisticRepository, Versioned, VersionedStore};
use crate::repository::StoreError;
use crate::scan::ScanResult;

/// An in-process `VersionedStore`. Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<RwLock<HashMap<String, Versioned<ScanResult>>>>,
}

impl MemoryStore {
    pub fn len(&self) -> usize {
        self.records.read().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Last-writer-wins repository kept in memory, for local runs and tests.
pub type MemoryRepository = OptimisticRepository<MemoryStore>;

impl MemoryRepository {
    pub fn in_memory() -> Self {
        OptimisticRepository::new(MemoryStore::default())
    }
}

#[async_trait]
impl VersionedStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<Versioned<ScanResult>>, StoreError> {
        let records = self
            .records
            .read()
            .map_err(|_| StoreError::Unavailable("poisoned MemoryStore lock".to_owned()))?;

        Ok(records.get(key).cloned())
    }

    async fn store_if_version(
        &self,
        key: &str,
        expected: Option<u64>,
        value: ScanResult,
    ) -> Result<bool, StoreError> {
        let mut records = self
            .records
            .write()
            .map_err(|_| StoreError::Unavailable("poisoned MemoryStore lock".to_owned()))?;

        let current = records.get(key).map(|stored| stored.version);
        if current != expected {
            return Ok(false);
        }

        let version = current.map_or(1, |version| version + 1);
        records.insert(key.to_owned(), Versioned { version, value });

        Ok(true)
    }
}
