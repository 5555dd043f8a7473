//! Quota Storage
//!
//! Pluggable persistence seam for quota records. The tracker only ever
//! talks to the [`QuotaStore`] trait; the bundled [`InMemoryQuotaStore`]
//! keeps everything in a process-local map, while production deployments
//! can back the same trait onto a durable store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::quota::record::QuotaRecord;

/// Storage backend for per-user quota records
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Fetch the record for one user, if any
    async fn get(&self, user_id: &str) -> Result<Option<QuotaRecord>, StorageError>;

    /// Insert or replace a record (keyed by its `user_id`)
    async fn set(&self, record: &QuotaRecord) -> Result<(), StorageError>;

    /// Remove a user's record; removing a missing record is not an error
    async fn delete(&self, user_id: &str) -> Result<(), StorageError>;

    /// Enumerate every stored record
    async fn get_all(&self) -> Result<Vec<QuotaRecord>, StorageError>;

    /// Release backend resources; later operations fail with
    /// [`StorageError::Closed`]
    async fn close(&self) -> Result<(), StorageError>;
}

/// In-memory reference implementation of [`QuotaStore`]
#[derive(Debug, Clone, Default)]
pub struct InMemoryQuotaStore {
    records: Arc<RwLock<HashMap<String, QuotaRecord>>>,
    closed: Arc<AtomicBool>,
}

impl InMemoryQuotaStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn get(&self, user_id: &str) -> Result<Option<QuotaRecord>, StorageError> {
        self.ensure_open()?;
        let records = self.records.read().await;
        Ok(records.get(user_id).cloned())
    }

    async fn set(&self, record: &QuotaRecord) -> Result<(), StorageError> {
        self.ensure_open()?;
        let mut records = self.records.write().await;
        records.insert(record.user_id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, user_id: &str) -> Result<(), StorageError> {
        self.ensure_open()?;
        let mut records = self.records.write().await;
        records.remove(user_id);
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<QuotaRecord>, StorageError> {
        self.ensure_open()?;
        let records = self.records.read().await;
        Ok(records.values().cloned().collect())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
