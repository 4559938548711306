//! Record store interface.
//!
//! The record store is the single source of truth for election results. It is
//! only ever written wholesale through [`RecordStore::replace_all`].

use crate::models::{ElectionRecord, ResultFilter, StoredRecord};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The backend could not be opened or reached.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// A statement failed; any open transaction was rolled back.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// A stored row no longer matches the schema.
    #[error("Corrupt row {id}: {reason}")]
    CorruptRow { id: i64, reason: String },
}

impl StoreError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::ConnectionError(msg.into())
    }

    pub fn database(msg: impl Into<String>) -> Self {
        Self::DatabaseError(msg.into())
    }

    pub fn corrupt_row(id: i64, reason: impl Into<String>) -> Self {
        Self::CorruptRow {
            id,
            reason: reason.into(),
        }
    }
}

/// Free-text columns that support exact-match existence checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextField {
    PollingCenter,
    PollingPlace,
}

/// Result of [`RecordStore::query_checked`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckedQuery {
    Records(Vec<ElectionRecord>),
    /// The filter names a value that no record carries in this field.
    Missing(TextField),
}

/// Transactional store of [`ElectionRecord`]s.
///
/// Implementations must be `Send + Sync` so a single store can be shared by
/// concurrent imports and readers.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Delete every record and insert `records` in one transaction.
    ///
    /// Either the whole batch replaces the previous dataset, or the previous
    /// dataset is left untouched. Readers never observe a mix. Implementations
    /// bound the transaction themselves and roll back once the bound is
    /// exceeded, so callers do not race a commit with their own timeout.
    ///
    /// # Returns
    ///
    /// * `Ok(usize)` - Number of records inserted
    /// * `Err(StoreError)` - The transaction was rolled back
    async fn replace_all(&self, records: Vec<ElectionRecord>) -> Result<usize, StoreError>;

    /// All records matching the category, municipality, polling center and
    /// polling place filters. The party filter is ignored here.
    async fn query(&self, filter: &ResultFilter) -> Result<Vec<ElectionRecord>, StoreError>;

    /// Like [`RecordStore::query`], but first checks that the polling center
    /// and then the polling place filter each name a value present somewhere
    /// in the dataset, ignoring the other filters.
    ///
    /// The checks and the read see the same dataset, even while a
    /// [`RecordStore::replace_all`] commits.
    async fn query_checked(&self, filter: &ResultFilter) -> Result<CheckedQuery, StoreError>;

    /// Every record with its row id, in id order.
    async fn snapshot(&self) -> Result<Vec<StoredRecord>, StoreError>;

    /// Number of records currently stored.
    async fn count(&self) -> Result<usize, StoreError>;
}
