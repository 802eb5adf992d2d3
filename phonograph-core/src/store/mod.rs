use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

mod lock;
mod memory;

pub use lock::*;
pub use memory::*;

use crate::entity::{EntityKind, Record, RecordKey};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// An unknown or internal error happened with the storage backend
    #[error(transparent)]
    Internal(Box<dyn std::error::Error + Send + Sync>),
    /// A record already exists with a conflicting unique field
    #[error("{kind} with {field} of value {value} already exists")]
    Conflict {
        kind: EntityKind,
        /// The field that is conflicting
        field: &'static str,
        /// The conflicting value
        value: String,
    },
    /// A record that was expected to exist doesn't
    #[error("{0} doesn't exist")]
    NotFound(RecordKey),
    /// A record body that could not be encoded or decoded
    #[error("{key} could not be encoded or decoded")]
    Corrupt {
        key: RecordKey,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Helper trait to reduce boilerplate
pub trait IntoStoreError {
    /// Wraps any error as an internal storage error
    fn internal(self) -> StoreError;
}

impl<E> IntoStoreError for E
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn internal(self) -> StoreError {
        StoreError::Internal(Box::new(self))
    }
}

/// A single write of a batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Creates or replaces a record.
    Put(Record),
    /// Removes a record. Removing a missing record is not an error.
    Delete(RecordKey),
}

impl WriteOp {
    pub fn key(&self) -> RecordKey {
        match self {
            Self::Put(record) => record.key(),
            Self::Delete(key) => *key,
        }
    }
}

/// Represents a type that can store and retrieve media graph records.
///
/// Records are opaque documents to the store. The engine owns every
/// invariant between them, a store only has to keep what it is given and
/// enforce the unique user fields it indexes.
#[async_trait]
pub trait EntityStore: Send + Sync + 'static {
    /// Returns the record at `key`, or None if it doesn't exist.
    async fn get(&self, key: RecordKey) -> StoreResult<Option<Record>>;
    /// Creates or replaces a single record.
    async fn put(&self, record: Record) -> StoreResult<()>;
    /// Deletes the record at `key`, returning whether it existed.
    async fn delete(&self, key: RecordKey) -> StoreResult<bool>;
    /// Lists the ids of every record of the given kind.
    async fn list(&self, kind: EntityKind) -> StoreResult<Vec<Uuid>>;

    /// Resolves a username to the id of the user holding it.
    async fn user_id_by_username(&self, username: &str) -> StoreResult<Option<Uuid>>;
    /// Resolves an email to the id of the user holding it.
    async fn user_id_by_email(&self, email: &str) -> StoreResult<Option<Uuid>>;

    /// Applies a batch of writes. A key appears at most once per batch.
    ///
    /// Implementations that can should override this and make the whole
    /// batch visible atomically. The default applies the writes one by one
    /// and relies on the caller to compensate on partial failure.
    async fn apply(&self, batch: Vec<WriteOp>) -> StoreResult<()> {
        for op in batch {
            match op {
                WriteOp::Put(record) => self.put(record).await?,
                WriteOp::Delete(key) => {
                    self.delete(key).await?;
                }
            }
        }

        Ok(())
    }
}
