use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, warn};
use tokio::task;

use crate::entity::{
    Album, AlbumId, EntityKind, Playlist, PlaylistId, Record, RecordKey, Song, SongId, User,
    UserId, UserPreferences,
};
use crate::error::{GraphError, Result};
use crate::events::{EventSender, GraphEvent};
use crate::store::{EntityStore, LockKey, LockSet, LockTable, StoreResult, WriteOp};
use crate::GraphContext;

/// The lifecycle of one coordinated operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnPhase {
    /// Waiting for its locks.
    Pending,
    /// Holding its locks, reading records and checking preconditions.
    Validating,
    /// Writing. No longer cancellable, runs to commit or rollback.
    Applying,
    Committed,
    RolledBack,
}

/// The working copy of one record.
struct Slot {
    original: Option<Record>,
    current: Option<Record>,
}

/// One coordinated mutation over a set of records.
///
/// A transaction acquires every lock it needs up front, reads committed
/// snapshots into working copies, stages writes against them, and commits
/// the difference as a single batch. Dropping it before commit releases the
/// locks with nothing written.
pub struct Txn<S: EntityStore> {
    store: Arc<S>,
    table: Arc<LockTable>,
    sender: EventSender,

    phase: TxnPhase,
    locks: Option<LockSet>,
    slots: HashMap<RecordKey, Slot>,
    events: Vec<GraphEvent>,
}

impl<S: EntityStore> Txn<S> {
    /// Starts a transaction by acquiring the given keys in the global order.
    pub(crate) async fn begin(context: &GraphContext<S>, keys: Vec<LockKey>) -> Result<Self> {
        let mut txn = Self {
            store: context.store.clone(),
            table: context.locks.clone(),
            sender: context.event_sender.clone(),

            phase: TxnPhase::Pending,
            locks: None,
            slots: HashMap::new(),
            events: Vec::new(),
        };

        let set = context
            .locks
            .acquire(keys, context.config.lock_timeout)
            .await
            .map_err(GraphError::Timeout)?;

        txn.locks = Some(set);
        txn.phase = TxnPhase::Validating;

        Ok(txn)
    }

    pub fn phase(&self) -> TxnPhase {
        self.phase
    }

    /// Loads the committed record into a working copy, once.
    async fn load(&mut self, key: RecordKey) -> Result<()> {
        if self.slots.contains_key(&key) {
            return Ok(());
        }

        let record = self.store.get(key).await?;

        self.slots.insert(
            key,
            Slot {
                original: record.clone(),
                current: record,
            },
        );

        Ok(())
    }

    /// Returns the record as this transaction currently sees it.
    pub async fn fetch(&mut self, key: RecordKey) -> Result<Option<Record>> {
        self.load(key).await?;

        Ok(self
            .slots
            .get(&key)
            .and_then(|slot| slot.current.clone()))
    }

    pub async fn user(&mut self, id: UserId) -> Result<User> {
        let key = RecordKey::new(EntityKind::User, id.value());

        self.fetch(key)
            .await?
            .and_then(Record::into_user)
            .ok_or(GraphError::NotFound(key))
    }

    pub async fn try_user(&mut self, id: UserId) -> Result<Option<User>> {
        let key = RecordKey::new(EntityKind::User, id.value());
        Ok(self.fetch(key).await?.and_then(Record::into_user))
    }

    pub async fn song(&mut self, id: SongId) -> Result<Song> {
        let key = RecordKey::new(EntityKind::Song, id.value());

        self.fetch(key)
            .await?
            .and_then(Record::into_song)
            .ok_or(GraphError::NotFound(key))
    }

    pub async fn try_song(&mut self, id: SongId) -> Result<Option<Song>> {
        let key = RecordKey::new(EntityKind::Song, id.value());
        Ok(self.fetch(key).await?.and_then(Record::into_song))
    }

    pub async fn album(&mut self, id: AlbumId) -> Result<Album> {
        let key = RecordKey::new(EntityKind::Album, id.value());

        self.fetch(key)
            .await?
            .and_then(Record::into_album)
            .ok_or(GraphError::NotFound(key))
    }

    pub async fn try_album(&mut self, id: AlbumId) -> Result<Option<Album>> {
        let key = RecordKey::new(EntityKind::Album, id.value());
        Ok(self.fetch(key).await?.and_then(Record::into_album))
    }

    pub async fn playlist(&mut self, id: PlaylistId) -> Result<Playlist> {
        let key = RecordKey::new(EntityKind::Playlist, id.value());

        self.fetch(key)
            .await?
            .and_then(Record::into_playlist)
            .ok_or(GraphError::NotFound(key))
    }

    pub async fn try_playlist(&mut self, id: PlaylistId) -> Result<Option<Playlist>> {
        let key = RecordKey::new(EntityKind::Playlist, id.value());
        Ok(self.fetch(key).await?.and_then(Record::into_playlist))
    }

    pub async fn preferences(&mut self, user_id: UserId) -> Result<UserPreferences> {
        let key = RecordKey::new(EntityKind::Preferences, user_id.value());

        self.fetch(key)
            .await?
            .and_then(Record::into_preferences)
            .ok_or(GraphError::NotFound(key))
    }

    pub async fn try_preferences(&mut self, user_id: UserId) -> Result<Option<UserPreferences>> {
        let key = RecordKey::new(EntityKind::Preferences, user_id.value());
        Ok(self.fetch(key).await?.and_then(Record::into_preferences))
    }

    /// Stages a create or replace. A record never fetched in this
    /// transaction is treated as created by it.
    pub fn put(&mut self, record: impl Into<Record>) {
        let record = record.into();
        let key = record.key();

        match self.slots.get_mut(&key) {
            Some(slot) => slot.current = Some(record),
            None => {
                self.slots.insert(
                    key,
                    Slot {
                        original: None,
                        current: Some(record),
                    },
                );
            }
        }
    }

    /// Stages a deletion.
    pub fn delete(&mut self, key: RecordKey) {
        match self.slots.get_mut(&key) {
            Some(slot) => slot.current = None,
            None => {
                self.slots.insert(
                    key,
                    Slot {
                        original: None,
                        current: None,
                    },
                );
            }
        }
    }

    /// Queues an event to be emitted if, and only if, the commit succeeds.
    pub fn queue_event(&mut self, event: GraphEvent) {
        self.events.push(event);
    }

    /// Commits the staged writes as one batch.
    ///
    /// The batch is applied on a detached task, so a caller dropping this
    /// future cannot abandon a half-applied batch. If the store fails
    /// partway, the pre-operation snapshots are written back and the error
    /// surfaces as a retryable conflict.
    pub async fn commit(mut self) -> Result<()> {
        self.phase = TxnPhase::Applying;

        let mut deletes = Vec::new();
        let mut puts = Vec::new();
        let mut delete_undo = Vec::new();
        let mut put_undo = Vec::new();

        for (key, slot) in self.slots.drain() {
            match (slot.original, slot.current) {
                (original, Some(current)) => {
                    if original.as_ref() == Some(&current) {
                        continue;
                    }

                    puts.push(WriteOp::Put(current));
                    put_undo.push((key, original));
                }
                (Some(original), None) => {
                    deletes.push(WriteOp::Delete(key));
                    delete_undo.push((key, Some(original)));
                }
                // Fetched but never written, or deleted without existing
                (None, None) => continue,
            }
        }

        let events = std::mem::take(&mut self.events);

        // Deletes go first so a batch can move a unique value between records.
        // The undo list mirrors the batch order, reversing it walks the
        // writes back exactly.
        let batch: Vec<WriteOp> = deletes.into_iter().chain(puts).collect();
        let undo: Vec<_> = delete_undo.into_iter().chain(put_undo).collect();

        if batch.is_empty() {
            self.phase = TxnPhase::Committed;
            self.release();
            emit_all(&self.sender, events);
            return Ok(());
        }

        debug!("Committing {} writes", batch.len());

        let store = self.store.clone();
        let table = self.table.clone();
        let sender = self.sender.clone();
        let locks = self.locks.take();

        let handle = task::spawn(async move {
            let outcome = match store.apply(batch).await {
                Ok(()) => Ok(()),
                Err(apply_error) => {
                    warn!("Apply failed, restoring pre-operation state: {}", apply_error);

                    if let Err(restore_error) = restore_snapshots(store.as_ref(), undo).await {
                        error!(
                            "Failed to restore pre-operation state: {}",
                            restore_error
                        );
                    }

                    Err(GraphError::retryable_conflict(format!(
                        "storage failed mid-apply and the operation was rolled back: {}",
                        apply_error
                    )))
                }
            };

            if outcome.is_ok() {
                emit_all(&sender, events);
            }

            if let Some(set) = locks {
                let keys = set.keys().to_vec();
                drop(set);
                table.sweep(&keys);
            }

            outcome
        });

        match handle.await {
            Ok(outcome) => {
                self.phase = match outcome {
                    Ok(()) => TxnPhase::Committed,
                    Err(_) => TxnPhase::RolledBack,
                };

                outcome
            }
            Err(join_error) => {
                error!("Apply task failed: {}", join_error);
                self.phase = TxnPhase::RolledBack;

                Err(GraphError::retryable_conflict(
                    "the apply task failed before finishing",
                ))
            }
        }
    }

    fn release(&mut self) {
        if let Some(set) = self.locks.take() {
            let keys = set.keys().to_vec();
            drop(set);
            self.table.sweep(&keys);
        }
    }
}

impl<S: EntityStore> Drop for Txn<S> {
    fn drop(&mut self) {
        if self.locks.is_some() {
            debug!("Transaction dropped before commit, nothing was written");
            self.release();
        }
    }
}

fn emit_all(sender: &EventSender, events: Vec<GraphEvent>) {
    for event in events {
        // The receiver is gone once the graph is dropped, late events
        // have no audience
        let _ = sender.send(event);
    }
}

async fn restore_snapshots<S: EntityStore>(
    store: &S,
    undo: Vec<(RecordKey, Option<Record>)>,
) -> StoreResult<()> {
    let mut first_error = None;

    // Restore in reverse so interdependent unique values unwind cleanly
    for (key, original) in undo.into_iter().rev() {
        let result = match original {
            Some(record) => store.put(record).await,
            None => store.delete(key).await.map(|_| ()),
        };

        if let Err(error) = result {
            error!("Failed to restore {}: {}", key, error);
            first_error.get_or_insert(error);
        }
    }

    match first_error {
        None => Ok(()),
        Some(error) => Err(error),
    }
}
