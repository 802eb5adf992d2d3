use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{EntityStore, StoreError, StoreResult, WriteOp};
use crate::entity::{EntityKind, Record, RecordKey, User};

/// The in-memory reference store.
///
/// Records live as documents in a concurrent map, with the unique user
/// fields kept in secondary indexes. Writers hold the commit gate
/// exclusively, so a batch becomes visible to readers all at once.
pub struct MemoryStore {
    records: DashMap<RecordKey, Record>,
    usernames: RwLock<HashMap<String, Uuid>>,
    emails: RwLock<HashMap<String, Uuid>>,
    commit: RwLock<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            usernames: RwLock::new(HashMap::new()),
            emails: RwLock::new(HashMap::new()),
            commit: RwLock::new(()),
        }
    }

    /// Fails if another user already holds one of the unique fields.
    fn check_conflicts(&self, user: &User) -> StoreResult<()> {
        let id = user.id.value();

        if let Some(existing) = self.usernames.read().get(&user.username) {
            if *existing != id {
                return Err(StoreError::Conflict {
                    kind: EntityKind::User,
                    field: "username",
                    value: user.username.clone(),
                });
            }
        }

        if let Some(existing) = self.emails.read().get(&user.email) {
            if *existing != id {
                return Err(StoreError::Conflict {
                    kind: EntityKind::User,
                    field: "email",
                    value: user.email.clone(),
                });
            }
        }

        Ok(())
    }

    /// Checks a whole batch against a simulated copy of the indexes, so a
    /// failing batch is rejected before any of it is applied.
    fn check_batch(&self, batch: &[WriteOp]) -> StoreResult<()> {
        let mut usernames = self.usernames.read().clone();
        let mut emails = self.emails.read().clone();

        for op in batch {
            // The overwritten or deleted record releases its mappings
            if let Some(entry) = self.records.get(&op.key()) {
                if let Record::User(old) = entry.value() {
                    let old_id = old.id.value();

                    if usernames.get(&old.username) == Some(&old_id) {
                        usernames.remove(&old.username);
                    }

                    if emails.get(&old.email) == Some(&old_id) {
                        emails.remove(&old.email);
                    }
                }
            }

            if let WriteOp::Put(Record::User(user)) = op {
                let id = user.id.value();

                if let Some(existing) = usernames.get(&user.username) {
                    if *existing != id {
                        return Err(StoreError::Conflict {
                            kind: EntityKind::User,
                            field: "username",
                            value: user.username.clone(),
                        });
                    }
                }

                if let Some(existing) = emails.get(&user.email) {
                    if *existing != id {
                        return Err(StoreError::Conflict {
                            kind: EntityKind::User,
                            field: "email",
                            value: user.email.clone(),
                        });
                    }
                }

                usernames.insert(user.username.clone(), id);
                emails.insert(user.email.clone(), id);
            }
        }

        Ok(())
    }

    fn unindex_user(&self, user: &User) {
        let id = user.id.value();

        let mut usernames = self.usernames.write();
        if usernames.get(&user.username) == Some(&id) {
            usernames.remove(&user.username);
        }
        drop(usernames);

        let mut emails = self.emails.write();
        if emails.get(&user.email) == Some(&id) {
            emails.remove(&user.email);
        }
    }

    fn put_unchecked(&self, record: Record) {
        let new_index = match &record {
            Record::User(user) => Some((
                user.username.clone(),
                user.email.clone(),
                user.id.value(),
            )),
            _ => None,
        };

        let previous = self.records.insert(record.key(), record);

        if let Some(Record::User(old)) = previous {
            self.unindex_user(&old);
        }

        if let Some((username, email, id)) = new_index {
            self.usernames.write().insert(username, id);
            self.emails.write().insert(email, id);
        }
    }

    fn delete_unchecked(&self, key: RecordKey) -> bool {
        match self.records.remove(&key) {
            Some((_, Record::User(old))) => {
                self.unindex_user(&old);
                true
            }
            Some(_) => true,
            None => false,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn get(&self, key: RecordKey) -> StoreResult<Option<Record>> {
        let _commit = self.commit.read();
        Ok(self.records.get(&key).map(|entry| entry.clone()))
    }

    async fn put(&self, record: Record) -> StoreResult<()> {
        let _commit = self.commit.write();

        if let Record::User(user) = &record {
            self.check_conflicts(user)?;
        }

        self.put_unchecked(record);
        Ok(())
    }

    async fn delete(&self, key: RecordKey) -> StoreResult<bool> {
        let _commit = self.commit.write();
        Ok(self.delete_unchecked(key))
    }

    async fn list(&self, kind: EntityKind) -> StoreResult<Vec<Uuid>> {
        let _commit = self.commit.read();

        Ok(self
            .records
            .iter()
            .filter(|entry| entry.key().kind == kind)
            .map(|entry| entry.key().id)
            .collect())
    }

    async fn user_id_by_username(&self, username: &str) -> StoreResult<Option<Uuid>> {
        let _commit = self.commit.read();
        Ok(self.usernames.read().get(username).copied())
    }

    async fn user_id_by_email(&self, email: &str) -> StoreResult<Option<Uuid>> {
        let _commit = self.commit.read();
        Ok(self.emails.read().get(email).copied())
    }

    async fn apply(&self, batch: Vec<WriteOp>) -> StoreResult<()> {
        let _commit = self.commit.write();

        self.check_batch(&batch)?;

        // Nothing below can fail, the batch lands as a whole
        for op in batch {
            match op {
                WriteOp::Put(record) => self.put_unchecked(record),
                WriteOp::Delete(key) => {
                    self.delete_unchecked(key);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::entity::Song;

    #[tokio::test]
    async fn roundtrip() {
        let store = MemoryStore::new();
        let user = User::mock("john");
        let key = RecordKey::new(EntityKind::User, user.id.value());

        store.put(user.clone().into()).await.unwrap();

        let fetched = store.get(key).await.unwrap();
        assert_eq!(fetched, Some(Record::User(user)), "stored user is returned");

        assert!(store.delete(key).await.unwrap(), "delete reports existence");
        assert!(
            !store.delete(key).await.unwrap(),
            "second delete reports absence"
        );
        assert_eq!(store.get(key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_filters_by_kind() {
        let store = MemoryStore::new();
        let user = User::mock("john");
        let song = Song::mock(user.id, "strawberries");

        store.put(user.clone().into()).await.unwrap();
        store.put(song.clone().into()).await.unwrap();

        let songs = store.list(EntityKind::Song).await.unwrap();
        assert_eq!(songs, vec![song.id.value()], "only songs are listed");
    }

    #[tokio::test]
    async fn unique_indexes_follow_renames() {
        let store = MemoryStore::new();
        let mut user = User::mock("john");

        store.put(user.clone().into()).await.unwrap();
        assert_eq!(
            store.user_id_by_username("john").await.unwrap(),
            Some(user.id.value())
        );

        user.username = "johnny".to_string();
        store.put(user.clone().into()).await.unwrap();

        assert_eq!(store.user_id_by_username("john").await.unwrap(), None);
        assert_eq!(
            store.user_id_by_username("johnny").await.unwrap(),
            Some(user.id.value())
        );
        assert_eq!(
            store.user_id_by_email("john@example.com").await.unwrap(),
            Some(user.id.value())
        );
    }

    #[tokio::test]
    async fn duplicate_username_conflicts() {
        let store = MemoryStore::new();
        let first = User::mock("john");
        let mut second = User::mock("john");
        second.email = "other@example.com".to_string();

        store.put(first.into()).await.unwrap();

        let result = store.put(second.into()).await;
        assert!(
            matches!(result, Err(StoreError::Conflict { field: "username", .. })),
            "second john conflicts"
        );
    }

    #[tokio::test]
    async fn failing_batch_applies_nothing() {
        let store = MemoryStore::new();
        let user = User::mock("john");
        let song = Song::mock(user.id, "strawberries");
        let song_key = RecordKey::new(EntityKind::Song, song.id.value());

        let mut duplicate = User::mock("john");
        duplicate.email = "other@example.com".to_string();

        store.put(user.into()).await.unwrap();

        let result = store
            .apply(vec![
                WriteOp::Put(song.into()),
                WriteOp::Put(duplicate.into()),
            ])
            .await;

        assert!(result.is_err(), "batch with a conflict is rejected");
        assert_eq!(
            store.get(song_key).await.unwrap(),
            None,
            "no part of a rejected batch is visible"
        );
    }

    #[tokio::test]
    async fn batch_can_swap_usernames_through_deletion() {
        let store = MemoryStore::new();
        let retiring = User::mock("john");
        let mut successor = User::mock("john");
        successor.email = "successor@example.com".to_string();

        store.put(retiring.clone().into()).await.unwrap();

        store
            .apply(vec![
                WriteOp::Delete(RecordKey::new(EntityKind::User, retiring.id.value())),
                WriteOp::Put(successor.clone().into()),
            ])
            .await
            .unwrap();

        assert_eq!(
            store.user_id_by_username("john").await.unwrap(),
            Some(successor.id.value()),
            "freed username belongs to the successor"
        );
    }
}
