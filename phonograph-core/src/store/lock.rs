use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{self, Instant};

use crate::entity::{EntityKind, RecordKey};

/// Names one exclusive lock in the table.
///
/// The derived order (registries first, then records by kind and id) is the
/// single global order every operation acquires its locks in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockKey {
    /// Serializes creation and renames within one kind, closing the window
    /// between a uniqueness check and the write that follows it.
    Registry(EntityKind),
    /// Serializes mutations touching one record.
    Record(RecordKey),
}

impl Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registry(kind) => write!(f, "the {} registry", kind),
            Self::Record(key) => write!(f, "{}", key),
        }
    }
}

/// Hands out one async mutex per lock key, on demand.
pub struct LockTable {
    locks: DashMap<LockKey, Arc<Mutex<()>>>,
}

/// Exclusive access to a set of keys. Released on drop.
pub struct LockSet {
    keys: Vec<LockKey>,
    // Held only for the exclusion, never inspected
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl LockSet {
    pub fn keys(&self) -> &[LockKey] {
        &self.keys
    }
}

impl LockTable {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Acquires every given key in the global order, all within one shared
    /// deadline. On timeout the partially acquired set is released and the
    /// key that could not be locked is returned.
    pub async fn acquire(
        &self,
        mut keys: Vec<LockKey>,
        timeout: Duration,
    ) -> Result<LockSet, LockKey> {
        keys.sort();
        keys.dedup();

        let deadline = Instant::now() + timeout;
        let mut guards = Vec::with_capacity(keys.len());

        for key in &keys {
            let mutex = self
                .locks
                .entry(*key)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();

            let remaining = deadline.duration_since(Instant::now());

            match time::timeout(remaining, mutex.lock_owned()).await {
                Ok(guard) => guards.push(guard),
                // Dropping the vec releases everything taken so far
                Err(_) => return Err(*key),
            }
        }

        Ok(LockSet {
            keys,
            _guards: guards,
        })
    }

    /// Drops the mutexes of keys nobody is holding or waiting for anymore.
    /// Callers release their `LockSet` first.
    pub fn sweep(&self, keys: &[LockKey]) {
        for key in keys {
            self.locks
                .remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
        }
    }

    /// How many keys currently have a mutex.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::entity::{EntityKind, RecordKey};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time;
    use uuid::Uuid;

    fn record_key(id: u8) -> LockKey {
        LockKey::Record(RecordKey::new(EntityKind::Song, Uuid::from_bytes([id; 16])))
    }

    #[tokio::test]
    async fn times_out_when_held_elsewhere() {
        let table = Arc::new(LockTable::new());
        let key = record_key(1);

        let held = table
            .acquire(vec![key], Duration::from_secs(1))
            .await
            .expect("first acquisition succeeds");

        let result = table
            .acquire(vec![key], Duration::from_millis(20))
            .await;
        assert_eq!(result.err(), Some(key), "second acquisition times out");

        drop(held);

        table
            .acquire(vec![key], Duration::from_secs(1))
            .await
            .expect("key is free again after release");
    }

    #[tokio::test]
    async fn crossed_pairs_do_not_deadlock() {
        let table = Arc::new(LockTable::new());
        let (a, b) = (record_key(1), record_key(2));

        let mut tasks = Vec::new();

        for keys in [vec![a, b], vec![b, a]] {
            let table = table.clone();

            tasks.push(tokio::spawn(async move {
                for _ in 0..100 {
                    let set = table
                        .acquire(keys.clone(), Duration::from_secs(5))
                        .await
                        .expect("acquisition in either order succeeds");
                    drop(set);
                }
            }));
        }

        for task in tasks {
            time::timeout(Duration::from_secs(10), task)
                .await
                .expect("tasks finish without deadlocking")
                .expect("task does not panic");
        }
    }

    #[tokio::test]
    async fn sweep_drops_unused_mutexes() {
        let table = LockTable::new();
        let keys = vec![record_key(1), record_key(2)];

        let set = table
            .acquire(keys.clone(), Duration::from_secs(1))
            .await
            .expect("acquisition succeeds");
        assert_eq!(table.len(), 2);

        // Still held, sweep must leave them alone
        table.sweep(&keys);
        assert_eq!(table.len(), 2);

        drop(set);
        table.sweep(&keys);
        assert!(table.is_empty(), "released keys are swept away");
    }
}
