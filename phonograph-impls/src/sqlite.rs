use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use log::info;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::Error as SqlxError;
use uuid::Uuid;

use phonograph_core::{
    EntityKind, EntityStore, IntoStoreError, Record, RecordKey, StoreError, StoreResult, WriteOp,
};

/// Everything lives in one table: records are stored as their serialized
/// bodies keyed by kind and id, with the unique user fields pulled out into
/// indexed columns. Partial unique indexes turn a duplicate username or
/// email into a constraint violation the store maps to a conflict.
const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS records (
        kind TEXT NOT NULL,
        id TEXT NOT NULL,
        body TEXT NOT NULL,
        username TEXT,
        email TEXT,
        PRIMARY KEY (kind, id)
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS records_username
        ON records (username) WHERE username IS NOT NULL",
    "CREATE UNIQUE INDEX IF NOT EXISTS records_email
        ON records (email) WHERE email IS NOT NULL",
];

/// A SQLite entity store implementation for phonograph.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens the database at `path`, creating file and schema when missing.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| e.internal())?;

        Self::prepare(pool).await
    }

    /// Opens a private in-memory database that lives as long as the store.
    pub async fn memory() -> StoreResult<Self> {
        let options =
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| e.internal())?;

        // Every connection gets its own empty in-memory database, so the
        // pool has to be pinned to a single one
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| e.internal())?;

        Self::prepare(pool).await
    }

    async fn prepare(pool: SqlitePool) -> StoreResult<Self> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|e| e.internal())?;
        }

        info!("Sqlite store is ready");

        Ok(Self { pool })
    }

    /// Closes the pool, flushing outstanding writes.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl EntityStore for SqliteStore {
    async fn get(&self, key: RecordKey) -> StoreResult<Option<Record>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT body FROM records WHERE kind = ? AND id = ?")
                .bind(key.kind.as_str())
                .bind(key.id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| e.internal())?;

        row.map(|(body,)| decode(key, &body)).transpose()
    }

    async fn put(&self, record: Record) -> StoreResult<()> {
        let mut connection = self.pool.acquire().await.map_err(|e| e.internal())?;
        put_on(&mut connection, &record).await
    }

    async fn delete(&self, key: RecordKey) -> StoreResult<bool> {
        let mut connection = self.pool.acquire().await.map_err(|e| e.internal())?;
        delete_on(&mut connection, key).await
    }

    async fn list(&self, kind: EntityKind) -> StoreResult<Vec<Uuid>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT id FROM records WHERE kind = ?")
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.internal())?;

        rows.into_iter()
            .map(|(id,)| Uuid::parse_str(&id).map_err(|e| e.internal()))
            .collect()
    }

    async fn user_id_by_username(&self, username: &str) -> StoreResult<Option<Uuid>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT id FROM records WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.internal())?;

        row.map(|(id,)| Uuid::parse_str(&id).map_err(|e| e.internal()))
            .transpose()
    }

    async fn user_id_by_email(&self, email: &str) -> StoreResult<Option<Uuid>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT id FROM records WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.internal())?;

        row.map(|(id,)| Uuid::parse_str(&id).map_err(|e| e.internal()))
            .transpose()
    }

    /// The whole batch runs in one SQL transaction, so readers see either
    /// none of it or all of it, and a constraint violation undoes everything.
    async fn apply(&self, batch: Vec<WriteOp>) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(|e| e.internal())?;

        for op in &batch {
            match op {
                WriteOp::Put(record) => put_on(&mut tx, record).await?,
                WriteOp::Delete(key) => {
                    delete_on(&mut tx, *key).await?;
                }
            }
        }

        tx.commit().await.map_err(|e| e.internal())
    }
}

async fn put_on(connection: &mut SqliteConnection, record: &Record) -> StoreResult<()> {
    let body = serde_json::to_string(record).map_err(|source| StoreError::Corrupt {
        key: record.key(),
        source: Box::new(source),
    })?;

    let (username, email) = match record {
        Record::User(user) => (Some(user.username.as_str()), Some(user.email.as_str())),
        _ => (None, None),
    };

    sqlx::query(
        "INSERT INTO records (kind, id, body, username, email)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT (kind, id) DO UPDATE SET
            body = excluded.body,
            username = excluded.username,
            email = excluded.email",
    )
    .bind(record.kind().as_str())
    .bind(record.id().to_string())
    .bind(body)
    .bind(username)
    .bind(email)
    .execute(connection)
    .await
    .map_err(|e| unique_violation_or_internal(e, record))?;

    Ok(())
}

async fn delete_on(connection: &mut SqliteConnection, key: RecordKey) -> StoreResult<bool> {
    let result = sqlx::query("DELETE FROM records WHERE kind = ? AND id = ?")
        .bind(key.kind.as_str())
        .bind(key.id.to_string())
        .execute(connection)
        .await
        .map_err(|e| e.internal())?;

    Ok(result.rows_affected() > 0)
}

fn decode(key: RecordKey, body: &str) -> StoreResult<Record> {
    serde_json::from_str(body).map_err(|source| StoreError::Corrupt {
        key,
        source: Box::new(source),
    })
}

/// Turns a violation of one of the partial unique indexes into the conflict
/// it represents. SQLite names the failing column in its message.
fn unique_violation_or_internal(error: SqlxError, record: &Record) -> StoreError {
    if let Record::User(user) = record {
        if let SqlxError::Database(db_error) = &error {
            if db_error.is_unique_violation() {
                let (field, value) = if db_error.message().contains("username") {
                    ("username", user.username.clone())
                } else {
                    ("email", user.email.clone())
                };

                return StoreError::Conflict {
                    kind: EntityKind::User,
                    field,
                    value,
                };
            }
        }
    }

    error.internal()
}
