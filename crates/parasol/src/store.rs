// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! SQLite persistence: the singleton `state` row (STH, position, log id),
//! the `leaf` hash-to-index table, and the content-addressed `issuer`
//! cache.
//!
//! The applier opens one write transaction across many leaf upserts plus a
//! position update and commits them atomically; the helpers that run inside
//! such a transaction are associated functions taking a connection, so the
//! same SQL serves both transactional and pool-backed callers.

use crate::checkpoint::{LogId, SignedTreeHead};
use merkle_tiles::{FragmentedTree, Hash, HASH_SIZE};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS state (
        sth BLOB,
        position BLOB,
        log_id BLOB NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS leaf (
        hash BLOB PRIMARY KEY,
        position INTEGER NOT NULL
    ) WITHOUT ROWID",
    "CREATE TABLE IF NOT EXISTS issuer (
        sha256 BLOB PRIMARY KEY,
        data BLOB NOT NULL
    ) WITHOUT ROWID",
];

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error("stored value is corrupted: {0}")]
    Corrupted(#[from] serde_json::Error),
    #[error("database belongs to a different log (stored id {stored})")]
    LogIdMismatch { stored: String },
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if necessary) the database at `path`. With
    /// `unsafe_nofsync` the synchronous pragma is turned off for bulk
    /// indexing throughput; an unclean shutdown then requires a reindex,
    /// which the root hash check will force anyway if anything was lost.
    pub async fn open(path: &Path, unsafe_nofsync: bool) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(if unsafe_nofsync {
                SqliteSynchronous::Off
            } else {
                SqliteSynchronous::Full
            })
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::with_pool(pool).await
    }

    /// Opens a single-connection in-memory store. Used by tests.
    pub async fn open_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    /// Creates the singleton state row on first run, and on subsequent runs
    /// verifies that the database belongs to the configured log.
    pub async fn init_state(&self, log_id: &LogId) -> Result<(), StoreError> {
        let stored: Option<Vec<u8>> = sqlx::query_scalar("SELECT log_id FROM state")
            .fetch_optional(&self.pool)
            .await?;
        match stored {
            None => {
                sqlx::query("INSERT INTO state (sth, position, log_id) VALUES (NULL, NULL, ?1)")
                    .bind(log_id.as_slice())
                    .execute(&self.pool)
                    .await?;
                Ok(())
            }
            Some(stored) if stored == log_id.as_slice() => Ok(()),
            Some(stored) => Err(StoreError::LogIdMismatch {
                stored: hex::encode(stored),
            }),
        }
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, StoreError> {
        Ok(self.pool.begin().await?)
    }

    pub async fn load_sth(&self) -> Result<Option<SignedTreeHead>, StoreError> {
        let blob: Option<Vec<u8>> = sqlx::query_scalar("SELECT sth FROM state")
            .fetch_one(&self.pool)
            .await?;
        match blob {
            Some(blob) => Ok(Some(serde_json::from_slice(&blob)?)),
            None => Ok(None),
        }
    }

    pub async fn store_sth(&self, sth: &SignedTreeHead) -> Result<(), StoreError> {
        let blob = serde_json::to_vec(sth)?;
        sqlx::query("UPDATE state SET sth = ?1")
            .bind(blob)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn load_position(&self) -> Result<Option<FragmentedTree>, StoreError> {
        let blob: Option<Vec<u8>> = sqlx::query_scalar("SELECT position FROM state")
            .fetch_one(&self.pool)
            .await?;
        match blob {
            Some(blob) => Ok(Some(serde_json::from_slice(&blob)?)),
            None => Ok(None),
        }
    }

    /// Serializes the position into an open transaction, so it commits
    /// atomically with the leaf rows indexed under it.
    pub async fn save_position(
        conn: &mut SqliteConnection,
        position: &FragmentedTree,
    ) -> Result<(), StoreError> {
        let blob = serde_json::to_vec(position)?;
        sqlx::query("UPDATE state SET position = ?1")
            .bind(blob)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Records `hash -> index`, keeping the smallest index on conflict.
    pub async fn upsert_leaf(
        conn: &mut SqliteConnection,
        hash: &Hash,
        index: u64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO leaf (hash, position) VALUES (?1, ?2)
             ON CONFLICT (hash) DO UPDATE SET position = excluded.position
             WHERE excluded.position < leaf.position",
        )
        .bind(hash.0.as_slice())
        .bind(i64::try_from(index).expect("leaf index fits in i64"))
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn lookup_leaf(&self, hash: &[u8; HASH_SIZE]) -> Result<Option<u64>, StoreError> {
        let position: Option<i64> = sqlx::query_scalar("SELECT position FROM leaf WHERE hash = ?1")
            .bind(hash.as_slice())
            .fetch_optional(&self.pool)
            .await?;
        Ok(position.map(|p| u64::try_from(p).expect("stored leaf index is non-negative")))
    }

    pub async fn load_issuer(&self, fingerprint: &[u8; 32]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(sqlx::query_scalar("SELECT data FROM issuer WHERE sha256 = ?1")
            .bind(fingerprint.as_slice())
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Inserts an issuer certificate if absent. Entries are immutable, so a
    /// concurrent duplicate insert is a no-op.
    pub async fn store_issuer(&self, fingerprint: &[u8; 32], data: &[u8]) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO issuer (sha256, data) VALUES (?1, ?2) ON CONFLICT (sha256) DO NOTHING")
            .bind(fingerprint.as_slice())
            .bind(data)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use merkle_tiles::record_hash;

    #[tokio::test]
    async fn test_init_state_enforces_log_id() {
        let store = Store::open_memory().await.unwrap();
        store.init_state(&[1u8; 32]).await.unwrap();
        store.init_state(&[1u8; 32]).await.unwrap();
        assert!(matches!(
            store.init_state(&[2u8; 32]).await,
            Err(StoreError::LogIdMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_state_round_trip() {
        let store = Store::open_memory().await.unwrap();
        store.init_state(&[1u8; 32]).await.unwrap();
        assert!(store.load_sth().await.unwrap().is_none());
        assert!(store.load_position().await.unwrap().is_none());

        let sth = SignedTreeHead {
            tree_size: 3,
            timestamp: 123,
            sha256_root_hash: record_hash(b"root"),
            tree_head_signature: vec![9, 9],
        };
        store.store_sth(&sth).await.unwrap();
        assert_eq!(store.load_sth().await.unwrap(), Some(sth));

        let mut position = FragmentedTree::new();
        position.add_hash(0, record_hash(b"leaf"));
        let mut tx = store.begin().await.unwrap();
        Store::save_position(&mut tx, &position).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.load_position().await.unwrap(), Some(position));
    }

    #[tokio::test]
    async fn test_leaf_keeps_minimum_index() {
        let store = Store::open_memory().await.unwrap();
        store.init_state(&[1u8; 32]).await.unwrap();
        let hash = record_hash(b"duplicated leaf");

        let mut tx = store.begin().await.unwrap();
        Store::upsert_leaf(&mut tx, &hash, 17).await.unwrap();
        Store::upsert_leaf(&mut tx, &hash, 5).await.unwrap();
        Store::upsert_leaf(&mut tx, &hash, 11).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.lookup_leaf(&hash.0).await.unwrap(), Some(5));
        assert_eq!(
            store.lookup_leaf(&record_hash(b"unknown").0).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_issuer_insert_if_absent() {
        let store = Store::open_memory().await.unwrap();
        store.init_state(&[1u8; 32]).await.unwrap();
        let fingerprint = [3u8; 32];

        assert!(store.load_issuer(&fingerprint).await.unwrap().is_none());
        store.store_issuer(&fingerprint, b"original").await.unwrap();
        store.store_issuer(&fingerprint, b"replacement").await.unwrap();
        assert_eq!(
            store.load_issuer(&fingerprint).await.unwrap().as_deref(),
            Some(b"original".as_slice())
        );
    }
}
