// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Driver interfaces consumed by the engine.
//!
//! The engine never talks to `sqlx` or `redis` directly. It holds
//! `Arc<dyn Database>` per SQL pool and `Arc<dyn RemoteCache>` per remote
//! pool, so the concrete drivers ([`super::sql::SqlxDatabase`],
//! [`super::redis::RedisCache`], [`super::memory::MemoryCache`]) are
//! interchangeable.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::value::Value;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    /// Unique constraint violation reported by the database.
    /// `key` is the index name (MySQL) or the column list (SQLite).
    #[error("Duplicate entry for key '{key}': {detail}")]
    Duplicate { key: String, detail: String },
    #[error("Foreign key constraint failed: {detail}")]
    ForeignKey { detail: String },
    #[error("Operation against a key holding the wrong kind of value: {key}")]
    WrongType { key: String },
}

/// SQL flavour of a pool; only affects DDL and a couple of statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    MySql,
    Sqlite,
}

/// Result of a data-modifying statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub rows_affected: u64,
    pub last_insert_id: Option<u64>,
}

/// One result row, positional.
pub type DbRow = Vec<Value>;

/// A SQL connection pool. Placeholders are `?`.
#[async_trait]
pub trait Database: Send + Sync {
    fn dialect(&self) -> Dialect;

    async fn exec(&self, sql: &str, args: &[Value]) -> Result<ExecResult, StorageError>;

    async fn query(&self, sql: &str, args: &[Value]) -> Result<Vec<DbRow>, StorageError>;

    async fn query_row(&self, sql: &str, args: &[Value]) -> Result<Option<DbRow>, StorageError> {
        Ok(self.query(sql, args).await?.into_iter().next())
    }

    /// Start a transaction holding one pooled connection until commit/rollback.
    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError>;
}

#[async_trait]
pub trait Transaction: Send + Sync {
    async fn exec(&self, sql: &str, args: &[Value]) -> Result<ExecResult, StorageError>;

    async fn query(&self, sql: &str, args: &[Value]) -> Result<Vec<DbRow>, StorageError>;

    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

/// A write command that can be batched into a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCommand {
    Set { key: String, value: Vec<u8>, ttl: Option<Duration> },
    Del { keys: Vec<String> },
    HSet { key: String, field: String, value: Vec<u8> },
    HDel { key: String, fields: Vec<String> },
    SAdd { key: String, members: Vec<String> },
    SRem { key: String, members: Vec<String> },
    RPush { key: String, values: Vec<Vec<u8>> },
    XAdd { stream: String, fields: Vec<(String, Vec<u8>)> },
}

/// One stream entry: id plus field/value pairs.
pub type StreamEntry = (String, Vec<(String, Vec<u8>)>);

/// Typed subset of the remote key-value store the engine uses.
///
/// Every call propagates driver errors; nothing retries at this layer.
#[async_trait]
pub trait RemoteCache: Send + Sync {
    // strings
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StorageError>;
    /// SET NX with TTL. Returns true when the key was created.
    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, StorageError>;
    async fn del(&self, keys: &[String]) -> Result<u64, StorageError>;
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
    async fn pttl(&self, key: &str) -> Result<Option<Duration>, StorageError>;

    // counters
    async fn incr_by(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64, StorageError>;
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, StorageError>;

    // hashes
    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<Vec<u8>>>, StorageError>;
    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<(), StorageError>;
    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64, StorageError>;
    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError>;

    // lists
    async fn lpush(&self, key: &str, values: &[Vec<u8>]) -> Result<u64, StorageError>;
    async fn rpush(&self, key: &str, values: &[Vec<u8>]) -> Result<u64, StorageError>;
    async fn rpop(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>, StorageError>;
    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), StorageError>;
    async fn llen(&self, key: &str) -> Result<u64, StorageError>;

    // sets
    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, StorageError>;
    async fn srem(&self, key: &str, members: &[String]) -> Result<u64, StorageError>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>, StorageError>;

    // sorted sets
    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StorageError>;
    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StorageError>;
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StorageError>;

    // streams
    async fn xadd(&self, stream: &str, fields: &[(String, Vec<u8>)]) -> Result<String, StorageError>;
    async fn xrange(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>, StorageError>;
    async fn xdel(&self, stream: &str, ids: &[String]) -> Result<u64, StorageError>;

    /// Run the commands as one MULTI/EXEC block.
    async fn pipeline(&self, commands: Vec<RemoteCommand>) -> Result<(), StorageError>;

    /// Scripted: delete `key` only while it still holds `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, StorageError>;

    /// Scripted: reset the TTL of `key` only while it still holds `expected`.
    async fn expire_if_equals(&self, key: &str, expected: &[u8], ttl: Duration) -> Result<bool, StorageError>;

    /// Delete every key starting with `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StorageError>;

    async fn flush_all(&self) -> Result<(), StorageError>;
}

impl<'a> dyn RemoteCache + 'a {
    /// Read `key`; on a miss call `provider`, store its result with `ttl`
    /// and return it.
    pub async fn get_set<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        provider: F,
    ) -> Result<Vec<u8>, StorageError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: std::future::Future<Output = Result<Vec<u8>, StorageError>> + Send,
    {
        if let Some(hit) = self.get(key).await? {
            return Ok(hit);
        }
        let value = provider().await?;
        self.set(key, &value, ttl).await?;
        Ok(value)
    }
}
