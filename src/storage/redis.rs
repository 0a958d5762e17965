// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis implementation of the remote cache tier.
//!
//! One [`ConnectionManager`] per pool (it multiplexes and reconnects on its
//! own). Pipelines run as MULTI/EXEC. Compare-and-delete and
//! compare-and-expire are Lua scripts; [`redis::Script`] invokes them by
//! SHA and reloads them transparently after a `NOSCRIPT`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, pipe, Client, RedisError, Script};
use tracing::info;

use super::traits::{RemoteCache, RemoteCommand, StorageError, StreamEntry};
use crate::config::RedisPoolConfig;
use crate::metrics;
use crate::resilience::retry::{retry, RetryConfig};

const DELETE_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const EXPIRE_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

fn map_err(err: RedisError) -> StorageError {
    if err.code() == Some("WRONGTYPE") {
        StorageError::WrongType {
            key: err.detail().unwrap_or_default().to_string(),
        }
    } else {
        StorageError::Backend(err.to_string())
    }
}

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

pub struct RedisCache {
    connection: ConnectionManager,
    /// Optional key prefix for namespacing (e.g., "app:" → "app:a3f01")
    prefix: String,
    delete_if_equals: Script,
    expire_if_equals: Script,
}

impl RedisCache {
    /// Connect with startup-mode retry.
    pub async fn connect(config: &RedisPoolConfig) -> Result<Self, StorageError> {
        let started = Instant::now();
        let client = Client::open(config.url.as_str()).map_err(map_err)?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: RedisError| {
            metrics::record_connection_error("redis");
            map_err(e)
        })?;

        metrics::record_startup_phase("redis_connect", started.elapsed());
        info!(prefix = config.prefix.as_deref().unwrap_or(""), "Redis pool connected");
        Ok(Self {
            connection,
            prefix: config.prefix.clone().unwrap_or_default(),
            delete_if_equals: Script::new(DELETE_IF_EQUALS),
            expire_if_equals: Script::new(EXPIRE_IF_EQUALS),
        })
    }

    #[inline]
    fn key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    fn keys(&self, keys: &[String]) -> Vec<String> {
        keys.iter().map(|k| self.key(k)).collect()
    }

    fn conn(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

#[async_trait]
impl RemoteCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        cmd("GET").arg(self.key(key)).query_async(&mut self.conn()).await.map_err(map_err)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StorageError> {
        let mut c = cmd("SET");
        c.arg(self.key(key)).arg(value);
        if let Some(ttl) = ttl {
            c.arg("PX").arg(millis(ttl));
        }
        c.query_async::<()>(&mut self.conn()).await.map_err(map_err)
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, StorageError> {
        let reply: Option<String> = cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)?;
        Ok(reply.is_some())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StorageError> {
        if keys.is_empty() {
            return Ok(0);
        }
        cmd("DEL").arg(self.keys(keys)).query_async(&mut self.conn()).await.map_err(map_err)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        cmd("EXISTS").arg(self.key(key)).query_async(&mut self.conn()).await.map_err(map_err)
    }

    async fn pttl(&self, key: &str) -> Result<Option<Duration>, StorageError> {
        let ms: i64 = cmd("PTTL")
            .arg(self.key(key))
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)?;
        Ok((ms >= 0).then(|| Duration::from_millis(ms as u64)))
    }

    async fn incr_by(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64, StorageError> {
        let key = self.key(key);
        let mut p = pipe();
        p.atomic().cmd("INCRBY").arg(&key).arg(delta);
        if let Some(ttl) = ttl {
            p.cmd("PEXPIRE").arg(&key).arg(millis(ttl)).ignore();
        }
        let (value,): (i64,) = p.query_async(&mut self.conn()).await.map_err(map_err)?;
        Ok(value)
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, StorageError> {
        cmd("HINCRBY")
            .arg(self.key(key))
            .arg(field)
            .arg(delta)
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StorageError> {
        cmd("HGET")
            .arg(self.key(key))
            .arg(field)
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<Vec<u8>>>, StorageError> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        cmd("HMGET")
            .arg(self.key(key))
            .arg(fields)
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<(), StorageError> {
        cmd("HSET")
            .arg(self.key(key))
            .arg(field)
            .arg(value)
            .query_async::<()>(&mut self.conn())
            .await
            .map_err(map_err)
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64, StorageError> {
        if fields.is_empty() {
            return Ok(0);
        }
        cmd("HDEL")
            .arg(self.key(key))
            .arg(fields)
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        cmd("HGETALL").arg(self.key(key)).query_async(&mut self.conn()).await.map_err(map_err)
    }

    async fn lpush(&self, key: &str, values: &[Vec<u8>]) -> Result<u64, StorageError> {
        cmd("LPUSH")
            .arg(self.key(key))
            .arg(values)
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)
    }

    async fn rpush(&self, key: &str, values: &[Vec<u8>]) -> Result<u64, StorageError> {
        cmd("RPUSH")
            .arg(self.key(key))
            .arg(values)
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)
    }

    async fn rpop(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        cmd("RPOP").arg(self.key(key)).query_async(&mut self.conn()).await.map_err(map_err)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>, StorageError> {
        cmd("LRANGE")
            .arg(self.key(key))
            .arg(start)
            .arg(stop)
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), StorageError> {
        cmd("LTRIM")
            .arg(self.key(key))
            .arg(start)
            .arg(stop)
            .query_async::<()>(&mut self.conn())
            .await
            .map_err(map_err)
    }

    async fn llen(&self, key: &str) -> Result<u64, StorageError> {
        cmd("LLEN").arg(self.key(key)).query_async(&mut self.conn()).await.map_err(map_err)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, StorageError> {
        if members.is_empty() {
            return Ok(0);
        }
        cmd("SADD")
            .arg(self.key(key))
            .arg(members)
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<u64, StorageError> {
        if members.is_empty() {
            return Ok(0);
        }
        cmd("SREM")
            .arg(self.key(key))
            .arg(members)
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StorageError> {
        cmd("SMEMBERS").arg(self.key(key)).query_async(&mut self.conn()).await.map_err(map_err)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StorageError> {
        cmd("ZADD")
            .arg(self.key(key))
            .arg(score)
            .arg(member)
            .query_async::<()>(&mut self.conn())
            .await
            .map_err(map_err)
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StorageError> {
        cmd("ZRANGE")
            .arg(self.key(key))
            .arg(start)
            .arg(stop)
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StorageError> {
        cmd("ZSCORE")
            .arg(self.key(key))
            .arg(member)
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)
    }

    async fn xadd(&self, stream: &str, fields: &[(String, Vec<u8>)]) -> Result<String, StorageError> {
        let mut c = cmd("XADD");
        c.arg(self.key(stream)).arg("*");
        for (field, value) in fields {
            c.arg(field).arg(value.as_slice());
        }
        c.query_async(&mut self.conn()).await.map_err(map_err)
    }

    async fn xrange(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>, StorageError> {
        cmd("XRANGE")
            .arg(self.key(stream))
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)
    }

    async fn xdel(&self, stream: &str, ids: &[String]) -> Result<u64, StorageError> {
        if ids.is_empty() {
            return Ok(0);
        }
        cmd("XDEL")
            .arg(self.key(stream))
            .arg(ids)
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)
    }

    async fn pipeline(&self, commands: Vec<RemoteCommand>) -> Result<(), StorageError> {
        if commands.is_empty() {
            return Ok(());
        }
        let mut p = pipe();
        p.atomic();
        for command in commands {
            match command {
                RemoteCommand::Set { key, value, ttl } => {
                    p.cmd("SET").arg(self.key(&key)).arg(value);
                    if let Some(ttl) = ttl {
                        p.arg("PX").arg(millis(ttl));
                    }
                    p.ignore();
                }
                RemoteCommand::Del { keys } if !keys.is_empty() => {
                    p.cmd("DEL").arg(self.keys(&keys)).ignore();
                }
                RemoteCommand::HSet { key, field, value } => {
                    p.cmd("HSET").arg(self.key(&key)).arg(field).arg(value).ignore();
                }
                RemoteCommand::HDel { key, fields } if !fields.is_empty() => {
                    p.cmd("HDEL").arg(self.key(&key)).arg(fields).ignore();
                }
                RemoteCommand::SAdd { key, members } if !members.is_empty() => {
                    p.cmd("SADD").arg(self.key(&key)).arg(members).ignore();
                }
                RemoteCommand::SRem { key, members } if !members.is_empty() => {
                    p.cmd("SREM").arg(self.key(&key)).arg(members).ignore();
                }
                RemoteCommand::RPush { key, values } if !values.is_empty() => {
                    p.cmd("RPUSH").arg(self.key(&key)).arg(values).ignore();
                }
                RemoteCommand::XAdd { stream, fields } => {
                    p.cmd("XADD").arg(self.key(&stream)).arg("*");
                    for (field, value) in fields {
                        p.arg(field).arg(value);
                    }
                    p.ignore();
                }
                _ => {}
            }
        }
        p.query_async::<()>(&mut self.conn()).await.map_err(map_err)
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, StorageError> {
        let deleted: i64 = self
            .delete_if_equals
            .key(self.key(key))
            .arg(expected)
            .invoke_async(&mut self.conn())
            .await
            .map_err(map_err)?;
        Ok(deleted == 1)
    }

    async fn expire_if_equals(&self, key: &str, expected: &[u8], ttl: Duration) -> Result<bool, StorageError> {
        let updated: i64 = self
            .expire_if_equals
            .key(self.key(key))
            .arg(expected)
            .arg(millis(ttl))
            .invoke_async(&mut self.conn())
            .await
            .map_err(map_err)?;
        Ok(updated == 1)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StorageError> {
        let mut conn = self.conn();
        let pattern = format!("{}*", self.key(prefix));
        let mut cursor = 0u64;
        let mut deleted = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
            if !keys.is_empty() {
                // SCAN returns full keys, so no prefixing here
                let n: u64 = cmd("DEL").arg(keys).query_async(&mut conn).await.map_err(map_err)?;
                deleted += n;
            }
            if next == 0 {
                return Ok(deleted);
            }
            cursor = next;
        }
    }

    async fn flush_all(&self) -> Result<(), StorageError> {
        if self.prefix.is_empty() {
            return cmd("FLUSHDB")
                .query_async::<()>(&mut self.conn())
                .await
                .map_err(map_err);
        }
        self.delete_prefix("").await.map(|_| ())
    }
}
