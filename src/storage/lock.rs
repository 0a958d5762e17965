// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Distributed lock over a reserved remote key.
//!
//! `SET key token NX PX ttl` to acquire; refresh and release only act when
//! the key still holds our token, so a lock that expired and was taken by
//! another process is never touched.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use super::traits::{RemoteCache, StorageError};
use crate::context::Context;
use crate::error::OrmError;
use crate::metrics;

const MAX_BACKOFF: Duration = Duration::from_secs(1);

pub struct Locker {
    cache: Arc<dyn RemoteCache>,
    retry: Duration,
}

/// A held lock. Dropping it without [`Lock::release`] lets it expire.
pub struct Lock {
    cache: Arc<dyn RemoteCache>,
    key: String,
    token: Vec<u8>,
    ttl: Duration,
}

impl Locker {
    #[must_use]
    pub fn new(cache: Arc<dyn RemoteCache>, retry: Duration) -> Self {
        Self { cache, retry }
    }

    /// Try to acquire `key`, spinning with bounded backoff for up to `wait`.
    /// Returns `None` when the wait elapses.
    pub async fn obtain(
        &self,
        ctx: &Context,
        key: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<Option<Lock>, OrmError> {
        let token = uuid::Uuid::new_v4().to_string().into_bytes();
        let started = Instant::now();
        let mut backoff = self.retry.max(Duration::from_millis(1));
        loop {
            ctx.check()?;
            if self.cache.set_nx(key, &token, ttl).await? {
                debug!(key, "Lock acquired");
                metrics::record_lock("acquired");
                return Ok(Some(Lock {
                    cache: self.cache.clone(),
                    key: key.to_string(),
                    token,
                    ttl,
                }));
            }
            let elapsed = started.elapsed();
            if elapsed >= wait {
                metrics::record_lock("timeout");
                return Ok(None);
            }
            ctx.sleep(backoff.min(wait - elapsed)).await?;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

impl Lock {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Extend the TTL. `false` means the lock was lost.
    pub async fn refresh(&self) -> Result<bool, StorageError> {
        let held = self.cache.expire_if_equals(&self.key, &self.token, self.ttl).await?;
        if !held {
            metrics::record_lock("lost");
        }
        Ok(held)
    }

    /// Remaining TTL, `None` once the lock is gone.
    pub async fn ttl(&self) -> Result<Option<Duration>, StorageError> {
        match self.cache.get(&self.key).await? {
            Some(token) if token == self.token => self.cache.pttl(&self.key).await,
            _ => Ok(None),
        }
    }

    pub async fn release(self) -> Result<(), StorageError> {
        self.cache.delete_if_equals(&self.key, &self.token).await?;
        debug!(key = %self.key, "Lock released");
        metrics::record_lock("released");
        Ok(())
    }
}
