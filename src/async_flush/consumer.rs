// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Consumer side: runs queued SQL against the database.
//!
//! One consumer per queue holds the distributed lock `lock:<queue>`. It
//! reads a batch from the head of the list, executes each operation in
//! order and trims only what succeeded (or what a resolver accepted). An
//! unresolved failure stops the consumer with the operation still at the
//! head, so a restart retries it.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::AsyncOperation;
use crate::context::Context;
use crate::coordinator::Engine;
use crate::error::OrmError;
use crate::metrics;
use crate::storage::lock::{Lock, Locker};
use crate::storage::traits::StorageError;

pub struct AsyncConsumer {
    engine: Engine,
    queue: String,
    pool: String,
}

impl AsyncConsumer {
    pub(crate) fn new(engine: Engine, queue: &str, pool: &str) -> Self {
        Self {
            engine,
            queue: queue.to_string(),
            pool: pool.to_string(),
        }
    }

    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Consume until `ctx` ends. Waits `async_block_ms` whenever the queue
    /// is empty. On cancellation the in-process buffers are stopped and
    /// flushed to the queue before returning `Ok`.
    pub async fn run(&self, ctx: &Context) -> Result<(), OrmError> {
        let block = Duration::from_millis(self.engine.config().async_block_ms);
        let lock = match self.acquire(ctx).await {
            Ok(lock) => lock,
            Err(OrmError::Cancelled) => {
                self.engine.async_publisher().shutdown().await;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        info!(queue = %self.queue, pool = %self.pool, "Async consumer started");

        let result = loop {
            match self.step(ctx, &lock).await {
                Ok(0) => {
                    if ctx.sleep(block).await.is_err() {
                        break Ok(());
                    }
                }
                Ok(_) => {}
                Err(OrmError::Cancelled) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        if result.is_ok() {
            self.engine.async_publisher().shutdown().await;
        }
        if let Err(e) = lock.release().await {
            warn!(queue = %self.queue, error = %e, "Releasing consumer lock failed");
        }
        info!(queue = %self.queue, "Async consumer stopped");
        result
    }

    /// Push everything buffered in process onto the queue, then consume
    /// until the queue is empty. Returns the number of operations consumed.
    pub async fn drain(&self, ctx: &Context) -> Result<usize, OrmError> {
        self.engine.async_publisher().shutdown().await;
        let lock = self.acquire(ctx).await?;
        let mut total = 0;
        let result = loop {
            match self.step(ctx, &lock).await {
                Ok(0) => break Ok(total),
                Ok(n) => total += n,
                Err(e) => break Err(e),
            }
        };
        if let Err(e) = lock.release().await {
            warn!(queue = %self.queue, error = %e, "Releasing consumer lock failed");
        }
        result
    }

    async fn acquire(&self, ctx: &Context) -> Result<Lock, OrmError> {
        let config = self.engine.config();
        let cache = self.engine.remote_pool(&self.pool)?.clone();
        let locker = Locker::new(cache, Duration::from_millis(config.lock_retry_ms));
        let ttl = Duration::from_millis(config.consumer_lock_ttl_ms);
        let key = format!("lock:{}", self.queue);
        loop {
            if let Some(lock) = locker.obtain(ctx, &key, ttl, ttl).await? {
                return Ok(lock);
            }
            debug!(queue = %self.queue, "Consumer lock held elsewhere, waiting");
        }
    }

    /// One batch. Returns how many operations left the queue.
    async fn step(&self, ctx: &Context, lock: &Lock) -> Result<usize, OrmError> {
        ctx.check()?;
        if !lock.refresh().await? {
            return Err(StorageError::Backend(format!("consumer lock {} lost", lock.key())).into());
        }
        let cache = self.engine.remote_pool(&self.pool)?;
        let batch = self.engine.config().async_batch_size.max(1) as i64;
        let items = cache.lrange(&self.queue, 0, batch - 1).await?;
        if items.is_empty() {
            metrics::set_async_queue_depth(&self.queue, "remote", 0);
            return Ok(0);
        }

        let mut consumed = 0;
        let mut failure = None;
        for raw in &items {
            if let Err(e) = ctx.check() {
                failure = Some(e);
                break;
            }
            let operation = match AsyncOperation::decode(raw) {
                Ok(operation) => operation,
                Err(e) => {
                    error!(queue = %self.queue, error = %e, "Dropping undecodable async operation");
                    consumed += 1;
                    continue;
                }
            };
            match self.execute(&operation).await {
                Ok(()) => consumed += 1,
                Err(err) => {
                    let handled = self
                        .engine
                        .schemas()
                        .by_table(&operation.table)
                        .is_ok_and(|schema| self.engine.resolve_query_error(schema, &operation, &err));
                    if handled {
                        warn!(table = %operation.table, id = operation.id, error = %err, "Async operation failed, resolved");
                        consumed += 1;
                    } else {
                        error!(table = %operation.table, id = operation.id, sql = %operation.sql, error = %err, "Async operation failed");
                        metrics::record_error("sql", "async_consume", "unresolved");
                        failure = Some(OrmError::Io(err));
                        break;
                    }
                }
            }
        }

        if consumed > 0 {
            cache.ltrim(&self.queue, consumed as i64, -1).await?;
            metrics::record_async_operations(&self.queue, "consumed", consumed);
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(consumed),
        }
    }

    async fn execute(&self, operation: &AsyncOperation) -> Result<(), StorageError> {
        let db = self
            .engine
            .database(&operation.pool)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        db.exec(&operation.sql, &operation.args).await?;
        Ok(())
    }
}
