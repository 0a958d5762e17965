// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Producer side: bounded in-process buffers drained onto remote lists.
//!
//! Each schema gets its own buffer and worker task, spawned on first use.
//! A full buffer makes the publisher wait for space so operations of one
//! schema never overtake each other. A batch the remote list refuses stays
//! with its worker and is retried until [`AsyncPublisher::shutdown`].

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use super::AsyncOperation;
use crate::config::EngineConfig;
use crate::error::OrmError;
use crate::metrics;
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::traits::RemoteCache;

/// `None` is the stop sentinel.
type Message = Option<AsyncOperation>;

struct QueueHandle {
    sender: mpsc::Sender<Message>,
    worker: JoinHandle<()>,
    stop: CancellationToken,
    // Releases a stuck worker when the publisher is dropped without shutdown.
    _stop_on_drop: DropGuard,
}

pub struct AsyncPublisher {
    queues: DashMap<String, QueueHandle>,
    buffer_size: usize,
    batch_size: usize,
}

impl AsyncPublisher {
    pub(crate) fn new(config: &EngineConfig) -> Self {
        Self {
            queues: DashMap::new(),
            buffer_size: config.async_buffer_size.max(1),
            batch_size: config.async_batch_size.max(1),
        }
    }

    /// Buffer `operation` for the remote list `queue` on `cache`.
    pub async fn publish(
        &self,
        pool: &str,
        cache: Arc<dyn RemoteCache>,
        queue: &str,
        operation: AsyncOperation,
    ) -> Result<(), OrmError> {
        let sender = self
            .queues
            .entry(operation.table.clone())
            .or_insert_with(|| self.spawn(&operation.table, pool, cache.clone(), queue))
            .sender
            .clone();

        match sender.try_send(Some(operation)) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                debug!(queue, "Async buffer full, waiting for the worker");
                if let Err(mpsc::error::SendError(Some(operation))) = sender.send(message).await {
                    push_direct(cache.as_ref(), queue, &operation).await?;
                }
            }
            // Worker stopped between lookup and send.
            Err(TrySendError::Closed(Some(operation))) => push_direct(cache.as_ref(), queue, &operation).await?,
            Err(TrySendError::Closed(None)) => {}
        }
        metrics::record_async_operations(queue, "published", 1);
        metrics::set_async_queue_depth(queue, "buffer", sender.max_capacity() - sender.capacity());
        Ok(())
    }

    fn spawn(&self, table: &str, pool: &str, cache: Arc<dyn RemoteCache>, queue: &str) -> QueueHandle {
        let (sender, receiver) = mpsc::channel(self.buffer_size);
        let stop = CancellationToken::new();
        info!(table, pool, queue, "Starting async flush worker");
        let worker = tokio::spawn(run_worker(
            Worker {
                table: table.to_string(),
                queue: queue.to_string(),
                cache,
                stop: stop.clone(),
                retry: RetryConfig::queue_push(),
            },
            receiver,
            self.batch_size,
        ));
        QueueHandle {
            sender,
            worker,
            _stop_on_drop: stop.clone().drop_guard(),
            stop,
        }
    }

    /// Operations buffered in process, not yet on a remote list.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.queues
            .iter()
            .map(|q| q.sender.max_capacity() - q.sender.capacity())
            .sum()
    }

    /// Send the stop sentinel to every worker and wait until each has pushed
    /// what it buffered. From here on a batch the remote list still refuses
    /// after one retry round is dropped. Later publishes start fresh workers.
    pub async fn shutdown(&self) {
        let tables: Vec<String> = self.queues.iter().map(|q| q.key().clone()).collect();
        for table in tables {
            let Some((_, handle)) = self.queues.remove(&table) else { continue };
            // Cancel first: a stuck worker cannot make room for the sentinel.
            handle.stop.cancel();
            // A closed channel means the worker is already gone.
            let _ = handle.sender.send(None).await;
            if let Err(e) = handle.worker.await {
                error!(table = %table, error = %e, "Async flush worker failed");
            }
        }
    }
}

async fn push_direct(cache: &dyn RemoteCache, queue: &str, operation: &AsyncOperation) -> Result<(), OrmError> {
    cache.rpush(queue, &[operation.encode()?]).await?;
    metrics::record_async_operations(queue, "direct", 1);
    Ok(())
}

struct Worker {
    table: String,
    queue: String,
    cache: Arc<dyn RemoteCache>,
    stop: CancellationToken,
    retry: RetryConfig,
}

async fn run_worker(worker: Worker, mut receiver: mpsc::Receiver<Message>, batch_size: usize) {
    let mut batch = Vec::with_capacity(batch_size);
    loop {
        batch.clear();
        if receiver.recv_many(&mut batch, batch_size).await == 0 {
            break;
        }
        if batch.iter().any(Option::is_none) {
            // Stop accepting; whatever is already buffered is still pushed.
            receiver.close();
        }
        let payloads: Vec<Vec<u8>> = batch
            .drain(..)
            .flatten()
            .filter_map(|operation| match operation.encode() {
                Ok(raw) => Some(raw),
                Err(e) => {
                    error!(table = %worker.table, id = operation.id, error = %e, "Dropping unencodable async operation");
                    None
                }
            })
            .collect();
        if !payloads.is_empty() {
            worker.push(&payloads).await;
        }
        tokio::task::yield_now().await;
    }
    debug!(table = %worker.table, queue = %worker.queue, "Async flush worker stopped");
}

impl Worker {
    /// Push one batch, retrying in rounds until it lands. Once stopped, a
    /// failed round is the last one and the batch is lost.
    async fn push(&self, payloads: &[Vec<u8>]) {
        let count = payloads.len();
        let queue = self.queue.as_str();
        loop {
            let last_round = self.stop.is_cancelled();
            match retry("async_queue_push", &self.retry, || self.cache.rpush(queue, payloads)).await {
                Ok(depth) => {
                    metrics::record_async_operations(queue, "queued", count);
                    metrics::set_async_queue_depth(queue, "remote", depth as usize);
                    return;
                }
                Err(e) if last_round => {
                    error!(table = %self.table, queue, count, error = %e, "Async operations lost at shutdown");
                    metrics::record_async_operations(queue, "lost", count);
                    metrics::record_error("remote", "async_push", "backend");
                    return;
                }
                Err(e) => {
                    warn!(table = %self.table, queue, count, error = %e, "Remote queue unavailable, holding batch");
                    metrics::record_error("remote", "async_push", "backend");
                    let pause = self.retry.max_delay.max(Duration::from_millis(1));
                    tokio::select! {
                        () = self.stop.cancelled() => {}
                        () = tokio::time::sleep(pause) => {}
                    }
                }
            }
        }
    }
}
