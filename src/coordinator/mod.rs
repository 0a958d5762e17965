// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine coordinator.
//!
//! The [`Engine`] is the frozen result of [`Registry::validate`]. It ties
//! together every tier an entity can live in:
//! - per-process LRU ([`LocalCache`]) per schema with `localCache`
//! - shared remote cache per `redisCache` pool
//! - SQL pool per `mysql` pool (ground truth)
//!
//! # Read path
//!
//! ```text
//! local LRU ──miss──▶ remote hash ──miss──▶ SELECT ... WHERE ID IN (...)
//!     ▲                   ▲                            │
//!     └───── back-fill ───┴────────────────────────────┘
//! ```
//!
//! # Write path
//!
//! Mutations are tracked on a [`Flusher`] and applied in one flush:
//! bind → unique precheck → SQL → cache coherence → change events.
//! `flush_async` swaps the SQL phase for the async queue.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tierdb::{Context, EngineConfig, MemoryCache, Registry, SqlPoolConfig, SqlxDatabase};
//!
//! # async fn example() -> Result<(), tierdb::OrmError> {
//! let db = SqlxDatabase::connect("default", &SqlPoolConfig::new("sqlite://app.db?mode=rwc")).await?;
//! let mut registry = Registry::new(EngineConfig::default());
//! registry
//!     .register_mysql_pool("default", Arc::new(db))
//!     .register_redis_pool("default", Arc::new(MemoryCache::new()));
//! // registry.register_entity::<User>();
//! let engine = registry.validate()?;
//! engine.create_tables(&Context::background()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`Registry::validate`]: crate::schema::Registry::validate

mod admin;
mod events;
mod flush;
mod lookup;
mod types;

pub use events::LogTableWriter;
pub use flush::Flusher;
pub use types::{ChangeAction, ChangeEvent, ChangeListener, FlushSummary, Pager, QueryErrorResolver};

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{error, info};

use crate::async_flush::{AsyncConsumer, AsyncOperation, AsyncPublisher};
use crate::cache::LocalCache;
use crate::config::EngineConfig;
use crate::entity::Entity;
use crate::error::OrmError;
use crate::schema::{EntitySchema, SchemaSet};
use crate::storage::traits::{Database, RemoteCache, StorageError};

/// Remote pool that carries locks, async queues and dirty streams.
pub const DEFAULT_POOL: &str = "default";

/// Frozen registry plus the connection pools and caches it resolved.
///
/// Cheap to clone: every field is shared. Clones observe the same caches,
/// listeners and async buffers.
#[derive(Clone)]
pub struct Engine {
    pub(super) schemas: Arc<SchemaSet>,
    pub(super) databases: Arc<HashMap<String, Arc<dyn Database>>>,
    pub(super) caches: Arc<HashMap<String, Arc<dyn RemoteCache>>>,
    /// Local LRU per table, only for schemas with `localCache`.
    pub(super) local: Arc<HashMap<String, Arc<LocalCache>>>,
    pub(super) config: Arc<EngineConfig>,
    pub(super) listeners: Arc<RwLock<Vec<Arc<ChangeListener>>>>,
    pub(super) resolvers: Arc<RwLock<Vec<Arc<QueryErrorResolver>>>>,
    pub(super) publisher: Arc<AsyncPublisher>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("schemas", &self.schemas.len())
            .field("databases", &self.databases.keys().collect::<Vec<_>>())
            .field("caches", &self.caches.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Connectivity of one pool, as reported by [`Engine::health_check`].
#[derive(Debug, Clone, PartialEq)]
pub struct PoolHealth {
    pub code: String,
    pub connected: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheck {
    pub databases: Vec<PoolHealth>,
    pub caches: Vec<PoolHealth>,
    pub healthy: bool,
}

impl Engine {
    pub(crate) fn new(
        schemas: SchemaSet,
        databases: HashMap<String, Arc<dyn Database>>,
        caches: HashMap<String, Arc<dyn RemoteCache>>,
        config: EngineConfig,
    ) -> Self {
        let local = schemas
            .iter()
            .filter_map(|schema| {
                schema.local_cache_limit.map(|limit| {
                    (
                        schema.table_name.clone(),
                        Arc::new(LocalCache::new(schema.table_name.clone(), limit)),
                    )
                })
            })
            .collect();
        let config = Arc::new(config);
        info!(
            entities = schemas.len(),
            databases = databases.len(),
            caches = caches.len(),
            "Engine validated"
        );
        Self {
            schemas: Arc::new(schemas),
            databases: Arc::new(databases),
            caches: Arc::new(caches),
            local: Arc::new(local),
            publisher: Arc::new(AsyncPublisher::new(&config)),
            config,
            listeners: Arc::new(RwLock::new(Vec::new())),
            resolvers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn schemas(&self) -> &SchemaSet {
        &self.schemas
    }

    /// Schema of a registered entity type.
    pub fn schema<E: Entity>(&self) -> Result<&Arc<EntitySchema>, OrmError> {
        self.schemas.of::<E>()
    }

    /// Start tracking mutations for one flush.
    #[must_use]
    pub fn flusher(&self) -> Flusher<'_> {
        Flusher::new(self)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Pools
    // ═══════════════════════════════════════════════════════════════════════

    pub fn database(&self, code: &str) -> Result<&Arc<dyn Database>, OrmError> {
        self.databases
            .get(code)
            .ok_or_else(|| OrmError::schema(format!("unknown mysql pool '{code}'")))
    }

    pub fn remote_pool(&self, code: &str) -> Result<&Arc<dyn RemoteCache>, OrmError> {
        self.caches
            .get(code)
            .ok_or_else(|| OrmError::schema(format!("unknown redis pool '{code}'")))
    }

    pub(crate) fn db_of(&self, schema: &EntitySchema) -> Result<&Arc<dyn Database>, OrmError> {
        self.database(&schema.db_pool)
    }

    pub(crate) fn remote_of(&self, schema: &EntitySchema) -> Option<&Arc<dyn RemoteCache>> {
        schema.remote_pool.as_deref().and_then(|code| self.caches.get(code))
    }

    pub(crate) fn local_of(&self, schema: &EntitySchema) -> Option<&Arc<LocalCache>> {
        self.local.get(&schema.table_name)
    }

    /// Remote pool holding a schema's async queue: its cache pool, else `default`.
    pub(crate) fn queue_pool_of<'a>(&'a self, schema: &'a EntitySchema) -> Result<(&'a str, &'a Arc<dyn RemoteCache>), OrmError> {
        let code = schema.remote_pool.as_deref().unwrap_or(DEFAULT_POOL);
        let cache = self.caches.get(code).ok_or_else(|| {
            OrmError::schema(format!(
                "{}: async flush needs redis pool '{code}'",
                schema.table_name
            ))
        })?;
        Ok((code, cache))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Local cache access
    // ═══════════════════════════════════════════════════════════════════════

    /// The local LRU of `E`, `None` when the schema has no `localCache`.
    pub fn local_cache<E: Entity>(&self) -> Result<Option<Arc<LocalCache>>, OrmError> {
        let schema = self.schema::<E>()?;
        Ok(self.local_of(schema).cloned())
    }

    pub fn clear_local_cache<E: Entity>(&self) -> Result<(), OrmError> {
        let schema = self.schema::<E>()?;
        if let Some(local) = self.local_of(schema) {
            local.clear();
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Listeners, resolvers, async
    // ═══════════════════════════════════════════════════════════════════════

    /// Observe every applied mutation. Listeners run after cache coherence;
    /// a panicking listener is logged and skipped.
    pub fn add_change_listener<F>(&self, listener: F)
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Register a resolver consulted when an async SQL operation fails.
    pub fn add_query_error_resolver<F>(&self, resolver: F)
    where
        F: Fn(&EntitySchema, &AsyncOperation, &StorageError) -> bool + Send + Sync + 'static,
    {
        self.resolvers.write().push(Arc::new(resolver));
    }

    /// `true` when any resolver handled the error. Panicking resolvers count
    /// as "not handled".
    pub(crate) fn resolve_query_error(
        &self,
        schema: &EntitySchema,
        operation: &AsyncOperation,
        err: &StorageError,
    ) -> bool {
        let resolvers = self.resolvers.read().clone();
        resolvers.iter().any(|resolver| {
            match catch_unwind(AssertUnwindSafe(|| resolver(schema, operation, err))) {
                Ok(handled) => handled,
                Err(_) => {
                    error!(table = %schema.table_name, id = operation.id, "Query error resolver panicked");
                    false
                }
            }
        })
    }

    pub(crate) fn notify_listeners(&self, event: &ChangeEvent) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!(table = %event.table, id = event.id, "Change listener panicked");
            }
        }
    }

    #[must_use]
    pub fn async_publisher(&self) -> &Arc<AsyncPublisher> {
        &self.publisher
    }

    /// Consumer for the async queue `queue` on remote pool `pool`.
    #[must_use]
    pub fn async_consumer(&self, queue: &str, pool: &str) -> AsyncConsumer {
        AsyncConsumer::new(self.clone(), queue, pool)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Health
    // ═══════════════════════════════════════════════════════════════════════

    /// Probe every pool (SQL `SELECT 1`, remote `EXISTS`).
    pub async fn health_check(&self) -> HealthCheck {
        let mut databases = Vec::with_capacity(self.databases.len());
        for (code, db) in self.databases.iter() {
            let start = Instant::now();
            let result = db.query("SELECT 1", &[]).await;
            databases.push(probe(code, start.elapsed(), result.map(|_| ())));
        }
        let mut caches = Vec::with_capacity(self.caches.len());
        for (code, cache) in self.caches.iter() {
            let start = Instant::now();
            let result = cache.exists("__health").await;
            caches.push(probe(code, start.elapsed(), result.map(|_| ())));
        }
        databases.sort_by(|a, b| a.code.cmp(&b.code));
        caches.sort_by(|a, b| a.code.cmp(&b.code));
        let healthy = databases.iter().chain(caches.iter()).all(|p| p.connected);
        HealthCheck {
            databases,
            caches,
            healthy,
        }
    }
}

fn probe(code: &str, elapsed: Duration, result: Result<(), StorageError>) -> PoolHealth {
    PoolHealth {
        code: code.to_string(),
        connected: result.is_ok(),
        latency_ms: elapsed.as_millis() as u64,
        error: result.err().map(|e| e.to_string()),
    }
}
