// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # tierdb
//!
//! Entity data access layer with read-through / write-through caching over
//! a relational store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Registry → Engine                      │
//! │  • Entity definitions validated into frozen schemas        │
//! │  • cache_key namespace per schema                          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!              lookups ◀───────┼───────▶ Flusher (six phases)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Local: per-process LRU                   │
//! │  • rows by ID, tombstones, query ID lists                  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Remote: shared key-value                  │
//! │  • encoded rows, unique hashes, reference sets             │
//! │  • async queues, log and dirty streams, locks              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  SQL: MySQL / SQLite (truth)                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tierdb::{
//!     Context, Engine, EngineConfig, Entity, EntityDef, FieldDef, FieldKind, MemoryCache,
//!     OrmError, Registry, SqlPoolConfig, SqlxDatabase, Value, ValueReader,
//! };
//!
//! #[derive(Clone, Debug, Default)]
//! struct User {
//!     id: u64,
//!     name: String,
//! }
//!
//! impl Entity for User {
//!     fn definition() -> EntityDef {
//!         EntityDef::new("users")
//!             .tags("localCache;redisCache")
//!             .field(FieldDef::new("ID", FieldKind::Id))
//!             .field(FieldDef::new("Name", FieldKind::String).tags("unique=Name;required"))
//!     }
//!     fn id(&self) -> u64 { self.id }
//!     fn set_id(&mut self, id: u64) { self.id = id }
//!     fn to_values(&self) -> Vec<Value> { vec![self.id.into(), self.name.as_str().into()] }
//!     fn from_values(values: Vec<Value>) -> Result<Self, OrmError> {
//!         let mut r = ValueReader::new(values);
//!         Ok(Self { id: r.read()?, name: r.read()? })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), OrmError> {
//!     let db = SqlxDatabase::connect("default", &SqlPoolConfig::new("sqlite://app.db?mode=rwc")).await?;
//!     let mut registry = Registry::new(EngineConfig::default());
//!     registry
//!         .register_mysql_pool("default", Arc::new(db))
//!         .register_redis_pool("default", Arc::new(MemoryCache::new()))
//!         .register_entity::<User>();
//!     let engine: Engine = registry.validate()?;
//!     let ctx = Context::background();
//!     engine.create_tables(&ctx).await?;
//!
//!     let mut user = User { id: 0, name: "Tom".into() };
//!     let mut flusher = engine.flusher();
//!     flusher.insert(&mut user)?;
//!     flusher.flush(&ctx).await?;
//!
//!     let found: Option<User> = engine.load_by_unique_key(&ctx, "Name", &["Tom".into()]).await?;
//!     assert_eq!(found.map(|u| u.id), Some(user.id));
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`schema`]: entity definitions, registry, schemas, DDL
//! - [`coordinator`]: the [`Engine`], lookups, [`Flusher`], change events
//! - [`async_flush`]: deferred SQL through remote queues
//! - [`cache`]: per-process LRU tier
//! - [`storage`]: SQL and remote-cache drivers, distributed lock
//! - [`codec`]: binary row encoding for the remote tier
//! - [`resilience`]: retry with backoff for connection setup

pub mod async_flush;
pub mod cache;
pub mod codec;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod entity;
pub mod error;
pub mod metrics;
pub mod resilience;
pub mod schema;
pub mod storage;
pub mod value;

pub use async_flush::{AsyncConsumer, AsyncOperation, AsyncPublisher};
pub use cache::{Cached, LocalCache};
pub use config::{EngineConfig, RedisPoolConfig, SqlPoolConfig};
pub use context::Context;
pub use coordinator::{
    ChangeAction, ChangeEvent, Engine, FlushSummary, Flusher, HealthCheck, LogTableWriter, Pager, PoolHealth,
};
pub use entity::{set_value, Entity, FromValue, ValueReader};
pub use error::OrmError;
pub use metrics::LatencyTimer;
pub use resilience::retry::RetryConfig;
pub use schema::{EntityDef, EntitySchema, EnumDef, FieldDef, FieldKind, Registry, SchemaSet};
pub use storage::lock::{Lock, Locker};
pub use storage::memory::MemoryCache;
pub use storage::redis::RedisCache;
pub use storage::sql::SqlxDatabase;
pub use storage::traits::{Database, Dialect, RemoteCache, RemoteCommand, StorageError, Transaction};
pub use value::Value;
