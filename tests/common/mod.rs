//! Shared fixtures for the integration tests: test entities, a SQL
//! recording `Database` decorator and an engine over a temporary SQLite
//! file plus the in-process remote cache.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tempfile::TempDir;

use tierdb::storage::traits::{DbRow, ExecResult, RemoteCommand, StreamEntry};
use tierdb::{
    set_value, Cached, Context, Database, Dialect, Engine, EngineConfig, Entity, EntityDef, FieldDef,
    FieldKind, MemoryCache, OrmError, Registry, RemoteCache, SqlPoolConfig, SqlxDatabase, StorageError,
    Transaction, Value, ValueReader,
};

// =============================================================================
// Test entities
// =============================================================================

/// Unique `Name`, cached `Age` index, log and dirty streams.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Customer {
    pub id: u64,
    pub name: String,
    pub age: u8,
}

impl Customer {
    pub fn new(name: &str, age: u8) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            age,
        }
    }
}

impl Entity for Customer {
    fn definition() -> EntityDef {
        EntityDef::new("customers")
            .tags("localCache;redisCache;log;dirty=crm")
            .field(FieldDef::new("ID", FieldKind::Id))
            .field(FieldDef::new("Name", FieldKind::String).tags("unique=Name;required"))
            .field(FieldDef::new("Age", FieldKind::U8).tags("index=Age;cached"))
    }
    fn id(&self) -> u64 {
        self.id
    }
    fn set_id(&mut self, id: u64) {
        self.id = id
    }
    fn to_values(&self) -> Vec<Value> {
        vec![self.id.into(), self.name.as_str().into(), self.age.into()]
    }
    fn from_values(values: Vec<Value>) -> Result<Self, OrmError> {
        let mut r = ValueReader::new(values);
        Ok(Self {
            id: r.read()?,
            name: r.read()?,
            age: r.read()?,
        })
    }
}

/// Two-column unique index `Multi(Uint, Int)`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Pair {
    pub id: u64,
    pub uint: u32,
    pub int: i32,
}

impl Pair {
    pub fn new(uint: u32, int: i32) -> Self {
        Self { id: 0, uint, int }
    }
}

impl Entity for Pair {
    fn definition() -> EntityDef {
        EntityDef::new("pairs")
            .tags("localCache;redisCache")
            .field(FieldDef::new("ID", FieldKind::Id))
            .field(FieldDef::new("Uint", FieldKind::U32).tags("unique=Multi"))
            .field(FieldDef::new("Int", FieldKind::I32).tags("unique=Multi:2"))
    }
    fn id(&self) -> u64 {
        self.id
    }
    fn set_id(&mut self, id: u64) {
        self.id = id
    }
    fn to_values(&self) -> Vec<Value> {
        vec![self.id.into(), self.uint.into(), self.int.into()]
    }
    fn from_values(values: Vec<Value>) -> Result<Self, OrmError> {
        let mut r = ValueReader::new(values);
        Ok(Self {
            id: r.read()?,
            uint: r.read()?,
            int: r.read()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Owner {
    pub id: u64,
    pub name: String,
}

impl Entity for Owner {
    fn definition() -> EntityDef {
        EntityDef::new("owners")
            .tags("localCache;redisCache")
            .field(FieldDef::new("ID", FieldKind::Id))
            .field(FieldDef::new("Name", FieldKind::String))
    }
    fn id(&self) -> u64 {
        self.id
    }
    fn set_id(&mut self, id: u64) {
        self.id = id
    }
    fn to_values(&self) -> Vec<Value> {
        vec![self.id.into(), self.name.as_str().into()]
    }
    fn from_values(values: Vec<Value>) -> Result<Self, OrmError> {
        let mut r = ValueReader::new(values);
        Ok(Self {
            id: r.read()?,
            name: r.read()?,
        })
    }
}

/// Cached reference `Ref` to [`Owner`]. `owner == 0` is NULL.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Pet {
    pub id: u64,
    pub name: String,
    pub owner: u64,
}

impl Pet {
    pub fn new(name: &str, owner: u64) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            owner,
        }
    }
}

impl Entity for Pet {
    fn definition() -> EntityDef {
        EntityDef::new("pets")
            .tags("localCache;redisCache")
            .field(FieldDef::new("ID", FieldKind::Id))
            .field(FieldDef::new("Name", FieldKind::String))
            .field(FieldDef::new("Ref", FieldKind::Reference("owners".into())).tags("cached"))
    }
    fn id(&self) -> u64 {
        self.id
    }
    fn set_id(&mut self, id: u64) {
        self.id = id
    }
    fn to_values(&self) -> Vec<Value> {
        vec![self.id.into(), self.name.as_str().into(), self.owner.into()]
    }
    fn from_values(values: Vec<Value>) -> Result<Self, OrmError> {
        let mut r = ValueReader::new(values);
        Ok(Self {
            id: r.read()?,
            name: r.read()?,
            owner: r.read()?,
        })
    }
}

/// Local-only schema with `cacheAll`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Setting {
    pub id: u64,
    pub key: String,
    pub value: String,
}

impl Setting {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            id: 0,
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

impl Entity for Setting {
    fn definition() -> EntityDef {
        EntityDef::new("settings")
            .tags("localCache;cacheAll")
            .field(FieldDef::new("ID", FieldKind::Id))
            .field(FieldDef::new("Key", FieldKind::String).tags("unique=Key;required"))
            .field(FieldDef::new("Value", FieldKind::String))
    }
    fn id(&self) -> u64 {
        self.id
    }
    fn set_id(&mut self, id: u64) {
        self.id = id
    }
    fn to_values(&self) -> Vec<Value> {
        vec![self.id.into(), self.key.as_str().into(), self.value.as_str().into()]
    }
    fn from_values(values: Vec<Value>) -> Result<Self, OrmError> {
        let mut r = ValueReader::new(values);
        Ok(Self {
            id: r.read()?,
            key: r.read()?,
            value: r.read()?,
        })
    }
}

/// One column of every storable kind: decimal, date, datetime, enum, set,
/// bytes, nullable bool, a flattened array and a full-range `u64`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Gadget {
    pub id: u64,
    pub price: f64,
    pub released: Option<DateTime<Utc>>,
    pub seen_at: Option<DateTime<Utc>>,
    pub color: String,
    pub finishes: Vec<String>,
    pub firmware: Vec<u8>,
    pub active: Option<bool>,
    pub dims: [u16; 3],
    pub serial: u64,
}

impl Entity for Gadget {
    fn definition() -> EntityDef {
        EntityDef::new("gadgets")
            .tags("localCache;redisCache")
            .field(FieldDef::new("ID", FieldKind::Id))
            .field(FieldDef::new("Price", FieldKind::F64).tags("decimal=10,2"))
            .field(FieldDef::new("Released", FieldKind::Time).optional())
            .field(FieldDef::new("SeenAt", FieldKind::Time).tags("time").optional())
            .field(FieldDef::new("Color", FieldKind::Enum("Color".into())))
            .field(FieldDef::new("Finishes", FieldKind::Set("Color".into())))
            .field(FieldDef::new("Firmware", FieldKind::Bytes))
            .field(FieldDef::new("Active", FieldKind::Bool).optional())
            .field(FieldDef::new("Dims", FieldKind::Array(3, Box::new(FieldKind::U16))))
            .field(FieldDef::new("Serial", FieldKind::U64))
    }
    fn id(&self) -> u64 {
        self.id
    }
    fn set_id(&mut self, id: u64) {
        self.id = id
    }
    fn to_values(&self) -> Vec<Value> {
        let mut values = vec![
            self.id.into(),
            self.price.into(),
            self.released.into(),
            self.seen_at.into(),
            self.color.as_str().into(),
            set_value(self.finishes.as_slice()),
            self.firmware.clone().into(),
            self.active.into(),
        ];
        values.extend(self.dims.iter().map(|&d| Value::from(d)));
        values.push(self.serial.into());
        values
    }
    fn from_values(values: Vec<Value>) -> Result<Self, OrmError> {
        let mut r = ValueReader::new(values);
        Ok(Self {
            id: r.read()?,
            price: r.read()?,
            released: r.read()?,
            seen_at: r.read()?,
            color: r.read()?,
            finishes: r.read_set()?,
            firmware: r.read()?,
            active: r.read()?,
            dims: [r.read()?, r.read()?, r.read()?],
            serial: r.read()?,
        })
    }
}

// =============================================================================
// Recording database
// =============================================================================

/// Wraps a real pool and records every statement it receives. A statement
/// containing the `fail_on` fragment fails with a backend error instead of
/// running.
pub struct CountingDatabase {
    inner: SqlxDatabase,
    statements: Arc<Mutex<Vec<String>>>,
    fail_on: Arc<Mutex<Option<String>>>,
}

impl CountingDatabase {
    pub fn new(inner: SqlxDatabase) -> Self {
        Self {
            inner,
            statements: Arc::default(),
            fail_on: Arc::default(),
        }
    }

    /// The undecorated pool, for assertions that must not be recorded.
    pub fn raw(&self) -> &SqlxDatabase {
        &self.inner
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().clone()
    }

    /// Statements starting with `verb` (e.g. "UPDATE").
    pub fn count(&self, verb: &str) -> usize {
        self.statements
            .lock()
            .iter()
            .filter(|sql| sql.starts_with(verb))
            .count()
    }

    pub fn reset(&self) {
        self.statements.lock().clear();
    }

    pub fn fail_on(&self, fragment: Option<&str>) {
        *self.fail_on.lock() = fragment.map(str::to_string);
    }
}

fn record(
    statements: &Mutex<Vec<String>>,
    fail_on: &Mutex<Option<String>>,
    sql: &str,
) -> Result<(), StorageError> {
    statements.lock().push(sql.to_string());
    match fail_on.lock().as_deref() {
        Some(fragment) if sql.contains(fragment) => {
            Err(StorageError::Backend(format!("injected failure: {fragment}")))
        }
        _ => Ok(()),
    }
}

#[async_trait]
impl Database for CountingDatabase {
    fn dialect(&self) -> Dialect {
        self.inner.dialect()
    }

    async fn exec(&self, sql: &str, args: &[Value]) -> Result<ExecResult, StorageError> {
        record(&self.statements, &self.fail_on, sql)?;
        self.inner.exec(sql, args).await
    }

    async fn query(&self, sql: &str, args: &[Value]) -> Result<Vec<DbRow>, StorageError> {
        record(&self.statements, &self.fail_on, sql)?;
        self.inner.query(sql, args).await
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError> {
        self.statements.lock().push("BEGIN".to_string());
        Ok(Box::new(CountingTransaction {
            inner: self.inner.begin().await?,
            statements: self.statements.clone(),
            fail_on: self.fail_on.clone(),
        }))
    }
}

struct CountingTransaction {
    inner: Box<dyn Transaction>,
    statements: Arc<Mutex<Vec<String>>>,
    fail_on: Arc<Mutex<Option<String>>>,
}

#[async_trait]
impl Transaction for CountingTransaction {
    async fn exec(&self, sql: &str, args: &[Value]) -> Result<ExecResult, StorageError> {
        record(&self.statements, &self.fail_on, sql)?;
        self.inner.exec(sql, args).await
    }

    async fn query(&self, sql: &str, args: &[Value]) -> Result<Vec<DbRow>, StorageError> {
        record(&self.statements, &self.fail_on, sql)?;
        self.inner.query(sql, args).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.statements.lock().push("COMMIT".to_string());
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        self.statements.lock().push("ROLLBACK".to_string());
        self.inner.rollback().await
    }
}

// =============================================================================
// Fault-injecting remote cache
// =============================================================================

/// Delegates to a [`MemoryCache`]; commands armed with [`FaultyCache::fail`]
/// return a backend error instead, a set number of times.
pub struct FaultyCache {
    inner: Arc<MemoryCache>,
    armed: Mutex<HashMap<&'static str, usize>>,
    served: Mutex<HashMap<&'static str, usize>>,
}

impl FaultyCache {
    pub fn new(inner: Arc<MemoryCache>) -> Self {
        Self {
            inner,
            armed: Mutex::default(),
            served: Mutex::default(),
        }
    }

    /// Fail the next `times` calls of `command` (`usize::MAX` for "until disarmed").
    pub fn fail(&self, command: &'static str, times: usize) {
        self.armed.lock().insert(command, times);
    }

    pub fn disarm(&self) {
        self.armed.lock().clear();
    }

    /// Injected failures returned so far for `command`.
    pub fn failures(&self, command: &str) -> usize {
        self.served.lock().get(command).copied().unwrap_or(0)
    }

    fn check(&self, command: &'static str) -> Result<(), StorageError> {
        let mut armed = self.armed.lock();
        match armed.get_mut(command) {
            Some(left) if *left > 0 => {
                *left -= 1;
                *self.served.lock().entry(command).or_default() += 1;
                Err(StorageError::Backend(format!("injected {command} failure")))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteCache for FaultyCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.check("get")?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StorageError> {
        self.check("set")?;
        self.inner.set(key, value, ttl).await
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, StorageError> {
        self.check("set_nx")?;
        self.inner.set_nx(key, value, ttl).await
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StorageError> {
        self.check("del")?;
        self.inner.del(keys).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.check("exists")?;
        self.inner.exists(key).await
    }

    async fn pttl(&self, key: &str) -> Result<Option<Duration>, StorageError> {
        self.check("pttl")?;
        self.inner.pttl(key).await
    }

    async fn incr_by(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64, StorageError> {
        self.check("incr_by")?;
        self.inner.incr_by(key, delta, ttl).await
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, StorageError> {
        self.check("hincr_by")?;
        self.inner.hincr_by(key, field, delta).await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.check("hget")?;
        self.inner.hget(key, field).await
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<Vec<u8>>>, StorageError> {
        self.check("hmget")?;
        self.inner.hmget(key, fields).await
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<(), StorageError> {
        self.check("hset")?;
        self.inner.hset(key, field, value).await
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64, StorageError> {
        self.check("hdel")?;
        self.inner.hdel(key, fields).await
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        self.check("hgetall")?;
        self.inner.hgetall(key).await
    }

    async fn lpush(&self, key: &str, values: &[Vec<u8>]) -> Result<u64, StorageError> {
        self.check("lpush")?;
        self.inner.lpush(key, values).await
    }

    async fn rpush(&self, key: &str, values: &[Vec<u8>]) -> Result<u64, StorageError> {
        self.check("rpush")?;
        self.inner.rpush(key, values).await
    }

    async fn rpop(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.check("rpop")?;
        self.inner.rpop(key).await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>, StorageError> {
        self.check("lrange")?;
        self.inner.lrange(key, start, stop).await
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), StorageError> {
        self.check("ltrim")?;
        self.inner.ltrim(key, start, stop).await
    }

    async fn llen(&self, key: &str) -> Result<u64, StorageError> {
        self.check("llen")?;
        self.inner.llen(key).await
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, StorageError> {
        self.check("sadd")?;
        self.inner.sadd(key, members).await
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<u64, StorageError> {
        self.check("srem")?;
        self.inner.srem(key, members).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StorageError> {
        self.check("smembers")?;
        self.inner.smembers(key).await
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StorageError> {
        self.check("zadd")?;
        self.inner.zadd(key, score, member).await
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StorageError> {
        self.check("zrange")?;
        self.inner.zrange(key, start, stop).await
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StorageError> {
        self.check("zscore")?;
        self.inner.zscore(key, member).await
    }

    async fn xadd(&self, stream: &str, fields: &[(String, Vec<u8>)]) -> Result<String, StorageError> {
        self.check("xadd")?;
        self.inner.xadd(stream, fields).await
    }

    async fn xrange(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>, StorageError> {
        self.check("xrange")?;
        self.inner.xrange(stream, count).await
    }

    async fn xdel(&self, stream: &str, ids: &[String]) -> Result<u64, StorageError> {
        self.check("xdel")?;
        self.inner.xdel(stream, ids).await
    }

    async fn pipeline(&self, commands: Vec<RemoteCommand>) -> Result<(), StorageError> {
        self.check("pipeline")?;
        self.inner.pipeline(commands).await
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, StorageError> {
        self.check("delete_if_equals")?;
        self.inner.delete_if_equals(key, expected).await
    }

    async fn expire_if_equals(&self, key: &str, expected: &[u8], ttl: Duration) -> Result<bool, StorageError> {
        self.check("expire_if_equals")?;
        self.inner.expire_if_equals(key, expected, ttl).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StorageError> {
        self.check("delete_prefix")?;
        self.inner.delete_prefix(prefix).await
    }

    async fn flush_all(&self) -> Result<(), StorageError> {
        self.check("flush_all")?;
        self.inner.flush_all().await
    }
}

/// SQL pool for engines that never reach SQL.
pub struct OfflineDatabase;

#[async_trait]
impl Database for OfflineDatabase {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }
    async fn exec(&self, _sql: &str, _args: &[Value]) -> Result<ExecResult, StorageError> {
        Err(StorageError::Backend("offline".into()))
    }
    async fn query(&self, _sql: &str, _args: &[Value]) -> Result<Vec<DbRow>, StorageError> {
        Err(StorageError::Backend("offline".into()))
    }
    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError> {
        Err(StorageError::Backend("offline".into()))
    }
}

// =============================================================================
// Harness
// =============================================================================

pub struct Harness {
    pub engine: Engine,
    pub db: Arc<CountingDatabase>,
    /// Remote tier contents, read past the fault injection.
    pub cache: Arc<MemoryCache>,
    /// What the engine talks to.
    pub faults: Arc<FaultyCache>,
    pub ctx: Context,
    _dir: TempDir,
}

pub async fn setup() -> Harness {
    setup_with(EngineConfig::default()).await
}

pub async fn setup_with(config: EngineConfig) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tierdb=debug")
        .with_test_writer()
        .try_init();

    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("tier.db").display());
    let sql = SqlxDatabase::connect("default", &SqlPoolConfig::new(url)).await.unwrap();
    let db = Arc::new(CountingDatabase::new(sql));
    let cache = Arc::new(MemoryCache::new());
    let faults = Arc::new(FaultyCache::new(cache.clone()));

    let mut registry = Registry::new(config);
    registry
        .register_mysql_pool("default", db.clone())
        .register_redis_pool("default", faults.clone())
        .register_entity::<Customer>()
        .register_entity::<Pair>()
        .register_entity::<Owner>()
        .register_entity::<Pet>()
        .register_entity::<Setting>()
        .register_enum("Color", &["Red", "Green", "Blue"], "")
        .register_entity::<Gadget>();
    let engine = registry.validate().unwrap();
    let ctx = Context::background();
    engine.create_tables(&ctx).await.unwrap();
    db.reset();

    Harness {
        engine,
        db,
        cache,
        faults,
        ctx,
        _dir: dir,
    }
}

impl Harness {
    /// Insert and flush one entity, returning its ID.
    pub async fn insert<E: Entity>(&self, mut entity: E) -> u64 {
        let mut flusher = self.engine.flusher();
        let id = flusher.insert(&mut entity).unwrap();
        flusher.flush(&self.ctx).await.unwrap();
        id
    }

    /// Row as stored in SQL, read without going through the recorder.
    pub async fn sql_row<E: Entity>(&self, id: u64) -> Option<Vec<Value>> {
        let schema = self.engine.schema::<E>().unwrap().clone();
        let sql = format!(
            "SELECT {} FROM `{}` WHERE `ID` = ?",
            schema.select_list(Dialect::Sqlite),
            schema.table_name
        );
        let raw = self.db.raw().query_row(&sql, &[Value::Uint(id)]).await.unwrap();
        raw.map(|raw| schema.row_from_db(raw).unwrap())
    }

    pub async fn sql_count(&self, table: &str) -> u64 {
        let row = self
            .db
            .raw()
            .query_row(&format!("SELECT COUNT(*) FROM `{table}`"), &[])
            .await
            .unwrap()
            .unwrap();
        row[0].as_u64().unwrap()
    }

    /// Row as held by the remote tier: `None` for a miss, `Some(None)` for
    /// a tombstone.
    pub async fn remote_row<E: Entity>(&self, id: u64) -> Option<Option<Vec<Value>>> {
        let schema = self.engine.schema::<E>().unwrap().clone();
        let raw = self.cache.hget(schema.rows_key(), &id.to_string()).await.unwrap()?;
        if raw.is_empty() {
            return Some(None);
        }
        Some(Some(tierdb::codec::decode_row(&schema, &raw).unwrap()))
    }

    pub fn local_row<E: Entity>(&self, id: u64) -> Option<Cached> {
        self.engine.local_cache::<E>().unwrap().and_then(|local| local.get(id))
    }

    /// Local, remote and SQL agree on row `id` of `E`.
    pub async fn assert_coherent<E: Entity>(&self, id: u64) {
        let sql = self.sql_row::<E>(id).await;
        let remote = self.remote_row::<E>(id).await.expect("remote tier has no entry");
        let local = match self.local_row::<E>(id).expect("local tier has no entry") {
            Cached::Row(row) => Some(row.to_vec()),
            Cached::Tombstone => None,
        };
        assert_eq!(local, sql, "local tier differs from SQL for ID {id}");
        assert_eq!(remote, sql, "remote tier differs from SQL for ID {id}");
    }
}
