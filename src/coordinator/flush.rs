// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The flush pipeline.
//!
//! A [`Flusher`] collects tracked mutations and applies them in six phases:
//!
//! 1. **Bind**: normalize values through the column setters, load pre-images,
//!    drop no-op updates.
//! 2. **Unique precheck**: every new unique fingerprint is checked against the
//!    remote hash (falling back to SQL) and against the rest of the flush.
//! 3. **Order**: per SQL pool, deletes then inserts then updates.
//! 4. **SQL**: multi-row INSERT, one UPDATE per changed row, DELETE ... IN.
//! 5. **Cache coherence**: rows, unique hashes, reference sets and query
//!    caches of both tiers.
//! 6. **Events**: listeners plus log and dirty streams.
//!
//! Tracking the same entity twice collapses into one mutation:
//!
//! | tracked         | then   | result               |
//! |-----------------|--------|----------------------|
//! | insert          | update | insert (new values)  |
//! | insert          | delete | nothing              |
//! | update          | update | update (first before)|
//! | update          | delete | delete               |
//! | delete          | insert | update               |

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use super::lookup::placeholders;
use super::{ChangeAction, Engine, FlushSummary};
use crate::async_flush::AsyncOperation;
use crate::cache::LocalCache;
use crate::codec::encode_row;
use crate::context::Context;
use crate::entity::Entity;
use crate::error::OrmError;
use crate::metrics::{self, LatencyTimer};
use crate::schema::{fingerprint, EntitySchema, IndexDef, Row};
use crate::storage::traits::{RemoteCommand, StorageError, Transaction};
use crate::value::Value;

/// Rows per multi-row INSERT.
const INSERT_CHUNK: usize = 100;
const DELETE_CHUNK: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Direct,
    Transaction,
    Async,
}

impl Mode {
    fn as_str(self) -> &'static str {
        match self {
            Mode::Direct => "sync",
            Mode::Transaction => "transaction",
            Mode::Async => "async",
        }
    }
}

type Meta = serde_json::Map<String, serde_json::Value>;

/// A mutation as tracked, before binding.
struct Tracked {
    schema: Arc<EntitySchema>,
    action: ChangeAction,
    id: u64,
    /// Insert with a caller-chosen ID; the row may already exist.
    explicit_id: bool,
    before: Option<Vec<Value>>,
    after: Option<Vec<Value>>,
    on_duplicate: Option<Vec<(String, Value)>>,
    meta: Meta,
}

/// A bound mutation: normalized images plus the unique-hash edits it implies.
pub(super) struct Bound {
    pub(super) schema: Arc<EntitySchema>,
    pub(super) action: ChangeAction,
    pub(super) id: u64,
    pub(super) before: Option<Row>,
    pub(super) after: Option<Row>,
    pub(super) meta: Meta,
    on_duplicate: Option<Vec<(String, Value)>>,
    hash_set: Vec<(String, String)>,
    hash_del: Vec<(String, String)>,
    noop: bool,
}

impl Bound {
    /// Column positions whose value differs between the images.
    pub(super) fn changed_positions(&self) -> Vec<usize> {
        match (&self.before, &self.after) {
            (Some(before), Some(after)) => (1..after.len()).filter(|&i| before[i] != after[i]).collect(),
            _ => Vec::new(),
        }
    }
}

struct Statement {
    pool: String,
    sql: String,
    args: Vec<Value>,
    /// Indices into the bound list covered by this statement.
    members: Vec<usize>,
}

/// Collects mutations for one flush. Obtained from [`Engine::flusher`].
///
/// Whatever the outcome, a flush empties the flusher.
pub struct Flusher<'e> {
    engine: &'e Engine,
    tracked: Vec<Option<Tracked>>,
    positions: HashMap<(String, u64), usize>,
}

impl<'e> Flusher<'e> {
    pub(super) fn new(engine: &'e Engine) -> Self {
        Self {
            engine,
            tracked: Vec::new(),
            positions: HashMap::new(),
        }
    }

    /// Number of pending (collapsed) mutations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn clear(&mut self) {
        self.tracked.clear();
        self.positions.clear();
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Tracking
    // ═══════════════════════════════════════════════════════════════════════

    /// Track an insert. An entity without ID gets one assigned here;
    /// the assigned ID is returned.
    pub fn insert<E: Entity>(&mut self, entity: &mut E) -> Result<u64, OrmError> {
        self.track_insert(entity, None)
    }

    /// Track an insert that turns into an update of the existing row when
    /// the ID or a unique key is already taken. `assignments` are applied
    /// to the existing row; an empty list keeps it as is.
    pub fn insert_on_duplicate<E: Entity>(
        &mut self,
        entity: &mut E,
        assignments: &[(&str, Value)],
    ) -> Result<u64, OrmError> {
        let schema = self.engine.schema::<E>()?;
        for (column, _) in assignments {
            match schema.column(column) {
                Some((0, _)) => return Err(OrmError::bind(column, "ID cannot be assigned on duplicate")),
                Some(_) => {}
                None => return Err(OrmError::bind(column, "unknown column")),
            }
        }
        let assignments = assignments.iter().map(|(c, v)| ((*c).to_string(), v.clone())).collect();
        self.track_insert(entity, Some(assignments))
    }

    fn track_insert<E: Entity>(
        &mut self,
        entity: &mut E,
        on_duplicate: Option<Vec<(String, Value)>>,
    ) -> Result<u64, OrmError> {
        let schema = self.engine.schema::<E>()?.clone();
        let explicit_id = entity.id() != 0;
        if !explicit_id {
            entity.set_id(schema.next_id());
        }
        let id = entity.id();
        self.push(Tracked {
            schema,
            action: ChangeAction::Insert,
            id,
            explicit_id,
            before: None,
            after: Some(entity.to_values()),
            on_duplicate,
            meta: Meta::new(),
        });
        Ok(id)
    }

    /// Track an update. The pre-image is the currently cached row.
    pub fn update<E: Entity>(&mut self, entity: &E) -> Result<(), OrmError> {
        self.track_change(entity, None)
    }

    /// Track an update against a known pre-image (the entity as loaded).
    pub fn update_with_snapshot<E: Entity>(&mut self, before: &E, after: &E) -> Result<(), OrmError> {
        if before.id() != after.id() {
            return Err(OrmError::bind("ID", "snapshot and entity IDs differ"));
        }
        self.track_change(after, Some(before.to_values()))
    }

    fn track_change<E: Entity>(&mut self, entity: &E, before: Option<Vec<Value>>) -> Result<(), OrmError> {
        let schema = self.engine.schema::<E>()?.clone();
        if entity.id() == 0 {
            return Err(OrmError::bind("ID", "cannot update an entity without ID"));
        }
        self.push(Tracked {
            schema,
            action: ChangeAction::Update,
            id: entity.id(),
            explicit_id: true,
            before,
            after: Some(entity.to_values()),
            on_duplicate: None,
            meta: Meta::new(),
        });
        Ok(())
    }

    pub fn delete<E: Entity>(&mut self, entity: &E) -> Result<(), OrmError> {
        let schema = self.engine.schema::<E>()?.clone();
        if entity.id() == 0 {
            return Err(OrmError::bind("ID", "cannot delete an entity without ID"));
        }
        self.push(Tracked {
            schema,
            action: ChangeAction::Delete,
            id: entity.id(),
            explicit_id: true,
            before: None,
            after: None,
            on_duplicate: None,
            meta: Meta::new(),
        });
        Ok(())
    }

    /// Attach metadata to the tracked mutation of `entity`; it travels in
    /// the change event.
    pub fn annotate<E: Entity>(
        &mut self,
        entity: &E,
        key: &str,
        value: impl Into<serde_json::Value>,
    ) -> Result<(), OrmError> {
        let schema = self.engine.schema::<E>()?;
        let tracked = self
            .positions
            .get(&(schema.table_name.clone(), entity.id()))
            .and_then(|&pos| self.tracked[pos].as_mut())
            .ok_or_else(|| OrmError::Missing {
                table: schema.table_name.clone(),
                id: entity.id(),
            })?;
        tracked.meta.insert(key.to_string(), value.into());
        Ok(())
    }

    fn push(&mut self, incoming: Tracked) {
        let key = (incoming.schema.table_name.clone(), incoming.id);
        let Some(&pos) = self.positions.get(&key) else {
            self.positions.insert(key, self.tracked.len());
            self.tracked.push(Some(incoming));
            return;
        };
        let merged = self.tracked[pos].take().and_then(|existing| collapse(existing, incoming));
        if merged.is_none() {
            self.positions.remove(&key);
        }
        self.tracked[pos] = merged;
    }

    fn take(&mut self) -> Vec<Tracked> {
        self.positions.clear();
        std::mem::take(&mut self.tracked).into_iter().flatten().collect()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Flush entry points
    // ═══════════════════════════════════════════════════════════════════════

    /// Apply every tracked mutation. On a SQL failure the statements that
    /// already ran keep their cache updates and events; the rest is dropped
    /// and the error returned.
    #[instrument(skip_all, fields(mutations = self.len()))]
    pub async fn flush(&mut self, ctx: &Context) -> Result<FlushSummary, OrmError> {
        self.run(ctx, Mode::Direct).await
    }

    /// Apply every tracked mutation inside one transaction per SQL pool.
    /// On failure everything is rolled back and no cache or event changes.
    #[instrument(skip_all, fields(mutations = self.len()))]
    pub async fn flush_in_transaction(&mut self, ctx: &Context) -> Result<FlushSummary, OrmError> {
        self.run(ctx, Mode::Transaction).await
    }

    /// Validate and apply to the caches now; queue the SQL for the async
    /// consumer.
    #[instrument(skip_all, fields(mutations = self.len()))]
    pub async fn flush_async(&mut self, ctx: &Context) -> Result<FlushSummary, OrmError> {
        self.run(ctx, Mode::Async).await
    }

    async fn run(&mut self, ctx: &Context, mode: Mode) -> Result<FlushSummary, OrmError> {
        let tracked = self.take();
        if tracked.is_empty() {
            return Ok(FlushSummary::default());
        }
        let _timer = LatencyTimer::new("flush", mode.as_str());
        let result = self.engine.flush_tracked(ctx, tracked, mode).await;
        metrics::record_flush(mode.as_str(), if result.is_ok() { "success" } else { "error" });
        result
    }
}

/// Merge a newly tracked mutation into the one already tracked for the same
/// entity. `None` means the two cancel out.
fn collapse(existing: Tracked, incoming: Tracked) -> Option<Tracked> {
    use ChangeAction::{Delete, Insert, Update};
    let mut meta = existing.meta;
    meta.extend(incoming.meta);
    let (action, before, after, explicit_id, on_duplicate) = match (existing.action, incoming.action) {
        (Insert, Delete) => return None,
        (Insert, Insert | Update) => (
            Insert,
            None,
            incoming.after,
            existing.explicit_id,
            incoming.on_duplicate.or(existing.on_duplicate),
        ),
        (Update | Delete, Update | Insert) => (Update, existing.before.or(incoming.before), incoming.after, true, None),
        (Update | Delete, Delete) => (Delete, existing.before.or(incoming.before), None, true, None),
    };
    Some(Tracked {
        schema: existing.schema,
        action,
        id: existing.id,
        explicit_id,
        before,
        after,
        on_duplicate,
        meta,
    })
}

/// Existing row with `assignments` applied through the column setters.
fn apply_assignments(schema: &EntitySchema, existing: &Row, assignments: &[(String, Value)]) -> Result<Row, OrmError> {
    let mut row = existing.clone();
    for (column, value) in assignments {
        let (pos, def) = schema
            .column(column)
            .ok_or_else(|| OrmError::bind(column, "unknown column"))?;
        row[pos] = def.normalize(value.clone())?;
    }
    Ok(row)
}

fn duplicated(index: &IndexDef, existing_id: u64) -> OrmError {
    OrmError::DuplicatedKey {
        index: index.name.clone(),
        existing_id,
        columns: index.columns.clone(),
    }
}

fn duplicated_primary(id: u64) -> OrmError {
    OrmError::DuplicatedKey {
        index: "PRIMARY".to_string(),
        existing_id: id,
        columns: vec!["ID".to_string()],
    }
}

/// Normalized SQL arguments of an index taken from a full row.
fn index_args(index: &IndexDef, row: &Row) -> Vec<Value> {
    index.positions.iter().map(|&pos| row[pos].clone()).collect()
}

impl Engine {
    async fn flush_tracked(
        &self,
        ctx: &Context,
        tracked: Vec<Tracked>,
        mode: Mode,
    ) -> Result<FlushSummary, OrmError> {
        let mut summary = FlushSummary::default();

        // Phase 1
        let mut bound = Vec::with_capacity(tracked.len());
        for t in tracked {
            ctx.check()?;
            if let Some(b) = self.bind(ctx, t).await? {
                bound.push(b);
            }
        }

        // Phase 2
        ctx.check()?;
        self.precheck_unique(ctx, &mut bound, &mut summary).await?;
        bound.retain(|b| !b.noop);
        if bound.is_empty() {
            return Ok(summary);
        }

        if mode == Mode::Async {
            self.publish_async(ctx, &bound).await?;
            let all: Vec<&Bound> = bound.iter().collect();
            let cached = self.apply_caches(&all).await;
            self.emit_events(&all).await?;
            cached?;
            record_applied(&all, &mut summary);
            return Ok(summary);
        }

        // Phases 3 and 4
        ctx.check()?;
        let statements = plan_statements(&bound, true);
        let mut applied = vec![false; bound.len()];
        let mut txs: Vec<(String, Box<dyn Transaction>)> = Vec::new();
        let mut failure = None;
        for statement in &statements {
            if let Err(e) = ctx.check() {
                failure = Some(e);
                break;
            }
            let result = self.exec_statement(statement, mode, &mut txs).await;
            match result {
                // MySQL reports matched-but-unchanged rows as 0 affected.
                Ok(0) if bound[statement.members[0]].action == ChangeAction::Update => {
                    let b = &bound[statement.members[0]];
                    match self.row_exists(&b.schema, b.id, mode, &txs).await {
                        Ok(true) => applied[statement.members[0]] = true,
                        Ok(false) => {
                            self.forget_row(&b.schema, b.id).await;
                            failure = Some(OrmError::Missing {
                                table: b.schema.table_name.clone(),
                                id: b.id,
                            });
                            break;
                        }
                        Err(err) => {
                            failure = Some(err.into());
                            break;
                        }
                    }
                }
                Ok(_) => statement.members.iter().for_each(|&i| applied[i] = true),
                Err(err) => {
                    let members: Vec<&Bound> = statement.members.iter().map(|&i| &bound[i]).collect();
                    failure = Some(self.map_sql_error(ctx, err, &members).await);
                    break;
                }
            }
        }

        if mode == Mode::Transaction {
            if let Some(err) = failure {
                for (pool, tx) in txs {
                    if let Err(e) = tx.rollback().await {
                        error!(pool = %pool, error = %e, "Rollback failed");
                    }
                }
                warn!(error = %err, "Transactional flush rolled back");
                return Err(err);
            }
            let mut txs = txs.into_iter();
            while let Some((pool, tx)) = txs.next() {
                if let Err(e) = tx.commit().await {
                    error!(pool = %pool, error = %e, "Commit failed");
                    for (pool, tx) in txs {
                        if let Err(e) = tx.rollback().await {
                            error!(pool = %pool, error = %e, "Rollback failed");
                        }
                    }
                    return Err(e.into());
                }
            }
        }

        // Phases 5 and 6 for whatever reached the database
        let done: Vec<&Bound> = bound
            .iter()
            .zip(&applied)
            .filter_map(|(b, &ok)| ok.then_some(b))
            .collect();
        if !done.is_empty() {
            // SQL already changed: events go out even when the caches could not follow.
            let cached = self.apply_caches(&done).await;
            self.emit_events(&done).await?;
            cached?;
        }
        record_applied(&done, &mut summary);

        match failure {
            Some(err) => {
                warn!(applied = done.len(), total = bound.len(), error = %err, "Flush halted");
                Err(err)
            }
            None => {
                debug!(mutations = done.len(), mode = mode.as_str(), "Flush complete");
                Ok(summary)
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Phase 1: bind
    // ═══════════════════════════════════════════════════════════════════════

    async fn bind(&self, ctx: &Context, t: Tracked) -> Result<Option<Bound>, OrmError> {
        let schema = t.schema;
        let mut bound = Bound {
            schema: schema.clone(),
            action: t.action,
            id: t.id,
            before: None,
            after: None,
            meta: t.meta,
            on_duplicate: t.on_duplicate,
            hash_set: Vec::new(),
            hash_del: Vec::new(),
            noop: false,
        };

        match t.action {
            ChangeAction::Insert => {
                let mut after = schema.normalize_row(t.after.unwrap_or_default())?;
                after[0] = Value::Uint(t.id);
                if t.explicit_id {
                    if let Some(existing) = self.current_row(ctx, &schema, t.id).await? {
                        let Some(assignments) = bound.on_duplicate.take() else {
                            return Err(duplicated_primary(t.id));
                        };
                        let after = apply_assignments(&schema, &existing, &assignments)?;
                        if after == existing {
                            return Ok(None);
                        }
                        bound.action = ChangeAction::Update;
                        bound.before = Some(existing);
                        bound.after = Some(after);
                        return Ok(Some(bound));
                    }
                }
                bound.after = Some(after);
            }
            ChangeAction::Update => {
                let mut after = schema.normalize_row(t.after.unwrap_or_default())?;
                after[0] = Value::Uint(t.id);
                let before = match t.before {
                    Some(raw) => Some(schema.normalize_row(raw)?),
                    None => self.current_row(ctx, &schema, t.id).await?,
                };
                let Some(before) = before else {
                    return Err(OrmError::Missing {
                        table: schema.table_name.clone(),
                        id: t.id,
                    });
                };
                if before == after {
                    debug!(table = %schema.table_name, id = t.id, "Update without changes skipped");
                    return Ok(None);
                }
                bound.before = Some(before);
                bound.after = Some(after);
            }
            ChangeAction::Delete => {
                let before = match t.before {
                    Some(raw) => Some(schema.normalize_row(raw)?),
                    None => self.current_row(ctx, &schema, t.id).await?,
                };
                let Some(before) = before else {
                    debug!(table = %schema.table_name, id = t.id, "Delete of a missing row skipped");
                    return Ok(None);
                };
                bound.before = Some(before);
            }
        }
        Ok(Some(bound))
    }

    async fn current_row(&self, ctx: &Context, schema: &EntitySchema, id: u64) -> Result<Option<Row>, OrmError> {
        Ok(self
            .rows_by_ids(ctx, schema, &[id])
            .await?
            .pop()
            .flatten()
            .map(|row| row.to_vec()))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Phase 2: unique precheck
    // ═══════════════════════════════════════════════════════════════════════

    async fn precheck_unique(
        &self,
        ctx: &Context,
        bound: &mut [Bound],
        summary: &mut FlushSummary,
    ) -> Result<(), OrmError> {
        // Fingerprints given up by updates and deletes of this flush.
        let mut released: HashSet<(String, String, String)> = HashSet::new();
        for b in bound.iter() {
            let Some(before) = &b.before else { continue };
            for index in b.schema.unique_indices.values() {
                let old = b.schema.index_fingerprint(index, before);
                let new = b.after.as_ref().and_then(|a| b.schema.index_fingerprint(index, a));
                let changed = old != new;
                if let (Some(old), true) = (old, changed) {
                    released.insert((b.schema.table_name.clone(), index.name.clone(), old));
                }
            }
        }

        let mut claims: HashMap<(String, String, String), u64> = HashMap::new();
        for b in bound.iter_mut() {
            let schema = b.schema.clone();
            'retry: loop {
                ctx.check()?;
                b.hash_set.clear();
                b.hash_del.clear();
                let mut staged = Vec::new();
                for index in schema.unique_indices.values() {
                    let old = b.before.as_ref().and_then(|r| schema.index_fingerprint(index, r));
                    let new = b.after.as_ref().and_then(|r| schema.index_fingerprint(index, r));
                    if old == new {
                        continue;
                    }
                    if let Some(old) = old {
                        b.hash_del.push((index.name.clone(), old));
                    }
                    let (Some(new), Some(after)) = (new, b.after.as_ref()) else {
                        continue;
                    };
                    let key = (schema.table_name.clone(), index.name.clone(), new.clone());
                    let owner = match claims.get(&key) {
                        Some(&owner) => Some(owner),
                        None if released.contains(&key) => None,
                        None => {
                            let args = index_args(index, after);
                            match self.unique_owner(ctx, &schema, index, &new, &args).await? {
                                Some(owner) if owner != b.id => {
                                    self.confirm_unique_owner(ctx, &schema, index, &new, &args, owner)
                                        .await?
                                }
                                owner => owner,
                            }
                        }
                    };
                    if let Some(owner) = owner.filter(|&owner| owner != b.id) {
                        let claimed_here = claims.contains_key(&key);
                        match b.on_duplicate.take() {
                            Some(assignments) if b.action == ChangeAction::Insert && !claimed_here => {
                                let existing = self
                                    .current_row(ctx, &schema, owner)
                                    .await?
                                    .ok_or_else(|| duplicated(index, owner))?;
                                let after = apply_assignments(&schema, &existing, &assignments)?;
                                info!(table = %schema.table_name, index = %index.name, tracked = b.id, existing = owner, "Insert redirected to existing row");
                                summary.redirected.push((schema.table_name.clone(), b.id, owner));
                                b.noop = after == existing;
                                b.action = ChangeAction::Update;
                                b.id = owner;
                                b.before = Some(existing);
                                b.after = Some(after);
                                if b.noop {
                                    break 'retry;
                                }
                                continue 'retry;
                            }
                            _ => return Err(duplicated(index, owner)),
                        }
                    }
                    staged.push((key, b.id));
                    b.hash_set.push((index.name.clone(), new));
                }
                claims.extend(staged);
                break;
            }
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Phases 3 and 4: SQL
    // ═══════════════════════════════════════════════════════════════════════

    async fn exec_statement(
        &self,
        statement: &Statement,
        mode: Mode,
        txs: &mut Vec<(String, Box<dyn Transaction>)>,
    ) -> Result<u64, StorageError> {
        let db = self
            .databases
            .get(&statement.pool)
            .ok_or_else(|| StorageError::Backend(format!("unknown mysql pool '{}'", statement.pool)))?;
        if mode != Mode::Transaction {
            return Ok(db.exec(&statement.sql, &statement.args).await?.rows_affected);
        }
        let pos = match txs.iter().position(|(pool, _)| *pool == statement.pool) {
            Some(pos) => pos,
            None => {
                txs.push((statement.pool.clone(), db.begin().await?));
                txs.len() - 1
            }
        };
        Ok(txs[pos].1.exec(&statement.sql, &statement.args).await?.rows_affected)
    }

    /// Whether the row is still in SQL, seen through the flush transaction
    /// when there is one.
    async fn row_exists(
        &self,
        schema: &EntitySchema,
        id: u64,
        mode: Mode,
        txs: &[(String, Box<dyn Transaction>)],
    ) -> Result<bool, StorageError> {
        let sql = format!("SELECT 1 FROM `{}` WHERE `ID`=?", schema.table_name);
        let args = [schema.sql_arg(0, &Value::Uint(id))];
        if mode == Mode::Transaction {
            if let Some((_, tx)) = txs.iter().find(|(pool, _)| *pool == schema.db_pool) {
                return Ok(!tx.query(&sql, &args).await?.is_empty());
            }
        }
        let db = self
            .databases
            .get(&schema.db_pool)
            .ok_or_else(|| StorageError::Backend(format!("unknown mysql pool '{}'", schema.db_pool)))?;
        Ok(db.query_row(&sql, &args).await?.is_some())
    }

    /// Drop a row the caches still hold but SQL no longer has.
    async fn forget_row(&self, schema: &EntitySchema, id: u64) {
        if let Some(local) = self.local_of(schema) {
            local.remove(id);
        }
        if let Some(remote) = self.remote_of(schema) {
            if let Err(e) = remote.hdel(schema.rows_key(), &[id.to_string()]).await {
                warn!(table = %schema.table_name, id, error = %e, "Vanished row left in remote cache");
            }
        }
    }

    /// Turn a constraint failure back into the index or column it names.
    async fn map_sql_error(&self, ctx: &Context, err: StorageError, members: &[&Bound]) -> OrmError {
        match err {
            StorageError::Duplicate { key, .. } => {
                for b in members {
                    let schema = &b.schema;
                    if key == "PRIMARY" || key == "ID" {
                        return duplicated_primary(b.id);
                    }
                    let index = schema.unique_indices.values().find(|index| {
                        index.name == key
                            || index.columns.join(",") == key
                            || format!("{}_{}", schema.table_name, index.name) == key
                    });
                    let (Some(index), Some(after)) = (index, b.after.as_ref()) else {
                        continue;
                    };
                    let Some(fp) = schema.index_fingerprint(index, after) else {
                        continue;
                    };
                    let args = index_args(index, after);
                    let owner = self
                        .unique_owner_from_db(ctx, schema, index, &fp, &args)
                        .await
                        .ok()
                        .flatten();
                    match owner {
                        Some(owner) if owner != b.id => return duplicated(index, owner),
                        None if members.len() == 1 => return duplicated(index, 0),
                        _ => {}
                    }
                }
                OrmError::DuplicatedKey {
                    index: key,
                    existing_id: 0,
                    columns: Vec::new(),
                }
            }
            StorageError::ForeignKey { detail } => {
                let column = members
                    .iter()
                    .flat_map(|b| b.schema.references.keys())
                    .find(|column| detail.contains(column.as_str()))
                    .cloned()
                    .unwrap_or_default();
                OrmError::ForeignKey { column }
            }
            other => OrmError::Io(other),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Phase 5: cache coherence
    // ═══════════════════════════════════════════════════════════════════════

    async fn apply_caches(&self, applied: &[&Bound]) -> Result<(), OrmError> {
        // Per remote pool: removals first so a fingerprint moving between
        // two rows of the same flush ends up pointing at its new owner.
        let mut removals: HashMap<&str, Vec<RemoteCommand>> = HashMap::new();
        let mut writes: HashMap<&str, Vec<RemoteCommand>> = HashMap::new();
        // Local changes wait for the remote tier so both never disagree.
        let mut local_writes: Vec<(&Arc<LocalCache>, LocalWrite)> = Vec::new();

        for b in applied {
            let schema = &b.schema;
            let pool = schema.remote_pool.as_deref();
            let remote = self.remote_of(schema);
            let local = self.local_of(schema);
            let id = b.id.to_string();
            let mut touch = |write: LocalWrite| {
                if let Some(local) = local {
                    local_writes.push((local, write));
                }
            };

            touch(LocalWrite::Row(b.id, b.after.clone()));
            let row_value = match (&b.after, remote) {
                (Some(after), Some(_)) => encode_row(schema, after)?,
                _ => Vec::new(),
            };

            let mut dels = Vec::new();
            let mut sets = vec![RemoteCommand::HSet {
                key: schema.rows_key().to_string(),
                field: id.clone(),
                value: row_value,
            }];

            for (index, fp) in &b.hash_del {
                dels.push(RemoteCommand::HDel {
                    key: schema.unique_hash_key(index),
                    fields: vec![fp.clone()],
                });
                touch(LocalWrite::DropQuery(schema.unique_local_key(index, fp)));
            }
            for (index, fp) in &b.hash_set {
                sets.push(RemoteCommand::HSet {
                    key: schema.unique_hash_key(index),
                    field: fp.clone(),
                    value: id.clone().into_bytes(),
                });
                touch(LocalWrite::SetQuery(schema.unique_local_key(index, fp), b.id));
            }

            for reference in schema.references.values().filter(|r| r.cached) {
                let read = |row: &Option<Row>| {
                    row.as_ref()
                        .and_then(|r| r[reference.position].as_u64())
                        .filter(|&v| v != 0)
                };
                let (old, new) = (read(&b.before), read(&b.after));
                if old == new {
                    continue;
                }
                if let Some(old) = old {
                    let key = schema.reference_key(&reference.column, old);
                    touch(LocalWrite::DropQuery(key.clone()));
                    dels.push(RemoteCommand::SRem {
                        key,
                        members: vec![id.clone()],
                    });
                }
                if let Some(new) = new {
                    let key = schema.reference_key(&reference.column, new);
                    touch(LocalWrite::DropQuery(key.clone()));
                    // An absent set means "unknown"; adding to it would make it partial.
                    if let Some(remote) = remote {
                        if remote.exists(&key).await? {
                            sets.push(RemoteCommand::SAdd {
                                key,
                                members: vec![id.clone()],
                            });
                        }
                    }
                }
            }

            let mut stale = HashSet::new();
            for index in schema.indices.values().filter(|i| i.cached) {
                for row in [&b.before, &b.after].into_iter().flatten() {
                    stale.insert(schema.index_query_key(&index.name, &fingerprint(&schema.query_parts(index, row))));
                }
            }
            if schema.cache_all {
                stale.insert(schema.all_key());
            }
            if !stale.is_empty() {
                stale.iter().for_each(|key| touch(LocalWrite::DropQuery(key.clone())));
                dels.push(RemoteCommand::Del {
                    keys: stale.into_iter().collect(),
                });
            }

            if let (Some(pool), true) = (pool, remote.is_some()) {
                removals.entry(pool).or_default().extend(dels);
                writes.entry(pool).or_default().extend(sets);
            }
        }

        for (pool, mut commands) in removals {
            commands.extend(writes.remove(pool).unwrap_or_default());
            if let Err(err) = self.remote_pool(pool)?.pipeline(commands).await {
                error!(pool, error = %err, "Remote cache update failed, evicting local entries");
                self.evict_remote_rows(pool, applied).await;
                for (local, write) in local_writes {
                    write.evict(local);
                }
                return Err(err.into());
            }
        }

        // Drops before sets, for the same reason as the remote removals.
        let (drops, rest): (Vec<_>, Vec<_>) = local_writes
            .into_iter()
            .partition(|(_, write)| matches!(write, LocalWrite::DropQuery(_)));
        for (local, write) in drops.into_iter().chain(rest) {
            write.apply(local);
        }
        Ok(())
    }

    /// Best effort after a failed pipeline: the remote rows of `pool` may
    /// predate the SQL change, so drop them and let the next read reload.
    async fn evict_remote_rows(&self, pool: &str, applied: &[&Bound]) {
        let Ok(remote) = self.remote_pool(pool) else { return };
        let mut fields: HashMap<&str, Vec<String>> = HashMap::new();
        for b in applied.iter().filter(|b| b.schema.remote_pool.as_deref() == Some(pool)) {
            fields.entry(b.schema.rows_key()).or_default().push(b.id.to_string());
        }
        for (key, ids) in fields {
            if let Err(e) = remote.hdel(key, &ids).await {
                warn!(pool, key, error = %e, "Stale remote rows left in place");
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Async
    // ═══════════════════════════════════════════════════════════════════════

    async fn publish_async(&self, ctx: &Context, bound: &[Bound]) -> Result<(), OrmError> {
        for (i, statement) in plan_statements(bound, false).into_iter().enumerate() {
            if i % 64 == 0 {
                ctx.check()?;
            }
            let Some(&member) = statement.members.first() else { continue };
            let b = &bound[member];
            let (pool, cache) = self.queue_pool_of(&b.schema)?;
            let operation = AsyncOperation {
                table: b.schema.table_name.clone(),
                pool: statement.pool,
                kind: b.action,
                id: b.id,
                sql: statement.sql,
                args: statement.args,
            };
            self.publisher
                .publish(pool, cache.clone(), &b.schema.async_cache_key, operation)
                .await?;
        }
        Ok(())
    }
}

/// One local-tier change produced by a flush.
enum LocalWrite {
    /// Row image, or a tombstone for `None`.
    Row(u64, Option<Row>),
    SetQuery(String, u64),
    DropQuery(String),
}

impl LocalWrite {
    fn apply(self, local: &LocalCache) {
        match self {
            LocalWrite::Row(id, Some(row)) => local.set_row(id, row),
            LocalWrite::Row(id, None) => local.set_tombstone(id),
            LocalWrite::SetQuery(key, id) => local.set_query(&key, vec![id]),
            LocalWrite::DropQuery(key) => local.remove_query(&key),
        }
    }

    /// Forget whatever this write would have touched.
    fn evict(self, local: &LocalCache) {
        match self {
            LocalWrite::Row(id, _) => local.remove(id),
            LocalWrite::SetQuery(key, _) | LocalWrite::DropQuery(key) => local.remove_query(&key),
        }
    }
}

fn record_applied(applied: &[&Bound], summary: &mut FlushSummary) {
    let mut counts: HashMap<(&str, ChangeAction), usize> = HashMap::new();
    for b in applied {
        let entry = (b.schema.table_name.clone(), b.id);
        match b.action {
            ChangeAction::Insert => summary.inserted.push(entry),
            ChangeAction::Update => summary.updated.push(entry),
            ChangeAction::Delete => summary.deleted.push(entry),
        }
        *counts.entry((b.schema.table_name.as_str(), b.action)).or_default() += 1;
    }
    for ((table, action), count) in counts {
        metrics::record_mutations(table, action.as_str(), count);
    }
}

/// SQL for the bound mutations. Per pool (first-seen order) deletes run
/// first, then inserts, then updates. `batched` folds deletes and inserts
/// of one table into multi-row statements.
fn plan_statements(bound: &[Bound], batched: bool) -> Vec<Statement> {
    let mut pools: Vec<&str> = Vec::new();
    for b in bound {
        if !pools.contains(&b.schema.db_pool.as_str()) {
            pools.push(b.schema.db_pool.as_str());
        }
    }

    let mut statements = Vec::new();
    for pool in pools {
        for action in [ChangeAction::Delete, ChangeAction::Insert, ChangeAction::Update] {
            // Group by table, keeping first-seen order.
            let mut groups: Vec<(&str, Vec<usize>)> = Vec::new();
            for (i, b) in bound.iter().enumerate() {
                if b.schema.db_pool != pool || b.action != action {
                    continue;
                }
                match groups.iter_mut().find(|(table, _)| *table == b.schema.table_name) {
                    Some((_, members)) => members.push(i),
                    None => groups.push((b.schema.table_name.as_str(), vec![i])),
                }
            }
            for (_, members) in groups {
                match action {
                    ChangeAction::Delete => {
                        let chunk = if batched { DELETE_CHUNK } else { 1 };
                        for part in members.chunks(chunk) {
                            statements.push(delete_statement(bound, part));
                        }
                    }
                    ChangeAction::Insert => {
                        let chunk = if batched { INSERT_CHUNK } else { 1 };
                        for part in members.chunks(chunk) {
                            statements.push(insert_statement(bound, part));
                        }
                    }
                    ChangeAction::Update => {
                        for &i in &members {
                            statements.push(update_statement(bound, i));
                        }
                    }
                }
            }
        }
    }
    statements
}

fn insert_statement(bound: &[Bound], members: &[usize]) -> Statement {
    let schema = &bound[members[0]].schema;
    let row_placeholders = format!("({})", placeholders(schema.columns.len()));
    let mut args = Vec::with_capacity(members.len() * schema.columns.len());
    for &i in members {
        if let Some(after) = &bound[i].after {
            args.extend(after.iter().enumerate().map(|(pos, v)| schema.sql_arg(pos, v)));
        }
    }
    Statement {
        pool: schema.db_pool.clone(),
        sql: format!(
            "INSERT INTO `{}` ({}) VALUES {}",
            schema.table_name,
            schema.sql_columns(),
            vec![row_placeholders; members.len()].join(",")
        ),
        args,
        members: members.to_vec(),
    }
}

fn update_statement(bound: &[Bound], member: usize) -> Statement {
    let b = &bound[member];
    let schema = &b.schema;
    let changed = b.changed_positions();
    let mut args = Vec::with_capacity(changed.len() + 1);
    let mut assignments = Vec::with_capacity(changed.len());
    if let Some(after) = &b.after {
        for &pos in &changed {
            assignments.push(format!("`{}`=?", schema.columns[pos].name));
            args.push(schema.sql_arg(pos, &after[pos]));
        }
    }
    args.push(Value::Uint(b.id));
    Statement {
        pool: schema.db_pool.clone(),
        sql: format!(
            "UPDATE `{}` SET {} WHERE `ID`=?",
            schema.table_name,
            assignments.join(",")
        ),
        args,
        members: vec![member],
    }
}

fn delete_statement(bound: &[Bound], members: &[usize]) -> Statement {
    let schema = &bound[members[0]].schema;
    Statement {
        pool: schema.db_pool.clone(),
        sql: format!(
            "DELETE FROM `{}` WHERE `ID` IN ({})",
            schema.table_name,
            placeholders(members.len())
        ),
        args: members.iter().map(|&i| Value::Uint(bound[i].id)).collect(),
        members: members.to_vec(),
    }
}
